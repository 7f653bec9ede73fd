use async_trait::async_trait;
use error_stack::{Report, Result, ResultExt};
use mongodb::{
    bson::{doc, oid::ObjectId, Bson, Document},
    error::{ErrorKind, WriteFailure},
    options::{ClientOptions, FindOneOptions, IndexOptions},
    Client, ClientSession, Collection, Database, IndexModel,
};
use tracing::{debug, info};

use crate::model::{
    Cursor, CursorId, DeadLetterRecord, EventLogRecord, OrderRecord, TransactionRecord,
};

use super::{
    DocumentStore, StoreError, StoreTransaction, DEAD_LETTERS_COLLECTION, EVENT_LOGS_COLLECTION,
    ORDERS_COLLECTION, STATUS_COLLECTION, TRANSACTIONS_COLLECTION,
};

const DUPLICATE_KEY_CODE: i32 = 11000;

#[derive(Debug, Clone)]
pub struct MongoStoreOptions {
    /// Connection string.
    pub connection_string: String,
    /// Database name. Defaults to the connection string's database.
    pub database: Option<String>,
}

/// A [DocumentStore] backed by MongoDB.
///
/// Transactions need a replica set or a sharded cluster.
#[derive(Clone)]
pub struct MongoStore {
    client: Client,
    db: Database,
}

pub struct MongoTransaction {
    session: ClientSession,
    db: Database,
}

impl MongoStore {
    pub async fn connect(options: MongoStoreOptions) -> Result<Self, StoreError> {
        let client_options = ClientOptions::parse(&options.connection_string)
            .await
            .change_context(StoreError::Configuration)
            .attach_printable("failed to parse mongo connection string")?;

        let db_name = options
            .database
            .or_else(|| client_options.default_database.clone())
            .ok_or(StoreError::Configuration)
            .attach_printable("missing database name")?;

        let client = Client::with_options(client_options)
            .change_context(StoreError::Connection)
            .attach_printable("failed to create mongo client")?;
        let db = client.database(&db_name);

        info!(database = %db_name, "connected to mongo");

        Ok(Self { client, db })
    }

    async fn max_block_in(&self, collection_name: &str) -> Result<Option<u64>, StoreError> {
        let options = FindOneOptions::builder()
            .sort(doc! { "block": -1 })
            .projection(doc! { "block": 1 })
            .build();

        let document = self
            .db
            .collection::<Document>(collection_name)
            .find_one(None, options)
            .await
            .change_context(StoreError::Query)
            .attach_printable_lazy(|| format!("failed to read max block of {collection_name}"))?;

        Ok(document
            .as_ref()
            .and_then(|document| document.get("block"))
            .and_then(bson_as_u64))
    }
}

#[async_trait]
impl DocumentStore for MongoStore {
    type Transaction = MongoTransaction;

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        let unique = || IndexOptions::builder().unique(true).build();

        let indexes: [(&str, Document, Option<IndexOptions>); 5] = [
            (TRANSACTIONS_COLLECTION, doc! { "id": 1 }, Some(unique())),
            (TRANSACTIONS_COLLECTION, doc! { "block": 1 }, None),
            (EVENT_LOGS_COLLECTION, doc! { "block": 1 }, None),
            (
                EVENT_LOGS_COLLECTION,
                doc! { "hash": 1, "logIndex": 1 },
                Some(unique()),
            ),
            (ORDERS_COLLECTION, doc! { "listId": 1 }, Some(unique())),
        ];

        for (collection_name, keys, options) in indexes {
            debug!(collection = collection_name, keys = %keys, "creating index");
            let model = IndexModel::builder().keys(keys).options(options).build();
            self.db
                .collection::<Document>(collection_name)
                .create_index(model, None)
                .await
                .change_context(StoreError::Write)
                .attach_printable_lazy(|| format!("failed to create index on {collection_name}"))?;
        }

        Ok(())
    }

    async fn find_cursor(&self) -> Result<Option<Cursor>, StoreError> {
        let Some(document) = self
            .db
            .collection::<Document>(STATUS_COLLECTION)
            .find_one(None, None)
            .await
            .change_context(StoreError::Query)
            .attach_printable("failed to read cursor")?
        else {
            return Ok(None);
        };

        let id = match document.get("_id") {
            Some(Bson::ObjectId(id)) => id.to_hex(),
            Some(Bson::String(id)) => id.clone(),
            Some(other) => other.to_string(),
            None => {
                return Err(Report::new(StoreError::Query))
                    .attach_printable("cursor document has no _id");
            }
        };

        let last_ingested_block = document
            .get("block")
            .and_then(bson_as_u64)
            .ok_or(StoreError::Query)
            .attach_printable("cursor document has no valid block")
            .attach_printable_lazy(|| format!("document: {document}"))?;

        Ok(Some(Cursor {
            id: CursorId(id),
            last_ingested_block,
        }))
    }

    async fn create_cursor(&self, block_number: u64) -> Result<Cursor, StoreError> {
        let result = self
            .db
            .collection::<Document>(STATUS_COLLECTION)
            .insert_one(doc! { "block": block_to_bson(block_number)? }, None)
            .await
            .map_err(map_write_error)
            .attach_printable("failed to create cursor")?;

        let id = match result.inserted_id {
            Bson::ObjectId(id) => id.to_hex(),
            Bson::String(id) => id,
            other => other.to_string(),
        };

        Ok(Cursor {
            id: CursorId(id),
            last_ingested_block: block_number,
        })
    }

    async fn max_ingested_block(&self) -> Result<Option<u64>, StoreError> {
        let transactions = self.max_block_in(TRANSACTIONS_COLLECTION).await?;
        let logs = self.max_block_in(EVENT_LOGS_COLLECTION).await?;
        Ok(transactions.max(logs))
    }

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        let mut session = self
            .client
            .start_session(None)
            .await
            .change_context(StoreError::Connection)
            .attach_printable("failed to create mongo session")?;

        session
            .start_transaction(None)
            .await
            .change_context(StoreError::Transaction)
            .attach_printable("failed to start transaction")?;

        Ok(MongoTransaction {
            session,
            db: self.db.clone(),
        })
    }
}

impl MongoTransaction {
    async fn insert_many<T>(&mut self, collection_name: &str, docs: &[T]) -> Result<(), StoreError>
    where
        T: serde::Serialize + Send + Sync,
    {
        // The driver rejects empty inserts.
        if docs.is_empty() {
            return Ok(());
        }

        let collection: Collection<T> = self.db.collection(collection_name);
        collection
            .insert_many_with_session(docs, None, &mut self.session)
            .await
            .map_err(map_write_error)
            .attach_printable_lazy(|| format!("failed to insert into {collection_name}"))?;

        Ok(())
    }
}

#[async_trait]
impl StoreTransaction for MongoTransaction {
    async fn insert_transactions(
        &mut self,
        records: &[TransactionRecord],
    ) -> Result<(), StoreError> {
        self.insert_many(TRANSACTIONS_COLLECTION, records).await
    }

    async fn insert_orders(&mut self, records: &[OrderRecord]) -> Result<(), StoreError> {
        self.insert_many(ORDERS_COLLECTION, records).await
    }

    async fn insert_event_logs(&mut self, records: &[EventLogRecord]) -> Result<(), StoreError> {
        self.insert_many(EVENT_LOGS_COLLECTION, records).await
    }

    async fn insert_dead_letter(&mut self, record: &DeadLetterRecord) -> Result<(), StoreError> {
        self.insert_many(DEAD_LETTERS_COLLECTION, std::slice::from_ref(record))
            .await
    }

    async fn update_cursor(
        &mut self,
        id: &CursorId,
        block_number: u64,
    ) -> Result<(), StoreError> {
        let filter_id = match ObjectId::parse_str(&id.0) {
            Ok(oid) => Bson::ObjectId(oid),
            Err(_) => Bson::String(id.0.clone()),
        };

        let result = self
            .db
            .collection::<Document>(STATUS_COLLECTION)
            .update_one_with_session(
                doc! { "_id": filter_id },
                doc! { "$set": { "block": block_to_bson(block_number)? } },
                None,
                &mut self.session,
            )
            .await
            .map_err(map_write_error)
            .attach_printable("failed to update cursor")?;

        if result.matched_count == 0 {
            return Err(Report::new(StoreError::Write))
                .attach_printable_lazy(|| format!("cursor {id} not found"));
        }

        Ok(())
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.session
            .commit_transaction()
            .await
            .change_context(StoreError::Transaction)
            .attach_printable("failed to commit transaction")
    }

    async fn abort(mut self) -> Result<(), StoreError> {
        self.session
            .abort_transaction()
            .await
            .change_context(StoreError::Transaction)
            .attach_printable("failed to abort transaction")
    }
}

/// Reads an integer field, whatever numeric type it was stored with.
pub(crate) fn bson_as_u64(value: &Bson) -> Option<u64> {
    match value {
        Bson::Int32(value) => u64::try_from(*value).ok(),
        Bson::Int64(value) => u64::try_from(*value).ok(),
        Bson::Double(value) if value.is_finite() && *value >= 0.0 && value.fract() == 0.0 => {
            Some(*value as u64)
        }
        _ => None,
    }
}

fn block_to_bson(block_number: u64) -> Result<Bson, StoreError> {
    // bson has no unsigned 64 bit type.
    i64::try_from(block_number)
        .map(Bson::Int64)
        .change_context(StoreError::Write)
        .attach_printable_lazy(|| format!("block number {block_number} out of range"))
}

fn map_write_error(err: mongodb::error::Error) -> Report<StoreError> {
    let context = if is_duplicate_key_error(&err) {
        StoreError::DuplicateKey
    } else {
        StoreError::Write
    };
    Report::new(err).change_context(context)
}

fn is_duplicate_key_error(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(write_error)) => {
            write_error.code == DUPLICATE_KEY_CODE
        }
        ErrorKind::BulkWrite(failure) => failure
            .write_errors
            .as_ref()
            .is_some_and(|errors| errors.iter().any(|e| e.code == DUPLICATE_KEY_CODE)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use mongodb::bson::Bson;

    use super::bson_as_u64;

    #[test]
    pub fn test_bson_as_u64() {
        assert_eq!(bson_as_u64(&Bson::Int32(12)), Some(12));
        assert_eq!(bson_as_u64(&Bson::Int64(1_000_000)), Some(1_000_000));
        assert_eq!(bson_as_u64(&Bson::Double(42.0)), Some(42));
        assert_eq!(bson_as_u64(&Bson::Double(42.5)), None);
        assert_eq!(bson_as_u64(&Bson::Int32(-1)), None);
        assert_eq!(bson_as_u64(&Bson::String("42".to_string())), None);
    }
}
