use std::{
    collections::HashSet,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use error_stack::{Report, Result, ResultExt};

use crate::model::{
    Cursor, CursorId, DeadLetterRecord, EventLogRecord, OrderRecord, TransactionRecord,
};

use super::{DocumentStore, StoreError, StoreTransaction};

const CURSOR_ID: &str = "status";

/// A [DocumentStore] that keeps everything in memory.
///
/// Enforces the same unique keys as the MongoDB indexes. Writes made through a transaction
/// are staged on a private copy and published on commit.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    state: Arc<Mutex<StoreSnapshot>>,
}

/// Content of an [InMemoryStore] at a point in time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    pub cursor: Option<Cursor>,
    pub transactions: Vec<TransactionRecord>,
    pub event_logs: Vec<EventLogRecord>,
    pub orders: Vec<OrderRecord>,
    pub dead_letters: Vec<DeadLetterRecord>,
}

pub struct InMemoryTransaction {
    store: InMemoryStore,
    staged: StoreSnapshot,
}

impl InMemoryStore {
    /// Returns a copy of the committed state.
    pub fn snapshot(&self) -> StoreSnapshot {
        self.lock().clone()
    }

    /// Replaces the committed state.
    pub fn restore(&self, snapshot: StoreSnapshot) {
        *self.lock() = snapshot;
    }

    fn lock(&self) -> MutexGuard<'_, StoreSnapshot> {
        // The state is replaced wholesale, so a poisoned lock still holds a consistent value.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    type Transaction = InMemoryTransaction;

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn find_cursor(&self) -> Result<Option<Cursor>, StoreError> {
        Ok(self.lock().cursor.clone())
    }

    async fn create_cursor(&self, block_number: u64) -> Result<Cursor, StoreError> {
        let mut state = self.lock();
        if state.cursor.is_some() {
            return Err(Report::new(StoreError::DuplicateKey))
                .attach_printable("cursor already exists");
        }

        let cursor = Cursor {
            id: CursorId(CURSOR_ID.to_string()),
            last_ingested_block: block_number,
        };
        state.cursor = Some(cursor.clone());
        Ok(cursor)
    }

    async fn max_ingested_block(&self) -> Result<Option<u64>, StoreError> {
        let state = self.lock();
        let transactions = state.transactions.iter().map(|tx| tx.block_number);
        let logs = state.event_logs.iter().map(|log| log.block_number);
        Ok(transactions.chain(logs).max())
    }

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        Ok(InMemoryTransaction {
            store: self.clone(),
            staged: self.snapshot(),
        })
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn insert_transactions(
        &mut self,
        records: &[TransactionRecord],
    ) -> Result<(), StoreError> {
        let mut ids: HashSet<&str> = self
            .staged
            .transactions
            .iter()
            .map(|tx| tx.id.as_str())
            .collect();
        for record in records {
            if !ids.insert(record.id.as_str()) {
                return Err(duplicate_key("transactions", &record.id));
            }
        }

        self.staged.transactions.extend_from_slice(records);
        Ok(())
    }

    async fn insert_orders(&mut self, records: &[OrderRecord]) -> Result<(), StoreError> {
        let mut ids: HashSet<&str> = self
            .staged
            .orders
            .iter()
            .map(|order| order.list_id.as_str())
            .collect();
        for record in records {
            if !ids.insert(record.list_id.as_str()) {
                return Err(duplicate_key("orders", &record.list_id));
            }
        }

        self.staged.orders.extend_from_slice(records);
        Ok(())
    }

    async fn insert_event_logs(&mut self, records: &[EventLogRecord]) -> Result<(), StoreError> {
        let mut keys: HashSet<(&str, u64)> = self
            .staged
            .event_logs
            .iter()
            .map(|log| (log.tx_hash.as_str(), log.log_index))
            .collect();
        for record in records {
            if !keys.insert((record.tx_hash.as_str(), record.log_index)) {
                return Err(duplicate_key(
                    "evmlogs",
                    &format!("{}#{}", record.tx_hash, record.log_index),
                ));
            }
        }

        self.staged.event_logs.extend_from_slice(records);
        Ok(())
    }

    async fn insert_dead_letter(&mut self, record: &DeadLetterRecord) -> Result<(), StoreError> {
        self.staged.dead_letters.push(record.clone());
        Ok(())
    }

    async fn update_cursor(
        &mut self,
        id: &CursorId,
        block_number: u64,
    ) -> Result<(), StoreError> {
        match self.staged.cursor.as_mut() {
            Some(cursor) if &cursor.id == id => {
                cursor.last_ingested_block = block_number;
                Ok(())
            }
            _ => Err(Report::new(StoreError::Write))
                .attach_printable_lazy(|| format!("cursor {id} not found")),
        }
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.store.restore(self.staged);
        Ok(())
    }

    async fn abort(self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn duplicate_key(collection: &str, key: &str) -> Report<StoreError> {
    Report::new(StoreError::DuplicateKey)
        .attach_printable(format!("collection: {collection}"))
        .attach_printable(format!("key: {key}"))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{
        model::{CursorId, TransactionRecord},
        store::{DocumentStore, StoreError, StoreTransaction},
    };

    use super::InMemoryStore;

    fn transaction(id: &str, block_number: u64) -> TransactionRecord {
        TransactionRecord {
            id: id.to_string(),
            from: "0xfrom".to_string(),
            to: None,
            block_number,
            index_in_block: 0,
            timestamp: 0,
            raw_input: "0x646174613a".to_string(),
        }
    }

    #[tokio::test]
    async fn test_writes_are_visible_after_commit() {
        let store = InMemoryStore::default();
        let cursor = store.create_cursor(10).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_transactions(&[transaction("0x01", 11)])
            .await
            .unwrap();
        tx.update_cursor(&cursor.id, 11).await.unwrap();

        assert!(store.snapshot().transactions.is_empty());
        assert_eq!(store.max_ingested_block().await.unwrap(), None);

        tx.commit().await.unwrap();

        let snapshot = store.snapshot();
        assert_eq!(snapshot.transactions.len(), 1);
        assert_eq!(snapshot.cursor.unwrap().last_ingested_block, 11);
        assert_eq!(store.max_ingested_block().await.unwrap(), Some(11));
    }

    #[tokio::test]
    async fn test_abort_discards_writes() {
        let store = InMemoryStore::default();
        let cursor = store.create_cursor(10).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        tx.insert_transactions(&[transaction("0x01", 11)])
            .await
            .unwrap();
        tx.update_cursor(&cursor.id, 11).await.unwrap();
        tx.abort().await.unwrap();

        let snapshot = store.snapshot();
        assert!(snapshot.transactions.is_empty());
        assert_eq!(snapshot.cursor.unwrap().last_ingested_block, 10);
    }

    #[tokio::test]
    async fn test_duplicate_transaction_is_rejected() {
        let store = InMemoryStore::default();

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .insert_transactions(&[transaction("0x01", 11), transaction("0x01", 11)])
            .await
            .unwrap_err();
        assert_matches!(err.current_context(), StoreError::DuplicateKey);
    }

    #[tokio::test]
    async fn test_cursor_is_singleton() {
        let store = InMemoryStore::default();
        assert!(store.find_cursor().await.unwrap().is_none());

        store.create_cursor(0).await.unwrap();
        let err = store.create_cursor(0).await.unwrap_err();
        assert_matches!(err.current_context(), StoreError::DuplicateKey);
    }

    #[tokio::test]
    async fn test_update_unknown_cursor_fails() {
        let store = InMemoryStore::default();
        store.create_cursor(10).await.unwrap();

        let mut tx = store.begin().await.unwrap();
        let err = tx
            .update_cursor(&CursorId("unknown".to_string()), 11)
            .await
            .unwrap_err();
        assert_matches!(err.current_context(), StoreError::Write);
        tx.abort().await.unwrap();

        assert_eq!(store.snapshot().cursor.unwrap().last_ingested_block, 10);
    }
}
