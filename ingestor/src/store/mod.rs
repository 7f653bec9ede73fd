//! Document store used to persist ingested records.
mod memory;
mod mongo;

use async_trait::async_trait;
use error_stack::{Report, Result};

use crate::model::{
    Cursor, CursorId, DeadLetterRecord, EventLogRecord, OrderRecord, TransactionRecord,
};

pub use self::memory::{InMemoryStore, InMemoryTransaction, StoreSnapshot};
pub use self::mongo::{MongoStore, MongoStoreOptions, MongoTransaction};

pub const TRANSACTIONS_COLLECTION: &str = "transactions";
pub const EVENT_LOGS_COLLECTION: &str = "evmlogs";
pub const ORDERS_COLLECTION: &str = "orders";
pub const STATUS_COLLECTION: &str = "status";
pub const DEAD_LETTERS_COLLECTION: &str = "deadletters";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    Configuration,
    Connection,
    Query,
    Write,
    /// A unique index rejected the write.
    DuplicateKey,
    /// Starting, committing or aborting a transaction failed.
    Transaction,
}

/// A document store with multi-collection transactions.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    type Transaction: StoreTransaction;

    /// Creates the indexes the ingestor relies on. Idempotent.
    async fn ensure_indexes(&self) -> Result<(), StoreError>;

    /// Returns the cursor document, if any.
    async fn find_cursor(&self) -> Result<Option<Cursor>, StoreError>;

    /// Inserts a new cursor document with the given value.
    async fn create_cursor(&self, block_number: u64) -> Result<Cursor, StoreError>;

    /// Returns the highest block number among stored transactions and event logs.
    async fn max_ingested_block(&self) -> Result<Option<u64>, StoreError>;

    /// Starts a transaction. Nothing written through it is visible before `commit`.
    async fn begin(&self) -> Result<Self::Transaction, StoreError>;
}

/// An open transaction.
///
/// Dropping a transaction without committing discards its writes.
#[async_trait]
pub trait StoreTransaction: Send {
    async fn insert_transactions(
        &mut self,
        records: &[TransactionRecord],
    ) -> Result<(), StoreError>;

    async fn insert_orders(&mut self, records: &[OrderRecord]) -> Result<(), StoreError>;

    async fn insert_event_logs(&mut self, records: &[EventLogRecord]) -> Result<(), StoreError>;

    async fn insert_dead_letter(&mut self, record: &DeadLetterRecord) -> Result<(), StoreError>;

    /// Sets the cursor value. Fails if the cursor doesn't exist.
    async fn update_cursor(&mut self, id: &CursorId, block_number: u64)
        -> Result<(), StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn abort(self) -> Result<(), StoreError>;
}

pub trait StoreErrorExt {
    fn is_duplicate_key(&self) -> bool;
}

impl StoreErrorExt for Report<StoreError> {
    fn is_duplicate_key(&self) -> bool {
        matches!(self.current_context(), StoreError::DuplicateKey)
    }
}

impl error_stack::Context for StoreError {}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Configuration => write!(f, "invalid store configuration"),
            StoreError::Connection => write!(f, "failed to connect to the store"),
            StoreError::Query => write!(f, "store query failed"),
            StoreError::Write => write!(f, "store write failed"),
            StoreError::DuplicateKey => write!(f, "duplicate key"),
            StoreError::Transaction => write!(f, "store transaction failed"),
        }
    }
}
