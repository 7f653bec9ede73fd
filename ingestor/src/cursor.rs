//! The persisted ingestion cursor.
use error_stack::{Result, ResultExt};
use tracing::{info, warn};

use crate::{
    model::Cursor,
    store::{DocumentStore, StoreError, StoreTransaction},
};

/// Tracks the last block fully ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorState {
    cursor: Cursor,
}

impl CursorState {
    /// Loads the cursor, creating it if it doesn't exist.
    ///
    /// A new cursor starts from the highest block already stored or from `starting_block`,
    /// whichever is higher. An existing cursor that was never advanced (value `0`) is
    /// replaced by `starting_block`.
    pub async fn load<S: DocumentStore>(
        store: &S,
        starting_block: u64,
    ) -> Result<Self, StoreError> {
        if let Some(mut cursor) = store
            .find_cursor()
            .await
            .attach_printable("failed to load cursor")?
        {
            if cursor.last_ingested_block == 0 {
                cursor.last_ingested_block = starting_block;
            }
            info!(cursor = %cursor, "resuming from stored cursor");
            return Ok(Self { cursor });
        }

        let stored = store
            .max_ingested_block()
            .await
            .attach_printable("failed to scan stored blocks")?;
        let seed = seed_block(stored, starting_block);

        let cursor = store
            .create_cursor(seed)
            .await
            .attach_printable("failed to create cursor")?;

        info!(cursor = %cursor, stored_max = ?stored, "created cursor");

        Ok(Self { cursor })
    }

    pub fn last_ingested_block(&self) -> u64 {
        self.cursor.last_ingested_block
    }

    /// The next block to ingest.
    pub fn target_block(&self) -> u64 {
        self.cursor.last_ingested_block + 1
    }

    /// Catches up with the stored cursor.
    ///
    /// A write reported as failed may still have been applied. The in-memory value only
    /// moves forward.
    pub async fn reload<S: DocumentStore>(&mut self, store: &S) -> Result<(), StoreError> {
        let Some(stored) = store
            .find_cursor()
            .await
            .attach_printable("failed to reload cursor")?
        else {
            return Ok(());
        };

        if stored.id == self.cursor.id
            && stored.last_ingested_block > self.cursor.last_ingested_block
        {
            warn!(
                cursor = self.cursor.last_ingested_block,
                stored = stored.last_ingested_block,
                "stored cursor is ahead, catching up"
            );
            self.cursor.last_ingested_block = stored.last_ingested_block;
        }

        Ok(())
    }

    /// Writes the new cursor value inside `tx`.
    ///
    /// The in-memory value must be updated with [CursorState::commit_advance] once the
    /// transaction commits.
    pub async fn advance<T: StoreTransaction>(
        &self,
        tx: &mut T,
        block_number: u64,
    ) -> Result<(), StoreError> {
        if block_number <= self.cursor.last_ingested_block {
            return Err(StoreError::Write)
                .attach_printable("cursor can only move forward")
                .attach_printable_lazy(|| {
                    format!(
                        "current: {}, new: {block_number}",
                        self.cursor.last_ingested_block
                    )
                });
        }

        tx.update_cursor(&self.cursor.id, block_number).await
    }

    pub fn commit_advance(&mut self, block_number: u64) {
        self.cursor.last_ingested_block = block_number;
    }
}

/// Picks the block a new cursor starts from.
pub fn seed_block(stored_max: Option<u64>, starting_block: u64) -> u64 {
    stored_max.unwrap_or_default().max(starting_block)
}
