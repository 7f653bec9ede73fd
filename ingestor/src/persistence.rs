//! Atomic write of a block's records.
use error_stack::{Result, ResultExt};
use tracing::warn;

use crate::{
    cursor::CursorState,
    model::BlockBatch,
    store::{DocumentStore, StoreError, StoreTransaction},
};

/// Writes the batch and advances the cursor to the batch's block, all or nothing.
///
/// Empty record sets are skipped. On any failure the transaction is aborted and the cursor
/// is left untouched.
pub async fn persist_block<S: DocumentStore>(
    store: &S,
    cursor: &mut CursorState,
    batch: &BlockBatch,
) -> Result<(), StoreError> {
    let mut tx = store
        .begin()
        .await
        .attach_printable("failed to begin transaction")?;

    if let Err(err) = write_batch(&mut tx, cursor, batch).await {
        if let Err(abort_err) = tx.abort().await {
            warn!(error = ?abort_err, "failed to abort transaction");
        }
        return Err(err).attach_printable_lazy(|| format!("block number: {}", batch.block_number));
    }

    tx.commit()
        .await
        .attach_printable_lazy(|| format!("block number: {}", batch.block_number))?;

    cursor.commit_advance(batch.block_number);

    Ok(())
}

async fn write_batch<T: StoreTransaction>(
    tx: &mut T,
    cursor: &CursorState,
    batch: &BlockBatch,
) -> Result<(), StoreError> {
    if !batch.transactions.is_empty() {
        tx.insert_transactions(&batch.transactions).await?;
    }

    if !batch.orders.is_empty() {
        tx.insert_orders(&batch.orders).await?;
    }

    if !batch.event_logs.is_empty() {
        tx.insert_event_logs(&batch.event_logs).await?;
    }

    if let Some(dead_letter) = &batch.dead_letter {
        tx.insert_dead_letter(dead_letter).await?;
    }

    cursor.advance(tx, batch.block_number).await
}
