//! The ingestion loop.
use std::time::{Duration, Instant};

use error_stack::{Report, Result, ResultExt};
use inscription_observability::KeyValue;
use mongodb::bson::DateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cursor::CursorState,
    error::IngestionError,
    extract::{
        extract_block, extract_block_without_orders, ExtractOptions, ExtractionError,
        MalformedInscription,
    },
    metrics::{IngestionMetrics, LoopState},
    model::{BlockBatch, DeadLetterRecord},
    persistence::persist_block,
    provider::{
        models::{Block, Log},
        ChainClient,
    },
    store::DocumentStore,
};

#[derive(Debug, Clone)]
pub struct IngestionServiceOptions {
    /// How long to wait between iterations.
    pub poll_interval: Duration,
    /// How many blocks to stay behind the chain's head.
    pub safety_lag: u64,
    /// Cursor value used when nothing was ingested yet.
    pub starting_block: u64,
    /// Address stamped as creator on orders.
    pub creator: String,
    /// Persist a block without its orders after this many consecutive extraction failures.
    /// `None` retries forever.
    pub dead_letter_after: Option<u32>,
}

/// State carried from one iteration to the next.
#[derive(Debug, Clone)]
pub struct IngestionContext {
    pub cursor: CursorState,
    /// Last known head, already adjusted by the safety lag.
    pub head: u64,
}

/// Result of a successful iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The block was persisted and the cursor moved to it.
    Advanced(u64),
    /// The next block is beyond the head. Nothing was fetched.
    CaughtUp { head: u64 },
}

pub struct IngestionService<C, S>
where
    C: ChainClient,
    S: DocumentStore,
{
    client: C,
    store: S,
    options: IngestionServiceOptions,
    extract_options: ExtractOptions,
    metrics: IngestionMetrics,
    extraction_failures: Option<ExtractionFailures>,
}

enum IngestionState {
    Initialize,
    Ingest(IngestionContext),
}

/// Consecutive extraction failures of the same block.
#[derive(Debug, Clone, Copy)]
struct ExtractionFailures {
    block_number: u64,
    attempts: u32,
}

impl<C, S> IngestionService<C, S>
where
    C: ChainClient,
    S: DocumentStore,
{
    pub fn new(client: C, store: S, options: IngestionServiceOptions) -> Self {
        let extract_options = ExtractOptions {
            creator: options.creator.clone(),
        };

        Self {
            client,
            store,
            options,
            extract_options,
            metrics: IngestionMetrics::default(),
            extraction_failures: None,
        }
    }

    /// Runs until `ct` is cancelled.
    ///
    /// Failures never stop the loop. Cancellation is only observed between iterations.
    pub async fn start(mut self, ct: CancellationToken) -> Result<(), IngestionError> {
        self.metrics.up.record(1, &[]);

        let mut state = IngestionState::Initialize;

        loop {
            if ct.is_cancelled() {
                break;
            }

            let (next_state, wait) = match state {
                IngestionState::Initialize => {
                    self.metrics.set_state(LoopState::Initializing);
                    match self.initialize().await {
                        Ok(ctx) => (IngestionState::Ingest(ctx), false),
                        Err(err) => {
                            self.record_failure(&err);
                            warn!(error = ?err, "failed to initialize ingestion");
                            (IngestionState::Initialize, true)
                        }
                    }
                }
                IngestionState::Ingest(mut ctx) => {
                    self.step(&mut ctx).await;
                    (IngestionState::Ingest(ctx), true)
                }
            };

            state = next_state;

            if wait {
                tokio::select! {
                    _ = ct.cancelled() => break,
                    _ = tokio::time::sleep(self.options.poll_interval) => {}
                }
            }
        }

        self.metrics.up.record(0, &[]);
        info!("ingestion stopped");

        Ok(())
    }

    /// Prepares the store, loads the cursor and reads the head.
    pub async fn initialize(&self) -> Result<IngestionContext, IngestionError> {
        self.store
            .ensure_indexes()
            .await
            .change_context(IngestionError::Persistence)
            .attach_printable("failed to create indexes")?;

        let cursor = CursorState::load(&self.store, self.options.starting_block)
            .await
            .change_context(IngestionError::Persistence)?;

        let head = self.refresh_head().await?;

        info!(
            cursor = cursor.last_ingested_block(),
            head,
            "ingestion initialized"
        );

        Ok(IngestionContext { cursor, head })
    }

    /// Ingests the block after the cursor, if it's not beyond the head.
    pub async fn tick(
        &mut self,
        ctx: &mut IngestionContext,
    ) -> Result<TickOutcome, IngestionError> {
        let target = ctx.cursor.target_block();

        if target > ctx.head {
            ctx.head = self.refresh_head().await?;
            if target > ctx.head {
                return Ok(TickOutcome::CaughtUp { head: ctx.head });
            }
        }

        let (block, logs) = self.fetch_block(target).await?;
        let batch = self.extract(&block, &logs)?;

        if let Err(err) = persist_block(&self.store, &mut ctx.cursor, &batch).await {
            if let Err(reload_err) = ctx.cursor.reload(&self.store).await {
                warn!(error = ?reload_err, "failed to reload cursor");
            }

            return Err(err
                .change_context(IngestionError::Persistence)
                .attach_printable("failed to persist block"));
        }

        self.extraction_failures = None;
        self.record_batch(&batch);

        info!(
            block_number = batch.block_number,
            transactions = batch.transactions.len(),
            orders = batch.orders.len(),
            logs = batch.event_logs.len(),
            dead_letter = batch.dead_letter.is_some(),
            "ingested block"
        );

        Ok(TickOutcome::Advanced(batch.block_number))
    }

    async fn step(&mut self, ctx: &mut IngestionContext) {
        let started = Instant::now();

        match self.tick(ctx).await {
            Ok(TickOutcome::Advanced(block_number)) => {
                self.metrics.set_state(LoopState::Ingesting);
                self.metrics.ingested.record(block_number, &[]);
                self.metrics
                    .iteration_duration
                    .record(started.elapsed().as_secs_f64(), &[]);
            }
            Ok(TickOutcome::CaughtUp { head }) => {
                self.metrics.set_state(LoopState::CaughtUp);
                debug!(
                    cursor = ctx.cursor.last_ingested_block(),
                    head, "caught up with head"
                );
            }
            Err(err) => {
                self.metrics.set_state(LoopState::Backoff);
                self.record_failure(&err);
                warn!(
                    error = ?err,
                    block_number = ctx.cursor.target_block(),
                    kind = err.current_context().kind(),
                    "ingestion iteration failed"
                );
            }
        }
    }

    async fn refresh_head(&self) -> Result<u64, IngestionError> {
        let latest = self
            .client
            .latest_block_number()
            .await
            .change_context(IngestionError::Transport)
            .attach_printable("failed to fetch latest block number")?;

        let head = latest.saturating_sub(self.options.safety_lag);
        self.metrics.head.record(head, &[]);

        Ok(head)
    }

    /// Fetches the block and its logs concurrently, failing fast.
    async fn fetch_block(&self, block_number: u64) -> Result<(Block, Vec<Log>), IngestionError> {
        let (block, logs) = tokio::try_join!(
            async {
                self.client
                    .get_block(block_number)
                    .await
                    .change_context(IngestionError::Transport)
                    .attach_printable("failed to fetch block")
            },
            async {
                self.client
                    .get_logs(block_number, block_number)
                    .await
                    .change_context(IngestionError::Transport)
                    .attach_printable("failed to fetch logs")
            },
        )?;

        reconcile(block_number, &block, &logs)?;

        Ok((block, logs))
    }

    fn extract(&mut self, block: &Block, logs: &[Log]) -> Result<BlockBatch, IngestionError> {
        let err = match extract_block(block, logs, &self.extract_options) {
            Ok(batch) => return Ok(batch),
            Err(err) => err,
        };

        let attempts = match self.extraction_failures {
            Some(failures) if failures.block_number == block.number => failures.attempts + 1,
            _ => 1,
        };
        self.extraction_failures = Some(ExtractionFailures {
            block_number: block.number,
            attempts,
        });

        match self.options.dead_letter_after {
            Some(limit) if attempts >= limit => {
                let reason = describe_extraction_error(&err);
                warn!(
                    block_number = block.number,
                    attempts,
                    reason = %reason,
                    "writing block without orders"
                );

                let mut batch = extract_block_without_orders(block, logs);
                batch.dead_letter = Some(DeadLetterRecord {
                    block: block.number,
                    attempts,
                    reason,
                    created_at: DateTime::now(),
                });
                Ok(batch)
            }
            _ => Err(err
                .change_context(IngestionError::Extraction)
                .attach_printable(format!("attempt: {attempts}"))),
        }
    }

    fn record_batch(&self, batch: &BlockBatch) {
        self.metrics
            .transactions
            .add(batch.transactions.len() as u64, &[]);
        self.metrics.orders.add(batch.orders.len() as u64, &[]);
        self.metrics
            .event_logs
            .add(batch.event_logs.len() as u64, &[]);
        if batch.dead_letter.is_some() {
            self.metrics.dead_letters.add(1, &[]);
        }
    }

    fn record_failure(&self, err: &Report<IngestionError>) {
        self.metrics
            .failures
            .add(1, &[KeyValue::new("kind", err.current_context().kind())]);
    }
}

/// Checks that the block and logs belong to the requested block.
pub fn reconcile(block_number: u64, block: &Block, logs: &[Log]) -> Result<(), IngestionError> {
    if block.number != block_number {
        return Err(Report::new(IngestionError::Transport))
            .attach_printable("node returned a different block")
            .attach_printable_lazy(|| {
                format!("expected: {block_number}, actual: {}", block.number)
            });
    }

    if let Some(log) = logs.iter().find(|log| log.block_number != block_number) {
        return Err(Report::new(IngestionError::Transport))
            .attach_printable("node returned a log from a different block")
            .attach_printable_lazy(|| {
                format!(
                    "expected: {block_number}, actual: {}, transaction: {}",
                    log.block_number, log.transaction_hash
                )
            });
    }

    Ok(())
}

fn describe_extraction_error(err: &Report<ExtractionError>) -> String {
    match err.downcast_ref::<MalformedInscription>() {
        Some(malformed) => malformed.to_string(),
        None => err.current_context().to_string(),
    }
}

impl Default for IngestionServiceOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(2),
            safety_lag: 2,
            starting_block: 0,
            creator: String::new(),
            dead_letter_after: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{
        error::IngestionError,
        provider::models::{Block, Log},
    };

    use super::reconcile;

    fn block(number: u64) -> Block {
        Block {
            number,
            hash: None,
            timestamp: 0,
            transactions: Vec::default(),
        }
    }

    fn log(block_number: u64) -> Log {
        Log {
            transaction_hash: "0x01".to_string(),
            address: "0xaddress".to_string(),
            topics: Vec::default(),
            data: "0x".to_string(),
            block_number,
            transaction_index: 0,
            log_index: 0,
        }
    }

    #[test]
    pub fn test_reconcile() {
        assert!(reconcile(10, &block(10), &[log(10), log(10)]).is_ok());
        assert!(reconcile(10, &block(10), &[]).is_ok());

        let err = reconcile(10, &block(11), &[]).unwrap_err();
        assert_matches!(err.current_context(), IngestionError::Transport);

        let err = reconcile(10, &block(10), &[log(10), log(9)]).unwrap_err();
        assert_matches!(err.current_context(), IngestionError::Transport);
    }
}
