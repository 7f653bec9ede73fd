use inscription_observability::{Counter, Gauge, Histogram};

/// Loop state, as reported by the `ingestion.state` gauge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum LoopState {
    Initializing = 0,
    Ingesting = 1,
    CaughtUp = 2,
    Backoff = 3,
}

#[derive(Debug, Clone)]
pub struct IngestionMetrics {
    pub up: Gauge<u64>,
    pub state: Gauge<u64>,
    pub head: Gauge<u64>,
    pub ingested: Gauge<u64>,
    pub transactions: Counter<u64>,
    pub orders: Counter<u64>,
    pub event_logs: Counter<u64>,
    pub dead_letters: Counter<u64>,
    pub failures: Counter<u64>,
    pub iteration_duration: Histogram<f64>,
}

impl IngestionMetrics {
    pub fn set_state(&self, state: LoopState) {
        self.state.record(state as u64, &[]);
    }
}

impl Default for IngestionMetrics {
    fn default() -> Self {
        let meter = inscription_observability::meter("inscription_ingestion");

        Self {
            up: meter
                .u64_gauge("inscription.ingestion.up")
                .with_description("ingestion service is up")
                .build(),
            state: meter
                .u64_gauge("inscription.ingestion.state")
                .with_description(
                    "ingestion loop state. 0 = initializing, 1 = ingesting, 2 = caught up, 3 = backoff",
                )
                .build(),
            head: meter
                .u64_gauge("inscription.ingestion.head")
                .with_description("chain's head block, minus the safety lag")
                .with_unit("{block}")
                .build(),
            ingested: meter
                .u64_gauge("inscription.ingestion.ingested")
                .with_description("latest block ingested")
                .with_unit("{block}")
                .build(),
            transactions: meter
                .u64_counter("inscription.ingestion.transactions")
                .with_description("inscription transactions written")
                .with_unit("{transaction}")
                .build(),
            orders: meter
                .u64_counter("inscription.ingestion.orders")
                .with_description("list orders written")
                .with_unit("{order}")
                .build(),
            event_logs: meter
                .u64_counter("inscription.ingestion.event_logs")
                .with_description("transfer and exchange logs written")
                .with_unit("{log}")
                .build(),
            dead_letters: meter
                .u64_counter("inscription.ingestion.dead_letters")
                .with_description("blocks written without their orders")
                .with_unit("{block}")
                .build(),
            failures: meter
                .u64_counter("inscription.ingestion.failures")
                .with_description("failed iterations, by kind")
                .build(),
            iteration_duration: meter
                .f64_histogram("inscription.ingestion.iteration_duration")
                .with_description("time to fetch, extract and persist one block")
                .with_unit("s")
                .with_boundaries(vec![
                    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5,
                    10.0, 20.0, 30.0,
                ])
                .build(),
        }
    }
}
