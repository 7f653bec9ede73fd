//! Ingests inscriptions, list orders and marketplace events from an EVM chain into MongoDB.
pub mod cli;
pub mod cursor;
pub mod error;
pub mod extract;
pub mod metrics;
pub mod model;
pub mod persistence;
pub mod provider;
pub mod service;
pub mod store;

pub use self::cli::Cli;
pub use self::error::{IngestionError, ReportExt};
pub use self::service::{IngestionContext, IngestionService, IngestionServiceOptions, TickOutcome};
