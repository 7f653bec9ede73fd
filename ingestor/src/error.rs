use std::{fmt, process::ExitCode};

use error_stack::Report;

/// Ingestion error.
///
/// `Transport`, `Extraction` and `Persistence` are recoverable: the ingestion loop logs them and
/// retries the same block after the backoff interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionError {
    /// The chain node request failed or returned malformed data.
    Transport,
    /// A transaction payload could not be decoded.
    Extraction,
    /// The atomic write to the document store failed.
    Persistence,
    /// Invalid options. Should not retry.
    Configuration,
    /// Process setup failed (signal handler, telemetry).
    Fatal,
}

pub type Result<T> = error_stack::Result<T, IngestionError>;

impl error_stack::Context for IngestionError {}

impl fmt::Display for IngestionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestionError::Transport => f.write_str("ingestion error: transport"),
            IngestionError::Extraction => f.write_str("ingestion error: extraction"),
            IngestionError::Persistence => f.write_str("ingestion error: persistence"),
            IngestionError::Configuration => f.write_str("ingestion error: configuration"),
            IngestionError::Fatal => f.write_str("ingestion error: fatal"),
        }
    }
}

impl IngestionError {
    /// Short label used in logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            IngestionError::Transport => "transport",
            IngestionError::Extraction => "extraction",
            IngestionError::Persistence => "persistence",
            IngestionError::Configuration => "configuration",
            IngestionError::Fatal => "fatal",
        }
    }
}

pub trait IngestionErrorExt {
    fn is_extraction(&self) -> bool;
}

impl IngestionErrorExt for Report<IngestionError> {
    fn is_extraction(&self) -> bool {
        matches!(self.current_context(), IngestionError::Extraction)
    }
}

pub trait ReportExt {
    fn to_exit_code(&self) -> ExitCode;
}

impl<T> ReportExt for Result<T> {
    fn to_exit_code(&self) -> ExitCode {
        match self {
            Ok(_) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("{:?}", err);
                // Exit codes based on sysexits.h
                match err.current_context() {
                    IngestionError::Configuration => ExitCode::from(78),
                    IngestionError::Transport => ExitCode::from(75),
                    _ => ExitCode::FAILURE,
                }
            }
        }
    }
}
