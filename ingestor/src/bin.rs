use std::process::ExitCode;

use clap::Parser;
use error_stack::{Result, ResultExt};
use inscription_ingestor::{Cli, IngestionError, ReportExt};
use inscription_observability::init_opentelemetry;

#[cfg(not(windows))]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> ExitCode {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let args = Cli::parse();
    run_with_args(args).await.to_exit_code()
}

async fn run_with_args(args: Cli) -> Result<(), IngestionError> {
    init_opentelemetry(env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
        .change_context(IngestionError::Fatal)
        .attach_printable("failed to initialize opentelemetry")?;

    args.run().await
}
