use std::time::Duration;

use anstyle::{AnsiColor, Style};
use clap::{builder::Styles, Args, Parser, Subcommand};
use error_stack::{Result, ResultExt};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{
    error::IngestionError,
    provider::{ChainClient, JsonRpcChainClient, JsonRpcChainClientOptions},
    service::{IngestionService, IngestionServiceOptions},
    store::{DocumentStore, MongoStore, MongoStoreOptions},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, styles = cli_style())]
pub struct Cli {
    #[command(subcommand)]
    pub subcommand: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Ingest blocks until interrupted.
    Run(RunArgs),
    /// Print the stored cursor and the chain's head.
    Status(StatusArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub rpc: RpcArgs,
    #[command(flatten)]
    pub mongo: MongoArgs,
    #[command(flatten)]
    pub ingestion: IngestionArgs,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub rpc: RpcArgs,
    #[command(flatten)]
    pub mongo: MongoArgs,
}

#[derive(Args, Debug, Clone)]
pub struct RpcArgs {
    /// Chain node JSON-RPC url.
    #[arg(long, env = "RPC_URL")]
    pub rpc_url: String,
    /// Timeout of each RPC request, for example "5s" or "1500ms".
    #[arg(long, env = "RPC_REQUEST_TIMEOUT", default_value = "5s")]
    pub request_timeout: String,
}

#[derive(Args, Debug, Clone)]
pub struct MongoArgs {
    /// MongoDB connection string. Must point to a replica set.
    #[arg(long, env = "MONGO_DSN")]
    pub mongo_dsn: String,
    /// Database name. Defaults to the connection string's database.
    #[arg(long, env = "MONGO_DATABASE")]
    pub mongo_database: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct IngestionArgs {
    /// Cursor value used when nothing was ingested yet.
    #[arg(long, env = "FROM_LOG_BLOCK", default_value = "0")]
    pub starting_block: u64,
    /// Address stamped as creator on list orders.
    #[arg(long, env = "CONTRACT_ADDRESS")]
    pub creator_address: String,
    /// How long to wait between iterations, for example "2s" or "500ms".
    #[arg(long, env = "INGESTION_POLL_INTERVAL", default_value = "2s")]
    pub poll_interval: String,
    /// How many blocks to stay behind the chain's head.
    #[arg(long, env = "INGESTION_SAFETY_LAG", default_value = "2")]
    pub safety_lag: u64,
    /// Write a block without its orders after this many consecutive decoding failures.
    #[arg(long, env = "INGESTION_DEAD_LETTER_AFTER")]
    pub dead_letter_after: Option<u32>,
}

impl Cli {
    pub async fn run(self) -> Result<(), IngestionError> {
        match self.subcommand {
            Command::Run(args) => args.run().await,
            Command::Status(args) => args.run().await,
        }
    }
}

impl RunArgs {
    pub async fn run(self) -> Result<(), IngestionError> {
        let options = self.ingestion.to_ingestion_service_options()?;
        let client = self.rpc.to_chain_client()?;
        let store = self.mongo.connect().await?;

        let ct = CancellationToken::new();
        set_ctrlc_handler(ct.clone())?;

        info!(
            starting_block = options.starting_block,
            safety_lag = options.safety_lag,
            poll_interval = ?options.poll_interval,
            dead_letter_after = ?options.dead_letter_after,
            "starting ingestion"
        );

        IngestionService::new(client, store, options)
            .start(ct)
            .await
    }
}

impl StatusArgs {
    pub async fn run(self) -> Result<(), IngestionError> {
        let client = self.rpc.to_chain_client()?;
        let store = self.mongo.connect().await?;

        let cursor = store
            .find_cursor()
            .await
            .change_context(IngestionError::Persistence)
            .attach_printable("failed to read cursor")?;
        let head = client
            .latest_block_number()
            .await
            .change_context(IngestionError::Transport)
            .attach_printable("failed to fetch latest block number")?;

        match cursor {
            Some(cursor) => {
                println!("cursor: {}", cursor.last_ingested_block);
                println!("head:   {head}");
                println!(
                    "behind: {}",
                    head.saturating_sub(cursor.last_ingested_block)
                );
            }
            None => {
                println!("cursor: none");
                println!("head:   {head}");
            }
        }

        Ok(())
    }
}

impl RpcArgs {
    pub fn to_chain_client(&self) -> Result<JsonRpcChainClient, IngestionError> {
        let timeout = parse_duration(&self.request_timeout, "request timeout")?;

        let options = JsonRpcChainClientOptions {
            timeout,
            ..Default::default()
        };

        JsonRpcChainClient::new(&self.rpc_url, options)
            .change_context(IngestionError::Configuration)
            .attach_printable("failed to create chain client")
    }
}

impl MongoArgs {
    pub async fn connect(&self) -> Result<MongoStore, IngestionError> {
        MongoStore::connect(MongoStoreOptions {
            connection_string: self.mongo_dsn.clone(),
            database: self.mongo_database.clone(),
        })
        .await
        .change_context(IngestionError::Configuration)
        .attach_printable("failed to create mongo store")
    }
}

impl IngestionArgs {
    pub fn to_ingestion_service_options(
        &self,
    ) -> Result<IngestionServiceOptions, IngestionError> {
        let poll_interval = parse_duration(&self.poll_interval, "poll interval")?;

        if self.dead_letter_after == Some(0) {
            return Err(IngestionError::Configuration)
                .attach_printable("dead letter threshold must be at least 1");
        }

        Ok(IngestionServiceOptions {
            poll_interval,
            safety_lag: self.safety_lag,
            starting_block: self.starting_block,
            creator: self.creator_address.clone(),
            dead_letter_after: self.dead_letter_after,
        })
    }
}

fn parse_duration(value: &str, name: &str) -> Result<Duration, IngestionError> {
    duration_str::parse_std(value).or_else(|err| {
        Err(IngestionError::Configuration)
            .attach_printable(format!("failed to parse {name}"))
            .attach_printable(format!("error: {}", err))
    })
}

/// Connect the cancellation token to the ctrl-c handler.
pub fn set_ctrlc_handler(ct: CancellationToken) -> Result<(), IngestionError> {
    ctrlc::set_handler({
        move || {
            ct.cancel();
        }
    })
    .change_context(IngestionError::Fatal)
    .attach_printable("failed to register ctrl-c handler")?;

    Ok(())
}

pub fn cli_style() -> Styles {
    Styles::styled()
        .header(Style::new().bold().fg_color(Some(AnsiColor::Yellow.into())))
        .error(Style::new().bold().fg_color(Some(AnsiColor::Red.into())))
        .usage(Style::new().bold().fg_color(Some(AnsiColor::Yellow.into())))
        .literal(Style::new().fg_color(Some(AnsiColor::BrightCyan.into())))
        .placeholder(Style::new())
        .valid(Style::new().fg_color(Some(AnsiColor::BrightBlue.into())))
        .invalid(
            Style::new()
                .underline()
                .fg_color(Some(AnsiColor::Red.into())),
        )
}
