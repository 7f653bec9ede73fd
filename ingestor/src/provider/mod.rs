//! Access to the chain node.
mod http;
pub mod models;

use std::future::Future;

use error_stack::{Report, Result};

pub use self::http::{JsonRpcChainClient, JsonRpcChainClientOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainClientError {
    /// The request could not be sent or its body could not be read.
    Request,
    Timeout,
    /// The node answered with a non-200 status.
    ServerError,
    /// The node answered with a JSON-RPC error object.
    Rpc,
    DeserializeResponse,
    /// The response carried no result (e.g. a block that doesn't exist yet).
    EmptyResult,
    Configuration,
}

/// Read access to the chain, one block at a time.
pub trait ChainClient {
    /// Returns the number of the most recent block known to the node.
    fn latest_block_number(&self) -> impl Future<Output = Result<u64, ChainClientError>> + Send;

    /// Returns the block with full transaction objects.
    fn get_block(
        &self,
        block_number: u64,
    ) -> impl Future<Output = Result<models::Block, ChainClientError>> + Send;

    /// Returns all logs in the inclusive block range.
    fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> impl Future<Output = Result<Vec<models::Log>, ChainClientError>> + Send;
}

pub trait ChainClientErrorExt {
    fn is_empty_result(&self) -> bool;
}

impl error_stack::Context for ChainClientError {}

impl std::fmt::Display for ChainClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainClientError::Request => write!(f, "failed to send request"),
            ChainClientError::Timeout => write!(f, "request timed out"),
            ChainClientError::ServerError => write!(f, "chain node returned an error status"),
            ChainClientError::Rpc => write!(f, "chain node returned a JSON-RPC error"),
            ChainClientError::DeserializeResponse => write!(f, "failed to deserialize response"),
            ChainClientError::EmptyResult => write!(f, "response has no result"),
            ChainClientError::Configuration => write!(f, "invalid chain client configuration"),
        }
    }
}

impl ChainClientErrorExt for Report<ChainClientError> {
    fn is_empty_result(&self) -> bool {
        matches!(self.current_context(), ChainClientError::EmptyResult)
    }
}
