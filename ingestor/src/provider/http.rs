use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use error_stack::{Report, Result, ResultExt};
use reqwest::{
    header::{HeaderMap, HeaderValue},
    Client,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use url::Url;

use super::{
    models::{self, format_quantity, parse_quantity},
    ChainClient, ChainClientError,
};

#[derive(Debug, Clone)]
pub struct JsonRpcChainClientOptions {
    /// Timeout for each request.
    pub timeout: Duration,
    /// Headers to send with the requests.
    pub headers: HeaderMap<HeaderValue>,
}

/// Chain client over EVM JSON-RPC.
#[derive(Debug, Clone)]
pub struct JsonRpcChainClient {
    client: Client,
    url: Url,
    options: JsonRpcChainClientOptions,
    request_id: Arc<AtomicU64>,
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a, P> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: P,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse<R> {
    result: Option<R>,
    error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

impl Default for JsonRpcChainClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            headers: HeaderMap::default(),
        }
    }
}

impl JsonRpcChainClient {
    pub fn new(
        url: impl AsRef<str>,
        options: JsonRpcChainClientOptions,
    ) -> Result<Self, ChainClientError> {
        let url = url.as_ref();
        let url = Url::parse(url)
            .change_context(ChainClientError::Configuration)
            .attach_printable("failed to parse rpc url")
            .attach_printable_lazy(|| format!("url: {url}"))?;

        let client = Client::builder()
            .timeout(options.timeout)
            .build()
            .change_context(ChainClientError::Configuration)
            .attach_printable("failed to build http client")?;

        Ok(Self {
            client,
            url,
            options,
            request_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Send a JSON-RPC request to the node.
    ///
    /// A missing or `null` result is reported as [ChainClientError::EmptyResult].
    #[tracing::instrument(level = "debug", skip(self))]
    async fn send_request<P, R>(&self, method: &str, params: P) -> Result<R, ChainClientError>
    where
        P: Serialize + Debug,
        R: DeserializeOwned,
    {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id: self.request_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let response = match self
            .client
            .post(self.url.clone())
            .headers(self.options.headers.clone())
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) if err.is_timeout() => {
                return Err(err).change_context(ChainClientError::Timeout);
            }
            Err(err) => {
                return Err(err).change_context(ChainClientError::Request);
            }
        };

        let status = response.status();
        if status.as_u16() != 200 {
            return Err(Report::new(ChainClientError::ServerError))
                .attach_printable_lazy(|| format!("status: {status}"))
                .attach_printable_lazy(|| format!("method: {method}"));
        }

        let text_response = response
            .text()
            .await
            .change_context(ChainClientError::Request)?;

        let response: JsonRpcResponse<R> = serde_json::from_str(&text_response)
            .change_context(ChainClientError::DeserializeResponse)
            .attach_printable_lazy(|| format!("method: {method}"))?;

        if let Some(error) = response.error {
            return Err(Report::new(ChainClientError::Rpc))
                .attach_printable_lazy(|| format!("code: {}", error.code))
                .attach_printable_lazy(|| format!("message: {}", error.message))
                .attach_printable_lazy(|| format!("method: {method}"));
        }

        response
            .result
            .ok_or_else(|| Report::new(ChainClientError::EmptyResult))
            .attach_printable_lazy(|| format!("method: {method}"))
    }
}

impl ChainClient for JsonRpcChainClient {
    async fn latest_block_number(&self) -> Result<u64, ChainClientError> {
        let number: String = self.send_request("eth_blockNumber", json!([])).await?;
        parse_quantity(&number)
            .ok_or_else(|| Report::new(ChainClientError::DeserializeResponse))
            .attach_printable_lazy(|| format!("invalid block number: {number}"))
    }

    async fn get_block(&self, block_number: u64) -> Result<models::Block, ChainClientError> {
        self.send_request(
            "eth_getBlockByNumber",
            json!([format_quantity(block_number), true]),
        )
        .await
        .attach_printable_lazy(|| format!("block number: {block_number}"))
    }

    async fn get_logs(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<Vec<models::Log>, ChainClientError> {
        self.send_request(
            "eth_getLogs",
            json!([{
                "fromBlock": format_quantity(from_block),
                "toBlock": format_quantity(to_block),
            }]),
        )
        .await
        .attach_printable_lazy(|| format!("from block: {from_block}, to block: {to_block}"))
    }
}
