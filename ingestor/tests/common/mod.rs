#![allow(dead_code)]
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use error_stack::{Report, Result, ResultExt};
use inscription_ingestor::{
    extract::{EXCHANGE_TOPIC, TRANSFER_TOPIC},
    model::{Cursor, CursorId, DeadLetterRecord, EventLogRecord, OrderRecord, TransactionRecord},
    provider::{
        models::{Block, Log, Transaction},
        ChainClient, ChainClientError,
    },
    store::{DocumentStore, StoreError, StoreTransaction},
};
use serde::Deserialize;
use serde_json::{json, Value};
use wiremock::{http::Method, Match, Request, Respond, ResponseTemplate};

pub const BLOCK_TIMESTAMP_BASE: u64 = 1_700_000_000;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: u64,
    method: String,
    params: Value,
}

pub struct RpcRequestMatcher {
    method: String,
    params: Value,
}

pub struct RpcResponse {
    result: Value,
}

pub struct RpcErrorResponse {
    message: String,
}

pub fn rpc_request<P>(method: impl Into<String>, params: P) -> RpcRequestMatcher
where
    P: serde::Serialize,
{
    RpcRequestMatcher {
        method: method.into(),
        params: serde_json::to_value(params).expect("failed to serialize JSON params"),
    }
}

impl RpcResponse {
    pub fn new(result: Value) -> Self {
        Self { result }
    }
}

impl RpcErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Match for RpcRequestMatcher {
    fn matches(&self, req: &Request) -> bool {
        if req.method != Method::Post {
            return false;
        }

        if let Ok(rpc_req) = serde_json::from_slice::<RpcRequest>(&req.body) {
            rpc_req.method == self.method && rpc_req.params == self.params
        } else {
            false
        }
    }
}

impl Respond for RpcResponse {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        if let Ok(rpc_req) = serde_json::from_slice::<RpcRequest>(&req.body) {
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": rpc_req.id,
                "result": self.result,
            }))
        } else {
            ResponseTemplate::new(400)
        }
    }
}

impl Respond for RpcErrorResponse {
    fn respond(&self, req: &Request) -> ResponseTemplate {
        if let Ok(rpc_req) = serde_json::from_slice::<RpcRequest>(&req.body) {
            ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": rpc_req.id,
                "error": {
                    "code": -32602,
                    "message": self.message,
                }
            }))
        } else {
            ResponseTemplate::new(400)
        }
    }
}

/// Hex calldata of a `data:` inscription.
pub fn inscription_input(body: &str) -> String {
    format!("0x{}", hex::encode(format!("data:{body}")))
}

pub fn list_input(ticker: &str, amount: &str) -> String {
    inscription_input(&format!(
        r#"{{"p":"brc","op":"list","tick":"{ticker}","amt":"{amount}"}}"#
    ))
}

pub fn transaction(block_number: u64, index: u64, input: String) -> Transaction {
    Transaction {
        hash: format!("0x{block_number:08x}{index:04x}"),
        from: "0x00000000000000000000000000000000000000aa".to_string(),
        to: Some("0x00000000000000000000000000000000000000aa".to_string()),
        block_number,
        transaction_index: index,
        input,
    }
}

pub fn tracked_log(block_number: u64, log_index: u64, exchange: bool) -> Log {
    let topic = if exchange {
        EXCHANGE_TOPIC
    } else {
        TRANSFER_TOPIC
    };

    Log {
        transaction_hash: format!("0x{block_number:08x}{log_index:04x}"),
        address: "0x00000000000000000000000000000000000000bb".to_string(),
        topics: vec![topic.to_string()],
        data: "0x".to_string(),
        block_number,
        transaction_index: log_index,
        log_index,
    }
}

pub fn untracked_log(block_number: u64, log_index: u64) -> Log {
    Log {
        topics: vec![
            "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef".to_string(),
        ],
        ..tracked_log(block_number, log_index, false)
    }
}

pub fn block(number: u64, transactions: Vec<Transaction>) -> Block {
    Block {
        number,
        hash: Some(format!("0x{number:064x}")),
        timestamp: BLOCK_TIMESTAMP_BASE + number,
        transactions,
    }
}

/// A block with one plain inscription, one list inscription, one unrelated transaction and
/// two tracked logs out of three.
pub fn standard_block(number: u64) -> (Block, Vec<Log>) {
    let block = block(
        number,
        vec![
            transaction(number, 0, inscription_input(r#",{"p":"brc","op":"mint"}"#)),
            transaction(number, 1, list_input("ordi", "1000")),
            transaction(number, 2, "0xa9059cbb".to_string()),
        ],
    );
    let logs = vec![
        tracked_log(number, 0, false),
        untracked_log(number, 1),
        tracked_log(number, 2, true),
    ];
    (block, logs)
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ChainCalls {
    pub latest_block_number: usize,
    pub get_block: usize,
    pub get_logs: usize,
}

#[derive(Debug, Default)]
struct ChainState {
    head: u64,
    blocks: HashMap<u64, (Block, Vec<Log>)>,
    failing_heads: bool,
    failing_blocks: HashSet<u64>,
    failing_logs: HashSet<u64>,
    calls: ChainCalls,
}

/// A chain client serving scripted blocks.
#[derive(Debug, Clone, Default)]
pub struct TestChainClient {
    state: Arc<Mutex<ChainState>>,
}

impl TestChainClient {
    pub fn with_blocks(head: u64, blocks: impl IntoIterator<Item = (Block, Vec<Log>)>) -> Self {
        let client = Self::default();
        client.set_head(head);
        for (block, logs) in blocks {
            client.add_block(block, logs);
        }
        client
    }

    pub fn set_head(&self, head: u64) {
        self.lock().head = head;
    }

    pub fn add_block(&self, block: Block, logs: Vec<Log>) {
        self.lock().blocks.insert(block.number, (block, logs));
    }

    pub fn fail_heads(&self, fail: bool) {
        self.lock().failing_heads = fail;
    }

    pub fn fail_block(&self, block_number: u64, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.failing_blocks.insert(block_number);
        } else {
            state.failing_blocks.remove(&block_number);
        }
    }

    pub fn fail_logs(&self, block_number: u64, fail: bool) {
        let mut state = self.lock();
        if fail {
            state.failing_logs.insert(block_number);
        } else {
            state.failing_logs.remove(&block_number);
        }
    }

    pub fn calls(&self) -> ChainCalls {
        self.lock().calls
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().expect("chain state lock poisoned")
    }
}

impl ChainClient for TestChainClient {
    async fn latest_block_number(&self) -> Result<u64, ChainClientError> {
        let mut state = self.lock();
        state.calls.latest_block_number += 1;
        if state.failing_heads {
            return Err(Report::new(ChainClientError::Timeout));
        }
        Ok(state.head)
    }

    async fn get_block(&self, block_number: u64) -> Result<Block, ChainClientError> {
        let mut state = self.lock();
        state.calls.get_block += 1;
        if state.failing_blocks.contains(&block_number) {
            return Err(Report::new(ChainClientError::ServerError));
        }
        state
            .blocks
            .get(&block_number)
            .map(|(block, _)| block.clone())
            .ok_or_else(|| Report::new(ChainClientError::EmptyResult))
    }

    async fn get_logs(&self, from_block: u64, to_block: u64) -> Result<Vec<Log>, ChainClientError> {
        let mut state = self.lock();
        state.calls.get_logs += 1;
        if (from_block..=to_block).any(|n| state.failing_logs.contains(&n)) {
            return Err(Report::new(ChainClientError::ServerError));
        }
        Ok((from_block..=to_block)
            .filter_map(|n| state.blocks.get(&n))
            .flat_map(|(_, logs)| logs.iter().cloned())
            .collect())
    }
}

/// Where a [FailingStore] transaction fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailPoint {
    InsertTransactions,
    InsertOrders,
    InsertEventLogs,
    UpdateCursor,
    Commit,
    /// The commit is applied but reported as failed.
    AfterCommit,
}

/// Wraps a store and makes its transactions fail at a chosen point.
#[derive(Debug, Clone)]
pub struct FailingStore<S> {
    inner: S,
    fail_point: Arc<Mutex<Option<FailPoint>>>,
}

pub struct FailingTransaction<T> {
    inner: T,
    fail_point: Option<FailPoint>,
}

impl<S> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_point: Arc::default(),
        }
    }

    pub fn fail_at(&self, fail_point: Option<FailPoint>) {
        *self.fail_point.lock().expect("fail point lock poisoned") = fail_point;
    }
}

impl<T> FailingTransaction<T> {
    fn check(&self, point: FailPoint) -> Result<(), StoreError> {
        if self.fail_point == Some(point) {
            return Err(Report::new(StoreError::Write))
                .attach_printable(format!("injected failure at {point:?}"));
        }
        Ok(())
    }
}

#[async_trait]
impl<S> DocumentStore for FailingStore<S>
where
    S: DocumentStore,
{
    type Transaction = FailingTransaction<S::Transaction>;

    async fn ensure_indexes(&self) -> Result<(), StoreError> {
        self.inner.ensure_indexes().await
    }

    async fn find_cursor(&self) -> Result<Option<Cursor>, StoreError> {
        self.inner.find_cursor().await
    }

    async fn create_cursor(&self, block_number: u64) -> Result<Cursor, StoreError> {
        self.inner.create_cursor(block_number).await
    }

    async fn max_ingested_block(&self) -> Result<Option<u64>, StoreError> {
        self.inner.max_ingested_block().await
    }

    async fn begin(&self) -> Result<Self::Transaction, StoreError> {
        let fail_point = *self.fail_point.lock().expect("fail point lock poisoned");
        Ok(FailingTransaction {
            inner: self.inner.begin().await?,
            fail_point,
        })
    }
}

#[async_trait]
impl<T> StoreTransaction for FailingTransaction<T>
where
    T: StoreTransaction,
{
    async fn insert_transactions(
        &mut self,
        records: &[TransactionRecord],
    ) -> Result<(), StoreError> {
        self.inner.insert_transactions(records).await?;
        self.check(FailPoint::InsertTransactions)
    }

    async fn insert_orders(&mut self, records: &[OrderRecord]) -> Result<(), StoreError> {
        self.inner.insert_orders(records).await?;
        self.check(FailPoint::InsertOrders)
    }

    async fn insert_event_logs(&mut self, records: &[EventLogRecord]) -> Result<(), StoreError> {
        self.inner.insert_event_logs(records).await?;
        self.check(FailPoint::InsertEventLogs)
    }

    async fn insert_dead_letter(&mut self, record: &DeadLetterRecord) -> Result<(), StoreError> {
        self.inner.insert_dead_letter(record).await
    }

    async fn update_cursor(
        &mut self,
        id: &CursorId,
        block_number: u64,
    ) -> Result<(), StoreError> {
        self.check(FailPoint::UpdateCursor)?;
        self.inner.update_cursor(id, block_number).await
    }

    async fn commit(self) -> Result<(), StoreError> {
        if let Err(err) = self.check(FailPoint::Commit) {
            self.inner.abort().await?;
            return Err(err);
        }
        self.inner.commit().await?;
        if self.fail_point == Some(FailPoint::AfterCommit) {
            return Err(Report::new(StoreError::Transaction))
                .attach_printable("commit result unknown");
        }
        Ok(())
    }

    async fn abort(self) -> Result<(), StoreError> {
        self.inner.abort().await
    }
}
