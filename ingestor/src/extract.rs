//! Turns raw blocks and logs into the records written to the store.
//!
//! A transaction is an inscription when its calldata starts with `data:`. Inscriptions whose
//! JSON body carries `"op":"list"` also produce a marketplace order. Logs are kept only when
//! their first topic is the transfer or the exchange event.
use std::fmt;

use alloy_primitives::U256;
use error_stack::{Report, Result};
use rand::Rng;
use serde::Deserialize;
use serde_json::Value;

use crate::{
    model::{BlockBatch, EventLogRecord, OrderRecord, TransactionRecord},
    provider::models::{Block, Log, Transaction},
};

/// Hex encoding of `data:`.
pub const INSCRIPTION_PREFIX: &str = "0x646174613a";
/// Hex encoding of `"op":"list"`.
pub const LIST_MARKER: &str = "226f70223a226c69737422";
pub const TRANSFER_TOPIC: &str =
    "0x8cdf9e10a7b20e7a9c4e778fc3eb28f2766e438a9856a62eac39fbd2be98cbc2";
pub const EXCHANGE_TOPIC: &str =
    "0xe2750d6418e3719830794d3db788aa72febcd657bcd18ed8f1facdbf61a69a9a";

const SALT_RANGE: std::ops::Range<u64> = 100_000_000..1_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionError {
    MalformedPayload,
}

/// Attached to [ExtractionError::MalformedPayload] reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedInscription {
    pub transaction: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    /// Address stamped as `creator` on every order.
    pub creator: String,
}

/// Outcome of decoding a list inscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListPayload {
    NotAnOrder,
    Order { ticker: String, amount: U256 },
    Malformed(String),
}

#[derive(Debug, Deserialize)]
struct ListInscription {
    tick: String,
    amt: RawAmount,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Text(String),
    Integer(u64),
}

/// Extracts every record of the block.
///
/// Fails if any list inscription in the block is malformed, so that no order of the block is
/// emitted partially.
pub fn extract_block(
    block: &Block,
    logs: &[Log],
    options: &ExtractOptions,
) -> Result<BlockBatch, ExtractionError> {
    let mut batch = extract_block_without_orders(block, logs);
    let mut rng = rand::thread_rng();

    for tx in block.transactions.iter().filter(|tx| is_inscription(tx)) {
        if !has_list_marker(&tx.input) {
            continue;
        }

        match decode_list_payload(&tx.input) {
            ListPayload::NotAnOrder => {}
            ListPayload::Order { ticker, amount } => {
                batch.orders.push(OrderRecord::unsigned(
                    tx.from.clone(),
                    options.creator.clone(),
                    tx.hash.clone(),
                    ticker,
                    format!("0x{amount:x}"),
                    block.timestamp,
                    rng.gen_range(SALT_RANGE),
                ));
            }
            ListPayload::Malformed(reason) => {
                return Err(
                    Report::new(ExtractionError::MalformedPayload).attach_printable(
                        MalformedInscription {
                            transaction: tx.hash.clone(),
                            reason,
                        },
                    ),
                );
            }
        }
    }

    Ok(batch)
}

/// Extracts transactions and logs, ignoring list payloads.
pub fn extract_block_without_orders(block: &Block, logs: &[Log]) -> BlockBatch {
    let mut batch = BlockBatch::new(block.number, block.timestamp);

    batch.transactions = block
        .transactions
        .iter()
        .filter(|tx| is_inscription(tx))
        .map(|tx| TransactionRecord {
            id: tx.hash.clone(),
            from: tx.from.clone(),
            to: tx.to.clone(),
            block_number: tx.block_number,
            index_in_block: tx.transaction_index,
            timestamp: block.timestamp,
            raw_input: tx.input.clone(),
        })
        .collect();

    batch.event_logs = logs
        .iter()
        .filter(|log| is_tracked_log(log))
        .map(|log| EventLogRecord {
            tx_hash: log.transaction_hash.clone(),
            contract_address: log.address.clone(),
            topics: log.topics.clone(),
            data: log.data.clone(),
            block_number: log.block_number,
            tx_index: log.transaction_index,
            log_index: log.log_index,
            timestamp: block.timestamp,
        })
        .collect();

    batch
}

pub fn is_inscription(tx: &Transaction) -> bool {
    tx.input
        .get(..INSCRIPTION_PREFIX.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(INSCRIPTION_PREFIX))
}

pub fn is_tracked_log(log: &Log) -> bool {
    log.topics.first().is_some_and(|topic| {
        topic.eq_ignore_ascii_case(TRANSFER_TOPIC) || topic.eq_ignore_ascii_case(EXCHANGE_TOPIC)
    })
}

fn has_list_marker(input: &str) -> bool {
    input.to_ascii_lowercase().contains(LIST_MARKER)
}

/// Decodes the hex calldata of an inscription into a list order.
///
/// The payload is `data:` followed by the JSON body, optionally preceded by a data-URI media
/// type terminated by `,` (e.g. `data:,{...}` or `data:application/json,{...}`).
pub fn decode_list_payload(input: &str) -> ListPayload {
    let digits = input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
        .unwrap_or(input);

    let bytes = match hex::decode(digits) {
        Ok(bytes) => bytes,
        Err(err) => return ListPayload::Malformed(format!("invalid hex: {err}")),
    };

    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(err) => return ListPayload::Malformed(format!("invalid utf-8: {err}")),
    };

    let Some(body) = text.strip_prefix("data:") else {
        return ListPayload::NotAnOrder;
    };

    let json = if body.trim_start().starts_with('{') {
        body
    } else {
        match body.split_once(',') {
            Some((_, json)) => json,
            None => return ListPayload::Malformed("missing payload body".to_string()),
        }
    };

    let value: Value = match serde_json::from_str(json) {
        Ok(value) => value,
        Err(err) => return ListPayload::Malformed(format!("invalid json: {err}")),
    };

    // Only the top-level `op` decides whether the payload is an order.
    if value.get("op").and_then(Value::as_str) != Some("list") {
        return ListPayload::NotAnOrder;
    }

    let inscription = match ListInscription::deserialize(value) {
        Ok(inscription) => inscription,
        Err(err) => return ListPayload::Malformed(format!("invalid list order: {err}")),
    };

    let amount = match inscription.amt {
        RawAmount::Integer(amount) => U256::from(amount),
        RawAmount::Text(text) => match text.trim().parse::<U256>() {
            Ok(amount) => amount,
            Err(err) => return ListPayload::Malformed(format!("invalid amount {text:?}: {err}")),
        },
    };

    ListPayload::Order {
        ticker: inscription.tick,
        amount,
    }
}

impl fmt::Display for MalformedInscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transaction {}: {}", self.transaction, self.reason)
    }
}

impl error_stack::Context for ExtractionError {}

impl fmt::Display for ExtractionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtractionError::MalformedPayload => f.write_str("malformed list inscription"),
        }
    }
}
