//! Documents written to the store.
//!
//! Field names follow the collections' existing layout, so documents written by earlier
//! deployments can be read back.
use std::fmt;

use mongodb::bson::DateTime;
use serde::{Deserialize, Serialize};

/// Far-future expiration stamped on every listing.
pub const DEFAULT_EXPIRATION_TIME: u64 = 4_871_333_268;

/// Identifier of the singleton cursor document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CursorId(pub String);

/// Pointer to the last block fully ingested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub id: CursorId,
    pub last_ingested_block: u64,
}

/// An inscription transaction, stored in `transactions`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    /// Transaction hash. Unique.
    pub id: String,
    pub from: String,
    /// `None` for contract creations.
    pub to: Option<String>,
    #[serde(rename = "block")]
    pub block_number: u64,
    #[serde(rename = "idx")]
    pub index_in_block: u64,
    pub timestamp: u64,
    #[serde(rename = "input")]
    pub raw_input: String,
}

/// A transfer or exchange event, stored in `evmlogs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLogRecord {
    #[serde(rename = "hash")]
    pub tx_hash: String,
    #[serde(rename = "address")]
    pub contract_address: String,
    pub topics: Vec<String>,
    pub data: String,
    #[serde(rename = "block")]
    pub block_number: u64,
    #[serde(rename = "trxIndex")]
    pub tx_index: u64,
    #[serde(rename = "logIndex")]
    pub log_index: u64,
    /// Back-filled from the owning block.
    pub timestamp: u64,
}

/// Signature placeholder of an unsigned listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vrs {
    pub v: u8,
    pub r: String,
    pub s: String,
}

/// A marketplace listing derived from a "list" inscription, stored in `orders`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    pub seller: String,
    pub creator: String,
    /// Hash of the listing transaction. Unique.
    pub list_id: String,
    pub ticker: String,
    /// `0x`-prefixed hex amount.
    pub amount: String,
    pub price: String,
    pub nonce: String,
    pub listing_time: u64,
    pub expiration_time: u64,
    pub update_date: DateTime,
    pub creator_fee_rate: u32,
    pub salt: u64,
    pub extra_params: String,
    pub input: String,
    pub status: i32,
    pub signature: String,
    pub vrs: Vrs,
}

/// Marker for a block whose payloads could not be decoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub block: u64,
    pub attempts: u32,
    pub reason: String,
    pub created_at: DateTime,
}

/// Everything written for a single block, in one transaction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockBatch {
    pub block_number: u64,
    pub timestamp: u64,
    pub transactions: Vec<TransactionRecord>,
    pub orders: Vec<OrderRecord>,
    pub event_logs: Vec<EventLogRecord>,
    pub dead_letter: Option<DeadLetterRecord>,
}

impl OrderRecord {
    /// Creates an unsigned listing with the catalog defaults.
    pub fn unsigned(
        seller: String,
        creator: String,
        list_id: String,
        ticker: String,
        amount: String,
        listing_time: u64,
        salt: u64,
    ) -> Self {
        Self {
            seller,
            creator,
            list_id,
            ticker,
            amount,
            price: "0".to_string(),
            nonce: "0".to_string(),
            listing_time,
            expiration_time: DEFAULT_EXPIRATION_TIME,
            update_date: DateTime::now(),
            creator_fee_rate: 0,
            salt,
            extra_params: "0x00".to_string(),
            input: String::new(),
            status: 0,
            signature: String::new(),
            vrs: Vrs {
                v: 0,
                r: "0x00".to_string(),
                s: "0x00".to_string(),
            },
        }
    }
}

impl BlockBatch {
    pub fn new(block_number: u64, timestamp: u64) -> Self {
        Self {
            block_number,
            timestamp,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty() && self.orders.is_empty() && self.event_logs.is_empty()
    }
}

impl fmt::Display for CursorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.last_ingested_block)
    }
}
