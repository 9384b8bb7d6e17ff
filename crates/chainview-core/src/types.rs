//! Shared types: chain rows read from the indexer, and the view registry.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::definition::ViewDefinition;

// ─── Chain data ───────────────────────────────────────────────────────────────

/// A row of the indexer's `blocks` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub height: u64,
    pub hash: String,
    /// Unix timestamp (seconds).
    pub timestamp: i64,
    pub burn_block_height: u64,
    /// `false` once the block has been orphaned by a reorg.
    pub canonical: bool,
}

/// A row of the indexer's `transactions` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub tx_id: String,
    pub block_height: u64,
    /// Transaction type, e.g. `"contract_call"` or `"token_transfer"`.
    #[serde(rename = "type")]
    pub tx_type: String,
    pub sender: String,
    pub status: String,
    pub contract_id: Option<String>,
    pub function_name: Option<String>,
}

/// A row of the indexer's `events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub id: String,
    pub tx_id: String,
    pub block_height: u64,
    pub event_index: u32,
    /// Event type, e.g. `"smart_contract_event"` or `"stx_transfer_event"`.
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

/// Decoded event data as the indexer stored it.
///
/// Whatever the chain sends is shape-checked once, when the event row is loaded,
/// so handlers and the matcher never deal with an untyped blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum EventData {
    /// Named fields (a decoded tuple / map).
    Composite(Map<String, Value>),
    /// Undecoded hex payload, passed through untouched.
    Raw(String),
    /// Any other decoded value (number, bool, plain string, list, null).
    Scalar(Value),
}

impl EventData {
    /// Look up a named field of a composite payload.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Self::Composite(fields) => fields.get(name),
            _ => None,
        }
    }

    /// A string field of a composite payload.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.field(name).and_then(Value::as_str)
    }

    /// A numeric field of a composite payload. Accepts JSON numbers and
    /// decimal strings, since large chain amounts are often serialized as text.
    pub fn amount_field(&self, name: &str) -> Option<u128> {
        match self.field(name)? {
            Value::Number(n) => n
                .as_u64()
                .map(u128::from)
                .or_else(|| n.as_f64().filter(|f| *f >= 0.0).map(|f| f as u128)),
            Value::String(s) => s.parse::<u128>().ok(),
            _ => None,
        }
    }
}

impl From<Value> for EventData {
    fn from(value: Value) -> Self {
        match value {
            Value::Object(fields) => Self::Composite(fields),
            Value::String(s) if s.starts_with("0x") => Self::Raw(s),
            other => Self::Scalar(other),
        }
    }
}

impl From<EventData> for Value {
    fn from(data: EventData) -> Self {
        match data {
            EventData::Composite(fields) => Value::Object(fields),
            EventData::Raw(hex) => Value::String(hex),
            EventData::Scalar(v) => v,
        }
    }
}

/// A row of the indexer's `index_progress` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexProgress {
    pub last_indexed_block: u64,
    /// Highest height below which every block has been indexed.
    pub last_contiguous_block: u64,
}

// ─── View registry ────────────────────────────────────────────────────────────

/// Lifecycle status of a registered view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewStatus {
    Active,
    Error,
    Reindexing,
}

impl ViewStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Error => "error",
            Self::Reindexing => "reindexing",
        }
    }

    /// Parse a stored status string. Unknown values map to `Error` so that a
    /// corrupted row is never processed.
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "reindexing" => Self::Reindexing,
            _ => Self::Error,
        }
    }
}

impl std::fmt::Display for ViewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health counters persisted with each view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewHealth {
    pub total_processed: u64,
    pub total_errors: u64,
    pub last_error: Option<String>,
    /// Unix timestamp (seconds) of `last_error`.
    pub last_error_at: Option<i64>,
}

/// A view as persisted in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredView {
    pub id: i64,
    pub name: String,
    pub version: u32,
    pub status: ViewStatus,
    /// The definition of the last successful deploy.
    pub definition: Option<ViewDefinition>,
    pub schema_hash: String,
    pub handler_path: String,
    pub schema_name: String,
    pub last_processed_block: u64,
    pub health: ViewHealth,
    pub created_at: i64,
    pub updated_at: i64,
}

/// What the deployer writes to the registry alongside its DDL.
#[derive(Debug, Clone)]
pub struct ViewRegistration {
    pub definition: ViewDefinition,
    pub schema_hash: String,
    pub handler_path: String,
    pub schema_name: String,
    pub status: ViewStatus,
    /// Reset the watermark to 0 and zero the health counters.
    pub reset_progress: bool,
}

/// An incremental change to a view's registry row.
///
/// Counter fields are deltas; `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub status: Option<ViewStatus>,
    pub last_processed_block: Option<u64>,
    pub processed_delta: u64,
    pub errors_delta: u64,
    pub last_error: Option<String>,
}

impl ProgressUpdate {
    /// Advance the watermark to `height` and mark the view active.
    pub fn advance(height: u64) -> Self {
        Self {
            status: Some(ViewStatus::Active),
            last_processed_block: Some(height),
            ..Default::default()
        }
    }

    /// Only change the status.
    pub fn status(status: ViewStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Add handler counters to this update.
    pub fn with_counts(mut self, processed: u64, errors: u64, last_error: Option<String>) -> Self {
        self.processed_delta = processed;
        self.errors_delta = errors;
        self.last_error = last_error;
        self
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
