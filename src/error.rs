use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown task type: {0}")]
    UnknownTaskType(String),

    #[error("Task type registered twice: {0}")]
    DuplicateTaskType(String),

    #[error("Invalid option '{option}' for node {index}: {reason}")]
    InvalidNodeOption {
        index: usize,
        option: String,
        reason: String,
    },

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Unexpected response shape: {0}")]
    ResponseField(String),

    #[error("Request {method} {url} failed with status {status}: {body}")]
    Request {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("Task {id} ({name}) timed out after {timeout:?}")]
    TaskTimeout {
        id: u64,
        name: String,
        timeout: Duration,
    },

    #[error("Operator balance too low: have {balance}, need {required} (short by {shortfall})")]
    InsufficientBalance {
        balance: u128,
        required: u128,
        shortfall: u128,
    },

    #[error("Transaction {0} reverted")]
    TransactionReverted(String),

    #[error("Timed out waiting for confirmation of transactions: {}", .0.join(", "))]
    ConfirmationTimeout(Vec<String>),

    #[error("Node {index} ({address}) did not discover token network {token} within {timeout:?}")]
    DiscoveryTimeout {
        index: usize,
        address: String,
        token: String,
        timeout: Duration,
    },

    #[error("Node {index} did not become ready within {timeout:?}")]
    NodeNotReady { index: usize, timeout: Duration },

    #[error("Failed to spawn node {index}: {reason}")]
    NodeSpawn { index: usize, reason: String },

    #[error("Node {index} did not stop within {timeout:?}")]
    NodeStop { index: usize, timeout: Duration },

    #[error("Node index {index} out of range (fleet has {count} nodes)")]
    NodeIndex { index: usize, count: usize },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Ledger RPC error: {0}")]
    Rpc(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),
}

impl Error {
    /// Errors caused by the scenario or the player configuration. These are
    /// surfaced verbatim and never retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Error::Config(_)
                | Error::UnknownTaskType(_)
                | Error::DuplicateTaskType(_)
                | Error::InvalidNodeOption { .. }
                | Error::ResponseField(_)
                | Error::NodeIndex { .. }
                | Error::Snapshot(_)
                | Error::TomlParse(_)
        )
    }

    /// Errors that a task with a timeout budget may retry.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Assertion(_) => true,
            Error::Request { status, .. } => *status == 503,
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
