//! The `error` module defines the error types shared across `bigfan`.
//!
//! `BrokerError` covers storage, serialization and transport failures that
//! propagate out of queue operations. `ValidationError` and `PublishError`
//! are the two outcomes the ingestion gateway turns into `400` responses.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown queue '{0}'")]
    UnknownQueue(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<sled::transaction::TransactionError<BrokerError>> for BrokerError {
    fn from(err: sled::transaction::TransactionError<BrokerError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => BrokerError::Storage(e),
        }
    }
}

impl From<tungstenite::Error> for BrokerError {
    fn from(err: tungstenite::Error) -> Self {
        BrokerError::Transport(err.to_string())
    }
}

/// Malformed ingestion payload. Never retried server-side.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("request body is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("request body must be a JSON object")]
    NotAnObject,

    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid field '{field}': {reason}")]
    InvalidField { field: &'static str, reason: String },
}

/// Structured failure of a single publish call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PublishError {
    #[error("no subscription accepted the message")]
    NoMatchingSubscription,

    #[error("{} subscription(s) failed to enqueue, {delivered} delivered", .failed.len())]
    PartialFailure {
        /// `(subscription, error)` for every branch that failed.
        failed: Vec<(String, String)>,
        delivered: usize,
    },
}
