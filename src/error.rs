//! Error taxonomy for the activity pipeline.
use crate::broker::BrokerError;
use crate::config::ConfigError;
use thiserror::Error;

/// Result type alias using the pipeline [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input, rejected before any side effect. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),
    /// User validation returned false or could not complete (fails closed).
    #[error("invalid user: {0}")]
    InvalidUser(String),
    #[error("activity not found: {0}")]
    NotFound(String),
    /// Transaction or query failure; creation is all-or-nothing.
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    /// Broker refused or could not accept a publish. Retried by the
    /// publisher, never surfaced to the original caller.
    #[error("delivery failed: {0}")]
    Delivery(#[from] BrokerError),
    /// Retry budget exhausted; the entry is parked as a dead letter.
    #[error("outbox entry {entry_id} dead-lettered after {attempts} attempts")]
    DeadLetter { entry_id: i64, attempts: i32 },
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}
