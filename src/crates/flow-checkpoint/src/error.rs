//! Checkpoint error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Database-level failure that survived reconnect retries
    #[error("storage error: {0}")]
    Storage(String),

    /// Value could not be converted to or from its persisted form
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Malformed configuration or checkpoint shape
    #[error("invalid checkpoint data: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, CheckpointError>;

impl From<serde_json::Error> for CheckpointError {
    fn from(err: serde_json::Error) -> Self {
        CheckpointError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for CheckpointError {
    fn from(err: sqlx::Error) -> Self {
        CheckpointError::Storage(err.to_string())
    }
}
