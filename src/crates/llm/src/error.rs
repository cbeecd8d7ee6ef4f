//! Provider error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("missing configuration: {0}")]
    MissingConfig(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("provider returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("could not parse provider response: {0}")]
    Parse(String),
}

pub type Result<T> = std::result::Result<T, LlmError>;

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        LlmError::Http(err.to_string())
    }
}

impl From<LlmError> for flow_core::GraphError {
    fn from(err: LlmError) -> Self {
        flow_core::GraphError::Llm(err.to_string())
    }
}
