//! Application error taxonomy
//!
//! Errors recover at the lowest layer that owns the failing resource:
//! connection blips inside the checkpoint saver, tool blips inside the
//! worker, schema blips inside the planner. What reaches this type is only
//! what the caller can act on, and [`IntoResponse`] maps it onto the HTTP
//! boundary. A missing thread and a thread owned by someone else produce
//! the same `NotFound`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    /// Missing or invalid credentials where they are required
    #[error("authentication required")]
    Auth,

    /// Thread absent, or owned by another user (indistinguishable)
    #[error("not found")]
    NotFound,

    /// Malformed request body, unknown tool name, bad parameters
    #[error("validation error: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Graph(#[from] flow_core::GraphError),

    #[error(transparent)]
    Checkpoint(#[from] flow_checkpoint::CheckpointError),

    #[error("storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Storage(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Auth => (StatusCode::UNAUTHORIZED, self.to_string()),
            AppError::NotFound => (StatusCode::NOT_FOUND, "Thread not found".to_string()),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Config(_) | AppError::Storage(_) | AppError::Graph(_) | AppError::Checkpoint(_) => {
                tracing::error!(error = %self, "internal error");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
