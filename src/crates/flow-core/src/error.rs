//! Error types for graph construction and execution

use thiserror::Error;

/// Errors produced while building or running a graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// A node executor returned an error; the run is aborted
    #[error("node '{node}' failed: {message}")]
    Node { node: String, message: String },

    /// A conditional edge routed to a node that does not exist
    #[error("unknown node '{0}'")]
    UnknownNode(String),

    /// The graph structure is invalid (dangling edge, missing entry, ...)
    #[error("invalid graph: {0}")]
    Validation(String),

    /// The superstep limit was reached without reaching END
    #[error("recursion limit of {0} supersteps reached")]
    RecursionLimit(usize),

    /// Checkpoint persistence failed after the saver's own retries
    #[error(transparent)]
    Checkpoint(#[from] flow_checkpoint::CheckpointError),

    /// LLM provider failure surfaced through a node
    #[error("llm error: {0}")]
    Llm(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GraphError>;

impl GraphError {
    /// Wrap an arbitrary node failure, keeping the node name for diagnostics.
    pub fn node(node: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Node {
            node: node.into(),
            message: err.to_string(),
        }
    }
}
