//! # flow-core: graph execution engine
//!
//! Executes directed graphs of async nodes over a JSON state object under
//! **superstep semantics**: in each superstep all scheduled nodes run
//! concurrently, their partial states merge through per-field reducers, and
//! the next superstep is derived from static edges and conditional routers.
//! Conditional routers may fan out with [`Send`] values that seed the next
//! superstep with a fresh input per task.
//!
//! A checkpoint is persisted after every superstep through the
//! [`flow_checkpoint::CheckpointSaver`] the graph was compiled with, so a run
//! that dies mid fan-out resumes with its outstanding sends intact.
//!
//! ```rust,no_run
//! use flow_core::{Graph, RunConfig, ChannelKind, END};
//! use flow_checkpoint::InMemorySaver;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut graph = Graph::new();
//! graph.add_channel("log", ChannelKind::ClearableList);
//! graph.add_node("greet", |_| async move { Ok(json!({"log": ["hello"]})) });
//! graph.set_entry("greet");
//! graph.add_edge("greet", END);
//!
//! let runner = graph.compile(Arc::new(InMemorySaver::new()))?;
//! let state = runner
//!     .invoke(json!({}), &RunConfig::new("thread-1", None))
//!     .await?;
//! assert_eq!(state["log"][0], "hello");
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod error;
pub mod graph;
pub mod llm;
pub mod messages;
pub mod runner;
pub mod send;

pub use channel::{ChannelKind, ListUpdate};
pub use error::{GraphError, Result};
pub use graph::{Graph, NodeId, END, START};
pub use messages::{
    add_messages, last_human_text, ContentPart, Message, MessageContent, MessageRole, ToolCall,
};
pub use runner::{RunConfig, Runner, StepEvent};
pub use send::{RouteResult, Send};
