//! # finch: conversational retrieval backend
//!
//! A single user turn becomes a checkpointed graph run: intent detection,
//! a structured multi-stage plan, parallel fan-out across heterogeneous
//! retrieval workers (relational, vector, knowledge graph), staged fan-in
//! and merging, and a grounded answer streamed to the client over SSE.
//! Per-conversation state persists through the checkpoint saver, so runs
//! survive dropped connections and recycled database connections.
//!
//! Crate layout:
//! - [`graph`]: the turn graph (intent, planner, orchestrator, workers,
//!   aggregator, writer)
//! - [`state`]: channel layout and evidence records
//! - [`streaming`]: SSE events and the per-thread callback registry
//! - [`store`]: thread/message persistence
//! - [`api`]: axum routes, auth middleware, the SSE producer
//! - [`retrieval`]: interfaces to the external retrieval backends

pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod graph;
pub mod retrieval;
pub mod state;
pub mod store;
pub mod streaming;

pub use config::{PlannerMethod, Provider, Settings};
pub use context::AppContext;
pub use error::{AppError, Result};
