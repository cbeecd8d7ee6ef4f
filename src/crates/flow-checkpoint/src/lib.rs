//! # flow-checkpoint: state persistence for graph runs
//!
//! A checkpoint is a snapshot of graph state captured after each superstep,
//! keyed by `(thread_id, checkpoint_id)`. Persisting it, including the
//! outstanding fan-out sends, lets a conversation survive dropped
//! connections and process restarts: the runner reloads the latest snapshot
//! and picks up exactly where the previous run stopped.
//!
//! Two backends implement the [`CheckpointSaver`] trait:
//!
//! - [`InMemorySaver`]: development and tests; no durability.
//! - [`PostgresSaver`]: production; a single self-healing connection with
//!   proactive age-based recycling, reconnect-and-retry on disconnect
//!   shapes, and per-thread write locks so parallel workers in one
//!   conversation serialize while separate conversations stay parallel.
//!
//! The [`adapter`] module defines the tagged JSON wire format shared by all
//! durable backends.

pub mod adapter;
pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointSource,
    CheckpointTuple, PendingWrite,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemorySaver;
pub use postgres::{PostgresSaver, DEFAULT_CONNECTION_MAX_AGE};
pub use traits::CheckpointSaver;
