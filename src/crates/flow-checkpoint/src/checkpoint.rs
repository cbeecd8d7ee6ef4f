//! Checkpoint data structures
//!
//! A [`Checkpoint`] is a complete snapshot of graph state after one
//! superstep: every channel value, per-channel version counters, the
//! versions each node has seen, and the fan-out [`pending
//! sends`](Checkpoint::pending_sends) that were outstanding when the
//! snapshot was taken. Together with [`CheckpointMetadata`] (step number,
//! source, parent lineage) this is everything needed to resume a dropped
//! run, including re-dispatching an interrupted fan-out.
//!
//! Checkpoints are grouped by `thread_id`; a [`CheckpointConfig`] with only
//! a thread id addresses the thread's latest snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Per-channel version counters
pub type ChannelVersions = HashMap<String, i64>;

/// Uncommitted write: `(task_id, channel, value)`
pub type PendingWrite = (String, String, Value);

/// Origin of a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Created from the input of an invoke call (step -1)
    Input,
    /// Created inside the superstep loop
    Loop,
    /// Created from a manual state update
    Update,
    /// Copied from another checkpoint
    Fork,
}

/// Metadata stored alongside a checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub source: CheckpointSource,

    /// -1 for the input checkpoint, then 0, 1, ... per superstep
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,

    /// Checkpoint namespace -> parent checkpoint id
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub parents: HashMap<String, String>,

    /// Additional custom metadata
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl CheckpointMetadata {
    pub fn new(source: CheckpointSource, step: i64) -> Self {
        Self {
            source,
            step: Some(step),
            parents: HashMap::new(),
            extra: HashMap::new(),
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// State snapshot at a superstep boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint format version
    pub v: i32,

    pub id: String,

    pub ts: DateTime<Utc>,

    /// Channel name -> value at snapshot time
    pub channel_values: serde_json::Map<String, Value>,

    pub channel_versions: ChannelVersions,

    /// Node id -> channel versions that node had seen when it last ran
    #[serde(default)]
    pub versions_seen: HashMap<String, ChannelVersions>,

    /// Outstanding fan-out values, re-dispatched on resume. Stored in
    /// adapter-encoded form; see [`crate::adapter`].
    #[serde(default)]
    pub pending_sends: Vec<Value>,
}

impl Checkpoint {
    pub const CURRENT_VERSION: i32 = 1;

    pub fn empty() -> Self {
        Self {
            v: Self::CURRENT_VERSION,
            id: uuid::Uuid::new_v4().to_string(),
            ts: Utc::now(),
            channel_values: serde_json::Map::new(),
            channel_versions: HashMap::new(),
            versions_seen: HashMap::new(),
            pending_sends: Vec::new(),
        }
    }
}

/// Addresses a checkpoint (or a thread's latest one)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub thread_id: String,

    /// Specific snapshot; `None` addresses the thread's latest
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,

    /// Owner scoping carried with every read and write
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

impl CheckpointConfig {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            checkpoint_id: None,
            user_id: None,
        }
    }

    pub fn with_checkpoint_id(mut self, checkpoint_id: impl Into<String>) -> Self {
        self.checkpoint_id = Some(checkpoint_id.into());
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// A checkpoint with its addressing and metadata
#[derive(Debug, Clone)]
pub struct CheckpointTuple {
    pub config: CheckpointConfig,
    pub checkpoint: Checkpoint,
    pub metadata: CheckpointMetadata,
    pub parent_config: Option<CheckpointConfig>,
}
