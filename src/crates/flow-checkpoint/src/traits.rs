//! The [`CheckpointSaver`] storage trait

use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

/// Interface implemented by checkpoint storage backends.
///
/// The engine calls [`put`](Self::put) after every superstep and
/// [`put_writes`](Self::put_writes) for each task's pending writes before
/// they merge. Implementations must be `Send + Sync`; concurrent writes to
/// the *same* thread must be observed as a total order, writes to distinct
/// threads may overlap.
#[async_trait]
pub trait CheckpointSaver: Send + Sync {
    /// Fetch just the checkpoint addressed by `config`.
    async fn get(&self, config: &CheckpointConfig) -> Result<Option<Checkpoint>> {
        Ok(self.get_tuple(config).await?.map(|t| t.checkpoint))
    }

    /// Fetch the checkpoint with its metadata. With no `checkpoint_id` the
    /// thread's latest snapshot is returned; `Ok(None)` when the thread has
    /// no checkpoints.
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>>;

    /// Persist a checkpoint. Returns the config of the stored snapshot
    /// (with its checkpoint id filled in).
    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig>;

    /// Persist a task's pending channel writes, linked to the thread's
    /// current checkpoint position.
    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: String,
    ) -> Result<()>;

    /// Drop every checkpoint and pending write of a thread.
    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let _ = thread_id;
        Ok(())
    }
}
