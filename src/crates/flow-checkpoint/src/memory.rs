//! In-memory checkpoint storage
//!
//! Development and test backend: full [`CheckpointSaver`] semantics over a
//! process-local map, no durability. Production runs use
//! [`PostgresSaver`](crate::postgres::PostgresSaver); startup falls back to
//! this saver only when no DSN is configured, and says so loudly.

use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
    PendingWrite,
};
use crate::error::Result;
use crate::traits::CheckpointSaver;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Entry {
    checkpoint: Checkpoint,
    metadata: CheckpointMetadata,
    writes: Vec<PendingWrite>,
}

/// Thread-safe in-memory saver
#[derive(Default)]
pub struct InMemorySaver {
    threads: RwLock<HashMap<String, Vec<Entry>>>,
}

impl InMemorySaver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of checkpoints stored for a thread
    pub fn checkpoint_count(&self, thread_id: &str) -> usize {
        self.threads
            .read()
            .get(thread_id)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Number of distinct threads tracked
    pub fn thread_count(&self) -> usize {
        self.threads.read().len()
    }

    /// Pending writes recorded for a thread, in arrival order
    pub fn writes_for(&self, thread_id: &str) -> Vec<PendingWrite> {
        self.threads
            .read()
            .get(thread_id)
            .map(|entries| entries.iter().flat_map(|e| e.writes.clone()).collect())
            .unwrap_or_default()
    }

    /// Drop everything (test isolation)
    pub fn clear(&self) {
        self.threads.write().clear();
    }
}

#[async_trait]
impl CheckpointSaver for InMemorySaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let threads = self.threads.read();
        let entries = match threads.get(&config.thread_id) {
            Some(entries) if !entries.is_empty() => entries,
            _ => return Ok(None),
        };
        let entry = match &config.checkpoint_id {
            Some(id) => entries.iter().find(|e| &e.checkpoint.id == id),
            None => entries.last(),
        };
        Ok(entry.map(|e| {
            let parent_config = e
                .metadata
                .parents
                .get("")
                .map(|parent| CheckpointConfig::new(&config.thread_id).with_checkpoint_id(parent));
            CheckpointTuple {
                config: CheckpointConfig {
                    thread_id: config.thread_id.clone(),
                    checkpoint_id: Some(e.checkpoint.id.clone()),
                    user_id: config.user_id.clone(),
                },
                checkpoint: e.checkpoint.clone(),
                metadata: e.metadata.clone(),
                parent_config,
            }
        }))
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let stored = CheckpointConfig {
            thread_id: config.thread_id.clone(),
            checkpoint_id: Some(checkpoint.id.clone()),
            user_id: config.user_id.clone(),
        };
        self.threads
            .write()
            .entry(config.thread_id.clone())
            .or_default()
            .push(Entry {
                checkpoint,
                metadata,
                writes: Vec::new(),
            });
        Ok(stored)
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: String,
    ) -> Result<()> {
        let mut threads = self.threads.write();
        let entries = threads.entry(config.thread_id.clone()).or_default();
        // writes arriving before the first checkpoint get a placeholder entry
        if entries.is_empty() {
            entries.push(Entry {
                checkpoint: Checkpoint::empty(),
                metadata: CheckpointMetadata::new(
                    crate::checkpoint::CheckpointSource::Input,
                    -1,
                ),
                writes: Vec::new(),
            });
        }
        let entry = entries.last_mut().expect("just ensured non-empty");
        for (channel, value) in writes {
            entry.writes.push((task_id.clone(), channel, value));
        }
        Ok(())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.threads.write().remove(thread_id);
        Ok(())
    }
}
