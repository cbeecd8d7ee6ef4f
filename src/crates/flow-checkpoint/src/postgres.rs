//! Postgres checkpoint backend with connection self-healing
//!
//! Two layers, mirroring the failure modes seen behind connection poolers:
//!
//! **Connection management.** One logical `PgConnection`, opened lazily.
//! Poolers and idle timeouts kill long-lived connections from the outside,
//! so the connection is recycled proactively once it is older than
//! `connection_max_age` (default 210 s), and any error whose text matches a
//! known disconnect shape ("connection is closed", "ssl syscall error", ...)
//! triggers reconnect-and-retry, up to 3 attempts for reads and 1 for writes.
//! Schema setup is idempotent and runs at most once per process.
//!
//! **Write serialization.** `put` and `put_writes` take a per-thread lock
//! (lazily created in a [`DashMap`]): parallel workers finishing one
//! conversation serialize their writes, while unrelated conversations stay
//! fully parallel. Reads take no write lock.
//!
//! All values pass through the [`crate::adapter`] on the way in and out.

use crate::adapter;
use crate::checkpoint::{
    ChannelVersions, Checkpoint, CheckpointConfig, CheckpointMetadata, CheckpointTuple,
};
use crate::error::{CheckpointError, Result};
use crate::traits::CheckpointSaver;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::postgres::PgConnection;
use sqlx::{Connection, Row};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default proactive recycle age, tuned to stay under common pooler
/// idle timeouts.
pub const DEFAULT_CONNECTION_MAX_AGE: Duration = Duration::from_secs(210);

const READ_RETRIES: u32 = 3;
const WRITE_RETRIES: u32 = 1;

/// Error-message shapes that mean "the connection died under us"
const CONNECTION_ERROR_NEEDLES: [&str; 6] = [
    "the connection is closed",
    "connection is closed",
    "ssl syscall error",
    "eof detected",
    "connection reset",
    "server closed the connection",
];

struct ConnState {
    conn: PgConnection,
    created_at: Instant,
}

/// Durable checkpoint saver over a single self-healing Postgres connection
pub struct PostgresSaver {
    dsn: String,
    connection_max_age: Duration,
    conn: Mutex<Option<ConnState>>,
    write_locks: DashMap<String, Arc<Mutex<()>>>,
    setup_done: AtomicBool,
}

impl PostgresSaver {
    pub fn new(dsn: impl Into<String>) -> Self {
        Self {
            dsn: dsn.into(),
            connection_max_age: DEFAULT_CONNECTION_MAX_AGE,
            conn: Mutex::new(None),
            write_locks: DashMap::new(),
            setup_done: AtomicBool::new(false),
        }
    }

    pub fn with_connection_max_age(mut self, age: Duration) -> Self {
        self.connection_max_age = age;
        self
    }

    /// Lazily created lock guarding writes for one thread
    fn write_lock(&self, thread_id: &str) -> Arc<Mutex<()>> {
        self.write_locks
            .entry(thread_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn is_connection_error(err: &CheckpointError) -> bool {
        let msg = err.to_string().to_lowercase();
        CONNECTION_ERROR_NEEDLES.iter().any(|n| msg.contains(n))
    }

    /// Open a connection, or replace one that outlived its max age.
    /// Must be called with the connection mutex held.
    async fn ensure_fresh(&self, slot: &mut Option<ConnState>) -> Result<()> {
        let age = slot.as_ref().map(|s| s.created_at.elapsed());
        if let Some(age) = age {
            if age > self.connection_max_age {
                info!(
                    age_secs = age.as_secs(),
                    "recycling checkpoint connection past max age"
                );
                if let Some(state) = slot.take() {
                    let _ = state.conn.close().await;
                }
            }
        }
        if slot.is_none() {
            let conn = PgConnection::connect(&self.dsn).await?;
            *slot = Some(ConnState {
                conn,
                created_at: Instant::now(),
            });
            if !self.setup_done.load(Ordering::Acquire) {
                let state = slot.as_mut().expect("just connected");
                self.setup(&mut state.conn).await?;
                self.setup_done.store(true, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Drop the current connection so the next access reconnects.
    async fn invalidate(&self) {
        let mut slot = self.conn.lock().await;
        if let Some(state) = slot.take() {
            let _ = state.conn.close().await;
        }
    }

    async fn setup(&self, conn: &mut PgConnection) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id     text NOT NULL,
                checkpoint_id text NOT NULL,
                parent_id     text,
                user_id       text,
                checkpoint    jsonb NOT NULL,
                metadata      jsonb NOT NULL,
                created_at    timestamptz NOT NULL DEFAULT now(),
                PRIMARY KEY (thread_id, checkpoint_id)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS checkpoints_thread_created_idx
                ON checkpoints (thread_id, created_at DESC)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS checkpoint_writes (
                thread_id  text NOT NULL,
                task_id    text NOT NULL,
                channel    text NOT NULL,
                value      jsonb NOT NULL,
                idx        integer NOT NULL,
                created_at timestamptz NOT NULL DEFAULT now()
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS checkpoint_writes_thread_idx
                ON checkpoint_writes (thread_id, task_id)
            "#,
        ];
        for sql in statements {
            sqlx::query(sql).execute(&mut *conn).await?;
        }
        debug!("checkpoint schema ready");
        Ok(())
    }

    fn encode_checkpoint(checkpoint: &Checkpoint) -> Result<Value> {
        let encoded = Checkpoint {
            v: checkpoint.v,
            id: checkpoint.id.clone(),
            ts: checkpoint.ts,
            channel_values: adapter::encode_channel_values(&checkpoint.channel_values),
            channel_versions: checkpoint.channel_versions.clone(),
            versions_seen: checkpoint.versions_seen.clone(),
            pending_sends: adapter::encode_pending_sends(&checkpoint.pending_sends),
        };
        Ok(serde_json::to_value(encoded)?)
    }

    fn decode_checkpoint(value: Value) -> Result<Checkpoint> {
        let mut checkpoint: Checkpoint = serde_json::from_value(value)?;
        checkpoint.channel_values = adapter::decode_channel_values(&checkpoint.channel_values);
        checkpoint.pending_sends = adapter::decode_pending_sends(&checkpoint.pending_sends);
        Ok(checkpoint)
    }

    async fn try_put(
        &self,
        config: &CheckpointConfig,
        checkpoint_id: &str,
        parent_id: Option<&str>,
        checkpoint_json: &Value,
        metadata_json: &Value,
    ) -> Result<()> {
        let mut slot = self.conn.lock().await;
        self.ensure_fresh(&mut slot).await?;
        let state = slot.as_mut().expect("connection ensured");
        sqlx::query(
            r#"
            INSERT INTO checkpoints (thread_id, checkpoint_id, parent_id, user_id, checkpoint, metadata)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (thread_id, checkpoint_id)
            DO UPDATE SET checkpoint = excluded.checkpoint, metadata = excluded.metadata
            "#,
        )
        .bind(&config.thread_id)
        .bind(checkpoint_id)
        .bind(parent_id)
        .bind(&config.user_id)
        .bind(checkpoint_json)
        .bind(metadata_json)
        .execute(&mut state.conn)
        .await?;
        Ok(())
    }

    async fn try_get(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let mut slot = self.conn.lock().await;
        self.ensure_fresh(&mut slot).await?;
        let state = slot.as_mut().expect("connection ensured");

        let row = match &config.checkpoint_id {
            Some(checkpoint_id) => {
                sqlx::query(
                    r#"
                    SELECT checkpoint_id, parent_id, checkpoint, metadata
                    FROM checkpoints
                    WHERE thread_id = $1 AND checkpoint_id = $2
                      AND ($3::text IS NULL OR user_id IS NULL OR user_id = $3)
                    "#,
                )
                .bind(&config.thread_id)
                .bind(checkpoint_id)
                .bind(&config.user_id)
                .fetch_optional(&mut state.conn)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    SELECT checkpoint_id, parent_id, checkpoint, metadata
                    FROM checkpoints
                    WHERE thread_id = $1
                      AND ($2::text IS NULL OR user_id IS NULL OR user_id = $2)
                    ORDER BY created_at DESC, checkpoint_id DESC
                    LIMIT 1
                    "#,
                )
                .bind(&config.thread_id)
                .bind(&config.user_id)
                .fetch_optional(&mut state.conn)
                .await?
            }
        };

        let Some(row) = row else {
            return Ok(None);
        };

        let checkpoint_id: String = row.try_get("checkpoint_id")?;
        let parent_id: Option<String> = row.try_get("parent_id")?;
        let checkpoint = Self::decode_checkpoint(row.try_get::<Value, _>("checkpoint")?)?;
        let metadata: CheckpointMetadata =
            serde_json::from_value(row.try_get::<Value, _>("metadata")?)?;

        Ok(Some(CheckpointTuple {
            config: CheckpointConfig {
                thread_id: config.thread_id.clone(),
                checkpoint_id: Some(checkpoint_id),
                user_id: config.user_id.clone(),
            },
            checkpoint,
            metadata,
            parent_config: parent_id.map(|id| {
                CheckpointConfig::new(&config.thread_id).with_checkpoint_id(id)
            }),
        }))
    }

    async fn try_put_writes(
        &self,
        config: &CheckpointConfig,
        writes: &[(String, Value)],
        task_id: &str,
    ) -> Result<()> {
        let mut slot = self.conn.lock().await;
        self.ensure_fresh(&mut slot).await?;
        let state = slot.as_mut().expect("connection ensured");
        for (idx, (channel, value)) in writes.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO checkpoint_writes (thread_id, task_id, channel, value, idx)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(&config.thread_id)
            .bind(task_id)
            .bind(channel)
            .bind(adapter::to_jsonable(value))
            .bind(idx as i32)
            .execute(&mut state.conn)
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl CheckpointSaver for PostgresSaver {
    async fn get_tuple(&self, config: &CheckpointConfig) -> Result<Option<CheckpointTuple>> {
        let mut attempt = 0;
        loop {
            match self.try_get(config).await {
                Ok(result) => return Ok(result),
                Err(err) if Self::is_connection_error(&err) && attempt < READ_RETRIES => {
                    warn!(error = %err, attempt, "checkpoint read hit a dead connection, reconnecting");
                    self.invalidate().await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn put(
        &self,
        config: &CheckpointConfig,
        checkpoint: Checkpoint,
        metadata: CheckpointMetadata,
        _new_versions: ChannelVersions,
    ) -> Result<CheckpointConfig> {
        let checkpoint_id = checkpoint.id.clone();
        let parent_id = metadata.parents.get("").cloned();
        let checkpoint_json = Self::encode_checkpoint(&checkpoint)?;
        let metadata_json = adapter::encode_metadata(&metadata);

        let lock = self.write_lock(&config.thread_id);
        let _guard = lock.lock().await;

        let mut attempt = 0;
        let mut use_fallback = false;
        loop {
            let meta = if use_fallback {
                adapter::fallback_metadata(&metadata)
            } else {
                metadata_json.clone()
            };
            match self
                .try_put(config, &checkpoint_id, parent_id.as_deref(), &checkpoint_json, &meta)
                .await
            {
                Ok(()) => {
                    return Ok(CheckpointConfig {
                        thread_id: config.thread_id.clone(),
                        checkpoint_id: Some(checkpoint_id),
                        user_id: config.user_id.clone(),
                    });
                }
                Err(err) if Self::is_connection_error(&err) && attempt < WRITE_RETRIES => {
                    warn!(error = %err, "checkpoint write hit a dead connection, reconnecting");
                    self.invalidate().await;
                    attempt += 1;
                }
                Err(err) if !use_fallback => {
                    // one more try with the allow-list metadata before giving up
                    warn!(error = %err, "checkpoint write rejected, retrying with fallback metadata");
                    use_fallback = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn put_writes(
        &self,
        config: &CheckpointConfig,
        writes: Vec<(String, Value)>,
        task_id: String,
    ) -> Result<()> {
        let lock = self.write_lock(&config.thread_id);
        let _guard = lock.lock().await;

        let mut attempt = 0;
        loop {
            match self.try_put_writes(config, &writes, &task_id).await {
                Ok(()) => return Ok(()),
                Err(err) if Self::is_connection_error(&err) && attempt < WRITE_RETRIES => {
                    warn!(error = %err, "pending-write insert hit a dead connection, reconnecting");
                    self.invalidate().await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        let mut slot = self.conn.lock().await;
        self.ensure_fresh(&mut slot).await?;
        let state = slot.as_mut().expect("connection ensured");
        sqlx::query("DELETE FROM checkpoint_writes WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&mut state.conn)
            .await?;
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&mut state.conn)
            .await?;
        Ok(())
    }
}
