//! Append-only per-user conversation history
//!
//! Threads and their messages live in a relational store behind the
//! [`ThreadStore`] trait, pooled and separate from the checkpointer's
//! dedicated connection. Every read and write is row-filtered by the
//! authenticated `user_id`; a thread owned by someone else looks exactly
//! like a thread that does not exist.
//!
//! [`MemoryThreadStore`] backs development deployments and tests.

use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use url::Url;
use uuid::Uuid;

/// One persisted conversation message
#[derive(Debug, Clone, Serialize)]
pub struct StoredMessage {
    pub id: String,
    pub role: String,
    pub content: Value,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait ThreadStore: Send + Sync {
    /// Idempotent upsert; bumps `updated_at` when the thread exists.
    async fn ensure_thread(&self, thread_id: &str, user_id: Option<&str>) -> Result<()>;

    /// Insert a message and bump the thread atomically. Returns the new
    /// message id.
    async fn insert_message(
        &self,
        thread_id: &str,
        role: &str,
        content: &Value,
        user_id: Option<&str>,
    ) -> Result<String>;

    /// `None` when the thread is absent or not owned by `user_id`.
    async fn load_messages(
        &self,
        thread_id: &str,
        user_id: Option<&str>,
    ) -> Result<Option<Vec<StoredMessage>>>;

    async fn delete_thread(&self, thread_id: &str, user_id: Option<&str>) -> Result<()>;

    async fn touch_thread(&self, thread_id: &str, user_id: Option<&str>) -> Result<()>;

    async fn get_thread_owner(&self, thread_id: &str) -> Result<Option<String>>;
}

/// Normalize a DSN for the driver:
/// - `postgresql+psycopg://` and `postgres+psycopg://` scheme prefixes
///   become the canonical `postgresql://`;
/// - libpq-only keepalive query params are dropped, everything else
///   (`sslmode`, `application_name`, ...) is preserved.
pub fn normalize_dsn(dsn: &str) -> String {
    let dsn = if let Some(rest) = dsn.strip_prefix("postgresql+psycopg://") {
        format!("postgresql://{rest}")
    } else if let Some(rest) = dsn.strip_prefix("postgres+psycopg://") {
        format!("postgresql://{rest}")
    } else {
        dsn.to_string()
    };
    let Ok(mut url) = Url::parse(&dsn) else {
        // best effort: hand the original to the driver
        return dsn;
    };
    const LIBPQ_ONLY: [&str; 4] = [
        "keepalives",
        "keepalives_idle",
        "keepalives_interval",
        "keepalives_count",
    ];
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| !LIBPQ_ONLY.contains(&k.as_ref()))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if kept.is_empty() {
        url.set_query(None);
    } else {
        let mut pairs = url.query_pairs_mut();
        pairs.clear();
        for (k, v) in &kept {
            pairs.append_pair(k, v);
        }
        drop(pairs);
    }
    url.to_string()
}

/// Postgres-backed store
pub struct PgThreadStore {
    pool: PgPool,
}

impl PgThreadStore {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .min_connections(1)
            .max_connections(5)
            .connect(&normalize_dsn(dsn))
            .await?;
        let store = Self { pool };
        store.setup().await?;
        Ok(store)
    }

    async fn setup(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS threads (
                id         text PRIMARY KEY,
                user_id    text,
                created_at timestamptz NOT NULL DEFAULT now(),
                updated_at timestamptz NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS thread_messages (
                id         text PRIMARY KEY,
                thread_id  text NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                user_id    text,
                role       text NOT NULL,
                content    jsonb NOT NULL,
                created_at timestamptz NOT NULL DEFAULT now()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS thread_messages_thread_idx
                ON thread_messages (thread_id, created_at)
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ThreadStore for PgThreadStore {
    async fn ensure_thread(&self, thread_id: &str, user_id: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO threads (id, user_id) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
                SET updated_at = now(),
                    user_id = coalesce(threads.user_id, excluded.user_id)
            "#,
        )
        .bind(thread_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_message(
        &self,
        thread_id: &str,
        role: &str,
        content: &Value,
        user_id: Option<&str>,
    ) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO threads (id, user_id) VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE
                SET updated_at = now(),
                    user_id = coalesce(threads.user_id, excluded.user_id)
            "#,
        )
        .bind(thread_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            r#"
            INSERT INTO thread_messages (id, thread_id, user_id, role, content)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&message_id)
        .bind(thread_id)
        .bind(user_id)
        .bind(role)
        .bind(content)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE threads SET updated_at = now() WHERE id = $1")
            .bind(thread_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(message_id)
    }

    async fn load_messages(
        &self,
        thread_id: &str,
        user_id: Option<&str>,
    ) -> Result<Option<Vec<StoredMessage>>> {
        let Some(user_id) = user_id else {
            return Ok(None);
        };
        let owner: Option<String> = sqlx::query("SELECT user_id FROM threads WHERE id = $1")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?
            .and_then(|row| row.try_get("user_id").ok());
        if owner.as_deref() != Some(user_id) {
            return Ok(None);
        }

        let rows = sqlx::query(
            r#"
            SELECT tm.id, tm.role, tm.content, tm.created_at
            FROM thread_messages tm
            JOIN threads t ON t.id = tm.thread_id
            WHERE tm.thread_id = $1 AND t.user_id = $2
            ORDER BY tm.created_at ASC, tm.id ASC
            "#,
        )
        .bind(thread_id)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .into_iter()
            .map(|row| {
                Ok(StoredMessage {
                    id: row.try_get("id")?,
                    role: row.try_get("role")?,
                    content: row.try_get("content")?,
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .map_err(AppError::from)?;
        Ok(Some(messages))
    }

    async fn delete_thread(&self, thread_id: &str, user_id: Option<&str>) -> Result<()> {
        sqlx::query("DELETE FROM threads WHERE id = $1 AND user_id = $2")
            .bind(thread_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn touch_thread(&self, thread_id: &str, user_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE threads SET updated_at = now() WHERE id = $1 AND user_id = $2")
            .bind(thread_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_thread_owner(&self, thread_id: &str) -> Result<Option<String>> {
        let owner = sqlx::query("SELECT user_id FROM threads WHERE id = $1")
            .bind(thread_id)
            .fetch_optional(&self.pool)
            .await?
            .and_then(|row| row.try_get("user_id").ok());
        Ok(owner)
    }
}

#[derive(Debug, Clone)]
struct ThreadEntry {
    user_id: Option<String>,
    messages: Vec<StoredMessage>,
    updated_at: DateTime<Utc>,
}

/// In-memory store for development and tests
#[derive(Default)]
pub struct MemoryThreadStore {
    threads: DashMap<String, ThreadEntry>,
}

impl MemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ThreadStore for MemoryThreadStore {
    async fn ensure_thread(&self, thread_id: &str, user_id: Option<&str>) -> Result<()> {
        self.threads
            .entry(thread_id.to_string())
            .and_modify(|entry| {
                entry.updated_at = Utc::now();
                if entry.user_id.is_none() {
                    entry.user_id = user_id.map(str::to_string);
                }
            })
            .or_insert_with(|| ThreadEntry {
                user_id: user_id.map(str::to_string),
                messages: Vec::new(),
                updated_at: Utc::now(),
            });
        Ok(())
    }

    async fn insert_message(
        &self,
        thread_id: &str,
        role: &str,
        content: &Value,
        user_id: Option<&str>,
    ) -> Result<String> {
        self.ensure_thread(thread_id, user_id).await?;
        let message_id = Uuid::new_v4().to_string();
        if let Some(mut entry) = self.threads.get_mut(thread_id) {
            entry.messages.push(StoredMessage {
                id: message_id.clone(),
                role: role.to_string(),
                content: content.clone(),
                created_at: Utc::now(),
            });
            entry.updated_at = Utc::now();
        }
        Ok(message_id)
    }

    async fn load_messages(
        &self,
        thread_id: &str,
        user_id: Option<&str>,
    ) -> Result<Option<Vec<StoredMessage>>> {
        let Some(user_id) = user_id else {
            return Ok(None);
        };
        Ok(self.threads.get(thread_id).and_then(|entry| {
            if entry.user_id.as_deref() == Some(user_id) {
                Some(entry.messages.clone())
            } else {
                None
            }
        }))
    }

    async fn delete_thread(&self, thread_id: &str, user_id: Option<&str>) -> Result<()> {
        let owned = self
            .threads
            .get(thread_id)
            .map(|entry| entry.user_id.as_deref() == user_id)
            .unwrap_or(false);
        if owned {
            self.threads.remove(thread_id);
        }
        Ok(())
    }

    async fn touch_thread(&self, thread_id: &str, user_id: Option<&str>) -> Result<()> {
        if let Some(mut entry) = self.threads.get_mut(thread_id) {
            if entry.user_id.as_deref() == user_id {
                entry.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn get_thread_owner(&self, thread_id: &str) -> Result<Option<String>> {
        Ok(self
            .threads
            .get(thread_id)
            .and_then(|entry| entry.user_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_dsn_scheme_prefix() {
        assert_eq!(
            normalize_dsn("postgresql+psycopg://u:p@host:5432/db"),
            "postgresql://u:p@host:5432/db"
        );
        assert_eq!(
            normalize_dsn("postgresql://u:p@host/db"),
            "postgresql://u:p@host/db"
        );
    }

    #[test]
    fn test_normalize_dsn_strips_keepalive_params() {
        let dsn = "postgresql://u@host/db?sslmode=require&keepalives=1&keepalives_idle=30&application_name=finch";
        let normalized = normalize_dsn(dsn);
        assert!(normalized.contains("sslmode=require"));
        assert!(normalized.contains("application_name=finch"));
        assert!(!normalized.contains("keepalives"));
    }

    #[test]
    fn test_normalize_dsn_drops_empty_query() {
        let normalized = normalize_dsn("postgresql://u@host/db?keepalives=1");
        assert_eq!(normalized, "postgresql://u@host/db");
    }

    #[tokio::test]
    async fn test_memory_store_owner_isolation() {
        let store = MemoryThreadStore::new();
        store.ensure_thread("t1", Some("alice")).await.unwrap();
        store
            .insert_message("t1", "user", &json!({"content": "hi"}), Some("alice"))
            .await
            .unwrap();

        let mine = store.load_messages("t1", Some("alice")).await.unwrap();
        assert_eq!(mine.unwrap().len(), 1);

        // another user sees nothing, and so does an anonymous caller
        assert!(store.load_messages("t1", Some("bob")).await.unwrap().is_none());
        assert!(store.load_messages("t1", None).await.unwrap().is_none());
        assert!(store
            .load_messages("missing", Some("alice"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_memory_store_delete_requires_owner() {
        let store = MemoryThreadStore::new();
        store.ensure_thread("t1", Some("alice")).await.unwrap();

        store.delete_thread("t1", Some("bob")).await.unwrap();
        assert_eq!(
            store.get_thread_owner("t1").await.unwrap().as_deref(),
            Some("alice")
        );

        store.delete_thread("t1", Some("alice")).await.unwrap();
        assert!(store.get_thread_owner("t1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_store_message_order() {
        let store = MemoryThreadStore::new();
        for i in 0..3 {
            store
                .insert_message("t1", "user", &json!({"content": i}), Some("alice"))
                .await
                .unwrap();
        }
        let messages = store.load_messages("t1", Some("alice")).await.unwrap().unwrap();
        let contents: Vec<_> = messages.iter().map(|m| m.content["content"].clone()).collect();
        assert_eq!(contents, vec![json!(0), json!(1), json!(2)]);
    }
}
