//! Persistent store (C3): SQLite-backed job table and metadata counters.
//!
//! One process, one database file. Schema is created idempotently on
//! startup; there is no external migration tool.

use crate::error::{ProxyError, Result};
use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{FromRow, Row, SqlitePool};
use std::str::FromStr;
use tracing::{event, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Translating,
    Done,
    Failed,
}

impl JobStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Translating => "translating",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    fn from_str_or_pending(s: &str) -> Self {
        match s {
            "translating" => Self::Translating,
            "done" => Self::Done,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    pub id: String,
    pub video_id: String,
    pub lang: String,
    pub track: String,
    pub fmt: String,
    pub source_hash: String,
    pub source_body: String,
    pub source_format: String,
    status: String,
    pub retry_count: i64,
    pub next_retry_at: Option<i64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub bilingual: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub expires_at: i64,
}

impl JobRow {
    pub fn status(&self) -> JobStatus {
        JobStatus::from_str_or_pending(&self.status)
    }
}

/// Key identifying one translation job / cache entry, per the request key
/// described in the data model.
#[derive(Debug, Clone)]
pub struct RequestKey {
    pub video_id: String,
    pub lang: String,
    pub track: String,
    pub fmt: String,
}

pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{db_path}"))
            .map_err(ProxyError::Store)?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.apply_pragmas().await?;
        store.run_migrations().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.apply_pragmas().await?;
        store.run_migrations().await?;
        Ok(store)
    }

    async fn apply_pragmas(&self) -> Result<()> {
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA foreign_keys=ON")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                video_id TEXT NOT NULL,
                lang TEXT NOT NULL,
                track TEXT NOT NULL,
                fmt TEXT NOT NULL,
                source_hash TEXT NOT NULL,
                source_body TEXT NOT NULL,
                source_format TEXT NOT NULL,
                status TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                next_retry_at INTEGER,
                error_code TEXT,
                error_message TEXT,
                bilingual TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                UNIQUE(video_id, lang, track, fmt, source_hash)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_status_retry ON jobs(status, next_retry_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_expires_at ON jobs(expires_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_video_id ON jobs(video_id)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS metadata (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
        )
        .execute(&self.pool)
        .await?;

        event!(Level::DEBUG, "store migrations applied");
        Ok(())
    }

    /// Find an existing job row for this request key and source hash, if any.
    pub async fn find_job(&self, key: &RequestKey, source_hash: &str) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE video_id = ? AND lang = ? AND track = ? AND fmt = ? AND source_hash = ?",
        )
        .bind(&key.video_id)
        .bind(&key.lang)
        .bind(&key.track)
        .bind(&key.fmt)
        .bind(source_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Find the most recent `done` job for a request key, ignoring source hash
    /// (used by the LRU fallback path when the in-memory entry was evicted).
    pub async fn find_latest_done(&self, key: &RequestKey, now_ms: i64) -> Result<Option<JobRow>> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE video_id = ? AND lang = ? AND track = ? AND fmt = ? \
             AND status = 'done' AND expires_at >= ? ORDER BY updated_at DESC LIMIT 1",
        )
        .bind(&key.video_id)
        .bind(&key.lang)
        .bind(&key.track)
        .bind(&key.fmt)
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Create a new pending job, unless one already exists for this
    /// (RequestKey, sourceHash), in which case the existing row is returned.
    /// `source_body`/`source_format` are kept so a retry can reconstruct the
    /// cue list without the original request.
    pub async fn create_job(
        &self,
        key: &RequestKey,
        source_hash: &str,
        source_body: &str,
        source_format: &str,
        ttl_ms: i64,
    ) -> Result<JobRow> {
        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, video_id, lang, track, fmt, source_hash, source_body,
                               source_format, status, retry_count, next_retry_at,
                               created_at, updated_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'pending', 0, NULL, ?, ?, ?)
            ON CONFLICT (video_id, lang, track, fmt, source_hash) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&key.video_id)
        .bind(&key.lang)
        .bind(&key.track)
        .bind(&key.fmt)
        .bind(source_hash)
        .bind(source_body)
        .bind(source_format)
        .bind(now)
        .bind(now)
        .bind(now + ttl_ms)
        .execute(&self.pool)
        .await?;

        self.find_job(key, source_hash)
            .await?
            .ok_or_else(|| ProxyError::Store(sqlx::Error::RowNotFound))
    }

    pub async fn mark_translating(&self, id: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query("UPDATE jobs SET status = 'translating', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_done(&self, id: &str, bilingual: &str) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            "UPDATE jobs SET status = 'done', bilingual = ?, error_code = NULL, \
             error_message = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(bilingual)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Record a failed attempt. `next_retry_at` is `Some` iff another attempt
    /// remains (retry_count stays below `max_retries` after this failure).
    pub async fn mark_failed(
        &self,
        id: &str,
        error_code: &str,
        error_message: &str,
        retry_count: i64,
        next_retry_at: Option<i64>,
    ) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let status = if next_retry_at.is_some() {
            "pending"
        } else {
            "failed"
        };
        sqlx::query(
            "UPDATE jobs SET status = ?, retry_count = ?, next_retry_at = ?, \
             error_code = ?, error_message = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(retry_count)
        .bind(next_retry_at)
        .bind(error_code)
        .bind(error_message)
        .bind(now)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Scan for jobs due for a retry attempt (status=pending, next_retry_at
    /// elapsed) or freshly created (next_retry_at NULL).
    pub async fn scan_due(&self, now_ms: i64, limit: i64) -> Result<Vec<JobRow>> {
        let rows = sqlx::query_as::<_, JobRow>(
            "SELECT * FROM jobs WHERE status = 'pending' \
             AND (next_retry_at IS NULL OR next_retry_at <= ?) \
             ORDER BY created_at ASC LIMIT ?",
        )
        .bind(now_ms)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Delete expired rows. Returns the number of rows removed.
    pub async fn cleanup_expired(&self, now_ms: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE expires_at < ?")
            .bind(now_ms)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn increment_counter(&self, key: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO metadata (key, value) VALUES (?, '1') \
             ON CONFLICT(key) DO UPDATE SET value = CAST(CAST(value AS INTEGER) + 1 AS TEXT)",
        )
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn read_counter(&self, key: &str) -> Result<u64> {
        let row = sqlx::query("SELECT value FROM metadata WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .and_then(|r| r.get::<String, _>("value").parse::<u64>().ok())
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RequestKey {
        RequestKey {
            video_id: "abc123".into(),
            lang: "zh-CN".into(),
            track: "asr".into(),
            fmt: "json3".into(),
        }
    }

    #[tokio::test]
    async fn creates_and_finds_a_job() {
        let store = Store::connect_in_memory().await.unwrap();
        let job = store.create_job(&key(), "hash1", "WEBVTT\n\n1\n00:00:00.000 --> 00:00:01.000\nhi\n\n", "vtt", 3_600_000).await.unwrap();
        assert_eq!(job.status(), JobStatus::Pending);

        let found = store.find_job(&key(), "hash1").await.unwrap().unwrap();
        assert_eq!(found.id, job.id);
    }

    #[tokio::test]
    async fn create_job_is_idempotent_on_conflict() {
        let store = Store::connect_in_memory().await.unwrap();
        let first = store.create_job(&key(), "hash1", "WEBVTT\n\n1\n00:00:00.000 --> 00:00:01.000\nhi\n\n", "vtt", 3_600_000).await.unwrap();
        let second = store.create_job(&key(), "hash1", "WEBVTT\n\n1\n00:00:00.000 --> 00:00:01.000\nhi\n\n", "vtt", 3_600_000).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn marks_done_and_reads_bilingual() {
        let store = Store::connect_in_memory().await.unwrap();
        let job = store.create_job(&key(), "hash1", "WEBVTT\n\n1\n00:00:00.000 --> 00:00:01.000\nhi\n\n", "vtt", 3_600_000).await.unwrap();
        store.mark_done(&job.id, "WEBVTT\n\n").await.unwrap();
        let found = store.find_job(&key(), "hash1").await.unwrap().unwrap();
        assert_eq!(found.status(), JobStatus::Done);
        assert_eq!(found.bilingual.as_deref(), Some("WEBVTT\n\n"));
    }

    #[tokio::test]
    async fn mark_failed_with_retry_keeps_status_pending() {
        let store = Store::connect_in_memory().await.unwrap();
        let job = store.create_job(&key(), "hash1", "WEBVTT\n\n1\n00:00:00.000 --> 00:00:01.000\nhi\n\n", "vtt", 3_600_000).await.unwrap();
        store
            .mark_failed(&job.id, "translation_error", "boom", 1, Some(9999))
            .await
            .unwrap();
        let found = store.find_job(&key(), "hash1").await.unwrap().unwrap();
        assert_eq!(found.status(), JobStatus::Pending);
        assert_eq!(found.retry_count, 1);
    }

    #[tokio::test]
    async fn mark_failed_without_retry_is_terminal() {
        let store = Store::connect_in_memory().await.unwrap();
        let job = store.create_job(&key(), "hash1", "WEBVTT\n\n1\n00:00:00.000 --> 00:00:01.000\nhi\n\n", "vtt", 3_600_000).await.unwrap();
        store
            .mark_failed(&job.id, "translation_error", "boom", 3, None)
            .await
            .unwrap();
        let found = store.find_job(&key(), "hash1").await.unwrap().unwrap();
        assert_eq!(found.status(), JobStatus::Failed);
    }

    #[tokio::test]
    async fn cleanup_removes_expired_rows() {
        let store = Store::connect_in_memory().await.unwrap();
        let job = store.create_job(&key(), "hash1", "WEBVTT\n\n1\n00:00:00.000 --> 00:00:01.000\nhi\n\n", "vtt", -1000).await.unwrap();
        let now = Utc::now().timestamp_millis();
        let removed = store.cleanup_expired(now).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.find_job(&key(), "hash1").await.unwrap().is_none());
        let _ = job;
    }

    #[tokio::test]
    async fn counters_increment_independently() {
        let store = Store::connect_in_memory().await.unwrap();
        store.increment_counter("cache_hits").await.unwrap();
        store.increment_counter("cache_hits").await.unwrap();
        store.increment_counter("cache_misses").await.unwrap();
        assert_eq!(store.read_counter("cache_hits").await.unwrap(), 2);
        assert_eq!(store.read_counter("cache_misses").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn scan_due_returns_pending_jobs_whose_retry_has_elapsed() {
        let store = Store::connect_in_memory().await.unwrap();
        let job = store.create_job(&key(), "hash1", "WEBVTT\n\n1\n00:00:00.000 --> 00:00:01.000\nhi\n\n", "vtt", 3_600_000).await.unwrap();
        store
            .mark_failed(&job.id, "translation_error", "boom", 1, Some(0))
            .await
            .unwrap();
        let due = store.scan_due(Utc::now().timestamp_millis(), 10).await.unwrap();
        assert_eq!(due.len(), 1);
    }
}
