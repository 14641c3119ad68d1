//! `SQLite`-backed stores.
//!
//! Atomicity comes from single statements: `INSERT ... ON CONFLICT DO NOTHING`
//! for create-if-absent and `DELETE ... WHERE owner = ?` for compare-and-delete.
//! Several processes can share one database file; each opens its own pool.

use std::{str::FromStr, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

use super::{AssignmentStore, MemoryBackend};
use crate::{coordination::Lock, memory::MemoryEntry, Error, Result};

/// Open a pool on `url`, creating the database file if missing.
pub async fn connect(url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(url)?
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    Ok(pool)
}

/// Single-connection in-memory pool; every connection of a `:memory:` pool
/// would otherwise see its own empty database.
pub async fn connect_in_memory() -> Result<SqlitePool> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    Ok(pool)
}

fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc))
}

fn ms_to_sql(ms: Option<u64>) -> Option<i64> {
    ms.and_then(|v| i64::try_from(v).ok())
}

fn ms_from_sql(ms: Option<i64>) -> Option<u64> {
    ms.and_then(|v| u64::try_from(v).ok())
}

// ═══════════════════════════════════════════════════════════════════════════
// ASSIGNMENT STORE
// ═══════════════════════════════════════════════════════════════════════════

type LockRow = (String, String, String, String, String, String, Option<i64>);

/// Lock records in an `assignments` table.
#[derive(Debug, Clone)]
pub struct SqliteAssignmentStore {
    db: SqlitePool,
}

impl SqliteAssignmentStore {
    #[must_use]
    pub const fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn open(url: &str) -> Result<Self> {
        let store = Self::new(connect(url).await?);
        store.init().await?;
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let store = Self::new(connect_in_memory().await?);
        store.init().await?;
        Ok(store)
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Create the assignments table.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS assignments (
                key TEXT PRIMARY KEY,
                owner_worker_id TEXT NOT NULL,
                owner_node_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                last_heartbeat_at TEXT NOT NULL,
                metadata TEXT NOT NULL,
                ttl_ms INTEGER
            )",
        )
        .execute(&self.db)
        .await
        .map_err(|e| Error::backend(format!("Failed to create assignments table: {e}")))?;
        Ok(())
    }

    fn decode(row: LockRow) -> Result<Lock> {
        let (resource_id, owner_worker_id, owner_node_id, acquired, heartbeat, metadata, ttl_ms) = row;
        Ok(Lock {
            resource_id,
            owner_worker_id,
            owner_node_id,
            acquired_at: parse_ts(&acquired)?,
            last_heartbeat_at: parse_ts(&heartbeat)?,
            metadata: serde_json::from_str(&metadata)?,
            ttl_ms: ms_from_sql(ttl_ms),
        })
    }
}

#[async_trait]
impl AssignmentStore for SqliteAssignmentStore {
    async fn create_if_absent(&self, key: &str, lock: &Lock) -> Result<bool> {
        let metadata = serde_json::to_string(&lock.metadata)?;
        let result = sqlx::query(
            "INSERT INTO assignments
                (key, owner_worker_id, owner_node_id, acquired_at, last_heartbeat_at, metadata, ttl_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(key) DO NOTHING",
        )
        .bind(key)
        .bind(&lock.owner_worker_id)
        .bind(&lock.owner_node_id)
        .bind(format_ts(lock.acquired_at))
        .bind(format_ts(lock.last_heartbeat_at))
        .bind(metadata)
        .bind(ms_to_sql(lock.ttl_ms))
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<Lock>> {
        let row: Option<LockRow> = sqlx::query_as(
            "SELECT key, owner_worker_id, owner_node_id, acquired_at, last_heartbeat_at, metadata, ttl_ms
             FROM assignments WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        row.map(Self::decode).transpose()
    }

    async fn compare_and_delete(&self, key: &str, expected_owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM assignments WHERE key = ?1 AND owner_worker_id = ?2")
            .bind(key)
            .bind(expected_owner)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch(&self, key: &str, owner: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE assignments SET last_heartbeat_at = ?1 WHERE key = ?2 AND owner_worker_id = ?3",
        )
        .bind(format_ts(at))
        .bind(key)
        .bind(owner)
        .execute(&self.db)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM assignments WHERE key = ?1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY BACKEND
// ═══════════════════════════════════════════════════════════════════════════

type EntryRow = (String, String, String, String, String, Option<i64>);

/// Memory entries in a `memory_entries` table.
#[derive(Debug, Clone)]
pub struct SqliteMemoryBackend {
    db: SqlitePool,
}

impl SqliteMemoryBackend {
    #[must_use]
    pub const fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub async fn open(url: &str) -> Result<Self> {
        let backend = Self::new(connect(url).await?);
        backend.init().await?;
        Ok(backend)
    }

    pub async fn open_in_memory() -> Result<Self> {
        let backend = Self::new(connect_in_memory().await?);
        backend.init().await?;
        Ok(backend)
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS memory_entries (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                vector_clock TEXT NOT NULL,
                writer_worker_id TEXT NOT NULL,
                written_at TEXT NOT NULL,
                ttl_ms INTEGER,
                expires_at TEXT
            )",
        )
        .execute(&self.db)
        .await
        .map_err(|e| Error::backend(format!("Failed to create memory_entries table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_memory_entries_expires_at
             ON memory_entries(expires_at) WHERE expires_at IS NOT NULL",
        )
        .execute(&self.db)
        .await
        .map_err(|e| Error::backend(format!("Failed to create expiry index: {e}")))?;
        Ok(())
    }

    fn decode(row: EntryRow) -> Result<MemoryEntry> {
        let (key, value, clock, writer_worker_id, written_at, ttl_ms) = row;
        Ok(MemoryEntry {
            key,
            value: serde_json::from_str(&value)?,
            vector_clock: serde_json::from_str(&clock)?,
            writer_worker_id,
            written_at: parse_ts(&written_at)?,
            ttl_ms: ms_from_sql(ttl_ms),
        })
    }
}

#[async_trait]
impl MemoryBackend for SqliteMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<MemoryEntry>> {
        let row: Option<EntryRow> = sqlx::query_as(
            "SELECT key, value, vector_clock, writer_worker_id, written_at, ttl_ms
             FROM memory_entries WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.db)
        .await?;
        row.map(Self::decode).transpose()
    }

    async fn put(&self, entry: &MemoryEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO memory_entries
                (key, value, vector_clock, writer_worker_id, written_at, ttl_ms, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                vector_clock = excluded.vector_clock,
                writer_worker_id = excluded.writer_worker_id,
                written_at = excluded.written_at,
                ttl_ms = excluded.ttl_ms,
                expires_at = excluded.expires_at",
        )
        .bind(&entry.key)
        .bind(serde_json::to_string(&entry.value)?)
        .bind(serde_json::to_string(&entry.vector_clock)?)
        .bind(&entry.writer_worker_id)
        .bind(format_ts(entry.written_at))
        .bind(ms_to_sql(entry.ttl_ms))
        .bind(entry.expires_at().map(format_ts))
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM memory_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM memory_entries
             WHERE substr(key, 1, length(?1)) = ?1
             ORDER BY key ASC",
        )
        .bind(prefix)
        .fetch_all(&self.db)
        .await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        let cutoff = format_ts(now);
        let mut tx = self.db.begin().await?;

        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT key FROM memory_entries
             WHERE expires_at IS NOT NULL AND expires_at <= ?1
             ORDER BY key ASC",
        )
        .bind(&cutoff)
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM memory_entries WHERE expires_at IS NOT NULL AND expires_at <= ?1")
            .bind(&cutoff)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(rows.into_iter().map(|(k,)| k).collect())
    }
}
