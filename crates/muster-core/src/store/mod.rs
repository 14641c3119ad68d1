//! Backing-store contracts.
//!
//! The coordination core never talks to a concrete service. It needs:
//!
//! - [`AssignmentStore`]: create-if-absent / compare-and-delete on named lock
//!   records. Atomicity of these two calls is the only thing that makes lock
//!   ownership exclusive.
//! - [`MemoryBackend`]: plain read / upsert / delete of memory entries with
//!   eventual visibility. Conflicts are detected by vector clock, not by the
//!   backend.
//!
//! Implementations: [`memory`] (process-local, for tests and single-node use)
//! and [`sqlite`] (sqlx, shareable between processes through one database file).

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use memory::{InMemoryAssignmentStore, InMemoryBackend};
pub use sqlite::{SqliteAssignmentStore, SqliteMemoryBackend};

use crate::{coordination::Lock, memory::MemoryEntry, Result};

/// Atomic assignment primitives over lock records.
#[async_trait]
pub trait AssignmentStore: Send + Sync + std::fmt::Debug {
    /// Store `lock` under `key` only if nothing is stored there. `true` on success.
    async fn create_if_absent(&self, key: &str, lock: &Lock) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<Lock>>;

    /// Delete `key` only if its owner is `expected_owner`. `true` if deleted.
    async fn compare_and_delete(&self, key: &str, expected_owner: &str) -> Result<bool>;

    /// Refresh `last_heartbeat_at` if `owner` still holds `key`. `true` if refreshed.
    async fn touch(&self, key: &str, owner: &str, at: DateTime<Utc>) -> Result<bool>;

    /// Unconditional delete. Only `ForceAcquire` uses this.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Storage for replicated memory entries.
#[async_trait]
pub trait MemoryBackend: Send + Sync + std::fmt::Debug {
    async fn get(&self, key: &str) -> Result<Option<MemoryEntry>>;

    /// Insert or replace the entry stored under `entry.key`.
    async fn put(&self, entry: &MemoryEntry) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Remove entries whose TTL elapsed at or before `now`; returns their keys.
    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>>;
}
