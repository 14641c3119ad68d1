//! Replicated memory entries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{coordination::types::duration_ms, vector_clock::VectorClock};

/// One versioned value in shared memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub vector_clock: VectorClock,
    pub writer_worker_id: String,
    /// Wall-clock write time; only used to break ties between concurrent writes.
    pub written_at: DateTime<Utc>,
    pub ttl_ms: Option<u64>,
}

impl MemoryEntry {
    #[must_use]
    pub fn new(
        key: impl Into<String>,
        value: serde_json::Value,
        vector_clock: VectorClock,
        writer_worker_id: impl Into<String>,
        written_at: DateTime<Utc>,
        ttl: Option<Duration>,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            vector_clock,
            writer_worker_id: writer_worker_id.into(),
            written_at,
            ttl_ms: ttl.map(duration_ms),
        }
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.ttl_ms.and_then(|ms| {
            i64::try_from(ms)
                .ok()
                .and_then(|ms| self.written_at.checked_add_signed(chrono::Duration::milliseconds(ms)))
        })
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|at| at <= now)
    }

    /// Newer by wall clock, ties broken by writer id so every replica agrees.
    #[must_use]
    pub fn is_newer_than(&self, other: &Self) -> bool {
        (self.written_at, &self.writer_worker_id) > (other.written_at, &other.writer_worker_id)
    }
}
