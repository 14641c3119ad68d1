//! Lock records, acquire options and results.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{clock::elapsed_ms, config::LockConfig, Error};

/// An exclusive claim on a resource, as stored in the assignment store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lock {
    pub resource_id: String,
    pub owner_worker_id: String,
    pub owner_node_id: String,
    pub acquired_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    /// Free-form task context supplied by the owner.
    pub metadata: serde_json::Value,
    /// Per-lock staleness window; the manager-wide threshold applies when unset.
    pub ttl_ms: Option<u64>,
}

impl Lock {
    #[must_use]
    pub fn new(resource_id: &str, owner: &LockOwner, now: DateTime<Utc>, ttl: Option<Duration>) -> Self {
        Self {
            resource_id: resource_id.to_string(),
            owner_worker_id: owner.worker_id.clone(),
            owner_node_id: owner.node_id.clone(),
            acquired_at: now,
            last_heartbeat_at: now,
            metadata: owner.metadata.clone(),
            ttl_ms: ttl.map(duration_ms),
        }
    }

    /// Milliseconds since the owner last heartbeated.
    #[must_use]
    pub fn heartbeat_age_ms(&self, now: DateTime<Utc>) -> u64 {
        elapsed_ms(self.last_heartbeat_at, now)
    }

    /// `now - last_heartbeat_at > threshold`, where the lock's own TTL wins over `default_threshold`.
    #[must_use]
    pub fn is_stale_at(&self, now: DateTime<Utc>, default_threshold: Duration) -> bool {
        let threshold = self.ttl_ms.unwrap_or_else(|| duration_ms(default_threshold));
        self.heartbeat_age_ms(now) > threshold
    }

    #[must_use]
    pub fn is_owned_by(&self, worker_id: &str) -> bool {
        self.owner_worker_id == worker_id
    }
}

/// Identity presented when acquiring.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockOwner {
    pub worker_id: String,
    pub node_id: String,
    pub metadata: serde_json::Value,
}

impl LockOwner {
    #[must_use]
    pub fn new(worker_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            node_id: node_id.into(),
            metadata: serde_json::Value::Null,
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// How `acquire` reacts to a resource that is already owned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AcquireStrategy {
    /// Fail immediately, reporting the current owner.
    FailFast,
    /// Exponential backoff up to `max_retries`.
    Retry,
    /// Take over the lock if its owner stopped heartbeating.
    StealStale,
    /// Delete whatever is there and claim it. Operator tooling only.
    ForceAcquire,
}

/// `StealStale` behaviour when the holder is still live.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum StaleFallback {
    #[default]
    FailFast,
    /// Back off and re-check staleness on each attempt.
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquireOptions {
    pub strategy: AcquireStrategy,
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Overall deadline; short-circuits the backoff schedule.
    pub deadline: Option<Duration>,
    pub stale_fallback: StaleFallback,
    /// Staleness window stored on the lock itself.
    pub ttl: Option<Duration>,
}

impl AcquireOptions {
    /// Options seeded from the lock manager's configuration.
    #[must_use]
    pub fn from_config(strategy: AcquireStrategy, config: &LockConfig) -> Self {
        Self {
            strategy,
            max_retries: config.max_retries,
            initial_backoff: config.initial_backoff(),
            max_backoff: config.max_backoff(),
            deadline: None,
            stale_fallback: config.stale_fallback,
            ttl: None,
        }
    }

    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_stale_fallback(mut self, fallback: StaleFallback) -> Self {
        self.stale_fallback = fallback;
        self
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self::from_config(AcquireStrategy::FailFast, &LockConfig::default())
    }
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct LockResult {
    pub success: bool,
    pub lock: Option<Lock>,
    pub error: Option<Error>,
    /// Retries performed (attempts after the first).
    pub retries: u32,
}

impl LockResult {
    #[must_use]
    pub const fn acquired(lock: Lock, retries: u32) -> Self {
        Self {
            success: true,
            lock: Some(lock),
            error: None,
            retries,
        }
    }

    #[must_use]
    pub const fn failed(error: Error, retries: u32) -> Self {
        Self {
            success: false,
            lock: None,
            error: Some(error),
            retries,
        }
    }
}

/// What `get_status` reports for a resource.
#[derive(Debug, Clone, PartialEq)]
pub enum LockStatus {
    Unlocked,
    Locked(Lock),
    /// Still stored, but the holder missed its heartbeat window.
    Stale(Lock),
}

impl LockStatus {
    #[must_use]
    pub const fn lock(&self) -> Option<&Lock> {
        match self {
            Self::Unlocked => None,
            Self::Locked(lock) | Self::Stale(lock) => Some(lock),
        }
    }

    #[must_use]
    pub const fn is_unlocked(&self) -> bool {
        matches!(self, Self::Unlocked)
    }
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    #[test]
    fn test_lock_is_stale_strictly_after_threshold() {
        let now = Utc::now();
        let owner = LockOwner::new("w1", "n1");
        let lock = Lock::new("r", &owner, now, None);
        let threshold = Duration::from_secs(300);

        assert!(!lock.is_stale_at(now + ChronoDuration::seconds(300), threshold));
        assert!(lock.is_stale_at(now + ChronoDuration::milliseconds(300_001), threshold));
    }

    #[test]
    fn test_lock_ttl_overrides_default_threshold() {
        let now = Utc::now();
        let lock = Lock::new("r", &LockOwner::new("w1", "n1"), now, Some(Duration::from_secs(10)));
        assert!(lock.is_stale_at(now + ChronoDuration::seconds(11), Duration::from_secs(300)));
    }

    #[test]
    fn test_strategy_parses_from_snake_case() -> Result<(), strum::ParseError> {
        assert_eq!("steal_stale".parse::<AcquireStrategy>()?, AcquireStrategy::StealStale);
        assert_eq!(AcquireStrategy::ForceAcquire.to_string(), "force_acquire");
        Ok(())
    }
}
