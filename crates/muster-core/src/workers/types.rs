//! Worker records, health bands and heartbeat payloads.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::config::RegistryConfig;

/// Liveness derived from heartbeat age. Never stored as ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    /// Past the unhealthy threshold; removed by the next sweep.
    Unhealthy,
}

impl HealthStatus {
    /// Band for a heartbeat `age_ms` old.
    #[must_use]
    pub const fn from_age(age_ms: u64, config: &RegistryConfig) -> Self {
        if age_ms < config.healthy_threshold_ms {
            Self::Healthy
        } else if age_ms < config.unhealthy_threshold_ms {
            Self::Degraded
        } else {
            Self::Unhealthy
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    /// Cumulative mean over every recorded completion, failed ones included.
    pub average_task_duration_ms: f64,
}

impl WorkerMetrics {
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.tasks_completed.saturating_add(self.tasks_failed)
    }

    /// Success ratio; `1.0` with no history.
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 1.0,
            total => self.tasks_completed as f64 / total as f64,
        }
    }

    pub(crate) fn record(&mut self, success: bool, duration_ms: u64) {
        if success {
            self.tasks_completed = self.tasks_completed.saturating_add(1);
        } else {
            self.tasks_failed = self.tasks_failed.saturating_add(1);
        }
        let n = self.total() as f64;
        self.average_task_duration_ms += (duration_ms as f64 - self.average_task_duration_ms) / n;
    }
}

/// A registered worker as seen by readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub node_id: String,
    pub capabilities: BTreeSet<String>,
    pub max_concurrency: u32,
    pub current_load: u32,
    /// Recomputed from `last_heartbeat_at` on every read.
    pub health_status: HealthStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    pub registered_at: DateTime<Utc>,
    pub metrics: WorkerMetrics,
}

impl Worker {
    #[must_use]
    pub const fn available_capacity(&self) -> u32 {
        self.max_concurrency.saturating_sub(self.current_load)
    }

    /// `current_load / max_concurrency`.
    #[must_use]
    pub fn load_ratio(&self) -> f64 {
        if self.max_concurrency == 0 {
            return 1.0;
        }
        f64::from(self.current_load) / f64::from(self.max_concurrency)
    }

    /// Whether this worker offers every capability in `required`.
    #[must_use]
    pub fn has_capabilities<S: AsRef<str>>(&self, required: &[S]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c.as_ref()))
    }
}

/// Heartbeat record published by a worker and broadcast through memory sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatPayload {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub health_status: HealthStatus,
    pub current_tasks: Vec<String>,
    pub capacity_available: u32,
    pub metrics: HeartbeatMetrics,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_usage: Option<f64>,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub uptime_sec: u64,
}

/// Published next to a worker's heartbeat. Carries what a peer process needs
/// to register the worker from shared memory alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityRecord {
    pub node_id: String,
    pub capabilities: BTreeSet<String>,
    pub max_concurrency: u32,
    pub current_load: u32,
    pub available: u32,
}

impl CapacityRecord {
    #[must_use]
    pub fn of(worker: &Worker) -> Self {
        Self {
            node_id: worker.node_id.clone(),
            capabilities: worker.capabilities.clone(),
            max_concurrency: worker.max_concurrency,
            current_load: worker.current_load,
            available: worker.available_capacity(),
        }
    }
}

/// Criteria for [`WorkerRegistry::discover`](super::WorkerRegistry::discover).
///
/// An empty filter matches every worker.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryFilter {
    pub capabilities: Vec<String>,
    /// Allowed health bands; `None` allows all.
    pub health_status: Option<Vec<HealthStatus>>,
    pub min_available_capacity: u32,
}

impl DiscoveryFilter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capabilities<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities = capabilities.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_health(mut self, allowed: &[HealthStatus]) -> Self {
        self.health_status = Some(allowed.to_vec());
        self
    }

    #[must_use]
    pub const fn with_min_available_capacity(mut self, capacity: u32) -> Self {
        self.min_available_capacity = capacity;
        self
    }

    #[must_use]
    pub fn matches(&self, worker: &Worker) -> bool {
        worker.has_capabilities(&self.capabilities)
            && self
                .health_status
                .as_ref()
                .map_or(true, |allowed| allowed.contains(&worker.health_status))
            && worker.available_capacity() >= self.min_available_capacity
    }
}
