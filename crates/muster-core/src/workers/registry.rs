//! Worker registry with heartbeat-derived health.
//!
//! Records live in a persistent map behind a `RwLock`, so listing takes a
//! cheap snapshot instead of holding the lock while health is recomputed.

use std::{collections::BTreeSet, sync::Arc};

use tokio::{
    sync::{watch, RwLock},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};
use uuid::Uuid;

use super::types::{CapacityRecord, DiscoveryFilter, HealthStatus, HeartbeatMetrics, HeartbeatPayload, Worker, WorkerMetrics};
use crate::{
    clock::{self, elapsed_ms, Clock},
    config::RegistryConfig,
    Error, Result,
};

/// Tracks worker liveness, load and performance.
#[derive(Debug, Clone)]
pub struct WorkerRegistry {
    workers: Arc<RwLock<im::HashMap<String, Worker>>>,
    config: RegistryConfig,
    clock: Arc<dyn Clock>,
}

impl WorkerRegistry {
    /// # Errors
    ///
    /// `InvalidConfig` if `config` does not validate.
    pub fn new(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            workers: Arc::new(RwLock::new(im::HashMap::new())),
            config,
            clock: clock::system(),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn health_of(&self, worker: &Worker) -> HealthStatus {
        HealthStatus::from_age(elapsed_ms(worker.last_heartbeat_at, self.clock.now()), &self.config)
    }

    /// Copy of `worker` with its health recomputed.
    fn view(&self, worker: &Worker) -> Worker {
        let mut w = worker.clone();
        w.health_status = self.health_of(worker);
        w
    }

    /// Apply `f` to a stored worker and return the updated view.
    async fn mutate<F>(&self, worker_id: &str, f: F) -> Result<Worker>
    where
        F: FnOnce(&mut Worker),
    {
        let mut workers = self.workers.write().await;
        let worker = workers
            .get_mut(worker_id)
            .ok_or_else(|| Error::not_found(format!("worker {worker_id}")))?;
        f(worker);
        let updated = self.view(worker);
        drop(workers);
        Ok(updated)
    }

    /// Register a new worker and return its record.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if `max_concurrency` is zero.
    pub async fn register<I, S>(&self, node_id: &str, capabilities: I, max_concurrency: u32) -> Result<Worker>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        if max_concurrency == 0 {
            return Err(Error::invalid_config("max_concurrency must be > 0"));
        }
        let now = self.clock.now();
        let worker = Worker {
            id: format!("worker-{}", Uuid::new_v4()),
            node_id: node_id.to_string(),
            capabilities: capabilities.into_iter().map(Into::into).collect::<BTreeSet<_>>(),
            max_concurrency,
            current_load: 0,
            health_status: HealthStatus::Healthy,
            last_heartbeat_at: now,
            registered_at: now,
            metrics: WorkerMetrics::default(),
        };

        self.workers.write().await.insert(worker.id.clone(), worker.clone());
        tracing::info!(
            worker_id = %worker.id,
            node_id = %node_id,
            max_concurrency,
            capabilities = ?worker.capabilities,
            "Worker registered"
        );
        Ok(worker)
    }

    /// Record a heartbeat from `worker_id`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the worker was never registered or has been swept;
    /// the worker must register again.
    pub async fn heartbeat(&self, worker_id: &str) -> Result<Worker> {
        let now = self.clock.now();
        self.mutate(worker_id, |w| w.last_heartbeat_at = now).await
    }

    /// Adjust `current_load` by `delta`, clamped to `[0, max_concurrency]`.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown worker.
    pub async fn update_task_count(&self, worker_id: &str, delta: i64) -> Result<Worker> {
        self.mutate(worker_id, |w| w.current_load = clamp_load(w.current_load, delta, w.max_concurrency))
            .await
    }

    /// Record a finished task and drop the worker's load by one.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown worker.
    pub async fn record_completion(&self, worker_id: &str, success: bool, duration_ms: u64) -> Result<Worker> {
        let worker = self
            .mutate(worker_id, |w| {
                w.metrics.record(success, duration_ms);
                w.current_load = clamp_load(w.current_load, -1, w.max_concurrency);
            })
            .await?;
        tracing::debug!(
            worker_id = %worker_id,
            success,
            duration_ms,
            average_ms = worker.metrics.average_task_duration_ms,
            "Task completion recorded"
        );
        Ok(worker)
    }

    /// Workers matching `filter`, sorted by id. Empty when nothing matches.
    pub async fn discover(&self, filter: &DiscoveryFilter) -> Vec<Worker> {
        self.list()
            .await
            .into_iter()
            .filter(|w| filter.matches(w))
            .collect()
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown worker.
    pub async fn get(&self, worker_id: &str) -> Result<Worker> {
        let workers = self.workers.read().await;
        workers
            .get(worker_id)
            .map(|w| self.view(w))
            .ok_or_else(|| Error::not_found(format!("worker {worker_id}")))
    }

    /// Every worker, sorted by id.
    pub async fn list(&self) -> Vec<Worker> {
        let snapshot = self.workers.read().await.clone();
        let mut all: Vec<Worker> = snapshot.values().map(|w| self.view(w)).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown worker.
    pub async fn unregister(&self, worker_id: &str) -> Result<Worker> {
        let removed = self
            .workers
            .write()
            .await
            .remove(worker_id)
            .ok_or_else(|| Error::not_found(format!("worker {worker_id}")))?;
        tracing::info!(worker_id = %worker_id, "Worker unregistered");
        Ok(removed)
    }

    /// Remove every `Unhealthy` worker; returns the removed ids.
    pub async fn sweep(&self) -> Vec<String> {
        let mut workers = self.workers.write().await;
        let mut dead: Vec<String> = workers
            .values()
            .filter(|w| self.health_of(w) == HealthStatus::Unhealthy)
            .map(|w| w.id.clone())
            .collect();
        dead.sort_unstable();
        for id in &dead {
            workers.remove(id);
        }
        drop(workers);

        for id in &dead {
            tracing::info!(worker_id = %id, "Swept unhealthy worker");
        }
        dead
    }

    /// Run [`sweep`](Self::sweep) every `sweep_interval` until `shutdown` reads `true`.
    #[must_use]
    pub fn spawn_sweeper(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let registry = self.clone();
        let period = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = registry.sweep().await;
                        if !removed.is_empty() {
                            tracing::debug!(count = removed.len(), "Registry sweep finished");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("Registry sweeper stopped");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Build the heartbeat payload `worker_id` publishes.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown worker.
    pub async fn heartbeat_payload(&self, worker_id: &str, current_tasks: Vec<String>) -> Result<HeartbeatPayload> {
        let worker = self.get(worker_id).await?;
        let now = self.clock.now();
        Ok(HeartbeatPayload {
            worker_id: worker.id.clone(),
            timestamp: now,
            health_status: worker.health_status,
            current_tasks,
            capacity_available: worker.available_capacity(),
            metrics: HeartbeatMetrics {
                cpu_usage: None,
                memory_usage: None,
                tasks_completed: worker.metrics.tasks_completed,
                tasks_failed: worker.metrics.tasks_failed,
                uptime_sec: elapsed_ms(worker.registered_at, now) / 1000,
            },
        })
    }

    /// Apply a heartbeat received from another process.
    ///
    /// Older payloads never move `last_heartbeat_at` backwards.
    ///
    /// # Errors
    ///
    /// `NotFound` if the worker is not registered here.
    pub async fn observe_heartbeat(&self, payload: &HeartbeatPayload) -> Result<Worker> {
        self.observe_worker(payload, None).await
    }

    /// As [`observe_heartbeat`](Self::observe_heartbeat), registering the
    /// worker from `capacity` when this registry has not seen it yet.
    ///
    /// # Errors
    ///
    /// `NotFound` if the worker is unknown and `capacity` is `None`;
    /// `InvalidConfig` if `capacity` advertises zero concurrency.
    pub async fn observe_worker(&self, payload: &HeartbeatPayload, capacity: Option<&CapacityRecord>) -> Result<Worker> {
        let mut workers = self.workers.write().await;
        if let Some(worker) = workers.get_mut(&payload.worker_id) {
            if payload.timestamp > worker.last_heartbeat_at {
                worker.last_heartbeat_at = payload.timestamp;
                worker.current_load = worker.max_concurrency.saturating_sub(payload.capacity_available);
            }
            return Ok(self.view(worker));
        }

        let capacity = capacity.ok_or_else(|| Error::not_found(format!("worker {}", payload.worker_id)))?;
        if capacity.max_concurrency == 0 {
            return Err(Error::invalid_config("max_concurrency must be > 0"));
        }
        let worker = Worker {
            id: payload.worker_id.clone(),
            node_id: capacity.node_id.clone(),
            capabilities: capacity.capabilities.clone(),
            max_concurrency: capacity.max_concurrency,
            current_load: capacity.max_concurrency.saturating_sub(payload.capacity_available),
            health_status: payload.health_status,
            last_heartbeat_at: payload.timestamp,
            // First sighting here, not the worker's own registration time.
            registered_at: payload.timestamp,
            metrics: WorkerMetrics {
                tasks_completed: payload.metrics.tasks_completed,
                tasks_failed: payload.metrics.tasks_failed,
                average_task_duration_ms: 0.0,
            },
        };
        workers.insert(worker.id.clone(), worker.clone());
        drop(workers);

        tracing::info!(
            worker_id = %worker.id,
            node_id = %worker.node_id,
            max_concurrency = worker.max_concurrency,
            "Worker discovered through shared memory"
        );
        Ok(self.view(&worker))
    }
}

fn clamp_load(current: u32, delta: i64, max: u32) -> u32 {
    let next = i64::from(current).saturating_add(delta).clamp(0, i64::from(max));
    u32::try_from(next).unwrap_or(max)
}
