//! Per-process wiring of every coordination component.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    balancer::{LoadBalancer, Selection, TaskDescriptor},
    clock::{self, Clock},
    config::CoreConfig,
    coordination::LockManager,
    memory::{keys, ChangeEvent, ChangeKind, FlushReport, MemoryListener, MemorySyncManager},
    store::{AssignmentStore, MemoryBackend},
    taskregistry::TaskRegistry,
    workers::{CapacityRecord, DiscoveryFilter, HealthStatus, HeartbeatPayload, WorkerRegistry},
    Error, Result,
};

/// How long background loops get to stop on their own during shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Feeds heartbeats seen in shared memory into the local registry.
///
/// A worker published by another process is registered here from its
/// capacity record the first time its heartbeat arrives.
#[derive(Debug)]
struct HeartbeatListener {
    registry: WorkerRegistry,
    memory: MemorySyncManager,
}

impl HeartbeatListener {
    async fn capacity_of(&self, worker_id: &str) -> Option<CapacityRecord> {
        let key = keys::worker_capacity(self.memory.root(), worker_id);
        match self.memory.read_as(&key).await {
            Ok(capacity) => capacity,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "Could not read worker capacity");
                None
            }
        }
    }
}

#[async_trait]
impl MemoryListener for HeartbeatListener {
    async fn on_change(&self, event: &ChangeEvent) {
        let (ChangeKind::Written, Some(value)) = (event.kind, &event.value) else {
            return;
        };
        let payload: HeartbeatPayload = match serde_json::from_value(value.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(key = %event.key, error = %e, "Malformed heartbeat payload");
                return;
            }
        };
        let capacity = self.capacity_of(&payload.worker_id).await;
        match self.registry.observe_worker(&payload, capacity.as_ref()).await {
            Ok(_) => {}
            Err(Error::NotFound(_)) => {
                tracing::debug!(worker_id = %payload.worker_id, "Heartbeat without a capacity record");
            }
            Err(e) => tracing::warn!(worker_id = %payload.worker_id, error = %e, "Could not apply heartbeat"),
        }
    }
}

/// Lock manager, worker registry, load balancer and memory sync for one process.
#[derive(Debug)]
pub struct CoordinationCore {
    config: CoreConfig,
    locks: LockManager,
    registry: WorkerRegistry,
    balancer: LoadBalancer,
    memory: MemorySyncManager,
    tasks: TaskRegistry,
    started: AtomicBool,
}

impl CoordinationCore {
    /// Build every component from `config`. `process_id` identifies this
    /// process as a memory writer and must be unique across the deployment.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if any section of `config` does not validate.
    pub fn new(
        config: CoreConfig,
        store: Arc<dyn AssignmentStore>,
        backend: Arc<dyn MemoryBackend>,
        process_id: &str,
    ) -> Result<Self> {
        Self::with_clock(config, store, backend, process_id, clock::system())
    }

    /// As [`new`](Self::new), with every component reading `clock`.
    ///
    /// # Errors
    ///
    /// As [`new`](Self::new).
    pub fn with_clock(
        config: CoreConfig,
        store: Arc<dyn AssignmentStore>,
        backend: Arc<dyn MemoryBackend>,
        process_id: &str,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let locks = LockManager::new(store, config.lock)?.with_clock(Arc::clone(&clock));
        let registry = WorkerRegistry::new(config.registry)?.with_clock(Arc::clone(&clock));
        let balancer = LoadBalancer::new(config.balancer)?;
        let memory = MemorySyncManager::new(process_id, config.root.as_str(), config.memory, backend, locks.clone())?
            .with_clock(clock);

        Ok(Self {
            config,
            locks,
            registry,
            balancer,
            memory,
            tasks: TaskRegistry::new(),
            started: AtomicBool::new(false),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &CoreConfig {
        &self.config
    }

    #[must_use]
    pub const fn locks(&self) -> &LockManager {
        &self.locks
    }

    #[must_use]
    pub const fn registry(&self) -> &WorkerRegistry {
        &self.registry
    }

    #[must_use]
    pub const fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    #[must_use]
    pub const fn memory(&self) -> &MemorySyncManager {
        &self.memory
    }

    /// Spawn the sweeper, flush timer, remote poller and dispatcher, and
    /// subscribe the registry to heartbeats in shared memory, so workers
    /// published by other processes become selectable here. Calling it
    /// again is a no-op.
    ///
    /// # Errors
    ///
    /// `InvalidPattern` if `root` makes the heartbeat pattern invalid.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let signal = self.tasks.shutdown_signal();

        self.memory.subscribe(
            &keys::all_worker_heartbeats(&self.config.root),
            Arc::new(HeartbeatListener {
                registry: self.registry.clone(),
                memory: self.memory.clone(),
            }),
        )?;
        self.tasks.register(self.registry.spawn_sweeper(signal.clone())).await;
        self.tasks.register_all(self.memory.start(&signal)).await;

        tracing::info!(
            root = %self.config.root,
            process_id = %self.memory.worker_id(),
            tasks = self.tasks.task_count().await,
            "Coordination core started"
        );
        Ok(())
    }

    /// Record a heartbeat for a local worker and publish it to shared memory.
    ///
    /// Capacity, heartbeat and status keys expire after the unhealthy
    /// threshold, so a dead worker's keys age out with it. The capacity key
    /// is written first so a peer has it by the time the heartbeat arrives.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown worker; flush errors if the write fills the batch.
    pub async fn publish_heartbeat(&self, worker_id: &str, current_tasks: Vec<String>) -> Result<HeartbeatPayload> {
        let worker = self.registry.heartbeat(worker_id).await?;
        let payload = self.registry.heartbeat_payload(worker_id, current_tasks).await?;
        let root = &self.config.root;
        let ttl = Some(Duration::from_millis(self.config.registry.unhealthy_threshold_ms));

        self.memory
            .write_as(&keys::worker_capacity(root, worker_id), &CapacityRecord::of(&worker), ttl)
            .await?;
        self.memory
            .write_as(&keys::worker_heartbeat(root, worker_id), &payload, ttl)
            .await?;
        self.memory
            .write_as(&keys::worker_status(root, worker_id), &payload.health_status, ttl)
            .await?;

        tracing::debug!(worker_id = %worker_id, load = worker.current_load, "Heartbeat published");
        Ok(payload)
    }

    /// Pick a worker for `task` among healthy and degraded registered workers.
    ///
    /// # Errors
    ///
    /// As [`LoadBalancer::select_worker`].
    pub async fn select_worker(&self, task: &TaskDescriptor) -> Result<Selection> {
        let candidates = self
            .registry
            .discover(&DiscoveryFilter::new().with_health(&[HealthStatus::Healthy, HealthStatus::Degraded]))
            .await;
        self.balancer.select_worker(task, &candidates)
    }

    /// Stop background loops, flush memory and stop lock heartbeats.
    ///
    /// Held locks are not released; they go stale and can be stolen.
    ///
    /// # Errors
    ///
    /// The final memory flush error, after teardown has completed anyway.
    pub async fn shutdown(&self) -> Result<FlushReport> {
        // Loops first: the flusher does a last flush and the dispatcher drains.
        let aborted = self.tasks.shutdown_all(SHUTDOWN_GRACE).await;
        let flushed = self.memory.shutdown().await;
        self.locks.shutdown().await;

        tracing::info!(aborted, "Coordination core stopped");
        flushed
    }
}
