//! Lock manager for exclusive resource ownership.
//!
//! Ownership is established by `create_if_absent` and given up by
//! `compare_and_delete`; nothing else mutates a lock record except heartbeat
//! touches by its owner. Every acquired lock gets a background heartbeat task
//! that runs until release, loss of ownership, or [`LockManager::shutdown`].
//!
//! # State machine
//!
//! ```text
//! Unlocked --acquire--> Locked --release--> Unlocked
//!                         |
//!                    (no heartbeat)
//!                         v
//!                       Stale --steal--> Locked (new owner)
//! ```

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::Instant,
};

use super::{
    backoff::backoff_delay,
    heartbeat::HeartbeatTask,
    types::{AcquireOptions, AcquireStrategy, Lock, LockOwner, LockResult, LockStatus, StaleFallback},
};
use crate::{
    clock::{self, Clock},
    config::LockConfig,
    store::AssignmentStore,
    Error, Result,
};

/// Outcome of a single acquire attempt.
enum Attempt {
    Acquired(Lock),
    /// Worth another attempt after backing off.
    Retry(Error),
    Fail(Error),
}

#[derive(Debug)]
struct HeldLock {
    worker_id: String,
    task: JoinHandle<()>,
}

/// Acquires, heartbeats and releases locks in an [`AssignmentStore`].
#[derive(Debug, Clone)]
pub struct LockManager {
    store: Arc<dyn AssignmentStore>,
    config: LockConfig,
    clock: Arc<dyn Clock>,
    held: Arc<Mutex<HashMap<String, HeldLock>>>,
}

impl LockManager {
    /// Create a lock manager over `store`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` does not validate.
    pub fn new(store: Arc<dyn AssignmentStore>, config: LockConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            config,
            clock: clock::system(),
            held: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Options for `strategy` seeded from this manager's configuration.
    #[must_use]
    pub fn options(&self, strategy: AcquireStrategy) -> AcquireOptions {
        AcquireOptions::from_config(strategy, &self.config)
    }

    /// Try to take exclusive ownership of `resource`.
    ///
    /// Never returns `Err`: the outcome, including the error that ended the
    /// attempt, is carried in the [`LockResult`].
    pub async fn acquire(&self, resource: &str, owner: &LockOwner, options: &AcquireOptions) -> LockResult {
        self.acquire_inner(resource, owner, options, None).await
    }

    /// Like [`acquire`](Self::acquire), but gives up between attempts once
    /// `cancel` reads `true`. A cancelled call holds nothing.
    pub async fn acquire_cancellable(
        &self,
        resource: &str,
        owner: &LockOwner,
        options: &AcquireOptions,
        cancel: watch::Receiver<bool>,
    ) -> LockResult {
        self.acquire_inner(resource, owner, options, Some(cancel)).await
    }

    async fn acquire_inner(
        &self,
        resource: &str,
        owner: &LockOwner,
        options: &AcquireOptions,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> LockResult {
        let started = Instant::now();
        let mut attempt: u32 = 0;

        loop {
            let err = match self.attempt(resource, owner, options).await {
                Attempt::Acquired(lock) => {
                    self.start_heartbeat(&lock).await;
                    tracing::info!(
                        resource = %resource,
                        worker_id = %owner.worker_id,
                        node_id = %owner.node_id,
                        strategy = %options.strategy,
                        retries = attempt,
                        "Lock acquired"
                    );
                    return LockResult::acquired(lock, attempt);
                }
                Attempt::Fail(err) => return LockResult::failed(err, attempt),
                Attempt::Retry(err) => err,
            };

            if attempt >= options.max_retries {
                tracing::debug!(resource = %resource, retries = attempt, error = %err, "Retries exhausted");
                return LockResult::failed(err, attempt);
            }

            let delay = backoff_delay(attempt, options.initial_backoff, options.max_backoff);
            if let Some(deadline) = options.deadline {
                let elapsed = started.elapsed();
                if elapsed + delay > deadline {
                    return LockResult::failed(
                        Error::Timeout {
                            resource: resource.to_string(),
                            elapsed,
                        },
                        attempt,
                    );
                }
            }

            tracing::debug!(
                resource = %resource,
                worker_id = %owner.worker_id,
                attempt,
                delay_ms = super::types::duration_ms(delay),
                error = %err,
                "Lock busy, backing off"
            );

            if wait_or_cancel(delay, cancel.as_mut()).await {
                tracing::debug!(resource = %resource, worker_id = %owner.worker_id, "Acquire cancelled");
                return LockResult::failed(Error::Cancelled(resource.to_string()), attempt);
            }
            attempt += 1;
        }
    }

    async fn attempt(&self, resource: &str, owner: &LockOwner, options: &AcquireOptions) -> Attempt {
        match self.try_claim(resource, owner, options).await {
            Ok(attempt) => attempt,
            // Backend trouble is retried under every strategy.
            Err(e) if e.is_transient() => Attempt::Retry(e),
            Err(e) => Attempt::Fail(e),
        }
    }

    async fn try_claim(&self, resource: &str, owner: &LockOwner, options: &AcquireOptions) -> Result<Attempt> {
        let now = self.clock.now();
        let lock = Lock::new(resource, owner, now, options.ttl);

        if options.strategy == AcquireStrategy::ForceAcquire {
            if let Some(previous) = self.store.get(resource).await? {
                tracing::warn!(
                    resource = %resource,
                    worker_id = %owner.worker_id,
                    previous_holder = %previous.owner_worker_id,
                    "Force-acquiring lock, discarding current holder"
                );
            }
            self.store.delete(resource).await?;
        }

        if self.store.create_if_absent(resource, &lock).await? {
            return Ok(Attempt::Acquired(lock));
        }

        let Some(current) = self.store.get(resource).await? else {
            // Released between our create and our read.
            return Ok(Attempt::Retry(conflict(resource, "<released>")));
        };

        if current.is_owned_by(&owner.worker_id) {
            return Ok(Attempt::Acquired(current));
        }

        let busy = conflict(resource, &current.owner_worker_id);
        Ok(match options.strategy {
            AcquireStrategy::FailFast | AcquireStrategy::ForceAcquire => Attempt::Fail(busy),
            AcquireStrategy::Retry => Attempt::Retry(busy),
            AcquireStrategy::StealStale => {
                if self.is_stale(&current) {
                    return self.steal(resource, &current, lock).await;
                }
                match options.stale_fallback {
                    StaleFallback::FailFast => Attempt::Fail(busy),
                    StaleFallback::Retry => Attempt::Retry(busy),
                }
            }
        })
    }

    async fn steal(&self, resource: &str, stale: &Lock, lock: Lock) -> Result<Attempt> {
        let detected = Error::StaleLockDetected {
            resource: resource.to_string(),
            holder: stale.owner_worker_id.clone(),
            stale_for_ms: stale.heartbeat_age_ms(self.clock.now()),
        };
        tracing::info!(resource = %resource, worker_id = %lock.owner_worker_id, "{detected}");

        if self
            .store
            .compare_and_delete(resource, &stale.owner_worker_id)
            .await?
            && self.store.create_if_absent(resource, &lock).await?
        {
            tracing::info!(
                resource = %resource,
                worker_id = %lock.owner_worker_id,
                previous_holder = %stale.owner_worker_id,
                "Stale lock stolen"
            );
            return Ok(Attempt::Acquired(lock));
        }

        // Someone else won the race for the freed slot.
        Ok(Attempt::Retry(conflict(resource, &stale.owner_worker_id)))
    }

    /// Give up `resource`, which must be held by `worker_id`.
    ///
    /// Releasing a resource nobody holds is a no-op.
    ///
    /// # Errors
    ///
    /// - `NotOwner` if another worker holds the lock; nothing is changed.
    /// - `BackendUnavailable` if the store fails. The lock may still be held
    ///   and will be stealable once stale.
    pub async fn release(&self, resource: &str, worker_id: &str) -> Result<()> {
        let Some(current) = self.store.get(resource).await? else {
            tracing::warn!(resource = %resource, worker_id = %worker_id, "Release of unlocked resource");
            self.stop_heartbeat(resource, worker_id).await;
            return Ok(());
        };

        if !current.is_owned_by(worker_id) {
            return Err(Error::NotOwner {
                resource: resource.to_string(),
                worker_id: worker_id.to_string(),
                holder: Some(current.owner_worker_id),
            });
        }

        self.stop_heartbeat(resource, worker_id).await;

        if !self.store.compare_and_delete(resource, worker_id).await? {
            return Err(Error::NotOwner {
                resource: resource.to_string(),
                worker_id: worker_id.to_string(),
                holder: None,
            });
        }

        tracing::info!(resource = %resource, worker_id = %worker_id, "Lock released");
        Ok(())
    }

    /// Refresh the heartbeat of a held lock outside the background schedule.
    ///
    /// # Errors
    ///
    /// `NotOwner` if `worker_id` does not hold `resource`; backend errors as-is.
    pub async fn heartbeat(&self, resource: &str, worker_id: &str) -> Result<()> {
        if self.store.touch(resource, worker_id, self.clock.now()).await? {
            return Ok(());
        }
        let holder = self.store.get(resource).await?.map(|l| l.owner_worker_id);
        Err(Error::NotOwner {
            resource: resource.to_string(),
            worker_id: worker_id.to_string(),
            holder,
        })
    }

    /// Current state of `resource`.
    ///
    /// # Errors
    ///
    /// Backend errors as-is.
    pub async fn get_status(&self, resource: &str) -> Result<LockStatus> {
        Ok(match self.store.get(resource).await? {
            None => LockStatus::Unlocked,
            Some(lock) if self.is_stale(&lock) => LockStatus::Stale(lock),
            Some(lock) => LockStatus::Locked(lock),
        })
    }

    /// `now - last_heartbeat_at > threshold`, using the lock's TTL when set.
    #[must_use]
    pub fn is_stale(&self, lock: &Lock) -> bool {
        lock.is_stale_at(self.clock.now(), self.config.stale_threshold())
    }

    /// Resources this manager is heartbeating, sorted.
    pub async fn held_locks(&self) -> Vec<String> {
        let mut held = self.held.lock().await;
        held.retain(|_, h| !h.task.is_finished());
        let mut resources: Vec<String> = held.keys().cloned().collect();
        drop(held);
        resources.sort_unstable();
        resources
    }

    /// Stop every heartbeat task without releasing anything.
    ///
    /// Locks left behind become stealable after the stale threshold.
    pub async fn shutdown(&self) {
        let mut held = self.held.lock().await;
        let count = held.len();
        for (_, h) in held.drain() {
            h.task.abort();
        }
        drop(held);
        if count > 0 {
            tracing::info!(count, "Lock manager stopped heartbeats");
        }
    }

    async fn start_heartbeat(&self, lock: &Lock) {
        let task = HeartbeatTask {
            store: Arc::clone(&self.store),
            clock: Arc::clone(&self.clock),
            resource: lock.resource_id.clone(),
            worker_id: lock.owner_worker_id.clone(),
            interval: self.config.heartbeat_interval(),
            retry: self.config.heartbeat_retry(),
        };

        let mut held = self.held.lock().await;
        if let Some(existing) = held.get(&lock.resource_id) {
            if existing.worker_id == lock.owner_worker_id && !existing.task.is_finished() {
                return;
            }
        }
        let replaced = held.insert(
            lock.resource_id.clone(),
            HeldLock {
                worker_id: lock.owner_worker_id.clone(),
                task: task.spawn(),
            },
        );
        drop(held);
        if let Some(old) = replaced {
            old.task.abort();
        }
    }

    async fn stop_heartbeat(&self, resource: &str, worker_id: &str) {
        let mut held = self.held.lock().await;
        if held.get(resource).is_some_and(|h| h.worker_id == worker_id) {
            if let Some(h) = held.remove(resource) {
                h.task.abort();
            }
        }
    }
}

fn conflict(resource: &str, holder: &str) -> Error {
    Error::LockConflict {
        resource: resource.to_string(),
        holder: holder.to_string(),
    }
}

/// Sleep for `delay`; `true` if cancellation was signalled first.
async fn wait_or_cancel(delay: Duration, cancel: Option<&mut watch::Receiver<bool>>) -> bool {
    let Some(rx) = cancel else {
        tokio::time::sleep(delay).await;
        return false;
    };
    if *rx.borrow() {
        return true;
    }

    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return false,
            changed = rx.changed() => match changed {
                Ok(()) if *rx.borrow() => return true,
                Ok(()) => {}
                Err(_) => {
                    // Sender gone: nobody can cancel any more.
                    (&mut sleep).await;
                    return false;
                }
            },
        }
    }
}
