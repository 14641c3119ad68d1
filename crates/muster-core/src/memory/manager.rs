//! Replicated key/value memory with batched writes.
//!
//! Writes land in a local buffer and the cache immediately, and reach the
//! backend on the next flush (timer, `max_batch_size`, or [`force_sync`]).
//! On flush every buffered entry is compared with the stored one by vector
//! clock: a dominated write is dropped, a concurrent one goes through the
//! resolver and is stored with the merged clock.
//!
//! Entries written by other processes are picked up by [`poll_remote`], which
//! refreshes the cache and announces them to subscribers like local writes.
//!
//! [`force_sync`]: MemorySyncManager::force_sync
//! [`poll_remote`]: MemorySyncManager::poll_remote

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use super::{
    cache::{CacheStats, EntryCache},
    entry::MemoryEntry,
    keys,
    pattern::KeyPattern,
    resolver::{ConflictResolver, ResolverKind},
    subscription::{ChangeEvent, ChangeKind, MemoryEvent, MemoryListener, Notifier, SubscriptionId},
};
use crate::{
    clock::{self, Clock},
    config::MemoryConfig,
    coordination::{AcquireStrategy, LockManager, LockOwner, LockResult, LockStatus, RetryPolicy},
    store::MemoryBackend,
    vector_clock::{ClockOrdering, VectorClock},
    Result,
};

/// What one flush did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries stored as written or as resolved.
    pub written: usize,
    /// Buffered writes dropped because the stored entry already dominated them.
    pub superseded: usize,
    /// Writes that were concurrent with the stored entry.
    pub conflicts_resolved: usize,
}

impl FlushReport {
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.written == 0 && self.superseded == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub cache: CacheStats,
    pub pending_writes: usize,
    pub subscriptions: usize,
    pub dropped_notifications: u64,
}

enum FlushOutcome {
    Written(MemoryEntry),
    Resolved(MemoryEntry),
    Superseded,
}

#[derive(Debug)]
struct ResolverTable {
    default: Arc<dyn ConflictResolver>,
    /// Checked most specific first.
    overrides: Vec<(KeyPattern, Arc<dyn ConflictResolver>)>,
}

impl ResolverTable {
    fn for_key(&self, key: &str) -> Arc<dyn ConflictResolver> {
        self.overrides
            .iter()
            .filter(|(p, _)| p.matches(key))
            .max_by_key(|(p, _)| p.specificity())
            .map_or_else(|| Arc::clone(&self.default), |(_, r)| Arc::clone(r))
    }
}

/// One worker's view of shared memory.
#[derive(Debug, Clone)]
pub struct MemorySyncManager {
    worker_id: String,
    root: String,
    config: MemoryConfig,
    backend: Arc<dyn MemoryBackend>,
    locks: LockManager,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    cache: Arc<EntryCache>,
    buffer: Arc<Mutex<Vec<MemoryEntry>>>,
    /// Serialises flushes, deletes and remote polls against each other.
    flushing: Arc<Mutex<()>>,
    /// Last stored clock per key, as this manager wrote or polled it.
    seen: Arc<Mutex<HashMap<String, VectorClock>>>,
    resolvers: Arc<RwLock<ResolverTable>>,
    notifier: Arc<Notifier>,
}

impl MemorySyncManager {
    /// # Errors
    ///
    /// `InvalidConfig` if `config` does not validate.
    pub fn new(
        worker_id: impl Into<String>,
        root: impl Into<String>,
        config: MemoryConfig,
        backend: Arc<dyn MemoryBackend>,
        locks: LockManager,
    ) -> Result<Self> {
        config.validate()?;
        let backoff = config.backend_backoff();
        Ok(Self {
            worker_id: worker_id.into(),
            root: root.into(),
            config,
            backend,
            locks,
            clock: clock::system(),
            retry: RetryPolicy::new(config.backend_retries, backoff, backoff.saturating_mul(8)),
            cache: Arc::new(EntryCache::new(config.cache_capacity)),
            buffer: Arc::new(Mutex::new(Vec::new())),
            flushing: Arc::new(Mutex::new(())),
            seen: Arc::new(Mutex::new(HashMap::new())),
            resolvers: Arc::new(RwLock::new(ResolverTable {
                default: config.resolver.build(),
                overrides: Vec::new(),
            })),
            notifier: Arc::new(Notifier::new(config.notification_capacity)),
        })
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    #[must_use]
    pub fn root(&self) -> &str {
        &self.root
    }

    // ═══════════════════════════════════════════════════════════════════════
    // READ / WRITE
    // ═══════════════════════════════════════════════════════════════════════

    /// Buffer a write of `value` under `key`, bumping this worker's counter.
    ///
    /// The write is visible to this manager's reads at once and to other
    /// workers after the next flush.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` if the stored clock for `key` cannot be read
    /// within the retry budget; nothing is buffered then. A failed early
    /// flush triggered by `max_batch_size` also surfaces here, but that
    /// write stays buffered.
    pub async fn write(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<MemoryEntry> {
        let seen = self.latest_clock(key).await?;

        let mut buffer = self.buffer.lock().await;
        // A write to the same key may have been buffered meanwhile.
        let mut vector_clock = buffer
            .iter()
            .rev()
            .find(|e| e.key == key)
            .map_or(seen, |e| e.vector_clock.clone());
        vector_clock.increment(&self.worker_id);

        let entry = MemoryEntry::new(key, value, vector_clock, self.worker_id.as_str(), self.clock.now(), ttl);
        buffer.push(entry.clone());
        let full = buffer.len() >= self.config.max_batch_size;
        drop(buffer);

        self.cache.put(entry.clone());
        tracing::trace!(key = %key, clock = %entry.vector_clock, "Write buffered");

        if full {
            self.force_sync().await?;
        }
        Ok(entry)
    }

    /// Serialize `value` and [`write`](Self::write) it.
    ///
    /// # Errors
    ///
    /// `Serialization` if `value` cannot be represented as JSON.
    pub async fn write_as<T: Serialize + Sync>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<MemoryEntry> {
        let value = serde_json::to_value(value)?;
        self.write(key, value, ttl).await
    }

    /// Newest clock this worker knows for `key`: buffer, then cache, then backend.
    ///
    /// A clock guessed without the backend would lose to the stored entry at
    /// flush time, so a backend error is returned instead.
    async fn latest_clock(&self, key: &str) -> Result<VectorClock> {
        if let Some(pending) = self.buffer.lock().await.iter().rev().find(|e| e.key == key) {
            return Ok(pending.vector_clock.clone());
        }
        if let Some(cached) = self.cache.peek(key) {
            return Ok(cached.vector_clock);
        }
        let stored = self.retry.run("memory get", || self.backend.get(key)).await?;
        Ok(stored.map(|e| e.vector_clock).unwrap_or_default())
    }

    /// Value stored under `key`, if any and not expired.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` once the retry budget is spent on a cache miss.
    pub async fn read(&self, key: &str) -> Result<Option<serde_json::Value>> {
        Ok(self.read_entry(key).await?.map(|e| e.value))
    }

    /// # Errors
    ///
    /// As [`read`](Self::read), plus `Serialization` if the value is not a `T`.
    pub async fn read_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        self.read(key)
            .await?
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .transpose()
    }

    /// Full entry for `key`; cache first, backend on a miss.
    ///
    /// # Errors
    ///
    /// As [`read`](Self::read).
    pub async fn read_entry(&self, key: &str) -> Result<Option<MemoryEntry>> {
        let now = self.clock.now();
        if let Some(entry) = self.cache.get(key, now) {
            tracing::debug!(key = %key, "Cache hit");
            return Ok(Some(entry));
        }
        tracing::debug!(key = %key, "Cache miss");

        let stored = self.retry.run("memory get", || self.backend.get(key)).await?;
        Ok(match stored {
            Some(entry) if !entry.is_expired(now) => {
                self.cache.put(entry.clone());
                Some(entry)
            }
            _ => None,
        })
    }

    /// Delete `key` everywhere. Buffered writes to it are discarded.
    ///
    /// Waits for a running flush, so a write already taken off the buffer
    /// cannot land after the delete.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` once the retry budget is spent.
    pub async fn delete(&self, key: &str) -> Result<bool> {
        let _flushing = self.flushing.lock().await;
        let seen = self.latest_clock(key).await?;
        let pending = {
            let mut buffer = self.buffer.lock().await;
            let before = buffer.len();
            buffer.retain(|e| e.key != key);
            before != buffer.len()
        };
        self.cache.remove(key);

        let deleted = self.retry.run("memory delete", || self.backend.delete(key)).await?;
        self.seen.lock().await.remove(key);
        if deleted || pending {
            let mut vector_clock = seen;
            vector_clock.increment(&self.worker_id);
            self.notifier.publish(MemoryEvent::Changed(ChangeEvent {
                key: key.to_string(),
                kind: ChangeKind::Deleted,
                value: None,
                vector_clock,
                writer_worker_id: self.worker_id.clone(),
                at: self.clock.now(),
            }));
            tracing::debug!(key = %key, "Key deleted");
        }
        Ok(deleted || pending)
    }

    /// Keys under `prefix` in the backend, sorted. Unflushed writes are not included.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` once the retry budget is spent.
    pub async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.retry.run("memory keys", || self.backend.keys(prefix)).await
    }

    /// Drop expired entries from cache and backend and notify subscribers.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` once the retry budget is spent.
    pub async fn purge_expired(&self) -> Result<Vec<String>> {
        let now = self.clock.now();
        let mut purged = self.cache.purge_expired(now);
        purged.extend(
            self.retry
                .run("memory purge", || self.backend.purge_expired(now))
                .await?,
        );
        purged.sort_unstable();
        purged.dedup();

        let mut seen = self.seen.lock().await;
        for key in &purged {
            seen.remove(key);
        }
        drop(seen);
        for key in &purged {
            self.notifier.publish(MemoryEvent::Invalidated(key.clone()));
        }
        if !purged.is_empty() {
            tracing::debug!(count = purged.len(), "Purged expired entries");
        }
        Ok(purged)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // FLUSH
    // ═══════════════════════════════════════════════════════════════════════

    /// Flush every buffered write now, in write order.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` if the backend stays down past the retry budget.
    /// The unflushed tail goes back to the front of the buffer.
    pub async fn force_sync(&self) -> Result<FlushReport> {
        let _flushing = self.flushing.lock().await;
        let pending = std::mem::take(&mut *self.buffer.lock().await);
        let mut report = FlushReport::default();

        for (i, entry) in pending.iter().enumerate() {
            match self.flush_one(entry).await {
                Ok(FlushOutcome::Written(stored)) => {
                    report.written += 1;
                    self.stored(stored).await;
                }
                Ok(FlushOutcome::Resolved(stored)) => {
                    report.written += 1;
                    report.conflicts_resolved += 1;
                    self.stored(stored).await;
                }
                Ok(FlushOutcome::Superseded) => report.superseded += 1,
                Err(e) => {
                    let mut buffer = self.buffer.lock().await;
                    let newer = std::mem::take(&mut *buffer);
                    buffer.extend(pending[i..].iter().cloned());
                    buffer.extend(newer);
                    let requeued = buffer.len();
                    drop(buffer);
                    tracing::warn!(error = %e, requeued, "Memory flush failed");
                    return Err(e);
                }
            }
        }

        if !report.is_empty() {
            tracing::debug!(
                written = report.written,
                superseded = report.superseded,
                conflicts = report.conflicts_resolved,
                "Memory flushed"
            );
        }
        Ok(report)
    }

    async fn flush_one(&self, entry: &MemoryEntry) -> Result<FlushOutcome> {
        let now = self.clock.now();
        let current = self.retry.run("memory get", || self.backend.get(&entry.key)).await?;

        let outcome = match current {
            Some(existing) if !existing.is_expired(now) => match entry.vector_clock.compare(&existing.vector_clock) {
                ClockOrdering::After | ClockOrdering::Equal => FlushOutcome::Written(entry.clone()),
                ClockOrdering::Before => {
                    tracing::debug!(key = %entry.key, "Buffered write superseded by stored entry");
                    self.cache.put(existing);
                    return Ok(FlushOutcome::Superseded);
                }
                ClockOrdering::Concurrent => {
                    let resolver = self.resolver_for(&entry.key);
                    let resolution = resolver.resolve(entry, &existing);
                    let mut resolved = resolution.resolved;
                    resolved.vector_clock = entry.vector_clock.merged(&existing.vector_clock);
                    tracing::debug!(
                        key = %entry.key,
                        resolver = resolver.name(),
                        local = %entry.vector_clock,
                        remote = %existing.vector_clock,
                        discarded = resolution.discarded.len(),
                        "Concurrent write resolved"
                    );
                    FlushOutcome::Resolved(resolved)
                }
            },
            _ => FlushOutcome::Written(entry.clone()),
        };

        let to_store = match &outcome {
            FlushOutcome::Written(e) | FlushOutcome::Resolved(e) => e,
            FlushOutcome::Superseded => return Ok(outcome),
        };
        self.retry.run("memory put", || self.backend.put(to_store)).await?;
        Ok(outcome)
    }

    /// Cache and announce an entry that reached the backend.
    async fn stored(&self, entry: MemoryEntry) {
        self.seen
            .lock()
            .await
            .insert(entry.key.clone(), entry.vector_clock.clone());
        self.notifier.publish(MemoryEvent::Changed(ChangeEvent {
            key: entry.key.clone(),
            kind: ChangeKind::Written,
            value: Some(entry.value.clone()),
            vector_clock: entry.vector_clock.clone(),
            writer_worker_id: entry.writer_worker_id.clone(),
            at: entry.written_at,
        }));
        self.cache.put(entry);
    }

    /// Flush on `batch_interval` until `shutdown`, then flush once more.
    #[must_use]
    pub fn spawn_flusher(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.config.batch_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if manager.pending_writes().await > 0 {
                            if let Err(e) = manager.force_sync().await {
                                tracing::warn!(error = %e, "Scheduled memory flush failed");
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            if let Err(e) = manager.force_sync().await {
                                tracing::warn!(error = %e, "Final memory flush failed");
                            }
                            return;
                        }
                    }
                }
            }
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // REMOTE CHANGES
    // ═══════════════════════════════════════════════════════════════════════

    /// Scan every key under `root` for entries this manager has not seen.
    ///
    /// A new or changed entry replaces the cached copy and is published as a
    /// `Written` change. A key that vanished is dropped from the cache and
    /// published as an invalidation. Keys with unflushed local writes keep
    /// their cached value. Returns the number of changes observed.
    ///
    /// # Errors
    ///
    /// `BackendUnavailable` once the retry budget is spent.
    pub async fn poll_remote(&self) -> Result<usize> {
        let _flushing = self.flushing.lock().await;
        let now = self.clock.now();
        let prefix = format!("{}/", self.root);

        let mut current = BTreeMap::new();
        for key in self.retry.run("memory keys", || self.backend.keys(&prefix)).await? {
            let stored = self.retry.run("memory get", || self.backend.get(&key)).await?;
            if let Some(entry) = stored.filter(|e| !e.is_expired(now)) {
                current.insert(key, entry);
            }
        }

        let pending: HashSet<String> = self.buffer.lock().await.iter().map(|e| e.key.clone()).collect();
        let mut events = Vec::new();
        let mut seen = self.seen.lock().await;

        let vanished: Vec<String> = seen.keys().filter(|k| !current.contains_key(*k)).cloned().collect();
        for key in vanished {
            seen.remove(&key);
            if !pending.contains(&key) {
                self.cache.remove(&key);
            }
            events.push(MemoryEvent::Invalidated(key));
        }

        for (key, entry) in current {
            let unchanged = seen
                .get(&key)
                .is_some_and(|clock| entry.vector_clock.compare(clock) == ClockOrdering::Equal);
            if unchanged {
                continue;
            }
            seen.insert(key.clone(), entry.vector_clock.clone());
            events.push(MemoryEvent::Changed(ChangeEvent {
                key: key.clone(),
                kind: ChangeKind::Written,
                value: Some(entry.value.clone()),
                vector_clock: entry.vector_clock.clone(),
                writer_worker_id: entry.writer_worker_id.clone(),
                at: entry.written_at,
            }));
            if !pending.contains(&key) {
                self.cache.put(entry);
            }
        }
        drop(seen);

        let published = events.len();
        for event in events {
            self.notifier.publish(event);
        }
        if published > 0 {
            tracing::debug!(published, "Remote memory changes observed");
        }
        Ok(published)
    }

    /// Run [`poll_remote`](Self::poll_remote) every `remote_poll_interval` until `shutdown`.
    #[must_use]
    pub fn spawn_poller(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = self.clone();
        let period = self.config.remote_poll_interval();
        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.poll_remote().await {
                            tracing::warn!(error = %e, "Remote memory poll failed");
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::debug!("Remote memory poller stopped");
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Start the flush timer, the remote poller and the notification dispatcher.
    pub fn start(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut tasks = vec![self.spawn_flusher(shutdown.clone()), self.spawn_poller(shutdown.clone())];
        tasks.extend(self.notifier.spawn_dispatcher(shutdown.clone()));
        tasks
    }

    /// Flush and drop every subscription.
    ///
    /// # Errors
    ///
    /// As [`force_sync`](Self::force_sync).
    pub async fn shutdown(&self) -> Result<FlushReport> {
        let report = self.force_sync().await;
        self.notifier.clear();
        report
    }

    pub async fn pending_writes(&self) -> usize {
        self.buffer.lock().await.len()
    }

    pub async fn stats(&self) -> MemoryStats {
        MemoryStats {
            cache: self.cache.stats(),
            pending_writes: self.pending_writes().await,
            subscriptions: self.notifier.len(),
            dropped_notifications: self.notifier.dropped(),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // RESOLVERS AND SUBSCRIPTIONS
    // ═══════════════════════════════════════════════════════════════════════

    fn resolver_for(&self, key: &str) -> Arc<dyn ConflictResolver> {
        self.resolvers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .for_key(key)
    }

    /// Replace the resolver used when no pattern override matches.
    pub fn set_resolver(&self, resolver: Arc<dyn ConflictResolver>) {
        self.resolvers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .default = resolver;
    }

    pub fn set_resolver_kind(&self, kind: ResolverKind) {
        self.set_resolver(kind.build());
    }

    /// Use `resolver` for keys matching `pattern`. The most specific matching
    /// pattern wins.
    ///
    /// # Errors
    ///
    /// `InvalidPattern` if `pattern` does not compile.
    pub fn set_resolver_for(&self, pattern: &str, resolver: Arc<dyn ConflictResolver>) -> Result<()> {
        let pattern = KeyPattern::new(pattern)?;
        let mut table = self.resolvers.write().unwrap_or_else(PoisonError::into_inner);
        table.overrides.retain(|(p, _)| *p != pattern);
        table.overrides.push((pattern, resolver));
        Ok(())
    }

    /// Call `listener` for every stored write or delete whose key matches
    /// `pattern`. Other processes' writes arrive through
    /// [`poll_remote`](Self::poll_remote).
    ///
    /// # Errors
    ///
    /// `InvalidPattern` if `pattern` does not compile.
    pub fn subscribe(&self, pattern: &str, listener: Arc<dyn MemoryListener>) -> Result<SubscriptionId> {
        let pattern = KeyPattern::new(pattern)?;
        tracing::debug!(pattern = %pattern, "Subscribed");
        Ok(self.notifier.subscribe(pattern, listener))
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.notifier.unsubscribe(id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // TASK LOCKS
    // ═══════════════════════════════════════════════════════════════════════

    /// Lock `{root}/tasks/{task_id}/lock` for `ttl`.
    ///
    /// The TTL is stored on the lock and replaces the manager-wide stale
    /// threshold for it.
    pub async fn acquire_task_lock(
        &self,
        task_id: &str,
        owner: &LockOwner,
        ttl: Duration,
        strategy: AcquireStrategy,
    ) -> LockResult {
        let options = self.locks.options(strategy).with_ttl(ttl);
        self.locks
            .acquire(&keys::task_lock(&self.root, task_id), owner, &options)
            .await
    }

    /// # Errors
    ///
    /// As [`LockManager::release`].
    pub async fn release_task_lock(&self, task_id: &str, worker_id: &str) -> Result<()> {
        self.locks
            .release(&keys::task_lock(&self.root, task_id), worker_id)
            .await
    }

    /// # Errors
    ///
    /// Backend errors as-is.
    pub async fn task_lock_status(&self, task_id: &str) -> Result<LockStatus> {
        self.locks.get_status(&keys::task_lock(&self.root, task_id)).await
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{
        clock::ManualClock,
        config::LockConfig,
        memory::{resolver::ArrayMerge, subscription::ChannelListener},
        store::{InMemoryAssignmentStore, InMemoryBackend},
        Error,
    };

    fn config() -> MemoryConfig {
        MemoryConfig {
            backend_retries: 1,
            backend_backoff_ms: 1,
            ..MemoryConfig::default()
        }
    }

    fn manager(worker: &str, backend: &InMemoryBackend, clock: &ManualClock) -> Result<MemorySyncManager> {
        let locks = LockManager::new(Arc::new(InMemoryAssignmentStore::new()), LockConfig::default())?
            .with_clock(Arc::new(clock.clone()));
        Ok(
            MemorySyncManager::new(worker, "m", config(), Arc::new(backend.clone()), locks)?
                .with_clock(Arc::new(clock.clone())),
        )
    }

    #[tokio::test]
    async fn test_write_is_buffered_until_sync() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let mgr = manager("A", &backend, &clock)?;

        mgr.write("m/k", json!(1), None).await?;
        assert_eq!(mgr.read("m/k").await?, Some(json!(1)));
        assert!(backend.is_empty().await);

        let report = mgr.force_sync().await?;
        assert_eq!(report.written, 1);
        assert_eq!(backend.get("m/k").await?.map(|e| e.value), Some(json!(1)));
        Ok(())
    }

    #[tokio::test]
    async fn test_successive_writes_bump_own_counter() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let mgr = manager("A", &backend, &clock)?;

        mgr.write("m/k", json!(1), None).await?;
        mgr.force_sync().await?;
        let second = mgr.write("m/k", json!(2), None).await?;
        assert_eq!(second.vector_clock.get("A"), 2);

        // A fresh manager for the same worker continues from the stored clock.
        let restarted = manager("A", &backend, &clock)?;
        let third = restarted.write("m/k", json!(3), None).await?;
        assert_eq!(third.vector_clock.get("A"), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_writes_resolve_and_merge_clocks() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let a = manager("A", &backend, &clock)?;
        let b = manager("B", &backend, &clock)?;

        a.write("m/k", json!("from-a"), None).await?;
        clock.advance(chrono::Duration::milliseconds(10));
        b.write("m/k", json!("from-b"), None).await?;

        a.force_sync().await?;
        let report = b.force_sync().await?;
        assert_eq!(report.conflicts_resolved, 1);

        let stored = backend.get("m/k").await?.ok_or_else(|| Error::not_found("m/k"))?;
        assert_eq!(stored.value, json!("from-b"));
        let expected: VectorClock = [("A", 1), ("B", 1)].into_iter().collect();
        assert_eq!(stored.vector_clock, expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_dominated_write_is_superseded() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let a = manager("A", &backend, &clock)?;

        let stale = MemoryEntry::new("m/k", json!("stale"), VectorClock::new(), "A", clock.now(), None);
        let newer: VectorClock = [("A", 1), ("B", 3)].into_iter().collect();
        backend
            .put(&MemoryEntry::new("m/k", json!("newer"), newer, "B", clock.now(), None))
            .await?;

        a.buffer.lock().await.push(stale);
        let report = a.force_sync().await?;
        assert_eq!(report.superseded, 1);
        assert_eq!(backend.get("m/k").await?.map(|e| e.value), Some(json!("newer")));
        Ok(())
    }

    #[tokio::test]
    async fn test_pattern_resolver_override() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let a = manager("A", &backend, &clock)?;
        let b = manager("B", &backend, &clock)?;
        b.set_resolver_for("m/sets/**", Arc::new(ArrayMerge))?;

        a.write("m/sets/x", json!([1]), None).await?;
        b.write("m/sets/x", json!([2]), None).await?;
        a.force_sync().await?;
        b.force_sync().await?;

        let stored = backend.get("m/sets/x").await?.map(|e| e.value);
        assert_eq!(stored, Some(json!([1, 2])));
        Ok(())
    }

    #[tokio::test]
    async fn test_batch_size_triggers_flush() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let locks = LockManager::new(Arc::new(InMemoryAssignmentStore::new()), LockConfig::default())?;
        let mgr = MemorySyncManager::new(
            "A",
            "m",
            MemoryConfig {
                max_batch_size: 2,
                ..config()
            },
            Arc::new(backend.clone()),
            locks,
        )?
        .with_clock(Arc::new(clock));

        mgr.write("m/a", json!(1), None).await?;
        assert_eq!(mgr.pending_writes().await, 1);
        mgr.write("m/b", json!(2), None).await?;
        assert_eq!(mgr.pending_writes().await, 0);
        assert_eq!(backend.len().await, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_flush_requeues_in_order() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let mgr = manager("A", &backend, &clock)?;

        mgr.write("m/a", json!(1), None).await?;
        mgr.write("m/b", json!(2), None).await?;
        backend.set_available(false);
        assert!(matches!(mgr.force_sync().await, Err(Error::BackendUnavailable(_))));
        assert_eq!(mgr.pending_writes().await, 2);

        backend.set_available(true);
        assert_eq!(mgr.force_sync().await?.written, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_miss_surfaces_backend_error() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let mgr = manager("A", &backend, &clock)?;
        backend.set_available(false);
        assert!(matches!(mgr.read("m/x").await, Err(Error::BackendUnavailable(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_subscribers_see_writes_deletes_and_expiry() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let mgr = manager("A", &backend, &clock)?;
        let (listener, mut rx) = ChannelListener::channel();
        mgr.subscribe("m/tasks/**", Arc::new(listener))?;
        let (_stop, stop_rx) = watch::channel(false);
        let _tasks = mgr.start(&stop_rx);

        mgr.write("m/tasks/1/state", json!("running"), Some(Duration::from_secs(1)))
            .await?;
        mgr.write("m/workers/1/status", json!("ignored"), None).await?;
        mgr.force_sync().await?;
        mgr.delete("m/tasks/1/state").await?;
        mgr.write("m/tasks/2/state", json!("queued"), Some(Duration::from_secs(1)))
            .await?;
        mgr.force_sync().await?;
        clock.advance(chrono::Duration::seconds(2));
        mgr.purge_expired().await?;

        let mut seen = Vec::new();
        while seen.len() < 4 {
            match tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv()).await {
                Ok(Some(event)) => seen.push(event),
                _ => break,
            }
        }
        assert!(matches!(&seen[0], MemoryEvent::Changed(e) if e.kind == ChangeKind::Written && e.key == "m/tasks/1/state"));
        assert!(matches!(&seen[1], MemoryEvent::Changed(e) if e.kind == ChangeKind::Deleted));
        assert!(matches!(&seen[2], MemoryEvent::Changed(e) if e.key == "m/tasks/2/state"));
        assert_eq!(seen[3], MemoryEvent::Invalidated("m/tasks/2/state".into()));
        Ok(())
    }

    #[tokio::test]
    async fn test_task_lock_uses_namespace_and_ttl() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let mgr = manager("A", &backend, &clock)?;
        let owner = LockOwner::new("A", "node");

        let result = mgr
            .acquire_task_lock("t1", &owner, Duration::from_secs(30), AcquireStrategy::FailFast)
            .await;
        assert!(result.success);
        let lock = result.lock.ok_or_else(|| Error::not_found("lock"))?;
        assert_eq!(lock.resource_id, "m/tasks/t1/lock");
        assert_eq!(lock.ttl_ms, Some(30_000));

        clock.advance(chrono::Duration::seconds(31));
        assert!(matches!(mgr.task_lock_status("t1").await?, LockStatus::Stale(_)));
        mgr.release_task_lock("t1", "A").await?;
        assert!(mgr.task_lock_status("t1").await?.is_unlocked());
        Ok(())
    }

    #[tokio::test]
    async fn test_write_fails_when_stored_clock_unreadable() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let stored: VectorClock = [("A", 3)].into_iter().collect();
        backend
            .put(&MemoryEntry::new("m/k", json!("old"), stored, "A", clock.now(), None))
            .await?;
        let mgr = manager("A", &backend, &clock)?;

        backend.set_available(false);
        assert!(matches!(
            mgr.write("m/k", json!("new"), None).await,
            Err(Error::BackendUnavailable(_))
        ));
        assert_eq!(mgr.pending_writes().await, 0);

        backend.set_available(true);
        let entry = mgr.write("m/k", json!("new"), None).await?;
        assert_eq!(entry.vector_clock.get("A"), 4);
        let report = mgr.force_sync().await?;
        assert_eq!((report.written, report.superseded), (1, 0));
        assert_eq!(backend.get("m/k").await?.map(|e| e.value), Some(json!("new")));
        Ok(())
    }

    /// Backend whose reads take `delay`, to hold a flush open.
    #[derive(Debug, Clone)]
    struct SlowBackend {
        inner: InMemoryBackend,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl MemoryBackend for SlowBackend {
        async fn get(&self, key: &str) -> Result<Option<MemoryEntry>> {
            tokio::time::sleep(self.delay).await;
            self.inner.get(key).await
        }

        async fn put(&self, entry: &MemoryEntry) -> Result<()> {
            self.inner.put(entry).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.keys(prefix).await
        }

        async fn purge_expired(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<String>> {
            self.inner.purge_expired(now).await
        }
    }

    #[tokio::test]
    async fn test_delete_during_flush_is_not_undone() -> Result<()> {
        let backend = InMemoryBackend::new();
        let slow = SlowBackend {
            inner: backend.clone(),
            delay: Duration::from_millis(50),
        };
        let locks = LockManager::new(Arc::new(InMemoryAssignmentStore::new()), LockConfig::default())?;
        let mgr = MemorySyncManager::new("A", "m", config(), Arc::new(slow), locks)?;

        mgr.write("m/k", json!(1), None).await?;
        let flush = {
            let mgr = mgr.clone();
            tokio::spawn(async move { mgr.force_sync().await })
        };
        // The flush has taken the write off the buffer and sits in its read.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(mgr.pending_writes().await, 0);

        assert!(mgr.delete("m/k").await?);
        flush.await.map_err(|e| Error::backend(e.to_string()))??;

        assert_eq!(backend.get("m/k").await?, None);
        assert_eq!(mgr.read("m/k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_remote_announces_and_refreshes_foreign_entries() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let a = manager("A", &backend, &clock)?;
        let b = manager("B", &backend, &clock)?;
        let (listener, mut rx) = ChannelListener::channel();
        b.subscribe("m/**", Arc::new(listener))?;
        let (_stop, stop_rx) = watch::channel(false);
        let _dispatcher = b.notifier.spawn_dispatcher(stop_rx);

        a.write("m/k", json!(1), None).await?;
        a.force_sync().await?;
        assert_eq!(b.read("m/k").await?, Some(json!(1)));
        assert_eq!(b.poll_remote().await?, 1);
        assert_eq!(b.poll_remote().await?, 0);

        a.write("m/k", json!(2), None).await?;
        a.force_sync().await?;
        // Cached until the next poll.
        assert_eq!(b.read("m/k").await?, Some(json!(1)));
        assert_eq!(b.poll_remote().await?, 1);
        assert_eq!(b.read("m/k").await?, Some(json!(2)));

        a.delete("m/k").await?;
        assert_eq!(b.poll_remote().await?, 1);
        assert_eq!(b.read("m/k").await?, None);

        let mut seen = Vec::new();
        while seen.len() < 3 {
            match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
                Ok(Some(event)) => seen.push(event),
                _ => break,
            }
        }
        assert!(matches!(&seen[0], MemoryEvent::Changed(e) if e.value == Some(json!(1)) && e.writer_worker_id == "A"));
        assert!(matches!(&seen[1], MemoryEvent::Changed(e) if e.value == Some(json!(2))));
        assert_eq!(seen[2], MemoryEvent::Invalidated("m/k".into()));
        Ok(())
    }

    #[tokio::test]
    async fn test_poll_remote_skips_own_flushed_writes() -> Result<()> {
        let backend = InMemoryBackend::new();
        let clock = ManualClock::starting_now();
        let a = manager("A", &backend, &clock)?;

        a.write("m/k", json!(1), None).await?;
        a.force_sync().await?;
        assert_eq!(a.poll_remote().await?, 0);
        Ok(())
    }
}
