//! Process-local stores.
//!
//! Both stores can be switched "offline" with `set_available(false)`, after
//! which every call fails with `BackendUnavailable`. Clones share state, so a
//! single store can stand in for the shared backend of several managers.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{AssignmentStore, MemoryBackend};
use crate::{coordination::Lock, memory::MemoryEntry, Error, Result};

#[derive(Debug, Clone)]
struct Availability(Arc<AtomicBool>);

impl Default for Availability {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }
}

impl Availability {
    fn check(&self, store: &str) -> Result<()> {
        if self.0.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::backend(format!("{store} is offline")))
        }
    }

    fn set(&self, available: bool) {
        self.0.store(available, Ordering::SeqCst);
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ASSIGNMENT STORE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct InMemoryAssignmentStore {
    locks: Arc<Mutex<HashMap<String, Lock>>>,
    available: Availability,
}

impl InMemoryAssignmentStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    /// Overwrite a record directly, bypassing the atomic primitives.
    pub async fn insert_raw(&self, key: &str, lock: Lock) {
        self.locks.lock().await.insert(key.to_string(), lock);
    }

    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.lock().await.is_empty()
    }
}

#[async_trait]
impl AssignmentStore for InMemoryAssignmentStore {
    async fn create_if_absent(&self, key: &str, lock: &Lock) -> Result<bool> {
        self.available.check("assignment store")?;
        let mut locks = self.locks.lock().await;
        if locks.contains_key(key) {
            return Ok(false);
        }
        locks.insert(key.to_string(), lock.clone());
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Lock>> {
        self.available.check("assignment store")?;
        Ok(self.locks.lock().await.get(key).cloned())
    }

    async fn compare_and_delete(&self, key: &str, expected_owner: &str) -> Result<bool> {
        self.available.check("assignment store")?;
        let mut locks = self.locks.lock().await;
        match locks.get(key) {
            Some(lock) if lock.is_owned_by(expected_owner) => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn touch(&self, key: &str, owner: &str, at: DateTime<Utc>) -> Result<bool> {
        self.available.check("assignment store")?;
        let mut locks = self.locks.lock().await;
        match locks.get_mut(key) {
            Some(lock) if lock.is_owned_by(owner) => {
                lock.last_heartbeat_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.available.check("assignment store")?;
        Ok(self.locks.lock().await.remove(key).is_some())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// MEMORY BACKEND
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    entries: Arc<Mutex<BTreeMap<String, MemoryEntry>>>,
    available: Availability,
}

impl InMemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.available.set(available);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl MemoryBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<MemoryEntry>> {
        self.available.check("memory backend")?;
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, entry: &MemoryEntry) -> Result<()> {
        self.available.check("memory backend")?;
        self.entries
            .lock()
            .await
            .insert(entry.key.clone(), entry.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.available.check("memory backend")?;
        Ok(self.entries.lock().await.remove(key).is_some())
    }

    async fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        self.available.check("memory backend")?;
        Ok(self
            .entries
            .lock()
            .await
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> Result<Vec<String>> {
        self.available.check("memory backend")?;
        let mut entries = self.entries.lock().await;
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.remove(key);
        }
        drop(entries);
        Ok(expired)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{coordination::LockOwner, vector_clock::VectorClock};

    fn lock(owner: &str) -> Lock {
        Lock::new("r1", &LockOwner::new(owner, "node"), Utc::now(), None)
    }

    #[tokio::test]
    async fn test_create_if_absent_is_exclusive() -> Result<()> {
        let store = InMemoryAssignmentStore::new();
        assert!(store.create_if_absent("r1", &lock("a")).await?);
        assert!(!store.create_if_absent("r1", &lock("b")).await?);
        let held = store.get("r1").await?;
        assert_eq!(held.map(|l| l.owner_worker_id), Some("a".to_string()));
        Ok(())
    }

    #[tokio::test]
    async fn test_compare_and_delete_checks_owner() -> Result<()> {
        let store = InMemoryAssignmentStore::new();
        store.create_if_absent("r1", &lock("a")).await?;
        assert!(!store.compare_and_delete("r1", "b").await?);
        assert!(store.compare_and_delete("r1", "a").await?);
        assert!(store.get("r1").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_touch_only_for_owner() -> Result<()> {
        let store = InMemoryAssignmentStore::new();
        let original = lock("a");
        store.create_if_absent("r1", &original).await?;
        let later = original.last_heartbeat_at + chrono::Duration::seconds(5);

        assert!(!store.touch("r1", "b", later).await?);
        assert!(store.touch("r1", "a", later).await?);
        let held = store.get("r1").await?.map(|l| l.last_heartbeat_at);
        assert_eq!(held, Some(later));
        Ok(())
    }

    #[tokio::test]
    async fn test_offline_store_reports_backend_unavailable() {
        let store = InMemoryAssignmentStore::new();
        store.set_available(false);
        let result = store.get("r1").await;
        assert!(matches!(result, Err(Error::BackendUnavailable(_))));
    }

    #[tokio::test]
    async fn test_backend_prefix_listing_and_purge() -> Result<()> {
        let backend = InMemoryBackend::new();
        let now = Utc::now();
        let mut short = MemoryEntry::new("m/tasks/1/state", json!("x"), VectorClock::new(), "w", now, None);
        short.ttl_ms = Some(10);
        backend.put(&short).await?;
        backend
            .put(&MemoryEntry::new("m/tasks/2/state", json!("y"), VectorClock::new(), "w", now, None))
            .await?;
        backend
            .put(&MemoryEntry::new("m/workers/1/status", json!("z"), VectorClock::new(), "w", now, None))
            .await?;

        assert_eq!(
            backend.keys("m/tasks/").await?,
            vec!["m/tasks/1/state".to_string(), "m/tasks/2/state".to_string()]
        );

        let purged = backend.purge_expired(now + chrono::Duration::seconds(1)).await?;
        assert_eq!(purged, vec!["m/tasks/1/state".to_string()]);
        assert_eq!(backend.len().await, 2);
        Ok(())
    }
}
