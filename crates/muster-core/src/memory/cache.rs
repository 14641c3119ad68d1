//! Bounded read cache for memory entries.

use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, PoisonError,
    },
};

use chrono::{DateTime, Utc};
use lru::LruCache;

use super::entry::MemoryEntry;

/// LRU of recently read or written entries.
#[derive(Debug)]
pub struct EntryCache {
    entries: Mutex<LruCache<String, MemoryEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
}

impl CacheStats {
    /// Hits over lookups; `0.0` before any lookup.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        match self.hits + self.misses {
            0 => 0.0,
            total => self.hits as f64 / total as f64,
        }
    }
}

impl EntryCache {
    /// A zero `capacity` is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LruCache<String, MemoryEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached entry for `key`. Expired entries are dropped and count as misses.
    pub fn get(&self, key: &str, now: DateTime<Utc>) -> Option<MemoryEntry> {
        let mut entries = self.lock();
        let found = match entries.peek(key).map(|e| e.is_expired(now)) {
            Some(true) => {
                entries.pop(key);
                None
            }
            Some(false) => entries.get(key).cloned(),
            None => None,
        };
        drop(entries);

        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    /// Cached entry without touching recency or counters.
    pub fn peek(&self, key: &str) -> Option<MemoryEntry> {
        self.lock().peek(key).cloned()
    }

    pub fn put(&self, entry: MemoryEntry) {
        let evicted = self.lock().push(entry.key.clone(), entry);
        // `push` also returns the old value when replacing the same key.
        if let Some((old_key, _)) = evicted {
            if self.peek(&old_key).is_none() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn remove(&self, key: &str) -> Option<MemoryEntry> {
        self.lock().pop(key)
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Drop expired entries; returns their keys.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut entries = self.lock();
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        drop(entries);
        expired
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.lock().len(),
        }
    }
}
