//! Pattern subscriptions and asynchronous change dispatch.
//!
//! Writers never call listeners directly. Events go into a bounded queue that a
//! single dispatcher task drains, so listeners see events in write order and a
//! slow listener can only cost dropped events, never a blocked writer.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};

use super::pattern::KeyPattern;
use crate::vector_clock::VectorClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Written,
    Deleted,
}

/// A write or delete that reached the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub key: String,
    pub kind: ChangeKind,
    /// `None` for deletes.
    pub value: Option<serde_json::Value>,
    pub vector_clock: VectorClock,
    pub writer_worker_id: String,
    pub at: DateTime<Utc>,
}

/// Receives events for keys matching a subscription's pattern.
#[async_trait]
pub trait MemoryListener: Send + Sync {
    async fn on_change(&self, event: &ChangeEvent);

    /// The key is gone from the local view (expired or purged).
    async fn on_invalidate(&self, _key: &str) {}
}

/// Queued notification.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryEvent {
    Changed(ChangeEvent),
    Invalidated(String),
}

impl MemoryEvent {
    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Changed(event) => &event.key,
            Self::Invalidated(key) => key,
        }
    }
}

/// Listener that forwards every event into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: mpsc::UnboundedSender<MemoryEvent>,
}

impl ChannelListener {
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<MemoryEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl MemoryListener for ChannelListener {
    async fn on_change(&self, event: &ChangeEvent) {
        let _ = self.tx.send(MemoryEvent::Changed(event.clone()));
    }

    async fn on_invalidate(&self, key: &str) {
        let _ = self.tx.send(MemoryEvent::Invalidated(key.to_string()));
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    pattern: KeyPattern,
    listener: Arc<dyn MemoryListener>,
}

/// Subscription table plus the bounded event queue.
pub(crate) struct Notifier {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: AtomicU64,
    tx: mpsc::Sender<MemoryEvent>,
    rx: Mutex<Option<mpsc::Receiver<MemoryEvent>>>,
    dropped: AtomicU64,
}

impl fmt::Debug for Notifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notifier")
            .field("subscriptions", &self.len())
            .field("dropped", &self.dropped())
            .finish_non_exhaustive()
    }
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            next_id: AtomicU64::new(1),
            tx,
            rx: Mutex::new(Some(rx)),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, pattern: KeyPattern, listener: Arc<dyn MemoryListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription { id, pattern, listener });
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        let before = subs.len();
        subs.retain(|s| s.id != id);
        before != subs.len()
    }

    pub fn clear(&self) {
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn has_match(&self, key: &str) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|s| s.pattern.matches(key))
    }

    /// Queue `event` if any subscription wants it. Never waits.
    pub fn publish(&self, event: MemoryEvent) {
        if !self.has_match(event.key()) {
            return;
        }
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(key = %event.key(), "Notification queue full, dropping event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("Notification dispatcher gone");
            }
        }
    }

    /// Start the dispatcher. `None` if it is already running.
    pub fn spawn_dispatcher(&self, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner).take()?;
        let subscriptions = Arc::clone(&self.subscriptions);

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(event) => dispatch(&subscriptions, &event).await,
                        None => return,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            // Deliver what is already queued, then stop.
                            while let Ok(event) = rx.try_recv() {
                                dispatch(&subscriptions, &event).await;
                            }
                            tracing::debug!("Notification dispatcher stopped");
                            return;
                        }
                    }
                }
            }
        }))
    }
}

async fn dispatch(subscriptions: &RwLock<Vec<Subscription>>, event: &MemoryEvent) {
    let targets: Vec<Subscription> = subscriptions
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .filter(|s| s.pattern.matches(event.key()))
        .cloned()
        .collect();

    for sub in targets {
        tracing::trace!(subscription = %sub.id, key = %event.key(), "Dispatching");
        match event {
            MemoryEvent::Changed(change) => sub.listener.on_change(change).await,
            MemoryEvent::Invalidated(key) => sub.listener.on_invalidate(key).await,
        }
    }
}
