//! Background task tracking.
//!
//! Every long-running loop the core spawns (sweeper, flusher, dispatcher,
//! heartbeat listener) takes a receiver from [`TaskRegistry::shutdown_signal`]
//! and its handle is registered here, so teardown can signal, wait briefly,
//! then abort whatever is left.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::{
    sync::{watch, Mutex},
    task::JoinHandle,
};

/// Registry for tracking and tearing down background tasks.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Default for TaskRegistry {
    fn default() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            tasks: Arc::new(Mutex::new(Vec::new())),
            shutdown: Arc::new(shutdown),
        }
    }
}

impl TaskRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Receiver that flips to `true` once shutdown starts.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub async fn register(&self, task: JoinHandle<()>) {
        self.tasks.lock().await.push(task);
    }

    pub async fn register_all(&self, tasks: impl IntoIterator<Item = JoinHandle<()>> + Send) {
        self.tasks.lock().await.extend(tasks);
    }

    pub async fn task_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Drop handles of tasks that already finished. Returns how many.
    pub async fn cleanup_completed(&self) -> usize {
        let mut tasks = self.tasks.lock().await;
        let initial = tasks.len();
        tasks.retain(|task| !task.is_finished());
        initial.saturating_sub(tasks.len())
    }

    /// Signal shutdown, give tasks `grace` to wind down, abort the rest.
    ///
    /// Returns the number of tasks that had to be aborted.
    pub async fn shutdown_all(&self, grace: Duration) -> usize {
        self.shutdown.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        let total = tasks.len();

        let deadline = tokio::time::Instant::now() + grace;
        let aborted = join_all(tasks.into_iter().map(|mut task| async move {
            let timed_out = tokio::time::timeout_at(deadline, &mut task).await.is_err();
            if timed_out {
                task.abort();
            }
            timed_out
        }))
        .await
        .into_iter()
        .filter(|timed_out| *timed_out)
        .count();

        if aborted > 0 {
            tracing::warn!(aborted, total, "Background tasks did not stop in time");
        } else {
            tracing::debug!(total, "Background tasks stopped");
        }
        aborted
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::sleep;

    use super::*;

    #[tokio::test]
    async fn test_register_and_count() {
        let registry = TaskRegistry::new();
        assert_eq!(registry.task_count().await, 0);

        registry
            .register(tokio::spawn(async {
                sleep(Duration::from_millis(100)).await;
            }))
            .await;
        assert_eq!(registry.task_count().await, 1);
    }

    #[tokio::test]
    async fn test_cooperative_tasks_stop_on_signal() {
        let registry = TaskRegistry::new();
        for _ in 0..3 {
            let mut signal = registry.shutdown_signal();
            registry
                .register(tokio::spawn(async move {
                    let _ = signal.wait_for(|stop| *stop).await;
                }))
                .await;
        }

        let aborted = registry.shutdown_all(Duration::from_secs(1)).await;
        assert_eq!(aborted, 0);
        assert_eq!(registry.task_count().await, 0);
        assert!(registry.is_shutting_down());
    }

    #[tokio::test]
    async fn test_stubborn_tasks_are_aborted() {
        let registry = TaskRegistry::new();
        registry
            .register(tokio::spawn(async {
                sleep(Duration::from_secs(60)).await;
            }))
            .await;

        assert_eq!(registry.shutdown_all(Duration::from_millis(10)).await, 1);
    }

    #[tokio::test]
    async fn test_cleanup_completed() {
        let registry = TaskRegistry::new();
        registry.register(tokio::spawn(async {})).await;
        registry
            .register(tokio::spawn(async {
                sleep(Duration::from_secs(10)).await;
            }))
            .await;

        sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.cleanup_completed().await, 1);
        assert_eq!(registry.task_count().await, 1);
        registry.shutdown_all(Duration::ZERO).await;
    }
}
