//! Per-lock heartbeat tasks.

use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{interval_at, Instant, MissedTickBehavior},
};

use crate::{clock::Clock, store::AssignmentStore};

/// Keeps one lock's `last_heartbeat_at` fresh until aborted or the lock is lost.
///
/// Touch failures are retried every `retry` forever. A failing heartbeat never
/// gives the lock up; only a `touch` that reports "not owner" ends the task.
#[derive(Debug)]
pub(crate) struct HeartbeatTask {
    pub store: Arc<dyn AssignmentStore>,
    pub clock: Arc<dyn Clock>,
    pub resource: String,
    pub worker_id: String,
    pub interval: Duration,
    pub retry: Duration,
}

impl HeartbeatTask {
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if !self.beat().await {
                return;
            }
        }
    }

    /// One heartbeat, retried until the store answers. `false` once ownership is gone.
    async fn beat(&self) -> bool {
        let mut failures: u32 = 0;
        loop {
            match self
                .store
                .touch(&self.resource, &self.worker_id, self.clock.now())
                .await
            {
                Ok(true) => {
                    tracing::trace!(resource = %self.resource, worker_id = %self.worker_id, "Heartbeat");
                    return true;
                }
                Ok(false) => {
                    tracing::warn!(
                        resource = %self.resource,
                        worker_id = %self.worker_id,
                        "Lock no longer held, stopping heartbeat"
                    );
                    return false;
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        resource = %self.resource,
                        worker_id = %self.worker_id,
                        failures,
                        error = %e,
                        "Heartbeat failed, retrying"
                    );
                    tokio::time::sleep(self.retry).await;
                }
            }
        }
    }
}
