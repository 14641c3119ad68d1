//! Exponential backoff and transient-error retry.

use std::{future::Future, time::Duration};

use crate::Result;

/// `min(initial * 2^attempt, max)`, attempt counted from 0.
#[must_use]
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    initial.checked_mul(factor).map_or(max, |d| d.min(max))
}

/// Retry budget for backend calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            max_retries,
            initial,
            max,
        }
    }

    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.initial, self.max)
    }

    /// Run `op`, retrying while it fails with a transient error.
    ///
    /// Non-transient errors return immediately. The last transient error is
    /// surfaced once the budget is spent.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay(attempt);
                    tracing::debug!(
                        operation = what,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "Retrying transient backend error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
