//! Bounded retry with doubling backoff for mutating remote calls.

use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, sleep};

use crate::error::Result;

/// Doubling backoff bounded by a wall-clock deadline.
///
/// The first retry waits `initial`, each further retry waits twice as long
/// as the previous one, and no retry is attempted once `deadline` has elapsed
/// since the first attempt. The final wait is shortened so the last attempt
/// lands on the deadline rather than past it. Only
/// [retryable](crate::error::ErrorKind::is_retryable) failures are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub deadline: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self { initial: Duration::from_secs(5), deadline: Duration::from_secs(30 * 60) }
    }
}

impl Backoff {
    /// Run `attempt` until it succeeds, fails permanently, or the deadline
    /// passes. The last failure is returned unchanged.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let started = Instant::now();
        let mut delay = self.initial;
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            let elapsed = started.elapsed();
            if !err.is_retryable() || elapsed >= self.deadline {
                tracing::error!(operation, attempts, elapsed_secs = elapsed.as_secs(), "Giving up: {err}");
                return Err(err);
            }
            let pause = delay.min(self.deadline - elapsed);
            tracing::warn!(operation, attempts, delay_secs = pause.as_secs(), "Remote operation failed, retrying: {err}");
            sleep(pause).await;
            delay = delay.saturating_mul(2);
        }
    }
}
