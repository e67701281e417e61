//! Bounded retry for external calls.
//!
//! The caller of an external collaborator retries transient failures a fixed
//! number of times without changing any state. Non-transient failures are
//! returned at once.

use crate::error::Categorizable;
use std::future::Future;
use std::time::Duration;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    /// Base delay; attempt `n` waits `backoff * 2^n`, capped at one minute.
    /// Zero means retries are issued back to back.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            backoff: Duration::ZERO,
        }
    }

    pub fn once() -> Self {
        Self::new(1)
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    fn delay(&self, attempt: u32) -> Duration {
        if self.backoff.is_zero() {
            return Duration::ZERO;
        }
        self.backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(MAX_BACKOFF)
    }

    /// Runs `op` until it succeeds, fails non-transiently, or the attempts
    /// are exhausted. The last error is returned.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Categorizable + std::fmt::Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.category().is_retryable() && attempt < self.attempts => {
                    tracing::warn!(
                        operation = what,
                        attempt,
                        max_attempts = self.attempts,
                        error = %err,
                        "transient failure, retrying"
                    );
                    let delay = self.delay(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}
