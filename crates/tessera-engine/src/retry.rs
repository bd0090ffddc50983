//! Exponential backoff and bounded waits for network operations

use crate::error::{IngestError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Capped exponential backoff: `base * multiplier^retry`, never above `max_delay`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 6,
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
            ..Self::default()
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1).checked_pow(retry).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            policy: *self,
            failures: 0,
        }
    }
}

/// Failure counter for one operation
#[derive(Debug, Clone)]
pub struct RetryState {
    policy: RetryPolicy,
    failures: u32,
}

impl RetryState {
    /// Record a failure. Returns the wait before the next attempt, or `None`
    /// once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts {
            None
        } else {
            Some(self.policy.delay_for(self.failures - 1))
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

/// Sleep, returning early with [`IngestError::Cancelled`] if `cancel` fires
pub async fn sleep_or_cancel(delay: Duration, cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) => tokio::select! {
            _ = token.cancelled() => Err(IngestError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        },
        None => {
            tokio::time::sleep(delay).await;
            Ok(())
        },
    }
}

/// Bound a network call. Elapsed time maps to a transient [`IngestError::Timeout`].
pub async fn with_timeout<T, Fut>(operation: &'static str, after: Duration, fut: Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match tokio::time::timeout(after, fut).await {
        Ok(result) => result,
        Err(_) => Err(IngestError::Timeout { operation, after }),
    }
}

/// Run `op` until it succeeds, fails non-transiently, or exhausts `policy`.
/// The final error is returned unchanged.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &'static str,
    cancel: Option<&CancellationToken>,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut state = policy.start();
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => match state.next_delay() {
                Some(delay) => {
                    warn!(
                        operation = operation,
                        attempt = state.failures(),
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient failure, retrying"
                    );
                    sleep_or_cancel(delay, cancel).await?;
                },
                None => {
                    error!(
                        operation = operation,
                        attempts = state.failures(),
                        error = %e,
                        "Giving up after repeated failures"
                    );
                    return Err(e);
                },
            },
            Err(e) => return Err(e),
        }
    }
}
