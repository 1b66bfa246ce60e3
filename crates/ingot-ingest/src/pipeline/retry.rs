//! Retry policy shared by batch processors and remote calls

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Delay between two attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately
    #[default]
    None,
    /// Same delay before every retry
    Fixed { delay_ms: u64 },
    /// `delay_ms * attempt`
    Linear { delay_ms: u64 },
    /// `base_ms * factor^(attempt - 1)`, capped at `max_ms`
    Exponential { base_ms: u64, factor: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay to wait after `attempt` (1-based) has failed
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let millis = match *self {
            Backoff::None => 0,
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Linear { delay_ms } => delay_ms.saturating_mul(attempt as u64),
            Backoff::Exponential {
                base_ms,
                factor,
                max_ms,
            } => base_ms
                .saturating_mul(factor.saturating_pow(attempt - 1))
                .min(max_ms),
        };
        Duration::from_millis(millis)
    }
}

/// How many times an operation is attempted and how long to wait in between
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one; 0 is treated as 1
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: Backoff) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// A single attempt, no retry
    pub fn none() -> Self {
        Self::new(1, Backoff::None)
    }

    /// `max_attempts` attempts with a delay growing by `delay` per attempt
    pub fn linear(max_attempts: u32, delay: Duration) -> Self {
        Self::new(
            max_attempts,
            Backoff::Linear {
                delay_ms: delay.as_millis() as u64,
            },
        )
    }

    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget is spent. The last error is returned.
    pub async fn retry<T, E, F, Fut, R>(
        &self,
        operation: &str,
        mut op: F,
        is_retryable: R,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
        R: Fn(&E) -> bool,
    {
        let attempts = self.attempts();
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "Succeeded after retry");
                    }
                    return Ok(value);
                },
                Err(e) if attempt < attempts && is_retryable(&e) => {
                    let delay = self.backoff.delay(attempt);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}
