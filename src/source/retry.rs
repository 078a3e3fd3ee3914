//! Exponential backoff with an attempt ceiling.
//!
//! Transient failures (rate limits, transport errors, 5xx) are retried;
//! anything else is returned on the first attempt. When the ceiling is
//! hit the last transient error is folded into `SourceError::Unavailable`.

use std::future::Future;
use std::time::Duration;

use backoff::ExponentialBackoff;
use tracing::warn;

use crate::error::SourceError;

/// Backoff settings owned by one client instance.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Jitter in `[0, 1)`; 0 gives exact doubling.
    pub randomization_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            randomization_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// No delay between attempts. For tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            randomization_factor: 0.0,
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            current_interval: self.initial_delay,
            initial_interval: self.initial_delay,
            randomization_factor: self.randomization_factor,
            multiplier: self.multiplier,
            max_interval: self.max_delay,
            // Bounded by attempts, not wall-clock.
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        }
    }

    /// Run `op` until it succeeds, fails permanently, or runs out of attempts.
    pub async fn run<T, F, Fut>(&self, provider: &str, operation: &str, mut op: F) -> Result<T, SourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SourceError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;

        backoff::future::retry(self.backoff(), || {
            attempt += 1;
            let current = attempt;
            let fut = op();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if !e.is_transient() => Err(backoff::Error::permanent(e)),
                    Err(e) if current >= max_attempts => {
                        warn!(provider, operation, attempts = current, error = %e, "Giving up after retries");
                        Err(backoff::Error::permanent(SourceError::Unavailable {
                            provider: provider.to_string(),
                            attempts: current,
                            last_error: e.to_string(),
                        }))
                    }
                    Err(e) => {
                        warn!(provider, operation, attempt = current, error = %e, "Transient failure, backing off");
                        match e.retry_after() {
                            Some(delay) => Err(backoff::Error::retry_after(e, delay)),
                            None => Err(backoff::Error::transient(e)),
                        }
                    }
                }
            }
        })
        .await
    }
}
