use rand::Rng;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::backend::BackendError;

/// Errors that may succeed if the same call is repeated.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for BackendError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: usize,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, 1000, 10_000)
    }
}

impl RetryPolicy {
    pub fn new(max_retries: usize, initial_backoff_ms: u64, max_backoff_ms: u64) -> Self {
        Self {
            max_retries,
            initial_backoff: Duration::from_millis(initial_backoff_ms),
            max_backoff: Duration::from_millis(max_backoff_ms),
        }
    }

    /// Retry a future with exponential backoff.
    ///
    /// Only retryable errors are retried; anything else is returned at once.
    pub async fn retry<F, Fut, T, E>(&self, operation_name: &str, mut f: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display + Retryable,
    {
        let mut attempt = 0;
        let mut backoff = self.initial_backoff;

        loop {
            match f().await {
                Ok(result) => {
                    if attempt > 0 {
                        info!(
                            operation = operation_name,
                            attempts = attempt + 1,
                            "Operation succeeded after retries"
                        );
                    }
                    return Ok(result);
                }
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if attempt > self.max_retries {
                        warn!(
                            operation = operation_name,
                            attempts = attempt,
                            error = %e,
                            "Operation failed after max retries"
                        );
                        return Err(e);
                    }

                    let delay = with_jitter(backoff);
                    warn!(
                        operation = operation_name,
                        attempt = attempt,
                        max_retries = self.max_retries,
                        backoff_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, retrying"
                    );

                    sleep(delay).await;

                    backoff = std::cmp::min(backoff * 2, self.max_backoff);
                }
            }
        }
    }
}

/// Up to 25% extra, so concurrent runs do not retry in lockstep.
fn with_jitter(backoff: Duration) -> Duration {
    let max_extra = backoff.as_millis() as u64 / 4;
    if max_extra == 0 {
        return backoff;
    }
    let extra = rand::thread_rng().gen_range(0..=max_extra);
    backoff + Duration::from_millis(extra)
}
