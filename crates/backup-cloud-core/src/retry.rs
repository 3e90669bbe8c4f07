use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::StorageError;

/// Fixed-pause retry policy wrapped around every network operation.
///
/// `max_retries` is the total number of attempts (at least one). The pause
/// happens only between attempts, so an operation that always fails runs
/// `max_retries` times and sleeps `max_retries - 1` times.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
    wait: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, wait: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            wait,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries
    }

    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. `operation` labels the exhausted-retry error.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(StorageError::RetriesExhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            last_error: e.to_string(),
                        });
                    }
                    warn!(
                        attempt,
                        max_attempts = self.max_retries,
                        wait_secs = self.wait.as_secs_f64(),
                        "{} failed: {}, retrying",
                        operation,
                        e
                    );
                    tokio::time::sleep(self.wait).await;
                    attempt += 1;
                }
            }
        }
    }
}
