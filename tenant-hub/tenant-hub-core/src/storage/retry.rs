//! Bounded exponential backoff for remote calls.

use super::StorageError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Overall budget for one logical call, retries included.
    pub timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// No retries; a single attempt within `timeout`.
    pub fn none(timeout: Duration) -> Self {
        Self {
            max_retries: 0,
            timeout,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt + 1`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.min(16));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `call` until it succeeds, fails permanently, or the budget runs out.
    /// Only [`StorageError::Transient`] failures are retried.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let deadline = Instant::now() + self.timeout;
        let mut attempt = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let outcome = match tokio::time::timeout(remaining, call()).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StorageError::Transient(format!("{operation} timed out"))),
            };
            match outcome {
                Err(err) if err.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    if Instant::now() + delay >= deadline {
                        return Err(err);
                    }
                    attempt += 1;
                    debug!(
                        "{operation} failed ({err}), retry {}/{} after {delay:?}",
                        attempt, self.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
