use std::future::Future;
use std::time::Duration;

use config::shared::{EngineConfig, RetryConfig};
use rand::Rng;
use tracing::warn;

use crate::error::{ErrorKind, TndResult};
use crate::tnd_error;

/// Local retry of destination calls that failed with a transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
    /// Upper bound for a single call, including every statement of a transaction.
    call_timeout: Duration,
}

impl RetryPolicy {
    pub fn new(retry: &RetryConfig, call_timeout: Duration) -> Self {
        Self {
            max_attempts: retry.max_attempts.max(1),
            initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(retry.max_backoff_ms),
            call_timeout,
        }
    }

    pub fn from_engine_config(config: &EngineConfig) -> Self {
        Self::new(
            &config.retry,
            Duration::from_millis(config.statement_timeout_ms),
        )
    }

    /// Full-jitter exponential backoff before retry number `attempt` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let initial = u64::try_from(self.initial_backoff.as_millis()).unwrap_or(u64::MAX);
        let max = u64::try_from(self.max_backoff.as_millis()).unwrap_or(u64::MAX);
        let exponential = initial.saturating_mul(1u64 << attempt.min(10)).min(max);
        let jitter = rand::thread_rng().gen_range(0..=exponential);

        Duration::from_millis(jitter)
    }

    /// Runs `operation` until it succeeds, fails with a non-transient error, or
    /// the attempts are exhausted.
    ///
    /// Each attempt is bounded by the call timeout; running out of time counts as a
    /// transient [`ErrorKind::StatementTimeout`].
    pub async fn run<F, Fut, T>(&self, operation_name: &'static str, mut operation: F) -> TndResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TndResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let result = match tokio::time::timeout(self.call_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(tnd_error!(
                    ErrorKind::StatementTimeout,
                    "Destination call timed out",
                    format!("{operation_name} exceeded {:?}", self.call_timeout)
                )),
            };

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            attempt += 1;
            if !err.kind().is_transient() || attempt >= self.max_attempts {
                return Err(err);
            }

            let backoff = self.backoff(attempt - 1);
            warn!(
                operation = operation_name,
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "transient destination error, retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
