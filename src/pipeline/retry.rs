use crate::error::{PipelineError, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backoff {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// Delay doubles with each retry
    Exponential,
}

/// Per-stage retry settings: `retries` re-attempts after the first failure, `retry_delay` apart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub retry_delay: Duration,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: crate::constants::DEFAULT_RETRIES,
            retry_delay: Duration::from_secs(crate::constants::DEFAULT_RETRY_DELAY_SECS),
            backoff: Backoff::Fixed,
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, retry_delay: Duration) -> Self {
        Self {
            retries,
            retry_delay,
            backoff: Backoff::Fixed,
        }
    }

    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Delay before re-attempt number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.retry_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(retry.saturating_sub(1));
                self.retry_delay.saturating_mul(factor)
            }
        }
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or
    /// the retries are used up. `on_retry` sees every error that triggers a
    /// re-attempt. Returns the outcome and the number of attempts made.
    pub async fn run<T, F, Fut, R>(
        &self,
        label: &str,
        mut operation: F,
        mut on_retry: R,
    ) -> (Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        R: FnMut(&PipelineError),
    {
        let mut attempt = 1;
        loop {
            debug!("{} attempt {} of {}", label, attempt, self.retries + 1);
            match operation(attempt).await {
                Ok(value) => return (Ok(value), attempt),
                Err(e) if e.is_retryable() && attempt <= self.retries => {
                    let delay = self.delay_for(attempt);
                    warn!(
                        "{} failed ({}), retrying in {:?} [{}/{}]: {}",
                        label,
                        e.kind(),
                        delay,
                        attempt,
                        self.retries,
                        e
                    );
                    on_retry(&e);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}
