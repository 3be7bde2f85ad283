//! Bounded retry with exponential backoff and jitter
//!
//! Used only for requests that are safe to repeat (part uploads).

use crate::s3::S3ClientError;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(200))
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay: Duration::from_secs(20),
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Delay before retry number `retry` (1-based): base * 2^(retry-1), plus
    /// up to 20% jitter, capped at `max_delay`
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << exponent);
        let jitter = backoff.mul_f64(0.2 * rand::random::<f64>());
        backoff.saturating_add(jitter).min(self.max_delay)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or the retries run out
    ///
    /// `on_retry` sees every error that is about to be retried.
    pub async fn run<T, F, Fut, R>(&self, mut operation: F, mut on_retry: R) -> Result<T, S3ClientError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, S3ClientError>>,
        R: FnMut(u32, &S3ClientError),
    {
        let mut retry = 0;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    retry += 1;
                    on_retry(retry, &e);
                    tokio::time::sleep(self.delay_for(retry)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
