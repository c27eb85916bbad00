//! Retry with randomized exponential backoff.
//!
//! Every RPC and store read in the cluster goes through a [`RetryPolicy`]:
//! the call-site picks which errors are retriable via a predicate, the
//! policy sleeps a random duration uniformly sampled between one
//! millisecond-tick and `base_delay * factor^attempt`, and the last error
//! surfaces unchanged once the attempt budget is spent. Non-retriable
//! errors surface immediately.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::RngExt;

/// Backoff parameters for a retried operation.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Constant component of the sleep window.
    pub base_delay: Duration,
    /// Exponential growth factor of the sleep window. A factor of 1
    /// disables the exponential component.
    pub factor: u32,
}

impl RetryPolicy {
    #[must_use]
    pub fn new(attempts: u32, base_delay: Duration, factor: u32) -> Self {
        Self {
            attempts,
            base_delay,
            factor,
        }
    }

    /// A tight policy for in-process and test use.
    #[must_use]
    pub fn quick() -> Self {
        Self::new(3, Duration::from_millis(20), 2)
    }

    /// Run `operation` until it succeeds, a non-retriable error occurs, or
    /// the attempt budget is spent.
    ///
    /// `retriable` decides per error whether another attempt is worth
    /// making. The sleep before attempt `i` (1-based) is uniformly sampled
    /// from `1ms ..= base_delay * factor^i`.
    pub async fn run<T, E, F, Fut, P>(
        &self,
        op_name: &str,
        mut operation: F,
        mut retriable: P,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: FnMut(&E) -> bool,
        E: Display,
    {
        let attempts = self.attempts.max(1);
        let mut attempt = 1u32;
        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < attempts && retriable(&err) => {
                    let sleep = self.sleep_for(attempt);
                    tracing::debug!(
                        op = op_name,
                        attempt,
                        attempts,
                        sleep_ms = sleep.as_millis() as u64,
                        error = %err,
                        "retrying after error"
                    );
                    tokio::time::sleep(sleep).await;
                    attempt += 1;
                }
                Err(err) => {
                    if attempt >= attempts {
                        tracing::warn!(op = op_name, attempts, error = %err, "retries exhausted");
                    }
                    return Err(err);
                }
            }
        }
    }

    fn sleep_for(&self, attempt: u32) -> Duration {
        let ceiling = self
            .base_delay
            .saturating_mul(self.factor.saturating_pow(attempt));
        let ceiling_ms = ceiling.as_millis().max(1) as u64;
        let chosen = rand::rng().random_range(1..=ceiling_ms);
        Duration::from_millis(chosen)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, Duration::from_millis(250), 2)
    }
}
