//! # Bounded retry with exponential backoff
//! Retries a fallible async operation with `base * 2^attempt` waits plus
//! jitter. Orthogonal to the rate limiter: the limiter decides when a
//! request may start, this decides how often a failed one is re-tried.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryExecutor {
    /// Total attempts, including the first. Never zero.
    max_retries: u32,
    base_delay: Duration,
}

impl RetryExecutor {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries: max_retries.max(1),
            base_delay,
        }
    }

    /// Invoke `op` up to `max_retries` times. The final error is returned
    /// unmodified; a success short-circuits with no further waits.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    attempt += 1;
                    if attempt >= self.max_retries {
                        return Err(e);
                    }
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
            }
        }
    }

    /// Wait before attempt `attempt + 1` (1-based count of failures so far).
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt as i32 - 1));
        let jitter = self.base_delay.mul_f64(rand::rng().random_range(0.0..0.25));
        exp + jitter
    }
}
