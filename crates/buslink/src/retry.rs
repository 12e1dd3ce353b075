use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::{ClaimError, Result};

/// Bounded busy-retry driver.
///
/// One initial attempt plus up to `max_retries` further attempts, each
/// preceded by a fixed `delay`. Only [`ClaimError::Busy`] is retried; every
/// other error is returned as-is. The defaults are hand-tuned inheritance
/// (20 × 100 ms ≈ 2 s), kept configurable rather than baked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 20,
            delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Drive `op` until it succeeds, fails with a non-busy error, or the
    /// retry budget is exhausted (which surfaces the final Busy).
    pub async fn run<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Err(err) if err.is_busy() => {
                    if attempt >= self.max_retries {
                        debug!(attempt, "busy-retry budget exhausted");
                        return Err(ClaimError::Busy);
                    }
                    attempt += 1;
                    tokio::time::sleep(self.delay).await;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn persistent_busy_terminates_after_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let policy = RetryPolicy::default();
        let started = tokio::time::Instant::now();
        let result: Result<()> = policy
            .run(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ClaimError::Busy) }
            })
            .await;

        assert!(matches!(result, Err(ClaimError::Busy)));
        // Initial attempt + 20 retries, each retry preceded by 100 ms.
        assert_eq!(attempts.load(Ordering::SeqCst), 21);
        assert_eq!(started.elapsed(), Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_busy() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result = RetryPolicy::default()
            .run(|| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 3 {
                        Err(ClaimError::Busy)
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.expect("fourth attempt should succeed"), 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_busy_errors_are_not_retried() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let result: Result<()> = RetryPolicy::default()
            .run(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ClaimError::Unauthorized) }
            })
            .await;

        assert!(matches!(result, Err(ClaimError::Unauthorized)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn custom_budget_respected() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&attempts);

        let policy = RetryPolicy {
            max_retries: 2,
            delay: Duration::from_millis(10),
        };
        let result: Result<()> = policy
            .run(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(ClaimError::Busy) }
            })
            .await;

        assert!(matches!(result, Err(ClaimError::Busy)));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
