//! Retrying ledger calls with exponential backoff

use crate::config::RetryPolicy;
use std::future::Future;
use tracing::warn;
use tss_core::Result;

/// Run `operation` until it succeeds, fails with a non-retryable error or
/// runs out of attempts. The last error is returned.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tss_core::Error;

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = with_retry(&fast(5), "submit", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Ledger("unavailable".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_short_circuit() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(&fast(5), "submit", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidState("round closed".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::InvalidState(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = with_retry(&fast(3), "submit", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::Timeout("ledger".into()))
        })
        .await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }
}
