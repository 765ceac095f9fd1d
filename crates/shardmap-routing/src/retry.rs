//! Bounded exponential backoff for retryable shard map errors.

use shardmap_common::{Result, RetryConfig};
use std::future::Future;
use tracing::warn;

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is spent. The last error is returned unchanged.
pub async fn retry_with_backoff<T, F, Fut>(policy: &RetryConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                let delay = policy.backoff(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}, retrying in {:?}",
                    operation, attempt, max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardmap_common::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result = retry_with_backoff(&policy(5), "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Error::Timeout)
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_bounded() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&policy(3), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::connection("refused"))
        })
        .await;
        assert!(matches!(result, Err(Error::Connection(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_caller_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(&policy(5), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::InvalidRange("[5, 1)".into()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
