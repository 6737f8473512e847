//! Conflict retry loop.

use std::future::Future;
use tracing::warn;

use crate::config::RetryPolicy;
use crate::error::{EngineError, Result};

/// Run `op` until it stops failing with `ConcurrentModification` or the
/// attempt budget is spent. Each attempt must re-read whatever it modifies.
pub async fn retry_on_conflict<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(EngineError::ConcurrentModification(detail)) if attempt < policy.max_attempts => {
                let delay = policy.backoff_after(attempt);
                warn!(operation, attempt, ?delay, %detail, "concurrent modification, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast() -> RetryPolicy {
        RetryPolicy::new()
            .with_max_attempts(3)
            .with_initial_backoff(Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let value = retry_on_conflict(&fast(), "test", || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(EngineError::ConcurrentModification("busy".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_on_conflict(&fast(), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::ConcurrentModification("busy".into()))
        })
        .await;
        assert!(matches!(result, Err(EngineError::ConcurrentModification(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_on_conflict(&fast(), "test", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(EngineError::NotFound("x".into()))
        })
        .await;
        assert!(matches!(result, Err(EngineError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
