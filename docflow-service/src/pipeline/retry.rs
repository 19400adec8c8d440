//! Bounded in-process retry around a single stage invocation.

use std::future::Future;

use tracing::{debug, error, warn};

use super::backoff::BackoffPolicy;
use super::classify::{BoxError, ErrorDomain, StageError, classify};

/// Retry budget plus the delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: BackoffPolicy) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent. `op` receives the zero-based attempt number.
///
/// Every failure is classified before the retry decision, so an
/// unrecognized error comes back as a non-retryable `Unknown`. The last
/// classified failure is returned when the budget runs out.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    domain: Option<ErrorDomain>,
    operation: &str,
    mut op: F,
) -> Result<T, StageError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    let mut attempt: u32 = 0;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation, attempt, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(raw) => {
                let err = classify(raw, domain);

                if !err.retryable {
                    warn!(
                        operation,
                        attempt,
                        kind = %err.kind,
                        error = %err,
                        "Non-retryable failure"
                    );
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    error!(
                        operation,
                        retries = policy.max_retries,
                        kind = %err.kind,
                        error = %err,
                        "Retries exhausted"
                    );
                    return Err(err);
                }

                let delay = policy.backoff.delay(attempt);
                warn!(
                    operation,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    kind = %err.kind,
                    error = %err,
                    "Retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::classify::ErrorKind;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::{Duration, Instant};

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            BackoffPolicy::new(Duration::from_millis(1), 2.0, Duration::from_millis(5)),
        )
    }

    #[tokio::test]
    async fn test_success_without_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff(&fast_policy(3), None, "ok", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(7)
            }
        })
        .await;

        assert_eq!(tokio_test::assert_ok!(result), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_from_transient_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = retry_with_backoff(&fast_policy(3), None, "flaky", move |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 {
                    let err: BoxError = Box::new(StageError::retryable(ErrorKind::Network, "blip"));
                    Err(err)
                } else {
                    Ok("done")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry_with_backoff(&fast_policy(2), None, "down", move |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), BoxError>(Box::new(StageError::retryable(
                    ErrorKind::ExternalApi,
                    format!("attempt {attempt}"),
                )))
            }
        })
        .await;

        let err = tokio_test::assert_err!(result);
        assert_eq!(err.kind, ErrorKind::ExternalApi);
        assert!(err.retryable);
        assert_eq!(err.message, "attempt 2");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry_with_backoff(&fast_policy(5), None, "auth", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), BoxError>(Box::new(StageError::non_retryable(
                    ErrorKind::ExternalApi,
                    "401 unauthorized",
                )))
            }
        })
        .await;

        assert!(!result.unwrap_err().retryable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unrecognized_failure_becomes_unknown() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = retry_with_backoff(&fast_policy(5), None, "odd", move |_| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), BoxError>("the flux capacitor jammed".into())
            }
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unknown);
        assert!(!err.retryable);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_waits_between_attempts() {
        let policy = RetryPolicy::new(
            2,
            BackoffPolicy::new(Duration::from_millis(10), 2.0, Duration::from_secs(1)),
        );
        let started = Instant::now();
        let result: Result<(), _> = retry_with_backoff(&policy, None, "slow", |_| async {
            Err::<(), BoxError>(Box::new(StageError::retryable(ErrorKind::Network, "blip")))
        })
        .await;

        assert!(result.is_err());
        // 10ms + 20ms of backoff
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
