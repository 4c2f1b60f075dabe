use crate::error::{Error, Result};
use backoff::backoff::Backoff;
use backoff::exponential::ExponentialBackoff;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Bounded retry budget shared by the HTTP transport and the loader.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_secs_f64(max_retries: u32, backoff_secs: f64) -> Self {
        Self::new(max_retries, Duration::from_secs_f64(backoff_secs.max(0.0)))
    }
}

pub fn create_backoff(base_delay: Duration) -> ExponentialBackoff<backoff::SystemClock> {
    ExponentialBackoff {
        current_interval: base_delay,
        initial_interval: base_delay,
        randomization_factor: 0.5, // Add jitter
        multiplier: 2.0,
        max_interval: Duration::from_secs(60),
        // The attempt count bounds the loop, not wall time
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    policy: &RetryPolicy,
    operation_name: &str,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut backoff = create_backoff(policy.base_delay);
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;

        match operation().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "Operation succeeded after retries"
                    );
                }
                return Ok(result);
            }
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => {
                if attempts > policy.max_retries {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let Some(duration) = backoff.next_backoff() else {
                    warn!(
                        operation = operation_name,
                        attempts,
                        error = %e,
                        "Backoff exhausted"
                    );
                    return Err(e);
                };

                warn!(
                    operation = operation_name,
                    attempt = attempts,
                    retry_after_ms = duration.as_millis(),
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(duration).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = retry_with_backoff(
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::unexpected_status(503, "busy"))
                } else {
                    Ok(7)
                }
            },
            &fast(5),
            "test",
        )
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_with_backoff(
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::unexpected_status(429, "slow down"))
            },
            &fast(3),
            "test",
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::UnexpectedStatus { status: 429, .. })
        ));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_with_backoff(
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::unexpected_status(401, "denied"))
            },
            &fast(5),
            "test",
        )
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn schema_errors_fail_on_the_first_attempt() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<()> = retry_with_backoff(
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(Error::Database(sqlx::Error::ColumnNotFound("document".into())))
            },
            &fast(5),
            "upsert_pulse",
        )
        .await;

        assert!(matches!(result, Err(Error::Database(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
