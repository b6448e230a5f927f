//! Retry with exponential backoff.
//!
//! Backend administrative and search calls (alias creation, template and
//! script installation, rollover, scroll) go through [`with_backend_retry`].
//! Bulk indexing does not: failed batches follow the retry-queue and
//! failure-queue path in [`crate::indexer`] instead.
//!
//! # Usage
//!
//! ```rust,ignore
//! use taskmill_core::retry::{RetryPolicy, with_backend_retry};
//!
//! let policy = RetryPolicy::backend_admin(Duration::from_secs(1), 3);
//! let indices = with_backend_retry(&policy, "alias_indices", || async {
//!     backend.alias_indices(&alias).await.map_err(Into::into)
//! }).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier applied to delay after each retry.
    pub backoff_factor: f64,
    /// Maximum number of attempts, including the first call.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Backend admin policy: retry `n` waits `2^n` units.
    ///
    /// `max_retries` retries follow the first call, so the operation runs at
    /// most `max_retries + 1` times.
    #[must_use]
    pub fn backend_admin(unit: Duration, max_retries: u32) -> Self {
        let ceiling = 2u32.saturating_pow(max_retries.min(31));
        Self {
            initial_delay: unit.saturating_mul(2),
            max_delay: unit.saturating_mul(ceiling),
            backoff_factor: 2.0,
            max_attempts: max_retries.saturating_add(1),
        }
    }

    /// Policy for failure queue inserts: fixed short delay.
    #[must_use]
    pub fn queue_insert(delay: Duration, max_tries: u32) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff_factor: 1.0,
            max_attempts: max_tries.max(1),
        }
    }

    /// Calculate the delay for a given retry number (0-indexed).
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        Duration::from_millis(base_ms.max(0.0) as u64)
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// The result (success or final error).
    pub result: Result<T>,
    /// Number of attempts made.
    pub attempts: u32,
    /// Total time spent (including delays).
    pub elapsed: Duration,
}

/// Check if an error is worth retrying.
#[must_use]
pub fn is_retryable(error: &Error) -> bool {
    match error {
        Error::Backend(e) => e.is_transient(),
        Error::Io(_) => true,
        Error::Runtime(_) => true,
        Error::Queue(_) => false,
        Error::Config(_) => false,
        Error::Json(_) => false,
        Error::MaxRetries { .. } => false,
    }
}

/// Execute an async operation with retry, returning detailed outcome.
///
/// Non-retryable errors end the loop immediately.
pub async fn with_retry_outcome<T, F, Fut>(
    policy: &RetryPolicy,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let start = std::time::Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(
                        total_attempts = attempt + 1,
                        retries = attempt,
                        "Operation succeeded after retries"
                    );
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;

                if !is_retryable(&e) || attempt >= policy.max_attempts {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Retrying operation after failure"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Execute a backend call with retry.
///
/// When every attempt fails with a retryable error the result is
/// [`Error::MaxRetries`] naming `operation`.
pub async fn with_backend_retry<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let outcome = with_retry_outcome(policy, call).await;
    match outcome.result {
        Ok(value) => Ok(value),
        Err(e) if is_retryable(&e) => {
            warn!(
                operation,
                attempts = outcome.attempts,
                elapsed_ms = outcome.elapsed.as_millis() as u64,
                error = %e,
                "Backend operation failed after all retry attempts"
            );
            Err(Error::MaxRetries {
                operation: operation.to_string(),
                attempts: outcome.attempts,
                last_error: e.to_string(),
            })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BackendError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn transient() -> Error {
        Error::Backend(BackendError::Transport("connection refused".into()))
    }

    #[test]
    fn backend_admin_doubles_from_two_units() {
        let policy = RetryPolicy::backend_admin(Duration::from_secs(1), 3);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[test]
    fn queue_insert_policy_is_constant() {
        let policy = RetryPolicy::queue_insert(Duration::from_millis(50), 10);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(50));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::backend_admin(Duration::from_secs(1), 3);
        let counter = Arc::clone(&calls);
        let result = with_backend_retry(&policy, "create_index", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(transient())
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::backend_admin(Duration::from_secs(1), 2);
        let counter = Arc::clone(&calls);
        let result: Result<()> = with_backend_retry(&policy, "rollover", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(transient())
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(Error::MaxRetries {
                operation,
                attempts,
                ..
            }) => {
                assert_eq!(operation, "rollover");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_error_fails_fast() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::backend_admin(Duration::from_secs(1), 5);
        let counter = Arc::clone(&calls);
        let result: Result<()> = with_backend_retry(&policy, "put_script", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(Error::Backend(BackendError::Status {
                    status: 400,
                    body: "bad script".into(),
                }))
            }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(Error::Backend(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn outcome_tracks_attempts() {
        let policy = RetryPolicy::backend_admin(Duration::from_millis(10), 4);
        let calls = AtomicU32::new(0);
        let outcome = with_retry_outcome(&policy, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move { if n == 0 { Err(transient()) } else { Ok(()) } }
        })
        .await;
        assert!(outcome.result.is_ok());
        assert_eq!(outcome.attempts, 2);
    }

    #[test]
    fn retryability_by_variant() {
        assert!(is_retryable(&transient()));
        assert!(!is_retryable(&Error::Backend(BackendError::NotFound(
            "x".into()
        ))));
        assert!(!is_retryable(&Error::MaxRetries {
            operation: "x".into(),
            attempts: 1,
            last_error: String::new(),
        }));
    }
}
