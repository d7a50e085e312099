//! Bounded exponential backoff for durable queue operations.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::errors::DurableQueueError;
use crate::settings::ProducerControllerSettings;

/// Calculate exponential backoff duration.
///
/// Formula: `min(base_ms * 2^attempt, max_ms)`
#[must_use]
pub fn calculate_backoff(attempt: u32, base_ms: u64, max_ms: u64) -> Duration {
    let backoff = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    Duration::from_millis(backoff.min(max_ms))
}

/// How often and how patiently a durable operation is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&ProducerControllerSettings::default())
    }
}

impl From<&ProducerControllerSettings> for RetryPolicy {
    fn from(settings: &ProducerControllerSettings) -> Self {
        Self {
            max_attempts: settings.durable_queue_retry_attempts,
            base_backoff_ms: settings.durable_queue_backoff_base_ms,
            max_backoff_ms: settings.durable_queue_backoff_max_ms,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt after `attempt` (1-based) failed, or
    /// `None` once the attempts are used up.
    #[must_use]
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            None
        } else {
            Some(calculate_backoff(
                attempt.saturating_sub(1),
                self.base_backoff_ms,
                self.max_backoff_ms,
            ))
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy runs out of attempts.
///
/// # Errors
///
/// Returns the last error seen.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: RetryPolicy,
    operation: &str,
    mut attempt_fn: F,
) -> Result<T, DurableQueueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DurableQueueError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() => return Err(e),
            Err(e) => match policy.next_delay(attempt) {
                Some(delay) => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = %delay.as_millis(),
                        error = %e,
                        "Durable queue operation failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                None => return Err(e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::expect_used)]
    #![allow(clippy::arithmetic_side_effects)]

    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use proptest::prelude::*;

    use super::*;

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_backoff_ms: 1,
            max_backoff_ms: 4,
        }
    }

    #[test]
    fn test_backoff_doubles_then_caps() {
        assert_eq!(calculate_backoff(0, 100, 3200), Duration::from_millis(100));
        assert_eq!(calculate_backoff(1, 100, 3200), Duration::from_millis(200));
        assert_eq!(calculate_backoff(5, 100, 3200), Duration::from_millis(3200));
        assert_eq!(calculate_backoff(40, 100, 3200), Duration::from_millis(3200));
    }

    #[test]
    fn test_retry_policy_respects_max_attempts() {
        let policy = fast_policy(3);
        assert!(policy.next_delay(1).is_some());
        assert!(policy.next_delay(2).is_some());
        assert!(policy.next_delay(3).is_none());
    }

    #[tokio::test]
    async fn should_succeed_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result = retry_with_backoff(fast_policy(5), "store", || {
            let counter = Arc::clone(&counter);
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(DurableQueueError::unavailable("busy"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn should_give_up_after_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), _> = retry_with_backoff(fast_policy(3), "store", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DurableQueueError::unavailable("down"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn should_not_retry_permanent_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let result: Result<(), _> = retry_with_backoff(fast_policy(5), "store", || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(DurableQueueError::internal("corrupt"))
            }
        })
        .await;

        assert_eq!(result, Err(DurableQueueError::internal("corrupt")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    proptest! {
        #[test]
        fn backoff_never_exceeds_max(attempt in 0u32..200, base in 0u64..10_000, max in 0u64..100_000) {
            prop_assert!(calculate_backoff(attempt, base, max) <= Duration::from_millis(max));
        }

        #[test]
        fn backoff_is_monotonic(attempt in 0u32..100, base in 1u64..1_000, max in 1u64..100_000) {
            prop_assert!(
                calculate_backoff(attempt, base, max) <= calculate_backoff(attempt + 1, base, max)
            );
        }
    }
}
