//! Retry combinator with exponential backoff.
//!
//! One combinator serves every retrying call site: stream resolution
//! fallbacks, download transfers, and auxiliary metadata fetches. Callers
//! supply the operation, a failure classifier, a [`RetryPolicy`], and a
//! [`CancellationToken`] owned by the request; cancelling the token aborts
//! both an in-flight attempt and a pending backoff timer.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use streamfetch_core::retry::{FailureType, RetryDecision, RetryPolicy};
//!
//! let policy = RetryPolicy::new(3, Duration::from_millis(100));
//! match policy.should_retry(FailureType::Transient, 1) {
//!     RetryDecision::Retry { delay, attempt } => {
//!         assert_eq!(delay, Duration::from_millis(100));
//!         assert_eq!(attempt, 2);
//!     }
//!     RetryDecision::DoNotRetry { reason } => panic!("{reason}"),
//! }
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Default number of retries after the initial attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap (32 seconds).
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);

/// Classification of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Temporary failure that may succeed on retry.
    ///
    /// Examples: network timeout, 5xx server errors, connection refused.
    Transient,

    /// Failure that won't succeed regardless of retries.
    ///
    /// Examples: 404 Not Found, invalid URL, disk full.
    Permanent,

    /// Server rate limiting (HTTP 429). Retried with backoff.
    RateLimited,
}

/// Decision on whether to retry a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Retry after the specified delay.
    Retry {
        /// How long to wait before retrying.
        delay: Duration,
        /// Which attempt number this will be (1-indexed, so first retry is attempt 2).
        attempt: u32,
    },

    /// Do not retry.
    DoNotRetry {
        /// Human-readable reason why retry is not attempted.
        reason: String,
    },
}

/// Backoff configuration.
///
/// # Delay Calculation
///
/// ```text
/// delay(n) = min(initial_delay * 2^n, max_delay) + jitter    (n = 0 for the first retry)
/// ```
///
/// Jitter is zero unless enabled with [`RetryPolicy::with_jitter`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries allowed after the initial attempt.
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
    max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            max_jitter: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given retry budget and first delay.
    #[must_use]
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            ..Self::default()
        }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Caps individual delays.
    #[must_use]
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Adds up to `max_jitter` of random delay to every backoff.
    #[must_use]
    pub fn with_jitter(mut self, max_jitter: Duration) -> Self {
        self.max_jitter = max_jitter;
        self
    }

    /// Returns the retry budget.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the delay before the first retry.
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Determines whether to retry.
    ///
    /// `attempt` is the 1-indexed attempt that just failed.
    #[instrument(skip(self), fields(max_retries = self.max_retries))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        if failure_type == FailureType::Permanent {
            return RetryDecision::DoNotRetry {
                reason: "permanent failure - retry would not help".to_string(),
            };
        }

        if attempt > self.max_retries {
            debug!(attempt, max = self.max_retries, "retry budget exhausted");
            return RetryDecision::DoNotRetry {
                reason: format!("max retries ({}) exhausted", self.max_retries),
            };
        }

        RetryDecision::Retry {
            delay: self.delay_for(attempt - 1),
            attempt: attempt + 1,
        }
    }

    /// Delay before retry number `retry_index` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, retry_index: u32) -> Duration {
        let factor = 2u32.checked_pow(retry_index).unwrap_or(u32::MAX);
        let base = self
            .initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);
        base + self.calculate_jitter()
    }

    fn calculate_jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let max_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }
}

/// Terminal outcome of a retried operation.
#[derive(Debug, Clone, Error)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error.
    #[error("retry budget exhausted after {attempts} attempt(s): {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// An attempt failed with an error the classifier marked permanent.
    #[error("non-retryable failure after {attempts} attempt(s): {source}")]
    Rejected {
        attempts: u32,
        #[source]
        source: E,
    },

    /// The owning request was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl<E> RetryError<E> {
    /// Returns the last operation error, if any.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::Rejected { source, .. } => Some(source),
            Self::Cancelled => None,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Number of attempts made before giving up (0 when cancelled).
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::Rejected { attempts, .. } => *attempts,
            Self::Cancelled => 0,
        }
    }
}

/// Runs `operation` until it succeeds, fails permanently, exhausts the
/// policy, or `cancel` fires.
///
/// `operation` receives the 1-indexed attempt number.
///
/// # Errors
///
/// See [`RetryError`].
pub async fn retry_with_backoff<T, E, Op, Fut, C>(
    key: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    classify: C,
    operation: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> FailureType,
    E: Display,
{
    retry_with_backoff_observed(key, policy, cancel, classify, |_, _, _| {}, operation).await
}

/// Same as [`retry_with_backoff`], calling `on_retry(next_attempt, delay, error)`
/// before each backoff sleep.
///
/// # Errors
///
/// See [`RetryError`].
#[instrument(skip_all, fields(key = %key, max_retries = policy.max_retries()))]
pub async fn retry_with_backoff_observed<T, E, Op, Fut, C, R>(
    key: &str,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    classify: C,
    mut on_retry: R,
    mut operation: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> FailureType,
    R: FnMut(u32, Duration, &E),
    E: Display,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RetryError::Cancelled),
            outcome = operation(attempt) => outcome,
        };

        let error = match outcome {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let failure_type = classify(&error);
        match policy.should_retry(failure_type, attempt) {
            RetryDecision::Retry {
                delay,
                attempt: next_attempt,
            } => {
                info!(
                    key = %key,
                    attempt = next_attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %error,
                    "retrying"
                );
                on_retry(next_attempt, delay, &error);
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(RetryError::Cancelled),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            RetryDecision::DoNotRetry { reason } => {
                debug!(key = %key, %reason, "not retrying");
                return Err(if failure_type == FailureType::Permanent {
                    RetryError::Rejected {
                        attempts: attempt,
                        source: error,
                    }
                } else {
                    RetryError::Exhausted {
                        attempts: attempt,
                        source: error,
                    }
                });
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Flaky(&'static str);

    impl Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    fn transient(_: &Flaky) -> FailureType {
        FailureType::Transient
    }

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 3);
        assert_eq!(policy.initial_delay(), Duration::from_secs(1));
        assert_eq!(policy.max_delay, Duration::from_secs(32));
        assert!(policy.max_jitter.is_zero());
    }

    #[test]
    fn test_delay_doubles_each_retry() {
        let policy = RetryPolicy::new(5, Duration::from_millis(250));
        assert_eq!(policy.delay_for(0), Duration::from_millis(250));
        assert_eq!(policy.delay_for(1), Duration::from_millis(500));
        assert_eq!(policy.delay_for(2), Duration::from_millis(1000));
    }

    #[test]
    fn test_delay_respects_max_delay() {
        let policy =
            RetryPolicy::new(10, Duration::from_secs(1)).with_max_delay(Duration::from_secs(5));
        assert_eq!(policy.delay_for(6), Duration::from_secs(5));
        assert_eq!(policy.delay_for(40), Duration::from_secs(5));
    }

    #[test]
    fn test_default_delay_caps_at_32_seconds() {
        let policy = RetryPolicy::new(10, Duration::from_secs(1));
        assert_eq!(policy.delay_for(4), Duration::from_secs(16));
        assert_eq!(policy.delay_for(5), Duration::from_secs(32));
        assert_eq!(policy.delay_for(6), Duration::from_secs(32));
    }

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100))
            .with_jitter(Duration::from_millis(50));
        for _ in 0..100 {
            let delay = policy.delay_for(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_should_retry_permanent_does_not_retry() {
        let decision = RetryPolicy::default().should_retry(FailureType::Permanent, 1);
        match decision {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("permanent")),
            RetryDecision::Retry { .. } => panic!("permanent failures must not retry"),
        }
    }

    #[test]
    fn test_should_retry_respects_budget() {
        let policy = RetryPolicy::new(2, Duration::from_millis(10));
        assert!(matches!(
            policy.should_retry(FailureType::Transient, 1),
            RetryDecision::Retry { attempt: 2, .. }
        ));
        assert!(matches!(
            policy.should_retry(FailureType::RateLimited, 2),
            RetryDecision::Retry { attempt: 3, .. }
        ));
        match policy.should_retry(FailureType::Transient, 3) {
            RetryDecision::DoNotRetry { reason } => assert!(reason.contains("exhausted")),
            RetryDecision::Retry { .. } => panic!("budget should be exhausted"),
        }
    }

    // ==================== Combinator Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_operation_uses_exponential_delays() {
        let policy = RetryPolicy::new(3, Duration::from_millis(100));
        let cancel = CancellationToken::new();
        let calls = Arc::new(std::sync::Mutex::new(Vec::<Instant>::new()));

        let recorded = Arc::clone(&calls);
        let result: Result<(), _> =
            retry_with_backoff("job-1", &policy, &cancel, transient, move |_| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().unwrap().push(Instant::now());
                    Err(Flaky("boom"))
                }
            })
            .await;

        match result {
            Err(RetryError::Exhausted { attempts, source }) => {
                assert_eq!(attempts, 4);
                assert_eq!(source, Flaky("boom"));
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 4, "initial attempt plus three retries");
        let gaps: Vec<Duration> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let result = retry_with_backoff("k", &policy, &cancel, transient, |attempt| async move {
            if attempt < 3 {
                Err(Flaky("not yet"))
            } else {
                Ok(attempt)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_rejected_without_retry() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = retry_with_backoff(
            "k",
            &policy,
            &cancel,
            |_: &Flaky| FailureType::Permanent,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Flaky("404")) }
            },
        )
        .await;
        assert!(matches!(result, Err(RetryError::Rejected { attempts: 1, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_pending_backoff_timer() {
        let policy = RetryPolicy::new(5, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicU32::new(0));

        let task_cancel = cancel.clone();
        let task_calls = Arc::clone(&calls);
        let handle = tokio::spawn(async move {
            retry_with_backoff("job-7", &policy, &task_cancel, transient, move |_| {
                task_calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Flaky("down")) }
            })
            .await
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();
        let result = handle.await.unwrap();

        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(calls.load(Ordering::SeqCst), 1, "no attempt after cancel");
    }

    #[tokio::test(start_paused = true)]
    async fn test_observer_sees_each_retry() {
        let policy = RetryPolicy::new(2, Duration::from_millis(5));
        let cancel = CancellationToken::new();
        let mut seen = Vec::new();
        let _ = retry_with_backoff_observed(
            "k",
            &policy,
            &cancel,
            transient,
            |attempt, delay, _err: &Flaky| seen.push((attempt, delay)),
            |_| async { Err::<(), _>(Flaky("x")) },
        )
        .await;
        assert_eq!(
            seen,
            vec![
                (2, Duration::from_millis(5)),
                (3, Duration::from_millis(10))
            ]
        );
    }
}
