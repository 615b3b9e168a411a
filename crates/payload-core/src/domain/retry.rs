//! # Retry Policy
//!
//! Pure functions of `(failure_count, error)`. `failure_count` is the number
//! of consecutive failures including the one just observed, so it is `1`
//! after the first failure.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::errors::PayloadError;

/// Default number of retries.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Default first retry delay.
pub const DEFAULT_RETRY_DELAY_BASE: Duration = Duration::from_millis(1_000);

/// Default retry delay cap.
pub const DEFAULT_RETRY_DELAY_MAX: Duration = Duration::from_millis(30_000);

type RetryPredicate = Arc<dyn Fn(u32, &PayloadError) -> bool + Send + Sync>;
type DelayFn = Arc<dyn Fn(u32, &PayloadError) -> Duration + Send + Sync>;

/// Whether to retry a failed fetch.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Never retry.
    Never,
    /// Retry forever.
    Always,
    /// Retry at most this many times.
    Count(u32),
    /// Custom predicate over `(failure_count, error)`.
    Predicate(RetryPredicate),
}

impl RetryPolicy {
    /// Build a predicate policy.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(u32, &PayloadError) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Whether the failure that brought the count to `failure_count` should be retried.
    ///
    /// Non-retriable errors are never retried, whatever the policy.
    pub fn should_retry(&self, failure_count: u32, error: &PayloadError) -> bool {
        if !error.is_retriable() {
            return false;
        }
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Always => true,
            RetryPolicy::Count(max) => failure_count <= *max,
            RetryPolicy::Predicate(f) => f(failure_count, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Count(DEFAULT_RETRY_COUNT)
    }
}

impl From<bool> for RetryPolicy {
    fn from(retry: bool) -> Self {
        if retry {
            RetryPolicy::Always
        } else {
            RetryPolicy::Never
        }
    }
}

impl From<u32> for RetryPolicy {
    fn from(count: u32) -> Self {
        RetryPolicy::Count(count)
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryPolicy::Never => write!(f, "Never"),
            RetryPolicy::Always => write!(f, "Always"),
            RetryPolicy::Count(n) => write!(f, "Count({n})"),
            RetryPolicy::Predicate(_) => write!(f, "Predicate(..)"),
        }
    }
}

/// How long to wait before a retry.
#[derive(Clone)]
pub enum RetryDelay {
    /// Same delay before every retry.
    Fixed(Duration),
    /// `min(base * 2^(failure_count - 1), max)`.
    Exponential {
        /// Delay before the first retry
        base: Duration,
        /// Upper bound
        max: Duration,
    },
    /// Custom function of `(failure_count, error)`.
    Custom(DelayFn),
}

impl RetryDelay {
    /// Build a custom delay function.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32, &PayloadError) -> Duration + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Delay before the retry following failure number `failure_count`.
    pub fn delay_for(&self, failure_count: u32, error: &PayloadError) -> Duration {
        match self {
            RetryDelay::Fixed(delay) => *delay,
            RetryDelay::Exponential { base, max } => exponential_backoff(failure_count, *base, *max),
            RetryDelay::Custom(f) => f(failure_count, error),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Exponential {
            base: DEFAULT_RETRY_DELAY_BASE,
            max: DEFAULT_RETRY_DELAY_MAX,
        }
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryDelay::Fixed(d) => write!(f, "Fixed({d:?})"),
            RetryDelay::Exponential { base, max } => {
                write!(f, "Exponential {{ base: {base:?}, max: {max:?} }}")
            }
            RetryDelay::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Capped exponential backoff. Saturates instead of overflowing.
pub fn exponential_backoff(failure_count: u32, base: Duration, max: Duration) -> Duration {
    let exponent = failure_count.saturating_sub(1).min(31);
    base.checked_mul(1u32 << exponent).unwrap_or(max).min(max)
}

/// Outcome of consulting the retry policy after a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait this long, then run the fetch function again.
    RetryAfter(Duration),
    /// Settle the entry in `Error`.
    GiveUp,
}

/// Combine policy and delay into a decision.
pub fn decide(
    policy: &RetryPolicy,
    delay: &RetryDelay,
    failure_count: u32,
    error: &PayloadError,
) -> RetryDecision {
    if policy.should_retry(failure_count, error) {
        RetryDecision::RetryAfter(delay.delay_for(failure_count, error))
    } else {
        RetryDecision::GiveUp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn fetch_err() -> PayloadError {
        PayloadError::fetch(anyhow::anyhow!("boom"))
    }

    #[test]
    fn test_count_allows_exactly_n_retries() {
        let policy = RetryPolicy::Count(3);
        let err = fetch_err();
        assert!(policy.should_retry(1, &err));
        assert!(policy.should_retry(3, &err));
        assert!(!policy.should_retry(4, &err));
    }

    #[test]
    fn test_default_is_bounded() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(DEFAULT_RETRY_COUNT + 1, &fetch_err()));
    }

    #[test]
    fn test_from_bool() {
        assert!(matches!(RetryPolicy::from(false), RetryPolicy::Never));
        assert!(RetryPolicy::from(true).should_retry(1_000, &fetch_err()));
    }

    #[test]
    fn test_non_retriable_errors_never_retry() {
        let policy = RetryPolicy::Always;
        assert!(!policy.should_retry(1, &PayloadError::Cancelled));
        assert!(!policy.should_retry(1, &PayloadError::Expired { payload_uuid: None }));
    }

    #[test]
    fn test_predicate_sees_count_and_error() {
        let policy = RetryPolicy::predicate(|count, err| count < 2 && err.is_retriable());
        assert!(policy.should_retry(1, &fetch_err()));
        assert!(!policy.should_retry(2, &fetch_err()));
    }

    #[test]
    fn test_exponential_backoff_doubles_then_caps() {
        let base = Duration::from_millis(1_000);
        let max = Duration::from_millis(30_000);
        assert_eq!(exponential_backoff(1, base, max), Duration::from_millis(1_000));
        assert_eq!(exponential_backoff(2, base, max), Duration::from_millis(2_000));
        assert_eq!(exponential_backoff(5, base, max), Duration::from_millis(16_000));
        assert_eq!(exponential_backoff(6, base, max), max);
        assert_eq!(exponential_backoff(u32::MAX, base, max), max);
    }

    #[test]
    fn test_decide() {
        let err = fetch_err();
        let delay = RetryDelay::Fixed(Duration::from_millis(10));
        assert_eq!(
            decide(&RetryPolicy::Count(1), &delay, 1, &err),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            decide(&RetryPolicy::Count(1), &delay, 2, &err),
            RetryDecision::GiveUp
        );
    }

    proptest! {
        #[test]
        fn prop_backoff_is_monotonic_and_capped(count in 1u32..64, base_ms in 1u64..5_000, max_ms in 5_000u64..120_000) {
            let base = Duration::from_millis(base_ms);
            let max = Duration::from_millis(max_ms);
            let current = exponential_backoff(count, base, max);
            let next = exponential_backoff(count + 1, base, max);
            prop_assert!(current <= max);
            prop_assert!(next >= current);
        }
    }
}
