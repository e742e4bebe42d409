use std::collections::BTreeSet;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};
use crate::state::ErrorKind;

/// Retry/backoff policy for the remote leg of a run.
///
/// Fields are private so a policy can only be obtained through
/// [`RetryPolicy::new`], which enforces `max_attempts >= 1` and
/// `backoff_multiplier >= 1.0`. A run takes the policy by value, so it cannot
/// change once the run has started.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(try_from = "RawRetryPolicy"))]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff_multiplier: f64,
    retryable_kinds: BTreeSet<ErrorKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            retryable_kinds: BTreeSet::from([ErrorKind::Transient]),
        }
    }
}

impl RetryPolicy {
    /// Validated policy.
    ///
    /// # Errors
    ///
    /// [`ModelError::ZeroAttempts`] when `max_attempts` is zero and
    /// [`ModelError::InvalidMultiplier`] for a multiplier below 1.0 or not
    /// finite.
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        backoff_multiplier: f64,
        retryable_kinds: impl IntoIterator<Item = ErrorKind>,
    ) -> Result<Self> {
        if max_attempts == 0 {
            return Err(ModelError::ZeroAttempts);
        }
        if !backoff_multiplier.is_finite() || backoff_multiplier < 1.0 {
            return Err(ModelError::InvalidMultiplier(backoff_multiplier));
        }

        Ok(Self {
            max_attempts,
            base_delay,
            backoff_multiplier,
            retryable_kinds: retryable_kinds.into_iter().collect(),
        })
    }

    /// Single attempt, no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            retryable_kinds: BTreeSet::new(),
        }
    }

    /// Total attempts, the first one included.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay after the first failed attempt.
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Factor applied to the delay after each further failure.
    pub fn backoff_multiplier(&self) -> f64 {
        self.backoff_multiplier
    }

    /// Kinds that are retried.
    pub fn retryable_kinds(&self) -> &BTreeSet<ErrorKind> {
        &self.retryable_kinds
    }

    /// Whether failures of `kind` earn another attempt.
    pub fn is_retryable(&self, kind: ErrorKind) -> bool {
        self.retryable_kinds.contains(&kind)
    }

    /// Delay to wait after `attempt` (1-based) failed, before the next one:
    /// `base_delay * backoff_multiplier^(attempt - 1)`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1);
        let factor = self
            .backoff_multiplier
            .powi(i32::try_from(exponent).unwrap_or(i32::MAX));
        let secs = self.base_delay.as_secs_f64() * factor;
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }

    /// Whether another attempt should follow a failed `attempt` of `kind`.
    pub fn should_retry(&self, attempt: u32, kind: ErrorKind) -> bool {
        attempt < self.max_attempts && self.is_retryable(kind)
    }
}

#[cfg(feature = "serde")]
#[derive(Deserialize)]
struct RawRetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    backoff_multiplier: f64,
    retryable_kinds: BTreeSet<ErrorKind>,
}

#[cfg(feature = "serde")]
impl TryFrom<RawRetryPolicy> for RetryPolicy {
    type Error = ModelError;

    fn try_from(raw: RawRetryPolicy) -> Result<Self> {
        RetryPolicy::new(
            raw.max_attempts,
            raw.base_delay,
            raw.backoff_multiplier,
            raw.retryable_kinds,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_geometrically() {
        let policy = RetryPolicy::new(
            4,
            Duration::from_millis(100),
            2.0,
            [ErrorKind::Transient],
        )
        .expect("valid policy");

        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(3), Duration::from_millis(400));
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert_eq!(
            RetryPolicy::new(0, Duration::ZERO, 1.0, []),
            Err(ModelError::ZeroAttempts)
        );
        assert_eq!(
            RetryPolicy::new(1, Duration::ZERO, 0.5, []),
            Err(ModelError::InvalidMultiplier(0.5))
        );
        assert!(RetryPolicy::new(1, Duration::ZERO, f64::NAN, []).is_err());
    }

    #[test]
    fn retries_only_listed_kinds_within_budget() {
        let policy = RetryPolicy::default();
        assert!(policy.should_retry(1, ErrorKind::Transient));
        assert!(policy.should_retry(2, ErrorKind::Transient));
        assert!(!policy.should_retry(3, ErrorKind::Transient));
        assert!(!policy.should_retry(1, ErrorKind::Permanent));
    }

    #[test]
    fn huge_exponents_saturate() {
        let policy = RetryPolicy::new(
            u32::MAX,
            Duration::from_secs(1),
            10.0,
            [ErrorKind::Transient],
        )
        .expect("valid policy");
        assert_eq!(policy.delay_after(10_000), Duration::MAX);
    }
}
