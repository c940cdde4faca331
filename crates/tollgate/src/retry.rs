//! Retry policy: failure classification and backoff
//!
//! A [`RetryPolicy`] answers two questions for the orchestrator: is this
//! failure worth another attempt, and how long to wait before it. Failures
//! are inspected only through the [`TransportFailure`] trait, so any
//! transport error type can be guarded without wrapping it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY_MS, DEFAULT_MULTIPLIER,
    DEFAULT_RETRYABLE_STATUSES, MAX_BACKOFF_EXPONENT, MAX_MAX_ATTEMPTS,
};
use crate::error::{ConfigError, ConfigResult};

/// What the guard needs to know about a transport failure
///
/// Every method has a conservative default, so a plain error type only
/// needs an empty `impl`.
pub trait TransportFailure: std::error::Error + Send + Sync + 'static {
    /// HTTP status of the failed response, if one was received
    fn status(&self) -> Option<u16> {
        None
    }

    /// Server-requested pause before the next attempt (e.g. `Retry-After`)
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Whether the transport gave up because the caller cancelled
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// How a single failed attempt is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth another attempt
    Retryable,
    /// Returned to the caller immediately
    Fatal,
    /// Aborts the retry loop without touching the circuit
    Cancelled,
}

/// Randomization applied on top of the exponential backoff
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Jitter {
    /// No jitter
    #[default]
    None,
    /// Uniform in `[0, delay]`
    Full,
    /// Uniform in `[delay / 2, delay]`
    Equal,
}

impl Jitter {
    /// Randomize `delay` according to this mode
    pub fn apply(&self, delay: Duration) -> Duration {
        let millis = delay.as_millis() as u64;
        match self {
            Jitter::None => delay,
            Jitter::Full => Duration::from_millis(random_up_to(millis)),
            Jitter::Equal => {
                let half = millis / 2;
                Duration::from_millis(half + random_up_to(millis - half))
            }
        }
    }
}

fn random_up_to(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max)
}

type StatusPredicate = Arc<dyn Fn(u16) -> bool + Send + Sync>;
type ErrorPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Caller-supplied retry rules for one call site
///
/// Delays grow as `base_delay * multiplier^(attempt - 1)`, capped at
/// `max_delay`. When `honor_retry_after` is set, a failure's own
/// [`retry_after`](TransportFailure::retry_after) hint replaces the computed
/// delay.
pub struct RetryPolicy<E> {
    /// Maximum number of attempts, the first one included
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter: Jitter,
    pub honor_retry_after: bool,
    retryable_status: StatusPredicate,
    retryable_error: ErrorPredicate<E>,
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            multiplier: self.multiplier,
            max_delay_ms: self.max_delay_ms,
            jitter: self.jitter,
            honor_retry_after: self.honor_retry_after,
            retryable_status: Arc::clone(&self.retryable_status),
            retryable_error: Arc::clone(&self.retryable_error),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay_ms", &self.base_delay_ms)
            .field("multiplier", &self.multiplier)
            .field("max_delay_ms", &self.max_delay_ms)
            .field("jitter", &self.jitter)
            .field("honor_retry_after", &self.honor_retry_after)
            .finish_non_exhaustive()
    }
}

impl<E: 'static> Default for RetryPolicy<E> {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter: Jitter::None,
            honor_retry_after: true,
            retryable_status: Arc::new(|status: u16| DEFAULT_RETRYABLE_STATUSES.contains(&status)),
            // A failure without a status never reached the server
            retryable_error: Arc::new(|_: &E| true),
        }
    }
}

impl<E: 'static> RetryPolicy<E> {
    /// Create a policy builder
    pub fn builder() -> RetryPolicyBuilder<E> {
        RetryPolicyBuilder::new()
    }

    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be greater than 0"));
        }
        if self.max_attempts > MAX_MAX_ATTEMPTS {
            return Err(ConfigError::invalid(format!(
                "max_attempts cannot exceed {MAX_MAX_ATTEMPTS}"
            )));
        }
        if !(self.multiplier.is_finite() && self.multiplier > 0.0) {
            return Err(ConfigError::invalid("multiplier must be greater than 0"));
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(ConfigError::invalid("max_delay_ms cannot be less than base_delay_ms"));
        }
        Ok(())
    }

    /// Backoff before the attempt following attempt number `attempt` (1-based),
    /// before jitter
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(MAX_BACKOFF_EXPONENT) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = delay.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

impl<E: TransportFailure> RetryPolicy<E> {
    /// Decide how a failed attempt is handled
    ///
    /// Cancellation wins over everything. A failure with a status is judged
    /// by the status predicate alone; one without is judged by the error
    /// predicate.
    pub fn classify(&self, failure: &E) -> FailureClass {
        if failure.is_cancelled() {
            return FailureClass::Cancelled;
        }
        let retryable = match failure.status() {
            Some(status) => (self.retryable_status)(status),
            None => (self.retryable_error)(failure),
        };
        if retryable {
            FailureClass::Retryable
        } else {
            FailureClass::Fatal
        }
    }

    /// Pause before retrying after `failure` on attempt `attempt`
    pub fn delay_for(&self, attempt: u32, failure: &E) -> Duration {
        if self.honor_retry_after {
            if let Some(hint) = failure.retry_after() {
                return hint;
            }
        }
        self.jitter.apply(self.backoff_delay(attempt))
    }
}

/// Builder for RetryPolicy
pub struct RetryPolicyBuilder<E> {
    policy: RetryPolicy<E>,
}

impl<E: 'static> Default for RetryPolicyBuilder<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for RetryPolicyBuilder<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicyBuilder").field("policy", &self.policy).finish()
    }
}

impl<E: 'static> RetryPolicyBuilder<E> {
    /// Start from the default policy
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    /// Set the total attempts, including the first
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Set the delay before the first retry
    pub fn base_delay_ms(mut self, millis: u64) -> Self {
        self.policy.base_delay_ms = millis;
        self
    }

    /// Set the growth factor between consecutive delays
    pub fn multiplier(mut self, multiplier: f64) -> Self {
        self.policy.multiplier = multiplier;
        self
    }

    /// Cap the computed delay
    pub fn max_delay_ms(mut self, millis: u64) -> Self {
        self.policy.max_delay_ms = millis;
        self
    }

    /// Set the randomization mode
    pub fn jitter(mut self, jitter: Jitter) -> Self {
        self.policy.jitter = jitter;
        self
    }

    /// Let a failure's retry-after hint replace the computed delay
    pub fn honor_retry_after(mut self, honor: bool) -> Self {
        self.policy.honor_retry_after = honor;
        self
    }

    /// Retry a failed response when `predicate` returns true for its status
    pub fn retryable_status<P>(mut self, predicate: P) -> Self
    where
        P: Fn(u16) -> bool + Send + Sync + 'static,
    {
        self.policy.retryable_status = Arc::new(predicate);
        self
    }

    /// Retry exactly the listed statuses
    pub fn retryable_statuses(self, statuses: impl IntoIterator<Item = u16>) -> Self {
        let statuses: Vec<u16> = statuses.into_iter().collect();
        self.retryable_status(move |status| statuses.contains(&status))
    }

    /// Retry a status-less failure when `predicate` returns true for it
    pub fn retryable_error<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.policy.retryable_error = Arc::new(predicate);
        self
    }

    /// Validate and return the policy
    pub fn build(self) -> ConfigResult<RetryPolicy<E>> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestFailure;

    #[test]
    fn test_exponential_backoff() {
        let policy: RetryPolicy<TestFailure> = RetryPolicy::builder()
            .base_delay_ms(100)
            .multiplier(2.0)
            .max_delay_ms(1_000)
            .build()
            .unwrap();

        assert_eq!(policy.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.backoff_delay(u32::MAX), Duration::from_millis(1_000));
    }

    #[test]
    fn test_default_classification() {
        let policy = RetryPolicy::<TestFailure>::default();

        assert_eq!(policy.classify(&TestFailure::http(503)), FailureClass::Retryable);
        assert_eq!(policy.classify(&TestFailure::http(429)), FailureClass::Retryable);
        assert_eq!(policy.classify(&TestFailure::http(404)), FailureClass::Fatal);
        assert_eq!(policy.classify(&TestFailure::network()), FailureClass::Retryable);
        assert_eq!(policy.classify(&TestFailure::cancelled()), FailureClass::Cancelled);
    }

    #[test]
    fn test_custom_predicates() {
        let policy: RetryPolicy<TestFailure> = RetryPolicy::builder()
            .retryable_statuses([418])
            .retryable_error(|_| false)
            .build()
            .unwrap();

        assert_eq!(policy.classify(&TestFailure::http(418)), FailureClass::Retryable);
        assert_eq!(policy.classify(&TestFailure::http(503)), FailureClass::Fatal);
        assert_eq!(policy.classify(&TestFailure::network()), FailureClass::Fatal);
    }

    #[test]
    fn test_cancellation_wins_over_status() {
        let policy = RetryPolicy::<TestFailure>::default();
        let failure = TestFailure { cancelled: true, ..TestFailure::http(503) };
        assert_eq!(policy.classify(&failure), FailureClass::Cancelled);
    }

    #[test]
    fn test_retry_after_hint_overrides_backoff() {
        let policy = RetryPolicy::<TestFailure>::default();
        let hinted = TestFailure::http(429).with_retry_after(Duration::from_secs(7));

        assert_eq!(policy.delay_for(1, &hinted), Duration::from_secs(7));
        assert_eq!(policy.delay_for(1, &TestFailure::http(503)), Duration::from_millis(100));

        let ignoring: RetryPolicy<TestFailure> =
            RetryPolicy::builder().honor_retry_after(false).build().unwrap();
        assert_eq!(ignoring.delay_for(1, &hinted), Duration::from_millis(100));
    }

    #[test]
    fn test_jitter_bounds() {
        let delay = Duration::from_millis(1_000);
        for _ in 0..100 {
            assert!(Jitter::Full.apply(delay) <= delay);

            let equal = Jitter::Equal.apply(delay);
            assert!(equal >= Duration::from_millis(500) && equal <= delay);
        }
        assert_eq!(Jitter::None.apply(delay), delay);
        assert_eq!(Jitter::Full.apply(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_validation() {
        assert!(RetryPolicy::<TestFailure>::builder().max_attempts(0).build().is_err());
        assert!(RetryPolicy::<TestFailure>::builder().max_attempts(101).build().is_err());
        assert!(RetryPolicy::<TestFailure>::builder().multiplier(0.0).build().is_err());
        assert!(RetryPolicy::<TestFailure>::builder()
            .base_delay_ms(500)
            .max_delay_ms(100)
            .build()
            .is_err());
        assert!(RetryPolicy::<TestFailure>::default().validate().is_ok());
    }
}
