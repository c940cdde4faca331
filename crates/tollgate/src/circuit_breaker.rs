//! Store-backed circuit breaker
//!
//! Each scope key has one [`CircuitRecord`] persisted at `circuit:{key}`.
//! Every state change is a read-modify-write applied through a bounded
//! compare-and-swap loop, so concurrent callers (in one process or many)
//! never lose each other's updates. The transition rules themselves are
//! pure functions over the record, which keeps them easy to test.
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────────▶ Open
//!     ▲                                  │ reset timeout elapsed
//!     │ successes >= success_threshold   ▼
//!     └──────────────────────────── HalfOpen ──▶ Open (any failure)
//! ```
//!
//! The breaker never becomes a point of failure itself: an undecodable
//! record reads as a fresh Closed record, and store errors admit the call.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_FAILURE_WINDOW_SECONDS, DEFAULT_HALF_OPEN_TRIALS,
    DEFAULT_RESET_TIMEOUT_SECONDS, DEFAULT_SUCCESS_THRESHOLD, MAX_CAS_ATTEMPTS,
    MIN_RETRY_AFTER_SECONDS,
};
use crate::error::{CircuitOpenError, ConfigError, ConfigResult, StoreError, StoreResult};
use crate::store::{keys, Store};
use crate::time::{Clock, SystemClock};

//==============================================================================
// State and Record
//==============================================================================

/// Lifecycle position of one scope key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Healthy; calls flow and failures are counted
    #[default]
    Closed,
    /// Tripped; calls are rejected until the reset timeout passes
    Open,
    /// Probing; a bounded number of trial calls decide the next state
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Persisted breaker state for one scope key
///
/// Timestamps are milliseconds since the UNIX epoch. Every field has a
/// default so records written by older versions still decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitRecord {
    pub state: CircuitState,
    /// Failures counted toward the trip threshold
    pub failure_count: u32,
    /// Successful half-open trials
    pub success_count: u32,
    /// When the circuit last opened; `None` while Closed
    pub opened_at: Option<u64>,
    pub last_failure_at: Option<u64>,
    /// Half-open trials admitted in the current budget
    pub trial_count: u32,
    /// Calls counted in the current window (percentage mode)
    pub request_count: u32,
    pub window_started_at: Option<u64>,
    /// Last state change or half-open progress
    pub changed_at: Option<u64>,
    /// Held open by an operator until closed or reset
    pub forced: bool,
}

impl CircuitRecord {
    fn decode(scope_key: &str, raw: Option<&[u8]>) -> Self {
        let Some(raw) = raw else {
            return Self::default();
        };
        serde_json::from_slice(raw).unwrap_or_else(|err| {
            warn!(scope = scope_key, error = %err, "Discarding undecodable circuit record");
            Self::default()
        })
    }

    fn trip(&mut self, now: u64) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.changed_at = Some(now);
        self.success_count = 0;
        self.trial_count = 0;
    }

    fn close(&mut self, now: u64) {
        *self = Self { changed_at: Some(now), ..Self::default() };
    }
}

//==============================================================================
// Policy
//==============================================================================

/// How failures in the Closed state decide when to trip
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FailureMode {
    /// Trip after `failure_threshold` failures within the failure window
    #[default]
    Count,
    /// Trip when the failure ratio of a fixed window reaches `failure_ratio`,
    /// once at least `minimum_throughput` calls were seen
    Percentage {
        /// Failed share of calls that trips the circuit, in `(0, 1]`
        failure_ratio: f64,
        /// Calls a window must see before the ratio is considered
        minimum_throughput: u32,
    },
}

/// Thresholds and timings for one circuit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitPolicy {
    /// Failures (count mode) that trip a Closed circuit
    pub failure_threshold: u32,
    /// Seconds to wait before an open circuit admits trial calls
    pub reset_timeout_seconds: u64,
    /// Trial calls admitted per half-open budget
    pub half_open_trial_count: u32,
    /// Successful trials needed to close the circuit
    pub success_threshold: u32,
    /// Window over which Closed-state failures are counted
    pub failure_window_seconds: u64,
    pub mode: FailureMode,
    /// Whether a success in Closed state clears the failure count
    pub reset_on_success: bool,
}

impl Default for CircuitPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            reset_timeout_seconds: DEFAULT_RESET_TIMEOUT_SECONDS,
            half_open_trial_count: DEFAULT_HALF_OPEN_TRIALS,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            failure_window_seconds: DEFAULT_FAILURE_WINDOW_SECONDS,
            mode: FailureMode::Count,
            reset_on_success: false,
        }
    }
}

impl CircuitPolicy {
    /// Create a policy builder
    pub fn builder() -> CircuitPolicyBuilder {
        CircuitPolicyBuilder::new()
    }

    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid("failure_threshold must be greater than 0"));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid("success_threshold must be greater than 0"));
        }
        if self.half_open_trial_count == 0 {
            return Err(ConfigError::invalid("half_open_trial_count must be greater than 0"));
        }
        if self.success_threshold > self.half_open_trial_count {
            return Err(ConfigError::invalid(
                "success_threshold cannot exceed half_open_trial_count",
            ));
        }
        if self.failure_window_seconds == 0 {
            return Err(ConfigError::invalid("failure_window_seconds must be greater than 0"));
        }
        if let FailureMode::Percentage { failure_ratio, minimum_throughput } = self.mode {
            if !(failure_ratio > 0.0 && failure_ratio <= 1.0) {
                return Err(ConfigError::invalid("failure_ratio must be in (0, 1]"));
            }
            if minimum_throughput == 0 {
                return Err(ConfigError::invalid("minimum_throughput must be greater than 0"));
            }
        }
        Ok(())
    }

    fn reset_timeout_ms(&self) -> u64 {
        self.reset_timeout_seconds.saturating_mul(1000)
    }

    fn failure_window_ms(&self) -> u64 {
        self.failure_window_seconds.saturating_mul(1000)
    }
}

/// Builder for CircuitPolicy
#[derive(Debug, Default)]
pub struct CircuitPolicyBuilder {
    policy: CircuitPolicy,
}

impl CircuitPolicyBuilder {
    /// Start from the default policy
    pub fn new() -> Self {
        Self { policy: CircuitPolicy::default() }
    }

    /// Set the failure count that trips a Closed circuit
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.policy.failure_threshold = threshold;
        self
    }

    /// Set how long the circuit stays Open before a trial
    pub fn reset_timeout_seconds(mut self, seconds: u64) -> Self {
        self.policy.reset_timeout_seconds = seconds;
        self
    }

    /// Set the number of trial calls admitted while HalfOpen
    pub fn half_open_trial_count(mut self, count: u32) -> Self {
        self.policy.half_open_trial_count = count;
        self
    }

    /// Set the trial successes needed to close again
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.policy.success_threshold = threshold;
        self
    }

    /// Set the window failures are counted in
    pub fn failure_window_seconds(mut self, seconds: u64) -> Self {
        self.policy.failure_window_seconds = seconds;
        self
    }

    /// Switch to ratio-based tripping
    pub fn percentage(mut self, failure_ratio: f64, minimum_throughput: u32) -> Self {
        self.policy.mode = FailureMode::Percentage { failure_ratio, minimum_throughput };
        self
    }

    /// Clear the failure count on every Closed success
    pub fn reset_on_success(mut self, reset: bool) -> Self {
        self.policy.reset_on_success = reset;
        self
    }

    /// Validate and return the policy
    pub fn build(self) -> ConfigResult<CircuitPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

//==============================================================================
// Transition Rules
//==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    Allowed { transitioned: bool },
    Denied { retry_after_seconds: u64 },
}

fn seconds_until(remaining_ms: u64) -> u64 {
    remaining_ms.div_ceil(1000).max(MIN_RETRY_AFTER_SECONDS)
}

fn admit(record: &mut CircuitRecord, policy: &CircuitPolicy, now: u64) -> Admission {
    let timeout_ms = policy.reset_timeout_ms();

    if record.forced {
        return Admission::Denied { retry_after_seconds: seconds_until(timeout_ms) };
    }

    match record.state {
        CircuitState::Closed => Admission::Allowed { transitioned: false },
        CircuitState::Open => {
            let elapsed = record.opened_at.map_or(u64::MAX, |opened| now.saturating_sub(opened));
            if elapsed >= timeout_ms {
                record.state = CircuitState::HalfOpen;
                record.success_count = 0;
                record.trial_count = 1;
                record.changed_at = Some(now);
                Admission::Allowed { transitioned: true }
            } else {
                Admission::Denied { retry_after_seconds: seconds_until(timeout_ms - elapsed) }
            }
        }
        CircuitState::HalfOpen => {
            if record.trial_count < policy.half_open_trial_count {
                record.trial_count += 1;
                return Admission::Allowed { transitioned: false };
            }
            // Trials whose results never arrived must not wedge the circuit
            let idle = record.changed_at.map_or(u64::MAX, |changed| now.saturating_sub(changed));
            if idle >= timeout_ms {
                record.trial_count = 1;
                record.success_count = 0;
                record.changed_at = Some(now);
                Admission::Allowed { transitioned: false }
            } else {
                Admission::Denied { retry_after_seconds: MIN_RETRY_AFTER_SECONDS }
            }
        }
    }
}

/// Apply one call outcome, returning the new state if it changed
fn observe(
    record: &mut CircuitRecord,
    policy: &CircuitPolicy,
    success: bool,
    now: u64,
) -> Option<CircuitState> {
    if record.forced {
        return None;
    }

    match record.state {
        CircuitState::Closed => match policy.mode {
            FailureMode::Count => {
                if success {
                    if policy.reset_on_success {
                        record.failure_count = 0;
                    }
                    return None;
                }
                let window_expired = record
                    .last_failure_at
                    .is_some_and(|last| now.saturating_sub(last) >= policy.failure_window_ms());
                if window_expired {
                    record.failure_count = 0;
                }
                record.failure_count += 1;
                record.last_failure_at = Some(now);
                if record.failure_count >= policy.failure_threshold {
                    record.trip(now);
                    return Some(CircuitState::Open);
                }
                None
            }
            FailureMode::Percentage { failure_ratio, minimum_throughput } => {
                let window_expired = record
                    .window_started_at
                    .map_or(true, |start| now.saturating_sub(start) >= policy.failure_window_ms());
                if window_expired {
                    record.window_started_at = Some(now);
                    record.request_count = 0;
                    record.failure_count = 0;
                }
                record.request_count += 1;
                if !success {
                    record.failure_count += 1;
                    record.last_failure_at = Some(now);
                }
                let ratio = f64::from(record.failure_count) / f64::from(record.request_count);
                if !success && record.request_count >= minimum_throughput && ratio >= failure_ratio
                {
                    record.trip(now);
                    return Some(CircuitState::Open);
                }
                None
            }
        },
        CircuitState::HalfOpen => {
            if success {
                record.success_count += 1;
                record.changed_at = Some(now);
                if record.success_count >= policy.success_threshold {
                    record.close(now);
                    return Some(CircuitState::Closed);
                }
                None
            } else {
                record.last_failure_at = Some(now);
                record.trip(now);
                Some(CircuitState::Open)
            }
        }
        // Results of calls admitted before the trip change nothing
        CircuitState::Open => None,
    }
}

//==============================================================================
// Circuit Breaker
//==============================================================================

/// Per-key circuit breaker over a shared [`Store`]
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
///
/// use tollgate::circuit_breaker::{CircuitBreaker, CircuitPolicy, CircuitState};
/// use tollgate::store::MemoryStore;
///
/// # async fn example() -> Result<(), tollgate::StoreError> {
/// let breaker = CircuitBreaker::new(Arc::new(MemoryStore::new()));
/// let policy = CircuitPolicy::builder().failure_threshold(2).build().unwrap();
///
/// breaker.record_failure("billing", &policy).await;
/// breaker.record_failure("billing", &policy).await;
///
/// assert_eq!(breaker.state("billing").await?, CircuitState::Open);
/// assert!(breaker.allow_request("billing", &policy).await.is_err());
/// # Ok(())
/// # }
/// ```
pub struct CircuitBreaker<C: Clock = SystemClock> {
    store: Arc<dyn Store>,
    clock: Arc<C>,
}

impl<C: Clock> Clone for CircuitBreaker<C> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), clock: Arc::clone(&self.clock) }
    }
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker").finish_non_exhaustive()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Create a breaker over `store` using the system clock
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Create a breaker with a custom clock (useful for testing)
    pub fn with_clock(store: Arc<dyn Store>, clock: C) -> Self {
        Self { store, clock: Arc::new(clock) }
    }

    pub(crate) fn from_shared(store: Arc<dyn Store>, clock: Arc<C>) -> Self {
        Self { store, clock }
    }

    /// Decide whether a call for `key` may go through
    ///
    /// An open circuit whose reset timeout has elapsed moves to HalfOpen here,
    /// and this call is admitted as its first trial.
    pub async fn allow_request(
        &self,
        key: &str,
        policy: &CircuitPolicy,
    ) -> Result<(), CircuitOpenError> {
        let admission = self.update(key, |record, now| admit(record, policy, now)).await;

        match admission {
            Ok(Admission::Allowed { transitioned }) => {
                if transitioned {
                    info!(scope = key, "Circuit breaker half-open, admitting trial call");
                }
                Ok(())
            }
            Ok(Admission::Denied { retry_after_seconds }) => {
                debug!(scope = key, retry_after_seconds, "Circuit breaker rejecting call");
                Err(CircuitOpenError { scope_key: key.to_owned(), retry_after_seconds })
            }
            Err(err) => {
                warn!(scope = key, error = %err, "Circuit breaker store unavailable, failing open");
                Ok(())
            }
        }
    }

    /// Report the outcome of an admitted call
    pub async fn record_result(&self, key: &str, policy: &CircuitPolicy, success: bool) {
        let transition = self.update(key, |record, now| observe(record, policy, success, now)).await;

        match transition {
            Ok(Some(CircuitState::Open)) => {
                warn!(scope = key, "Circuit breaker opened");
            }
            Ok(Some(state)) => {
                info!(scope = key, %state, "Circuit breaker state changed");
            }
            Ok(None) => {}
            Err(err) => {
                warn!(scope = key, error = %err, "Failed to record circuit breaker outcome");
            }
        }
    }

    /// Shorthand for `record_result(key, policy, true)`
    pub async fn record_success(&self, key: &str, policy: &CircuitPolicy) {
        self.record_result(key, policy, true).await;
    }

    /// Shorthand for `record_result(key, policy, false)`
    pub async fn record_failure(&self, key: &str, policy: &CircuitPolicy) {
        self.record_result(key, policy, false).await;
    }

    /// Current state of the circuit for `key`
    ///
    /// Read-only: an Open circuit past its reset timeout still reports Open
    /// until the next [`allow_request`](Self::allow_request) moves it on.
    pub async fn state(&self, key: &str) -> StoreResult<CircuitState> {
        Ok(self.record(key).await?.state)
    }

    /// Snapshot of the full persisted record for `key`
    pub async fn record(&self, key: &str) -> StoreResult<CircuitRecord> {
        let raw = self.store.get(&keys::circuit(key)).await?;
        Ok(CircuitRecord::decode(key, raw.as_deref()))
    }

    /// Open the circuit for `key` and hold it open until
    /// [`force_close`](Self::force_close) or [`reset`](Self::reset)
    pub async fn force_open(&self, key: &str) -> StoreResult<()> {
        self.update(key, |record, now| {
            record.trip(now);
            record.forced = true;
        })
        .await?;
        warn!(scope = key, "Circuit breaker forced open");
        Ok(())
    }

    /// Close the circuit for `key`, clearing every counter
    pub async fn force_close(&self, key: &str) -> StoreResult<()> {
        self.update(key, |record, now| record.close(now)).await?;
        info!(scope = key, "Circuit breaker forced closed");
        Ok(())
    }

    /// Return the circuit for `key` to its initial state
    ///
    /// Idempotent: resetting a fresh or already-reset key writes nothing.
    pub async fn reset(&self, key: &str) -> StoreResult<()> {
        self.update(key, |record, _| *record = CircuitRecord::default()).await?;
        debug!(scope = key, "Circuit breaker reset");
        Ok(())
    }

    /// Apply `apply` to the record for `key` through a compare-and-swap loop
    ///
    /// `apply` may run several times, each time on a freshly read record.
    async fn update<T, F>(&self, key: &str, mut apply: F) -> StoreResult<T>
    where
        F: FnMut(&mut CircuitRecord, u64) -> T + Send,
        T: Send,
    {
        let storage_key = keys::circuit(key);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.store.get(&storage_key).await?;
            let mut record = CircuitRecord::decode(key, current.as_deref());
            let output = apply(&mut record, self.clock.millis_since_epoch());

            if current.is_none() && record == CircuitRecord::default() {
                return Ok(output);
            }
            let encoded = serde_json::to_vec(&record)?;
            if current.as_deref() == Some(encoded.as_slice()) {
                return Ok(output);
            }
            if self.store.compare_and_swap(&storage_key, current.as_deref(), &encoded, None).await?
            {
                return Ok(output);
            }
            debug!(scope = key, "Circuit record changed concurrently, retrying");
        }

        Err(StoreError::Contention { key: storage_key, attempts: MAX_CAS_ATTEMPTS })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::testing::UnavailableStore;
    use crate::time::MockClock;

    fn breaker() -> (CircuitBreaker<MockClock>, Arc<MemoryStore<MockClock>>, MockClock) {
        let clock = MockClock::new();
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let breaker = CircuitBreaker::with_clock(store.clone(), clock.clone());
        (breaker, store, clock)
    }

    fn policy() -> CircuitPolicy {
        CircuitPolicy::builder()
            .failure_threshold(3)
            .reset_timeout_seconds(30)
            .half_open_trial_count(2)
            .success_threshold(2)
            .build()
            .unwrap()
    }

    // =========================================================================
    // State Machine
    // =========================================================================

    /// Validates that exactly `failure_threshold` failures open a fresh circuit.
    ///
    /// Assertions:
    /// - The circuit stays Closed below the threshold.
    /// - `allow_request` is denied once Open, with the full cooldown reported.
    #[tokio::test]
    async fn test_opens_after_failure_threshold() {
        let (breaker, _store, _clock) = breaker();
        let policy = policy();

        for _ in 0..2 {
            breaker.record_failure("api", &policy).await;
        }
        assert_eq!(breaker.state("api").await.unwrap(), CircuitState::Closed);

        breaker.record_failure("api", &policy).await;
        assert_eq!(breaker.state("api").await.unwrap(), CircuitState::Open);

        let err = breaker.allow_request("api", &policy).await.unwrap_err();
        assert_eq!(err.scope_key, "api");
        assert_eq!(err.retry_after_seconds, 30);
    }

    #[tokio::test]
    async fn test_open_transitions_to_half_open_after_timeout() {
        let (breaker, _store, clock) = breaker();
        let policy = policy();
        for _ in 0..3 {
            breaker.record_failure("api", &policy).await;
        }

        clock.advance_secs(10);
        let err = breaker.allow_request("api", &policy).await.unwrap_err();
        assert_eq!(err.retry_after_seconds, 20);

        clock.advance_secs(20);
        assert!(breaker.allow_request("api", &policy).await.is_ok());
        let record = breaker.record("api").await.unwrap();
        assert_eq!(record.state, CircuitState::HalfOpen);
        assert_eq!(record.success_count, 0);
        assert_eq!(record.trial_count, 1);
    }

    #[tokio::test]
    async fn test_half_open_trial_budget() {
        let (breaker, _store, clock) = breaker();
        let policy = policy();
        for _ in 0..3 {
            breaker.record_failure("api", &policy).await;
        }
        clock.advance_secs(30);

        assert!(breaker.allow_request("api", &policy).await.is_ok());
        assert!(breaker.allow_request("api", &policy).await.is_ok());
        let err = breaker.allow_request("api", &policy).await.unwrap_err();
        assert_eq!(err.retry_after_seconds, MIN_RETRY_AFTER_SECONDS);
    }

    /// Validates that a half-open failure reopens the circuit with a new
    /// `opened_at`.
    #[tokio::test]
    async fn test_half_open_failure_reopens() {
        let (breaker, _store, clock) = breaker();
        let policy = policy();
        for _ in 0..3 {
            breaker.record_failure("api", &policy).await;
        }
        let first_opened = breaker.record("api").await.unwrap().opened_at;

        clock.advance_secs(31);
        breaker.allow_request("api", &policy).await.unwrap();
        breaker.record_failure("api", &policy).await;

        let record = breaker.record("api").await.unwrap();
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.opened_at, Some(31_000));
        assert_ne!(record.opened_at, first_opened);
        assert!(breaker.allow_request("api", &policy).await.is_err());
    }

    #[tokio::test]
    async fn test_half_open_successes_close() {
        let (breaker, _store, clock) = breaker();
        let policy = policy();
        for _ in 0..3 {
            breaker.record_failure("api", &policy).await;
        }
        clock.advance_secs(30);

        breaker.allow_request("api", &policy).await.unwrap();
        breaker.record_success("api", &policy).await;
        assert_eq!(breaker.state("api").await.unwrap(), CircuitState::HalfOpen);

        breaker.allow_request("api", &policy).await.unwrap();
        breaker.record_success("api", &policy).await;

        let record = breaker.record("api").await.unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failure_count, 0);
        assert_eq!(record.opened_at, None);
    }

    #[tokio::test]
    async fn test_lost_trials_do_not_wedge_half_open() {
        let (breaker, _store, clock) = breaker();
        let policy = policy();
        for _ in 0..3 {
            breaker.record_failure("api", &policy).await;
        }
        clock.advance_secs(30);
        breaker.allow_request("api", &policy).await.unwrap();
        breaker.allow_request("api", &policy).await.unwrap();
        assert!(breaker.allow_request("api", &policy).await.is_err());

        // Neither trial ever reports back
        clock.advance_secs(30);
        assert!(breaker.allow_request("api", &policy).await.is_ok());
    }

    #[tokio::test]
    async fn test_failure_window_restarts_count() {
        let (breaker, _store, clock) = breaker();
        let policy = CircuitPolicy::builder()
            .failure_threshold(3)
            .failure_window_seconds(10)
            .build()
            .unwrap();

        breaker.record_failure("api", &policy).await;
        breaker.record_failure("api", &policy).await;
        clock.advance_secs(10);
        breaker.record_failure("api", &policy).await;

        let record = breaker.record("api").await.unwrap();
        assert_eq!(record.state, CircuitState::Closed);
        assert_eq!(record.failure_count, 1);
    }

    #[tokio::test]
    async fn test_reset_on_success() {
        let (breaker, _store, _clock) = breaker();
        let keep = policy();
        let clear = CircuitPolicy { reset_on_success: true, ..policy() };

        breaker.record_failure("a", &keep).await;
        breaker.record_success("a", &keep).await;
        assert_eq!(breaker.record("a").await.unwrap().failure_count, 1);

        breaker.record_failure("b", &clear).await;
        breaker.record_success("b", &clear).await;
        assert_eq!(breaker.record("b").await.unwrap().failure_count, 0);
    }

    #[tokio::test]
    async fn test_keys_are_isolated() {
        let (breaker, _store, _clock) = breaker();
        let policy = policy();
        for _ in 0..3 {
            breaker.record_failure("down", &policy).await;
        }
        assert!(breaker.allow_request("down", &policy).await.is_err());
        assert!(breaker.allow_request("up", &policy).await.is_ok());
    }

    // =========================================================================
    // Percentage Mode
    // =========================================================================

    #[tokio::test]
    async fn test_percentage_mode_respects_minimum_throughput() {
        let (breaker, _store, _clock) = breaker();
        let policy = CircuitPolicy::builder().percentage(0.5, 4).build().unwrap();

        breaker.record_failure("api", &policy).await;
        breaker.record_failure("api", &policy).await;
        breaker.record_failure("api", &policy).await;
        assert_eq!(breaker.state("api").await.unwrap(), CircuitState::Closed);

        breaker.record_failure("api", &policy).await;
        assert_eq!(breaker.state("api").await.unwrap(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_percentage_mode_trips_on_ratio() {
        let (breaker, _store, clock) = breaker();
        let policy = CircuitPolicy::builder()
            .percentage(0.5, 4)
            .failure_window_seconds(60)
            .build()
            .unwrap();

        for _ in 0..3 {
            breaker.record_success("api", &policy).await;
        }
        breaker.record_failure("api", &policy).await;
        breaker.record_failure("api", &policy).await;
        assert_eq!(breaker.state("api").await.unwrap(), CircuitState::Closed);

        breaker.record_failure("api", &policy).await;
        assert_eq!(breaker.state("api").await.unwrap(), CircuitState::Open);

        // A new window starts from scratch
        breaker.force_close("api").await.unwrap();
        clock.advance_secs(61);
        breaker.record_failure("api", &policy).await;
        let record = breaker.record("api").await.unwrap();
        assert_eq!(record.request_count, 1);
        assert_eq!(record.state, CircuitState::Closed);
    }

    // =========================================================================
    // Operational Controls
    // =========================================================================

    #[tokio::test]
    async fn test_force_open_holds_until_closed() {
        let (breaker, _store, clock) = breaker();
        let policy = policy();

        breaker.force_open("api").await.unwrap();
        clock.advance_secs(3600);
        assert!(breaker.allow_request("api", &policy).await.is_err());

        breaker.force_close("api").await.unwrap();
        assert!(breaker.allow_request("api", &policy).await.is_ok());
        assert_eq!(breaker.state("api").await.unwrap(), CircuitState::Closed);
    }

    /// Validates that `reset` always yields a Closed record and is idempotent.
    ///
    /// Assertions:
    /// - State is Closed with zero failures after the first and second reset.
    /// - Resetting an unknown key writes nothing to the store.
    #[tokio::test]
    async fn test_reset_is_idempotent() {
        let (breaker, store, _clock) = breaker();
        let policy = policy();
        for _ in 0..3 {
            breaker.record_failure("api", &policy).await;
        }

        for _ in 0..2 {
            breaker.reset("api").await.unwrap();
            let record = breaker.record("api").await.unwrap();
            assert_eq!(record.state, CircuitState::Closed);
            assert_eq!(record.failure_count, 0);
        }

        breaker.reset("never-seen").await.unwrap();
        assert_eq!(store.get(&keys::circuit("never-seen")).await.unwrap(), None);
    }

    // =========================================================================
    // Degraded Store
    // =========================================================================

    #[tokio::test]
    async fn test_corrupt_record_reads_as_closed() {
        let (breaker, store, _clock) = breaker();
        store.compare_and_swap(&keys::circuit("api"), None, b"{not json", None).await.unwrap();

        assert_eq!(breaker.state("api").await.unwrap(), CircuitState::Closed);
        assert!(breaker.allow_request("api", &policy()).await.is_ok());

        breaker.record_failure("api", &policy()).await;
        assert_eq!(breaker.record("api").await.unwrap().failure_count, 1);
    }

    #[test]
    fn test_record_decodes_with_missing_fields() {
        let raw = br#"{"state":"open","failureCount":5,"successCount":0,"openedAt":1000,"lastFailureAt":1000}"#;
        let record = CircuitRecord::decode("api", Some(raw));
        assert_eq!(record.state, CircuitState::Open);
        assert_eq!(record.failure_count, 5);
        assert_eq!(record.opened_at, Some(1000));
        assert!(!record.forced);
    }

    #[tokio::test]
    async fn test_fails_open_when_store_unavailable() {
        let breaker = CircuitBreaker::with_clock(Arc::new(UnavailableStore), MockClock::new());
        let policy = policy();

        for _ in 0..10 {
            breaker.record_failure("api", &policy).await;
        }
        assert!(breaker.allow_request("api", &policy).await.is_ok());
        assert!(breaker.state("api").await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures_are_all_counted() {
        let (breaker, _store, _clock) = breaker();
        let policy = CircuitPolicy::builder().failure_threshold(1000).build().unwrap();
        let mut handles = Vec::new();

        for _ in 0..4 {
            let breaker = breaker.clone();
            let policy = policy.clone();
            handles.push(tokio::spawn(async move {
                for _ in 0..5 {
                    breaker.record_failure("api", &policy).await;
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(breaker.record("api").await.unwrap().failure_count, 20);
    }

    #[test]
    fn test_policy_validation() {
        assert!(CircuitPolicy::builder().failure_threshold(0).build().is_err());
        assert!(CircuitPolicy::builder().half_open_trial_count(1).success_threshold(2).build().is_err());
        assert!(CircuitPolicy::builder().percentage(1.5, 10).build().is_err());
        assert!(CircuitPolicy::builder().percentage(0.5, 0).build().is_err());
        assert!(CircuitPolicy::default().validate().is_ok());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }
}
