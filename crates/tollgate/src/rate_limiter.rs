//! Client-side rate limiting over a shared [`Store`]
//!
//! Two counting algorithms sit behind the same [`RateLimiter`] interface:
//!
//! - **Fixed window** (default): one counter per `period`-aligned bucket.
//!   O(1) storage and a single atomic increment per call, at the price of
//!   letting up to `2 * limit` calls through around a window boundary.
//! - **Sliding window**: the previous bucket's count is weighted by how much
//!   of it still overlaps the trailing period. Smooths the boundary burst
//!   for one extra read per call.
//!
//! An optional concurrency limit bounds in-flight calls per key
//! independently of the window quota.
//!
//! If the store cannot be reached the limiter fails open: the call is
//! admitted and a warning is logged, because blocking all outbound traffic
//! on a cache outage is worse than briefly exceeding a quota.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{
    CONCURRENCY_LEASE, DEFAULT_PERIOD_SECONDS, DEFAULT_RATE_LIMIT, MAX_CAS_ATTEMPTS,
    MIN_RETRY_AFTER_SECONDS,
};
use crate::error::{ConfigError, ConfigResult, RateLimitedError, StoreError, StoreResult};
use crate::store::{keys, parse_counter, Store};
use crate::time::{Clock, SystemClock};

/// Counting algorithm used for the window quota
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAlgorithm {
    /// Non-overlapping buckets aligned to the UNIX epoch
    #[default]
    FixedWindow,
    /// Weighted blend of the current and previous bucket
    SlidingWindow,
}

/// Quota applied to one scope key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    /// Calls admitted per window
    pub limit: u64,
    /// Window length in seconds
    pub period_seconds: u64,
    /// Maximum calls in flight at once, if bounded
    pub concurrency_limit: Option<u64>,
    /// Counting algorithm
    pub algorithm: WindowAlgorithm,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            limit: DEFAULT_RATE_LIMIT,
            period_seconds: DEFAULT_PERIOD_SECONDS,
            concurrency_limit: None,
            algorithm: WindowAlgorithm::FixedWindow,
        }
    }
}

impl RateLimitPolicy {
    /// Fixed-window policy admitting `limit` calls every `period_seconds`
    pub fn new(limit: u64, period_seconds: u64) -> Self {
        Self { limit, period_seconds, ..Self::default() }
    }

    /// Create a policy builder
    pub fn builder() -> RateLimitPolicyBuilder {
        RateLimitPolicyBuilder::new()
    }

    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.period_seconds == 0 {
            return Err(ConfigError::invalid("period_seconds must be greater than 0"));
        }
        if self.concurrency_limit == Some(0) {
            return Err(ConfigError::invalid("concurrency_limit must be greater than 0"));
        }
        Ok(())
    }

    fn period(&self) -> u64 {
        // Guard the arithmetic below against an unvalidated zero period
        self.period_seconds.max(1)
    }

    /// Start of the window containing `now` (seconds since the UNIX epoch)
    pub fn window_start(&self, now: u64) -> u64 {
        now / self.period() * self.period()
    }

    fn counter_ttl(&self) -> Duration {
        let secs = match self.algorithm {
            WindowAlgorithm::FixedWindow => self.period(),
            // The previous bucket is still read during the next window
            WindowAlgorithm::SlidingWindow => self.period() * 2,
        };
        Duration::from_secs(secs)
    }
}

/// Builder for RateLimitPolicy
#[derive(Debug, Default)]
pub struct RateLimitPolicyBuilder {
    policy: RateLimitPolicy,
}

impl RateLimitPolicyBuilder {
    /// Start from the default policy
    pub fn new() -> Self {
        Self { policy: RateLimitPolicy::default() }
    }

    /// Set the calls admitted per window
    pub fn limit(mut self, limit: u64) -> Self {
        self.policy.limit = limit;
        self
    }

    /// Set the window length
    pub fn period_seconds(mut self, period: u64) -> Self {
        self.policy.period_seconds = period;
        self
    }

    /// Bound in-flight calls per key
    pub fn concurrency_limit(mut self, limit: u64) -> Self {
        self.policy.concurrency_limit = Some(limit);
        self
    }

    /// Count with the weighted sliding window
    pub fn sliding_window(mut self) -> Self {
        self.policy.algorithm = WindowAlgorithm::SlidingWindow;
        self
    }

    /// Validate and return the policy
    pub fn build(self) -> ConfigResult<RateLimitPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Result of a [`RateLimiter::try_acquire`] call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the call may proceed
    pub allowed: bool,
    /// Seconds until a denied call may be retried (0 when allowed)
    pub retry_after_seconds: u64,
    /// Calls left in the current window
    pub remaining: u64,
}

impl RateLimitDecision {
    fn allow(remaining: u64) -> Self {
        Self { allowed: true, retry_after_seconds: 0, remaining }
    }

    fn deny(retry_after_seconds: u64) -> Self {
        Self { allowed: false, retry_after_seconds, remaining: 0 }
    }

    /// Convert a denial into the typed error surfaced to callers
    pub fn into_result(self, scope_key: &str) -> Result<Self, RateLimitedError> {
        if self.allowed {
            Ok(self)
        } else {
            Err(RateLimitedError {
                scope_key: scope_key.to_owned(),
                retry_after_seconds: self.retry_after_seconds,
            })
        }
    }
}

/// Admission gate over per-key counting windows
///
/// Cheap to clone; clones share the same store and clock.
pub struct RateLimiter<C: Clock = SystemClock> {
    store: Arc<dyn Store>,
    clock: Arc<C>,
}

impl<C: Clock> Clone for RateLimiter<C> {
    fn clone(&self) -> Self {
        Self { store: Arc::clone(&self.store), clock: Arc::clone(&self.clock) }
    }
}

impl<C: Clock> fmt::Debug for RateLimiter<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}

impl RateLimiter<SystemClock> {
    /// Create a limiter over `store` using the system clock
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_clock(store, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    /// Create a limiter with a custom clock (useful for testing)
    pub fn with_clock(store: Arc<dyn Store>, clock: C) -> Self {
        Self { store, clock: Arc::new(clock) }
    }

    pub(crate) fn from_shared(store: Arc<dyn Store>, clock: Arc<C>) -> Self {
        Self { store, clock }
    }

    /// Count one call against the window quota for `key`
    ///
    /// Denied calls are counted too, so a client hammering a closed window
    /// does not earn extra capacity.
    pub async fn try_acquire(&self, key: &str, policy: &RateLimitPolicy) -> RateLimitDecision {
        let now = self.clock.epoch_seconds();
        let period = policy.period();
        let window_start = policy.window_start(now);
        let window_end = window_start + period;
        let counter = keys::rate_window(key, window_start);

        let count = match self.store.increment(&counter, 1, Some(policy.counter_ttl())).await {
            Ok(count) => count.max(0) as u64,
            Err(err) => {
                warn!(scope = key, error = %err, "Rate limiter store unavailable, failing open");
                return RateLimitDecision::allow(policy.limit);
            }
        };

        let decision = match policy.algorithm {
            WindowAlgorithm::FixedWindow => {
                if count > policy.limit {
                    RateLimitDecision::deny(window_end - now)
                } else {
                    RateLimitDecision::allow(policy.limit - count)
                }
            }
            WindowAlgorithm::SlidingWindow => {
                let previous = self.previous_window_count(key, window_start, period).await;
                sliding_decision(policy.limit, period, now - window_start, previous, count)
            }
        };

        if decision.allowed {
            debug!(scope = key, remaining = decision.remaining, "Rate limiter admitted call");
        } else {
            debug!(
                scope = key,
                retry_after_seconds = decision.retry_after_seconds,
                "Rate limiter denied call"
            );
        }
        decision
    }

    /// Calls left in the current window for `key`, without consuming one
    pub async fn remaining(&self, key: &str, policy: &RateLimitPolicy) -> u64 {
        let now = self.clock.epoch_seconds();
        let window_start = policy.window_start(now);
        let current = self.window_count(key, window_start).await;

        match policy.algorithm {
            WindowAlgorithm::FixedWindow => policy.limit.saturating_sub(current),
            WindowAlgorithm::SlidingWindow => {
                let previous = self.previous_window_count(key, window_start, policy.period()).await;
                let estimate =
                    weighted_estimate(policy.period(), now - window_start, previous, current);
                policy.limit.saturating_sub(estimate.ceil() as u64)
            }
        }
    }

    /// When `key` gets its full quota back, in seconds since the UNIX epoch
    ///
    /// Under a fixed window that is the end of the current window. Under a
    /// sliding window, calls already counted in the current bucket keep
    /// weighing on the estimate until the end of the next one.
    pub async fn reset_at(&self, key: &str, policy: &RateLimitPolicy) -> u64 {
        let window_end = policy.window_start(self.clock.epoch_seconds()) + policy.period();
        match policy.algorithm {
            WindowAlgorithm::FixedWindow => window_end,
            WindowAlgorithm::SlidingWindow => {
                let window_start = window_end - policy.period();
                if self.window_count(key, window_start).await > 0 {
                    window_end + policy.period()
                } else {
                    window_end
                }
            }
        }
    }

    /// Reserve an in-flight slot for `key` if the policy bounds concurrency
    ///
    /// Returns `Ok(None)` when the policy has no concurrency limit or the
    /// store is unavailable (fail open). The returned permit must be
    /// [released](ConcurrencyPermit::release) when the call finishes.
    pub async fn acquire_concurrency(
        &self,
        key: &str,
        policy: &RateLimitPolicy,
    ) -> Result<Option<ConcurrencyPermit>, RateLimitedError> {
        let Some(limit) = policy.concurrency_limit else {
            return Ok(None);
        };
        let counter = keys::concurrency(key);
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        match adjust_in_flight(self.store.as_ref(), &counter, 1, limit).await {
            Ok(SlotChange::Applied(in_flight)) => {
                debug!(scope = key, in_flight, limit, "Concurrency slot acquired");
            }
            Ok(SlotChange::Unchanged) => {
                debug!(scope = key, limit, "Concurrency limit reached");
                return Err(RateLimitedError {
                    scope_key: key.to_owned(),
                    retry_after_seconds: MIN_RETRY_AFTER_SECONDS,
                });
            }
            Err(err @ StoreError::Contention { .. }) => {
                debug!(scope = key, error = %err, "Concurrency slot contended, denying");
                return Err(RateLimitedError {
                    scope_key: key.to_owned(),
                    retry_after_seconds: MIN_RETRY_AFTER_SECONDS,
                });
            }
            Err(err) => {
                warn!(scope = key, error = %err, "Concurrency limiter store unavailable, failing open");
                return Ok(None);
            }
        }

        Ok(Some(ConcurrencyPermit {
            store: Arc::clone(&self.store),
            counter,
            released: false,
        }))
    }

    async fn window_count(&self, key: &str, window_start: u64) -> u64 {
        match self.store.get(&keys::rate_window(key, window_start)).await {
            Ok(Some(raw)) => parse_counter(&raw).unwrap_or(0).max(0) as u64,
            Ok(None) => 0,
            Err(err) => {
                warn!(scope = key, error = %err, "Rate limiter store unavailable");
                0
            }
        }
    }

    async fn previous_window_count(&self, key: &str, window_start: u64, period: u64) -> u64 {
        match window_start.checked_sub(period) {
            Some(previous_start) => self.window_count(key, previous_start).await,
            None => 0,
        }
    }
}

/// Previous bucket's count scaled by its overlap with the trailing period
fn weighted_estimate(period: u64, elapsed: u64, previous: u64, current: u64) -> f64 {
    let overlap = period.saturating_sub(elapsed) as f64 / period as f64;
    previous as f64 * overlap + current as f64
}

fn sliding_decision(
    limit: u64,
    period: u64,
    elapsed: u64,
    previous: u64,
    current: u64,
) -> RateLimitDecision {
    let estimate = weighted_estimate(period, elapsed, previous, current);
    if estimate <= limit as f64 {
        return RateLimitDecision::allow(limit.saturating_sub(estimate.ceil() as u64));
    }

    let until_window_end = period - elapsed;
    if current >= limit || previous == 0 {
        return RateLimitDecision::deny(until_window_end.max(MIN_RETRY_AFTER_SECONDS));
    }
    // Smallest t with previous * (period - t) / period + current <= limit
    let headroom = limit - current;
    let target_elapsed = period.saturating_sub(headroom * period / previous);
    let wait = target_elapsed.saturating_sub(elapsed);
    RateLimitDecision::deny(wait.clamp(MIN_RETRY_AFTER_SECONDS, until_window_end.max(1)))
}

/// Result of one in-flight counter adjustment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotChange {
    Applied(i64),
    /// Acquire at the limit, or release with nothing held
    Unchanged,
}

/// Move the in-flight counter by `delta` within `[0, limit]`
///
/// Every successful write renews the lease, so the counter only expires
/// once no permit has been acquired or released for a whole lease. A
/// missing or unreadable counter reads as zero.
async fn adjust_in_flight(
    store: &dyn Store,
    counter: &str,
    delta: i64,
    limit: i64,
) -> StoreResult<SlotChange> {
    for _ in 0..MAX_CAS_ATTEMPTS {
        let raw = store.get(counter).await?;
        let current = raw.as_deref().and_then(parse_counter).unwrap_or(0).max(0);
        let next = current.saturating_add(delta);
        if next < 0 || next > limit {
            return Ok(SlotChange::Unchanged);
        }
        let value = next.to_string();
        if store
            .compare_and_swap(counter, raw.as_deref(), value.as_bytes(), Some(CONCURRENCY_LEASE))
            .await?
        {
            return Ok(SlotChange::Applied(next));
        }
    }
    Err(StoreError::Contention { key: counter.to_owned(), attempts: MAX_CAS_ATTEMPTS })
}

/// In-flight slot held for the duration of one call
///
/// Call [`release`](Self::release) when the call finishes. A permit that is
/// dropped without being released is only reclaimed once the key sees no
/// acquire or release for a whole lease.
#[must_use = "a concurrency permit must be released when the call finishes"]
pub struct ConcurrencyPermit {
    store: Arc<dyn Store>,
    counter: String,
    released: bool,
}

impl fmt::Debug for ConcurrencyPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrencyPermit")
            .field("counter", &self.counter)
            .field("released", &self.released)
            .finish()
    }
}

impl ConcurrencyPermit {
    /// Give the slot back
    ///
    /// A counter that already expired is left absent rather than driven
    /// below zero.
    pub async fn release(mut self) {
        self.released = true;
        match adjust_in_flight(self.store.as_ref(), &self.counter, -1, i64::MAX).await {
            Ok(SlotChange::Applied(_)) => {}
            Ok(SlotChange::Unchanged) => {
                debug!(counter = %self.counter, "Concurrency lease already expired");
            }
            Err(err) => {
                warn!(counter = %self.counter, error = %err, "Failed to release concurrency slot");
            }
        }
    }
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                counter = %self.counter,
                "Concurrency permit dropped without release; slot held until lease expiry"
            );
        }
    }
}
