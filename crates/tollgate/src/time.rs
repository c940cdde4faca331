//! Time abstraction for testability
//!
//! Rate windows, cooldowns and TTLs are all computed from wall-clock time
//! since the UNIX epoch, because that is the only time base that means the
//! same thing to every process sharing a store. The [`Clock`] trait lets
//! production code use the real clock and tests drive time by hand.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//!
//! use tollgate::time::{Clock, MockClock};
//!
//! let clock = MockClock::new();
//! assert_eq!(clock.epoch_seconds(), 0);
//!
//! clock.advance(Duration::from_secs(61));
//! assert_eq!(clock.epoch_seconds(), 61);
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Source of the two time bases the crate reads
///
/// `now` drives in-process expiry; the epoch helpers drive window and
/// cooldown arithmetic, which must agree across processes.
pub trait Clock: Send + Sync + 'static {
    /// Monotonic instant, compared against store TTL deadlines
    fn now(&self) -> Instant;

    /// Wall-clock time
    fn system_time(&self) -> SystemTime;

    /// Wall-clock time as milliseconds since the UNIX epoch
    ///
    /// Times before the epoch read as zero.
    fn millis_since_epoch(&self) -> u64 {
        let since = self.system_time().duration_since(UNIX_EPOCH).unwrap_or_default();
        u64::try_from(since.as_millis()).unwrap_or(u64::MAX)
    }

    /// Wall-clock time as whole seconds since the UNIX epoch
    fn epoch_seconds(&self) -> u64 {
        self.millis_since_epoch() / 1000
    }
}

/// Clock backed by the operating system
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}

impl<T: Clock> Clock for Arc<T> {
    fn now(&self) -> Instant {
        T::now(self)
    }

    fn system_time(&self) -> SystemTime {
        T::system_time(self)
    }
}

/// Hand-driven clock for tests
///
/// Wall-clock time starts at the UNIX epoch and only moves when the test
/// advances it, so window boundaries land on round numbers. Clones share
/// one position.
#[derive(Debug, Clone)]
pub struct MockClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Clock positioned at the UNIX epoch
    pub fn new() -> Self {
        Self { origin: Instant::now(), offset: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    /// Clock positioned `secs` seconds after the UNIX epoch
    pub fn at_epoch_seconds(secs: u64) -> Self {
        let clock = Self::new();
        clock.jump_to(Duration::from_secs(secs));
        clock
    }

    /// Move forward by `step`
    pub fn advance(&self, step: Duration) {
        *self.offset.lock() += step;
    }

    /// Move forward by `millis` milliseconds
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Move forward by `secs` seconds
    pub fn advance_secs(&self, secs: u64) {
        self.advance(Duration::from_secs(secs));
    }

    /// Place the clock `offset` after the epoch, possibly moving backwards
    pub fn jump_to(&self, offset: Duration) {
        *self.offset.lock() = offset;
    }

    /// Distance from the epoch
    pub fn offset(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.origin + self.offset()
    }

    fn system_time(&self) -> SystemTime {
        UNIX_EPOCH + self.offset()
    }
}
