// Default values shared by policies and configuration
use std::time::Duration;

/// Default maximum number of attempts (first call included)
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default base delay for exponential backoff, in milliseconds
pub const DEFAULT_BASE_DELAY_MS: u64 = 100;

/// Default backoff multiplier
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Default maximum delay cap, in milliseconds
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;

/// Maximum exponent for exponential backoff calculation to prevent overflow
pub const MAX_BACKOFF_EXPONENT: u32 = 30;

/// Upper bound accepted for `max_attempts`
pub const MAX_MAX_ATTEMPTS: u32 = 100;

/// HTTP statuses retried by default
pub const DEFAULT_RETRYABLE_STATUSES: [u16; 6] = [408, 429, 500, 502, 503, 504];

/// Circuit breaker: default failure threshold
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Circuit breaker: default success threshold for recovery
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Circuit breaker: default cooldown before a trial call, in seconds
pub const DEFAULT_RESET_TIMEOUT_SECONDS: u64 = 60;

/// Circuit breaker: default trial calls admitted in half-open state
pub const DEFAULT_HALF_OPEN_TRIALS: u32 = 3;

/// Circuit breaker: default failure counting window, in seconds
pub const DEFAULT_FAILURE_WINDOW_SECONDS: u64 = 60;

/// Circuit breaker: bound on compare-and-swap retries per record update
pub const MAX_CAS_ATTEMPTS: u32 = 16;

/// Rate limiter: default requests per window
pub const DEFAULT_RATE_LIMIT: u64 = 100;

/// Rate limiter: default window length, in seconds
pub const DEFAULT_PERIOD_SECONDS: u64 = 60;

/// Rate limiter: lease on in-flight counters, so a crashed caller's permits
/// eventually drain
pub const CONCURRENCY_LEASE: Duration = Duration::from_secs(300);

/// Retry-after reported when a denial has no natural deadline
pub const MIN_RETRY_AFTER_SECONDS: u64 = 1;
