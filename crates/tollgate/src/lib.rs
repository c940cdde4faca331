//! Resilience and throttling core for outbound HTTP calls.
//!
//! Every guarded call goes through [`RetryOrchestrator::execute`], which
//! consults a client-side [`RateLimiter`] and a per-key [`CircuitBreaker`]
//! before each attempt, invokes the transport once, and retries retryable
//! failures with exponential backoff. All mutable state lives behind the
//! [`Store`] trait, so several processes can share one quota or one circuit
//! by pointing at the same backend.
//!
//! # Modules
//!
//! - [`store`]: atomic key-value contract, in-memory and Redis backends
//! - [`rate_limiter`]: fixed and sliding window admission, concurrency caps
//! - [`circuit_breaker`]: Closed / Open / HalfOpen state machine per key
//! - [`retry`]: failure classification and backoff
//! - [`orchestrator`]: the attempt loop tying the above together
//! - [`config`]: TOML/JSON configuration with environment overrides
//! - [`observability`]: tracing setup and guard counters
//!
//! # Feature Flags
//!
//! - `redis`: enables [`store::RedisStore`]
//! - `test-utils`: exposes the [`testing`] doubles to downstream crates

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod circuit_breaker;
pub mod config;
pub mod constants;
pub mod error;
pub mod observability;
pub mod orchestrator;
pub mod rate_limiter;
pub mod retry;
pub mod store;
pub mod time;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(any(feature = "test-utils", test))]
pub mod testing;

// Re-export commonly used types and traits for convenience
// ------------------------
pub use circuit_breaker::{CircuitBreaker, CircuitPolicy, CircuitRecord, CircuitState, FailureMode};
pub use config::TollgateConfig;
pub use error::{
    CircuitOpenError, ConfigError, ConfigResult, GuardError, RateLimitedError, StoreError,
    StoreResult,
};
pub use observability::{GuardMetrics, GuardMetricsSnapshot};
pub use orchestrator::{ExecutionOutcome, RetryOrchestrator};
pub use rate_limiter::{
    ConcurrencyPermit, RateLimitDecision, RateLimitPolicy, RateLimiter, WindowAlgorithm,
};
pub use retry::{FailureClass, Jitter, RetryPolicy, TransportFailure};
pub use store::{MemoryStore, Store};
pub use time::{Clock, MockClock, SystemClock};
