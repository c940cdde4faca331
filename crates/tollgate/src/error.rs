//! Error taxonomy for guarded calls
//!
//! Callers need to tell "never attempted" (the call was throttled or the
//! circuit was open, so back off right away) apart from "attempted and
//! failed" (the dependency is misbehaving, so alert). [`GuardError`] keeps
//! those cases distinct and always carries the transport's own failure
//! verbatim when there is one.

use std::time::Duration;

use thiserror::Error;

/// Quota for a scope key is used up
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rate limit exceeded for `{scope_key}`, retry after {retry_after_seconds}s")]
pub struct RateLimitedError {
    /// Scope the quota belongs to
    pub scope_key: String,
    /// Seconds until the caller may try again
    pub retry_after_seconds: u64,
}

/// Circuit breaker for a scope key is denying calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("circuit open for `{scope_key}`, retry after {retry_after_seconds}s")]
pub struct CircuitOpenError {
    /// Scope the circuit belongs to
    pub scope_key: String,
    /// Seconds until the circuit will admit a trial call
    pub retry_after_seconds: u64,
}

/// Errors returned by [`RetryOrchestrator::execute`](crate::RetryOrchestrator::execute)
///
/// Generic over the transport's failure type `E` so the original failure is
/// never flattened into a string.
#[derive(Debug, Error)]
pub enum GuardError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The rate limiter denied the call before it reached the transport
    #[error(transparent)]
    RateLimited(#[from] RateLimitedError),

    /// The circuit breaker denied the call before it reached the transport
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// Every allowed attempt failed with a retryable failure
    ///
    /// Also returned when a retry is denied by the rate limiter or the
    /// circuit after the transport already failed, so the last failure is
    /// never lost.
    #[error("retries exhausted after {attempts} attempts")]
    RetryExhausted {
        attempts: u32,
        #[source]
        last_failure: E,
    },

    /// The transport failed with a failure no retry predicate matched
    #[error("attempt {attempt} failed with a non-retryable error")]
    Fatal {
        attempt: u32,
        #[source]
        source: E,
    },

    /// The transport reported cancellation; the retry loop was aborted
    #[error("attempt {attempt} was cancelled")]
    Cancelled {
        attempt: u32,
        #[source]
        source: E,
    },
}

impl<E> GuardError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether the transport was invoked at least once
    pub fn was_attempted(&self) -> bool {
        !matches!(self, Self::RateLimited(_) | Self::CircuitOpen(_))
    }

    /// Server- or guard-supplied pause before the caller should try again
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited(err) => Some(Duration::from_secs(err.retry_after_seconds)),
            Self::CircuitOpen(err) => Some(Duration::from_secs(err.retry_after_seconds)),
            _ => None,
        }
    }

    /// The transport failure, when one was produced
    pub fn transport_failure(&self) -> Option<&E> {
        match self {
            Self::RetryExhausted { last_failure, .. } => Some(last_failure),
            Self::Fatal { source, .. } | Self::Cancelled { source, .. } => Some(source),
            Self::RateLimited(_) | Self::CircuitOpen(_) => None,
        }
    }

    /// Consume the error, returning the transport failure if there is one
    pub fn into_transport_failure(self) -> Option<E> {
        match self {
            Self::RetryExhausted { last_failure, .. } => Some(last_failure),
            Self::Fatal { source, .. } | Self::Cancelled { source, .. } => Some(source),
            Self::RateLimited(_) | Self::CircuitOpen(_) => None,
        }
    }
}

/// Errors raised by [`Store`](crate::store::Store) backends
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached or refused the command
    #[error("store unavailable: {message}")]
    Unavailable { message: String },

    /// `increment` was called on a key holding a non-integer value
    #[error("value at `{key}` is not an integer")]
    NotAnInteger { key: String },

    /// A compare-and-swap loop gave up after too many lost races
    #[error("gave up updating `{key}` after {attempts} conflicting writes")]
    Contention { key: String, attempts: u32 },

    /// A value could not be encoded for storage
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Create an unavailable error from any displayable cause
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable { message: message.into() }
    }
}

#[cfg(feature = "redis")]
impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable { message: err.to_string() }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Configuration and policy validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid {format} format: {message}")]
    Parse { format: &'static str, message: String },

    #[error("Unsupported config format: {extension}")]
    UnsupportedFormat { extension: String },
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;
