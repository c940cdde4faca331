//! Atomic key-value storage for limiter and breaker state
//!
//! All mutable state lives behind the [`Store`] trait so that several
//! processes can share one quota or one circuit. The trait is deliberately
//! small: every read-modify-write the core performs is expressed as either
//! [`increment`](Store::increment) or a
//! [`compare_and_swap`](Store::compare_and_swap) loop, never as a separate
//! read followed by a blind write.
//!
//! ## Backends
//!
//! | Backend | Scope | Atomicity |
//! |---------|-------|-----------|
//! | [`MemoryStore`] | single process | per-key mutex |
//! | `RedisStore` (feature `redis`) | shared | server-side Lua scripts |
//!
//! ## Key layout
//!
//! ```text
//! ratelimit:{scope}:{window_start}  -> decimal counter, TTL = period
//! concurrency:{scope}               -> decimal counter, TTL = lease
//! circuit:{scope}                   -> JSON CircuitRecord, no TTL
//! ```

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis_store;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Minimal atomic key-value contract
///
/// Implementations must make each call atomic with respect to other calls
/// on the same key. No multi-key atomicity is required or assumed.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Read the current value of `key`, or `None` if absent or expired
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Replace the value of `key` with `new_value` if it currently equals
    /// `expected`
    ///
    /// `expected = None` means the key must be absent. `ttl = None` stores
    /// the value without expiry. Returns `false` when the current value did
    /// not match, in which case nothing was written.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: &[u8],
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    /// Add `delta` to the integer at `key` and return the new value
    ///
    /// A missing key counts as zero. `ttl` is applied only when this call
    /// creates the key, so a fixed window expires on schedule no matter how
    /// many increments it sees.
    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> StoreResult<i64>;
}

/// Key builders for the persisted layout
pub mod keys {
    /// Counter for one fixed rate window
    pub fn rate_window(scope: &str, window_start: u64) -> String {
        format!("ratelimit:{scope}:{window_start}")
    }

    /// In-flight counter for the concurrency limiter
    pub fn concurrency(scope: &str) -> String {
        format!("concurrency:{scope}")
    }

    /// Serialized circuit record
    pub fn circuit(scope: &str) -> String {
        format!("circuit:{scope}")
    }
}

/// Parse a counter value written by [`Store::increment`]
pub(crate) fn parse_counter(raw: &[u8]) -> Option<i64> {
    std::str::from_utf8(raw).ok()?.trim().parse().ok()
}
