//! Test doubles for exercising guarded calls
//!
//! Available to this crate's tests and, through the `test-utils` feature,
//! to downstream crates that want to test their own retry rules.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::error::{StoreError, StoreResult};
use crate::retry::TransportFailure;
use crate::store::Store;

/// Scriptable transport failure
#[derive(Debug, Clone, Default, PartialEq, Eq, Error)]
#[error("test transport failure (status: {status:?})")]
pub struct TestFailure {
    pub status: Option<u16>,
    pub retry_after: Option<Duration>,
    pub cancelled: bool,
}

impl TestFailure {
    /// Failed response with the given HTTP status
    pub fn http(status: u16) -> Self {
        Self { status: Some(status), ..Self::default() }
    }

    /// Failure before any response arrived
    pub fn network() -> Self {
        Self::default()
    }

    /// Caller cancelled the call
    pub fn cancelled() -> Self {
        Self { cancelled: true, ..Self::default() }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }
}

impl TransportFailure for TestFailure {
    fn status(&self) -> Option<u16> {
        self.status
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Store whose every call fails, for exercising fail-open paths
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableStore;

#[async_trait]
impl Store for UnavailableStore {
    async fn get(&self, _key: &str) -> StoreResult<Option<Vec<u8>>> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn compare_and_swap(
        &self,
        _key: &str,
        _expected: Option<&[u8]>,
        _new_value: &[u8],
        _ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        Err(StoreError::unavailable("connection refused"))
    }

    async fn increment(&self, _key: &str, _delta: i64, _ttl: Option<Duration>) -> StoreResult<i64> {
        Err(StoreError::unavailable("connection refused"))
    }
}
