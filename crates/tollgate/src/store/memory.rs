//! In-process store with per-key locking
//!
//! The map itself is a [`DashMap`] that is only touched long enough to find
//! or create a key's slot. Every read-modify-write then happens under that
//! slot's own mutex, so a hot key never blocks unrelated keys.
//!
//! Expiry is lazy: a slot whose deadline has passed reads as absent, and
//! [`MemoryStore::purge_expired`] reclaims the memory when the caller
//! chooses to. No background task is spawned.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{parse_counter, Store};
use crate::error::{StoreError, StoreResult};
use crate::time::{Clock, SystemClock};

#[derive(Debug, Default)]
struct Slot {
    value: Option<Vec<u8>>,
    expires_at: Option<Instant>,
}

impl Slot {
    /// Drop the value if its deadline has passed
    fn expire(&mut self, now: Instant) {
        if self.expires_at.is_some_and(|deadline| deadline <= now) {
            self.value = None;
            self.expires_at = None;
        }
    }

    fn write(&mut self, value: Vec<u8>, ttl: Option<Duration>, now: Instant) {
        self.value = Some(value);
        self.expires_at = ttl.map(|ttl| now + ttl);
    }
}

/// In-memory [`Store`] for single-process deployments and tests
///
/// # Examples
///
/// ```rust
/// use tollgate::store::{MemoryStore, Store};
///
/// # async fn example() -> Result<(), tollgate::StoreError> {
/// let store = MemoryStore::new();
/// assert_eq!(store.increment("hits", 1, None).await?, 1);
/// assert_eq!(store.increment("hits", 2, None).await?, 3);
/// assert_eq!(store.get("hits").await?, Some(b"3".to_vec()));
/// # Ok(())
/// # }
/// ```
pub struct MemoryStore<C: Clock = SystemClock> {
    slots: DashMap<String, Arc<Mutex<Slot>>>,
    clock: Arc<C>,
}

impl MemoryStore<SystemClock> {
    /// Create an empty store driven by the system clock
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }
}

impl Default for MemoryStore<SystemClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> fmt::Debug for MemoryStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore").field("keys", &self.slots.len()).finish()
    }
}

impl<C: Clock> MemoryStore<C> {
    /// Create an empty store with a custom clock (useful for testing TTLs)
    pub fn with_clock(clock: C) -> Self {
        Self { slots: DashMap::new(), clock: Arc::new(clock) }
    }

    /// Number of slots currently held, including expired ones not yet purged
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the store holds no slots at all
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Remove expired and empty slots, returning how many were dropped
    ///
    /// Slots currently borrowed by an in-flight operation are skipped, so a
    /// concurrent writer can never end up mutating a detached slot.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.slots.len();

        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            let mut guard = slot.lock();
            guard.expire(now);
            guard.value.is_some()
        });

        let removed = before.saturating_sub(self.slots.len());
        if removed > 0 {
            debug!(removed, "Purged expired store slots");
        }
        removed
    }

    /// Find the slot for `key`, creating an empty one if needed
    fn slot(&self, key: &str) -> Arc<Mutex<Slot>> {
        if let Some(existing) = self.slots.get(key) {
            return Arc::clone(&*existing);
        }
        Arc::clone(&*self.slots.entry(key.to_owned()).or_default())
    }
}

#[async_trait]
impl<C: Clock> Store for MemoryStore<C> {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let Some(slot) = self.slots.get(key).map(|slot| Arc::clone(&*slot)) else {
            return Ok(None);
        };
        let mut guard = slot.lock();
        guard.expire(self.clock.now());
        Ok(guard.value.clone())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: &[u8],
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let slot = self.slot(key);
        let now = self.clock.now();
        let mut guard = slot.lock();
        guard.expire(now);

        if guard.value.as_deref() != expected {
            return Ok(false);
        }
        guard.write(new_value.to_vec(), ttl, now);
        Ok(true)
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> StoreResult<i64> {
        let slot = self.slot(key);
        let now = self.clock.now();
        let mut guard = slot.lock();
        guard.expire(now);

        let (current, created) = match guard.value.as_deref() {
            None => (0, true),
            Some(raw) => (
                parse_counter(raw).ok_or_else(|| StoreError::NotAnInteger { key: key.to_owned() })?,
                false,
            ),
        };
        let next = current.saturating_add(delta);

        if created {
            guard.write(next.to_string().into_bytes(), ttl, now);
        } else {
            guard.value = Some(next.to_string().into_bytes());
        }
        Ok(next)
    }
}
