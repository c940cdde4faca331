//! Shared store backed by Redis
//!
//! Both mutating operations run as Lua scripts, so each is a single atomic
//! step on the server even when many processes share the same keys. Reads
//! are plain `GET`s. Connections are multiplexed through a
//! [`ConnectionManager`], which reconnects on its own after network errors.

use std::fmt;
use std::time::Duration;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use tracing::info;

use super::Store;
use crate::error::StoreResult;

/// Set `KEYS[1]` to `ARGV[3]` if it currently equals `ARGV[2]`
/// (`ARGV[1] == "1"` means "must be absent"); `ARGV[4]` is a TTL in ms, 0 for none.
const COMPARE_AND_SWAP: &str = r"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '1' then
  if current then return 0 end
elseif current ~= ARGV[2] then
  return 0
end
local ttl = tonumber(ARGV[4])
if ttl > 0 then
  redis.call('SET', KEYS[1], ARGV[3], 'PX', ttl)
else
  redis.call('SET', KEYS[1], ARGV[3])
end
return 1
";

/// `INCRBY` that only sets a TTL on the increment that created the key
const INCREMENT: &str = r"
local value = redis.call('INCRBY', KEYS[1], ARGV[1])
local ttl = tonumber(ARGV[2])
if ttl > 0 and redis.call('PTTL', KEYS[1]) == -1 then
  redis.call('PEXPIRE', KEYS[1], ttl)
end
return value
";

/// [`Store`] implementation over a shared Redis instance
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    namespace: Option<String>,
    compare_and_swap: Script,
    increment: Script,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore").field("namespace", &self.namespace).finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url` (e.g. `redis://127.0.0.1:6379/0`)
    ///
    /// # Errors
    /// Returns [`StoreError::Unavailable`](crate::StoreError::Unavailable) if
    /// the URL is invalid or the server cannot be reached.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let client = Client::open(url)?;
        let connection = client.get_connection_manager().await?;
        info!("Connected to Redis store");
        Ok(Self::from_connection(connection))
    }

    /// Wrap an existing connection manager
    pub fn from_connection(connection: ConnectionManager) -> Self {
        Self {
            connection,
            namespace: None,
            compare_and_swap: Script::new(COMPARE_AND_SWAP),
            increment: Script::new(INCREMENT),
        }
    }

    /// Prefix every key with `namespace:` so several tenants can share one server
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        let namespace = namespace.into();
        self.namespace = (!namespace.is_empty()).then_some(namespace);
        self
    }

    fn key(&self, key: &str) -> String {
        match &self.namespace {
            Some(namespace) => format!("{namespace}:{key}"),
            None => key.to_owned(),
        }
    }
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    // A sub-millisecond TTL still has to expire
    ttl.map_or(0, |ttl| (ttl.as_millis() as u64).max(1))
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let mut connection = self.connection.clone();
        let value: Option<Vec<u8>> = connection.get(self.key(key)).await?;
        Ok(value)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new_value: &[u8],
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut connection = self.connection.clone();
        let must_be_absent = if expected.is_none() { "1" } else { "0" };

        let swapped: i64 = self
            .compare_and_swap
            .key(self.key(key))
            .arg(must_be_absent)
            .arg(expected.unwrap_or_default())
            .arg(new_value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut connection)
            .await?;
        Ok(swapped == 1)
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> StoreResult<i64> {
        let mut connection = self.connection.clone();
        let value: i64 = self
            .increment
            .key(self.key(key))
            .arg(delta)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut connection)
            .await?;
        Ok(value)
    }
}
