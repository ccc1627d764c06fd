//! Redis-backed counter store.
//!
//! Lets every engine instance share one set of counters.
//!
//! ## Layout
//!
//! Each key is a hash with two fields:
//! - `count`: events recorded in the current window
//! - `reset_at`: window end, in epoch milliseconds
//!
//! The hash expires with `PEXPIREAT` at `reset_at`, so Redis reclaims idle
//! windows on its own. Increments run as Lua scripts: the window's end is
//! written once when the window opens and is never pushed back by later
//! increments. A hash whose `reset_at` has passed but which Redis has not
//! yet expired is treated as a new window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{CounterStore, IncrementOutcome, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::RateLimitRecord;

/// KEYS[1] = counter key, ARGV[1] = now (ms), ARGV[2] = ttl (ms).
/// Returns `{count, reset_at}`.
const INCREMENT_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local reset_at = tonumber(redis.call('HGET', KEYS[1], 'reset_at'))
if not reset_at or reset_at <= now then
  reset_at = now + tonumber(ARGV[2])
  redis.call('DEL', KEYS[1])
  redis.call('HSET', KEYS[1], 'reset_at', reset_at)
  redis.call('PEXPIREAT', KEYS[1], reset_at)
end
local count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {count, reset_at}
"#;

/// KEYS[1] = counter key, ARGV[1] = now (ms), ARGV[2] = ttl (ms),
/// ARGV[3] = limit. Returns `{admitted, count, reset_at}`.
const INCREMENT_BELOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local reset_at = tonumber(redis.call('HGET', KEYS[1], 'reset_at'))
if not reset_at or reset_at <= now then
  reset_at = now + tonumber(ARGV[2])
  redis.call('DEL', KEYS[1])
  redis.call('HSET', KEYS[1], 'count', 0, 'reset_at', reset_at)
  redis.call('PEXPIREAT', KEYS[1], reset_at)
end
local count = tonumber(redis.call('HGET', KEYS[1], 'count')) or 0
if count >= tonumber(ARGV[3]) then
  return {0, count, reset_at}
end
count = redis.call('HINCRBY', KEYS[1], 'count', 1)
return {1, count, reset_at}
"#;

/// Configuration for Redis storage.
#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prefix prepended to every key (default: "ratewarden:")
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "ratewarden:".to_string(),
        }
    }
}

/// Redis-backed counter store.
///
/// Cloning is cheap; clones share the multiplexed connection and the closed
/// flag.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    config: RedisStoreConfig,
    clock: Arc<dyn Clock>,
    increment_script: Arc<Script>,
    increment_below_script: Arc<Script>,
    closed: Arc<AtomicBool>,
}

impl fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to Redis with default configuration.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        Self::connect_with_config(url, RedisStoreConfig::default(), Arc::new(SystemClock::new()))
            .await
    }

    /// Connect to Redis with custom configuration and clock.
    ///
    /// # Errors
    /// Returns error if the URL is invalid or the connection fails.
    pub async fn connect_with_config(
        url: &str,
        config: RedisStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;

        info!(key_prefix = %config.key_prefix, "Connected to Redis counter store");

        Ok(Self {
            connection,
            config,
            clock,
            increment_script: Arc::new(Script::new(INCREMENT_SCRIPT)),
            increment_below_script: Arc::new(Script::new(INCREMENT_BELOW_SCRIPT)),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Get the Redis key for a counter key.
    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// A connection handle, unless the store has been closed.
    fn connection(&self) -> Result<ConnectionManager, StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(self.connection.clone())
    }

    fn now_millis(&self) -> i64 {
        self.clock.now().timestamp_millis()
    }

    fn record(&self, key: &str, count: u64, reset_at: i64) -> Result<RateLimitRecord, StoreError> {
        let reset_time = millis_to_time(key, reset_at)?;
        Ok(RateLimitRecord::new(count, reset_time))
    }
}

/// Whole milliseconds in `ttl`, rounded up so a non-zero TTL never becomes 0.
fn ttl_millis(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_nanos().div_ceil(1_000_000)).unwrap_or(i64::MAX)
}

fn millis_to_time(key: &str, millis: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("reset_at {} is out of range", millis),
    })
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<RateLimitRecord, StoreError> {
        let mut conn = self.connection()?;
        let redis_key = self.key(key);

        let (count, reset_at): (u64, i64) = self
            .increment_script
            .key(&redis_key)
            .arg(self.now_millis())
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        self.record(&redis_key, count, reset_at)
    }

    async fn increment_below(
        &self,
        key: &str,
        ttl: Duration,
        limit: u64,
    ) -> Result<IncrementOutcome, StoreError> {
        let mut conn = self.connection()?;
        let redis_key = self.key(key);

        let (admitted, count, reset_at): (i64, u64, i64) = self
            .increment_below_script
            .key(&redis_key)
            .arg(self.now_millis())
            .arg(ttl_millis(ttl))
            .arg(limit)
            .invoke_async(&mut conn)
            .await?;

        let record = self.record(&redis_key, count, reset_at)?;
        Ok(if admitted == 1 {
            IncrementOutcome::Admitted(record)
        } else {
            IncrementOutcome::Rejected(record)
        })
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        let mut conn = self.connection()?;
        let redis_key = self.key(key);

        let fields: HashMap<String, i64> = conn.hgetall(&redis_key).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        let reset_at = fields.get("reset_at").copied().ok_or_else(|| StoreError::Corrupt {
            key: redis_key.clone(),
            reason: "missing reset_at".to_string(),
        })?;
        let count = fields.get("count").copied().unwrap_or(0).max(0) as u64;

        self.record(&redis_key, count, reset_at).map(Some)
    }

    async fn set(&self, key: &str, count: u64, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let redis_key = self.key(key);
        let reset_at = self.now_millis().saturating_add(ttl_millis(ttl));

        let _: () = redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&redis_key)
            .ignore()
            .cmd("HSET")
            .arg(&redis_key)
            .arg("count")
            .arg(count)
            .arg("reset_at")
            .arg(reset_at)
            .ignore()
            .cmd("PEXPIREAT")
            .arg(&redis_key)
            .arg(reset_at)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _: () = conn.del(self.key(key)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection()?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), StoreError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Redis counter store closed");
        }
        Ok(())
    }
}
