//! Counter store contract and its implementations.
//!
//! The engine only needs a handful of primitives from its backing store:
//! atomic increment with expiry, point read, explicit write, delete, and
//! liveness. [`RedisStore`] is the production backend; [`MemoryStore`]
//! keeps everything in-process.

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, RedisStoreConfig};

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use crate::ratelimit::RateLimitRecord;

/// Errors raised by counter store operations.
///
/// Every variant means the store could not serve the request.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(String),
    #[error("store operation timed out")]
    Timeout,
    #[error("store is closed")]
    Closed,
    #[error("corrupt record for key {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            StoreError::Timeout
        } else {
            StoreError::Backend(err.to_string())
        }
    }
}

/// Result of a conditional increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementOutcome {
    /// The event was recorded; carries the updated record
    Admitted(RateLimitRecord),
    /// The live window was already full; carries the untouched record
    Rejected(RateLimitRecord),
}

/// A TTL-capable counter store shared by every engine instance.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment the counter for `key`.
    ///
    /// A missing or expired record is replaced by a new window ending at
    /// `now + ttl` before incrementing. A live record keeps its reset time,
    /// so repeated calls within one window never extend it.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<RateLimitRecord, StoreError>;

    /// Atomically increment the counter for `key` only if its live count is
    /// below `limit`.
    async fn increment_below(
        &self,
        key: &str,
        ttl: Duration,
        limit: u64,
    ) -> Result<IncrementOutcome, StoreError>;

    /// Read the record for `key`, even if its window has already ended.
    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError>;

    /// Overwrite the record for `key` with `count` and a window ending at
    /// `now + ttl`.
    async fn set(&self, key: &str, count: u64, ttl: Duration) -> Result<(), StoreError>;

    /// Delete any record for `key`.
    async fn clear(&self, key: &str) -> Result<(), StoreError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError>;

    /// Release the store's resources.
    async fn close(&self) -> Result<(), StoreError>;
}
