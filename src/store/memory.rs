//! In-process counter store.
//!
//! Backed by a [`DashMap`], which shards its locks so increments on
//! different keys rarely contend. Each map operation below runs under the
//! shard lock of its key, which makes `increment` and `increment_below`
//! atomic per key.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{CounterStore, IncrementOutcome, StoreError};
use crate::clock::{Clock, SystemClock};
use crate::ratelimit::RateLimitRecord;

/// Thread-safe in-memory counter store.
///
/// Expired records stay in the map until they are overwritten, cleared, or
/// dropped by [`MemoryStore::purge_expired`].
pub struct MemoryStore {
    records: DashMap<String, RateLimitRecord>,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStore")
            .field("records", &self.records.len())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl MemoryStore {
    /// Create an empty store driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty store driven by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            records: DashMap::new(),
            clock,
            closed: AtomicBool::new(false),
        }
    }

    /// Store a record verbatim, bypassing window bookkeeping.
    pub fn insert_record(&self, key: impl Into<String>, record: RateLimitRecord) {
        self.records.insert(key.into(), record);
    }

    /// Drop every record whose window has ended. Returns how many went.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.records.len();
        self.records.retain(|_, record| !record.is_expired(now));
        let purged = before.saturating_sub(self.records.len());
        if purged > 0 {
            debug!(purged, "Purged expired rate limit records");
        }
        purged
    }

    /// Get the number of stored records, live or expired.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StoreError::Closed);
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<RateLimitRecord, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now();

        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::opening(now, ttl));
        if record.is_expired(now) {
            *record = RateLimitRecord::opening(now, ttl);
        }
        record.count += 1;
        Ok(*record)
    }

    async fn increment_below(
        &self,
        key: &str,
        ttl: Duration,
        limit: u64,
    ) -> Result<IncrementOutcome, StoreError> {
        self.ensure_open()?;
        let now = self.clock.now();

        let mut record = self
            .records
            .entry(key.to_string())
            .or_insert_with(|| RateLimitRecord::opening(now, ttl));
        if record.is_expired(now) {
            *record = RateLimitRecord::opening(now, ttl);
        }
        if record.count >= limit {
            return Ok(IncrementOutcome::Rejected(*record));
        }
        record.count += 1;
        Ok(IncrementOutcome::Admitted(*record))
    }

    async fn get(&self, key: &str) -> Result<Option<RateLimitRecord>, StoreError> {
        self.ensure_open()?;
        Ok(self.records.get(key).map(|record| *record))
    }

    async fn set(&self, key: &str, count: u64, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut record = RateLimitRecord::opening(self.clock.now(), ttl);
        record.count = count;
        self.records.insert(key.to_string(), record);
        Ok(())
    }

    async fn clear(&self, key: &str) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.records.remove(key);
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.closed.store(true, Ordering::Release);
        self.records.clear();
        Ok(())
    }
}
