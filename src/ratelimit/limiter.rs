//! Fixed-window limiter for a single policy.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::key::LimitKey;
use super::policy::Policy;
use super::record::{window_end, RateLimitRecord};
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::{CounterStore, IncrementOutcome, StoreError};

/// Applies one [`Policy`] to keys in a shared counter store.
///
/// The limiter keeps no per-key state of its own; everything lives in the
/// store. Checking is free, only recording moves the counter.
#[derive(Clone)]
pub struct WindowLimiter {
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
    policy: Policy,
}

impl std::fmt::Debug for WindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WindowLimiter")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl WindowLimiter {
    /// Create a limiter for `policy`.
    pub fn new(store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>, policy: Policy) -> Self {
        Self {
            store,
            clock,
            policy,
        }
    }

    /// The policy this limiter enforces.
    pub fn policy(&self) -> Policy {
        self.policy
    }

    /// Decide whether one more request for `key` fits in the current window.
    ///
    /// Returns the window's reset time when admitted. For a key with no live
    /// window that time is only a forecast; the window actually opens when
    /// the request is recorded. A window whose reset time has passed is
    /// cleared from the store first.
    ///
    /// # Errors
    /// [`Error::LimitExceeded`] with the live window's reset time when the
    /// budget is spent, [`Error::StoreUnavailable`] when the store fails or
    /// `deadline` passes.
    pub async fn check(&self, key: &LimitKey, deadline: Instant) -> Result<DateTime<Utc>> {
        let store_key = key.to_store_key();
        let record = bounded(deadline, self.store.get(&store_key)).await?;
        let now = self.clock.now();

        let record = match record {
            None => {
                trace!(class = key.class(), "No window for key");
                return Ok(window_end(now, self.policy.window()));
            }
            Some(record) if record.is_expired(now) => {
                debug!(
                    class = key.class(),
                    stale_count = record.count,
                    "Window expired, clearing"
                );
                bounded(deadline, self.store.clear(&store_key)).await?;
                return Ok(window_end(now, self.policy.window()));
            }
            Some(record) => record,
        };

        if record.count >= self.policy.max_requests() {
            debug!(
                class = key.class(),
                count = record.count,
                limit = self.policy.max_requests(),
                reset_time = %record.reset_time,
                "Rate limit exceeded"
            );
            return Err(Error::LimitExceeded {
                reset_time: record.reset_time,
            });
        }

        trace!(
            class = key.class(),
            count = record.count,
            limit = self.policy.max_requests(),
            "Within limit"
        );
        Ok(record.reset_time)
    }

    /// Record one event for `key`, regardless of the limit.
    ///
    /// Returns the updated record. If the window ended since the last
    /// check, the store opens a new one and the count restarts at 1.
    pub async fn record(
        &self,
        key: &LimitKey,
        deadline: Instant,
    ) -> std::result::Result<RateLimitRecord, StoreError> {
        let record = bounded(
            deadline,
            self.store.increment(&key.to_store_key(), self.policy.window()),
        )
        .await?;

        trace!(
            class = key.class(),
            count = record.count,
            reset_time = %record.reset_time,
            "Recorded request"
        );
        Ok(record)
    }

    /// Check and record in one atomic store call.
    ///
    /// Unlike [`check`](Self::check) followed by [`record`](Self::record),
    /// concurrent callers can never push the count past the limit.
    pub async fn admit(&self, key: &LimitKey, deadline: Instant) -> Result<DateTime<Utc>> {
        let outcome = bounded(
            deadline,
            self.store.increment_below(
                &key.to_store_key(),
                self.policy.window(),
                self.policy.max_requests(),
            ),
        )
        .await?;

        match outcome {
            IncrementOutcome::Admitted(record) => Ok(record.reset_time),
            IncrementOutcome::Rejected(record) => {
                debug!(
                    class = key.class(),
                    count = record.count,
                    limit = self.policy.max_requests(),
                    "Rate limit exceeded"
                );
                Err(Error::LimitExceeded {
                    reset_time: record.reset_time,
                })
            }
        }
    }
}

/// Run a store call, failing with [`StoreError::Timeout`] at `deadline`.
async fn bounded<T, F>(deadline: Instant, call: F) -> std::result::Result<T, StoreError>
where
    F: Future<Output = std::result::Result<T, StoreError>>,
{
    tokio::time::timeout_at(deadline, call)
        .await
        .map_err(|_| StoreError::Timeout)?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::testing::{CountingStore, Faults, FaultyStore};
    use crate::store::MemoryStore;
    use std::time::Duration;

    const MINUTE: Duration = Duration::from_secs(60);

    struct Fixture {
        clock: ManualClock,
        memory: Arc<MemoryStore>,
        store: Arc<CountingStore<MemoryStore>>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::starting_now();
            let memory = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
            let store = Arc::new(CountingStore::new(memory.clone()));
            Self {
                clock,
                memory,
                store,
            }
        }

        fn limiter(&self, max_requests: u64) -> WindowLimiter {
            WindowLimiter::new(
                self.store.clone(),
                Arc::new(self.clock.clone()),
                Policy::new(max_requests, MINUTE).unwrap(),
            )
        }
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn test_check_first_request() {
        let fx = Fixture::new();
        let limiter = fx.limiter(5);
        let key = LimitKey::address("10.0.0.1");

        let reset_time = limiter.check(&key, deadline()).await.unwrap();

        assert_eq!(reset_time, window_end(fx.clock.now(), MINUTE));
        // checking costs nothing
        assert!(fx.memory.is_empty());
    }

    #[tokio::test]
    async fn test_check_within_limit_returns_window_reset() {
        let fx = Fixture::new();
        let limiter = fx.limiter(5);
        let key = LimitKey::address("10.0.0.1");

        let first = limiter.record(&key, deadline()).await.unwrap();
        fx.clock.advance(Duration::from_secs(10));

        let reset_time = limiter.check(&key, deadline()).await.unwrap();
        assert_eq!(reset_time, first.reset_time);
    }

    #[tokio::test]
    async fn test_check_at_limit_is_denied() {
        let fx = Fixture::new();
        let limiter = fx.limiter(3);
        let key = LimitKey::address("10.0.0.1");

        let mut first_reset = None;
        for _ in 0..3 {
            limiter.check(&key, deadline()).await.unwrap();
            let record = limiter.record(&key, deadline()).await.unwrap();
            first_reset.get_or_insert(record.reset_time);
        }

        let err = limiter.check(&key, deadline()).await.unwrap_err();
        assert!(err.is_limit_exceeded());
        assert_eq!(err.reset_time(), first_reset);
    }

    #[tokio::test]
    async fn test_check_clears_expired_window() {
        let fx = Fixture::new();
        let limiter = fx.limiter(3);
        let key = LimitKey::address("10.0.0.1");
        let store_key = key.to_store_key();

        fx.memory.insert_record(
            store_key.clone(),
            RateLimitRecord::new(50, fx.clock.now() - chrono::Duration::seconds(60)),
        );

        let reset_time = limiter.check(&key, deadline()).await.unwrap();
        assert_eq!(reset_time, window_end(fx.clock.now(), MINUTE));
        assert_eq!(fx.store.calls("clear", &store_key), 1);
        assert!(fx.memory.is_empty());

        let record = limiter.record(&key, deadline()).await.unwrap();
        assert_eq!(record.count, 1);
    }

    #[tokio::test]
    async fn test_record_is_unconditional() {
        let fx = Fixture::new();
        let limiter = fx.limiter(2);
        let key = LimitKey::credential("abc");

        for expected in 1..=4 {
            let record = limiter.record(&key, deadline()).await.unwrap();
            assert_eq!(record.count, expected);
        }
        assert_eq!(fx.store.calls("increment", "token:abc"), 4);
    }

    #[tokio::test]
    async fn test_record_restarts_after_expiry() {
        let fx = Fixture::new();
        let limiter = fx.limiter(2);
        let key = LimitKey::address("10.0.0.1");

        limiter.record(&key, deadline()).await.unwrap();
        limiter.record(&key, deadline()).await.unwrap();
        fx.clock.advance(MINUTE);

        let record = limiter.record(&key, deadline()).await.unwrap();
        assert_eq!(record.count, 1);
        assert_eq!(record.reset_time, window_end(fx.clock.now(), MINUTE));
    }

    #[tokio::test]
    async fn test_admit_is_capped() {
        let fx = Fixture::new();
        let limiter = fx.limiter(2);
        let key = LimitKey::address("10.0.0.1");

        assert!(limiter.admit(&key, deadline()).await.is_ok());
        assert!(limiter.admit(&key, deadline()).await.is_ok());

        let err = limiter.admit(&key, deadline()).await.unwrap_err();
        assert!(err.is_limit_exceeded());
        let record = fx.memory.get("ip:10.0.0.1").await.unwrap().unwrap();
        assert_eq!(record.count, 2);
    }

    #[tokio::test]
    async fn test_check_surfaces_store_failure() {
        let clock = ManualClock::starting_now();
        let memory = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let faults = Faults {
            reads: true,
            ..Faults::default()
        };
        let limiter = WindowLimiter::new(
            Arc::new(FaultyStore::new(memory, faults)),
            Arc::new(clock),
            Policy::new(5, MINUTE).unwrap(),
        );

        let err = limiter
            .check(&LimitKey::address("10.0.0.1"), deadline())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(StoreError::Backend(_))));
        assert_eq!(err.reset_time(), None);
    }

    #[tokio::test]
    async fn test_check_times_out_at_deadline() {
        let clock = ManualClock::starting_now();
        let memory = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let faults = Faults {
            stall: Some(Duration::from_millis(500)),
            ..Faults::default()
        };
        let limiter = WindowLimiter::new(
            Arc::new(FaultyStore::new(memory, faults)),
            Arc::new(clock),
            Policy::new(5, MINUTE).unwrap(),
        );

        let deadline = Instant::now() + Duration::from_millis(20);
        let err = limiter
            .check(&LimitKey::address("10.0.0.1"), deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StoreUnavailable(StoreError::Timeout)));
    }
}
