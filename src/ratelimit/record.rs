//! Persisted per-key window state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The durable state of one key's current window.
///
/// A record whose `reset_time` has passed is logically absent, whatever its
/// count says. Stores return such records verbatim; only the limiter decides
/// what they mean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRecord {
    /// Events recorded in the current window
    pub count: u64,
    /// When the current window ends
    pub reset_time: DateTime<Utc>,
}

impl RateLimitRecord {
    /// Create a record.
    pub fn new(count: u64, reset_time: DateTime<Utc>) -> Self {
        Self { count, reset_time }
    }

    /// An empty record for a window opening at `now`.
    pub fn opening(now: DateTime<Utc>, window: std::time::Duration) -> Self {
        Self::new(0, window_end(now, window))
    }

    /// Whether the window has ended at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.reset_time
    }
}

/// The end of a window of length `window` opening at `start`.
///
/// Saturates at the largest representable time instead of overflowing.
pub fn window_end(start: DateTime<Utc>, window: std::time::Duration) -> DateTime<Utc> {
    Duration::from_std(window)
        .ok()
        .and_then(|delta| start.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
