//! Ratewarden - request throttling engine
//!
//! This crate decides whether a request may reach a protected resource. Each
//! principal (a network address or an access credential) gets a fixed-window
//! counter in a shared counter store; once the window's budget is spent the
//! principal is denied until the window ends. A credential, when present,
//! supersedes address-based limiting and may carry its own policy.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdmissionProtocol, LimitsConfig, RatewardenConfig, StoreBackend, StoreConfig};
pub use error::{Error, Result};
pub use ratelimit::{Admission, LimitKey, LimitingService, Policy, RateLimitRecord, WindowLimiter};
pub use store::{CounterStore, IncrementOutcome, MemoryStore, RedisStore, StoreError};
