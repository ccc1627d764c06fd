//! Rate limiting logic: policies, keys, window state, and the decision engine.

mod key;
mod limiter;
mod policy;
mod record;
mod service;

pub use key::LimitKey;
pub use limiter::WindowLimiter;
pub use policy::{Policy, TimeUnit};
pub use record::{window_end, RateLimitRecord};
pub use service::{Admission, LimitingService};
