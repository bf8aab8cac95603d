//! Token bucket rate limiting over the shared store.

mod bucket;
mod limiter;

pub use bucket::{TokenBucketState, MAX_STATE_TTL};
pub use limiter::RateLimiter;
