//! rate-sync - Distributed Lock and Rate Limiter
//!
//! This crate coordinates processes through a shared Redis-like key-value
//! store. It provides a set-if-absent lock with TTL and safety-time takeover,
//! and a token bucket rate limiter whose state lives in the store and is only
//! ever modified under that lock, using the store's clock.

pub mod config;
pub mod error;
pub mod lock;
pub mod ratelimit;
pub mod registry;
pub mod store;
pub mod telemetry;

pub use config::RateSyncConfig;
pub use error::{RateSyncError, Result};
pub use lock::{DistributedLock, LockGuard};
pub use ratelimit::{RateLimiter, TokenBucketState};
pub use registry::{LockFactory, RateLimiterFactory, Registry};
pub use store::{MemoryStore, Store};
