//! Shared key-value store adapters.
//!
//! Locks and rate limiters never talk to a backend directly; they go through
//! the [`Store`] capability set so any Redis-like service can back them.
//! The store's own clock is the only time source used for bucket arithmetic.

mod memory;
#[cfg(feature = "redis")]
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

pub use memory::MemoryStore;
#[cfg(feature = "redis")]
pub use redis_store::RedisStore;

/// Capability interface over a shared key-value service.
///
/// Implementations must provide single-key atomicity for every call. Nothing
/// here is transactional across keys or across calls.
#[async_trait]
pub trait Store: Send + Sync {
    /// Store `value` under `key` only if the key does not exist.
    ///
    /// Returns `true` when the key was written.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool>;

    /// Set a TTL on an existing key. Returns `false` if the key is gone.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Unconditionally store `value` under `key` with a TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Read the value under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete `key`. Returns `true` if something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Authoritative server time in milliseconds since the Unix epoch.
    async fn server_time_millis(&self) -> Result<i64>;
}

/// Build the store adapter selected by the configuration.
pub async fn connect(config: &StoreConfig) -> Result<Arc<dyn Store>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "redis")]
        StoreBackend::Redis => Ok(Arc::new(RedisStore::connect(&config.redis_url).await?)),
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => Err(crate::error::RateSyncError::Config(
            "redis backend requested but the `redis` feature is disabled".to_string(),
        )),
    }
}
