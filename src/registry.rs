//! Process-local registries handing out one lock or limiter per key.
//!
//! These only deduplicate in-process objects. Cross-process coordination is
//! still the job of the store-backed [`DistributedLock`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use crate::config::{LockConfig, RateLimiterConfig, RateSyncConfig};
use crate::error::{RateSyncError, Result};
use crate::lock::DistributedLock;
use crate::ratelimit::RateLimiter;
use crate::store::Store;

/// A keyed cache of shared instances.
pub struct Registry<T> {
    entries: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the instance for `key`, creating it with `make` on first use.
    pub fn get_or_create(&self, key: &str, make: impl FnOnce() -> T) -> Arc<T> {
        let mut entries = self.entries.lock();
        Arc::clone(
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(make())),
        )
    }

    /// Like [`Registry::get_or_create`] with a fallible constructor.
    ///
    /// Nothing is cached when `make` fails.
    pub fn try_get_or_create<E>(
        &self,
        key: &str,
        make: impl FnOnce() -> std::result::Result<T, E>,
    ) -> std::result::Result<Arc<T>, E> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            return Ok(Arc::clone(existing));
        }

        let created = Arc::new(make()?);
        entries.insert(key.to_string(), Arc::clone(&created));
        Ok(created)
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds distributed locks, one per key per process.
pub struct LockFactory {
    store: Arc<dyn Store>,
    config: LockConfig,
    locks: Registry<DistributedLock>,
}

impl LockFactory {
    pub fn new(store: Arc<dyn Store>, config: LockConfig) -> Self {
        Self {
            store,
            config,
            locks: Registry::new(),
        }
    }

    pub fn from_config(config: &RateSyncConfig, store: Arc<dyn Store>) -> Self {
        Self::new(store, config.lock.clone())
    }

    /// Lock on `key` with the configured TTL, safety time and polling.
    pub fn build(&self, key: &str) -> Result<Arc<DistributedLock>> {
        self.locks.try_get_or_create(key, || {
            debug!(key = %key, ttl_secs = self.config.ttl_secs, "Creating distributed lock");
            DistributedLock::from_config(Arc::clone(&self.store), key, &self.config)
        })
    }

    /// Lock on `key` with explicit timings.
    ///
    /// An existing lock for `key` is returned as is, whatever its timings.
    pub fn build_with(
        &self,
        key: &str,
        ttl: Duration,
        safety_time: Duration,
    ) -> Result<Arc<DistributedLock>> {
        let lock = self.locks.try_get_or_create(key, || {
            debug!(key = %key, ttl_ms = ttl.as_millis() as u64, "Creating distributed lock");
            Ok::<_, RateSyncError>(
                DistributedLock::new(Arc::clone(&self.store), key, ttl, safety_time)?
                    .with_poll_interval(self.config.poll_interval()),
            )
        })?;

        if lock.ttl() != ttl || lock.safety_time() != safety_time {
            debug!(key = %key, "Reusing existing lock with different timings");
        }
        Ok(lock)
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Builds rate limiters, one per key per process.
///
/// Each limiter is guarded by the lock `"<key>:lock"` from the shared
/// [`LockFactory`].
pub struct RateLimiterFactory {
    store: Arc<dyn Store>,
    config: RateLimiterConfig,
    locks: Arc<LockFactory>,
    limiters: Registry<RateLimiter>,
}

impl RateLimiterFactory {
    pub fn new(store: Arc<dyn Store>, config: RateLimiterConfig, lock_config: LockConfig) -> Self {
        let locks = Arc::new(LockFactory::new(Arc::clone(&store), lock_config));
        Self::with_lock_factory(store, config, locks)
    }

    /// Share a lock factory with other components.
    pub fn with_lock_factory(
        store: Arc<dyn Store>,
        config: RateLimiterConfig,
        locks: Arc<LockFactory>,
    ) -> Self {
        Self {
            store,
            config,
            locks,
            limiters: Registry::new(),
        }
    }

    pub fn from_config(config: &RateSyncConfig, store: Arc<dyn Store>) -> Self {
        Self::new(store, config.rate_limiter.clone(), config.lock.clone())
    }

    pub fn lock_factory(&self) -> &Arc<LockFactory> {
        &self.locks
    }

    /// Limiter for `key` with the configured burst window.
    pub fn build(&self, key: &str, permits_per_second: f64) -> Result<Arc<RateLimiter>> {
        self.build_with_burst(key, permits_per_second, self.config.max_burst_secs)
    }

    /// Limiter for `key` banking up to `max_burst_seconds` worth of permits.
    ///
    /// An existing limiter for `key` is returned as is, even if it was built
    /// with other parameters.
    pub fn build_with_burst(
        &self,
        key: &str,
        permits_per_second: f64,
        max_burst_seconds: u32,
    ) -> Result<Arc<RateLimiter>> {
        let limiter = self.limiters.try_get_or_create(key, || {
            let lock_ttl = Duration::from_secs(self.config.lock_ttl_secs);
            let lock = self.locks.build_with(
                &format!("{}:lock", key),
                lock_ttl,
                lock_ttl.saturating_mul(5),
            )?;

            debug!(
                key = %key,
                permits_per_second,
                max_burst_seconds,
                "Creating rate limiter"
            );
            Ok::<_, RateSyncError>(
                RateLimiter::new(
                    key,
                    permits_per_second,
                    max_burst_seconds,
                    Arc::clone(&self.store),
                    lock,
                )?
                .with_state_ttl_floor(self.config.state_ttl_floor()),
            )
        })?;

        if limiter.permits_per_second() != permits_per_second
            || limiter.max_burst_seconds() != max_burst_seconds
        {
            debug!(
                key = %key,
                requested_permits_per_second = permits_per_second,
                existing_permits_per_second = limiter.permits_per_second(),
                "Reusing existing rate limiter with different parameters"
            );
        }
        Ok(limiter)
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
