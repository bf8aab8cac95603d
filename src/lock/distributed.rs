//! Set-if-absent lock with TTL and safety-time takeover.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::guard::LockGuard;
use crate::config::LockConfig;
use crate::error::{RateSyncError, Result};
use crate::store::Store;

/// Interval between set-if-absent attempts while waiting for a held lock.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// A named lock shared by every process that can reach the store.
///
/// The value stored under the key is a fresh owner token per acquisition; it
/// is never read back. [`DistributedLock::unlock`] deletes the key without
/// checking who holds it.
pub struct DistributedLock {
    store: Arc<dyn Store>,
    key: String,
    ttl: Duration,
    safety_time: Duration,
    poll_interval: Duration,
}

impl DistributedLock {
    /// Create a lock on `key`.
    ///
    /// `ttl` bounds how long a crashed holder keeps the key; `safety_time`
    /// bounds how long [`DistributedLock::lock`] waits before taking it over.
    pub fn new(
        store: Arc<dyn Store>,
        key: impl Into<String>,
        ttl: Duration,
        safety_time: Duration,
    ) -> Result<Self> {
        let key = key.into();
        if ttl.is_zero() {
            return Err(RateSyncError::InvalidArgument(format!(
                "lock '{}' needs a non-zero TTL",
                key
            )));
        }

        Ok(Self {
            store,
            key,
            ttl,
            safety_time,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Create a lock on `key` using configured TTL, safety time and polling.
    pub fn from_config(
        store: Arc<dyn Store>,
        key: impl Into<String>,
        config: &LockConfig,
    ) -> Result<Self> {
        Ok(Self::new(store, key, config.ttl(), config.safety_time())?
            .with_poll_interval(config.poll_interval()))
    }

    /// Override the polling interval.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn safety_time(&self) -> Duration {
        self.safety_time
    }

    fn owner_token(&self) -> String {
        format!("{}:{}", self.key, Uuid::new_v4())
    }

    /// SETNX then EXPIRE. A key that cannot be given a TTL is deleted again
    /// so it never outlives a failed acquisition.
    async fn claim(&self, token: &str) -> Result<bool> {
        if !self.store.set_if_absent(&self.key, token).await? {
            return Ok(false);
        }

        if let Err(e) = self.store.expire(&self.key, self.ttl).await {
            warn!(key = %self.key, error = %e, "Failed to set lock TTL, releasing");
            if let Err(cleanup) = self.store.delete(&self.key).await {
                warn!(key = %self.key, error = %cleanup, "Failed to release lock without TTL");
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Try to take the lock once, without waiting.
    pub async fn try_lock_now(&self) -> Result<bool> {
        let token = self.owner_token();
        if self.claim(&token).await? {
            debug!(key = %self.key, "Lock acquired");
            return Ok(true);
        }

        trace!(key = %self.key, "Lock busy");
        Ok(false)
    }

    /// Poll for the lock until it is taken or `timeout` elapses.
    ///
    /// A zero timeout makes exactly one attempt.
    pub async fn try_lock_within(&self, timeout: Duration) -> Result<bool> {
        let token = self.owner_token();
        let started = Instant::now();
        let deadline = deadline_after(started, timeout);

        loop {
            if self.claim(&token).await? {
                debug!(
                    key = %self.key,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Lock acquired"
                );
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(
                    key = %self.key,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for lock"
                );
                return Ok(false);
            }
            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    /// Block until the lock is held.
    ///
    /// Waits at most the safety time. If the key is still held after that,
    /// the holder is presumed dead and the key is overwritten. Either way the
    /// key ends up holding this caller's token with a fresh TTL.
    pub async fn lock(&self) -> Result<()> {
        let token = self.owner_token();
        let started = Instant::now();
        let deadline = deadline_after(started, self.safety_time);

        let acquired = loop {
            if self.store.set_if_absent(&self.key, &token).await? {
                break true;
            }

            let now = Instant::now();
            if now >= deadline {
                break false;
            }
            trace!(key = %self.key, "Waiting for lock");
            sleep(self.poll_interval.min(deadline - now)).await;
        };

        self.store.set_with_ttl(&self.key, &token, self.ttl).await?;

        let waited_ms = started.elapsed().as_millis() as u64;
        if acquired {
            debug!(key = %self.key, waited_ms, "Lock acquired");
        } else {
            warn!(
                key = %self.key,
                safety_ms = self.safety_time.as_millis() as u64,
                "Lock not released within safety time, taking it over"
            );
        }
        Ok(())
    }

    /// Delete the lock key, whoever holds it.
    pub async fn unlock(&self) -> Result<()> {
        self.store.delete(&self.key).await?;
        debug!(key = %self.key, "Lock released");
        Ok(())
    }

    /// Whether any process currently holds the key.
    pub async fn is_locked(&self) -> Result<bool> {
        Ok(self.store.get(&self.key).await?.is_some())
    }

    /// Block until held and return a guard that releases it.
    pub async fn acquire(&self) -> Result<LockGuard> {
        self.lock().await?;
        Ok(LockGuard::new(Arc::clone(&self.store), self.key.clone()))
    }

    /// Like [`DistributedLock::try_lock_within`], returning a guard on success.
    pub async fn try_acquire_within(&self, timeout: Duration) -> Result<Option<LockGuard>> {
        if self.try_lock_within(timeout).await? {
            Ok(Some(LockGuard::new(Arc::clone(&self.store), self.key.clone())))
        } else {
            Ok(None)
        }
    }

    /// Run `f` while holding the lock, releasing it afterwards.
    ///
    /// The lock is released whether `f` succeeds, returns an error value or
    /// panics.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire().await?;
        let value = f().await;
        guard.release().await?;
        Ok(value)
    }
}

impl std::fmt::Debug for DistributedLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedLock")
            .field("key", &self.key)
            .field("ttl", &self.ttl)
            .field("safety_time", &self.safety_time)
            .field("poll_interval", &self.poll_interval)
            .finish()
    }
}

/// `started + wait`, or a point decades away when that overflows.
fn deadline_after(started: Instant, wait: Duration) -> Instant {
    started
        .checked_add(wait)
        .unwrap_or_else(|| started + FAR_FUTURE)
}

/// Roughly 30 years, the same horizon tokio uses for unbounded deadlines.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn test_lock(store: &Arc<MemoryStore>, key: &str, ttl_secs: u64, safety_secs: u64) -> Arc<DistributedLock> {
        let store: Arc<dyn Store> = store.clone();
        Arc::new(
            DistributedLock::new(
                store,
                key,
                Duration::from_secs(ttl_secs),
                Duration::from_secs(safety_secs),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let err = DistributedLock::new(store, "lock:test", Duration::ZERO, Duration::ZERO)
            .unwrap_err();
        assert!(matches!(err, RateSyncError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_from_config() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let lock = DistributedLock::from_config(store, "lock:test", &LockConfig::default()).unwrap();
        assert_eq!(lock.ttl(), Duration::from_secs(10));
        assert_eq!(lock.safety_time(), Duration::from_secs(50));
    }

    #[tokio::test]
    async fn test_try_lock_now_is_exclusive() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:try", 5, 25);

        assert!(lock.try_lock_now().await.unwrap());
        assert!(!lock.try_lock_now().await.unwrap());
        assert!(lock.is_locked().await.unwrap());
        assert_eq!(store.ttl("lock:test:try"), Some(Duration::from_secs(5)));

        lock.unlock().await.unwrap();
        assert!(!lock.is_locked().await.unwrap());
        assert!(lock.try_lock_now().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_lock_now_while_held() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:tryLock", 5, 25);

        let holder = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.lock().await.unwrap();
                sleep(Duration::from_secs(3)).await;
                lock.unlock().await.unwrap();
            })
        };

        sleep(Duration::from_millis(100)).await;
        assert!(!lock.try_lock_now().await.unwrap());

        sleep(Duration::from_secs(3)).await;
        assert!(lock.try_lock_now().await.unwrap());
        holder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_lock_within() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:tryLockTimeout", 5, 25);

        let holder = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.lock().await.unwrap();
                sleep(Duration::from_secs(5)).await;
                lock.unlock().await.unwrap();
            })
        };

        sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        assert!(!lock.try_lock_within(Duration::from_secs(3)).await.unwrap());
        assert_eq!(started.elapsed(), Duration::from_secs(3));

        assert!(lock.try_lock_within(Duration::from_secs(2)).await.unwrap());
        assert!(started.elapsed() >= Duration::from_millis(4900));
        holder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_lock_within_zero_timeout() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:zero", 5, 25);

        assert!(lock.try_lock_within(Duration::ZERO).await.unwrap());

        let started = Instant::now();
        assert!(!lock.try_lock_within(Duration::ZERO).await.unwrap());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_waits_for_unlock() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:lock", 2, 5);

        let holder = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.lock().await.unwrap();
                sleep(Duration::from_secs(1)).await;
                let exited = Instant::now();
                lock.unlock().await.unwrap();
                exited
            })
        };

        sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        lock.lock().await.unwrap();
        let entered = Instant::now();
        lock.unlock().await.unwrap();

        let holder_exited = holder.await.unwrap();
        assert!(entered >= holder_exited);
        assert!(entered - started >= Duration::from_millis(900));
        assert!(entered - started < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_after_holder_ttl_expires() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:lock", 2, 5);

        // Holder keeps working well past the TTL and never gets to unlock first
        let holder = {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.lock().await.unwrap();
                sleep(Duration::from_secs(5)).await;
            })
        };

        sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        lock.lock().await.unwrap();
        let waited = started.elapsed();

        assert!(waited >= Duration::from_millis(1900));
        assert!(waited < Duration::from_millis(4900));
        lock.unlock().await.unwrap();
        holder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_takes_over_after_safety_time() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:crashed", 2, 5);

        // A holder that crashed between SETNX and EXPIRE leaves a key without TTL
        store.set_if_absent("lock:test:crashed", "crashed").await.unwrap();

        let started = Instant::now();
        lock.lock().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(5));

        let value = store.get("lock:test:crashed").await.unwrap().unwrap();
        assert_ne!(value, "crashed");
        assert_eq!(store.ttl("lock:test:crashed"), Some(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_mutual_exclusion() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:exclusive", 10, 50);
        let inside = Arc::new(AtomicBool::new(false));
        let entries = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = [2000u64, 5000, 3000, 4000]
            .into_iter()
            .map(|hold_ms| {
                let lock = lock.clone();
                let inside = inside.clone();
                let entries = entries.clone();
                tokio::spawn(async move {
                    lock.with_lock(|| async {
                        assert!(!inside.swap(true, Ordering::SeqCst), "two holders at once");
                        entries.fetch_add(1, Ordering::SeqCst);
                        sleep(Duration::from_millis(hold_ms)).await;
                        inside.store(false, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(entries.load(Ordering::SeqCst), 4);
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_guard_release() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:guard", 5, 25);

        let guard = lock.acquire().await.unwrap();
        assert_eq!(guard.key(), "lock:test:guard");
        assert!(!lock.try_lock_now().await.unwrap());

        guard.release().await.unwrap();
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_dropped_guard_unlocks() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:dropped", 5, 25);

        {
            let _guard = lock.acquire().await.unwrap();
            assert!(lock.is_locked().await.unwrap());
        }

        // The unlock runs on a spawned task
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test]
    async fn test_try_acquire_within() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:scoped", 5, 25);

        let guard = lock
            .try_acquire_within(Duration::from_millis(50))
            .await
            .unwrap()
            .expect("free lock");
        assert!(lock
            .try_acquire_within(Duration::ZERO)
            .await
            .unwrap()
            .is_none());
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_with_lock_releases_on_error_value() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:error", 5, 25);

        let outcome: Result<std::result::Result<(), &str>> =
            lock.with_lock(|| async { Err("boom") }).await;
        assert_eq!(outcome.unwrap(), Err("boom"));
        assert!(!lock.is_locked().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_waits_on_free_lock() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:unbounded", 5, 25);

        assert!(lock.try_lock_within(Duration::MAX).await.unwrap());
        lock.unlock().await.unwrap();

        let guard = lock
            .try_acquire_within(Duration::MAX)
            .await
            .unwrap()
            .expect("free lock");
        guard.release().await.unwrap();

        let patient = test_lock(&store, "lock:test:unbounded", 5, u64::MAX);
        let started = Instant::now();
        patient.lock().await.unwrap();
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(store.ttl("lock:test:unbounded"), Some(Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_timeout_still_polls() {
        let store = Arc::new(MemoryStore::new());
        let lock = test_lock(&store, "lock:test:unboundedBusy", 1, 5);
        assert!(lock.try_lock_now().await.unwrap());

        // The holder never unlocks; the key frees itself through its TTL
        let started = Instant::now();
        assert!(lock.try_lock_within(Duration::MAX).await.unwrap());
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(started.elapsed() < Duration::from_millis(1100));
    }

    /// Accepts SETNX but fails every EXPIRE.
    struct FailingExpire {
        inner: Arc<MemoryStore>,
    }

    #[async_trait]
    impl Store for FailingExpire {
        async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
            self.inner.set_if_absent(key, value).await
        }

        async fn expire(&self, key: &str, _ttl: Duration) -> Result<bool> {
            Err(RateSyncError::store("EXPIRE", key, "connection reset by peer"))
        }

        async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.inner.set_with_ttl(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<bool> {
            self.inner.delete(key).await
        }

        async fn server_time_millis(&self) -> Result<i64> {
            self.inner.server_time_millis().await
        }
    }

    #[tokio::test]
    async fn test_failed_expire_does_not_leave_key_without_ttl() {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn Store> = Arc::new(FailingExpire {
            inner: memory.clone(),
        });
        let lock = DistributedLock::new(
            store,
            "lock:test:noTtl",
            Duration::from_secs(5),
            Duration::from_secs(25),
        )
        .unwrap();

        match lock.try_lock_now().await {
            Err(RateSyncError::StoreUnavailable { operation, .. }) => assert_eq!(operation, "EXPIRE"),
            other => panic!("expected EXPIRE failure, got {:?}", other),
        }
        assert!(memory.is_empty());

        assert!(lock.try_lock_within(Duration::from_secs(1)).await.is_err());
        assert!(memory.is_empty());

        // Another process with a healthy connection can still take the key
        let healthy = test_lock(&memory, "lock:test:noTtl", 5, 25);
        assert!(healthy.try_lock_now().await.unwrap());
    }
}
