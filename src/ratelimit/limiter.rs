//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, trace, warn};

use super::bucket::{bucket_limits, TokenBucketState};
use crate::error::{RateSyncError, Result};
use crate::lock::DistributedLock;
use crate::store::Store;

/// Fastest supported rate; anything above would need a sub-millisecond interval.
const MAX_PERMITS_PER_SECOND: f64 = 1000.0;
/// Minimum store TTL of bucket state when the limiter is built directly.
const DEFAULT_STATE_TTL_FLOOR: Duration = Duration::from_secs(120);

/// A token bucket rate limiter whose state lives in the shared store.
///
/// Every read-modify-write of the bucket happens under the limiter's
/// [`DistributedLock`], and every computation uses the store's clock, so any
/// number of processes building a limiter with the same key and parameters
/// share one bucket. Waiting for a reservation happens after the lock is
/// released.
pub struct RateLimiter {
    key: String,
    permits_per_second: f64,
    max_burst_seconds: u32,
    max_permits: i64,
    interval_millis: i64,
    state_ttl_floor: Duration,
    store: Arc<dyn Store>,
    lock: Arc<DistributedLock>,
}

impl RateLimiter {
    /// Create a limiter for `key` guarded by `lock`.
    ///
    /// Prefer [`RateLimiterFactory`](crate::registry::RateLimiterFactory),
    /// which keeps one limiter per key and names the lock `"<key>:lock"`.
    pub fn new(
        key: impl Into<String>,
        permits_per_second: f64,
        max_burst_seconds: u32,
        store: Arc<dyn Store>,
        lock: Arc<DistributedLock>,
    ) -> Result<Self> {
        let key = key.into();
        if !(permits_per_second > 0.0 && permits_per_second <= MAX_PERMITS_PER_SECOND) {
            return Err(RateSyncError::InvalidArgument(format!(
                "rate limiter '{}': permits per second must be in (0, {}], got {}",
                key, MAX_PERMITS_PER_SECOND, permits_per_second
            )));
        }
        if max_burst_seconds == 0 {
            return Err(RateSyncError::InvalidArgument(format!(
                "rate limiter '{}': max burst seconds must be positive",
                key
            )));
        }

        let (max_permits, interval_millis) = bucket_limits(permits_per_second, max_burst_seconds);
        Ok(Self {
            key,
            permits_per_second,
            max_burst_seconds,
            max_permits,
            interval_millis,
            state_ttl_floor: DEFAULT_STATE_TTL_FLOOR,
            store,
            lock,
        })
    }

    /// Override the minimum TTL of the persisted bucket.
    pub fn with_state_ttl_floor(mut self, floor: Duration) -> Self {
        self.state_ttl_floor = floor;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn permits_per_second(&self) -> f64 {
        self.permits_per_second
    }

    pub fn max_burst_seconds(&self) -> u32 {
        self.max_burst_seconds
    }

    pub fn lock(&self) -> &Arc<DistributedLock> {
        &self.lock
    }

    /// Acquire `tokens`, sleeping until the reservation is due.
    ///
    /// Returns the time slept; zero if the request was served from banked
    /// permits.
    pub async fn acquire(&self, tokens: i64) -> Result<Duration> {
        let wait = self.reserve(tokens).await?;
        trace!(key = %self.key, tokens, wait_ms = wait.as_millis() as u64, "Acquired permits");
        if !wait.is_zero() {
            sleep(wait).await;
        }
        Ok(wait)
    }

    /// Equivalent to `acquire(1)`.
    pub async fn acquire_one(&self) -> Result<Duration> {
        self.acquire(1).await
    }

    /// Reserve `tokens` and return the wait without sleeping.
    ///
    /// The reservation is committed: callers that drop the returned wait on
    /// the floor still consume the permits.
    pub async fn reserve(&self, tokens: i64) -> Result<Duration> {
        check_tokens(tokens)?;

        let guard = self.lock.acquire().await?;
        let reserved = self.reserve_and_get_wait_length(tokens).await;
        let released = guard.release().await;
        let wait_millis = reserved?;
        released?;

        Ok(millis_to_duration(wait_millis))
    }

    /// Acquire `tokens` only if they can be granted within `timeout`.
    ///
    /// Returns `false` immediately, leaving the bucket untouched, when the
    /// reservation would have to wait longer than `timeout`. Otherwise the
    /// reservation is committed, the caller sleeps for it and gets `true`.
    pub async fn try_acquire(&self, tokens: i64, timeout: Duration) -> Result<bool> {
        check_tokens(tokens)?;
        let timeout_millis = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);

        let guard = self.lock.acquire().await?;
        let reserved = self.reserve_within(tokens, timeout_millis).await;
        let released = guard.release().await;
        let reserved = reserved?;
        released?;

        match reserved {
            Some(wait_millis) => {
                if wait_millis > 0 {
                    sleep(millis_to_duration(wait_millis)).await;
                }
                Ok(true)
            }
            None => {
                debug!(
                    key = %self.key,
                    tokens,
                    timeout_ms = timeout_millis,
                    "Permits not available within timeout"
                );
                Ok(false)
            }
        }
    }

    /// Equivalent to `try_acquire(1, timeout)`.
    pub async fn try_acquire_one(&self, timeout: Duration) -> Result<bool> {
        self.try_acquire(1, timeout).await
    }

    /// Commit a reservation. Must run while the lock is held.
    async fn reserve_and_get_wait_length(&self, tokens: i64) -> Result<i64> {
        let now = self.store.server_time_millis().await?;
        let mut state = self.load_state(now).await?;

        let wait_millis = state.reserve(tokens, now);
        self.save_state(&state, now).await?;

        debug!(
            key = %self.key,
            tokens,
            wait_ms = wait_millis,
            stored = state.stored_permits(),
            "Reserved permits"
        );
        Ok(wait_millis)
    }

    /// Commit a reservation only if its wait fits in `timeout_millis`.
    /// Must run while the lock is held.
    async fn reserve_within(&self, tokens: i64, timeout_millis: i64) -> Result<Option<i64>> {
        let now = self.store.server_time_millis().await?;
        let mut state = self.load_state(now).await?;

        if state.query_wait(tokens, now) > timeout_millis {
            return Ok(None);
        }

        let wait_millis = state.reserve(tokens, now);
        self.save_state(&state, now).await?;
        Ok(Some(wait_millis))
    }

    /// Read the bucket, seeding a default when it is absent or unreadable.
    ///
    /// A seeded bucket is only written back when a reservation commits.
    async fn load_state(&self, now: i64) -> Result<TokenBucketState> {
        let raw = match self.store.get(&self.key).await? {
            Some(raw) => raw,
            None => {
                debug!(key = %self.key, "Seeding token bucket");
                return Ok(self.seed(now));
            }
        };

        match TokenBucketState::decode(&raw) {
            Ok(mut state) if state.is_well_formed() => {
                // Credit idle time at the interval it accrued under
                state.resync(now);
                if state.reconfigure(self.max_permits, self.interval_millis) {
                    debug!(
                        key = %self.key,
                        max_permits = self.max_permits,
                        interval_ms = self.interval_millis,
                        "Token bucket parameters changed"
                    );
                }
                Ok(state)
            }
            Ok(state) => {
                warn!(key = %self.key, state = ?state, "Token bucket state violates invariants, reseeding");
                Ok(self.seed(now))
            }
            Err(e) => {
                warn!(key = %self.key, error = %e, "Unreadable token bucket state, reseeding");
                Ok(self.seed(now))
            }
        }
    }

    async fn save_state(&self, state: &TokenBucketState, now: i64) -> Result<()> {
        let ttl = state.ttl(now, self.state_ttl_floor);
        self.store
            .set_with_ttl(&self.key, &state.encode()?, ttl)
            .await
    }

    fn seed(&self, now: i64) -> TokenBucketState {
        TokenBucketState::seeded(self.permits_per_second, self.max_burst_seconds, now)
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("key", &self.key)
            .field("permits_per_second", &self.permits_per_second)
            .field("max_burst_seconds", &self.max_burst_seconds)
            .field("lock", &self.lock.key())
            .finish()
    }
}

fn check_tokens(tokens: i64) -> Result<()> {
    if tokens <= 0 {
        return Err(RateSyncError::InvalidArgument(format!(
            "Requested tokens {} must be positive",
            tokens
        )));
    }
    Ok(())
}

fn millis_to_duration(millis: i64) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}
