//! In-process store with per-key expiry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, trace};

use super::Store;
use crate::error::Result;

/// Writes between sweeps of expired keys.
const SWEEP_EVERY_WRITES: u64 = 1024;

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    /// Store-clock millis after which the key no longer exists
    expires_at: Option<i64>,
}

impl StoredValue {
    fn new(value: &str, expires_at: Option<i64>) -> Self {
        Self {
            value: value.to_string(),
            expires_at,
        }
    }

    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// A [`Store`] living inside the current process.
///
/// Every clone of an `Arc<MemoryStore>` sees the same keys and the same clock,
/// so it coordinates tasks of one process the way a Redis server coordinates
/// many processes. The clock is monotonic and anchored at construction; it
/// follows tokio's clock, which lets tests run on paused time.
///
/// Expired keys vanish for readers immediately and are reclaimed by a sweep
/// every few writes, so keys that are never touched again do not pile up.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    epoch_millis: i64,
    started: Instant,
    writes: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store whose clock starts at the current system time.
    pub fn new() -> Self {
        let epoch_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        Self::with_epoch_millis(epoch_millis)
    }

    /// Create an empty store whose clock starts at `epoch_millis`.
    pub fn with_epoch_millis(epoch_millis: i64) -> Self {
        Self {
            entries: DashMap::new(),
            epoch_millis,
            started: Instant::now(),
            writes: AtomicU64::new(0),
        }
    }

    /// Current store time in milliseconds.
    pub fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.epoch_millis.saturating_add(elapsed)
    }

    /// Remaining TTL of `key`, `None` if absent or persistent.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = self.now_millis();
        let entry = self.entries.get(key)?;
        match entry.expires_at {
            Some(at) if at > now => Some(Duration::from_millis((at - now) as u64)),
            _ => None,
        }
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = self.now_millis();
        self.entries.iter().filter(|e| !e.is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired key. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, v| !v.is_expired(now));
        before.saturating_sub(self.entries.len())
    }

    /// Count a write and sweep when due. Must not run while a map guard is held.
    fn record_write(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY_WRITES == 0 {
            let purged = self.purge_expired();
            if purged > 0 {
                debug!(purged, "Swept expired keys");
            }
        }
    }

    fn deadline(&self, now: i64, ttl: Duration) -> i64 {
        now.saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let now = self.now_millis();
        let written = match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    occupied.insert(StoredValue::new(value, None));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredValue::new(value, None));
                true
            }
        };
        trace!(key = %key, written, "SETNX");
        if written {
            self.record_write();
        }
        Ok(written)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = self.now_millis();
        let expires_at = self.deadline(now, ttl);
        let updated = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(expires_at);
                true
            }
            _ => false,
        };
        Ok(updated)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = self.now_millis();
        let expires_at = self.deadline(now, ttl);
        self.entries
            .insert(key.to_string(), StoredValue::new(value, Some(expires_at)));
        trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "SET");
        self.record_write();
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.now_millis();
        let value = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => Some(entry.value.clone()),
            Some(_) => None,
            None => return Ok(None),
        };
        if value.is_none() {
            self.entries.remove_if(key, |_, v| v.is_expired(now));
        }
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let now = self.now_millis();
        let removed = self
            .entries
            .remove(key)
            .is_some_and(|(_, v)| !v.is_expired(now));
        trace!(key = %key, removed, "DEL");
        Ok(removed)
    }

    async fn server_time_millis(&self) -> Result<i64> {
        Ok(self.now_millis())
    }
}
