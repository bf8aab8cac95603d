//! Redis-backed store.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::{info, trace};

use super::Store;
use crate::error::{RateSyncError, Result};

/// A [`Store`] backed by a Redis server shared by every process.
///
/// The connection manager reconnects on its own; failed commands are reported
/// as [`RateSyncError::StoreUnavailable`] and never retried here.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        info!(url = %url, "Connecting to redis store");
        let client = redis::Client::open(url).map_err(|e| RateSyncError::store("CONNECT", url, e))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| RateSyncError::store("CONNECT", url, e))?;
        Ok(Self { conn })
    }

    /// Wrap an existing connection manager.
    pub fn from_connection(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

/// Longest expiry sent to Redis. Larger values overflow its millisecond
/// deadline and the command is rejected.
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Redis TTLs are whole seconds, rounded up and at least one.
fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs().saturating_add(u64::from(ttl.subsec_nanos() > 0));
    secs.clamp(1, MAX_TTL_SECS)
}

#[async_trait]
impl Store for RedisStore {
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let written: bool = redis::cmd("SETNX")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await
            .map_err(|e| RateSyncError::store("SETNX", key, e))?;
        trace!(key = %key, written, "SETNX");
        Ok(written)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let updated: bool = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| RateSyncError::store("EXPIRE", key, e))?;
        Ok(updated)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await
            .map_err(|e| RateSyncError::store("SET", key, e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RateSyncError::store("GET", key, e))?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|e| RateSyncError::store("DEL", key, e))?;
        Ok(removed > 0)
    }

    async fn server_time_millis(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        let (secs, micros): (i64, i64) = redis::cmd("TIME")
            .query_async(&mut conn)
            .await
            .map_err(|e| RateSyncError::store("TIME", "", e))?;
        Ok(secs.saturating_mul(1000).saturating_add(micros / 1000))
    }
}
