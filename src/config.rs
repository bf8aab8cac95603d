//! Configuration management for rate-sync.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RateSyncError, Result};

/// Prefix for environment overrides, e.g. `RATE_SYNC__LOCK__TTL_SECS=5`.
const ENV_PREFIX: &str = "RATE_SYNC";

/// Main configuration for locks and rate limiters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateSyncConfig {
    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Defaults for distributed locks
    #[serde(default)]
    pub lock: LockConfig,

    /// Defaults for rate limiters
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which store adapter to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store, only coordinates tasks of a single process
    #[default]
    Memory,
    /// Redis server shared by every process
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Connection URL used by the redis backend
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

/// Distributed lock configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// TTL of the lock key in seconds
    #[serde(default = "default_lock_ttl")]
    pub ttl_secs: u64,

    /// Seconds `lock()` waits before taking the key over; 5 × TTL when unset
    #[serde(default)]
    pub safety_time_secs: Option<u64>,

    /// Polling interval while waiting for the key in milliseconds
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_lock_ttl(),
            safety_time_secs: None,
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl LockConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn safety_time(&self) -> Duration {
        Duration::from_secs(
            self.safety_time_secs
                .unwrap_or_else(|| self.ttl_secs.saturating_mul(5)),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_lock_ttl() -> u64 {
    10
}

fn default_poll_interval() -> u64 {
    10
}

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    /// Seconds worth of permits a bucket may bank
    #[serde(default = "default_max_burst")]
    pub max_burst_secs: u32,

    /// TTL of the lock guarding each bucket, in seconds
    #[serde(default = "default_lock_ttl")]
    pub lock_ttl_secs: u64,

    /// Minimum TTL of persisted bucket state, in seconds
    #[serde(default = "default_state_ttl_floor")]
    pub state_ttl_floor_secs: u64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_burst_secs: default_max_burst(),
            lock_ttl_secs: default_lock_ttl(),
            state_ttl_floor_secs: default_state_ttl_floor(),
        }
    }
}

impl RateLimiterConfig {
    pub fn state_ttl_floor(&self) -> Duration {
        Duration::from_secs(self.state_ttl_floor_secs)
    }
}

fn default_max_burst() -> u32 {
    60
}

fn default_state_ttl_floor() -> u64 {
    120
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl RateSyncConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RateSyncConfig = serde_yaml::from_str(yaml)
            .map_err(|e| RateSyncError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate-sync configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a configuration file and apply `RATE_SYNC__*` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let config: RateSyncConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.lock.ttl_secs == 0 {
            return Err(RateSyncError::Config("Lock TTL cannot be 0".to_string()));
        }

        if self.lock.poll_interval_ms == 0 {
            return Err(RateSyncError::Config(
                "Lock poll interval cannot be 0".to_string(),
            ));
        }

        if self.lock.safety_time() < self.lock.ttl() {
            return Err(RateSyncError::Config(format!(
                "Lock safety time ({}s) cannot be shorter than its TTL ({}s)",
                self.lock.safety_time().as_secs(),
                self.lock.ttl_secs
            )));
        }

        if self.rate_limiter.max_burst_secs == 0 {
            return Err(RateSyncError::Config(
                "Rate limiter burst cannot be 0 seconds".to_string(),
            ));
        }

        if self.rate_limiter.lock_ttl_secs == 0 {
            return Err(RateSyncError::Config(
                "Rate limiter lock TTL cannot be 0".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Redis && self.store.redis_url.is_empty() {
            return Err(RateSyncError::Config(
                "Redis backend requires a redis_url".to_string(),
            ));
        }

        Ok(())
    }
}
