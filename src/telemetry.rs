//! Tracing subscriber setup.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;
use crate::error::{RateSyncError, Result};

/// Install the global fmt subscriber.
///
/// `RUST_LOG` overrides the configured level. Returns `Ok(false)` when a
/// global subscriber was already installed, which leaves it in place.
pub fn init(config: &LoggingConfig) -> Result<bool> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            RateSyncError::Config(format!("Invalid log level '{}': {}", config.level, e))
        })?,
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    let installed = if config.json {
        builder.json().try_init().is_ok()
    } else {
        builder.try_init().is_ok()
    };
    Ok(installed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_level_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "rate_sync=notalevel".to_string(),
            json: false,
        };
        assert!(matches!(init(&config), Err(RateSyncError::Config(_))));
    }

    #[test]
    fn test_second_init_is_harmless() {
        let config = LoggingConfig::default();
        let _ = init(&config).unwrap();
        assert!(!init(&config).unwrap());
    }
}
