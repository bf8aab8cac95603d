//! Error types for rate-sync operations.

use std::fmt::Display;

use thiserror::Error;

/// Main error type for lock and rate limiter operations.
///
/// Timeouts are not errors: `try_lock_within` and `try_acquire` report them
/// as `Ok(false)`.
#[derive(Error, Debug)]
pub enum RateSyncError {
    /// A caller-supplied value was rejected before any store interaction
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The shared store could not be reached or rejected a command
    #[error("Store unavailable during {operation} on '{key}': {message}")]
    StoreUnavailable {
        operation: &'static str,
        key: String,
        message: String,
    },

    /// Bucket state could not be encoded for the store
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RateSyncError {
    /// Wrap a backend failure with the store command and key it happened on.
    pub fn store(operation: &'static str, key: &str, err: impl Display) -> Self {
        RateSyncError::StoreUnavailable {
            operation,
            key: key.to_string(),
            message: err.to_string(),
        }
    }

    /// Returns `true` for transport failures a wrapping layer may retry.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, RateSyncError::StoreUnavailable { .. })
    }
}

impl From<config::ConfigError> for RateSyncError {
    fn from(err: config::ConfigError) -> Self {
        RateSyncError::Config(err.to_string())
    }
}

/// Result type alias for rate-sync operations.
pub type Result<T> = std::result::Result<T, RateSyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_carries_context() {
        let err = RateSyncError::store("SETNX", "orders:lock", "connection refused");
        assert!(err.is_store_unavailable());
        assert_eq!(
            err.to_string(),
            "Store unavailable during SETNX on 'orders:lock': connection refused"
        );
    }

    #[test]
    fn test_invalid_argument_is_not_retryable() {
        let err = RateSyncError::InvalidArgument("tokens must be positive".into());
        assert!(!err.is_store_unavailable());
    }
}
