//! Error types for fluxguard.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for fluxguard operations.
#[derive(Error, Debug)]
pub enum FluxGuardError {
    /// Invalid limiter parameters or unreadable configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// State store errors
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl From<::config::ConfigError> for FluxGuardError {
    fn from(err: ::config::ConfigError) -> Self {
        FluxGuardError::Config(err.to_string())
    }
}

/// Result type alias for fluxguard operations.
pub type Result<T> = std::result::Result<T, FluxGuardError>;
