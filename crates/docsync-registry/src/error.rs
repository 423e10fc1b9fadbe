//! Error types for docsync Registry

use std::time::Duration;

use thiserror::Error;

/// Registry error types
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Core(#[from] docsync_core::Error),

    #[error("Service error: {0}")]
    Service(#[from] docsync_service::ServiceError),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Registry is already open")]
    AlreadyOpen,

    #[error("Registry is not open")]
    NotOpen,

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias for docsync Registry operations
pub type Result<T> = std::result::Result<T, Error>;
