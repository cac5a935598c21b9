//! Gateway error types.
//!
//! Errors returned to clients use [`ResError`](crate::reserr::ResError);
//! this type covers process-level failures at startup.

use thiserror::Error;

/// Gateway error type.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
