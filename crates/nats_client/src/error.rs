//! Bus error types.

use thiserror::Error;

/// Errors surfaced by the message bus.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// No response arrived before the request deadline.
    #[error("request timeout")]
    Timeout,

    /// The bus reported that nobody listens on the request subject.
    #[error("no responders available for request")]
    NoResponders,

    /// Subject plus reply inbox exceed the protocol's control line size.
    #[error("subject too long")]
    SubjectTooLong,

    /// The client connection is closed.
    #[error("connection closed")]
    Closed,

    /// Transport level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;
