//! Resource error taxonomy.
//!
//! Every error a client or a service can observe on the wire is a
//! [`ResError`]: a stable `code`, a human readable `message` and an optional
//! `data` payload. Service errors are passed through verbatim; gateway errors
//! use the predefined codes below.

use nats_client::BusError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

pub const CODE_ACCESS_DENIED: &str = "system.accessDenied";
pub const CODE_INTERNAL_ERROR: &str = "system.internalError";
pub const CODE_INVALID_PARAMS: &str = "system.invalidParams";
pub const CODE_INVALID_QUERY: &str = "system.invalidQuery";
pub const CODE_METHOD_NOT_FOUND: &str = "system.methodNotFound";
pub const CODE_NO_SUBSCRIPTION: &str = "system.noSubscription";
pub const CODE_NOT_FOUND: &str = "system.notFound";
pub const CODE_TIMEOUT: &str = "system.timeout";
pub const CODE_INVALID_REQUEST: &str = "system.invalidRequest";
pub const CODE_UNSUPPORTED_PROTOCOL: &str = "system.unsupportedProtocol";
pub const CODE_SUBJECT_TOO_LONG: &str = "system.subjectTooLong";
pub const CODE_DELETED: &str = "system.deleted";
pub const CODE_SUBSCRIPTION_LIMIT_EXCEEDED: &str = "system.subscriptionLimitExceeded";
pub const CODE_DISPOSED_SUBSCRIPTION: &str = "system.disposedSubscription";

// HTTP only codes
pub const CODE_BAD_REQUEST: &str = "system.badRequest";
pub const CODE_METHOD_NOT_ALLOWED: &str = "system.methodNotAllowed";
pub const CODE_SERVICE_UNAVAILABLE: &str = "system.serviceUnavailable";
pub const CODE_FORBIDDEN: &str = "system.forbidden";
pub const CODE_NOT_IMPLEMENTED: &str = "system.notImplemented";

/// A resource error as sent to clients and received from services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct ResError {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResError {
    /// Create an error with a code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            data: None,
        }
    }

    /// Wrap an arbitrary failure as `system.internalError`.
    pub fn internal(detail: impl fmt::Display) -> Self {
        Self::new(CODE_INTERNAL_ERROR, format!("Internal error: {}", detail))
    }

    /// Check the error code.
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }

    pub fn access_denied() -> Self {
        Self::new(CODE_ACCESS_DENIED, "Access denied")
    }

    pub fn internal_error() -> Self {
        Self::new(CODE_INTERNAL_ERROR, "Internal error")
    }

    /// Sent to pending requests when a connection is torn down.
    pub fn disposing() -> Self {
        Self::new(CODE_INTERNAL_ERROR, "Internal error: disposing connection")
    }

    pub fn invalid_params() -> Self {
        Self::new(CODE_INVALID_PARAMS, "Invalid parameters")
    }

    pub fn invalid_query() -> Self {
        Self::new(CODE_INVALID_QUERY, "Invalid query")
    }

    pub fn method_not_found() -> Self {
        Self::new(CODE_METHOD_NOT_FOUND, "Method not found")
    }

    pub fn no_subscription() -> Self {
        Self::new(CODE_NO_SUBSCRIPTION, "No subscription")
    }

    pub fn not_found() -> Self {
        Self::new(CODE_NOT_FOUND, "Not found")
    }

    pub fn timeout() -> Self {
        Self::new(CODE_TIMEOUT, "Request timeout")
    }

    pub fn invalid_request() -> Self {
        Self::new(CODE_INVALID_REQUEST, "Invalid request")
    }

    pub fn unsupported_protocol() -> Self {
        Self::new(CODE_UNSUPPORTED_PROTOCOL, "Unsupported protocol")
    }

    pub fn subject_too_long() -> Self {
        Self::new(CODE_SUBJECT_TOO_LONG, "Subject too long")
    }

    pub fn deleted() -> Self {
        Self::new(CODE_DELETED, "Deleted")
    }

    pub fn subscription_limit_exceeded() -> Self {
        Self::new(CODE_SUBSCRIPTION_LIMIT_EXCEEDED, "Subscription limit exceeded")
    }

    pub fn disposed_subscription() -> Self {
        Self::new(CODE_DISPOSED_SUBSCRIPTION, "Resource subscription is disposed")
    }

    pub fn bad_request() -> Self {
        Self::new(CODE_BAD_REQUEST, "Bad request")
    }

    pub fn method_not_allowed() -> Self {
        Self::new(CODE_METHOD_NOT_ALLOWED, "Method not allowed")
    }

    pub fn service_unavailable() -> Self {
        Self::new(CODE_SERVICE_UNAVAILABLE, "Service unavailable")
    }

    pub fn forbidden() -> Self {
        Self::new(CODE_FORBIDDEN, "Forbidden")
    }

    pub fn not_implemented() -> Self {
        Self::new(CODE_NOT_IMPLEMENTED, "Not implemented")
    }
}

impl From<BusError> for ResError {
    fn from(err: BusError) -> Self {
        match err {
            BusError::Timeout => Self::timeout(),
            BusError::NoResponders => Self::not_found(),
            BusError::SubjectTooLong => Self::subject_too_long(),
            other => Self::internal(other),
        }
    }
}

impl From<serde_json::Error> for ResError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialize_omits_missing_data() {
        let json = serde_json::to_string(&ResError::access_denied()).unwrap();
        assert_eq!(json, r#"{"code":"system.accessDenied","message":"Access denied"}"#);

        let mut err = ResError::new("custom.error", "Custom");
        err.data = Some(serde_json::json!({"foo": 42}));
        let json = serde_json::to_string(&err).unwrap();
        assert_eq!(json, r#"{"code":"custom.error","message":"Custom","data":{"foo":42}}"#);
    }

    #[test]
    fn test_deserialize_service_error() {
        let err: ResError =
            serde_json::from_str(r#"{"code":"test.custom","message":"Custom error","data":[1]}"#).unwrap();
        assert!(err.is("test.custom"));
        assert_eq!(err.to_string(), "Custom error");
        assert_eq!(err.data, Some(serde_json::json!([1])));
    }

    #[test]
    fn test_from_bus_error() {
        assert_eq!(ResError::from(BusError::Timeout), ResError::timeout());
        assert_eq!(ResError::from(BusError::NoResponders), ResError::not_found());
        assert_eq!(ResError::from(BusError::SubjectTooLong), ResError::subject_too_long());
        assert!(ResError::from(BusError::Closed).is(CODE_INTERNAL_ERROR));
    }

    #[test]
    fn test_internal_prefix() {
        let err = ResError::internal("boom");
        assert_eq!(err.message, "Internal error: boom");
        assert_eq!(ResError::disposing().message, "Internal error: disposing connection");
    }
}
