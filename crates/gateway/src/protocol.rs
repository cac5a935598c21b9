//! Client wire protocol.
//!
//! Defines the JSON frames exchanged with WebSocket clients: requests,
//! responses, events and the payloads they carry.

use crate::reserr::ResError;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;

/// Protocol version reported to clients.
pub const PROTOCOL_VERSION: &str = "1.2.2";

/// Latest supported protocol version, as a number.
pub const VERSION_LATEST: u32 = 1_002_002;

/// Version assumed for WebSocket clients until they negotiate.
pub const VERSION_LEGACY: u32 = 1_001_001;

/// First version receiving `{payload}` and resource responses to call/auth.
pub const VERSION_CALL_RESOURCE_RESPONSE: u32 = 1_002_000;

/// First version supporting soft references and data values.
pub const VERSION_SOFT_REFERENCE_AND_DATA: u32 = 1_002_001;

// ============================================================================
// Client → Server
// ============================================================================

/// A client request.
#[derive(Debug, Deserialize)]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub params: Option<Box<RawValue>>,
    pub id: Option<u64>,
}

impl Request {
    /// Encode a success response. A `None` result omits the field.
    pub fn success<T: Serialize>(&self, result: Option<&T>) -> String {
        encode(&Response { result, id: self.id }).unwrap_or_else(|e| self.error(&ResError::internal(e)))
    }

    /// Encode an error response.
    pub fn error(&self, err: &ResError) -> String {
        let out = encode(&ErrorResponse { error: err, id: self.id });
        // A ResError always serializes.
        out.unwrap_or_default()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct VersionRequest {
    #[serde(default)]
    pub protocol: String,
}

#[derive(Debug, Deserialize)]
pub struct UnsubscribeRequest {
    #[serde(default)]
    pub count: Option<i64>,
}

// ============================================================================
// Server → Client
// ============================================================================

#[derive(Serialize)]
struct Response<'a, T> {
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<&'a T>,
    id: Option<u64>,
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a ResError,
    id: Option<u64>,
}

#[derive(Serialize)]
struct Event<'a, T> {
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a T>,
}

fn encode<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(value)
}

/// Encode an event frame for `<rid>.<name>`.
pub fn event_frame<T: Serialize>(rid: &str, name: &str, data: Option<&T>) -> Result<String, serde_json::Error> {
    let event = format!("{}.{}", rid, name);
    encode(&Event { event: &event, data })
}

/// Resource snapshots sent along a response or event, keyed by RID.
#[derive(Debug, Default, Serialize)]
pub struct Resources {
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub models: HashMap<String, Box<RawValue>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub collections: HashMap<String, Box<RawValue>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub errors: HashMap<String, ResError>,
}

impl Resources {
    pub fn is_empty(&self) -> bool {
        self.models.is_empty() && self.collections.is_empty() && self.errors.is_empty()
    }
}

#[derive(Debug, Serialize)]
pub struct VersionResult {
    pub protocol: &'static str,
}

/// Collection add event.
#[derive(Serialize)]
pub struct AddEvent<'a, V: Serialize> {
    pub idx: usize,
    pub value: V,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub resources: Option<&'a Resources>,
}

/// Model change event.
#[derive(Serialize)]
pub struct ChangeEvent<'a, V: Serialize> {
    pub values: V,
    #[serde(flatten, skip_serializing_if = "Option::is_none")]
    pub resources: Option<&'a Resources>,
}

#[derive(Serialize)]
pub struct UnsubscribeEvent<'a> {
    pub reason: &'a ResError,
}

/// Result of a call or auth with a payload response.
#[derive(Debug, Serialize)]
pub struct CallPayloadResult {
    pub payload: Box<RawValue>,
}

/// Result of a call, auth or new request with a resource response.
#[derive(Debug, Serialize)]
pub struct CallResourceResult {
    pub rid: String,
    #[serde(flatten)]
    pub resources: Resources,
}
