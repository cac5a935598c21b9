//! Resource value model and service wire codec.
//!
//! Values arrive from services as raw JSON and are classified once, on
//! decode. Everything downstream (cache, client subscriptions, HTTP encoders)
//! works on the classified [`Value`].
//!
//! ```text
//! "foo" | 42 | true | null        → Primitive
//! {"rid":"a.b"}                   → Reference
//! {"rid":"a.b","soft":true}       → SoftReference
//! {"data":{..}} | {"data":[..]}   → Data
//! {"data":42}                     → Primitive (unwrapped)
//! {"action":"delete"}             → Delete (change events only)
//! ```

use crate::reserr::ResError;
use bytes::Bytes;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::sync::Arc;

const ACTION_DELETE: &str = "delete";
const NO_QUERY_GET_REQUEST: &[u8] = b"{}";
const LEGACY_DATA_PLACEHOLDER: &str = "[Data]";

fn err_missing_result() -> ResError {
    ResError::internal("response missing result")
}

fn err_invalid_response() -> ResError {
    ResError::internal("invalid service response")
}

fn err_invalid_value() -> ResError {
    ResError::internal("invalid value")
}

// ============================================================================
// Values
// ============================================================================

/// A classified resource value.
#[derive(Debug, Clone)]
pub enum Value {
    /// JSON string, number, boolean or null.
    Primitive(Box<RawValue>),
    /// Hard reference. Subscribing the owner subscribes the target.
    Reference(String),
    /// Typed pointer without implicit subscription.
    SoftReference(String),
    /// Opaque JSON object or array, delivered verbatim.
    Data(Box<RawValue>),
    /// Property removal marker in change events.
    Delete,
}

#[derive(Deserialize)]
struct ValueObject {
    rid: Option<String>,
    #[serde(default)]
    soft: bool,
    action: Option<String>,
    data: Option<Box<RawValue>>,
}

fn first_byte(raw: &str) -> Option<u8> {
    raw.bytes().find(|c| !matches!(c, b' ' | b'\t' | b'\n' | b'\r'))
}

impl Value {
    /// Classify a raw JSON value.
    pub fn parse(raw: &RawValue) -> Result<Value, ResError> {
        match first_byte(raw.get()) {
            Some(b'{') => {
                let obj: ValueObject = serde_json::from_str(raw.get())?;
                if let Some(rid) = obj.rid {
                    if rid.is_empty() {
                        return Err(ResError::internal(
                            r#"invalid value: resource references requires a non-empty "rid" value"#,
                        ));
                    }
                    if obj.action.is_some() || obj.data.is_some() {
                        return Err(ResError::internal("invalid value: ambiguous value type"));
                    }
                    if !is_valid_rid(&rid, true) {
                        return Err(ResError::internal(format!(
                            r#"invalid value: resource reference rid "{}" is invalid"#,
                            rid
                        )));
                    }
                    return Ok(if obj.soft {
                        Value::SoftReference(rid)
                    } else {
                        Value::Reference(rid)
                    });
                }
                if let Some(action) = obj.action {
                    if obj.data.is_some() {
                        return Err(ResError::internal("invalid value: ambiguous value type"));
                    }
                    if action != ACTION_DELETE {
                        return Err(ResError::internal(format!(
                            r#"invalid value: unknown action "{}""#,
                            action
                        )));
                    }
                    return Ok(Value::Delete);
                }
                match obj.data {
                    Some(inner) => match first_byte(inner.get()) {
                        Some(b'{') | Some(b'[') => Ok(Value::Data(inner)),
                        _ => Ok(Value::Primitive(inner)),
                    },
                    None => Err(ResError::internal(
                        "invalid value: nested json object must be wrapped as a data value",
                    )),
                }
            }
            Some(b'[') => Err(ResError::internal(
                "invalid value: nested json array must be wrapped as a data value",
            )),
            _ => Ok(Value::Primitive(raw.to_owned())),
        }
    }

    /// Primitive, reference, soft reference or data.
    pub fn is_proper(&self) -> bool {
        !matches!(self, Value::Delete)
    }

    /// RID of a hard reference.
    pub fn reference(&self) -> Option<&str> {
        match self {
            Value::Reference(rid) => Some(rid),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Primitive(a), Value::Primitive(b)) | (Value::Data(a), Value::Data(b)) => {
                a.get() == b.get()
            }
            (Value::Reference(a), Value::Reference(b))
            | (Value::SoftReference(a), Value::SoftReference(b)) => a == b,
            (Value::Delete, Value::Delete) => true,
            _ => false,
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Primitive(raw) => raw.serialize(serializer),
            Value::Reference(rid) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("rid", rid)?;
                map.end()
            }
            Value::SoftReference(rid) => {
                let mut map = serializer.serialize_map(Some(2))?;
                map.serialize_entry("rid", rid)?;
                map.serialize_entry("soft", &true)?;
                map.end()
            }
            Value::Data(inner) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("data", inner)?;
                map.end()
            }
            Value::Delete => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("action", ACTION_DELETE)?;
                map.end()
            }
        }
    }
}

fn parse_map(raw: HashMap<String, Box<RawValue>>) -> Result<HashMap<String, Value>, ResError> {
    raw.into_iter()
        .map(|(k, v)| Value::parse(&v).map(|v| (k, v)))
        .collect()
}

fn parse_seq(raw: Vec<Box<RawValue>>) -> Result<Vec<Value>, ResError> {
    raw.iter().map(|v| Value::parse(v)).collect::<Result<Vec<_>, _>>()
}

// ============================================================================
// Resources
// ============================================================================

/// A model: unordered map of proper values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Model {
    pub values: HashMap<String, Value>,
}

impl Serialize for Model {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

/// A collection: ordered sequence of proper values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Collection {
    pub values: Vec<Value>,
}

impl Serialize for Collection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

/// Immutable resource payload. Mutations produce new instances so that
/// snapshots handed out earlier stay valid.
#[derive(Debug, Clone, PartialEq)]
pub enum Resource {
    Model(Arc<Model>),
    Collection(Arc<Collection>),
}

impl Resource {
    /// Iterate over all values of the resource.
    pub fn values(&self) -> Box<dyn Iterator<Item = &Value> + '_> {
        match self {
            Resource::Model(m) => Box::new(m.values.values()),
            Resource::Collection(c) => Box::new(c.values.iter()),
        }
    }
}

// ============================================================================
// Legacy client encodings (protocol < 1.2.1)
// ============================================================================

/// Value encoded for clients without soft reference and data value support.
pub struct Legacy120Value<'a>(pub &'a Value);

impl Serialize for Legacy120Value<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Value::SoftReference(rid) => serializer.serialize_str(rid),
            Value::Data(_) => serializer.serialize_str(LEGACY_DATA_PLACEHOLDER),
            v => v.serialize(serializer),
        }
    }
}

pub struct Legacy120Model<'a>(pub &'a Model);

impl Serialize for Legacy120Model<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.values.len()))?;
        for (k, v) in &self.0.values {
            map.serialize_entry(k, &Legacy120Value(v))?;
        }
        map.end()
    }
}

pub struct Legacy120Collection<'a>(pub &'a Collection);

impl Serialize for Legacy120Collection<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(self.0.values.len()))?;
        for v in &self.0.values {
            seq.serialize_element(&Legacy120Value(v))?;
        }
        seq.end()
    }
}

/// Legacy encoding of a map of changed values.
pub struct Legacy120ValueMap<'a>(pub &'a HashMap<String, Value>);

impl Serialize for Legacy120ValueMap<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in self.0 {
            map.serialize_entry(k, &Legacy120Value(v))?;
        }
        map.end()
    }
}

// ============================================================================
// Resource IDs
// ============================================================================

/// Check that `rid` is a valid resource ID. A `?` starts the query part and
/// is only accepted when `allow_query` is set and it does not start a token.
pub fn is_valid_rid(rid: &str, allow_query: bool) -> bool {
    let mut start = true;
    for c in rid.chars() {
        if c == '?' {
            return allow_query && !start;
        }
        if !('!'..='~').contains(&c) || c == '*' || c == '>' {
            return false;
        }
        if c == '.' {
            if start {
                return false;
            }
            start = true;
        } else {
            start = false;
        }
    }
    !start
}

/// Check that `part` is a valid single RID token, such as a method name.
pub fn is_valid_rid_part(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| ('!'..='~').contains(&c) && !matches!(c, '.' | '*' | '>' | '?'))
}

// ============================================================================
// Service requests
// ============================================================================

fn is_false(b: &bool) -> bool {
    !*b
}

/// Generic service request.
#[derive(Serialize)]
struct Request<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "str::is_empty")]
    query: &'a str,
    cid: &'a str,
    #[serde(rename = "isHttp", skip_serializing_if = "is_false")]
    is_http: bool,
}

/// HTTP details of the request that established a connection, passed on to
/// auth requests.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HttpRequestInfo {
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub header: HashMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(rename = "remoteAddr", skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub uri: String,
}

#[derive(Serialize)]
struct AuthRequest<'a> {
    #[serde(flatten)]
    request: Request<'a>,
    #[serde(flatten)]
    http: &'a HttpRequestInfo,
}

/// Parameters shared by access, call and auth requests.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestParams<'a> {
    pub params: Option<&'a RawValue>,
    pub token: Option<&'a RawValue>,
    pub query: &'a str,
    pub cid: &'a str,
    pub is_http: bool,
}

impl<'a> RequestParams<'a> {
    fn request(&self) -> Request<'a> {
        Request {
            params: self.params,
            token: self.token,
            query: self.query,
            cid: self.cid,
            is_http: self.is_http,
        }
    }
}

fn to_bytes<T: Serialize>(value: &T) -> Bytes {
    // Only strings and pre-validated raw JSON are serialized here.
    serde_json::to_vec(value).map(Bytes::from).unwrap_or_default()
}

/// Encode an access or call request.
pub fn create_request(p: RequestParams<'_>) -> Bytes {
    to_bytes(&p.request())
}

/// Encode an auth request, including the HTTP request details.
pub fn create_auth_request(p: RequestParams<'_>, http: &HttpRequestInfo) -> Bytes {
    to_bytes(&AuthRequest {
        request: p.request(),
        http,
    })
}

/// Encode a get request.
pub fn create_get_request(query: &str) -> Bytes {
    if query.is_empty() {
        return Bytes::from_static(NO_QUERY_GET_REQUEST);
    }
    to_bytes(&serde_json::json!({ "query": query }))
}

/// Encode the request sent on a query event subject.
pub fn create_event_query_request(query: &str) -> Bytes {
    to_bytes(&serde_json::json!({ "query": query }))
}

// ============================================================================
// Service responses
// ============================================================================

/// Deserialize a field as raw JSON, keeping an explicit `null`.
fn present<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Box<RawValue>>, D::Error> {
    Box::<RawValue>::deserialize(d).map(Some)
}

#[derive(Deserialize)]
struct Response<T> {
    result: Option<T>,
    error: Option<ResError>,
}

impl<T> Response<T> {
    fn into_result(self) -> Result<T, ResError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        self.result.ok_or_else(err_missing_result)
    }
}

fn decode_response<'de, T: Deserialize<'de>>(payload: &'de [u8]) -> Result<T, ResError> {
    serde_json::from_slice::<Response<T>>(payload)?.into_result()
}

#[derive(Deserialize)]
struct RawGetResult {
    model: Option<HashMap<String, Box<RawValue>>>,
    collection: Option<Vec<Box<RawValue>>>,
    #[serde(default)]
    query: String,
}

/// Decoded get response.
#[derive(Debug, Clone)]
pub struct GetResult {
    pub resource: Resource,
    /// Normalized query, empty for queryless resources.
    pub query: String,
}

fn proper_model(raw: HashMap<String, Box<RawValue>>) -> Result<Model, ResError> {
    let values = parse_map(raw)?;
    if !values.values().all(Value::is_proper) {
        return Err(err_invalid_response());
    }
    Ok(Model { values })
}

fn proper_collection(raw: Vec<Box<RawValue>>) -> Result<Collection, ResError> {
    let values = parse_seq(raw)?;
    if !values.iter().all(Value::is_proper) {
        return Err(err_invalid_response());
    }
    Ok(Collection { values })
}

/// Decode a get response into a model or a collection.
pub fn decode_get_response(payload: &[u8]) -> Result<GetResult, ResError> {
    let r: RawGetResult = decode_response(payload)?;
    let resource = match (r.model, r.collection) {
        (Some(m), None) => Resource::Model(Arc::new(proper_model(m)?)),
        (None, Some(c)) => Resource::Collection(Arc::new(proper_collection(c)?)),
        _ => return Err(err_invalid_response()),
    };
    Ok(GetResult {
        resource,
        query: r.query,
    })
}

/// Decode an event payload. An empty payload yields `None`.
pub fn decode_event(payload: &[u8]) -> Result<Option<Box<RawValue>>, ResError> {
    if payload.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_slice(payload)?))
}

/// Payload of a query event.
#[derive(Debug, Deserialize)]
pub struct QueryEvent {
    #[serde(default)]
    pub subject: String,
}

pub fn decode_query_event(payload: &[u8]) -> Result<QueryEvent, ResError> {
    Ok(serde_json::from_slice(payload)?)
}

/// An event listed in a query response.
#[derive(Debug, Deserialize)]
pub struct EventQueryEvent {
    pub event: String,
    #[serde(default)]
    pub data: Option<Box<RawValue>>,
}

#[derive(Deserialize)]
struct RawEventQueryResult {
    events: Option<Vec<EventQueryEvent>>,
    model: Option<HashMap<String, Box<RawValue>>>,
    collection: Option<Vec<Box<RawValue>>>,
}

/// Decoded response to a query request.
#[derive(Debug)]
pub enum EventQueryResult {
    /// Events to apply to the query resource.
    Events(Vec<EventQueryEvent>),
    /// Full model to reset the query resource to.
    Model(HashMap<String, Value>),
    /// Full collection to reset the query resource to.
    Collection(Vec<Value>),
    /// Nothing changed.
    Empty,
}

pub fn decode_event_query_response(payload: &[u8]) -> Result<EventQueryResult, ResError> {
    let r: RawEventQueryResult = decode_response(payload)?;
    match (r.events, r.model, r.collection) {
        (Some(events), None, None) => Ok(EventQueryResult::Events(events)),
        (Some(_), _, _) => Err(err_invalid_response()),
        (None, Some(m), None) => Ok(EventQueryResult::Model(proper_model(m)?.values)),
        (None, None, Some(c)) => Ok(EventQueryResult::Collection(proper_collection(c)?.values)),
        (None, Some(_), Some(_)) => Err(err_invalid_response()),
        (None, None, None) => Ok(EventQueryResult::Empty),
    }
}

/// Decoded model change event.
#[derive(Debug)]
pub struct ChangeEvent {
    pub values: HashMap<String, Value>,
    /// Sent in the deprecated form without a `values` wrapper.
    pub legacy: bool,
}

/// Decode a change event.
///
/// The current form is `{"values":{...}}`. An object without a `values` key
/// is accepted as the deprecated form where the object itself is the change
/// map. Any other object containing `values` is ambiguous and refused.
pub fn decode_change_event(data: Option<&RawValue>) -> Result<ChangeEvent, ResError> {
    let data = data.ok_or_else(err_invalid_value)?;
    let mut obj: HashMap<String, Box<RawValue>> = serde_json::from_str(data.get())?;
    match obj.remove("values") {
        Some(values) if obj.is_empty() && first_byte(values.get()) == Some(b'{') => {
            let raw: HashMap<String, Box<RawValue>> = serde_json::from_str(values.get())?;
            Ok(ChangeEvent {
                values: parse_map(raw)?,
                legacy: false,
            })
        }
        Some(_) => Err(ResError::internal("ambiguous change event encoding")),
        None => Ok(ChangeEvent {
            values: parse_map(obj)?,
            legacy: true,
        }),
    }
}

/// Encode a change event from a map of changed values.
pub fn encode_change_event(values: &HashMap<String, Value>) -> Option<Box<RawValue>> {
    #[derive(Serialize)]
    struct Change<'a> {
        values: &'a HashMap<String, Value>,
    }
    serde_json::value::to_raw_value(&Change { values }).ok()
}

#[derive(Deserialize)]
struct RawAddEvent {
    idx: i64,
    value: Box<RawValue>,
}

/// Decoded collection add event.
#[derive(Debug)]
pub struct AddEvent {
    pub idx: i64,
    pub value: Value,
}

pub fn decode_add_event(data: Option<&RawValue>) -> Result<AddEvent, ResError> {
    let data = data.ok_or_else(err_invalid_value)?;
    let raw: RawAddEvent = serde_json::from_str(data.get())?;
    let value = Value::parse(&raw.value)?;
    if !value.is_proper() {
        return Err(err_invalid_value());
    }
    Ok(AddEvent {
        idx: raw.idx,
        value,
    })
}

pub fn encode_add_event(idx: usize, value: &Value) -> Option<Box<RawValue>> {
    #[derive(Serialize)]
    struct Add<'a> {
        idx: usize,
        value: &'a Value,
    }
    serde_json::value::to_raw_value(&Add { idx, value }).ok()
}

/// Decoded collection remove event.
#[derive(Debug, Deserialize)]
pub struct RemoveEvent {
    pub idx: i64,
}

pub fn decode_remove_event(data: Option<&RawValue>) -> Result<RemoveEvent, ResError> {
    let data = data.ok_or_else(err_invalid_value)?;
    Ok(serde_json::from_str(data.get())?)
}

pub fn encode_remove_event(idx: usize) -> Option<Box<RawValue>> {
    #[derive(Serialize)]
    struct Remove {
        idx: usize,
    }
    serde_json::value::to_raw_value(&Remove { idx }).ok()
}

/// Result of an access request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct AccessResult {
    #[serde(default)]
    pub get: bool,
    #[serde(default)]
    pub call: String,
}

pub fn decode_access_response(payload: &[u8]) -> Result<AccessResult, ResError> {
    decode_response(payload)
}

#[derive(Deserialize)]
struct ResourceRef {
    rid: String,
}

#[derive(Deserialize)]
struct CallResponse {
    #[serde(default, deserialize_with = "present")]
    result: Option<Box<RawValue>>,
    resource: Option<ResourceRef>,
    error: Option<ResError>,
}

/// Decoded call or auth response.
#[derive(Debug)]
pub enum CallResult {
    /// Plain result payload, possibly `null`.
    Payload(Box<RawValue>),
    /// Resource response referring to a resource ID.
    Resource(String),
}

pub fn decode_call_response(payload: &[u8]) -> Result<CallResult, ResError> {
    let r: CallResponse = serde_json::from_slice(payload)?;
    if let Some(err) = r.error {
        return Err(err);
    }
    if let Some(resource) = r.resource {
        if !is_valid_rid(&resource.rid, true) {
            return Err(err_invalid_response());
        }
        return Ok(CallResult::Resource(resource.rid));
    }
    r.result.map(CallResult::Payload).ok_or_else(err_missing_result)
}

/// Detect the deprecated `new` call result `{"rid":"..."}`.
///
/// Returns `Ok(None)` when the result does not have the legacy shape.
pub fn try_decode_legacy_new_result(result: &RawValue) -> Result<Option<String>, ResError> {
    let Ok(obj) = serde_json::from_str::<HashMap<String, serde_json::Value>>(result.get()) else {
        return Ok(None);
    };
    if obj.len() != 1 {
        return Ok(None);
    }
    let Some(rid) = obj.get("rid").and_then(|v| v.as_str()) else {
        return Ok(None);
    };
    if !is_valid_rid(rid, true) {
        return Err(err_invalid_response());
    }
    Ok(Some(rid.to_string()))
}

/// Payload of a `conn.<cid>.token` event.
#[derive(Debug, Deserialize)]
pub struct ConnTokenEvent {
    #[serde(default)]
    pub token: Option<Box<RawValue>>,
    #[serde(default)]
    pub tid: String,
}

pub fn decode_conn_token_event(payload: &[u8]) -> Result<ConnTokenEvent, ResError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Payload of a `system.reset` event.
#[derive(Debug, Default, Deserialize)]
pub struct SystemReset {
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default)]
    pub access: Vec<String>,
}

pub fn decode_system_reset(payload: &[u8]) -> Result<SystemReset, ResError> {
    if payload.is_empty() {
        return Ok(SystemReset::default());
    }
    Ok(serde_json::from_slice(payload)?)
}

/// Payload of a `system.tokenReset` event.
#[derive(Debug, Default, Deserialize)]
pub struct SystemTokenReset {
    #[serde(default)]
    pub tids: Vec<String>,
    #[serde(default)]
    pub subject: String,
}

pub fn decode_system_token_reset(payload: &[u8]) -> Result<SystemTokenReset, ResError> {
    if payload.is_empty() {
        return Ok(SystemTokenReset::default());
    }
    Ok(serde_json::from_slice(payload)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(s: &str) -> Box<RawValue> {
        RawValue::from_string(s.to_string()).unwrap()
    }

    fn parse(s: &str) -> Result<Value, ResError> {
        Value::parse(&raw(s))
    }

    #[test]
    fn test_parse_primitives() {
        for s in [r#""foo""#, "42", "true", "null", "-1.5e3"] {
            assert!(matches!(parse(s).unwrap(), Value::Primitive(_)), "{}", s);
        }
    }

    #[test]
    fn test_parse_references() {
        assert_eq!(parse(r#"{"rid":"test.model"}"#).unwrap(), Value::Reference("test.model".into()));
        assert_eq!(
            parse(r#"{"rid":"test.model","soft":true}"#).unwrap(),
            Value::SoftReference("test.model".into())
        );
        assert_eq!(
            parse(r#"{"rid":"test.model?q=1","soft":false}"#).unwrap(),
            Value::Reference("test.model?q=1".into())
        );
    }

    #[test]
    fn test_parse_data() {
        assert!(matches!(parse(r#"{"data":{"foo":[1,2]}}"#).unwrap(), Value::Data(_)));
        assert!(matches!(parse(r#"{"data":[1,2]}"#).unwrap(), Value::Data(_)));
        // Wrapped primitives are unwrapped
        assert_eq!(parse(r#"{"data":42}"#).unwrap(), parse("42").unwrap());
    }

    #[test]
    fn test_parse_delete() {
        assert_eq!(parse(r#"{"action":"delete"}"#).unwrap(), Value::Delete);
        assert!(!Value::Delete.is_proper());
    }

    #[test]
    fn test_parse_invalid() {
        let cases = [
            ("{}", "invalid value: nested json object must be wrapped as a data value"),
            ("[1,2]", "invalid value: nested json array must be wrapped as a data value"),
            (r#"{"rid":""}"#, r#"invalid value: resource references requires a non-empty "rid" value"#),
            (r#"{"rid":"a.b","action":"delete"}"#, "invalid value: ambiguous value type"),
            (r#"{"action":"delete","data":{}}"#, "invalid value: ambiguous value type"),
            (r#"{"rid":"a..b"}"#, r#"invalid value: resource reference rid "a..b" is invalid"#),
            (r#"{"action":"update"}"#, r#"invalid value: unknown action "update""#),
        ];
        for (input, msg) in cases {
            let err = parse(input).unwrap_err();
            assert_eq!(err.message, format!("Internal error: {}", msg), "{}", input);
        }
    }

    #[test]
    fn test_value_equality() {
        assert_eq!(parse("1").unwrap(), parse("1").unwrap());
        assert_ne!(parse("1").unwrap(), parse("1.0").unwrap());
        assert_ne!(
            parse(r#"{"rid":"a"}"#).unwrap(),
            parse(r#"{"rid":"a","soft":true}"#).unwrap()
        );
        assert_ne!(parse(r#""a""#).unwrap(), parse(r#"{"rid":"a"}"#).unwrap());
    }

    #[test]
    fn test_value_serialize() {
        let model = Model {
            values: HashMap::from([
                ("ref".to_string(), Value::Reference("a.b".into())),
                ("soft".to_string(), Value::SoftReference("a.c".into())),
                ("data".to_string(), parse(r#"{"data":[1]}"#).unwrap()),
            ]),
        };
        let json: serde_json::Value = serde_json::to_value(&model).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"ref": {"rid": "a.b"}, "soft": {"rid": "a.c", "soft": true}, "data": {"data": [1]}})
        );

        let legacy: serde_json::Value = serde_json::to_value(Legacy120Model(&model)).unwrap();
        assert_eq!(legacy, serde_json::json!({"ref": {"rid": "a.b"}, "soft": "a.c", "data": "[Data]"}));
    }

    #[test]
    fn test_is_valid_rid() {
        assert!(is_valid_rid("test", false));
        assert!(is_valid_rid("test.model", false));
        assert!(is_valid_rid("test.model?q=foo.bar", true));
        assert!(!is_valid_rid("test.model?q=foo", false));
        assert!(!is_valid_rid("", true));
        assert!(!is_valid_rid("test.", true));
        assert!(!is_valid_rid(".test", true));
        assert!(!is_valid_rid("test..model", true));
        assert!(!is_valid_rid("test.*", true));
        assert!(!is_valid_rid("test.>", true));
        assert!(!is_valid_rid("test model", true));
        assert!(!is_valid_rid("test.?q", true));
        assert!(!is_valid_rid("tëst", true));
    }

    #[test]
    fn test_is_valid_rid_part() {
        assert!(is_valid_rid_part("method"));
        assert!(!is_valid_rid_part(""));
        assert!(!is_valid_rid_part("a.b"));
        assert!(!is_valid_rid_part("a?"));
        assert!(!is_valid_rid_part("*"));
    }

    #[test]
    fn test_create_request() {
        let token = raw(r#"{"user":"foo"}"#);
        let params = raw(r#"{"value":42}"#);
        let payload = create_request(RequestParams {
            params: Some(&params),
            token: Some(&token),
            query: "q=1",
            cid: "abc",
            is_http: true,
        });
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"params": {"value": 42}, "token": {"user": "foo"}, "query": "q=1", "cid": "abc", "isHttp": true})
        );

        let payload = create_request(RequestParams { cid: "abc", ..Default::default() });
        assert_eq!(&payload[..], br#"{"cid":"abc"}"#);
    }

    #[test]
    fn test_create_auth_request() {
        let http = HttpRequestInfo {
            header: HashMap::from([("Authorization".to_string(), vec!["Bearer x".to_string()])]),
            host: "localhost".into(),
            remote_addr: "127.0.0.1:1234".into(),
            uri: "/".into(),
        };
        let payload = create_auth_request(RequestParams { cid: "abc", ..Default::default() }, &http);
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "cid": "abc",
                "header": {"Authorization": ["Bearer x"]},
                "host": "localhost",
                "remoteAddr": "127.0.0.1:1234",
                "uri": "/"
            })
        );
    }

    #[test]
    fn test_create_get_request() {
        assert_eq!(&create_get_request("")[..], b"{}");
        assert_eq!(&create_get_request("a=b")[..], br#"{"query":"a=b"}"#);
    }

    #[test]
    fn test_decode_get_response() {
        let r = decode_get_response(br#"{"result":{"model":{"foo":"bar","ref":{"rid":"a.b"}}}}"#).unwrap();
        let Resource::Model(m) = r.resource else {
            panic!("expected model");
        };
        assert_eq!(m.values.len(), 2);
        assert_eq!(r.query, "");

        let r = decode_get_response(br#"{"result":{"collection":[1,2],"query":"n=1"}}"#).unwrap();
        assert!(matches!(r.resource, Resource::Collection(ref c) if c.values.len() == 2));
        assert_eq!(r.query, "n=1");
    }

    #[test]
    fn test_decode_get_response_errors() {
        let err = decode_get_response(br#"{"error":{"code":"system.notFound","message":"Not found"}}"#).unwrap_err();
        assert_eq!(err, ResError::not_found());

        let err = decode_get_response(br#"{}"#).unwrap_err();
        assert_eq!(err.message, "Internal error: response missing result");

        for payload in [
            &br#"{"result":{}}"#[..],
            br#"{"result":{"model":{},"collection":[]}}"#,
            br#"{"result":{"model":{"a":{"action":"delete"}}}}"#,
        ] {
            let err = decode_get_response(payload).unwrap_err();
            assert_eq!(err.message, "Internal error: invalid service response");
        }
    }

    #[test]
    fn test_decode_change_event() {
        let data = raw(r#"{"values":{"foo":"bar","gone":{"action":"delete"}}}"#);
        let ev = decode_change_event(Some(&data)).unwrap();
        assert!(!ev.legacy);
        assert_eq!(ev.values["gone"], Value::Delete);

        let data = raw(r#"{"foo":"bar"}"#);
        let ev = decode_change_event(Some(&data)).unwrap();
        assert!(ev.legacy);
        assert_eq!(ev.values.len(), 1);

        // Ambiguous encodings are refused
        for s in [r#"{"values":"delete"}"#, r#"{"values":{"a":1},"other":2}"#, r#"{"values":[1]}"#] {
            assert!(decode_change_event(Some(&raw(s))).is_err(), "{}", s);
        }
    }

    #[test]
    fn test_decode_add_remove_events() {
        let ev = decode_add_event(Some(&raw(r#"{"idx":2,"value":"foo"}"#))).unwrap();
        assert_eq!(ev.idx, 2);
        assert!(decode_add_event(Some(&raw(r#"{"idx":0,"value":{"action":"delete"}}"#))).is_err());
        assert_eq!(decode_remove_event(Some(&raw(r#"{"idx":1}"#))).unwrap().idx, 1);
        assert!(decode_remove_event(None).is_err());
    }

    #[test]
    fn test_decode_call_response() {
        match decode_call_response(br#"{"result":null}"#).unwrap() {
            CallResult::Payload(p) => assert_eq!(p.get(), "null"),
            other => panic!("unexpected {:?}", other),
        }
        match decode_call_response(br#"{"resource":{"rid":"test.model"}}"#).unwrap() {
            CallResult::Resource(rid) => assert_eq!(rid, "test.model"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(decode_call_response(br#"{"resource":{"rid":"test..model"}}"#).is_err());
        assert_eq!(
            decode_call_response(br#"{}"#).unwrap_err().message,
            "Internal error: response missing result"
        );
    }

    #[test]
    fn test_try_decode_legacy_new_result() {
        assert_eq!(
            try_decode_legacy_new_result(&raw(r#"{"rid":"test.model"}"#)).unwrap(),
            Some("test.model".to_string())
        );
        assert_eq!(try_decode_legacy_new_result(&raw(r#"{"rid":"a","b":1}"#)).unwrap(), None);
        assert_eq!(try_decode_legacy_new_result(&raw("42")).unwrap(), None);
        assert!(try_decode_legacy_new_result(&raw(r#"{"rid":"a..b"}"#)).is_err());
    }

    #[test]
    fn test_decode_event_query_response() {
        let r = decode_event_query_response(br#"{"result":{"events":[{"event":"change","data":{"values":{}}}]}}"#)
            .unwrap();
        assert!(matches!(r, EventQueryResult::Events(ref e) if e.len() == 1));

        let r = decode_event_query_response(br#"{"result":{"collection":["a"]}}"#).unwrap();
        assert!(matches!(r, EventQueryResult::Collection(ref c) if c.len() == 1));

        assert!(decode_event_query_response(br#"{"result":{"events":[],"model":{}}}"#).is_err());
    }
}
