//! HTTP API.
//!
//! Resources and methods are exposed under the API path:
//!
//! ```text
//! GET  /api/example/model           → get.example.model
//! POST /api/example/model/set       → call.example.model.set
//! PUT  /api/example/model           → call.example.model.<PUT_METHOD>
//! ```
//!
//! Each request runs on a temporary connection that is disposed once the
//! response is written. Referenced resources are either linked by `href`
//! (`json`) or inlined (`jsonflat`).

use crate::codec::{is_valid_rid, is_valid_rid_part, CallResult, HttpRequestInfo, Resource, Value};
use crate::config::{ApiEncoding, Config};
use crate::conn::{ConnHandle, ConnParams, ConnState, SubId};
use crate::protocol::VERSION_LATEST;
use crate::reserr::*;
use crate::ws_server::AppState;
use axum::{
    body::{to_bytes, Body},
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, Method, StatusCode, Uri},
    response::{IntoResponse, Response},
};
use metrics::counter;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::debug;

const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

/// Characters escaped within a path segment.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b',')
    .remove(b':')
    .remove(b';')
    .remove(b'=')
    .remove(b'@');

/// HTTP API settings.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Path prefix, starting and ending with `/`.
    pub path: String,
    pub encoding: ApiEncoding,
    pub put_method: Option<String>,
    pub delete_method: Option<String>,
    pub patch_method: Option<String>,
}

impl ApiConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            path: config.api_path.clone(),
            encoding: config.api_encoding,
            put_method: config.put_method.clone(),
            delete_method: config.delete_method.clone(),
            patch_method: config.patch_method.clone(),
        }
    }

    fn mapped_method(&self, method: &Method) -> Option<&str> {
        match *method {
            Method::PUT => self.put_method.as_deref(),
            Method::DELETE => self.delete_method.as_deref(),
            Method::PATCH => self.patch_method.as_deref(),
            _ => None,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

// ============================================================================
// Paths
// ============================================================================

fn path_parts<'a>(path: &'a str, prefix: &str) -> Option<Vec<&'a str>> {
    if path.len() == prefix.len() {
        return None;
    }
    let rest = path.strip_prefix(prefix)?;
    if rest.contains('.') {
        return None;
    }
    let rest = rest.strip_prefix('/').unwrap_or(rest);
    Some(rest.split('/').collect())
}

fn unescape(part: &str) -> Option<String> {
    for (i, _) in part.match_indices('%') {
        let hex = part.get(i + 1..i + 3)?;
        if !hex.bytes().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
    }
    percent_decode_str(part).decode_utf8().ok().map(|s| s.into_owned())
}

fn join_rid(parts: &[&str], query: &str) -> Option<String> {
    let parts = parts.iter().map(|p| unescape(p)).collect::<Option<Vec<_>>>()?;
    let mut rid = parts.join(".");
    if !query.is_empty() {
        rid.push('?');
        rid.push_str(query);
    }
    Some(rid)
}

/// Convert a raw URL path below `prefix` into a resource ID. Path segments
/// are percent-decoded and joined with dots.
pub fn path_to_rid(path: &str, query: &str, prefix: &str) -> Option<String> {
    let parts = path_parts(path, prefix)?;
    join_rid(&parts, query)
}

/// Convert a raw URL path below `prefix` into a resource ID and the method
/// named by its last segment.
pub fn path_to_rid_action(path: &str, query: &str, prefix: &str) -> Option<(String, String)> {
    let parts = path_parts(path, prefix)?;
    let (action, parts) = parts.split_last()?;
    if parts.is_empty() {
        return None;
    }
    let rid = join_rid(parts, query)?;
    let action = unescape(action)?;
    Some((rid, action))
}

/// Convert a resource ID into a URL path below `prefix`.
pub fn rid_to_path(rid: &str, prefix: &str) -> String {
    if rid.is_empty() {
        return String::new();
    }
    let escaped = utf8_percent_encode(rid, PATH_SEGMENT).to_string();
    format!("{}{}", prefix, escaped.replace('.', "/"))
}

// ============================================================================
// Responses
// ============================================================================

/// HTTP status for a resource error.
pub fn error_status(err: &ResError) -> StatusCode {
    match err.code.as_str() {
        CODE_NOT_FOUND | CODE_METHOD_NOT_FOUND | CODE_TIMEOUT => StatusCode::NOT_FOUND,
        CODE_ACCESS_DENIED => StatusCode::UNAUTHORIZED,
        CODE_METHOD_NOT_ALLOWED => StatusCode::METHOD_NOT_ALLOWED,
        CODE_INTERNAL_ERROR => StatusCode::INTERNAL_SERVER_ERROR,
        CODE_SERVICE_UNAVAILABLE => StatusCode::SERVICE_UNAVAILABLE,
        CODE_FORBIDDEN => StatusCode::FORBIDDEN,
        CODE_SUBJECT_TOO_LONG => StatusCode::URI_TOO_LONG,
        _ => StatusCode::BAD_REQUEST,
    }
}

fn json_response(status: StatusCode, body: String) -> Response {
    (status, [(header::CONTENT_TYPE, CONTENT_TYPE_JSON)], body).into_response()
}

fn error_response(err: &ResError) -> Response {
    let body = serde_json::to_string(err).unwrap_or_default();
    json_response(error_status(err), body)
}

// ============================================================================
// Encoding
// ============================================================================

/// Writes a subscribed resource and everything it references as JSON.
struct Encoder<'a> {
    conn: &'a ConnState,
    api_path: &'a str,
    flat: bool,
    /// Subscriptions being encoded, from the root down.
    path: Vec<SubId>,
    out: String,
}

/// Encode a loaded subscription for an HTTP response.
pub(crate) fn encode_resource(conn: &ConnState, id: SubId, api: &ApiConfig) -> Result<String, ResError> {
    let mut enc = Encoder {
        conn,
        api_path: &api.path,
        flat: api.encoding == ApiEncoding::JsonFlat,
        path: Vec::new(),
        out: String::new(),
    };
    enc.subscription(id, false)?;
    Ok(enc.out)
}

impl Encoder<'_> {
    fn subscription(&mut self, id: SubId, wrap: bool) -> Result<(), ResError> {
        let conn = self.conn;
        let sub = conn
            .subscription(id)
            .ok_or_else(|| ResError::internal("missing subscription"))?;
        let cyclic = self.path.contains(&id);

        if self.flat || !wrap {
            if cyclic {
                return self.href(sub.rid());
            }
            if let Some(err) = sub.error() {
                return self.json(&err);
            }
            return self.body(id);
        }

        self.out.push_str("{\"href\":");
        self.json(&rid_to_path(sub.rid(), self.api_path))?;
        if !cyclic {
            if let Some(err) = sub.error() {
                self.out.push_str(",\"error\":");
                self.json(&err)?;
            } else {
                match sub.resource() {
                    Some(Resource::Model(_)) => self.out.push_str(",\"model\":"),
                    Some(Resource::Collection(_)) => self.out.push_str(",\"collection\":"),
                    None => return Err(ResError::internal("resource not loaded")),
                }
                self.body(id)?;
            }
        }
        self.out.push('}');
        Ok(())
    }

    fn body(&mut self, id: SubId) -> Result<(), ResError> {
        let conn = self.conn;
        let sub = conn
            .subscription(id)
            .ok_or_else(|| ResError::internal("missing subscription"))?;
        self.path.push(id);
        match sub.resource() {
            Some(Resource::Model(m)) => {
                self.out.push('{');
                for (i, (key, v)) in m.values.iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    self.json(key)?;
                    self.out.push(':');
                    self.value(id, v)?;
                }
                self.out.push('}');
            }
            Some(Resource::Collection(c)) => {
                self.out.push('[');
                for (i, v) in c.values.iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    self.value(id, v)?;
                }
                self.out.push(']');
            }
            None => return Err(ResError::internal("resource not loaded")),
        }
        self.path.pop();
        Ok(())
    }

    fn value(&mut self, parent: SubId, v: &Value) -> Result<(), ResError> {
        match v {
            Value::Primitive(raw) | Value::Data(raw) => self.out.push_str(raw.get()),
            Value::Reference(rid) => {
                let child = self
                    .conn
                    .subscription(parent)
                    .and_then(|s| s.reference(rid))
                    .ok_or_else(|| ResError::internal(format!("missing reference {}", rid)))?;
                self.subscription(child, true)?;
            }
            Value::SoftReference(rid) => self.href(rid)?,
            Value::Delete => return Err(ResError::internal("delete action in resource")),
        }
        Ok(())
    }

    fn href(&mut self, rid: &str) -> Result<(), ResError> {
        self.out.push_str("{\"href\":");
        self.json(&rid_to_path(rid, self.api_path))?;
        self.out.push('}');
        Ok(())
    }

    fn json<T: serde::Serialize + ?Sized>(&mut self, v: &T) -> Result<(), ResError> {
        self.out.push_str(&serde_json::to_string(v)?);
        Ok(())
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Collect the HTTP details passed on to auth requests. Header names are
/// canonicalized as `Content-Type`.
pub(crate) fn request_info(headers: &HeaderMap, uri: &Uri, remote: Option<SocketAddr>) -> HttpRequestInfo {
    let mut header: HashMap<String, Vec<String>> = HashMap::new();
    for (name, value) in headers {
        header
            .entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(str::to_string)
        .or_else(|| uri.authority().map(|a| a.to_string()))
        .unwrap_or_default();
    HttpRequestInfo {
        header,
        host,
        remote_addr: remote.map(|a| a.to_string()).unwrap_or_default(),
        uri: uri.path_and_query().map(|p| p.to_string()).unwrap_or_default(),
    }
}

fn canonical_header_key(name: &str) -> String {
    name.split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + &chars.as_str().to_ascii_lowercase(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

/// Fallback handler serving every path below the API path.
pub async fn api_handler(State(state): State<Arc<AppState>>, req: Request) -> Response {
    let api = state.api.clone();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().unwrap_or("").to_string();

    counter!("gateway_http_requests_total", "method" => method.to_string()).increment(1);
    debug!("HTTP {} {}", method, req.uri());

    if path.len() > api.path.len() && path.ends_with('/') {
        return error_response(&ResError::not_found());
    }

    let remote = req.extensions().get::<ConnectInfo<SocketAddr>>().map(|c| c.0);
    let http = request_info(req.headers(), req.uri(), remote);

    if method == Method::GET || method == Method::HEAD {
        return match path_to_rid(&path, &query, &api.path).filter(|rid| is_valid_rid(rid, true)) {
            Some(rid) => handle_get(&state, http, rid).await,
            None => error_response(&ResError::not_found()),
        };
    }

    let target = if method == Method::POST {
        path_to_rid_action(&path, &query, &api.path)
    } else {
        let Some(action) = api.mapped_method(&method) else {
            return error_response(&ResError::method_not_allowed());
        };
        path_to_rid(&path, &query, &api.path).map(|rid| (rid, action.to_string()))
    };
    let Some((rid, action)) = target.filter(|(rid, action)| is_valid_rid(rid, true) && is_valid_rid_part(action))
    else {
        return error_response(&ResError::not_found());
    };

    let body = match to_bytes(req.into_body(), usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            return error_response(&ResError::new(
                CODE_BAD_REQUEST,
                format!("Error reading request body: {}", e),
            ))
        }
    };
    let params = if body.iter().all(u8::is_ascii_whitespace) {
        None
    } else {
        match serde_json::from_slice::<Box<RawValue>>(&body) {
            Ok(p) => Some(p),
            Err(e) => {
                return error_response(&ResError::new(
                    CODE_BAD_REQUEST,
                    format!("Error decoding request body: {}", e),
                ))
            }
        }
    };

    handle_call(&state, http, rid, action, params, method != Method::POST).await
}

/// Create the connection serving a single request, running header auth
/// first when configured.
async fn temporary_conn(state: &AppState, http: HttpRequestInfo) -> Result<ConnHandle, ResError> {
    let conn = state
        .registry
        .connect_temporary(ConnParams {
            cache: state.cache.clone(),
            config: state.conn_config.clone(),
            http,
            out: None,
            protocol: VERSION_LATEST,
        })
        .ok_or_else(ResError::service_unavailable)?;
    state.header_auth(&conn).await;
    Ok(conn)
}

async fn handle_get(state: &AppState, http: HttpRequestInfo, rid: String) -> Response {
    let conn = match temporary_conn(state, http).await {
        Ok(conn) => conn,
        Err(e) => return error_response(&e),
    };

    let api = state.api.clone();
    let (tx, rx) = oneshot::channel();
    conn.enqueue(move |st| {
        st.http_get(&rid, move |st, res| {
            let _ = tx.send(res.and_then(|id| encode_resource(st, id, &api)));
        })
    });
    let res = rx.await.unwrap_or_else(|_| Err(ResError::disposing()));
    conn.dispose().await;

    match res {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => error_response(&e),
    }
}

async fn handle_call(
    state: &AppState,
    http: HttpRequestInfo,
    rid: String,
    action: String,
    params: Option<Box<RawValue>>,
    mapped: bool,
) -> Response {
    let conn = match temporary_conn(state, http).await {
        Ok(conn) => conn,
        Err(e) => return error_response(&e),
    };

    let (tx, rx) = oneshot::channel();
    conn.enqueue(move |st| {
        st.http_call(&rid, &action, params, move |_, res| {
            let _ = tx.send(res);
        })
    });
    let res = rx.await.unwrap_or_else(|_| Err(ResError::disposing()));
    conn.dispose().await;

    match res {
        Ok(CallResult::Payload(payload)) if payload.get() == "null" => StatusCode::NO_CONTENT.into_response(),
        Ok(CallResult::Payload(payload)) => json_response(StatusCode::OK, payload.get().to_string()),
        Ok(CallResult::Resource(rid)) => (
            StatusCode::CREATED,
            [(header::LOCATION, rid_to_path(&rid, &state.api.path))],
            Body::empty(),
        )
            .into_response(),
        Err(e) if mapped && e.is(CODE_METHOD_NOT_FOUND) => error_response(&ResError::method_not_allowed()),
        Err(e) => error_response(&e),
    }
}
