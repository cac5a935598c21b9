//! WebSocket and HTTP server using Axum.

use crate::codec::HttpRequestInfo;
use crate::config::Config;
use crate::conn::{ConnConfig, ConnHandle, ConnParams, ConnRegistry};
use crate::http_api::{api_handler, request_info, ApiConfig};
use crate::protocol::VERSION_LEGACY;
use crate::rescache::Cache;
use crate::rpc;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{HeaderMap, Uri},
    response::IntoResponse,
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use metrics::counter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::interval;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, info, warn};

/// Shared application state.
pub struct AppState {
    pub cache: Arc<Cache>,
    pub registry: Arc<ConnRegistry>,
    pub conn_config: ConnConfig,
    pub api: Arc<ApiConfig>,
    /// Resource ID and method of the header auth request.
    pub header_auth: Option<(String, String)>,
    pub ws_path: String,
}

impl AppState {
    pub fn new(config: &Config, cache: Arc<Cache>, registry: Arc<ConnRegistry>) -> Self {
        Self {
            cache,
            registry,
            conn_config: ConnConfig {
                reference_throttle: config.reference_throttle,
            },
            api: Arc::new(ApiConfig::from_config(config)),
            header_auth: config.header_auth_method(),
            ws_path: config.ws_path.clone(),
        }
    }

    /// Send the header auth request for a new connection, if configured,
    /// and wait for the response. The result itself is discarded.
    pub(crate) async fn header_auth(&self, conn: &ConnHandle) {
        let Some((rid, method)) = self.header_auth.clone() else { return };
        let (tx, rx) = oneshot::channel();
        conn.enqueue(move |st| {
            st.header_auth(&rid, &method, move |_, _| {
                let _ = tx.send(());
            })
        });
        let _ = rx.await;
    }
}

/// Create the router serving WebSocket clients, the HTTP API and health.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(&state.ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .fallback(api_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let connections = state.registry.count();
    let resources = state.cache.resource_count();
    format!(
        r#"{{"status":"ok","connections":{},"resources":{}}}"#,
        connections, resources
    )
}

/// WebSocket upgrade handler.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    uri: Uri,
) -> impl IntoResponse {
    let http = request_info(&headers, &uri, Some(addr));
    ws.on_upgrade(move |socket| handle_socket(socket, state, http))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, http: HttpRequestInfo) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Frames produced by the connection task
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    // Control frames produced by this task
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let Some(conn) = state.registry.connect(ConnParams {
        cache: state.cache.clone(),
        config: state.conn_config.clone(),
        http,
        out: Some(out_tx),
        protocol: VERSION_LEGACY,
    }) else {
        debug!("Refusing connection: server is stopping");
        let _ = ws_tx.send(Message::Close(None)).await;
        return;
    };
    let cid = conn.cid().to_string();

    counter!("gateway_ws_connections_total").increment(1);

    state.header_auth(&conn).await;

    // Forward frames to the WebSocket
    let send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                frame = out_rx.recv() => match frame {
                    Some(frame) => Message::Text(frame.into()),
                    None => break,
                },
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Ping interval for keepalive
    let mut ping_interval = interval(Duration::from_secs(30));
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;

            _ = conn.disconnected() => {
                debug!("[{}] Disconnect requested", cid);
                break;
            }

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => handle_message(&conn, &tx, msg),
                    Some(Err(e)) => {
                        warn!("[{}] WebSocket error: {:?}", cid, e);
                        break;
                    }
                }
            }

            _ = ping_interval.tick() => {
                if tx.send(Message::Ping(vec![].into())).is_err() {
                    break;
                }
            }
        }
    }

    // Cleanup
    conn.dispose().await;
    send_task.abort();

    info!("[{}] Disconnected", cid);
}

/// Handle a single WebSocket message.
fn handle_message(conn: &ConnHandle, tx: &mpsc::UnboundedSender<Message>, msg: Message) {
    match msg {
        Message::Text(text) => {
            let data = text.as_str().as_bytes().to_vec();
            conn.enqueue(move |st| rpc::handle_request(st, &data));
        }
        Message::Binary(data) => {
            conn.enqueue(move |st| rpc::handle_request(st, &data));
        }
        Message::Ping(data) => {
            let _ = tx.send(Message::Pong(data));
        }
        Message::Pong(_) | Message::Close(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rescache::CacheConfig;
    use crate::test_util::MockBus;
    use axum::body::{to_bytes, Body};
    use axum::extract::Request;
    use axum::http::StatusCode;

    fn state(bus: Arc<MockBus>) -> Arc<AppState> {
        let cache = Cache::new(bus, CacheConfig::default());
        cache.start().unwrap();
        let config = Config {
            header_auth: Some("auth.user.login".to_string()),
            ..Config::default()
        };
        Arc::new(AppState::new(&config, cache, Arc::new(ConnRegistry::new())))
    }

    #[tokio::test]
    async fn test_health() {
        let state = state(MockBus::new());
        let resp = health_handler(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"status":"ok","connections":0,"resources":0}"#);
    }

    #[tokio::test]
    async fn test_header_auth_runs_before_http_request() {
        let bus = MockBus::new();
        let state = state(bus.clone());
        let req = Request::builder()
            .method("GET")
            .uri("/api/test/model")
            .header("authorization", "Bearer abc")
            .body(Body::empty())
            .unwrap();
        let resp = tokio::spawn(api_handler(State(state), req));

        let auth = bus.expect_request("auth.auth.user.login").await;
        let payload = auth.json();
        assert_eq!(payload["header"]["Authorization"], serde_json::json!(["Bearer abc"]));
        assert_eq!(payload["uri"], "/api/test/model");
        auth.respond(r#"{"error":{"code":"system.accessDenied","message":"Access denied"}}"#);

        let mut reqs = std::collections::HashMap::new();
        for _ in 0..2 {
            let req = bus.next_request().await;
            reqs.insert(req.subject.clone(), req);
        }
        reqs.remove("access.test.model")
            .unwrap()
            .respond(r#"{"result":{"get":true}}"#);
        reqs.remove("get.test.model")
            .unwrap()
            .respond(r#"{"result":{"model":{"a":1}}}"#);

        let resp = resp.await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
