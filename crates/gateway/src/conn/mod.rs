//! Client connections.
//!
//! Every connection, WebSocket or the temporary one behind an HTTP request,
//! is an actor: a tokio task owning a [`ConnState`] and running closures
//! queued through its [`ConnHandle`]. Client requests, cache callbacks and
//! bus events all reach the connection as queued jobs, so subscription state
//! is only ever touched from that one task.
//!
//! ```text
//!  ws frame ──┐
//!  cache cb ──┼──▶ ConnHandle::enqueue ──▶ mpsc ──▶ task: job(&mut ConnState)
//!  conn.<cid> ┘                                          │
//!                                                        └──▶ out (client frames)
//! ```

mod gc;
mod registry;
mod requests;
mod subscription;

pub use registry::ConnRegistry;
pub(crate) use subscription::{ClientSub, SubId};

use crate::codec::{self, HttpRequestInfo, RequestParams};
use crate::protocol;
use crate::rescache::Cache;
use crate::reserr::{ResError, CODE_TIMEOUT};
use nats_client::BusSubscription;
use serde::Serialize;
use serde_json::value::RawValue;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use subscription::ReadyCallback;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, error, trace};
use uuid::Uuid;

/// Max direct subscriptions of a single RID on one connection.
pub const SUBSCRIPTION_COUNT_LIMIT: usize = 256;

/// Placeholder in requested RIDs replaced by the connection ID.
pub const CID_PLACEHOLDER: &str = "{cid}";

type Job = Box<dyn FnOnce(&mut ConnState) + Send>;

/// Settings shared by all connections.
#[derive(Debug, Clone, Default)]
pub struct ConnConfig {
    /// Max concurrent get requests when following references of a direct
    /// subscription. 0 means unlimited.
    pub reference_throttle: usize,
}

/// Cloneable handle to a connection task.
#[derive(Clone)]
pub struct ConnHandle {
    cid: Arc<str>,
    tx: mpsc::UnboundedSender<Job>,
    disposing: Arc<AtomicBool>,
    disconnect: Arc<Notify>,
}

impl ConnHandle {
    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Queue a job on the connection. Returns false if the connection is
    /// disposing and the job was dropped.
    pub fn enqueue<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut ConnState) + Send + 'static,
    {
        if self.disposing.load(Ordering::Acquire) {
            return false;
        }
        self.tx.send(Box::new(f)).is_ok()
    }

    /// Run a job on the connection and wait for its result.
    pub async fn call<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut ConnState) -> T + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if !self.enqueue(move |st| {
            let _ = tx.send(f(st));
        }) {
            return None;
        }
        rx.await.ok()
    }

    /// Dispose the connection and wait until its subscriptions are released.
    pub async fn dispose(&self) {
        self.call(|st| st.dispose()).await;
    }

    /// Ask the transport serving the connection to close it.
    pub fn disconnect(&self) {
        self.disconnect.notify_one();
    }

    /// Resolves once [`disconnect`](Self::disconnect) has been called.
    pub async fn disconnected(&self) {
        self.disconnect.notified().await;
    }

    pub fn is_disposing(&self) -> bool {
        self.disposing.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ConnHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.cid)
    }
}

/// State of one connection. Only accessed from the connection task.
pub struct ConnState {
    cid: String,
    handle: ConnHandle,
    cache: Arc<Cache>,
    config: ConnConfig,
    http: HttpRequestInfo,
    out: Option<mpsc::UnboundedSender<String>>,
    token: Option<Box<RawValue>>,
    tid: String,
    protocol: u32,
    /// RID as requested → subscription.
    subs: HashMap<String, SubId>,
    subscriptions: HashMap<SubId, ClientSub>,
    ready: HashMap<u64, ReadyCallback>,
    next_ready: u64,
    disposing: bool,
    conn_sub: Option<BusSubscription>,
    registry: Weak<ConnRegistry>,
}

/// Parameters for creating a connection.
pub(crate) struct ConnParams {
    pub cache: Arc<Cache>,
    pub config: ConnConfig,
    pub http: HttpRequestInfo,
    /// Sink for client frames. `None` for HTTP connections.
    pub out: Option<mpsc::UnboundedSender<String>>,
    pub protocol: u32,
}

impl ConnState {
    /// Spawn the connection task.
    pub(crate) fn spawn(params: ConnParams, registry: Weak<ConnRegistry>) -> ConnHandle {
        let cid = Uuid::new_v4().simple().to_string();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let handle = ConnHandle {
            cid: Arc::from(cid.as_str()),
            tx,
            disposing: Arc::new(AtomicBool::new(false)),
            disconnect: Arc::new(Notify::new()),
        };

        let mut st = ConnState {
            cid,
            handle: handle.clone(),
            cache: params.cache,
            config: params.config,
            http: params.http,
            out: params.out,
            token: None,
            tid: String::new(),
            protocol: params.protocol,
            subs: HashMap::new(),
            subscriptions: HashMap::new(),
            ready: HashMap::new(),
            next_ready: 0,
            disposing: false,
            conn_sub: None,
            registry,
        };
        st.subscribe_conn();

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job(&mut st);
                if st.disposing {
                    break;
                }
            }
            // Jobs queued behind the dispose still run, so that late cache
            // callbacks release what they hold.
            rx.close();
            while let Ok(job) = rx.try_recv() {
                job(&mut st);
            }
            st.dispose();
        });

        handle
    }

    pub fn cid(&self) -> &str {
        &self.cid
    }

    pub fn protocol(&self) -> u32 {
        self.protocol
    }

    pub fn token(&self) -> Option<&RawValue> {
        self.token.as_deref()
    }

    pub(crate) fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Replace the `{cid}` placeholder with the connection ID.
    pub fn expand_cid(&self, rid: &str) -> String {
        rid.replace(CID_PLACEHOLDER, &self.cid)
    }

    pub(crate) fn subscription(&self, id: SubId) -> Option<&ClientSub> {
        self.subscriptions.get(&id)
    }

    pub fn subscription_count(&self) -> usize {
        self.subs.len()
    }

    /// Send a response frame.
    pub(crate) fn reply(&self, frame: String) {
        if let Some(out) = &self.out {
            trace!("[{}] <-- {}", self.cid, frame);
            let _ = out.send(frame);
        }
    }

    /// Send an event frame for `<rid>.<name>`.
    pub(crate) fn send_event<T: Serialize>(&self, rid: &str, name: &str, data: Option<&T>) {
        let Some(out) = &self.out else { return };
        match protocol::event_frame(rid, name, data) {
            Ok(frame) => {
                trace!("[{}] <<- {}", self.cid, frame);
                let _ = out.send(frame);
            }
            Err(e) => error!("[{}] Error encoding event {}.{}: {}", self.cid, rid, name, e),
        }
    }

    fn params<'a>(&'a self, query: &'a str, params: Option<&'a RawValue>, is_http: bool) -> RequestParams<'a> {
        RequestParams {
            params,
            token: self.token.as_deref(),
            query,
            cid: &self.cid,
            is_http,
        }
    }

    // ========================================================================
    // Connection events
    // ========================================================================

    fn subscribe_conn(&mut self) {
        let handle = self.handle.clone();
        let result = self.cache.bus().subscribe(
            &format!("conn.{}", self.cid),
            Box::new(move |msg| {
                handle.enqueue(move |st| st.handle_conn_event(&msg.subject, &msg.payload));
            }),
        );
        match result {
            Ok(sub) => self.conn_sub = Some(sub),
            Err(e) => error!("[{}] Error subscribing to conn events: {}", self.cid, e),
        }
    }

    fn handle_conn_event(&mut self, subject: &str, payload: &[u8]) {
        let event = subject
            .strip_prefix("conn.")
            .and_then(|s| s.strip_prefix(self.cid.as_str()))
            .and_then(|s| s.strip_prefix('.'))
            .filter(|e| !e.is_empty());
        let Some(event) = event else {
            error!("[{}] Error processing conn event {}: malformed event subject", self.cid, subject);
            return;
        };

        if event == "token" {
            match codec::decode_conn_token_event(payload) {
                Ok(ev) => self.set_token(ev.token, ev.tid),
                Err(e) => error!("[{}] Error processing token event: {}", self.cid, e),
            }
        }
    }

    /// Store a new access token. Replacing a non-null token makes every
    /// subscription re-validate its access.
    pub(crate) fn set_token(&mut self, token: Option<Box<RawValue>>, tid: String) {
        self.tid = tid;
        let had_token = self.token.is_some();
        self.token = token;
        if !had_token {
            return;
        }
        let ids: Vec<SubId> = self.subscriptions.keys().copied().collect();
        for id in ids {
            self.reaccess(id, None);
        }
    }

    /// Re-authenticate if the connection's token ID is among `tids`.
    pub(crate) fn token_reset(&mut self, tids: &HashSet<String>, subject: &str) {
        if self.tid.is_empty() || !tids.contains(&self.tid) {
            return;
        }
        let cid = self.cid.clone();
        let owned_subject = subject.to_string();
        let p = self.params("", None, false);
        self.cache.custom_auth(subject, p, &self.http, move |res| {
            if let Err(e) = res {
                if e.is(CODE_TIMEOUT) {
                    error!("[{}] Token reset auth request timeout on subject: {}", cid, owned_subject);
                }
            }
        });
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Release every subscription and stop accepting jobs.
    pub(crate) fn dispose(&mut self) {
        if self.disposing {
            return;
        }
        self.disposing = true;
        self.handle.disposing.store(true, Ordering::Release);

        if let Some(sub) = self.conn_sub.take() {
            sub.unsubscribe();
        }

        let ids: Vec<SubId> = self.subs.drain().map(|(_, id)| id).collect();
        let mut orphaned = Vec::new();
        for id in ids {
            orphaned.extend(self.dispose_sub(id));
        }
        self.subscriptions.clear();
        self.ready.clear();
        for cb in orphaned {
            cb(self, disposed_access());
        }
        self.out = None;

        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(&self.cid);
        }
        debug!("[{}] Disposed", self.cid);
    }
}

fn disposed_access() -> crate::rescache::Access {
    crate::rescache::Access::from_result(Err(ResError::disposed_subscription()))
}
