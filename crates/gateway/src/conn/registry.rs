//! Registry of live WebSocket connections.
//!
//! Uses DashMap so that transports and cache callbacks can look up
//! connections without contending on a single lock.

use super::{ConnHandle, ConnParams, ConnState};
use dashmap::DashMap;
use metrics::gauge;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::info;

/// Tracks the connections of WebSocket clients.
pub struct ConnRegistry {
    /// Connection ID → handle.
    conns: DashMap<String, ConnHandle>,
    stopping: AtomicBool,
}

impl ConnRegistry {
    pub fn new() -> Self {
        Self {
            conns: DashMap::new(),
            stopping: AtomicBool::new(false),
        }
    }

    /// Create and register a connection. Returns `None` once the registry is
    /// stopping.
    pub(crate) fn connect(self: &Arc<Self>, params: ConnParams) -> Option<ConnHandle> {
        if self.stopping.load(Ordering::Acquire) {
            return None;
        }
        let conn = ConnState::spawn(params, Arc::downgrade(self));
        self.conns.insert(conn.cid().to_string(), conn.clone());
        gauge!("gateway_ws_connections").set(self.count() as f64);
        info!("Connection {} registered", conn.cid());
        Some(conn)
    }

    /// Create a connection outside the registry, serving a single HTTP
    /// request.
    pub(crate) fn connect_temporary(&self, params: ConnParams) -> Option<ConnHandle> {
        if self.stopping.load(Ordering::Acquire) {
            return None;
        }
        Some(ConnState::spawn(params, Weak::new()))
    }

    pub(crate) fn unregister(&self, cid: &str) {
        if self.conns.remove(cid).is_some() {
            gauge!("gateway_ws_connections").set(self.count() as f64);
            info!("Connection {} unregistered", cid);
        }
    }

    pub fn get(&self, cid: &str) -> Option<ConnHandle> {
        self.conns.get(cid).map(|c| c.clone())
    }

    pub fn count(&self) -> usize {
        self.conns.len()
    }

    /// Re-authenticate connections whose token ID is listed.
    pub fn token_reset(&self, tids: &HashSet<String>, subject: &str) {
        let tids = Arc::new(tids.clone());
        for entry in self.conns.iter() {
            let tids = tids.clone();
            let subject = subject.to_string();
            entry.value().enqueue(move |st| st.token_reset(&tids, &subject));
        }
    }

    /// Refuse new connections and ask every transport to disconnect.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        for entry in self.conns.iter() {
            entry.value().disconnect();
        }
    }
}

impl Default for ConnRegistry {
    fn default() -> Self {
        Self::new()
    }
}
