//! Realtime resource gateway.
//!
//! This service:
//! - Accepts WebSocket clients speaking the RES client protocol
//! - Serves the same resources over a plain HTTP API
//! - Fetches resources from services over NATS and caches them
//! - Applies service events to the cache and forwards them to subscribers
//!
//! ## Architecture
//!
//! ```text
//! WebSocket / HTTP clients
//!         ↓
//! Connection actors (conn): client subscriptions, access, reference graph
//!         ↓
//! Resource cache (rescache): one event subscription per resource name
//!         ↓
//! MessageBus (nats_client): get / access / call / auth, event.<rid>.*
//! ```
//!
//! ## Concurrency
//!
//! - Each connection is a task owning its state; everything reaching it is
//!   queued as a job
//! - Cache work for a resource name runs on one worker at a time
//! - Lock-free connection registry using DashMap

pub mod codec;
pub mod config;
pub mod conn;
pub mod error;
pub mod http_api;
pub mod pattern;
pub mod protocol;
pub mod rescache;
pub mod reserr;
pub mod rpc;
pub mod ws_server;

#[cfg(test)]
mod test_util;

pub use config::{ApiEncoding, Config};
pub use conn::{ConnConfig, ConnRegistry};
pub use error::{GatewayError, Result};
pub use rescache::{Cache, CacheConfig};
pub use reserr::ResError;
pub use ws_server::{create_router, AppState};
