//! Message bus client for the gateway.
//!
//! The gateway's resource cache talks to services through the [`MessageBus`]
//! trait: asynchronous requests answered through a callback, and namespace
//! subscriptions delivering events. [`NatsClient`] implements it on top of
//! `async-nats`.
//!
//! ## Architecture
//!
//! ```text
//! send_request ──▶ command channel ──▶ listener task ──▶ NATS
//!                                           │
//!                   ┌───────────────────────┤
//!                   ▼                       ▼
//!         _INBOX.<id>.* responses    <namespace>.* events
//!                   │                       │
//!          pending callbacks         subscription handlers
//! ```
//!
//! A single listener task owns every NATS subscription, so handlers and
//! response callbacks are invoked from one delivery task, in arrival order
//! per subscription.

pub mod bus;
pub mod client;
pub mod error;
mod meta;

pub use bus::{BusMessage, BusSubscription, ClosedHandler, MessageBus, MessageHandler, ResponseCallback};
pub use client::{NatsClient, NatsConfig, DEFAULT_REQUEST_TIMEOUT, MAX_CONTROL_LINE_SIZE};
pub use error::{BusError, Result};
