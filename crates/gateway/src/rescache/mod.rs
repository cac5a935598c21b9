//! Resource cache.
//!
//! Caches resources fetched from services, keeps them up to date by applying
//! service events, and fans changes out to subscribers. One
//! [`EventSubscription`] exists per resource name, holding one
//! `ResourceSubscription` per normalized query.
//!
//! ## Architecture
//!
//! ```text
//!                     ┌──────────────────────────────┐
//!  subscribe/access ─▶│ Cache                        │
//!  call/auth          │  event_subs: name → EventSub │── get/access/call ──▶ bus
//!                     └───────────────┬──────────────┘
//!                                     │ enqueue
//!  event.<name>.* ──▶ EventSub.queue ─┴──▶ worker pool ──▶ Subscriber::{loaded, event}
//! ```
//!
//! An event subscription is kept alive by a reference count of subscribers
//! and in-flight requests. When the count drops to zero the name is queued
//! for eviction and torn down after `unsubscribe_delay`, unless it is
//! referenced again first.

pub mod access;
mod event_subscription;
pub mod lcs;
mod resource_subscription;
pub mod throttle;

pub use access::Access;
pub use throttle::Throttle;

use crate::codec::{self, CallResult, HttpRequestInfo, Model, RequestParams, Resource, Value};
use crate::pattern::ResourcePattern;
use crate::reserr::ResError;
use bytes::Bytes;
use common::TimerQueue;
use event_subscription::EventSubscription;
use metrics::gauge;
use nats_client::{BusSubscription, MessageBus};
use resource_subscription::RsId;
use serde_json::value::RawValue;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Identifies a subscriber within the cache.
pub type SubscriberId = u64;

/// Cache tuning.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Number of workers processing event subscription queues.
    pub workers: usize,
    /// Max concurrent get requests during a system reset. 0 means unlimited.
    pub reset_throttle: usize,
    /// Delay before an unreferenced resource name is evicted.
    pub unsubscribe_delay: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            reset_throttle: 0,
            unsubscribe_delay: Duration::from_secs(5),
        }
    }
}

/// A consumer of a cached resource.
///
/// All callbacks run on a cache worker while the resource's state is locked.
/// Implementations must only hand the data off, never block or call back
/// into the cache synchronously.
pub trait Subscriber: Send + Sync {
    fn id(&self) -> SubscriberId;
    fn cid(&self) -> &str;
    fn resource_name(&self) -> &str;
    fn resource_query(&self) -> &str;
    /// Called once with the loaded snapshot or the error preventing it.
    fn loaded(&self, result: Result<LoadedResource, ResError>);
    /// Called for every event applied after `loaded`.
    fn event(&self, event: Arc<ResourceEvent>);
    /// Called when access to the resource must be re-validated.
    fn reaccess(&self, throttle: Option<Throttle>);
}

/// Snapshot handed to a subscriber once its resource is loaded.
#[derive(Clone)]
pub struct LoadedResource {
    pub handle: ResourceHandle,
    pub resource: Resource,
    /// Version of the snapshot. The next event carries the same version.
    pub version: u64,
}

/// Handle to the resource subscription a subscriber is registered on.
#[derive(Clone)]
pub struct ResourceHandle {
    es: Arc<EventSubscription>,
    id: RsId,
}

impl ResourceHandle {
    /// Remove the subscriber. Queued behind any pending event for the
    /// resource.
    pub fn unsubscribe(&self, sub: SubscriberId) {
        let id = self.id;
        self.es.enqueue(move |es, st| st.unsubscribe(es, id, sub));
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("name", &self.es.name)
            .field("id", &self.id)
            .finish()
    }
}

/// An event applied to a cached resource.
#[derive(Debug, Clone, Default)]
pub struct ResourceEvent {
    pub event: String,
    /// Raw event data as sent by the service.
    pub payload: Option<Box<RawValue>>,
    /// Resource version the event applies to.
    pub version: u64,
    /// Whether the event mutated the resource.
    pub update: bool,
    /// Effective changes of a change event.
    pub changed: HashMap<String, Value>,
    /// Model values before a change event.
    pub old_values: Option<Arc<Model>>,
    /// Index of an add or remove event.
    pub idx: usize,
    /// Added or removed value.
    pub value: Option<Value>,
    /// Resource after the event was applied.
    pub resource: Option<Resource>,
}

impl ResourceEvent {
    pub fn new(event: &str, payload: Option<Box<RawValue>>) -> Self {
        Self {
            event: event.to_string(),
            payload,
            ..Default::default()
        }
    }
}

/// Deprecated service behavior, logged once per service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Deprecated {
    ModelChangeEvent,
    NewCallRequest,
}

impl Deprecated {
    fn message(self) -> &'static str {
        match self {
            Deprecated::ModelChangeEvent => "change event v1.0 format",
            Deprecated::NewCallRequest => "new call request",
        }
    }
}

type TokenResetHandler = Arc<dyn Fn(&HashSet<String>, &str) + Send + Sync>;

/// State shared between the cache and its event subscriptions.
pub(crate) struct Shared {
    bus: Arc<dyn MessageBus>,
    work_tx: mpsc::UnboundedSender<Arc<EventSubscription>>,
    unsub_queue: TimerQueue<String>,
    deprecated: Mutex<HashSet<(String, Deprecated)>>,
}

impl Shared {
    /// Log a deprecation warning the first time a service uses `feature`.
    fn deprecated(&self, rname: &str, feature: Deprecated) {
        let service = rname.split('.').next().unwrap_or(rname).to_string();
        let mut seen = self.deprecated.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.insert((service.clone(), feature)) {
            warn!("Deprecated: service {} uses {}", service, feature.message());
        }
    }
}

/// The resource cache.
pub struct Cache {
    shared: Arc<Shared>,
    config: CacheConfig,
    event_subs: Arc<Mutex<HashMap<String, Arc<EventSubscription>>>>,
    work_rx: Mutex<Option<mpsc::UnboundedReceiver<Arc<EventSubscription>>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    system_sub: Mutex<Option<BusSubscription>>,
    token_reset: Mutex<Option<TokenResetHandler>>,
}

type EventSubMap = HashMap<String, Arc<EventSubscription>>;

fn lock_map(map: &Mutex<EventSubMap>) -> MutexGuard<'_, EventSubMap> {
    map.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Evict a resource name if it is still unreferenced.
fn mq_unsubscribe(map: &Mutex<EventSubMap>, name: &str) {
    let mut subs = lock_map(map);
    let Some(es) = subs.get(name) else { return };
    if !es.try_dispose() {
        return;
    }
    subs.remove(name);
    debug!("Evicted {}", name);
    gauge!("gateway_cache_resources").set(subs.len() as f64);
}

impl Cache {
    /// Create a cache. Must be called within a tokio runtime.
    pub fn new(bus: Arc<dyn MessageBus>, config: CacheConfig) -> Arc<Self> {
        let event_subs: Arc<Mutex<EventSubMap>> = Arc::new(Mutex::new(HashMap::new()));
        let weak = Arc::downgrade(&event_subs);
        let unsub_queue = TimerQueue::new(config.unsubscribe_delay, move |name: String| {
            if let Some(map) = weak.upgrade() {
                mq_unsubscribe(&map, &name);
            }
        });
        let (work_tx, work_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            shared: Arc::new(Shared {
                bus,
                work_tx,
                unsub_queue,
                deprecated: Mutex::new(HashSet::new()),
            }),
            config,
            event_subs,
            work_rx: Mutex::new(Some(work_rx)),
            workers: Mutex::new(Vec::new()),
            system_sub: Mutex::new(None),
            token_reset: Mutex::new(None),
        })
    }

    /// Start the worker pool and subscribe to system events.
    pub fn start(self: &Arc<Self>) -> Result<(), ResError> {
        let Some(rx) = self.work_rx.lock().unwrap_or_else(PoisonError::into_inner).take() else {
            return Ok(());
        };
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for _ in 0..self.config.workers.max(1) {
            let rx = rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let es = rx.lock().await.recv().await;
                    match es {
                        Some(es) => es.process_queue(),
                        None => break,
                    }
                }
            }));
        }
        drop(workers);

        let weak: Weak<Cache> = Arc::downgrade(self);
        let sub = self.shared.bus.subscribe(
            "system",
            Box::new(move |msg| {
                let Some(cache) = weak.upgrade() else { return };
                match msg.subject.strip_prefix("system.") {
                    Some("reset") => cache.handle_system_reset(&msg.payload),
                    Some("tokenReset") => cache.handle_system_token_reset(&msg.payload),
                    _ => debug!("Unknown system event: {}", msg.subject),
                }
            }),
        )?;
        *self.system_sub.lock().unwrap_or_else(PoisonError::into_inner) = Some(sub);
        info!("Resource cache started with {} workers", self.config.workers.max(1));
        Ok(())
    }

    /// Stop the workers and drop every cached resource.
    pub fn stop(&self) {
        if let Some(sub) = self.system_sub.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sub.unsubscribe();
        }
        for worker in self.workers.lock().unwrap_or_else(PoisonError::into_inner).drain(..) {
            worker.abort();
        }
        self.shared.unsub_queue.clear();
        lock_map(&self.event_subs).clear();
        gauge!("gateway_cache_resources").set(0.0);
    }

    /// Set the handler receiving `system.tokenReset` events: the set of
    /// token IDs and the subject to send auth requests to.
    pub fn set_token_reset_handler<F>(&self, handler: F)
    where
        F: Fn(&HashSet<String>, &str) + Send + Sync + 'static,
    {
        *self.token_reset.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(handler));
    }

    /// The underlying bus.
    pub fn bus(&self) -> &Arc<dyn MessageBus> {
        &self.shared.bus
    }

    /// Number of cached resource names.
    pub fn resource_count(&self) -> usize {
        lock_map(&self.event_subs).len()
    }

    /// Reference count of a resource name, if cached.
    pub fn subscription_count(&self, name: &str) -> Option<i64> {
        lock_map(&self.event_subs).get(name).map(|es| es.count())
    }

    fn get_subscription(&self, name: &str, subscribe: bool) -> Result<Arc<EventSubscription>, ResError> {
        let mut subs = lock_map(&self.event_subs);
        let es = match subs.get(name) {
            Some(es) => {
                es.add_count();
                es.clone()
            }
            None => {
                let es = Arc::new(EventSubscription::new(name.to_string(), self.shared.clone()));
                subs.insert(name.to_string(), es.clone());
                gauge!("gateway_cache_resources").set(subs.len() as f64);
                es
            }
        };

        if subscribe && !es.has_bus_subscription() {
            let weak = Arc::downgrade(&es);
            let handler = Box::new(move |msg: nats_client::BusMessage| {
                if let Some(es) = weak.upgrade() {
                    es.enqueue_event(msg.subject, msg.payload);
                }
            });
            match self.shared.bus.subscribe(&format!("event.{}", name), handler) {
                Ok(sub) => es.set_bus_subscription(sub),
                Err(e) => {
                    es.remove_count(1);
                    return Err(e.into());
                }
            }
        }
        Ok(es)
    }

    /// Subscribe to a resource. The subscriber's `loaded` is called with
    /// the snapshot or an error.
    pub fn subscribe(&self, sub: Arc<dyn Subscriber>, throttle: Option<Throttle>) {
        match self.get_subscription(sub.resource_name(), true) {
            Ok(es) => es.add_subscriber(sub, throttle),
            Err(e) => sub.loaded(Err(e)),
        }
    }

    /// Send a request concerning `rname`, keeping the name referenced until
    /// the response has been handled on its work queue.
    fn send_request<F>(&self, rname: &str, subject: &str, payload: Bytes, cb: F)
    where
        F: FnOnce(Result<Bytes, ResError>) + Send + 'static,
    {
        let es = match self.get_subscription(rname, false) {
            Ok(es) => es,
            Err(e) => return cb(Err(e)),
        };
        self.shared.bus.send_request(
            subject,
            payload,
            Box::new(move |res| {
                es.enqueue(move |es, _| {
                    cb(res.map_err(ResError::from));
                    es.remove_count(1);
                });
            }),
        );
    }

    /// Request access for a resource.
    pub fn access<F>(&self, rname: &str, p: RequestParams<'_>, cb: F)
    where
        F: FnOnce(Access) + Send + 'static,
    {
        let subject = format!("access.{}", rname);
        self.send_request(rname, &subject, codec::create_request(p), move |res| {
            cb(Access::from_result(res.and_then(|p| codec::decode_access_response(&p))));
        });
    }

    /// Call a method on a resource. The legacy `new` result is translated
    /// to a resource response.
    pub fn call<F>(&self, rname: &str, action: &str, p: RequestParams<'_>, cb: F)
    where
        F: FnOnce(Result<CallResult, ResError>) + Send + 'static,
    {
        let subject = format!("call.{}.{}", rname, action);
        let is_new = action == "new";
        let shared = self.shared.clone();
        let name = rname.to_string();
        self.send_request(rname, &subject, codec::create_request(p), move |res| {
            let result = res.and_then(|p| codec::decode_call_response(&p));
            let result = match result {
                Ok(CallResult::Payload(raw)) if is_new => match codec::try_decode_legacy_new_result(&raw) {
                    Ok(Some(rid)) => {
                        shared.deprecated(&name, Deprecated::NewCallRequest);
                        Ok(CallResult::Resource(rid))
                    }
                    Ok(None) => Ok(CallResult::Payload(raw)),
                    Err(e) => Err(e),
                },
                other => other,
            };
            cb(result);
        });
    }

    /// Send an auth request for a resource.
    pub fn auth<F>(&self, rname: &str, action: &str, p: RequestParams<'_>, http: &HttpRequestInfo, cb: F)
    where
        F: FnOnce(Result<CallResult, ResError>) + Send + 'static,
    {
        let subject = format!("auth.{}.{}", rname, action);
        self.send_request(rname, &subject, codec::create_auth_request(p, http), move |res| {
            cb(res.and_then(|p| codec::decode_call_response(&p)));
        });
    }

    /// Send an auth request to an arbitrary subject, bypassing the cache
    /// reference counting. The callback runs on the bus delivery task.
    pub fn custom_auth<F>(&self, subject: &str, p: RequestParams<'_>, http: &HttpRequestInfo, cb: F)
    where
        F: FnOnce(Result<CallResult, ResError>) + Send + 'static,
    {
        self.shared.bus.send_request(
            subject,
            codec::create_auth_request(p, http),
            Box::new(move |res| {
                cb(res
                    .map_err(ResError::from)
                    .and_then(|p| codec::decode_call_response(&p)));
            }),
        );
    }

    fn handle_system_reset(&self, payload: &[u8]) {
        let reset = match codec::decode_system_reset(payload) {
            Ok(r) => r,
            Err(e) => {
                error!("Error decoding system reset: {}", e);
                return;
            }
        };
        info!(
            "System reset: resources={:?} access={:?}",
            reset.resources, reset.access
        );

        let throttle = (self.config.reset_throttle > 0).then(|| Throttle::new(self.config.reset_throttle));
        self.for_each_match(&reset.resources, |es| es.handle_reset_resource(throttle.clone()));
        // Access resets are never throttled
        self.for_each_match(&reset.access, |es| es.handle_reset_access(None));
    }

    fn handle_system_token_reset(&self, payload: &[u8]) {
        let reset = match codec::decode_system_token_reset(payload) {
            Ok(r) => r,
            Err(e) => {
                error!("Error decoding system token reset: {}", e);
                return;
            }
        };
        if reset.tids.is_empty() {
            return;
        }
        if reset.subject.is_empty() {
            error!("System token reset missing subject");
            return;
        }
        let handler = self.token_reset.lock().unwrap_or_else(PoisonError::into_inner).clone();
        if let Some(handler) = handler {
            let tids: HashSet<String> = reset.tids.into_iter().collect();
            handler(&tids, &reset.subject);
        }
    }

    fn for_each_match<F>(&self, patterns: &[String], mut f: F)
    where
        F: FnMut(&Arc<EventSubscription>),
    {
        let patterns: Vec<ResourcePattern> = patterns
            .iter()
            .filter_map(|p| {
                let pattern = ResourcePattern::parse(p);
                if !pattern.is_valid() {
                    warn!("Invalid system reset pattern: {}", p);
                    return None;
                }
                Some(pattern)
            })
            .collect();
        if patterns.is_empty() {
            return;
        }

        let subs = lock_map(&self.event_subs);
        for (name, es) in subs.iter() {
            if patterns.iter().any(|p| p.matches(name)) {
                f(es);
            }
        }
    }
}

impl Drop for Cache {
    fn drop(&mut self) {
        for worker in self.workers.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            worker.abort();
        }
    }
}
