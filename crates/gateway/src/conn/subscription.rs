//! Client subscriptions.
//!
//! A [`ClientSub`] binds one RID on a connection to a resource in the cache.
//! It follows the references of its resource, holds back events while
//! referenced resources load, and turns cache events into client events.
//!
//! ```text
//! Loading ──▶ Loaded ──▶ ToSend ──▶ Sent
//!    │                                │ delete
//!    └──▶ Ready (load error)          ▼
//!                                  Deleted
//! ```
//!
//! Readiness means the resource and everything it references, transitively,
//! is loaded. It is tracked with ready callbacks shared by every subscription
//! on the path, each counting the subscriptions still loading.

use super::{disposed_access, ConnHandle, ConnState};
use crate::codec::{Legacy120Collection, Legacy120Model, Legacy120Value, Legacy120ValueMap, Resource, Value};
use crate::protocol::{AddEvent, ChangeEvent, Resources, UnsubscribeEvent, VERSION_SOFT_REFERENCE_AND_DATA};
use crate::rescache::{Access, LoadedResource, ResourceEvent, ResourceHandle, Subscriber, SubscriberId, Throttle};
use crate::reserr::{ResError, CODE_ACCESS_DENIED};
use serde::Serialize;
use serde_json::value::{to_raw_value, RawValue};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Identifies a client subscription. Unique across connections, as it
/// doubles as the cache subscriber ID.
pub(crate) type SubId = SubscriberId;

static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum SubState {
    Disposed,
    Loading,
    Loaded,
    Ready,
    ToSend,
    Sent,
    Deleted,
}

// Reasons for holding back events
const QUEUE_LOADING: u8 = 1 << 0;
const QUEUE_REACCESS: u8 = 1 << 1;

pub(super) type AccessCallback = Box<dyn FnOnce(&mut ConnState, Access) + Send>;
type ReadyFn = Box<dyn FnOnce(&mut ConnState) + Send>;

pub(crate) struct ReadyCallback {
    /// RIDs already waited for.
    refs: HashSet<String>,
    cb: ReadyFn,
    loading: usize,
}

#[derive(Debug)]
struct Reference {
    sub: SubId,
    count: usize,
}

pub(crate) struct ClientSub {
    rid: String,
    name: String,
    query: String,
    pub(super) state: SubState,
    ready_callbacks: Vec<u64>,
    handle: Option<ResourceHandle>,
    resource: Option<Resource>,
    version: u64,
    refs: HashMap<String, Reference>,
    err: Option<ResError>,
    queue_flag: u8,
    event_queue: VecDeque<Arc<ResourceEvent>>,
    access: Option<Access>,
    access_callbacks: Vec<AccessCallback>,
    access_called: bool,
    reaccess_pending: bool,
    throttle: Option<Throttle>,
    pub(super) direct: usize,
    pub(super) indirect: usize,
}

impl ClientSub {
    fn new(rid: &str, expanded: &str, throttle: Option<Throttle>) -> Self {
        let (name, query) = parse_rid(expanded);
        Self {
            rid: rid.to_string(),
            name: name.to_string(),
            query: query.to_string(),
            state: SubState::Loading,
            ready_callbacks: Vec::new(),
            handle: None,
            resource: None,
            version: 0,
            refs: HashMap::new(),
            err: None,
            queue_flag: QUEUE_LOADING,
            event_queue: VecDeque::new(),
            access: None,
            access_callbacks: Vec::new(),
            access_called: false,
            reaccess_pending: false,
            throttle,
            direct: 0,
            indirect: 0,
        }
    }

    pub fn rid(&self) -> &str {
        &self.rid
    }

    pub fn is_ready(&self) -> bool {
        self.state >= SubState::Ready
    }

    pub fn is_sent(&self) -> bool {
        self.state == SubState::Sent
    }

    /// Error preventing the resource from being delivered.
    pub fn error(&self) -> Option<ResError> {
        if self.state == SubState::Disposed {
            return Some(ResError::disposed_subscription());
        }
        self.err.clone()
    }

    pub fn resource(&self) -> Option<&Resource> {
        self.resource.as_ref()
    }

    /// Subscription of a referenced RID.
    pub fn reference(&self, rid: &str) -> Option<SubId> {
        self.refs.get(rid).map(|r| r.sub)
    }

    pub(super) fn references(&self) -> impl Iterator<Item = SubId> + '_ {
        self.refs.values().map(|r| r.sub)
    }
}

/// Split a resource ID into resource name and query.
pub(super) fn parse_rid(rid: &str) -> (&str, &str) {
    rid.split_once('?').unwrap_or((rid, ""))
}

/// Registered with the cache on behalf of a client subscription. Forwards
/// every callback onto the connection task.
struct SubscriberProxy {
    id: SubId,
    cid: String,
    name: String,
    query: String,
    conn: ConnHandle,
}

impl Subscriber for SubscriberProxy {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn cid(&self) -> &str {
        &self.cid
    }

    fn resource_name(&self) -> &str {
        &self.name
    }

    fn resource_query(&self) -> &str {
        &self.query
    }

    fn loaded(&self, result: Result<LoadedResource, ResError>) {
        let handle = result.as_ref().ok().map(|l| l.handle.clone());
        let id = self.id;
        if !self.conn.enqueue(move |st| st.on_loaded_resource(id, result)) {
            if let Some(handle) = handle {
                handle.unsubscribe(id);
            }
        }
    }

    fn event(&self, event: Arc<ResourceEvent>) {
        let id = self.id;
        self.conn.enqueue(move |st| st.on_event(id, event));
    }

    fn reaccess(&self, throttle: Option<Throttle>) {
        let id = self.id;
        self.conn.enqueue(move |st| st.reaccess(id, throttle));
    }
}

fn raw<T: Serialize>(value: &T) -> Result<Box<RawValue>, ResError> {
    to_raw_value(value).map_err(ResError::from)
}

impl ConnState {
    fn is_disposed(&self, id: SubId) -> bool {
        self.subscriptions
            .get(&id)
            .map_or(true, |s| s.state == SubState::Disposed)
    }

    fn is_sent(&self, id: SubId) -> bool {
        self.subscriptions.get(&id).is_some_and(|s| s.is_sent())
    }

    fn legacy_values(&self) -> bool {
        self.protocol < VERSION_SOFT_REFERENCE_AND_DATA
    }

    // ========================================================================
    // Counting
    // ========================================================================

    /// Get or create the subscription for `rid`, counting it as direct or
    /// indirect.
    pub(crate) fn subscribe(&mut self, rid: &str, direct: bool, throttle: Option<Throttle>) -> Result<SubId, ResError> {
        if self.disposing {
            return Err(ResError::disposing());
        }
        if let Some(&id) = self.subs.get(rid) {
            self.add_count(id, direct)?;
            return Ok(id);
        }

        let throttle = throttle.or_else(|| {
            (self.config.reference_throttle > 0).then(|| Throttle::new(self.config.reference_throttle))
        });
        let id = NEXT_SUB_ID.fetch_add(1, Ordering::Relaxed);
        let mut sub = ClientSub::new(rid, &self.expand_cid(rid), throttle.clone());
        if direct {
            sub.direct = 1;
        } else {
            sub.indirect = 1;
        }
        let proxy = Arc::new(SubscriberProxy {
            id,
            cid: self.cid.clone(),
            name: sub.name.clone(),
            query: sub.query.clone(),
            conn: self.handle.clone(),
        });
        self.subscriptions.insert(id, sub);
        self.subs.insert(rid.to_string(), id);
        self.cache.subscribe(proxy, throttle);
        Ok(id)
    }

    fn add_count(&mut self, id: SubId, direct: bool) -> Result<(), ResError> {
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return Err(ResError::disposed_subscription());
        };
        if !direct {
            sub.indirect += 1;
            return Ok(());
        }
        if sub.direct >= super::SUBSCRIPTION_COUNT_LIMIT {
            debug!("[{}] Subscription {}: Subscription limit exceeded ({})", self.cid, sub.rid, sub.direct);
            return Err(ResError::subscription_limit_exceeded());
        }
        sub.direct += 1;
        Ok(())
    }

    /// Count down a subscription, collecting it and anything only it
    /// references if `try_delete` is set.
    pub(crate) fn unsubscribe(&mut self, id: SubId, direct: bool, count: usize, try_delete: bool) {
        if self.disposing {
            return;
        }
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        if sub.direct + sub.indirect == 0 {
            return;
        }
        if direct {
            sub.direct = sub.direct.saturating_sub(count);
        } else {
            sub.indirect = sub.indirect.saturating_sub(count);
        }
        if try_delete {
            self.try_delete(id);
        }
    }

    /// Remove `count` direct subscriptions of `rid`. Fails if there are fewer.
    pub(crate) fn unsubscribe_by_rid(&mut self, rid: &str, count: usize) -> bool {
        if self.disposing {
            return false;
        }
        let Some(&id) = self.subs.get(rid) else { return false };
        match self.subscriptions.get(&id) {
            Some(sub) if sub.direct >= count => {
                self.unsubscribe(id, true, count, true);
                true
            }
            _ => false,
        }
    }

    /// Mark a subscription disposed and release its resource. Returns the
    /// access callbacks left waiting; the caller fails them once the
    /// subscription maps are consistent again.
    pub(super) fn dispose_sub(&mut self, id: SubId) -> Vec<AccessCallback> {
        let Some(sub) = self.subscriptions.get_mut(&id) else { return Vec::new() };
        if sub.state == SubState::Disposed {
            return Vec::new();
        }
        let prev = sub.state;
        sub.state = SubState::Disposed;
        let rcbs = std::mem::take(&mut sub.ready_callbacks);
        sub.event_queue.clear();
        sub.throttle = None;
        let callbacks = std::mem::take(&mut sub.access_callbacks);
        let handle = sub.handle.take();

        for rcb in rcbs {
            if !self.subscriptions.values().any(|s| s.ready_callbacks.contains(&rcb)) {
                self.ready.remove(&rcb);
            }
        }
        if let Some(handle) = handle {
            self.unsubscribe_refs(id);
            if prev != SubState::Deleted {
                handle.unsubscribe(id);
            }
        }
        callbacks
    }

    /// Remove a set of disposed subscriptions and fail their pending access
    /// callbacks.
    pub(super) fn remove_disposed(&mut self, ids: &[SubId], orphaned: Vec<AccessCallback>) {
        for id in ids {
            if let Some(sub) = self.subscriptions.remove(id) {
                if self.subs.get(&sub.rid) == Some(id) {
                    self.subs.remove(&sub.rid);
                }
            }
        }
        for cb in orphaned {
            cb(self, disposed_access());
        }
    }

    // ========================================================================
    // References
    // ========================================================================

    fn add_reference(&mut self, id: SubId, rid: &str) -> Result<SubId, ResError> {
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return Err(ResError::disposed_subscription());
        };
        if let Some(r) = sub.refs.get_mut(rid) {
            r.count += 1;
            return Ok(r.sub);
        }
        let throttle = sub.throttle.clone();
        let child = self.subscribe(rid, false, throttle)?;
        if let Some(sub) = self.subscriptions.get_mut(&id) {
            sub.refs.insert(rid.to_string(), Reference { sub: child, count: 1 });
        }
        Ok(child)
    }

    fn remove_reference(&mut self, id: SubId, rid: &str) {
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        let Some(r) = sub.refs.get_mut(rid) else { return };
        r.count -= 1;
        if r.count > 0 {
            return;
        }
        let child = r.sub;
        sub.refs.remove(rid);
        self.unsubscribe(child, false, 1, true);
    }

    fn unsubscribe_refs(&mut self, id: SubId) {
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        let refs = std::mem::take(&mut sub.refs);
        for r in refs.into_values() {
            self.unsubscribe(r.sub, false, 1, false);
        }
    }

    // ========================================================================
    // Loading
    // ========================================================================

    fn on_loaded_resource(&mut self, id: SubId, result: Result<LoadedResource, ResError>) {
        let loaded = match result {
            Err(e) => {
                if let Some(sub) = self.subscriptions.get_mut(&id) {
                    sub.err = Some(e);
                    self.done_loading(id);
                }
                return;
            }
            Ok(loaded) => loaded,
        };
        let Some(sub) = self.subscriptions.get_mut(&id).filter(|s| s.state != SubState::Disposed) else {
            loaded.handle.unsubscribe(id);
            return;
        };

        sub.handle = Some(loaded.handle);
        sub.state = SubState::Loaded;
        sub.queue_flag |= QUEUE_LOADING;
        let rids: Vec<String> = loaded
            .resource
            .values()
            .filter_map(|v| v.reference().map(str::to_string))
            .collect();

        for rid in rids {
            if let Err(e) = self.add_reference(id, &rid) {
                debug!("[{}] Failed to subscribe to {}: {}", self.cid, rid, e);
                self.unsubscribe_refs_counted(id);
                if let Some(sub) = self.subscriptions.get_mut(&id) {
                    sub.err = Some(e);
                }
                self.done_loading(id);
                return;
            }
        }

        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        sub.resource = Some(loaded.resource);
        sub.version = loaded.version;
        let rcbs = std::mem::take(&mut sub.ready_callbacks);
        for rcb in rcbs {
            self.collect_refs(id, rcb);
        }
    }

    /// Drop every reference after a failed load, collecting the children.
    fn unsubscribe_refs_counted(&mut self, id: SubId) {
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        let refs = std::mem::take(&mut sub.refs);
        for r in refs.into_values() {
            self.unsubscribe(r.sub, false, 1, true);
        }
    }

    fn done_loading(&mut self, id: SubId) {
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        sub.state = SubState::Ready;
        sub.throttle = None;
        let rcbs = std::mem::take(&mut sub.ready_callbacks);
        for rcb in rcbs {
            if let Some(r) = self.ready.get_mut(&rcb) {
                r.loading = r.loading.saturating_sub(1);
            }
            self.test_ready(rcb);
        }
    }

    /// Call `cb` once the subscription and everything it references is
    /// loaded. Calls it at once for ready or gone subscriptions.
    pub(crate) fn on_ready<F>(&mut self, id: SubId, cb: F)
    where
        F: FnOnce(&mut ConnState) + Send + 'static,
    {
        let waiting = self
            .subscriptions
            .get(&id)
            .is_some_and(|s| s.state != SubState::Disposed && !s.is_ready());
        if !waiting {
            return cb(self);
        }
        let rcb = self.next_ready;
        self.next_ready += 1;
        self.ready.insert(
            rcb,
            ReadyCallback {
                refs: HashSet::new(),
                cb: Box::new(cb),
                loading: 0,
            },
        );
        self.on_loaded(id, rcb);
    }

    fn on_loaded(&mut self, id: SubId, rcb: u64) {
        let Some(sub) = self.subscriptions.get_mut(&id).filter(|s| s.state != SubState::Disposed) else {
            return;
        };
        let loaded = sub.state >= SubState::Loaded;
        if !loaded {
            sub.ready_callbacks.push(rcb);
        }
        let rid = sub.rid.clone();
        if let Some(r) = self.ready.get_mut(&rcb) {
            r.refs.insert(rid);
            r.loading += 1;
        }
        if loaded {
            self.collect_refs(id, rcb);
        }
    }

    fn collect_refs(&mut self, id: SubId, rcb: u64) {
        let refs: Vec<(String, SubId)> = match self.subscriptions.get(&id) {
            Some(sub) => sub.refs.iter().map(|(rid, r)| (rid.clone(), r.sub)).collect(),
            None => Vec::new(),
        };
        for (rid, child) in refs {
            let ready = self.subscriptions.get(&child).map_or(true, |c| c.is_ready());
            let seen = self.ready.get(&rcb).map_or(true, |r| r.refs.contains(&rid));
            if ready || seen {
                continue;
            }
            self.on_loaded(child, rcb);
        }
        if let Some(r) = self.ready.get_mut(&rcb) {
            r.loading = r.loading.saturating_sub(1);
        }
        self.test_ready(rcb);
    }

    fn test_ready(&mut self, rcb: u64) {
        if !self.ready.get(&rcb).is_some_and(|r| r.loading == 0) {
            return;
        }
        if let Some(r) = self.ready.remove(&rcb) {
            (r.cb)(self);
        }
    }

    // ========================================================================
    // Snapshots
    // ========================================================================

    /// Collect the subscription and everything it references that the
    /// client has not yet received.
    pub(crate) fn get_rpc_resources(&mut self, id: SubId) -> Resources {
        let mut r = Resources::default();
        self.populate_resources(id, &mut r);
        r
    }

    fn populate_resources(&mut self, id: SubId, r: &mut Resources) {
        let legacy = self.legacy_values();
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        if matches!(sub.state, SubState::ToSend | SubState::Sent) {
            return;
        }
        if let Some(err) = sub.error() {
            r.errors.insert(sub.rid.clone(), err);
            return;
        }
        let encoded = match &sub.resource {
            Some(Resource::Model(m)) if legacy => raw(&Legacy120Model(m.as_ref())).map(|v| (true, v)),
            Some(Resource::Model(m)) => raw(m.as_ref()).map(|v| (true, v)),
            Some(Resource::Collection(c)) if legacy => raw(&Legacy120Collection(c.as_ref())).map(|v| (false, v)),
            Some(Resource::Collection(c)) => raw(c.as_ref()).map(|v| (false, v)),
            None => return,
        };
        match encoded {
            Ok((true, v)) => {
                r.models.insert(sub.rid.clone(), v);
            }
            Ok((false, v)) => {
                r.collections.insert(sub.rid.clone(), v);
            }
            Err(e) => {
                r.errors.insert(sub.rid.clone(), e);
                return;
            }
        }
        sub.state = SubState::ToSend;

        let children: Vec<SubId> = sub.references().collect();
        for child in children {
            self.populate_resources(child, r);
        }
    }

    /// Mark everything collected by [`get_rpc_resources`](Self::get_rpc_resources)
    /// as sent and release held back events.
    pub(crate) fn release_rpc_resources(&mut self, id: SubId) {
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        if matches!(sub.state, SubState::Disposed | SubState::Sent) || sub.err.is_some() {
            return;
        }
        sub.state = SubState::Sent;
        let children: Vec<SubId> = sub.references().collect();
        for child in children {
            self.release_rpc_resources(child);
        }
        self.unqueue_events(id, QUEUE_LOADING);
    }

    /// Forget that the client holds the resource. Events are held back
    /// until it is sent again.
    pub(super) fn unsend(&mut self, id: SubId) {
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        if sub.state != SubState::Sent {
            return;
        }
        sub.state = SubState::Ready;
        sub.queue_flag |= QUEUE_LOADING;
    }

    // ========================================================================
    // Events
    // ========================================================================

    fn queue_events(&mut self, id: SubId, reason: u8) {
        if let Some(sub) = self.subscriptions.get_mut(&id) {
            sub.queue_flag |= reason;
        }
    }

    fn unqueue_events(&mut self, id: SubId, reason: u8) {
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        sub.queue_flag &= !reason;
        if sub.queue_flag != 0 {
            return;
        }

        if sub.reaccess_pending {
            self.handle_reaccess(id, None);
            if self.subscriptions.get(&id).map_or(true, |s| s.queue_flag != 0) {
                return;
            }
        }

        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        let mut queue = std::mem::take(&mut sub.event_queue);
        while let Some(ev) = queue.pop_front() {
            self.process_event(id, ev);
            match self.subscriptions.get_mut(&id) {
                Some(sub) if sub.queue_flag != 0 => {
                    // Queueing restarted: keep the rest ahead of newer events
                    queue.append(&mut sub.event_queue);
                    sub.event_queue = queue;
                    return;
                }
                Some(_) => {}
                None => return,
            }
        }
    }

    fn on_event(&mut self, id: SubId, ev: Arc<ResourceEvent>) {
        if ev.event == "reaccess" {
            self.reaccess(id, None);
            return;
        }
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        if sub.handle.is_none() || sub.state == SubState::Disposed {
            return;
        }
        if sub.queue_flag != 0 {
            sub.event_queue.push_back(ev);
            return;
        }
        self.process_event(id, ev);
    }

    fn process_event(&mut self, id: SubId, ev: Arc<ResourceEvent>) {
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        if sub.version != ev.version {
            return;
        }
        if ev.update {
            sub.version += 1;
            if let Some(resource) = &ev.resource {
                sub.resource = Some(resource.clone());
            }
        }
        let rid = sub.rid.clone();
        let is_collection = matches!(sub.resource, Some(Resource::Collection(_)));

        match ev.event.as_str() {
            "add" if is_collection => self.process_add(id, rid, &ev),
            "remove" if is_collection => {
                if let Some(Value::Reference(ref_rid)) = &ev.value {
                    self.remove_reference(id, ref_rid);
                }
                self.send_event(&rid, &ev.event, ev.payload.as_ref());
            }
            "change" if !is_collection => self.process_change(id, rid, ev.clone()),
            "delete" => {
                if let Some(sub) = self.subscriptions.get_mut(&id) {
                    sub.state = SubState::Deleted;
                }
                self.send_event(&rid, &ev.event, ev.payload.as_ref());
                self.unsubscribe_direct(id, ResError::deleted());
            }
            _ => self.send_event(&rid, &ev.event, ev.payload.as_ref()),
        }
    }

    fn send_add_event(&self, rid: &str, idx: usize, value: &Value, resources: Option<&Resources>) {
        if self.legacy_values() {
            let data = AddEvent {
                idx,
                value: Legacy120Value(value),
                resources,
            };
            self.send_event(rid, "add", Some(&data));
        } else {
            let data = AddEvent { idx, value, resources };
            self.send_event(rid, "add", Some(&data));
        }
    }

    fn send_change_event(&self, rid: &str, values: &HashMap<String, Value>, resources: Option<&Resources>) {
        if self.legacy_values() {
            let data = ChangeEvent {
                values: Legacy120ValueMap(values),
                resources,
            };
            self.send_event(rid, "change", Some(&data));
        } else {
            let data = ChangeEvent { values, resources };
            self.send_event(rid, "change", Some(&data));
        }
    }

    fn process_add(&mut self, id: SubId, rid: String, ev: &ResourceEvent) {
        let Some(value) = ev.value.clone() else { return };
        let idx = ev.idx;
        let Value::Reference(ref_rid) = &value else {
            self.send_add_event(&rid, idx, &value, None);
            return;
        };

        let child = match self.add_reference(id, ref_rid) {
            Ok(child) => child,
            Err(e) => {
                error!("[{}] Subscription {}: Error subscribing to resource {}: {}", self.cid, rid, ref_rid, e);
                return;
            }
        };
        if self.is_sent(child) {
            self.send_add_event(&rid, idx, &value, None);
            return;
        }

        self.queue_events(id, QUEUE_LOADING);
        self.on_ready(child, move |st| {
            if st.is_disposed(id) {
                return;
            }
            let r = st.get_rpc_resources(child);
            st.send_add_event(&rid, idx, &value, Some(&r));
            st.release_rpc_resources(child);
            st.unqueue_events(id, QUEUE_LOADING);
        });
    }

    fn process_change(&mut self, id: SubId, rid: String, ev: Arc<ResourceEvent>) {
        let mut pending = Vec::new();
        for v in ev.changed.values() {
            let Some(ref_rid) = v.reference() else { continue };
            match self.add_reference(id, ref_rid) {
                Ok(child) => {
                    if !self.is_sent(child) {
                        pending.push(child);
                    }
                }
                Err(e) => {
                    error!("[{}] Subscription {}: Error subscribing to resource {}: {}", self.cid, rid, ref_rid, e);
                    return;
                }
            }
        }

        // Removed after adding, so a reference moved between properties
        // stays subscribed.
        if let Some(old) = &ev.old_values {
            for k in ev.changed.keys() {
                if let Some(old_rid) = old.values.get(k).and_then(Value::reference) {
                    self.remove_reference(id, old_rid);
                }
            }
        }

        if pending.is_empty() {
            self.send_change_event(&rid, &ev.changed, None);
            return;
        }

        self.queue_events(id, QUEUE_LOADING);
        let remaining = Arc::new(AtomicUsize::new(pending.len()));
        let pending = Arc::new(pending);
        for &child in pending.iter() {
            let remaining = remaining.clone();
            let pending = pending.clone();
            let ev = ev.clone();
            let rid = rid.clone();
            self.on_ready(child, move |st| {
                if st.is_disposed(id) {
                    return;
                }
                if remaining.fetch_sub(1, Ordering::Relaxed) > 1 {
                    return;
                }
                let mut r = Resources::default();
                for &c in pending.iter() {
                    st.populate_resources(c, &mut r);
                }
                st.send_change_event(&rid, &ev.changed, Some(&r));
                for &c in pending.iter() {
                    st.release_rpc_resources(c);
                }
                st.unqueue_events(id, QUEUE_LOADING);
            });
        }
    }

    /// Drop all direct subscriptions and tell the client why.
    fn unsubscribe_direct(&mut self, id: SubId, reason: ResError) {
        let Some(sub) = self.subscriptions.get(&id) else { return };
        if sub.direct == 0 {
            return;
        }
        let direct = sub.direct;
        let rid = sub.rid.clone();
        self.unsubscribe(id, true, direct, true);
        self.send_event(&rid, "unsubscribe", Some(&UnsubscribeEvent { reason: &reason }));
    }

    // ========================================================================
    // Access
    // ========================================================================

    pub(super) fn reaccess(&mut self, id: SubId, throttle: Option<Throttle>) {
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        if sub.state == SubState::Disposed {
            return;
        }
        if sub.queue_flag != 0 {
            sub.reaccess_pending = true;
            return;
        }
        self.handle_reaccess(id, throttle);
    }

    fn handle_reaccess(&mut self, id: SubId, throttle: Option<Throttle>) {
        let Some(sub) = self.subscriptions.get_mut(&id) else { return };
        sub.access = None;
        sub.reaccess_pending = false;
        if sub.direct == 0 {
            return;
        }
        sub.queue_flag |= QUEUE_REACCESS;
        self.load_access(
            id,
            Box::new(move |st, access| {
                if let Err(e) = access.can_get() {
                    st.unsubscribe_direct(id, e);
                }
                st.unqueue_events(id, QUEUE_REACCESS);
            }),
            throttle,
        );
    }

    /// Get the access for a subscription, requesting it if needed.
    /// Concurrent callers share one request.
    fn load_access(&mut self, id: SubId, cb: AccessCallback, throttle: Option<Throttle>) {
        let Some(sub) = self.subscriptions.get_mut(&id).filter(|s| s.state != SubState::Disposed) else {
            return cb(self, disposed_access());
        };
        if let Some(access) = &sub.access {
            let access = access.clone();
            return cb(self, access);
        }
        sub.access_callbacks.push(cb);
        if sub.access_called {
            return;
        }
        sub.access_called = true;

        let request = AccessRequest {
            id,
            name: sub.name.clone(),
            query: sub.query.clone(),
            cid: self.cid.clone(),
            token: self.token.clone(),
            cache: self.cache.clone(),
            conn: self.handle.clone(),
        };
        match throttle {
            Some(t) => {
                let done = t.clone();
                t.add(move || request.send(Some(done)));
            }
            None => request.send(None),
        }
    }

    fn on_access(&mut self, id: SubId, access: Access) {
        let Some(sub) = self.subscriptions.get_mut(&id).filter(|s| s.state != SubState::Disposed) else {
            return;
        };
        let cbs = std::mem::take(&mut sub.access_callbacks);
        sub.access_called = false;
        // Only a result or a denial is worth keeping
        if access.error.as_ref().map_or(true, |e| e.is(CODE_ACCESS_DENIED)) {
            sub.access = Some(access.clone());
        }
        for cb in cbs {
            cb(self, access.clone());
        }
    }

    pub(crate) fn can_get<F>(&mut self, id: SubId, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<(), ResError>) + Send + 'static,
    {
        self.load_access(id, Box::new(move |st, a| cb(st, a.can_get())), None);
    }

    pub(crate) fn can_call<F>(&mut self, id: SubId, action: String, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<(), ResError>) + Send + 'static,
    {
        self.load_access(id, Box::new(move |st, a| cb(st, a.can_call(&action))), None);
    }
}

/// An access request detached from the connection state, so that it can be
/// deferred by a throttle.
struct AccessRequest {
    id: SubId,
    name: String,
    query: String,
    cid: String,
    token: Option<Box<RawValue>>,
    cache: Arc<crate::rescache::Cache>,
    conn: ConnHandle,
}

impl AccessRequest {
    fn send(self, throttle: Option<Throttle>) {
        let AccessRequest {
            id,
            name,
            query,
            cid,
            token,
            cache,
            conn,
        } = self;
        let p = crate::codec::RequestParams {
            token: token.as_deref(),
            query: &query,
            cid: &cid,
            ..Default::default()
        };
        cache.access(&name, p, move |access| {
            conn.enqueue(move |st| st.on_access(id, access));
            if let Some(t) = throttle {
                t.done();
            }
        });
    }
}
