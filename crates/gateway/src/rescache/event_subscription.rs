//! Per resource name state: the bus event subscription, the resource
//! subscriptions for every query, and the serial work queue touching them.
//!
//! ## Work queue
//!
//! ```text
//! enqueue ──▶ jobs ──┐
//!                    ├──▶ worker pool ──▶ job(&mut EventState)
//! enqueue_unlock ──▶ locks.jobs (drained first)
//! ```
//!
//! At most one worker processes a given event subscription at a time. While
//! a query event lock is held, only unlock jobs run; regular jobs wait until
//! every pending unlock job has completed.
//!
//! Lock order: the cache map and `state` are each taken before `queue`, and
//! `queue` before the unsubscribe timer queue. `state` is never taken while
//! `queue` is held.

use super::resource_subscription::{ChangeOutcome, ResourceSubscription, RsId, RsState};
use super::{Deprecated, LoadedResource, ResourceEvent, ResourceHandle, Shared, Subscriber, SubscriberId};
use crate::codec::{self, EventQueryResult, Resource};
use crate::reserr::{ResError, CODE_NOT_FOUND};
use crate::rescache::Throttle;
use bytes::Bytes;
use nats_client::{BusError, BusSubscription};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, trace};

pub(crate) type Job = Box<dyn FnOnce(&Arc<EventSubscription>, &mut EventState) + Send>;

struct Locks {
    pending: usize,
    jobs: VecDeque<Job>,
}

struct WorkQueue {
    jobs: VecDeque<Job>,
    locks: Option<Locks>,
    scheduled: bool,
    /// Subscribers plus in-flight requests referring to this name.
    count: i64,
    disposed: bool,
}

impl WorkQueue {
    fn next_job(&mut self) -> Option<Job> {
        if let Some(locks) = &mut self.locks {
            if let Some(job) = locks.jobs.pop_front() {
                locks.pending = locks.pending.saturating_sub(1);
                return Some(job);
            }
            if locks.pending > 0 {
                return None;
            }
            self.locks = None;
        }
        self.jobs.pop_front()
    }
}

/// Resource subscriptions of one resource name.
pub(crate) struct EventState {
    base: Option<RsId>,
    queries: HashMap<String, RsId>,
    links: HashMap<String, RsId>,
    resources: HashMap<RsId, ResourceSubscription>,
    next_id: RsId,
}

pub(crate) struct EventSubscription {
    pub name: String,
    shared: Arc<Shared>,
    queue: Mutex<WorkQueue>,
    state: Mutex<EventState>,
    bus_sub: Mutex<Option<BusSubscription>>,
}

impl EventSubscription {
    pub fn new(name: String, shared: Arc<Shared>) -> Self {
        Self {
            name,
            shared,
            queue: Mutex::new(WorkQueue {
                jobs: VecDeque::new(),
                locks: None,
                scheduled: false,
                count: 1,
                disposed: false,
            }),
            state: Mutex::new(EventState {
                base: None,
                queries: HashMap::new(),
                links: HashMap::new(),
                resources: HashMap::new(),
                next_id: 0,
            }),
            bus_sub: Mutex::new(None),
        }
    }

    fn lock_queue(&self) -> MutexGuard<'_, WorkQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_state(&self) -> MutexGuard<'_, EventState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_bus_subscription(&self) -> bool {
        self.bus_sub
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    pub fn set_bus_subscription(&self, sub: BusSubscription) {
        *self.bus_sub.lock().unwrap_or_else(PoisonError::into_inner) = Some(sub);
    }

    // ========================================================================
    // Work queue
    // ========================================================================

    /// Queue a job. It runs after every previously queued job.
    pub fn enqueue<F>(self: &Arc<Self>, job: F)
    where
        F: FnOnce(&Arc<EventSubscription>, &mut EventState) + Send + 'static,
    {
        let mut q = self.lock_queue();
        if q.disposed {
            return;
        }
        q.jobs.push_back(Box::new(job));
        if !q.scheduled && q.locks.is_none() {
            q.scheduled = true;
            drop(q);
            self.schedule();
        }
    }

    /// Queue a job that releases one pending query event lock.
    fn enqueue_unlock<F>(self: &Arc<Self>, job: F)
    where
        F: FnOnce(&Arc<EventSubscription>, &mut EventState) + Send + 'static,
    {
        let mut q = self.lock_queue();
        if q.disposed {
            return;
        }
        match &mut q.locks {
            Some(locks) => locks.jobs.push_back(Box::new(job)),
            None => q.jobs.push_back(Box::new(job)),
        }
        if !q.scheduled {
            q.scheduled = true;
            drop(q);
            self.schedule();
        }
    }

    /// Hold back regular jobs until `n` unlock jobs have run.
    fn lock_events(&self, n: usize) {
        self.lock_queue().locks = Some(Locks {
            pending: n,
            jobs: VecDeque::new(),
        });
    }

    fn schedule(self: &Arc<Self>) {
        if self.shared.work_tx.send(self.clone()).is_err() {
            debug!("Work queue closed, dropping jobs for {}", self.name);
        }
    }

    /// Run queued jobs until the queue is empty or blocked by a lock.
    /// Called by exactly one worker at a time.
    pub fn process_queue(self: &Arc<Self>) {
        loop {
            let job = {
                let mut q = self.lock_queue();
                match q.next_job() {
                    Some(job) => job,
                    None => {
                        q.scheduled = false;
                        return;
                    }
                }
            };
            let mut state = self.lock_state();
            job(self, &mut state);
        }
    }

    // ========================================================================
    // Reference counting
    // ========================================================================

    /// Must be called with the cache map locked.
    pub fn add_count(&self) {
        let mut q = self.lock_queue();
        if q.count == 0 {
            self.shared.unsub_queue.remove(&self.name);
        }
        q.count += 1;
    }

    pub fn remove_count(&self, n: usize) {
        let mut q = self.lock_queue();
        q.count -= n as i64;
        if q.count == 0 && n != 0 {
            self.shared.unsub_queue.add(self.name.clone());
        }
    }

    /// Tear down if nothing refers to this name anymore. Must be called with
    /// the cache map locked. Returns false if the subscription is still in use.
    pub fn try_dispose(&self) -> bool {
        let mut q = self.lock_queue();
        if q.count > 0 {
            return false;
        }
        q.disposed = true;
        q.jobs.clear();
        q.locks = None;
        drop(q);
        if let Some(sub) = self.bus_sub.lock().unwrap_or_else(PoisonError::into_inner).take() {
            sub.unsubscribe();
        }
        true
    }

    pub fn count(&self) -> i64 {
        self.lock_queue().count
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Add a subscriber, requesting the resource if it is not yet loaded.
    pub fn add_subscriber(self: &Arc<Self>, sub: Arc<dyn Subscriber>, throttle: Option<Throttle>) {
        self.enqueue(move |es, st| st.add_subscriber(es, sub, throttle));
    }

    /// Handle a message on `event.<name>.*`.
    pub fn enqueue_event(self: &Arc<Self>, subject: String, payload: Bytes) {
        self.enqueue(move |es, st| {
            // "event." + name + "."
            let prefix_len = es.name.len() + 7;
            let Some(event) = subject.get(prefix_len..).filter(|e| !e.is_empty()) else {
                error!("Malformed event subject: {}", subject);
                return;
            };
            trace!("Event {}.{}", es.name, event);

            if event == "query" {
                es.handle_query_event(st, &payload);
                return;
            }

            // Plain events only apply to the queryless resource
            let Some(base) = st.base else { return };
            if !matches!(st.resources.get(&base), Some(rs) if rs.query.is_empty()) {
                return;
            }

            let data = match codec::decode_event(&payload) {
                Ok(data) => data,
                Err(e) => {
                    error!("Error processing event {}.{}: {}", es.name, event, e);
                    return;
                }
            };
            st.handle_event(es, base, ResourceEvent::new(event, data));
        });
    }

    /// Re-fetch every loaded resource and emit the difference as events.
    pub fn handle_reset_resource(self: &Arc<Self>, throttle: Option<Throttle>) {
        self.enqueue(move |es, st| {
            for id in st.all_ids() {
                st.reset_resource(es, id, throttle.clone());
            }
        });
    }

    /// Ask every subscriber to re-validate its access.
    pub fn handle_reset_access(self: &Arc<Self>, throttle: Option<Throttle>) {
        self.enqueue(move |_, st| {
            for id in st.all_ids() {
                if let Some(rs) = st.resources.get(&id) {
                    for sub in rs.subs.values() {
                        sub.reaccess(throttle.clone());
                    }
                }
            }
        });
    }

    fn handle_query_event(self: &Arc<Self>, st: &mut EventState, payload: &[u8]) {
        if st.queries.is_empty() {
            return;
        }

        let qe = match codec::decode_query_event(payload) {
            Ok(qe) if !qe.subject.is_empty() => qe,
            Ok(_) => {
                error!("Error processing query event for {}: missing subject", self.name);
                return;
            }
            Err(e) => {
                error!("Error processing query event for {}: {}", self.name, e);
                return;
            }
        };

        self.lock_events(st.queries.len());
        for (query, &id) in &st.queries {
            let loaded = st.resources.get(&id).is_some_and(|rs| rs.state > RsState::Requested);
            if !loaded {
                self.enqueue_unlock(|_, _| {});
                continue;
            }
            let es = self.clone();
            self.shared.bus.send_request(
                &qe.subject,
                codec::create_event_query_request(query),
                Box::new(move |res| {
                    es.enqueue_unlock(move |es, st| st.handle_query_response(es, id, res));
                }),
            );
        }
    }
}

impl EventState {
    fn all_ids(&self) -> Vec<RsId> {
        let mut ids: Vec<RsId> = Vec::with_capacity(self.queries.len() + 1);
        if let Some(base) = self.base {
            if self.resources.get(&base).is_some_and(|rs| rs.query.is_empty()) {
                ids.push(base);
            }
        }
        ids.extend(self.queries.values().copied());
        ids
    }

    /// Look up the resource subscription serving `query`, creating it if
    /// needed. Normalized links are followed.
    fn get_or_create(&mut self, query: &str) -> RsId {
        if query.is_empty() {
            if let Some(id) = self.base {
                return id;
            }
        } else if let Some(&id) = self.queries.get(query).or_else(|| self.links.get(query)) {
            return id;
        }

        let id = self.next_id;
        self.next_id += 1;
        self.resources.insert(id, ResourceSubscription::new(query.to_string()));
        if query.is_empty() {
            self.base = Some(id);
        } else {
            self.queries.insert(query.to_string(), id);
        }
        id
    }

    /// Remove a resource subscription along with every link pointing at it.
    fn unregister(&mut self, id: RsId) -> Option<ResourceSubscription> {
        let rs = self.resources.remove(&id)?;
        if rs.query.is_empty() {
            self.base = None;
        } else {
            self.queries.remove(&rs.query);
        }
        for link in &rs.links {
            if link.is_empty() {
                self.base = None;
            } else {
                self.links.remove(link);
            }
        }
        Some(rs)
    }

    fn add_subscriber(&mut self, es: &Arc<EventSubscription>, sub: Arc<dyn Subscriber>, throttle: Option<Throttle>) {
        let id = self.get_or_create(sub.resource_query());
        let Some(rs) = self.resources.get_mut(&id) else { return };

        match rs.state {
            RsState::Subscribed => {
                rs.add_subscriber(sub, true);
                rs.state = RsState::Requested;
                let query = rs.query.clone();
                es.send_get(id, &query, throttle, |es, st, id, res| st.process_get_response(es, id, res));
            }
            RsState::Requested => rs.add_subscriber(sub, true),
            RsState::Error => {
                let err = rs.err.clone().unwrap_or_else(ResError::internal_error);
                es.remove_count(1);
                sub.loaded(Err(err));
            }
            RsState::Model | RsState::Collection => {
                let Some(resource) = rs.resource.clone() else { return };
                let version = rs.version;
                rs.add_subscriber(sub.clone(), false);
                sub.loaded(Ok(LoadedResource {
                    handle: ResourceHandle { es: es.clone(), id },
                    resource,
                    version,
                }));
            }
        }
    }

    fn process_get_response(&mut self, es: &Arc<EventSubscription>, id: RsId, res: Result<Bytes, BusError>) {
        let result = res.map_err(ResError::from).and_then(|p| codec::decode_get_response(&p));
        let Some(rs) = self.resources.get_mut(&id) else { return };

        let r = match result {
            Ok(r) => r,
            // Already served by a normalized query's response
            Err(_) if rs.state > RsState::Requested => return,
            Err(err) => {
                debug!("Get {}?{} failed: {}", es.name, rs.query, err);
                rs.state = RsState::Error;
                rs.err = Some(err.clone());
                let subs = rs.take_pending();
                let total = rs.subs.len();
                self.unregister(id);
                es.remove_count(total);
                for sub in subs {
                    sub.loaded(Err(err.clone()));
                }
                return;
            }
        };

        let (nid, subs) = if r.query != rs.query {
            // The service normalized the query; move subscribers to the
            // subscription of the normalized query and link the original.
            let subs = rs.take_pending();
            let Some(old) = self.resources.remove(&id) else { return };
            if old.query.is_empty() {
                self.base = None;
            } else {
                self.queries.remove(&old.query);
            }
            for link in &old.links {
                if !link.is_empty() {
                    self.links.remove(link);
                }
            }

            let nid = self.get_or_create(&r.query);
            let mut links = old.links;
            links.push(old.query);
            for link in &links {
                if link.is_empty() {
                    self.base = Some(nid);
                } else {
                    self.links.insert(link.clone(), nid);
                }
            }
            let Some(nrs) = self.resources.get_mut(&nid) else { return };
            nrs.links.extend(links);
            for (sub_id, sub) in old.subs {
                nrs.subs.insert(sub_id, sub);
            }
            (nid, subs)
        } else {
            (id, rs.take_pending())
        };

        let Some(nrs) = self.resources.get_mut(&nid) else { return };
        if nrs.state <= RsState::Requested {
            nrs.set_resource(r.resource);
        }
        let Some(resource) = nrs.resource.clone() else { return };
        let loaded = LoadedResource {
            handle: ResourceHandle { es: es.clone(), id: nid },
            resource,
            version: nrs.version,
        };
        // Subscribers waiting on the normalized subscription's own get are
        // served the same snapshot.
        let mut subs = subs;
        subs.extend(nrs.take_pending());
        for sub in subs {
            sub.loaded(Ok(loaded.clone()));
        }
    }

    pub(super) fn unsubscribe(&mut self, es: &Arc<EventSubscription>, id: RsId, sub_id: SubscriberId) {
        let id = if self.resources.get(&id).is_some_and(|rs| rs.subs.contains_key(&sub_id)) {
            id
        } else {
            match self.resources.iter().find(|(_, rs)| rs.subs.contains_key(&sub_id)) {
                Some((&id, _)) => id,
                None => return,
            }
        };
        let Some(rs) = self.resources.get_mut(&id) else { return };
        rs.subs.remove(&sub_id);
        rs.pending.remove(&sub_id);
        if !rs.query.is_empty() && rs.subs.is_empty() {
            self.unregister(id);
        }
        es.remove_count(1);
    }

    /// Apply an event to a resource subscription and fan it out.
    fn handle_event(&mut self, es: &Arc<EventSubscription>, id: RsId, mut ev: ResourceEvent) {
        let Some(rs) = self.resources.get_mut(&id) else { return };
        // Only reaccess passes before the resource is loaded
        if rs.state <= RsState::Requested && ev.event != "reaccess" {
            return;
        }

        ev.version = rs.version;
        let kind = ev.event.clone();
        match kind.as_str() {
            "change" => {
                if rs.resetting {
                    return;
                }
                match rs.handle_change(&es.name, &mut ev) {
                    ChangeOutcome::Dropped => return,
                    ChangeOutcome::AppliedLegacy => es.shared.deprecated(&es.name, Deprecated::ModelChangeEvent),
                    ChangeOutcome::Applied => {}
                }
            }
            "add" => {
                if rs.resetting || !rs.handle_add(&es.name, &mut ev) {
                    return;
                }
            }
            "remove" => {
                if rs.resetting || !rs.handle_remove(&es.name, &mut ev) {
                    return;
                }
            }
            "delete" => {
                if !rs.resetting {
                    self.handle_delete(es, id, ev);
                }
                return;
            }
            _ => {}
        }

        ev.resource = rs.resource.clone();
        let ev = Arc::new(ev);
        for sub in rs.subs.values() {
            sub.event(ev.clone());
        }
    }

    fn handle_delete(&mut self, es: &Arc<EventSubscription>, id: RsId, ev: ResourceEvent) {
        let Some(rs) = self.unregister(id) else { return };
        es.remove_count(rs.subs.len());
        let ev = Arc::new(ev);
        for sub in rs.subs.values() {
            sub.event(ev.clone());
        }
    }

    fn reset_resource(&mut self, es: &Arc<EventSubscription>, id: RsId, throttle: Option<Throttle>) {
        let Some(rs) = self.resources.get_mut(&id) else { return };
        if rs.resetting || rs.state <= RsState::Requested {
            return;
        }
        rs.resetting = true;
        let query = rs.query.clone();
        es.send_get(id, &query, throttle, |es, st, id, res| {
            if let Some(rs) = st.resources.get_mut(&id) {
                rs.resetting = false;
            }
            st.process_reset_get_response(es, id, res);
        });
    }

    fn process_reset_get_response(&mut self, es: &Arc<EventSubscription>, id: RsId, res: Result<Bytes, BusError>) {
        let Some(rs) = self.resources.get(&id) else { return };

        let result = res.map_err(ResError::from).and_then(|p| codec::decode_get_response(&p));
        let r = match result {
            Ok(r) => r,
            Err(err) if err.is(CODE_NOT_FOUND) => {
                self.handle_event(es, id, ResourceEvent::new("delete", None));
                return;
            }
            Err(err) => {
                error!("Subscription {}: Reset get error - {}", es.name, err);
                return;
            }
        };

        let events = match (&rs.resource, r.resource) {
            (Some(Resource::Model(_)), Resource::Model(m)) => {
                rs.reset_model_event(m.values.clone()).into_iter().collect()
            }
            (Some(Resource::Collection(_)), Resource::Collection(c)) => rs.reset_collection_events(&c.values),
            (Some(_), _) => {
                error!("Subscription {}: Reset get error - mismatching resource type", es.name);
                return;
            }
            (None, _) => return,
        };
        for ev in events {
            self.handle_event(es, id, ev);
        }
    }

    fn handle_query_response(&mut self, es: &Arc<EventSubscription>, id: RsId, res: Result<Bytes, BusError>) {
        let Ok(payload) = res else { return };
        let Some(rs) = self.resources.get(&id) else { return };

        let events: Vec<ResourceEvent> = match codec::decode_event_query_response(&payload) {
            Err(err) if err.is(CODE_NOT_FOUND) => vec![ResourceEvent::new("delete", None)],
            Err(err) => {
                error!("Error processing query event for {}?{}: {}", es.name, rs.query, err);
                return;
            }
            Ok(EventQueryResult::Events(events)) => events
                .into_iter()
                .map(|e| ResourceEvent::new(&e.event, e.data))
                .collect(),
            Ok(EventQueryResult::Model(values)) => {
                if rs.state != RsState::Model {
                    error!("Error processing query event for {}?{}: model response on collection", es.name, rs.query);
                    return;
                }
                rs.reset_model_event(values).into_iter().collect()
            }
            Ok(EventQueryResult::Collection(values)) => {
                if rs.state != RsState::Collection {
                    error!("Error processing query event for {}?{}: collection response on model", es.name, rs.query);
                    return;
                }
                rs.reset_collection_events(&values)
            }
            Ok(EventQueryResult::Empty) => return,
        };
        for ev in events {
            self.handle_event(es, id, ev);
        }
    }
}

impl EventSubscription {
    /// Send a get request for one of this name's resource subscriptions and
    /// process the response on the work queue.
    fn send_get<F>(self: &Arc<Self>, id: RsId, query: &str, throttle: Option<Throttle>, on_response: F)
    where
        F: FnOnce(&Arc<EventSubscription>, &mut EventState, RsId, Result<Bytes, BusError>) + Send + 'static,
    {
        let subject = format!("get.{}", self.name);
        let payload = codec::create_get_request(query);
        let es = self.clone();
        let done = throttle.clone();
        let send = move || {
            let bus = es.shared.bus.clone();
            bus.send_request(
                &subject,
                payload,
                Box::new(move |res| {
                    es.enqueue(move |es, st| on_response(es, st, id, res));
                    if let Some(t) = done {
                        t.done();
                    }
                }),
            );
        };
        match throttle {
            Some(t) => t.add(send),
            None => send(),
        }
    }
}
