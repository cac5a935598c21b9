//! Per (resource name, normalized query) state machine.
//!
//! ```text
//! Subscribed ──get──▶ Requested ──ok──▶ Model | Collection ──delete──▶ (gone)
//!                         │
//!                         └──error──▶ Error (gone)
//! ```
//!
//! A resource subscription is only ever touched from its event
//! subscription's work queue. The methods here mutate the cached payload and
//! fill in the outgoing event; fan-out is left to the caller.

use super::{ResourceEvent, Subscriber, SubscriberId};
use crate::codec::{self, Collection, Model, Resource, Value};
use crate::reserr::ResError;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::error;

/// Arena index of a resource subscription within its event subscription.
pub(crate) type RsId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum RsState {
    Subscribed,
    Error,
    Requested,
    Collection,
    Model,
}

pub(crate) struct ResourceSubscription {
    pub query: String,
    pub state: RsState,
    pub subs: HashMap<SubscriberId, Arc<dyn Subscriber>>,
    /// Subscribers still waiting for `loaded`.
    pub pending: HashSet<SubscriberId>,
    pub resetting: bool,
    /// Queries that were normalized into this subscription.
    pub links: Vec<String>,
    /// Bumped on every mutating event, reset to 0 on load.
    pub version: u64,
    pub resource: Option<Resource>,
    pub err: Option<ResError>,
}

impl ResourceSubscription {
    pub fn new(query: String) -> Self {
        Self {
            query,
            state: RsState::Subscribed,
            subs: HashMap::new(),
            pending: HashSet::new(),
            resetting: false,
            links: Vec::new(),
            version: 0,
            resource: None,
            err: None,
        }
    }

    pub fn add_subscriber(&mut self, sub: Arc<dyn Subscriber>, pending: bool) {
        let id = sub.id();
        if pending {
            self.pending.insert(id);
        }
        self.subs.insert(id, sub);
    }

    /// Take the subscribers that are still waiting for `loaded`.
    pub fn take_pending(&mut self) -> Vec<Arc<dyn Subscriber>> {
        let pending = std::mem::take(&mut self.pending);
        pending
            .into_iter()
            .filter_map(|id| self.subs.get(&id).cloned())
            .collect()
    }

    /// Store a freshly loaded payload.
    pub fn set_resource(&mut self, resource: Resource) {
        self.version = 0;
        self.state = match resource {
            Resource::Model(_) => RsState::Model,
            Resource::Collection(_) => RsState::Collection,
        };
        self.resource = Some(resource);
    }

    /// Apply a change event. Returns false if the event should be dropped.
    pub fn handle_change(&mut self, name: &str, ev: &mut ResourceEvent) -> ChangeOutcome {
        let Some(Resource::Model(model)) = &self.resource else {
            error!("Error processing event {}.{}: change event on collection", name, ev.event);
            return ChangeOutcome::Dropped;
        };

        let change = match codec::decode_change_event(ev.payload.as_deref()) {
            Ok(change) => change,
            Err(e) => {
                error!("Error processing event {}.{}: {}", name, ev.event, e);
                return ChangeOutcome::Dropped;
            }
        };
        let legacy = change.legacy;
        let mut props = change.values;

        let mut values = model.values.clone();
        props.retain(|k, v| match v {
            Value::Delete => values.remove(k).is_some(),
            v => {
                if values.get(k) == Some(v) {
                    false
                } else {
                    values.insert(k.clone(), v.clone());
                    true
                }
            }
        });

        if props.is_empty() {
            return ChangeOutcome::Dropped;
        }

        ev.changed = props;
        ev.old_values = Some(model.clone());
        ev.update = true;
        self.resource = Some(Resource::Model(Arc::new(Model { values })));
        self.version += 1;
        if legacy {
            ChangeOutcome::AppliedLegacy
        } else {
            ChangeOutcome::Applied
        }
    }

    /// Apply an add event. Returns false if the event should be dropped.
    pub fn handle_add(&mut self, name: &str, ev: &mut ResourceEvent) -> bool {
        let Some(Resource::Collection(collection)) = &self.resource else {
            error!("Error processing event {}.{}: add event on model", name, ev.event);
            return false;
        };

        let add = match codec::decode_add_event(ev.payload.as_deref()) {
            Ok(add) => add,
            Err(e) => {
                error!("Error processing event {}.{}: {}", name, ev.event, e);
                return false;
            }
        };

        let old = &collection.values;
        if add.idx < 0 || add.idx as usize > old.len() {
            error!("Error processing event {}.{}: idx {} is out of bounds", name, ev.event, add.idx);
            return false;
        }
        let idx = add.idx as usize;

        let mut values = Vec::with_capacity(old.len() + 1);
        values.extend_from_slice(&old[..idx]);
        values.push(add.value.clone());
        values.extend_from_slice(&old[idx..]);

        self.resource = Some(Resource::Collection(Arc::new(Collection { values })));
        self.version += 1;
        ev.idx = idx;
        ev.value = Some(add.value);
        ev.update = true;
        true
    }

    /// Apply a remove event. Returns false if the event should be dropped.
    pub fn handle_remove(&mut self, name: &str, ev: &mut ResourceEvent) -> bool {
        let Some(Resource::Collection(collection)) = &self.resource else {
            error!("Error processing event {}.{}: remove event on model", name, ev.event);
            return false;
        };

        let remove = match codec::decode_remove_event(ev.payload.as_deref()) {
            Ok(remove) => remove,
            Err(e) => {
                error!("Error processing event {}.{}: {}", name, ev.event, e);
                return false;
            }
        };

        let old = &collection.values;
        if remove.idx < 0 || remove.idx as usize >= old.len() {
            error!("Error processing event {}.{}: idx {} is out of bounds", name, ev.event, remove.idx);
            return false;
        }
        let idx = remove.idx as usize;

        let mut values = Vec::with_capacity(old.len() - 1);
        values.extend_from_slice(&old[..idx]);
        values.extend_from_slice(&old[idx + 1..]);

        ev.value = Some(old[idx].clone());
        self.resource = Some(Resource::Collection(Arc::new(Collection { values })));
        self.version += 1;
        ev.idx = idx;
        ev.update = true;
        true
    }

    /// Build the change event that turns the cached model into `props`.
    /// Returns `None` when nothing differs.
    pub fn reset_model_event(&self, mut props: HashMap<String, Value>) -> Option<ResourceEvent> {
        let Some(Resource::Model(model)) = &self.resource else {
            return None;
        };

        for k in model.values.keys() {
            props.entry(k.clone()).or_insert(Value::Delete);
        }
        props.retain(|k, v| model.values.get(k) != Some(v));

        if props.is_empty() {
            return None;
        }
        Some(ResourceEvent::new("change", codec::encode_change_event(&props)))
    }

    /// Build the add and remove events that turn the cached collection into
    /// `values`.
    pub fn reset_collection_events(&self, values: &[Value]) -> Vec<ResourceEvent> {
        let Some(Resource::Collection(collection)) = &self.resource else {
            return Vec::new();
        };

        super::lcs::edit_script(&collection.values, values)
            .into_iter()
            .map(|step| match step {
                super::lcs::EditStep::Remove { idx } => {
                    ResourceEvent::new("remove", codec::encode_remove_event(idx))
                }
                super::lcs::EditStep::Add { idx, value } => {
                    ResourceEvent::new("add", codec::encode_add_event(idx, &value))
                }
            })
            .collect()
    }
}

/// Result of applying a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChangeOutcome {
    Dropped,
    Applied,
    /// Applied, but sent in the deprecated encoding.
    AppliedLegacy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::value::RawValue;

    fn raw(s: &str) -> Option<Box<RawValue>> {
        Some(RawValue::from_string(s.to_string()).unwrap())
    }

    fn prim(s: &str) -> Value {
        Value::Primitive(RawValue::from_string(s.to_string()).unwrap())
    }

    fn model_rs(json: &str) -> ResourceSubscription {
        let mut rs = ResourceSubscription::new(String::new());
        let values: HashMap<String, Box<RawValue>> = serde_json::from_str(json).unwrap();
        let values = values
            .into_iter()
            .map(|(k, v)| (k, Value::parse(&v).unwrap()))
            .collect();
        rs.set_resource(Resource::Model(Arc::new(Model { values })));
        rs
    }

    fn collection_rs(items: &[&str]) -> ResourceSubscription {
        let mut rs = ResourceSubscription::new(String::new());
        let values = items.iter().map(|s| prim(s)).collect();
        rs.set_resource(Resource::Collection(Arc::new(Collection { values })));
        rs
    }

    fn collection_values(rs: &ResourceSubscription) -> Vec<Value> {
        match &rs.resource {
            Some(Resource::Collection(c)) => c.values.clone(),
            _ => panic!("not a collection"),
        }
    }

    #[test]
    fn test_change_reduces_to_empty() {
        let mut rs = model_rs(r#"{"x":1}"#);
        let mut ev = ResourceEvent::new("change", raw(r#"{"values":{"x":1}}"#));
        assert_eq!(rs.handle_change("test.model", &mut ev), ChangeOutcome::Dropped);
        assert_eq!(rs.version, 0);

        // Deleting a missing property is also a no-op
        let mut ev = ResourceEvent::new("change", raw(r#"{"values":{"y":{"action":"delete"}}}"#));
        assert_eq!(rs.handle_change("test.model", &mut ev), ChangeOutcome::Dropped);
    }

    #[test]
    fn test_change_computes_effective_diff() {
        let mut rs = model_rs(r#"{"x":1,"y":2,"z":3}"#);
        let old = rs.resource.clone();
        let mut ev = ResourceEvent::new(
            "change",
            raw(r#"{"values":{"x":1,"y":5,"z":{"action":"delete"},"w":true}}"#),
        );
        assert_eq!(rs.handle_change("test.model", &mut ev), ChangeOutcome::Applied);
        assert_eq!(rs.version, 1);
        assert!(ev.update);

        let mut keys: Vec<_> = ev.changed.keys().cloned().collect();
        keys.sort();
        assert_eq!(keys, vec!["w", "y", "z"]);

        // The pre-image is untouched
        assert_eq!(rs.resource.as_ref().map(|_| ()), Some(()));
        let Some(Resource::Model(old)) = old else { panic!() };
        assert_eq!(ev.old_values.as_deref(), Some(&*old));
        assert_eq!(old.values.len(), 3);

        let Some(Resource::Model(new)) = &rs.resource else { panic!() };
        assert_eq!(new.values.len(), 3);
        assert_eq!(new.values["y"], prim("5"));
        assert!(!new.values.contains_key("z"));
    }

    #[test]
    fn test_change_legacy_and_ambiguous() {
        let mut rs = model_rs(r#"{"x":1}"#);
        let mut ev = ResourceEvent::new("change", raw(r#"{"x":2}"#));
        assert_eq!(rs.handle_change("test.model", &mut ev), ChangeOutcome::AppliedLegacy);

        let mut ev = ResourceEvent::new("change", raw(r#"{"values":"delete"}"#));
        assert_eq!(rs.handle_change("test.model", &mut ev), ChangeOutcome::Dropped);
        assert_eq!(rs.version, 1);
    }

    #[test]
    fn test_change_on_collection_dropped() {
        let mut rs = collection_rs(&["1"]);
        let mut ev = ResourceEvent::new("change", raw(r#"{"values":{"x":1}}"#));
        assert_eq!(rs.handle_change("test.collection", &mut ev), ChangeOutcome::Dropped);
    }

    #[test]
    fn test_add_and_remove() {
        let mut rs = collection_rs(&[r#""a""#, r#""c""#]);
        let mut ev = ResourceEvent::new("add", raw(r#"{"idx":1,"value":"b"}"#));
        assert!(rs.handle_add("test.collection", &mut ev));
        assert_eq!(ev.idx, 1);
        assert_eq!(rs.version, 1);
        assert_eq!(collection_values(&rs), vec![prim(r#""a""#), prim(r#""b""#), prim(r#""c""#)]);

        let mut ev = ResourceEvent::new("remove", raw(r#"{"idx":0}"#));
        assert!(rs.handle_remove("test.collection", &mut ev));
        assert_eq!(ev.value, Some(prim(r#""a""#)));
        assert_eq!(rs.version, 2);
        assert_eq!(collection_values(&rs), vec![prim(r#""b""#), prim(r#""c""#)]);
    }

    #[test]
    fn test_add_remove_out_of_bounds() {
        let mut rs = collection_rs(&["1"]);
        for payload in [r#"{"idx":2,"value":1}"#, r#"{"idx":-1,"value":1}"#] {
            let mut ev = ResourceEvent::new("add", raw(payload));
            assert!(!rs.handle_add("test.collection", &mut ev));
        }
        let mut ev = ResourceEvent::new("remove", raw(r#"{"idx":1}"#));
        assert!(!rs.handle_remove("test.collection", &mut ev));
        assert_eq!(rs.version, 0);
        assert_eq!(collection_values(&rs), vec![prim("1")]);
    }

    #[test]
    fn test_reset_model_event() {
        let rs = model_rs(r#"{"a":1,"b":2}"#);
        let props = HashMap::from([("a".to_string(), prim("1")), ("c".to_string(), prim("3"))]);
        let ev = rs.reset_model_event(props).unwrap();
        let payload: serde_json::Value = serde_json::from_str(ev.payload.unwrap().get()).unwrap();
        assert_eq!(payload, serde_json::json!({"values": {"b": {"action": "delete"}, "c": 3}}));

        let same = HashMap::from([("a".to_string(), prim("1")), ("b".to_string(), prim("2"))]);
        assert!(rs.reset_model_event(same).is_none());
    }

    #[test]
    fn test_reset_collection_events() {
        let rs = collection_rs(&[r#""a""#, r#""b""#, r#""c""#, r#""d""#]);
        let target = [r#""a""#, r#""c""#, r#""d""#, r#""e""#].map(prim);
        let events = rs.reset_collection_events(&target);
        let summary: Vec<(String, String)> = events
            .iter()
            .map(|e| (e.event.clone(), e.payload.as_ref().unwrap().get().to_string()))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("remove".to_string(), r#"{"idx":1}"#.to_string()),
                ("add".to_string(), r#"{"idx":3,"value":"e"}"#.to_string()),
            ]
        );
    }
}
