//! Client requests on a connection.
//!
//! Each request completes through a callback run on the connection task,
//! possibly after waiting for access responses and resources to load.

use super::subscription::parse_rid;
use super::{ConnState, SubId};
use crate::codec::CallResult;
use crate::protocol::{CallPayloadResult, CallResourceResult, Resources, VERSION_CALL_RESOURCE_RESPONSE};
use crate::rescache::Access;
use crate::reserr::ResError;
use serde::Serialize;
use serde_json::value::RawValue;

/// Response to a call, auth or new request, as sent to the client.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub(crate) enum CallResponse {
    /// Result as returned by the service, for clients before 1.2.0.
    Raw(Box<RawValue>),
    Payload(CallPayloadResult),
    Resource(CallResourceResult),
}

fn parse_version(protocol: &str) -> Result<u32, ResError> {
    let parts: Vec<&str> = protocol.split('.').collect();
    if parts.len() != 3 {
        return Err(ResError::invalid_params());
    }
    let mut v = 0;
    for part in parts {
        match part.parse::<u32>() {
            Ok(p) if p < 1000 => v = v * 1000 + p,
            _ => return Err(ResError::invalid_params()),
        }
    }
    Ok(v)
}

impl ConnState {
    /// Negotiate the protocol version. An empty version keeps the current
    /// one.
    pub(crate) fn set_version(&mut self, protocol: &str) -> Result<&'static str, ResError> {
        if protocol.is_empty() {
            return Ok(crate::protocol::PROTOCOL_VERSION);
        }
        let v = parse_version(protocol)?;
        if !(1_000_000..2_000_000).contains(&v) {
            return Err(ResError::unsupported_protocol());
        }
        self.protocol = v;
        Ok(crate::protocol::PROTOCOL_VERSION)
    }

    /// Get a resource without keeping the subscription.
    pub(crate) fn get_resource<F>(&mut self, rid: &str, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<Resources, ResError>) + Send + 'static,
    {
        let id = match self.subscribe(rid, true, None) {
            Ok(id) => id,
            Err(e) => return cb(self, Err(e)),
        };
        self.can_get(id, move |st, res| {
            if let Err(e) = res {
                cb(st, Err(e));
                st.unsubscribe(id, true, 1, true);
                return;
            }
            st.on_ready(id, move |st| {
                if let Some(err) = st.subscription(id).and_then(|s| s.error()) {
                    cb(st, Err(err));
                    st.unsubscribe(id, true, 1, true);
                    return;
                }
                let r = st.get_rpc_resources(id);
                cb(st, Ok(r));
                st.release_rpc_resources(id);
                st.unsubscribe(id, true, 1, true);
            });
        });
    }

    /// Subscribe to a resource, responding with everything the client has
    /// not yet received.
    pub(crate) fn subscribe_resource<F>(&mut self, rid: &str, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<Resources, ResError>) + Send + 'static,
    {
        let id = match self.subscribe(rid, true, None) {
            Ok(id) => id,
            Err(e) => return cb(self, Err(e)),
        };
        self.can_get(id, move |st, res| {
            if let Err(e) = res {
                cb(st, Err(e));
                st.unsubscribe(id, true, 1, true);
                return;
            }
            st.on_ready(id, move |st| {
                if let Some(err) = st.subscription(id).and_then(|s| s.error()) {
                    cb(st, Err(err));
                    st.unsubscribe(id, true, 1, true);
                    return;
                }
                let r = st.get_rpc_resources(id);
                cb(st, Ok(r));
                st.release_rpc_resources(id);
            });
        });
    }

    pub(crate) fn unsubscribe_resource(&mut self, rid: &str, count: usize) -> Result<(), ResError> {
        if self.unsubscribe_by_rid(rid, count) {
            Ok(())
        } else {
            Err(ResError::no_subscription())
        }
    }

    pub(crate) fn call_resource<F>(&mut self, rid: &str, action: &str, params: Option<Box<RawValue>>, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<CallResponse, ResError>) + Send + 'static,
    {
        self.call(rid, action, params, move |st, res| st.handle_call_auth_response(res, cb));
    }

    pub(crate) fn auth_resource<F>(&mut self, rid: &str, action: &str, params: Option<Box<RawValue>>, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<CallResponse, ResError>) + Send + 'static,
    {
        self.auth(rid, action, params, false, move |st, res| st.handle_call_auth_response(res, cb));
    }

    /// Deprecated `new` request: a call to `new` that must respond with a
    /// resource.
    pub(crate) fn new_resource<F>(&mut self, rid: &str, params: Option<Box<RawValue>>, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<CallResponse, ResError>) + Send + 'static,
    {
        self.call(rid, "new", params, move |st, res| match res {
            Err(e) => cb(st, Err(e)),
            Ok(CallResult::Payload(_)) => cb(st, Err(ResError::internal("non-resource response on new request"))),
            Ok(CallResult::Resource(rid)) => st.handle_resource_result(rid, cb),
        });
    }

    fn handle_call_auth_response<F>(&mut self, res: Result<CallResult, ResError>, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<CallResponse, ResError>) + Send + 'static,
    {
        let result = match res {
            Ok(result) => result,
            Err(e) => return cb(self, Err(e)),
        };

        if self.protocol < VERSION_CALL_RESOURCE_RESPONSE {
            let response = match result {
                CallResult::Resource(rid) => CallResponse::Resource(CallResourceResult {
                    rid,
                    resources: Resources::default(),
                }),
                CallResult::Payload(raw) => CallResponse::Raw(raw),
            };
            return cb(self, Ok(response));
        }

        match result {
            CallResult::Payload(payload) => cb(self, Ok(CallResponse::Payload(CallPayloadResult { payload }))),
            CallResult::Resource(rid) => self.handle_resource_result(rid, cb),
        }
    }

    /// Subscribe to the resource a call responded with. Access errors are
    /// reported as the resource's error, as the call itself succeeded.
    fn handle_resource_result<F>(&mut self, rid: String, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<CallResponse, ResError>) + Send + 'static,
    {
        let id = match self.subscribe(&rid, true, None) {
            Ok(id) => id,
            Err(e) => return cb(self, Err(e)),
        };
        self.can_get(id, move |st, res| {
            if let Err(e) = res {
                let mut resources = Resources::default();
                resources.errors.insert(rid.clone(), e);
                cb(st, Ok(CallResponse::Resource(CallResourceResult { rid, resources })));
                st.unsubscribe(id, true, 1, true);
                return;
            }
            st.on_ready(id, move |st| {
                let resources = st.get_rpc_resources(id);
                cb(st, Ok(CallResponse::Resource(CallResourceResult { rid, resources })));
                st.release_rpc_resources(id);
            });
        });
    }

    // ========================================================================
    // Service requests
    // ========================================================================

    /// Request access for a resource outside of any subscription.
    fn access<F>(&self, rid: &str, is_http: bool, cb: F)
    where
        F: FnOnce(&mut ConnState, Access) + Send + 'static,
    {
        let expanded = self.expand_cid(rid);
        let (name, query) = parse_rid(&expanded);
        let conn = self.handle.clone();
        self.cache
            .access(name, self.params(query, None, is_http), move |access| {
                conn.enqueue(move |st| cb(st, access));
            });
    }

    /// Check call access, then call the method. An existing subscription's
    /// access is reused.
    fn call<F>(&mut self, rid: &str, action: &str, params: Option<Box<RawValue>>, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<CallResult, ResError>) + Send + 'static,
    {
        let target = rid.to_string();
        let method = action.to_string();
        let then = move |st: &mut ConnState, res: Result<(), ResError>| match res {
            Err(e) => cb(st, Err(e)),
            Ok(()) => st.send_call(&target, &method, params, false, cb),
        };
        match self.subs.get(rid).copied() {
            Some(id) => self.can_call(id, action.to_string(), then),
            None => {
                let action = action.to_string();
                self.access(rid, false, move |st, a| then(st, a.can_call(&action)));
            }
        }
    }

    fn send_call<F>(&self, rid: &str, action: &str, params: Option<Box<RawValue>>, is_http: bool, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<CallResult, ResError>) + Send + 'static,
    {
        let expanded = self.expand_cid(rid);
        let (name, query) = parse_rid(&expanded);
        let conn = self.handle.clone();
        let p = self.params(query, params.as_deref(), is_http);
        self.cache.call(name, action, p, move |res| {
            conn.enqueue(move |st| cb(st, res));
        });
    }

    fn auth<F>(&self, rid: &str, action: &str, params: Option<Box<RawValue>>, is_http: bool, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<CallResult, ResError>) + Send + 'static,
    {
        let expanded = self.expand_cid(rid);
        let (name, query) = parse_rid(&expanded);
        let conn = self.handle.clone();
        let p = self.params(query, params.as_deref(), is_http);
        self.cache.auth(name, action, p, &self.http, move |res| {
            conn.enqueue(move |st| cb(st, res));
        });
    }

    // ========================================================================
    // HTTP
    // ========================================================================

    /// Subscribe to a resource for an HTTP GET, with access requested as
    /// HTTP. The callback gets the ready subscription; it is released once
    /// the callback returns.
    pub(crate) fn http_get<F>(&mut self, rid: &str, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<SubId, ResError>) + Send + 'static,
    {
        let id = match self.subscribe(rid, true, None) {
            Ok(id) => id,
            Err(e) => return cb(self, Err(e)),
        };
        self.access(rid, true, move |st, access| {
            if let Err(e) = access.can_get() {
                cb(st, Err(e));
                st.unsubscribe(id, true, 1, true);
                return;
            }
            st.on_ready(id, move |st| {
                if let Some(err) = st.subscription(id).and_then(|s| s.error()) {
                    cb(st, Err(err));
                    st.unsubscribe(id, true, 1, true);
                    return;
                }
                cb(st, Ok(id));
                st.release_rpc_resources(id);
                st.unsubscribe(id, true, 1, true);
            });
        });
    }

    /// Call a method for an HTTP POST, with access requested as HTTP.
    pub(crate) fn http_call<F>(&mut self, rid: &str, action: &str, params: Option<Box<RawValue>>, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<CallResult, ResError>) + Send + 'static,
    {
        let target = rid.to_string();
        let method = action.to_string();
        self.access(rid, true, move |st, access| {
            if let Err(e) = access.can_call(&method) {
                return cb(st, Err(e));
            }
            st.send_call(&target, &method, params, true, cb);
        });
    }

    /// Auth request sent while a client connection is being established.
    /// The result is discarded; services respond by setting a token.
    pub(crate) fn header_auth<F>(&mut self, rid: &str, action: &str, cb: F)
    where
        F: FnOnce(&mut ConnState, Result<(), ResError>) + Send + 'static,
    {
        self.auth(rid, action, None, true, move |st, res| cb(st, res.map(|_| ())));
    }
}
