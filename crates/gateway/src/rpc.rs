//! Client request dispatch.
//!
//! Decodes a request frame and routes it to the connection:
//!
//! ```text
//! {"method":"<action>.<rid>[.<method>]","params":...,"id":n}
//!     version            → protocol negotiation (no RID)
//!     get / subscribe    → resource snapshots
//!     unsubscribe        → drop direct subscriptions
//!     call / auth        → service methods
//!     new                → deprecated call to "new"
//! ```

use crate::codec::{is_valid_rid, is_valid_rid_part};
use crate::conn::ConnState;
use crate::protocol::{Request, UnsubscribeRequest, VersionRequest, VersionResult};
use crate::reserr::ResError;
use metrics::counter;
use serde::Serialize;
use tracing::{debug, trace};

/// Handle one client request frame on the connection task.
pub fn handle_request(conn: &mut ConnState, data: &[u8]) {
    trace!("[{}] --> {}", conn.cid(), String::from_utf8_lossy(data));

    let mut req: Request = match serde_json::from_slice(data) {
        Ok(req) => req,
        Err(e) => {
            debug!("[{}] Error decoding request: {}", conn.cid(), e);
            return;
        }
    };
    if req.id.is_none() {
        debug!("[{}] Error handling request: request is missing id property", conn.cid());
        return;
    }

    let Some((action, rest)) = req.method.split_once('.') else {
        if req.method == "version" {
            counter!("gateway_ws_requests_total", "method" => "version").increment(1);
            handle_version(conn, &req);
        } else {
            conn.reply(req.error(&ResError::invalid_request()));
        }
        return;
    };
    let action = action.to_string();

    let (rid, method) = if action == "call" || action == "auth" {
        match rest.rsplit_once('.') {
            Some((rid, method)) if is_valid_rid_part(method) => (rid.to_string(), method.to_string()),
            _ => return conn.reply(req.error(&ResError::invalid_request())),
        }
    } else {
        (rest.to_string(), String::new())
    };
    if !is_valid_rid(&rid, true) {
        return conn.reply(req.error(&ResError::invalid_request()));
    }

    let params = req.params.take();
    match action.as_str() {
        "get" => conn.get_resource(&rid, move |st, res| reply(st, &req, res)),
        "subscribe" => conn.subscribe_resource(&rid, move |st, res| reply(st, &req, res)),
        "unsubscribe" => {
            let count = match unsubscribe_count(params.as_deref()) {
                Ok(count) => count,
                Err(e) => return conn.reply(req.error(&e)),
            };
            match conn.unsubscribe_resource(&rid, count) {
                Ok(()) => conn.reply(req.success::<()>(None)),
                Err(e) => conn.reply(req.error(&e)),
            }
        }
        "call" => conn.call_resource(&rid, &method, params, move |st, res| reply(st, &req, res)),
        "auth" => conn.auth_resource(&rid, &method, params, move |st, res| reply(st, &req, res)),
        "new" => conn.new_resource(&rid, params, move |st, res| reply(st, &req, res)),
        _ => return conn.reply(req.error(&ResError::invalid_request())),
    }
    counter!("gateway_ws_requests_total", "method" => action).increment(1);
}

fn reply<T: Serialize>(conn: &mut ConnState, req: &Request, res: Result<T, ResError>) {
    let frame = match res {
        Ok(result) => req.success(Some(&result)),
        Err(e) => req.error(&e),
    };
    conn.reply(frame);
}

fn handle_version(conn: &mut ConnState, req: &Request) {
    let vr = match req.params.as_deref().map(|p| p.get()) {
        None | Some("null") => VersionRequest::default(),
        Some(p) => match serde_json::from_str::<VersionRequest>(p) {
            Ok(vr) => vr,
            Err(_) => return conn.reply(req.error(&ResError::invalid_params())),
        },
    };
    let res = conn.set_version(&vr.protocol).map(|protocol| VersionResult { protocol });
    reply(conn, req, res);
}

fn unsubscribe_count(params: Option<&serde_json::value::RawValue>) -> Result<usize, ResError> {
    let Some(p) = params.filter(|p| p.get() != "null") else {
        return Ok(1);
    };
    let r: UnsubscribeRequest = serde_json::from_str(p.get()).map_err(|_| ResError::invalid_params())?;
    match r.count {
        None => Ok(1),
        Some(n) if n > 0 => Ok(n as usize),
        Some(_) => Err(ResError::invalid_params()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::HttpRequestInfo;
    use crate::conn::{ConnConfig, ConnHandle, ConnParams, ConnRegistry};
    use crate::protocol::{VERSION_LATEST, VERSION_LEGACY};
    use crate::rescache::{Cache, CacheConfig};
    use crate::test_util::{MockBus, MockRequest};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        bus: Arc<MockBus>,
        cache: Arc<Cache>,
        conn: ConnHandle,
        out: mpsc::UnboundedReceiver<String>,
    }

    impl Harness {
        fn new(protocol: u32) -> Self {
            Self::with_config(protocol, ConnConfig::default())
        }

        fn with_config(protocol: u32, config: ConnConfig) -> Self {
            let bus = MockBus::new();
            let cache = Cache::new(bus.clone(), CacheConfig::default());
            cache.start().unwrap();
            let registry = Arc::new(ConnRegistry::new());
            let (tx, out) = mpsc::unbounded_channel();
            let conn = registry
                .connect(ConnParams {
                    cache: cache.clone(),
                    config,
                    http: HttpRequestInfo::default(),
                    out: Some(tx),
                    protocol,
                })
                .unwrap();
            Self { bus, cache, conn, out }
        }

        fn request(&self, id: u64, method: &str, params: Option<Value>) {
            let mut frame = json!({"method": method, "id": id});
            if let Some(p) = params {
                frame["params"] = p;
            }
            let data = frame.to_string();
            self.conn.enqueue(move |st| handle_request(st, data.as_bytes()));
        }

        async fn recv(&mut self) -> Value {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.out.recv())
                .await
                .expect("timed out waiting for frame")
                .expect("output closed");
            serde_json::from_str(&frame).unwrap()
        }

        /// Wait for a round trip through the cache and connection, then
        /// check that nothing was sent.
        async fn assert_no_frame(&mut self) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.conn.call(|_| ()).await;
            if let Ok(frame) = self.out.try_recv() {
                panic!("unexpected frame {}", frame);
            }
        }

        /// Collect `n` requests, keyed by subject.
        async fn requests(&self, n: usize) -> HashMap<String, MockRequest> {
            let mut reqs = HashMap::new();
            for _ in 0..n {
                let req = self.bus.next_request().await;
                reqs.insert(req.subject.clone(), req);
            }
            reqs
        }

        async fn subscription_count(&self) -> usize {
            self.conn.call(|st| st.subscription_count()).await.unwrap()
        }

        /// Subscribe to `rid` with get access, responding with `resource`.
        async fn subscribe(&mut self, id: u64, rid: &str, resource: &str) -> Value {
            self.request(id, &format!("subscribe.{}", rid), None);
            let mut reqs = self.requests(2).await;
            reqs.remove(&format!("access.{}", rid))
                .unwrap()
                .respond(r#"{"result":{"get":true}}"#);
            reqs.remove(&format!("get.{}", rid))
                .unwrap()
                .respond(&format!(r#"{{"result":{}}}"#, resource));
            self.recv().await
        }
    }

    #[tokio::test]
    async fn test_subscribe_primitive_model() {
        let mut h = Harness::new(VERSION_LATEST);
        let frame = h
            .subscribe(
                1,
                "test.model",
                r#"{"model":{"string":"foo","int":42,"bool":true,"null":null}}"#,
            )
            .await;
        assert_eq!(
            frame,
            json!({
                "result": {"models": {"test.model": {"string": "foo", "int": 42, "bool": true, "null": null}}},
                "id": 1
            })
        );
        assert_eq!(h.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_subscribe_cyclic_model_is_sent_once() {
        let mut h = Harness::new(VERSION_LATEST);
        let frame = h.subscribe(1, "test.m.a", r#"{"model":{"a":{"rid":"test.m.a"}}}"#).await;
        assert_eq!(
            frame,
            json!({"result": {"models": {"test.m.a": {"a": {"rid": "test.m.a"}}}}, "id": 1})
        );
        h.bus.assert_no_request().await;

        // Only referenced by itself once the direct subscription is gone
        h.request(2, "unsubscribe.test.m.a", None);
        assert_eq!(h.recv().await, json!({"id": 2}));
        assert_eq!(h.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_follows_references() {
        let mut h = Harness::new(VERSION_LATEST);
        h.request(1, "subscribe.test.a", None);
        let mut reqs = h.requests(2).await;
        reqs.remove("access.test.a").unwrap().respond(r#"{"result":{"get":true}}"#);
        reqs.remove("get.test.a")
            .unwrap()
            .respond(r#"{"result":{"model":{"b":{"rid":"test.b"},"c":{"rid":"test.c","soft":true}}}}"#);

        // Soft references are not followed
        h.bus
            .expect_request("get.test.b")
            .await
            .respond(r#"{"result":{"collection":[1,{"rid":"test.a"}]}}"#);

        assert_eq!(
            h.recv().await,
            json!({
                "result": {
                    "models": {"test.a": {"b": {"rid": "test.b"}, "c": {"rid": "test.c", "soft": true}}},
                    "collections": {"test.b": [1, {"rid": "test.a"}]}
                },
                "id": 1
            })
        );
        assert_eq!(h.subscription_count().await, 2);

        h.request(2, "unsubscribe.test.a", None);
        assert_eq!(h.recv().await, json!({"id": 2}));
        assert_eq!(h.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_resends_resource_held_by_unsent_subscription() {
        let mut h = Harness::new(VERSION_LATEST);
        h.request(1, "subscribe.test.a", None);
        let mut reqs = h.requests(2).await;
        reqs.remove("access.test.a").unwrap().respond(r#"{"result":{"get":true}}"#);
        reqs.remove("get.test.a")
            .unwrap()
            .respond(r#"{"result":{"model":{"b":{"rid":"test.b"}}}}"#);
        h.bus
            .expect_request("get.test.b")
            .await
            .respond(r#"{"result":{"model":{"foo":"bar"}}}"#);
        assert_eq!(
            h.recv().await,
            json!({
                "result": {"models": {"test.a": {"b": {"rid": "test.b"}}, "test.b": {"foo": "bar"}}},
                "id": 1
            })
        );

        // test.c references test.b but is held back by its access request
        h.request(2, "subscribe.test.c", None);
        let mut reqs = h.requests(2).await;
        reqs.remove("get.test.c")
            .unwrap()
            .respond(r#"{"result":{"model":{"b":{"rid":"test.b"}}}}"#);
        let access = reqs.remove("access.test.c").unwrap();
        h.assert_no_frame().await;

        // The client drops test.b together with test.a
        h.request(3, "unsubscribe.test.a", None);
        assert_eq!(h.recv().await, json!({"id": 3}));
        assert_eq!(h.subscription_count().await, 2);

        access.respond(r#"{"result":{"get":true}}"#);
        assert_eq!(
            h.recv().await,
            json!({
                "result": {"models": {"test.c": {"b": {"rid": "test.b"}}, "test.b": {"foo": "bar"}}},
                "id": 2
            })
        );
    }

    #[tokio::test]
    async fn test_unsubscribe_keeps_resource_held_by_sent_subscription() {
        let mut h = Harness::new(VERSION_LATEST);
        h.request(1, "subscribe.test.a", None);
        let mut reqs = h.requests(2).await;
        reqs.remove("access.test.a").unwrap().respond(r#"{"result":{"get":true}}"#);
        reqs.remove("get.test.a")
            .unwrap()
            .respond(r#"{"result":{"model":{"b":{"rid":"test.b"}}}}"#);
        h.bus
            .expect_request("get.test.b")
            .await
            .respond(r#"{"result":{"model":{"foo":"bar"}}}"#);
        h.recv().await;

        let frame = h.subscribe(2, "test.x", r#"{"model":{"b":{"rid":"test.b"}}}"#).await;
        assert_eq!(
            frame,
            json!({"result": {"models": {"test.x": {"b": {"rid": "test.b"}}}}, "id": 2})
        );

        h.request(3, "unsubscribe.test.a", None);
        assert_eq!(h.recv().await, json!({"id": 3}));

        // Still held by test.x on the client
        let frame = h.subscribe(4, "test.c", r#"{"model":{"b":{"rid":"test.b"}}}"#).await;
        assert_eq!(
            frame,
            json!({"result": {"models": {"test.c": {"b": {"rid": "test.b"}}}}, "id": 4})
        );
    }

    #[tokio::test]
    async fn test_reference_error_is_included() {
        let mut h = Harness::new(VERSION_LATEST);
        h.request(1, "subscribe.test.a", None);
        let mut reqs = h.requests(2).await;
        reqs.remove("access.test.a").unwrap().respond(r#"{"result":{"get":true}}"#);
        reqs.remove("get.test.a")
            .unwrap()
            .respond(r#"{"result":{"model":{"b":{"rid":"test.b"}}}}"#);
        h.bus
            .expect_request("get.test.b")
            .await
            .respond(r#"{"error":{"code":"system.notFound","message":"Not found"}}"#);

        assert_eq!(
            h.recv().await,
            json!({
                "result": {
                    "models": {"test.a": {"b": {"rid": "test.b"}}},
                    "errors": {"test.b": {"code": "system.notFound", "message": "Not found"}}
                },
                "id": 1
            })
        );
    }

    #[tokio::test]
    async fn test_change_without_effect_sends_nothing() {
        let mut h = Harness::new(VERSION_LATEST);
        h.subscribe(1, "test.model", r#"{"model":{"x":1}}"#).await;

        h.bus.publish("event.test.model.change", r#"{"values":{"x":1}}"#);
        h.assert_no_frame().await;

        h.bus.publish("event.test.model.change", r#"{"values":{"x":2}}"#);
        assert_eq!(
            h.recv().await,
            json!({"event": "test.model.change", "data": {"values": {"x": 2}}})
        );
    }

    #[tokio::test]
    async fn test_change_adding_reference_bundles_resource() {
        let mut h = Harness::new(VERSION_LATEST);
        h.subscribe(1, "test.model", r#"{"model":{"x":1}}"#).await;

        h.bus
            .publish("event.test.model.change", r#"{"values":{"x":{"rid":"test.child"}}}"#);
        h.bus
            .expect_request("get.test.child")
            .await
            .respond(r#"{"result":{"model":{"y":true}}}"#);
        assert_eq!(
            h.recv().await,
            json!({
                "event": "test.model.change",
                "data": {
                    "values": {"x": {"rid": "test.child"}},
                    "models": {"test.child": {"y": true}}
                }
            })
        );

        // Removing the reference releases the child
        h.bus
            .publish("event.test.model.change", r#"{"values":{"x":{"action":"delete"}}}"#);
        assert_eq!(
            h.recv().await,
            json!({"event": "test.model.change", "data": {"values": {"x": {"action": "delete"}}}})
        );
        assert_eq!(h.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_collection_reset_emits_edit_script() {
        let mut h = Harness::new(VERSION_LATEST);
        h.subscribe(1, "test.collection", r#"{"collection":["a","b","c","d"]}"#).await;

        h.bus.publish("system.reset", r#"{"resources":["test.>"]}"#);
        h.bus
            .expect_request("get.test.collection")
            .await
            .respond(r#"{"result":{"collection":["a","c","d","e"]}}"#);

        assert_eq!(
            h.recv().await,
            json!({"event": "test.collection.remove", "data": {"idx": 1}})
        );
        assert_eq!(
            h.recv().await,
            json!({"event": "test.collection.add", "data": {"idx": 3, "value": "e"}})
        );
    }

    #[tokio::test]
    async fn test_add_reference_waits_for_load() {
        let mut h = Harness::new(VERSION_LATEST);
        h.subscribe(1, "test.collection", r#"{"collection":[]}"#).await;

        h.bus
            .publish("event.test.collection.add", r#"{"idx":0,"value":{"rid":"test.item"}}"#);
        let get = h.bus.expect_request("get.test.item").await;
        // Held back until the referenced resource is sent
        h.bus.publish("event.test.collection.custom", r#"{"n":1}"#);
        h.assert_no_frame().await;

        get.respond(r#"{"result":{"model":{"name":"item"}}}"#);
        assert_eq!(
            h.recv().await,
            json!({
                "event": "test.collection.add",
                "data": {"idx": 0, "value": {"rid": "test.item"}, "models": {"test.item": {"name": "item"}}}
            })
        );
        assert_eq!(
            h.recv().await,
            json!({"event": "test.collection.custom", "data": {"n": 1}})
        );

        h.bus.publish("event.test.collection.remove", r#"{"idx":0}"#);
        assert_eq!(
            h.recv().await,
            json!({"event": "test.collection.remove", "data": {"idx": 0}})
        );
        assert_eq!(h.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_reaccess_revokes_subscription() {
        let mut h = Harness::new(VERSION_LATEST);
        h.subscribe(1, "test.model", r#"{"model":{"foo":"bar"}}"#).await;

        h.bus.publish("event.test.model.reaccess", "");
        h.bus
            .expect_request("access.test.model")
            .await
            .respond(r#"{"result":{"get":false}}"#);

        assert_eq!(
            h.recv().await,
            json!({
                "event": "test.model.unsubscribe",
                "data": {"reason": {"code": "system.accessDenied", "message": "Access denied"}}
            })
        );
        assert_eq!(h.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_token_change_triggers_reaccess() {
        let mut h = Harness::new(VERSION_LATEST);
        let subject = format!("conn.{}.token", h.conn.cid());

        // Setting the first token needs no reaccess
        h.bus.publish(&subject, r#"{"token":{"user":"a"}}"#);
        h.subscribe(1, "test.model", r#"{"model":{"foo":"bar"}}"#).await;
        h.bus.assert_no_request().await;

        h.bus.publish(&subject, r#"{"token":{"user":"b"}}"#);
        let req = h.bus.expect_request("access.test.model").await;
        assert_eq!(req.json()["token"], json!({"user": "b"}));
        req.respond(r#"{"result":{"get":true}}"#);
        h.assert_no_frame().await;
        assert_eq!(h.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_delete_event_unsubscribes() {
        let mut h = Harness::new(VERSION_LATEST);
        h.subscribe(1, "test.model", r#"{"model":{"foo":"bar"}}"#).await;

        h.bus.publish("event.test.model.delete", "");
        assert_eq!(h.recv().await, json!({"event": "test.model.delete"}));
        assert_eq!(
            h.recv().await,
            json!({
                "event": "test.model.unsubscribe",
                "data": {"reason": {"code": "system.deleted", "message": "Deleted"}}
            })
        );
        assert_eq!(h.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_get_does_not_keep_subscription() {
        let mut h = Harness::new(VERSION_LATEST);
        h.request(1, "get.test.model", None);
        let mut reqs = h.requests(2).await;
        reqs.remove("access.test.model").unwrap().respond(r#"{"result":{"get":true}}"#);
        reqs.remove("get.test.model")
            .unwrap()
            .respond(r#"{"result":{"model":{"foo":"bar"}}}"#);
        assert_eq!(
            h.recv().await,
            json!({"result": {"models": {"test.model": {"foo": "bar"}}}, "id": 1})
        );
        assert_eq!(h.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_access_denied() {
        let mut h = Harness::new(VERSION_LATEST);
        h.request(1, "subscribe.test.model", None);
        let mut reqs = h.requests(2).await;
        reqs.remove("access.test.model").unwrap().respond(r#"{"result":{"get":false}}"#);
        reqs.remove("get.test.model")
            .unwrap()
            .respond(r#"{"result":{"model":{"foo":"bar"}}}"#);
        assert_eq!(
            h.recv().await,
            json!({"error": {"code": "system.accessDenied", "message": "Access denied"}, "id": 1})
        );
        assert_eq!(h.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_count() {
        let mut h = Harness::new(VERSION_LATEST);
        h.subscribe(1, "test.model", r#"{"model":{"foo":"bar"}}"#).await;
        h.request(2, "subscribe.test.model", None);
        assert_eq!(h.recv().await, json!({"result": {}, "id": 2}));

        h.request(3, "unsubscribe.test.model", Some(json!({"count": 3})));
        assert_eq!(
            h.recv().await,
            json!({"error": {"code": "system.noSubscription", "message": "No subscription"}, "id": 3})
        );
        h.request(4, "unsubscribe.test.model", Some(json!({"count": 0})));
        assert_eq!(h.recv().await["error"]["code"], "system.invalidParams");
        h.request(5, "unsubscribe.test.model", Some(json!({"count": 2})));
        assert_eq!(h.recv().await, json!({"id": 5}));
        assert_eq!(h.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_call_with_payload_response() {
        let mut h = Harness::new(VERSION_LATEST);
        h.request(1, "call.test.model.set", Some(json!({"foo": "baz"})));
        h.bus
            .expect_request("access.test.model")
            .await
            .respond(r#"{"result":{"get":true,"call":"set,other"}}"#);
        let req = h.bus.expect_request("call.test.model.set").await;
        assert_eq!(req.json()["params"], json!({"foo": "baz"}));
        req.respond(r#"{"result":{"ok":true}}"#);
        assert_eq!(h.recv().await, json!({"result": {"payload": {"ok": true}}, "id": 1}));
    }

    #[tokio::test]
    async fn test_call_not_allowed() {
        let mut h = Harness::new(VERSION_LATEST);
        h.request(1, "call.test.model.set", None);
        h.bus
            .expect_request("access.test.model")
            .await
            .respond(r#"{"result":{"get":true,"call":"other"}}"#);
        assert_eq!(h.recv().await["error"]["code"], "system.accessDenied");
        h.bus.assert_no_request().await;
    }

    #[tokio::test]
    async fn test_call_with_resource_response() {
        let mut h = Harness::new(VERSION_LATEST);
        h.request(1, "call.test.collection.create", None);
        h.bus
            .expect_request("access.test.collection")
            .await
            .respond(r#"{"result":{"call":"*"}}"#);
        h.bus
            .expect_request("call.test.collection.create")
            .await
            .respond(r#"{"resource":{"rid":"test.item.1"}}"#);

        let mut reqs = h.requests(2).await;
        reqs.remove("access.test.item.1").unwrap().respond(r#"{"result":{"get":true}}"#);
        reqs.remove("get.test.item.1")
            .unwrap()
            .respond(r#"{"result":{"model":{"id":1}}}"#);
        assert_eq!(
            h.recv().await,
            json!({"result": {"rid": "test.item.1", "models": {"test.item.1": {"id": 1}}}, "id": 1})
        );
        assert_eq!(h.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_legacy_call_returns_raw_result() {
        let mut h = Harness::new(VERSION_LEGACY);
        h.request(1, "auth.test.model.login", None);
        h.bus
            .expect_request("auth.test.model.login")
            .await
            .respond(r#"{"result":{"ok":true}}"#);
        assert_eq!(h.recv().await, json!({"result": {"ok": true}, "id": 1}));
    }

    #[tokio::test]
    async fn test_legacy_encoding_of_soft_references() {
        let mut h = Harness::new(VERSION_LEGACY);
        let frame = h
            .subscribe(
                1,
                "test.model",
                r#"{"model":{"soft":{"rid":"test.other","soft":true},"data":{"data":[1,2]}}}"#,
            )
            .await;
        assert_eq!(
            frame,
            json!({"result": {"models": {"test.model": {"soft": "test.other", "data": "[Data]"}}}, "id": 1})
        );
    }

    #[tokio::test]
    async fn test_version() {
        let mut h = Harness::new(VERSION_LEGACY);
        h.request(1, "version", Some(json!({"protocol": "1.2.1"})));
        assert_eq!(h.recv().await, json!({"result": {"protocol": "1.2.2"}, "id": 1}));
        assert_eq!(h.conn.call(|st| st.protocol()).await, Some(1_002_001));

        h.request(2, "version", Some(json!({"protocol": "2.0.0"})));
        assert_eq!(h.recv().await["error"]["code"], "system.unsupportedProtocol");
        h.request(3, "version", Some(json!({"protocol": "1.x.0"})));
        assert_eq!(h.recv().await["error"]["code"], "system.invalidParams");
        h.request(4, "version", None);
        assert_eq!(h.recv().await, json!({"result": {"protocol": "1.2.2"}, "id": 4}));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let mut h = Harness::new(VERSION_LATEST);
        for (id, method) in [(1, "foo.test.model"), (2, "call.test"), (3, "subscribe.test..model"), (4, "ping")] {
            h.request(id, method, None);
            assert_eq!(
                h.recv().await,
                json!({"error": {"code": "system.invalidRequest", "message": "Invalid request"}, "id": id})
            );
        }
        // Requests without an id are dropped
        let data = r#"{"method":"subscribe.test.model"}"#;
        h.conn.enqueue(move |st| handle_request(st, data.as_bytes()));
        h.assert_no_frame().await;
        h.bus.assert_no_request().await;
    }

    #[tokio::test]
    async fn test_cid_placeholder_is_expanded() {
        let mut h = Harness::new(VERSION_LATEST);
        let cid = h.conn.cid().to_string();
        h.request(1, "subscribe.test.{cid}", None);
        let mut reqs = h.requests(2).await;
        reqs.remove(&format!("access.test.{}", cid))
            .unwrap()
            .respond(r#"{"result":{"get":true}}"#);
        reqs.remove(&format!("get.test.{}", cid))
            .unwrap()
            .respond(r#"{"result":{"model":{}}}"#);
        assert_eq!(
            h.recv().await,
            json!({"result": {"models": {"test.{cid}": {}}}, "id": 1})
        );
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        let mut h = Harness::new(VERSION_LATEST);
        h.subscribe(1, "test.model", r#"{"model":{}}"#).await;
        for id in 2..=crate::conn::SUBSCRIPTION_COUNT_LIMIT as u64 {
            h.request(id, "subscribe.test.model", None);
            assert_eq!(h.recv().await, json!({"result": {}, "id": id}));
        }
        h.request(1000, "subscribe.test.model", None);
        assert_eq!(h.recv().await["error"]["code"], "system.subscriptionLimitExceeded");
    }

    #[tokio::test]
    async fn test_dispose_releases_cache() {
        let mut h = Harness::new(VERSION_LATEST);
        h.subscribe(1, "test.model", r#"{"model":{}}"#).await;
        assert_eq!(h.cache.subscription_count("test.model"), Some(1));

        h.conn.dispose().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.cache.subscription_count("test.model"), Some(0));
        assert!(!h.conn.enqueue(|_| ()));
    }
}
