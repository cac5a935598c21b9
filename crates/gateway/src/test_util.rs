//! In-memory message bus for tests.

use bytes::Bytes;
use nats_client::{BusError, BusMessage, BusSubscription, ClosedHandler, MessageBus, MessageHandler, ResponseCallback};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A request captured by [`MockBus`].
pub struct MockRequest {
    pub subject: String,
    pub payload: Bytes,
    callback: Option<ResponseCallback>,
}

impl MockRequest {
    /// Payload parsed as JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).expect("request payload is JSON")
    }

    /// Respond with a raw JSON payload.
    pub fn respond(mut self, payload: &str) {
        if let Some(cb) = self.callback.take() {
            cb(Ok(Bytes::from(payload.to_string())));
        }
    }

    /// Fail the request with a bus error.
    pub fn fail(mut self, err: BusError) {
        if let Some(cb) = self.callback.take() {
            cb(Err(err));
        }
    }
}

impl std::fmt::Debug for MockRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockRequest")
            .field("subject", &self.subject)
            .field("payload", &String::from_utf8_lossy(&self.payload))
            .finish()
    }
}

struct MockSubscription {
    handler: Arc<MessageHandler>,
    cancel: oneshot::Receiver<()>,
}

impl MockSubscription {
    fn is_active(&mut self) -> bool {
        matches!(self.cancel.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }
}

/// Records requests on a channel and lets tests publish events.
pub struct MockBus {
    requests_tx: mpsc::UnboundedSender<MockRequest>,
    requests_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<MockRequest>>,
    subs: Mutex<HashMap<String, MockSubscription>>,
    closed: Mutex<Option<ClosedHandler>>,
}

impl MockBus {
    pub fn new() -> Arc<Self> {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            requests_tx,
            requests_rx: tokio::sync::Mutex::new(requests_rx),
            subs: Mutex::new(HashMap::new()),
            closed: Mutex::new(None),
        })
    }

    /// Wait for the next request.
    pub async fn next_request(&self) -> MockRequest {
        let mut rx = self.requests_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for request")
            .expect("request channel closed")
    }

    /// Wait for the next request and check its subject.
    pub async fn expect_request(&self, subject: &str) -> MockRequest {
        let req = self.next_request().await;
        assert_eq!(req.subject, subject, "unexpected request {:?}", req);
        req
    }

    /// Check that no request is waiting.
    pub async fn assert_no_request(&self) {
        let mut rx = self.requests_rx.lock().await;
        if let Ok(req) = rx.try_recv() {
            panic!("unexpected request {:?}", req);
        }
    }

    /// Check whether `<namespace>.*` has an active subscription.
    pub fn is_subscribed(&self, namespace: &str) -> bool {
        let mut subs = self.subs.lock().unwrap();
        subs.get_mut(namespace).is_some_and(|s| s.is_active())
    }

    /// Deliver a message to the subscription covering `subject`.
    pub fn publish(&self, subject: &str, payload: &str) {
        let handler = {
            let mut subs = self.subs.lock().unwrap();
            let Some((namespace, _)) = subject.rsplit_once('.') else { return };
            match subs.get_mut(namespace) {
                Some(s) => {
                    if !s.is_active() {
                        return;
                    }
                    s.handler.clone()
                }
                None => return,
            }
        };
        handler(BusMessage {
            subject: subject.to_string(),
            payload: Bytes::from(payload.to_string()),
        });
    }

    /// Fire the closed handler.
    pub fn trigger_closed(&self, reason: Option<String>) {
        if let Some(handler) = self.closed.lock().unwrap().take() {
            handler(reason);
        }
    }
}

impl MessageBus for MockBus {
    fn send_request(&self, subject: &str, payload: Bytes, callback: ResponseCallback) {
        let _ = self.requests_tx.send(MockRequest {
            subject: subject.to_string(),
            payload,
            callback: Some(callback),
        });
    }

    fn subscribe(&self, namespace: &str, handler: MessageHandler) -> nats_client::Result<BusSubscription> {
        let (sub, cancel) = BusSubscription::new(format!("{}.*", namespace));
        self.subs.lock().unwrap().insert(
            namespace.to_string(),
            MockSubscription {
                handler: Arc::new(handler),
                cancel,
            },
        );
        Ok(sub)
    }

    fn set_closed_handler(&self, handler: ClosedHandler) {
        *self.closed.lock().unwrap() = Some(handler);
    }

    fn close(&self) {}

    fn is_closed(&self) -> bool {
        false
    }
}
