//! The message bus interface consumed by the resource cache.

use crate::error::{BusError, Result};
use bytes::Bytes;
use tokio::sync::oneshot;

/// Inbound message on a subscribed namespace.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Full subject the message was published on.
    pub subject: String,
    /// Raw payload.
    pub payload: Bytes,
}

/// Callback receiving the outcome of a request. Invoked exactly once.
pub type ResponseCallback = Box<dyn FnOnce(std::result::Result<Bytes, BusError>) + Send + 'static>;

/// Handler receiving every message published on a subscribed namespace.
pub type MessageHandler = Box<dyn Fn(BusMessage) + Send + Sync + 'static>;

/// Handler invoked once when the bus connection is lost.
pub type ClosedHandler = Box<dyn FnOnce(Option<String>) + Send + 'static>;

/// Request/subscribe transport used by the cache.
///
/// Callbacks and handlers run on the bus client's delivery task. They must
/// not block; the cache only enqueues work from them.
pub trait MessageBus: Send + Sync + 'static {
    /// Send a request on `subject` and invoke `callback` with the response.
    ///
    /// A missing responder yields [`BusError::NoResponders`] and an elapsed
    /// deadline [`BusError::Timeout`].
    fn send_request(&self, subject: &str, payload: Bytes, callback: ResponseCallback);

    /// Subscribe to `<namespace>.*`.
    fn subscribe(&self, namespace: &str, handler: MessageHandler) -> Result<BusSubscription>;

    /// Set the handler called once when the connection closes.
    fn set_closed_handler(&self, handler: ClosedHandler);

    /// Close the connection.
    fn close(&self);

    /// Check whether the connection is closed.
    fn is_closed(&self) -> bool;
}

/// Handle to an active namespace subscription.
///
/// The subscription ends when [`BusSubscription::unsubscribe`] is called or
/// the handle is dropped.
#[derive(Debug)]
pub struct BusSubscription {
    subject: String,
    cancel: Option<oneshot::Sender<()>>,
}

impl BusSubscription {
    /// Create a handle for `subject`. The returned receiver completes when the
    /// handle is unsubscribed or dropped.
    pub fn new(subject: impl Into<String>) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                subject: subject.into(),
                cancel: Some(tx),
            },
            rx,
        )
    }

    /// The subscribed wildcard subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// End the subscription.
    pub fn unsubscribe(mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unsubscribe_completes_receiver() {
        let (sub, rx) = BusSubscription::new("event.test.*");
        assert_eq!(sub.subject(), "event.test.*");
        sub.unsubscribe();
        assert!(rx.await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_completes_receiver() {
        let (sub, rx) = BusSubscription::new("event.test.*");
        drop(sub);
        // Sender dropped without sending
        assert!(rx.await.is_err());
    }
}
