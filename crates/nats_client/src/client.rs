//! NATS implementation of the message bus.

use crate::bus::{BusMessage, BusSubscription, ClosedHandler, MessageBus, MessageHandler, ResponseCallback};
use crate::error::{BusError, Result};
use crate::meta;
use async_nats::{Client, Event, Message, StatusCode, Subscriber};
use bytes::Bytes;
use common::TimerQueue;
use futures::stream::{self, BoxStream, SelectAll};
use futures::StreamExt;
use metrics::counter;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Default deadline for requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Maximum length of a subject plus reply inbox accepted by the server.
pub const MAX_CONTROL_LINE_SIZE: usize = 4096;

/// Stream tag used for the shared reply inbox.
const INBOX_STREAM: u64 = 0;

/// Configuration for the NATS client.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// Server URL.
    pub url: String,
    /// Deadline applied to every request unless extended by a meta frame.
    pub request_timeout: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

enum Command {
    Subscribe {
        id: u64,
        subject: String,
        handler: MessageHandler,
        cancel: oneshot::Receiver<()>,
    },
    Publish {
        id: u64,
        subject: String,
        reply: String,
        payload: Bytes,
    },
}

struct Pending {
    callback: ResponseCallback,
    /// Explicit timer set by a meta frame. While `None`, the request's
    /// deadline lives in the timer queue.
    timer: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Shared {
    pending: Mutex<HashMap<u64, Pending>>,
    closed: AtomicBool,
    closed_handler: Mutex<Option<ClosedHandler>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self, id: u64) -> Option<Pending> {
        self.pending().remove(&id)
    }

    /// Deadline expiry for request `id`.
    fn expire(&self, id: u64) {
        let Some(pending) = self.take(id) else {
            return;
        };
        if let Some(timer) = pending.timer {
            timer.abort();
        }
        trace!("x=> ({}) Request timeout", id);
        counter!("gateway_bus_timeouts_total").increment(1);
        (pending.callback)(Err(BusError::Timeout));
    }

    fn fail(&self, id: u64, err: BusError) {
        if let Some(pending) = self.take(id) {
            (pending.callback)(Err(err));
        }
    }

    fn on_closed(&self, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let handler = self
            .closed_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handler) = handler {
            handler(reason);
        }
    }
}

/// NATS backed [`MessageBus`].
///
/// Requests share one wildcard reply inbox; each request gets its own reply
/// subject `<inbox>.<id>`. Deadlines are tracked in a [`TimerQueue`] keyed by
/// request id.
pub struct NatsClient {
    inbox_prefix: String,
    next_id: AtomicU64,
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
    timers: Arc<TimerQueue<u64>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl NatsClient {
    /// Connect to a NATS server and start the listener task.
    ///
    /// The client does not reconnect: a lost connection makes all cached
    /// resources stale, so the closed handler fires instead.
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        info!("Connecting to NATS at {}", config.url);

        let shared = Arc::new(Shared::default());
        let events = shared.clone();
        let client = async_nats::ConnectOptions::new()
            .event_callback(move |event| {
                let shared = events.clone();
                async move {
                    match event {
                        Event::Disconnected => {
                            warn!("NATS connection lost");
                            shared.on_closed(Some("lost NATS connection".to_string()));
                        }
                        Event::Closed => shared.on_closed(None),
                        Event::SlowConsumer(sid) => error!("NATS slow consumer on subscription {}", sid),
                        other => debug!("NATS event: {}", other),
                    }
                }
            })
            .connect(config.url.as_str())
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let inbox_prefix = client.new_inbox();
        let inbox = client
            .subscribe(format!("{}.*", inbox_prefix))
            .await
            .map_err(|e| BusError::Transport(e.to_string()))?;

        let expiring = shared.clone();
        let timers = Arc::new(TimerQueue::new(config.request_timeout, move |id| {
            expiring.expire(id)
        }));

        let (commands, command_rx) = mpsc::unbounded_channel();
        let listener = tokio::spawn(listen(
            client,
            inbox,
            command_rx,
            shared.clone(),
            timers.clone(),
        ));

        info!("Connected to NATS");
        Ok(Self {
            inbox_prefix,
            next_id: AtomicU64::new(INBOX_STREAM + 1),
            commands,
            shared,
            timers,
            listener: Mutex::new(Some(listener)),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl MessageBus for NatsClient {
    fn send_request(&self, subject: &str, payload: Bytes, callback: ResponseCallback) {
        let id = self.next_id();
        let reply = format!("{}.{}", self.inbox_prefix, id);

        if subject.len() + reply.len() > MAX_CONTROL_LINE_SIZE {
            tokio::spawn(async move { callback(Err(BusError::SubjectTooLong)) });
            return;
        }
        if self.is_closed() {
            tokio::spawn(async move { callback(Err(BusError::Closed)) });
            return;
        }

        trace!("<== ({}) {}: {}", id, subject, String::from_utf8_lossy(&payload));
        counter!("gateway_bus_requests_total").increment(1);

        self.shared.pending().insert(
            id,
            Pending {
                callback,
                timer: None,
            },
        );
        self.timers.add(id);

        let cmd = Command::Publish {
            id,
            subject: subject.to_string(),
            reply,
            payload,
        };
        if self.commands.send(cmd).is_err() {
            self.timers.remove(&id);
            self.shared.fail(id, BusError::Closed);
        }
    }

    fn subscribe(&self, namespace: &str, handler: MessageHandler) -> Result<BusSubscription> {
        if namespace.len() + 2 > MAX_CONTROL_LINE_SIZE {
            return Err(BusError::SubjectTooLong);
        }
        if self.is_closed() {
            return Err(BusError::Closed);
        }

        let subject = format!("{}.*", namespace);
        let (subscription, cancel) = BusSubscription::new(subject.clone());
        self.commands
            .send(Command::Subscribe {
                id: self.next_id(),
                subject,
                handler,
                cancel,
            })
            .map_err(|_| BusError::Closed)?;
        Ok(subscription)
    }

    fn set_closed_handler(&self, handler: ClosedHandler) {
        *self
            .shared
            .closed_handler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handler);
    }

    fn close(&self) {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            return;
        };
        debug!("Closing NATS connection...");
        self.shared.closed.store(true, Ordering::SeqCst);
        listener.abort();
        self.timers.clear();

        let pending: Vec<Pending> = self.shared.pending().drain().map(|(_, p)| p).collect();
        for p in pending {
            if let Some(timer) = p.timer {
                timer.abort();
            }
            (p.callback)(Err(BusError::Closed));
        }
        debug!("NATS connection closed");
    }

    fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

impl Drop for NatsClient {
    fn drop(&mut self) {
        self.close();
    }
}

type TaggedStream = BoxStream<'static, (u64, Option<Message>)>;

/// Wrap a subscriber so that it yields `(id, Some(msg))` per message and a
/// final `(id, None)` once it ends or is cancelled.
fn tagged(id: u64, subscriber: Subscriber, cancel: Option<oneshot::Receiver<()>>) -> TaggedStream {
    let messages = subscriber.map(move |m| (id, Some(m)));
    let end = stream::once(async move { (id, None) });
    match cancel {
        Some(cancel) => messages.take_until(cancel).chain(end).boxed(),
        None => messages.chain(end).boxed(),
    }
}

/// Delivery task: owns all NATS subscriptions and processes commands in order.
async fn listen(
    client: Client,
    inbox: Subscriber,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    timers: Arc<TimerQueue<u64>>,
) {
    let mut streams: SelectAll<TaggedStream> = SelectAll::new();
    let mut handlers: HashMap<u64, MessageHandler> = HashMap::new();
    streams.push(tagged(INBOX_STREAM, inbox, None));

    loop {
        tokio::select! {
            biased;

            cmd = commands.recv() => match cmd {
                Some(Command::Subscribe { id, subject, handler, cancel }) => {
                    match client.subscribe(subject.clone()).await {
                        Ok(subscriber) => {
                            trace!("S=> {}", subject);
                            handlers.insert(id, handler);
                            streams.push(tagged(id, subscriber, Some(cancel)));
                        }
                        Err(e) => error!("Error subscribing to {}: {}", subject, e),
                    }
                }
                Some(Command::Publish { id, subject, reply, payload }) => {
                    if let Err(e) = client.publish_with_reply(subject, reply, payload).await {
                        timers.remove(&id);
                        shared.fail(id, BusError::Transport(e.to_string()));
                    }
                }
                None => break,
            },

            Some((id, msg)) = streams.next() => match msg {
                Some(msg) if id == INBOX_STREAM => handle_response(&shared, &timers, msg),
                Some(msg) => {
                    if let Some(handler) = handlers.get(&id) {
                        trace!("=>> {}: {}", msg.subject, String::from_utf8_lossy(&msg.payload));
                        handler(BusMessage {
                            subject: msg.subject.to_string(),
                            payload: msg.payload,
                        });
                    }
                }
                None if id == INBOX_STREAM => {
                    warn!("NATS reply inbox closed");
                    shared.on_closed(Some("reply inbox closed".to_string()));
                }
                None => {
                    handlers.remove(&id);
                }
            },

            else => break,
        }
    }

    debug!("NATS listener stopped");
}

fn handle_response(shared: &Arc<Shared>, timers: &Arc<TimerQueue<u64>>, msg: Message) {
    let Some(id) = msg
        .subject
        .as_str()
        .rsplit('.')
        .next()
        .and_then(|s| s.parse::<u64>().ok())
    else {
        return;
    };

    if meta::is_meta(&msg.payload) {
        trace!("==> ({}) meta: {}", id, String::from_utf8_lossy(&msg.payload));
        if let Some(timeout) = meta::parse_timeout(&msg.payload) {
            extend_deadline(shared, timers, id, timeout);
        }
        return;
    }

    let Some(pending) = shared.take(id) else {
        trace!("==> ({}) response to unknown request", id);
        return;
    };
    timers.remove(&id);
    if let Some(timer) = pending.timer {
        timer.abort();
    }

    if msg.payload.is_empty() && msg.status == Some(StatusCode::NO_RESPONDERS) {
        trace!("x=> ({}) No responders", id);
        (pending.callback)(Err(BusError::NoResponders));
        return;
    }

    trace!("==> ({}): {}", id, String::from_utf8_lossy(&msg.payload));
    (pending.callback)(Ok(msg.payload));
}

/// Replace the deadline of a pending request with an explicit timer.
fn extend_deadline(shared: &Arc<Shared>, timers: &Arc<TimerQueue<u64>>, id: u64, timeout: Duration) {
    let mut pending = shared.pending();
    let Some(p) = pending.get_mut(&id) else {
        return;
    };

    let removed = match p.timer.take() {
        None => timers.remove(&id),
        Some(timer) => {
            let alive = !timer.is_finished();
            timer.abort();
            alive
        }
    };
    if !removed {
        return;
    }

    let expiring = shared.clone();
    p.timer = Some(tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        expiring.expire(id);
    }));
}
