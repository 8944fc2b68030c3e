//! Topic-based publish/subscribe fan-out.
//!
//! Each [`Subscription`] owns a bounded FIFO queue. Publishing never blocks:
//! a subscriber whose queue is full misses that message, everyone else still
//! gets it. Nothing is retained for topics without subscribers.

use futures_util::Stream;
use geomesh_types::sync::{read_or_recover, write_or_recover};
use geomesh_types::{JsonMap, PubSubMessage};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Queue capacity used by [`EventBus::default`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<PubSubMessage>,
}

type TopicMap = HashMap<String, Vec<Subscriber>>;

struct Inner {
    topics: RwLock<TopicMap>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Inner {
    fn remove(&self, topic: &str, id: u64) -> bool {
        let mut topics = write_or_recover(&self.topics, "event_bus");
        let Some(subscribers) = topics.get_mut(topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| s.id != id);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            topics.remove(topic);
        }
        removed
    }
}

/// Shared handle to the bus. Clones refer to the same topic registry.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl EventBus {
    /// Creates a bus whose subscriber queues hold `capacity` messages.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                topics: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Registers a new queue under `topic`.
    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        let topic = topic.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);

        write_or_recover(&self.inner.topics, "event_bus")
            .entry(topic.clone())
            .or_default()
            .push(Subscriber { id, tx });

        tracing::debug!(topic = %topic, subscription_id = id, "subscribed");

        Subscription {
            id,
            topic,
            rx,
            bus: Arc::downgrade(&self.inner),
            registered: true,
        }
    }

    /// Delivers `payload` to every current subscriber of `topic`.
    ///
    /// Returns the number of queues the message was placed on.
    pub fn publish(&self, topic: &str, payload: JsonMap) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        {
            let topics = read_or_recover(&self.inner.topics, "event_bus");
            let Some(subscribers) = topics.get(topic) else {
                return 0;
            };
            for subscriber in subscribers {
                let message = PubSubMessage {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                };
                match subscriber.tx.try_send(message) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        tracing::warn!(
                            topic = %topic,
                            subscription_id = subscriber.id,
                            "subscriber queue full, dropping message"
                        );
                    }
                    Err(TrySendError::Closed(_)) => closed.push(subscriber.id),
                }
            }
        }

        // Receivers dropped without going through Subscription::drop (e.g. a
        // leaked handle) are pruned lazily here.
        for id in closed {
            self.inner.remove(topic, id);
        }

        delivered
    }

    /// Serializes `value` and publishes it. Values that do not serialize to
    /// a JSON object are logged and not published.
    pub fn publish_json<T: Serialize>(&self, topic: &str, value: &T) -> usize {
        match serde_json::to_value(value) {
            Ok(Value::Object(payload)) => self.publish(topic, payload),
            Ok(other) => {
                tracing::warn!(topic = %topic, kind = ?other, "payload is not an object, not publishing");
                0
            }
            Err(e) => {
                tracing::warn!(topic = %topic, error = %e, "failed to serialize payload");
                0
            }
        }
    }

    /// Number of live subscriptions on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        read_or_recover(&self.inner.topics, "event_bus")
            .get(topic)
            .map_or(0, Vec::len)
    }
}

/// A registered queue on one topic.
///
/// Dropping the handle releases it. Messages already queued at release time
/// can still be drained with [`Subscription::recv`] after
/// [`Subscription::unsubscribe`].
pub struct Subscription {
    id: u64,
    topic: String,
    rx: mpsc::Receiver<PubSubMessage>,
    bus: Weak<Inner>,
    registered: bool,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next message. Returns `None` once the subscription is
    /// released (or the bus is gone) and the queue is drained.
    pub async fn recv(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }

    /// Returns a queued message without waiting.
    pub fn try_recv(&mut self) -> Option<PubSubMessage> {
        self.rx.try_recv().ok()
    }

    /// Stops further deliveries. Idempotent.
    pub fn unsubscribe(&mut self) {
        if !self.registered {
            return;
        }
        self.registered = false;
        if let Some(inner) = self.bus.upgrade() {
            inner.remove(&self.topic, self.id);
            tracing::debug!(topic = %self.topic, subscription_id = self.id, "unsubscribed");
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl Stream for Subscription {
    type Item = PubSubMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
