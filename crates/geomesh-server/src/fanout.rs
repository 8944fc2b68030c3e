//! Delivers user-targeted bus messages to push channels and sessions.

use futures_util::stream::{select_all, StreamExt};
use geomesh_bus::EventBus;
use geomesh_channels::ChannelRouter;
use geomesh_types::{topics, PubSubMessage};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Topics whose payloads name a recipient in `user_id`.
pub const FANOUT_TOPICS: [&str; 5] = [
    topics::GEO_EVENTS,
    topics::NOTIFICATIONS,
    topics::CHAT_INVITES,
    topics::ADS,
    topics::CALL_INVITES,
];

/// Envelope type used when a payload carries no `type` of its own.
fn default_kind(topic: &str) -> &'static str {
    match topic {
        topics::GEO_EVENTS => "geo_event",
        topics::CHAT_INVITES => "chat_invite",
        topics::ADS => "ad",
        topics::CALL_INVITES => "call_invite",
        _ => "notification",
    }
}

/// Recipients of a message: `user_id`, plus `call_to` for call invites.
fn recipients(message: &PubSubMessage) -> Vec<String> {
    let mut users = Vec::with_capacity(2);
    let mut push = |key: &str| {
        if let Some(id) = message.payload.get(key).and_then(Value::as_str) {
            if !id.is_empty() && !users.iter().any(|u| u == id) {
                users.push(id.to_string());
            }
        }
    };
    push("user_id");
    if message.topic == topics::CALL_INVITES {
        push("call_to");
    }
    users
}

/// Sends one bus message to every recipient's push channel and session.
/// Returns the number of successful deliveries.
pub fn deliver(router: &ChannelRouter, message: &PubSubMessage) -> usize {
    let kind = message
        .payload
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_else(|| default_kind(&message.topic));

    let mut delivered = 0;
    for user_id in recipients(message) {
        if router.send_push(&user_id, kind, message.payload.clone(), None) {
            delivered += 1;
        }
        if router.send_to_session(&user_id, kind, message.payload.clone(), None) {
            delivered += 1;
        }
    }
    delivered
}

/// Subscribes to [`FANOUT_TOPICS`] and delivers until `shutdown` fires.
///
/// Subscriptions are taken before this returns, so nothing published
/// afterwards is missed.
pub fn spawn_fanout(
    bus: &EventBus,
    router: ChannelRouter,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut merged = select_all(FANOUT_TOPICS.iter().map(|topic| bus.subscribe(*topic)));

    tokio::spawn(async move {
        tracing::info!(topics = ?FANOUT_TOPICS, "fan-out started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                next = merged.next() => match next {
                    Some(message) => {
                        let delivered = deliver(&router, &message);
                        tracing::trace!(topic = %message.topic, delivered, "fan-out delivery");
                    }
                    None => break,
                },
            }
        }
        tracing::info!("fan-out stopped");
    })
}
