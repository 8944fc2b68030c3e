//! Server-sent event streams: the per-user push channel and raw bus topics.

use crate::middleware::UserContext;
use crate::AppState;
use axum::{
    extract::{Extension, Path},
    response::{
        sse::{Event, KeepAlive},
        Sse,
    },
};
use futures_util::stream::{self, Stream, StreamExt};
use geomesh_channels::{ChannelRouter, PushChannelHandle};
use geomesh_types::{Envelope, JsonMap};
use serde_json::json;
use std::{convert::Infallible, sync::Arc};
use uuid::Uuid;

/// Closes the push channel it was opened for once the stream is dropped.
struct PushChannelGuard {
    router: ChannelRouter,
    user_id: String,
    channel_id: Uuid,
}

impl Drop for PushChannelGuard {
    fn drop(&mut self) {
        // A newer stream may have reopened the channel; leave that one alone.
        if self
            .router
            .close_push_channel_if(&self.user_id, self.channel_id)
        {
            tracing::debug!(user_id = %self.user_id, "push stream ended");
        }
    }
}

fn envelope_event(envelope: &Envelope) -> Option<Event> {
    match serde_json::to_string(envelope) {
        Ok(data) => Some(Event::default().data(data)),
        Err(e) => {
            tracing::error!(kind = %envelope.kind, error = %e, "failed to serialize push envelope");
            None
        }
    }
}

/// Handler for `GET /api/user/sse`.
///
/// Opens (or joins) the caller's push channel and streams its envelopes,
/// starting with a `connected` envelope.
pub async fn user_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user_id)): Extension<UserContext>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let handle = state.router.open_push_channel(&user_id);
    tracing::info!(user_id = %user_id, "push stream connected");

    let mut hello = JsonMap::new();
    hello.insert("user_id".into(), json!(user_id));
    hello.insert("message".into(), json!("push channel ready"));
    let first = envelope_event(&Envelope::new("connected", hello, None));

    let guard = PushChannelGuard {
        router: state.router.clone(),
        user_id,
        channel_id: handle.id(),
    };
    let envelopes = stream::unfold(
        (handle, guard),
        |(handle, guard): (PushChannelHandle, PushChannelGuard)| async move {
            let envelope = handle.recv().await?;
            Some((envelope, (handle, guard)))
        },
    );

    let events = stream::iter(first)
        .chain(envelopes.filter_map(|env| async move { envelope_event(&env) }))
        .map(Ok::<_, Infallible>)
        .take_until(state.shutdown.clone().cancelled_owned());

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// Handler for `GET /api/events/{topic}`.
///
/// Streams every payload published on `topic` after the subscription.
pub async fn topic_stream_handler(
    Extension(state): Extension<Arc<AppState>>,
    Path(topic): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    tracing::debug!(topic = %topic, "topic stream subscribed");
    let subscription = state.bus.subscribe(topic);

    let events = subscription
        .filter_map(|message| async move {
            match serde_json::to_string(&message.payload) {
                Ok(data) => Some(Ok(Event::default().data(data))),
                Err(e) => {
                    tracing::error!(topic = %message.topic, error = %e, "failed to serialize bus payload");
                    None
                }
            }
        })
        .take_until(state.shutdown.clone().cancelled_owned());

    Sse::new(events).keep_alive(KeepAlive::default())
}
