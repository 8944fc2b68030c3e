use crate::push::PushChannel;
use crate::session::Session;
use crate::timers::spawn_interval;
use crate::{
    ConnectionOffer, PushChannelHandle, RemoteAnswer, RouterError, RpcCall, RpcTable,
    SessionState, TimerHandle, TransportNegotiator,
};
use chrono::{DateTime, Utc};
use geomesh_spatial::SpatialStore;
use geomesh_types::sync::{read_or_recover, write_or_recover};
use geomesh_types::{Envelope, JsonMap, Presence, RpcRequest, RpcResponse};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Push queue capacity used by [`RouterOptions::default`].
pub const DEFAULT_PUSH_CAPACITY: usize = 100;

/// Construction options for a [`ChannelRouter`].
pub struct RouterOptions {
    pub push_capacity: usize,
    /// Refreshed to online/offline as sessions connect and drop.
    pub presence: Option<Arc<SpatialStore>>,
    /// Parent of every session token; cancelling it tears all sessions down.
    pub shutdown: CancellationToken,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            push_capacity: DEFAULT_PUSH_CAPACITY,
            presence: None,
            shutdown: CancellationToken::new(),
        }
    }
}

struct RouterInner {
    push: RwLock<HashMap<String, PushChannel>>,
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    negotiator: Arc<dyn TransportNegotiator>,
    rpc: Arc<RpcTable>,
    presence: Option<Arc<SpatialStore>>,
    push_capacity: usize,
    shutdown: CancellationToken,
}

/// Per-user push channels and sessions. Clones share state.
#[derive(Clone)]
pub struct ChannelRouter {
    inner: Arc<RouterInner>,
}

impl ChannelRouter {
    pub fn new(
        negotiator: Arc<dyn TransportNegotiator>,
        rpc: Arc<RpcTable>,
        options: RouterOptions,
    ) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                push: RwLock::new(HashMap::new()),
                sessions: RwLock::new(HashMap::new()),
                negotiator,
                rpc,
                presence: options.presence,
                push_capacity: options.push_capacity.max(1),
                shutdown: options.shutdown,
            }),
        }
    }

    // ----- push channels -----

    /// Returns the user's push channel, creating it if none is open.
    pub fn open_push_channel(&self, user_id: &str) -> PushChannelHandle {
        let mut push = write_or_recover(&self.inner.push, "push_channels");
        let channel = push.entry(user_id.to_string()).or_insert_with(|| {
            tracing::info!(user_id = %user_id, "push channel opened");
            PushChannel::new(self.inner.push_capacity)
        });
        channel.handle(user_id)
    }

    /// Queues an envelope on the user's push channel.
    ///
    /// Returns `false` without waiting when no channel is open or its queue
    /// is full.
    pub fn send_push(
        &self,
        user_id: &str,
        kind: &str,
        data: JsonMap,
        request_id: Option<String>,
    ) -> bool {
        let push = read_or_recover(&self.inner.push, "push_channels");
        let Some(channel) = push.get(user_id) else {
            return false;
        };
        match channel.tx.try_send(Envelope::new(kind, data, request_id)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(user_id = %user_id, kind = %kind, "push queue full, dropping message");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Closes the user's push channel. Queued envelopes stay readable.
    pub fn close_push_channel(&self, user_id: &str) -> bool {
        let removed = write_or_recover(&self.inner.push, "push_channels")
            .remove(user_id)
            .is_some();
        if removed {
            tracing::info!(user_id = %user_id, "push channel closed");
        }
        removed
    }

    /// Closes the push channel only if it is still the instance `channel_id`.
    pub fn close_push_channel_if(&self, user_id: &str, channel_id: Uuid) -> bool {
        let mut push = write_or_recover(&self.inner.push, "push_channels");
        if push.get(user_id).is_some_and(|c| c.id == channel_id) {
            push.remove(user_id);
            tracing::info!(user_id = %user_id, "push channel closed");
            return true;
        }
        false
    }

    pub fn has_push_channel(&self, user_id: &str) -> bool {
        read_or_recover(&self.inner.push, "push_channels").contains_key(user_id)
    }

    // ----- sessions -----

    /// Creates a session in `OfferSent` and returns its offer.
    ///
    /// Any existing session for the user is torn down first.
    pub fn open_session(&self, user_id: &str) -> Result<ConnectionOffer, RouterError> {
        let offer = self.inner.negotiator.create_offer(user_id)?;
        let session = Arc::new(Session::new(
            user_id,
            offer.clone(),
            self.inner.shutdown.child_token(),
        ));

        let previous = write_or_recover(&self.inner.sessions, "sessions")
            .insert(user_id.to_string(), session);
        if let Some(previous) = previous {
            if previous.disconnect().is_some() {
                tracing::info!(user_id = %user_id, "replaced existing session");
            }
        }

        tracing::info!(user_id = %user_id, offer_id = %offer.offer_id, "session offer created");
        Ok(offer)
    }

    /// Completes negotiation and starts serving the session.
    ///
    /// On success a `welcome` envelope is sent and the user's presence is
    /// refreshed to online if a location is known.
    pub async fn complete_session(
        &self,
        user_id: &str,
        answer: RemoteAnswer,
    ) -> Result<(), RouterError> {
        let session = self
            .current_session(user_id)
            .ok_or_else(|| RouterError::NoSession(user_id.to_string()))?;
        let state = session.state();
        if state != SessionState::OfferSent {
            return Err(RouterError::InvalidState {
                user_id: user_id.to_string(),
                state,
            });
        }
        if answer.offer_id != session.offer.offer_id {
            return Err(RouterError::OfferMismatch);
        }

        let link = self
            .inner
            .negotiator
            .complete(&session.offer, answer)
            .await?;

        let still_current = self
            .current_session(user_id)
            .is_some_and(|current| Arc::ptr_eq(&current, &session));
        if !still_current || !session.connect(link.outbound) {
            return Err(RouterError::Superseded(user_id.to_string()));
        }

        tracing::info!(user_id = %user_id, session_id = %session.id, "session connected");
        self.spawn_reader(Arc::clone(&session), link.inbound);

        let mut welcome = JsonMap::new();
        welcome.insert("message".into(), json!("Connected to your dedicated session"));
        welcome.insert("user_id".into(), json!(user_id));
        self.send_to_session(user_id, "welcome", welcome, None);

        if let Some(presence) = &self.inner.presence {
            presence.set_presence(user_id, Presence::Online);
        }
        Ok(())
    }

    /// Sends an envelope over the user's session if it is connected.
    pub fn send_to_session(
        &self,
        user_id: &str,
        kind: &str,
        data: JsonMap,
        request_id: Option<String>,
    ) -> bool {
        let Some(session) = self.current_session(user_id) else {
            return false;
        };
        if session.state() != SessionState::Connected {
            return false;
        }
        match serde_json::to_string(&Envelope::new(kind, data, request_id)) {
            Ok(frame) => session.send_frame(frame),
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "failed to encode envelope");
                false
            }
        }
    }

    /// Tears the user's session down. Presence is refreshed to offline
    /// only when the session had connected.
    ///
    /// Returns `false` if there was no live session.
    pub fn disconnect_session(&self, user_id: &str) -> bool {
        match self.current_session(user_id) {
            Some(session) => self.teardown(&session),
            None => false,
        }
    }

    pub fn session_state(&self, user_id: &str) -> Option<SessionState> {
        self.current_session(user_id).map(|s| s.state())
    }

    pub fn last_activity(&self, user_id: &str) -> Option<DateTime<Utc>> {
        self.current_session(user_id).map(|s| s.last_activity())
    }

    /// Runs `callback` every `period` for as long as the user's current
    /// session lives. Returns `None` if the user has no live session.
    pub fn schedule_interval<F>(
        &self,
        user_id: &str,
        period: Duration,
        callback: F,
    ) -> Option<TimerHandle>
    where
        F: FnMut() + Send + 'static,
    {
        let session = self.current_session(user_id)?;
        if session.state() == SessionState::Disconnected {
            return None;
        }
        Some(spawn_interval(
            user_id.to_string(),
            period,
            session.cancel.child_token(),
            callback,
        ))
    }

    /// Cancels every session and closes every push channel.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let sessions: Vec<_> = read_or_recover(&self.inner.sessions, "sessions")
            .values()
            .cloned()
            .collect();
        for session in sessions {
            session.disconnect();
        }
        write_or_recover(&self.inner.push, "push_channels").clear();
        tracing::info!("channel router shut down");
    }

    fn current_session(&self, user_id: &str) -> Option<Arc<Session>> {
        read_or_recover(&self.inner.sessions, "sessions")
            .get(user_id)
            .cloned()
    }

    /// Disconnects `session`. Presence goes offline only if it had
    /// connected; an unanswered offer never marked the user online.
    fn teardown(&self, session: &Session) -> bool {
        let Some(left) = session.disconnect() else {
            return false;
        };
        tracing::info!(
            user_id = %session.user_id,
            session_id = %session.id,
            from = %left,
            "session disconnected"
        );
        if left == SessionState::Connected {
            if let Some(presence) = &self.inner.presence {
                presence.set_presence(&session.user_id, Presence::Offline);
            }
        }
        true
    }

    fn spawn_reader(&self, session: Arc<Session>, mut inbound: mpsc::Receiver<String>) {
        let router = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    frame = inbound.recv() => match frame {
                        Some(text) => {
                            session.touch();
                            router.handle_frame(&session, &text);
                        }
                        None => break,
                    },
                }
            }
            router.teardown(&session);
        });
    }

    fn handle_frame(&self, session: &Arc<Session>, text: &str) {
        match serde_json::from_str::<RpcRequest>(text) {
            Ok(request) => {
                tracing::debug!(
                    user_id = %session.user_id,
                    method = %request.method,
                    endpoint = %request.endpoint,
                    "rpc request"
                );
                let rpc = Arc::clone(&self.inner.rpc);
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    let call = RpcCall {
                        user_id: session.user_id.clone(),
                        request,
                    };
                    let response = rpc.dispatch(call).await;
                    send_response(&session, &response);
                });
            }
            Err(e) => match recover_request_id(text) {
                Some(request_id) => {
                    tracing::warn!(user_id = %session.user_id, error = %e, "malformed rpc request");
                    let response =
                        RpcResponse::failure(request_id, 400, format!("malformed request: {e}"));
                    send_response(session, &response);
                }
                None => {
                    tracing::warn!(user_id = %session.user_id, error = %e, "dropping unreadable frame");
                }
            },
        }
    }
}

fn send_response(session: &Session, response: &RpcResponse) {
    match serde_json::to_string(response) {
        Ok(frame) => {
            session.send_frame(frame);
        }
        Err(e) => {
            tracing::error!(user_id = %session.user_id, error = %e, "failed to encode rpc response");
        }
    }
}

/// Extracts a non-empty string `request_id` from an otherwise invalid frame.
fn recover_request_id(text: &str) -> Option<String> {
    let value: Value = serde_json::from_str(text).ok()?;
    value
        .get("request_id")?
        .as_str()
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackNegotiator;

    fn router() -> ChannelRouter {
        ChannelRouter::new(
            Arc::new(LoopbackNegotiator::new(16)),
            Arc::new(RpcTable::default()),
            RouterOptions {
                push_capacity: 2,
                ..RouterOptions::default()
            },
        )
    }

    fn data(key: &str, value: Value) -> JsonMap {
        let mut map = JsonMap::new();
        map.insert(key.into(), value);
        map
    }

    #[test]
    fn push_open_is_idempotent() {
        let r = router();
        let a = r.open_push_channel("u1");
        let b = r.open_push_channel("u1");
        assert_eq!(a.id(), b.id());

        assert!(r.send_push("u1", "notification", data("n", json!(1)), Some("r1".into())));
        let env = b.try_recv().expect("shared queue");
        assert_eq!(env.kind, "notification");
        assert_eq!(env.request_id.as_deref(), Some("r1"));
        assert!(a.try_recv().is_none());
    }

    #[test]
    fn push_to_missing_or_closed_channel_is_noop() {
        let r = router();
        assert!(!r.send_push("ghost", "x", JsonMap::new(), None));

        let handle = r.open_push_channel("u1");
        assert!(r.close_push_channel("u1"));
        assert!(!r.send_push("u1", "x", JsonMap::new(), None));
        assert!(handle.try_recv().is_none());
        assert!(!r.close_push_channel("u1"));
    }

    #[test]
    fn full_push_queue_drops() {
        let r = router();
        let handle = r.open_push_channel("u1");
        assert!(r.send_push("u1", "a", JsonMap::new(), None));
        assert!(r.send_push("u1", "b", JsonMap::new(), None));
        assert!(!r.send_push("u1", "c", JsonMap::new(), None));
        assert_eq!(handle.try_recv().unwrap().kind, "a");
        assert_eq!(handle.try_recv().unwrap().kind, "b");
        assert!(handle.try_recv().is_none());
    }

    #[test]
    fn close_if_ignores_replaced_channel() {
        let r = router();
        let old = r.open_push_channel("u1");
        r.close_push_channel("u1");
        let new = r.open_push_channel("u1");
        assert_ne!(old.id(), new.id());

        assert!(!r.close_push_channel_if("u1", old.id()));
        assert!(r.has_push_channel("u1"));
        assert!(r.close_push_channel_if("u1", new.id()));
        assert!(!r.has_push_channel("u1"));
    }

    #[test]
    fn session_send_is_noop_until_connected() {
        let r = router();
        assert!(!r.send_to_session("u1", "x", JsonMap::new(), None));
        r.open_session("u1").unwrap();
        assert_eq!(r.session_state("u1"), Some(SessionState::OfferSent));
        assert!(!r.send_to_session("u1", "x", JsonMap::new(), None));
    }

    #[test]
    fn request_id_recovery() {
        assert_eq!(
            recover_request_id(r#"{"request_id":"r-7","method":"PUT"}"#).as_deref(),
            Some("r-7")
        );
        assert!(recover_request_id(r#"{"request_id":""}"#).is_none());
        assert!(recover_request_id("not json").is_none());
        assert!(recover_request_id(r#"{"request_id":5}"#).is_none());
    }
}
