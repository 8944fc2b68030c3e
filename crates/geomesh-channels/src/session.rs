use crate::ConnectionOffer;
use chrono::{DateTime, Utc};
use geomesh_types::sync::{read_or_recover, write_or_recover};
use serde::Serialize;
use std::sync::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Lifecycle of a user's session.
///
/// `OfferSent -> Connected -> Disconnected`; a fresh open replaces a
/// disconnected session with a new one in `OfferSent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    OfferSent,
    Connected,
    Disconnected,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OfferSent => "offer-sent",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct SessionInner {
    state: SessionState,
    last_activity: DateTime<Utc>,
    outbound: Option<mpsc::Sender<String>>,
}

pub(crate) struct Session {
    pub(crate) id: Uuid,
    pub(crate) user_id: String,
    pub(crate) offer: ConnectionOffer,
    /// Cancelled on teardown; timers and the reader task derive from it.
    pub(crate) cancel: CancellationToken,
    inner: RwLock<SessionInner>,
}

impl Session {
    pub(crate) fn new(user_id: &str, offer: ConnectionOffer, cancel: CancellationToken) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            offer,
            cancel,
            inner: RwLock::new(SessionInner {
                state: SessionState::OfferSent,
                last_activity: Utc::now(),
                outbound: None,
            }),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        read_or_recover(&self.inner, "session").state
    }

    pub(crate) fn last_activity(&self) -> DateTime<Utc> {
        read_or_recover(&self.inner, "session").last_activity
    }

    pub(crate) fn touch(&self) {
        write_or_recover(&self.inner, "session").last_activity = Utc::now();
    }

    /// Moves to `Connected` unless teardown already happened.
    pub(crate) fn connect(&self, outbound: mpsc::Sender<String>) -> bool {
        let mut inner = write_or_recover(&self.inner, "session");
        if inner.state != SessionState::OfferSent || self.cancel.is_cancelled() {
            return false;
        }
        inner.state = SessionState::Connected;
        inner.last_activity = Utc::now();
        inner.outbound = Some(outbound);
        true
    }

    /// Moves to `Disconnected`, dropping the outbound link and cancelling
    /// derived tasks. Returns the state it left, or `None` if it was
    /// already disconnected.
    pub(crate) fn disconnect(&self) -> Option<SessionState> {
        let left = {
            let mut inner = write_or_recover(&self.inner, "session");
            if inner.state == SessionState::Disconnected {
                return None;
            }
            inner.outbound = None;
            std::mem::replace(&mut inner.state, SessionState::Disconnected)
        };
        self.cancel.cancel();
        Some(left)
    }

    /// Queues a frame if connected. Never waits.
    pub(crate) fn send_frame(&self, frame: String) -> bool {
        let outbound = {
            let inner = read_or_recover(&self.inner, "session");
            match (&inner.state, &inner.outbound) {
                (SessionState::Connected, Some(tx)) => tx.clone(),
                _ => return false,
            }
        };
        match outbound.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(user_id = %self.user_id, "session queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::debug!(user_id = %self.user_id, "session link closed, dropping frame");
                false
            }
        }
    }
}
