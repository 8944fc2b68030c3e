use geomesh_types::Envelope;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Producer side of a user's push channel, held by the router.
pub(crate) struct PushChannel {
    pub(crate) id: Uuid,
    pub(crate) tx: mpsc::Sender<Envelope>,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
}

impl PushChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            id: Uuid::new_v4(),
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    pub(crate) fn handle(&self, user_id: &str) -> PushChannelHandle {
        PushChannelHandle {
            id: self.id,
            user_id: user_id.to_string(),
            rx: Arc::clone(&self.rx),
        }
    }
}

/// Consumer side of a push channel.
///
/// Every handle returned for the same open channel shares one queue, so
/// each envelope is delivered to exactly one reader.
#[derive(Clone)]
pub struct PushChannelHandle {
    id: Uuid,
    user_id: String,
    rx: Arc<Mutex<mpsc::Receiver<Envelope>>>,
}

impl PushChannelHandle {
    /// Identifies the channel instance; a reopened channel gets a new id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Next envelope, or `None` once the channel is closed and drained.
    pub async fn recv(&self) -> Option<Envelope> {
        self.rx.lock().await.recv().await
    }

    /// Returns a queued envelope without waiting.
    pub fn try_recv(&self) -> Option<Envelope> {
        self.rx.try_lock().ok()?.try_recv().ok()
    }
}
