//! Seam between the router and whatever carries session frames.
//!
//! A negotiator hands out an opaque [`ConnectionOffer`], and later turns the
//! client's [`RemoteAnswer`] into a [`DataLink`]: a pair of text-frame queues.
//! The link's inbound side ending is the transport's teardown signal.

use crate::TransportError;
use futures_util::future::BoxFuture;
use geomesh_types::sync::write_or_recover;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Offer artifact returned to the client when a session is opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOffer {
    pub offer_id: String,
    pub user_id: String,
    /// Negotiator-specific description (an SDP blob, a URL, ...).
    pub description: String,
}

/// The client's reply to a [`ConnectionOffer`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAnswer {
    pub offer_id: String,
    #[serde(default)]
    pub description: String,
}

/// An established bidirectional frame link.
pub struct DataLink {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<String>,
}

/// Creates offers and completes them into data links.
pub trait TransportNegotiator: Send + Sync {
    fn create_offer(&self, user_id: &str) -> Result<ConnectionOffer, TransportError>;

    fn complete(
        &self,
        offer: &ConnectionOffer,
        answer: RemoteAnswer,
    ) -> BoxFuture<'static, Result<DataLink, TransportError>>;
}

/// The client-side ends of a loopback link.
pub struct LoopbackPeer {
    /// Frames sent here arrive at the router as inbound frames.
    pub to_router: mpsc::Sender<String>,
    /// Frames the router sends over the session.
    pub from_router: mpsc::Receiver<String>,
}

/// In-process negotiator that links the router to a [`LoopbackPeer`].
pub struct LoopbackNegotiator {
    capacity: usize,
    peers: RwLock<HashMap<String, LoopbackPeer>>,
}

impl LoopbackNegotiator {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Takes the peer side of a completed offer.
    pub fn take_peer(&self, offer_id: &str) -> Option<LoopbackPeer> {
        write_or_recover(&self.peers, "loopback_peers").remove(offer_id)
    }
}

impl TransportNegotiator for LoopbackNegotiator {
    fn create_offer(&self, user_id: &str) -> Result<ConnectionOffer, TransportError> {
        let offer_id = Uuid::new_v4().to_string();
        Ok(ConnectionOffer {
            description: format!("loopback:{offer_id}"),
            offer_id,
            user_id: user_id.to_string(),
        })
    }

    fn complete(
        &self,
        offer: &ConnectionOffer,
        answer: RemoteAnswer,
    ) -> BoxFuture<'static, Result<DataLink, TransportError>> {
        let result = if answer.offer_id != offer.offer_id {
            Err(TransportError::UnknownOffer(answer.offer_id))
        } else {
            let (to_router, inbound) = mpsc::channel(self.capacity);
            let (outbound, from_router) = mpsc::channel(self.capacity);
            write_or_recover(&self.peers, "loopback_peers").insert(
                offer.offer_id.clone(),
                LoopbackPeer {
                    to_router,
                    from_router,
                },
            );
            Ok(DataLink { outbound, inbound })
        };
        Box::pin(async move { result })
    }
}
