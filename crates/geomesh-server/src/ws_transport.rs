//! WebSocket-backed session transport.
//!
//! An offer is a one-time WebSocket URL. When the client connects to it the
//! upgrade handler parks the socket's frame queues under the offer id and
//! asks the router to complete the session, which takes them back out
//! through [`TransportNegotiator::complete`].

use futures_util::future::BoxFuture;
use geomesh_channels::{ConnectionOffer, DataLink, RemoteAnswer, TransportError, TransportNegotiator};
use geomesh_types::sync::{read_or_recover, write_or_recover};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// Path the client opens to answer an offer.
pub const SESSION_WS_PATH: &str = "/api/user/session/ws";

struct PendingOffer {
    user_id: String,
    link: Option<DataLink>,
}

/// Hands out WebSocket offers and matches upgrades to them.
pub struct WsNegotiator {
    capacity: usize,
    pending: RwLock<HashMap<String, PendingOffer>>,
}

impl WsNegotiator {
    /// `capacity` bounds each direction of every link.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            pending: RwLock::new(HashMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The user an outstanding offer was issued to.
    pub fn offer_user(&self, offer_id: &str) -> Option<String> {
        read_or_recover(&self.pending, "ws_offers")
            .get(offer_id)
            .map(|p| p.user_id.clone())
    }

    /// Stores the socket side of a link until the router completes the offer.
    pub fn park(&self, offer_id: &str, link: DataLink) -> bool {
        match write_or_recover(&self.pending, "ws_offers").get_mut(offer_id) {
            Some(pending) => {
                pending.link = Some(link);
                true
            }
            None => false,
        }
    }

    /// Forgets an offer, e.g. after a failed completion.
    pub fn discard(&self, offer_id: &str) {
        write_or_recover(&self.pending, "ws_offers").remove(offer_id);
    }

    pub fn pending_offers(&self) -> usize {
        read_or_recover(&self.pending, "ws_offers").len()
    }
}

impl TransportNegotiator for WsNegotiator {
    fn create_offer(&self, user_id: &str) -> Result<ConnectionOffer, TransportError> {
        let offer_id = Uuid::new_v4().to_string();
        let mut pending = write_or_recover(&self.pending, "ws_offers");
        // A user holds at most one outstanding offer.
        pending.retain(|_, p| p.user_id != user_id);
        pending.insert(
            offer_id.clone(),
            PendingOffer {
                user_id: user_id.to_string(),
                link: None,
            },
        );
        Ok(ConnectionOffer {
            description: format!("{SESSION_WS_PATH}?offer_id={offer_id}"),
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
            let mut pending = write_or_recover(&self.pending, "ws_offers");
            match pending.remove(&offer.offer_id) {
                Some(PendingOffer {
                    link: Some(link), ..
                }) => Ok(link),
                Some(entry) => {
                    pending.insert(offer.offer_id.clone(), entry);
                    Err(TransportError::Negotiation(
                        "no socket attached to offer".to_string(),
                    ))
                }
                None => Err(TransportError::UnknownOffer(offer.offer_id.clone())),
            }
        };
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn link() -> DataLink {
        let (outbound, _) = mpsc::channel(1);
        let (_, inbound) = mpsc::channel(1);
        DataLink { outbound, inbound }
    }

    fn answer(offer: &ConnectionOffer) -> RemoteAnswer {
        RemoteAnswer {
            offer_id: offer.offer_id.clone(),
            description: String::new(),
        }
    }

    #[test]
    fn offer_points_at_socket_path() {
        let n = WsNegotiator::new(8);
        let offer = n.create_offer("u1").unwrap();
        assert!(offer
            .description
            .starts_with("/api/user/session/ws?offer_id="));
        assert_eq!(n.offer_user(&offer.offer_id).as_deref(), Some("u1"));
    }

    #[test]
    fn new_offer_replaces_users_previous_offer() {
        let n = WsNegotiator::new(8);
        let first = n.create_offer("u1").unwrap();
        let second = n.create_offer("u1").unwrap();
        n.create_offer("u2").unwrap();
        assert!(n.offer_user(&first.offer_id).is_none());
        assert!(n.offer_user(&second.offer_id).is_some());
        assert_eq!(n.pending_offers(), 2);
    }

    #[tokio::test]
    async fn complete_requires_parked_socket() {
        let n = WsNegotiator::new(8);
        let offer = n.create_offer("u1").unwrap();

        let err = n.complete(&offer, answer(&offer)).await.err().unwrap();
        assert!(matches!(err, TransportError::Negotiation(_)));

        assert!(n.park(&offer.offer_id, link()));
        assert!(n.complete(&offer, answer(&offer)).await.is_ok());
        assert_eq!(n.pending_offers(), 0);

        let err = n.complete(&offer, answer(&offer)).await.err().unwrap();
        assert!(matches!(err, TransportError::UnknownOffer(_)));
    }

    #[test]
    fn park_on_unknown_offer_fails() {
        let n = WsNegotiator::new(8);
        assert!(!n.park("nope", link()));
    }
}
