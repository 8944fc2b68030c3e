use crate::SessionState;
use geomesh_types::RpcMethod;
use thiserror::Error;

/// Failures reported by a transport negotiator.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("unknown offer: {0}")]
    UnknownOffer(String),

    #[error("transport negotiation failed: {0}")]
    Negotiation(String),
}

/// Errors returned by [`ChannelRouter`](crate::ChannelRouter) session
/// management and [`RpcTable`](crate::RpcTable) construction.
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no session for user {0}")]
    NoSession(String),

    #[error("session for user {user_id} is {state}, expected offer-sent")]
    InvalidState {
        user_id: String,
        state: SessionState,
    },

    #[error("answer does not match the pending offer")]
    OfferMismatch,

    #[error("session for user {0} was replaced during negotiation")]
    Superseded(String),

    #[error("duplicate rpc route {method} {endpoint}")]
    DuplicateRoute { method: RpcMethod, endpoint: String },

    #[error(transparent)]
    Transport(#[from] TransportError),
}
