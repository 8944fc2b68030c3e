//! Per-user delivery: a push-only stream and a bidirectional RPC session.
//!
//! The [`ChannelRouter`] owns both endpoints for every user. Push channels
//! are bounded queues drained by the HTTP layer (server-sent events).
//! Sessions are negotiated through a [`TransportNegotiator`]; once connected
//! they carry outbound envelopes and inbound [`RpcRequest`](geomesh_types::RpcRequest)s
//! that are dispatched through an [`RpcTable`].

mod error;
mod push;
mod router;
pub mod rpc;
mod session;
mod timers;
pub mod transport;

pub use error::{RouterError, TransportError};
pub use push::PushChannelHandle;
pub use router::{ChannelRouter, RouterOptions, DEFAULT_PUSH_CAPACITY};
pub use rpc::{RpcCall, RpcError, RpcOutcome, RpcTable};
pub use session::SessionState;
pub use timers::TimerHandle;
pub use transport::{ConnectionOffer, DataLink, RemoteAnswer, TransportNegotiator};
