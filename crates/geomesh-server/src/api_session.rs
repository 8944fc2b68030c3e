//! Session handlers: offer creation, the WebSocket answer/transport, status
//! and explicit disconnect.

use crate::middleware::UserContext;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Extension, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use futures_util::{SinkExt, StreamExt};
use geomesh_channels::{DataLink, RemoteAnswer, SessionState};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Deserialize)]
pub struct AnswerParams {
    pub offer_id: String,
}

/// Handler for `POST /api/user/session/connect`.
///
/// Replaces any existing session for the caller and returns the offer.
pub async fn connect_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user_id)): Extension<UserContext>,
) -> Result<Json<Value>, StatusCode> {
    let offer = state.router.open_session(&user_id).map_err(|e| {
        tracing::error!(user_id = %user_id, error = %e, "failed to open session");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(json!({
        "user_id": user_id,
        "offer": offer,
    })))
}

/// Handler for `GET /api/user/session`.
pub async fn status_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user_id)): Extension<UserContext>,
) -> Result<Json<Value>, StatusCode> {
    let session_state = state
        .router
        .session_state(&user_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(json!({
        "user_id": user_id,
        "state": session_state.as_str(),
        "last_activity": state.router.last_activity(&user_id),
    })))
}

/// Handler for `DELETE /api/user/session`.
pub async fn disconnect_handler(
    Extension(state): Extension<Arc<AppState>>,
    Extension(UserContext(user_id)): Extension<UserContext>,
) -> Result<Json<Value>, StatusCode> {
    if !state.router.disconnect_session(&user_id) {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(Json(json!({ "success": true })))
}

/// Handler for `GET /api/user/session/ws?offer_id=...`.
///
/// Answers an outstanding offer by upgrading to a WebSocket that then
/// carries the session's frames. The offer id identifies the user.
pub async fn ws_answer_handler(
    Extension(state): Extension<Arc<AppState>>,
    Query(params): Query<AnswerParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(user_id) = state.negotiator.offer_user(&params.offer_id) else {
        tracing::warn!(offer_id = %params.offer_id, "session answer for unknown offer");
        return StatusCode::NOT_FOUND.into_response();
    };
    if state.router.session_state(&user_id) != Some(SessionState::OfferSent) {
        tracing::warn!(user_id = %user_id, "session answer without a pending offer");
        return StatusCode::CONFLICT.into_response();
    }

    ws.on_upgrade(move |socket| run_session_socket(socket, state, user_id, params.offer_id))
}

async fn run_session_socket(socket: WebSocket, state: Arc<AppState>, user_id: String, offer_id: String) {
    let capacity = state.negotiator.capacity();
    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(capacity);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(capacity);

    if !state.negotiator.park(
        &offer_id,
        DataLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        },
    ) {
        tracing::warn!(user_id = %user_id, "offer withdrawn before socket attached");
        return;
    }

    let answer = RemoteAnswer {
        offer_id: offer_id.clone(),
        description: String::new(),
    };
    if let Err(e) = state.router.complete_session(&user_id, answer).await {
        tracing::warn!(user_id = %user_id, error = %e, "session negotiation failed");
        state.negotiator.discard(&offer_id);
        return;
    }

    let (mut sender, mut receiver) = socket.split();

    // Router -> client. Ends when the router drops the session's link.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            if sender.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.send(WsMessage::Close(None)).await;
    });

    // Client -> router. Dropping `inbound_tx` is the teardown signal.
    let recv_user = user_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            let frame = match msg {
                WsMessage::Text(text) => text.to_string(),
                WsMessage::Binary(bytes) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => text,
                    Err(_) => {
                        tracing::debug!(user_id = %recv_user, "ignoring non-utf8 binary frame");
                        continue;
                    }
                },
                WsMessage::Close(_) => break,
                _ => continue,
            };
            if inbound_tx.send(frame).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
    tracing::info!(user_id = %user_id, "session socket closed");
}
