//! `GET /stream/relay` (§4.5, §6): WebSocket upgrade, handshake validation,
//! connect-rate limiting, then handoff to the relay hub for the lifetime of
//! the connection.

use crate::errors::ApiError;
use crate::relay::protocol::{close_code, RelayHandshake};
use crate::relay::validate_handshake;
use crate::AppState;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Query, State};
use axum::response::Response;
use std::net::SocketAddr;
use tracing::warn;

pub async fn relay_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(handshake): Query<RelayHandshake>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, peer, handshake))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, peer: SocketAddr, handshake: RelayHandshake) {
    if !state
        .relay
        .check_connect_rate(peer.ip(), &handshake.user_id, &handshake.session_id)
    {
        close_with(&mut socket, close_code::RATE_LIMITED, "rate_limited").await;
        return;
    }

    let validated = validate_handshake(&state.stream_tokens, &handshake).await;
    let (role, _pc, _session) = match validated {
        Ok(ok) => ok,
        Err(err) => {
            let (code, reason) = close_code_for(&err);
            warn!(user_id = %handshake.user_id, session_id = %handshake.session_id, reason, "relay handshake rejected");
            close_with(&mut socket, code, reason).await;
            return;
        }
    };

    state
        .relay
        .run_peer(socket, role, handshake.user_id, handshake.stream_id)
        .await;
}

fn close_code_for(err: &ApiError) -> (u16, &'static str) {
    match err {
        ApiError::TokenInvalid | ApiError::TokenExpired | ApiError::TokenConsumed => {
            (close_code::TOKEN_INVALID, "token_invalid")
        }
        ApiError::SessionNotActive => (close_code::SESSION_NOT_ACTIVE, "session_not_active"),
        ApiError::Forbidden | ApiError::BadRequest(_) => (close_code::ROLE_MISMATCH, "role_mismatch"),
        _ => (close_code::ROOM_CLOSED, "room_closed"),
    }
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    use futures_util::SinkExt;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
