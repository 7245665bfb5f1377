//! WebSocket channel handler.
//!
//! Upgrade path for `/pages/{page_id}/channel`: validate the bearer token,
//! check the page grant, then relay frames between the socket and the
//! page's room until either side closes.

use axum::{
    extract::{
        Path, Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use lattice_core::session::RelayFrame;

use crate::auth::{AuthUser, TokenStore, extract_token};
use crate::room::RoomRegistry;

/// Query parameters for the channel upgrade
#[derive(Debug, Deserialize)]
pub struct ChannelQuery {
    /// Bearer token (browsers cannot set headers on WS upgrades)
    pub token: Option<String>,
}

/// Shared state for the channel handler
#[derive(Clone)]
pub struct AppState {
    pub tokens: Arc<TokenStore>,
    pub rooms: Arc<RoomRegistry>,
}

/// WebSocket upgrade handler
pub async fn channel_handler(
    State(state): State<AppState>,
    Path(page_id): Path<String>,
    Query(query): Query<ChannelQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    // Validate the credential before any data is relayed.
    let token = match extract_token(&headers, query.token.as_deref()) {
        Some(t) => t,
        None => {
            warn!("channel connection rejected: missing token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };
    let user = match state.tokens.validate(&token) {
        Some(u) => u,
        None => {
            warn!("channel connection rejected: invalid token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    // Authenticated but not permitted on this page: reject outright.
    if !state.tokens.is_permitted(&page_id, &user.user_id) {
        warn!(
            "channel connection rejected: user {} not permitted on page {}",
            user.user_id, page_id
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    info!("channel upgrade: user={}, page={}", user.user_id, page_id);
    ws.on_upgrade(move |socket| handle_socket(socket, state, user, page_id))
        .into_response()
}

/// Relay loop for an established connection
async fn handle_socket(socket: WebSocket, state: AppState, user: AuthUser, page_id: String) {
    let room = match state.rooms.get_or_create(&page_id).await {
        Ok(room) => room,
        Err(e) => {
            warn!("failed to open room {}: {}", page_id, e);
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (conn_id, initial_state, mut room_rx) = room.join();

    info!(
        "channel connected: user={}, page={}, connections={}",
        user.user_id,
        page_id,
        room.connection_count()
    );

    // First join loads the last persisted state; every join receives the
    // room's current merged document.
    if !initial_state.is_empty() {
        let frame = RelayFrame::Update {
            update: initial_state,
        };
        if let Ok(encoded) = frame.encode() {
            if ws_tx.send(Message::Text(encoded.into())).await.is_err() {
                room.leave(conn_id, &user.user_id).await;
                return;
            }
        }
    }

    loop {
        tokio::select! {
            // Frames from this participant
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Text(raw))) => {
                        match RelayFrame::decode(raw.as_str()) {
                            Ok(frame) => room.handle_frame(conn_id, frame),
                            Err(e) => warn!("dropping malformed frame from {}: {}", user.user_id, e),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_tx.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("client closed channel: user={}", user.user_id);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("channel error for {}: {}", user.user_id, e);
                        break;
                    }
                }
            }

            // Frames from the rest of the room
            broadcast = room_rx.recv() => {
                match broadcast {
                    Ok((sender_id, frame)) => {
                        if sender_id == conn_id {
                            continue;
                        }
                        let encoded = match frame.encode() {
                            Ok(e) => e,
                            Err(e) => {
                                warn!("failed to encode frame: {}", e);
                                continue;
                            }
                        };
                        if ws_tx.send(Message::Text(encoded.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        // Catch the laggard up with the full merged state.
                        warn!("connection {} lagged {} frames, resyncing", conn_id, n);
                        let frame = RelayFrame::Update { update: room.full_state() };
                        if let Ok(encoded) = frame.encode() {
                            if ws_tx.send(Message::Text(encoded.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    info!("channel disconnected: user={}, page={}", user.user_id, page_id);
    room.leave(conn_id, &user.user_id).await;
    state.rooms.maybe_remove(&page_id).await;
}
