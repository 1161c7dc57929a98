//! WebSocket handler
//!
//! Binds an accepted socket to a session key in the registry and runs
//! the connection's read/write halves. The writer task drains the
//! registry channel into the socket and marks the connection closed on
//! transport failure; the reader answers liveness probes through the
//! regular delivery path and detaches the session on close.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use pushgate_core::models::{SessionIdentity, SessionKey, WsMessage};
use serde::Deserialize;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

use crate::server::AppState;

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Session key to bind. Server-generated when absent.
    pub key: Option<String>,
    /// Authenticated user id (optional, log enrichment only)
    pub user: Option<String>,
    /// User type (optional)
    pub user_type: Option<String>,
}

/// WebSocket handler for push delivery
///
/// Clients connect with an optional pre-assigned session key:
/// `ws://host/ws?key={session_key}&user={user_id}`
pub async fn websocket_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let session_key = query
        .key
        .map_or_else(SessionKey::new, SessionKey::from_string);

    let identity = query.user.map(|user_id| {
        SessionIdentity::new(
            user_id,
            query.user_type.unwrap_or_else(|| "user".to_string()),
        )
    });

    // Limit max message size to 64KB (default is far larger than any
    // control traffic this endpoint accepts)
    ws.max_message_size(64 * 1024)
        .on_upgrade(move |socket| handle_socket(socket, state, session_key, identity))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    session_key: SessionKey,
    identity: Option<SessionIdentity>,
) {
    let mut rx = match state.service.attach(session_key.clone(), identity) {
        Ok(rx) => rx,
        Err(e) => {
            warn!(
                session_key = %session_key,
                error = %e,
                "Rejecting WebSocket connection"
            );
            return;
        }
    };

    // The registry holds the open flag; the writer task below flips it
    // when the transport fails so routing stops targeting this socket.
    let Some(handle) = state.service.registry().get(&session_key) else {
        error!(session_key = %session_key, "Session vanished right after attach");
        return;
    };
    let open_flag = handle.open_flag();

    info!(session_key = %session_key, "WebSocket connection established");

    let (mut ws_sink, mut ws_stream) = socket.split();

    // Writer: registry channel -> socket
    let writer_key = session_key.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let frame = match message {
                WsMessage::Text(text) => Message::Text(text.into()),
                WsMessage::Binary(bytes) => Message::Binary(bytes.into()),
                WsMessage::Pong(payload) => Message::Pong(payload.into()),
            };
            if let Err(e) = ws_sink.send(frame).await {
                error!(
                    session_key = %writer_key,
                    error = %e,
                    "Failed to write WebSocket frame, marking connection closed"
                );
                open_flag.store(false, Ordering::Relaxed);
                break;
            }
        }
    });

    // Reader: probe responses and close handling. This endpoint is
    // push-only; inbound data frames are ignored.
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Ping(payload)) => {
                state.service.send_pong(&session_key, payload.to_vec());
            }
            Ok(Message::Close(_)) => {
                debug!(session_key = %session_key, "Client closed connection");
                break;
            }
            Ok(Message::Text(_) | Message::Binary(_)) => {
                debug!(session_key = %session_key, "Ignoring inbound data frame");
            }
            Ok(Message::Pong(_)) => {}
            Err(e) => {
                warn!(session_key = %session_key, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    state.service.detach(&session_key);
    writer.abort();

    info!(session_key = %session_key, "WebSocket connection closed");
}
