//! WebSocket endpoints
//!
//! Two sockets hang off the hub: `/api/ws/camera` (the device session,
//! framed envelope messages) and `/api/ws/webrtc` (the signaling socket for
//! broadcaster and viewers). Both authenticate with a bearer token on the
//! connect URL; a bad token closes the socket with code 3000 and no retry
//! is expected from the peer.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{CloseFrame, Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{Subject, APPLIANCE_SUBJECT};
use crate::messages::{AuthResultPayload, ErrorPayload, Message, MessageBody};
use crate::signaling::SignalMessage;
use crate::state::AppState;

/// Close code for rejected authentication
const CLOSE_UNAUTHORIZED: u16 = 3000;
/// Close code for an idle session
const CLOSE_TIMEOUT: u16 = 4008;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    token: String,
}

// ============================================================================
// Camera session (device <-> hub)
// ============================================================================

/// Upgrade handler for `/api/ws/camera`
pub async fn camera_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<TokenQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_camera_socket(socket, state, query.token))
}

async fn handle_camera_socket(mut socket: WebSocket, state: Arc<AppState>, token: String) {
    let subject = match state.tokens.verify_access(&token) {
        Ok(subject) => subject,
        Err(e) => {
            warn!("camera session rejected: {}", e);
            close_with(&mut socket, CLOSE_UNAUTHORIZED, "Unauthorized").await;
            return;
        }
    };

    let owner = state.config.get().owner_user_id;
    let user_id = subject.user_id(owner);
    info!(user_id, appliance = subject.is_appliance(), "camera session opened");

    // Greeting tells the device the session is live before it drains queues
    let greeting = Message::new(MessageBody::AuthResult(AuthResultPayload::ok()));
    if send_message(&mut socket, &greeting).await.is_err() {
        return;
    }

    let mut shutdown = state.shutdown_signal();

    loop {
        let inactivity =
            Duration::from_secs(state.config.get().timeouts.ws_inactivity_secs.max(1));

        let frame = tokio::select! {
            _ = shutdown.recv() => {
                let _ = socket.send(WsMessage::Close(None)).await;
                break;
            }
            frame = tokio::time::timeout(inactivity, socket.recv()) => frame,
        };

        match frame {
            Err(_elapsed) => {
                info!(user_id, "camera session idle, closing");
                close_with(&mut socket, CLOSE_TIMEOUT, "Connection timeout").await;
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                warn!(user_id, "camera session read error: {}", e);
                break;
            }
            Ok(Some(Ok(WsMessage::Text(text)))) => {
                match Message::from_json(&text) {
                    Ok(message) => {
                        debug!(user_id, msg_type = ?message.msg_type(), msg_id = %message.msg_id, "camera frame");
                        // Single reader: the next frame waits until this one
                        // is fully handled
                        if let Some(reply) = state.ingest.handle_message(user_id, &message).await {
                            if send_message(&mut socket, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        // Malformed frame: error reply, session stays open
                        let reply = Message::new(MessageBody::Error(ErrorPayload {
                            error: format!("invalid message: {}", e),
                        }));
                        if send_message(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                }
            }
            Ok(Some(Ok(WsMessage::Close(_)))) => break,
            Ok(Some(Ok(_))) => {}
        }
    }

    info!(user_id, "camera session closed");
}

async fn send_message(socket: &mut WebSocket, message: &Message) -> crate::Result<()> {
    let text = message.to_json()?;
    socket
        .send(WsMessage::Text(text))
        .await
        .map_err(|e| crate::AppError::Transport(e.to_string()))
}

async fn close_with(socket: &mut WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(WsMessage::Close(Some(CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        })))
        .await;
}

// ============================================================================
// Signaling socket (broadcaster + viewers <-> broker)
// ============================================================================

/// Upgrade handler for `/api/ws/webrtc`
pub async fn signaling_ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<TokenQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_signaling_socket(socket, state, query.token))
}

async fn handle_signaling_socket(mut socket: WebSocket, state: Arc<AppState>, token: String) {
    let subject = match state.tokens.verify_access(&token) {
        Ok(subject) => subject,
        Err(e) => {
            warn!("signaling session rejected: {}", e);
            close_with(&mut socket, CLOSE_UNAUTHORIZED, "Unauthorized").await;
            return;
        }
    };

    let user = match subject {
        Subject::Appliance => APPLIANCE_SUBJECT.to_string(),
        Subject::User(id) => id.to_string(),
    };
    let connection_id = Uuid::new_v4().to_string();

    let (mut ws_sink, mut ws_stream) = socket.split();

    // This task is the connection's single writer: broker traffic queues on
    // the channel, direct replies are written inline, both drain here
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
    state.broker.register(&connection_id, &user, out_tx);

    let mut shutdown = state.shutdown_signal();

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            Some(outgoing) = out_rx.recv() => {
                let Ok(text) = serde_json::to_string(&outgoing) else { continue };
                if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = ws_stream.next() => match frame {
                None => break,
                Some(Err(e)) => {
                    warn!(connection_id = %connection_id, "signaling read error: {}", e);
                    break;
                }
                Some(Ok(WsMessage::Text(text))) => {
                    let reply = match serde_json::from_str::<SignalMessage>(&text) {
                        Ok(message) => state.broker.handle_message(&connection_id, message),
                        Err(e) => Some(SignalMessage::error(format!("invalid message: {}", e))),
                    };
                    if let Some(reply) = reply {
                        let Ok(text) = serde_json::to_string(&reply) else { continue };
                        if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(WsMessage::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    }

    state.broker.unregister(&connection_id);
    info!(connection_id = %connection_id, "signaling session closed");
}
