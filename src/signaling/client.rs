//! Broadcaster-side signaling client
//!
//! The appliance keeps one connection to the broker, joins its room as the
//! broadcaster, and watches its own presence feed: the first viewer arriving
//! and the last viewer leaving are the signals that preempt or release the
//! capture pipeline. SDP/ICE traffic addressed to the broadcaster is handed
//! to a pluggable [`SignalHandler`] so the media stack stays out of this
//! module.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, warn};

use super::types::{ClientSummary, IceCandidateInit, Role, SignalMessage};
use crate::error::{AppError, Result};

/// Viewer-presence edges delivered to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceSignal {
    /// Viewer count went 0 -> >= 1
    ViewersPresent,
    /// Viewer count returned to 0
    ViewersGone,
}

/// Outbound handle a [`SignalHandler`] uses to answer the broker
#[derive(Clone)]
pub struct SignalOutbox {
    tx: mpsc::UnboundedSender<SignalMessage>,
}

impl SignalOutbox {
    pub fn send(&self, message: SignalMessage) {
        let _ = self.tx.send(message);
    }
}

/// Hook for the media stack: offers and trickled candidates addressed to
/// the broadcaster land here
#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn on_offer(&self, from: &str, sdp: &str, outbox: &SignalOutbox);
    async fn on_ice_candidate(
        &self,
        from: &str,
        candidate: IceCandidateInit,
        outbox: &SignalOutbox,
    );
}

/// Drops media traffic; presence tracking still works without a peer stack
pub struct NullSignalHandler;

#[async_trait]
impl SignalHandler for NullSignalHandler {
    async fn on_offer(&self, from: &str, _sdp: &str, _outbox: &SignalOutbox) {
        warn!(from, "no media handler installed, dropping offer");
    }

    async fn on_ice_candidate(
        &self,
        from: &str,
        _candidate: IceCandidateInit,
        _outbox: &SignalOutbox,
    ) {
        debug!(from, "no media handler installed, dropping ICE candidate");
    }
}

/// Tracks which connections are viewers and derives presence edges
#[derive(Default)]
struct ViewerRoster {
    viewers: HashSet<String>,
}

impl ViewerRoster {
    /// Replace the roster from a `joined` membership snapshot
    fn sync(&mut self, clients: &[ClientSummary], self_id: Option<&str>) -> Option<PresenceSignal> {
        let had_viewers = !self.viewers.is_empty();
        self.viewers = clients
            .iter()
            .filter(|c| c.role == Role::Viewer && Some(c.client_id.as_str()) != self_id)
            .map(|c| c.client_id.clone())
            .collect();

        match (had_viewers, self.viewers.is_empty()) {
            (false, false) => Some(PresenceSignal::ViewersPresent),
            (true, true) => Some(PresenceSignal::ViewersGone),
            _ => None,
        }
    }

    fn joined(&mut self, client_id: &str, role: Role) -> Option<PresenceSignal> {
        if role != Role::Viewer {
            return None;
        }
        if self.viewers.insert(client_id.to_string()) && self.viewers.len() == 1 {
            Some(PresenceSignal::ViewersPresent)
        } else {
            None
        }
    }

    fn left(&mut self, client_id: &str) -> Option<PresenceSignal> {
        if self.viewers.remove(client_id) && self.viewers.is_empty() {
            Some(PresenceSignal::ViewersGone)
        } else {
            None
        }
    }
}

/// The signaling connection owned by the controller
pub struct SignalingClient {
    url: String,
    auth_token: String,
    room_id: String,
    reconnect_backoff: Duration,
    presence_tx: mpsc::Sender<PresenceSignal>,
    handler: Arc<dyn SignalHandler>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SignalingClient {
    pub fn new(
        url: String,
        auth_token: String,
        room_id: String,
        reconnect_backoff: Duration,
        presence_tx: mpsc::Sender<PresenceSignal>,
        handler: Arc<dyn SignalHandler>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            url,
            auth_token,
            room_id,
            reconnect_backoff,
            presence_tx,
            handler,
            shutdown_tx,
        }
    }

    /// Run until shutdown, reconnecting with a fixed backoff. An auth
    /// rejection terminates the client instead of retrying.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                result = self.run_session() => match result {
                    Ok(()) => info!("signaling session closed"),
                    Err(AppError::Auth(reason)) => {
                        warn!(%reason, "signaling auth rejected, giving up");
                        break;
                    }
                    Err(e) => warn!("signaling session error: {}", e),
                },
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.reconnect_backoff) => {}
            }
        }

        info!("signaling client stopped");
    }

    async fn run_session(&self) -> Result<()> {
        let url = format!(
            "{}?token={}",
            self.url,
            urlencoding::encode(&self.auth_token)
        );
        info!(url = %self.url, room_id = %self.room_id, "connecting to signaling server");

        let (ws, _) = connect_async(&url)
            .await
            .map_err(|e| AppError::Transport(format!("signaling connect failed: {}", e)))?;
        let (mut sink, mut stream) = ws.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let outbox = SignalOutbox { tx: out_tx };

        let mut roster = ViewerRoster::default();
        let mut client_id: Option<String> = None;

        loop {
            tokio::select! {
                Some(outgoing) = out_rx.recv() => {
                    let text = serde_json::to_string(&outgoing)?;
                    sink.send(WsMessage::Text(text)).await.map_err(|e| {
                        AppError::Transport(format!("signaling send failed: {}", e))
                    })?;
                }
                frame = stream.next() => match frame {
                    None => return Ok(()),
                    Some(Err(e)) => {
                        return Err(AppError::Transport(format!("signaling read failed: {}", e)));
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        match serde_json::from_str::<SignalMessage>(&text) {
                            Ok(message) => {
                                self.handle_message(message, &outbox, &mut roster, &mut client_id)
                                    .await;
                            }
                            Err(e) => warn!("ignoring malformed signaling frame: {}", e),
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        if let Some(frame) = &frame {
                            let code = u16::from(frame.code);
                            if code == 3000 || code == 3003 {
                                return Err(AppError::Auth(frame.reason.to_string()));
                            }
                        }
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    async fn handle_message(
        &self,
        message: SignalMessage,
        outbox: &SignalOutbox,
        roster: &mut ViewerRoster,
        client_id: &mut Option<String>,
    ) {
        match message {
            SignalMessage::Registered { client_id: id } => {
                info!(%id, "registered with signaling server, joining room");
                *client_id = Some(id);
                outbox.send(SignalMessage::Join {
                    room_id: self.room_id.clone(),
                    role: Role::Broadcaster,
                });
            }
            SignalMessage::Joined { clients, .. } => {
                info!(room_id = %self.room_id, clients = clients.len(), "joined room as broadcaster");
                if let Some(edge) = roster.sync(&clients, client_id.as_deref()) {
                    self.emit(edge).await;
                }
            }
            SignalMessage::ClientJoined {
                client_id: who,
                role,
                ..
            } => {
                debug!(%who, %role, "peer joined room");
                if let Some(edge) = roster.joined(&who, role) {
                    self.emit(edge).await;
                }
            }
            SignalMessage::ClientLeft { client_id: who, .. } => {
                debug!(%who, "peer left room");
                if let Some(edge) = roster.left(&who) {
                    self.emit(edge).await;
                }
            }
            SignalMessage::Offer {
                sdp,
                client_id: from,
                ..
            } => {
                let from = from.unwrap_or_default();
                self.handler.on_offer(&from, &sdp, outbox).await;
            }
            SignalMessage::IceCandidate {
                candidate,
                client_id: from,
                ..
            } => {
                let from = from.unwrap_or_default();
                self.handler.on_ice_candidate(&from, candidate, outbox).await;
            }
            SignalMessage::Error { message } => {
                warn!(%message, "signaling server reported an error");
            }
            other => debug!(message = ?other, "ignoring signaling message"),
        }
    }

    async fn emit(&self, edge: PresenceSignal) {
        debug!(?edge, "viewer presence edge");
        if self.presence_tx.send(edge).await.is_err() {
            warn!("presence consumer gone, dropping edge");
        }
    }
}
