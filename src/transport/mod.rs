//! Device-side transport to the hub
//!
//! A reconnecting WebSocket carrying the framed JSON envelope. Outbound
//! messages can register a reply future keyed by `msg_id`; the single reader
//! routes incoming frames first to pending reply futures, then to the
//! type-keyed handler registered for the message type. Handlers run to
//! completion before the next frame is read.
//!
//! On socket loss every pending reply future fails with a transport error,
//! the client sleeps the configured backoff and reconnects. An
//! authentication rejection (close code 3000/3003 or an HTTP 401/403 during
//! the handshake) terminates the client instead.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::messages::{Message, MessageBody, MessageType};

/// Keep-alive cadence; the hub closes sessions idle longer than a minute
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Handler for incoming messages of one type; a returned message is sent
/// back on the session
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: Message) -> Option<Message>;
}

/// Routes incoming messages to reply futures and registered handlers
#[derive(Default)]
struct Dispatcher {
    handlers: Mutex<HashMap<MessageType, Arc<dyn MessageHandler>>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Message>>>,
}

impl Dispatcher {
    fn register_handler(&self, msg_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.handlers.lock().insert(msg_type, handler);
    }

    fn register_reply(&self, msg_id: &str) -> oneshot::Receiver<Message> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(msg_id.to_string(), tx);
        rx
    }

    fn forget_reply(&self, msg_id: &str) {
        self.pending.lock().remove(msg_id);
    }

    /// Dispatch one incoming message; returns the handler's reply, if any
    async fn dispatch(&self, message: Message) -> Option<Message> {
        // Reply futures first
        if let Some(reply_to) = &message.reply_to {
            if let Some(tx) = self.pending.lock().remove(reply_to) {
                let _ = tx.send(message.clone());
            }
        }

        let handler = self.handlers.lock().get(&message.msg_type()).cloned();
        match handler {
            Some(handler) => handler.handle(message).await,
            None => None,
        }
    }

    /// Drop every pending reply future (its receiver sees a closed channel)
    fn fail_all_pending(&self) {
        let mut pending = self.pending.lock();
        if !pending.is_empty() {
            debug!(count = pending.len(), "cancelling pending replies");
        }
        pending.clear();
    }
}

/// Shared transport handle; cheap to clone
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

struct TransportInner {
    url: String,
    auth_token: String,
    reconnect_backoff: Duration,
    reply_timeout: Duration,
    dispatcher: Dispatcher,
    /// Writer for the current session, if connected
    session_tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    connected: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Transport {
    pub fn new(
        url: String,
        auth_token: String,
        reconnect_backoff: Duration,
        reply_timeout: Duration,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            inner: Arc::new(TransportInner {
                url,
                auth_token,
                reconnect_backoff,
                reply_timeout,
                dispatcher: Dispatcher::default(),
                session_tx: Mutex::new(None),
                connected: AtomicBool::new(false),
                shutdown_tx,
            }),
        }
    }

    /// Register a handler for a message type (replaces any previous one)
    pub fn register_handler(&self, msg_type: MessageType, handler: Arc<dyn MessageHandler>) {
        self.inner.dispatcher.register_handler(msg_type, handler);
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Relaxed)
    }

    /// Send a message on the current session
    ///
    /// Fails immediately when disconnected; events produced while the link
    /// is down are lost, the hub de-duplicates any the device chooses to
    /// resend.
    pub fn send(&self, message: Message) -> Result<()> {
        let guard = self.inner.session_tx.lock();
        match guard.as_ref() {
            Some(tx) if tx.send(message).is_ok() => Ok(()),
            _ => Err(AppError::Transport("not connected".to_string())),
        }
    }

    /// Send a message and await the reply correlated by `reply_to`
    pub async fn request(&self, message: Message) -> Result<Message> {
        let msg_id = message.msg_id.clone();
        let rx = self.inner.dispatcher.register_reply(&msg_id);

        if let Err(e) = self.send(message) {
            self.inner.dispatcher.forget_reply(&msg_id);
            return Err(e);
        }

        match tokio::time::timeout(self.inner.reply_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_closed)) => Err(AppError::Transport("connection closed".to_string())),
            Err(_elapsed) => {
                self.inner.dispatcher.forget_reply(&msg_id);
                Err(AppError::Transport(format!(
                    "no reply within {:?}",
                    self.inner.reply_timeout
                )))
            }
        }
    }

    /// Run the connect/read loop until shutdown or an auth rejection
    pub async fn run(&self) {
        let mut shutdown = self.inner.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                result = self.run_session() => {
                    self.inner.connected.store(false, Ordering::Relaxed);
                    *self.inner.session_tx.lock() = None;
                    self.inner.dispatcher.fail_all_pending();

                    match result {
                        Ok(()) => info!("hub session closed"),
                        Err(AppError::Auth(reason)) => {
                            warn!(%reason, "hub rejected credentials, giving up");
                            break;
                        }
                        Err(e) => warn!("hub session error: {}", e),
                    }
                }
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(self.inner.reconnect_backoff) => {
                    info!("reconnecting to hub");
                }
            }
        }

        info!("transport stopped");
    }

    async fn run_session(&self) -> Result<()> {
        let url = format!(
            "{}?token={}",
            self.inner.url,
            urlencoding::encode(&self.inner.auth_token)
        );
        info!(url = %self.inner.url, "connecting to hub");

        let (ws, _) = connect_async(&url).await.map_err(|e| match &e {
            tokio_tungstenite::tungstenite::Error::Http(response)
                if response.status().as_u16() == 401 || response.status().as_u16() == 403 =>
            {
                AppError::Auth(format!("handshake rejected: {}", response.status()))
            }
            _ => AppError::Transport(format!("connect failed: {}", e)),
        })?;
        let (mut sink, mut stream) = ws.split();

        // The hub confirms the session before we start draining queues
        let greeting = tokio::time::timeout(self.inner.reply_timeout, stream.next())
            .await
            .map_err(|_| AppError::Transport("no session greeting from hub".to_string()))?;
        match greeting {
            Some(Ok(WsMessage::Text(text))) => {
                let message = Message::from_json(&text)?;
                match message.body {
                    MessageBody::AuthResult(result) if result.is_ok() => {}
                    MessageBody::AuthResult(result) => {
                        return Err(AppError::Auth(
                            result.error.unwrap_or_else(|| "authentication failed".to_string()),
                        ));
                    }
                    other => {
                        return Err(AppError::Transport(format!(
                            "unexpected greeting: {:?}",
                            other.msg_type()
                        )))
                    }
                }
            }
            Some(Ok(WsMessage::Close(frame))) => {
                return Err(close_frame_error(frame));
            }
            Some(Ok(_)) | None => {
                return Err(AppError::Transport("connection closed during handshake".to_string()))
            }
            Some(Err(e)) => return Err(AppError::Transport(format!("handshake failed: {}", e))),
        }

        let (session_tx, mut session_rx) = mpsc::unbounded_channel::<Message>();
        *self.inner.session_tx.lock() = Some(session_tx);
        self.inner.connected.store(true, Ordering::Relaxed);
        info!("connected and authenticated with hub");

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.reset();

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    let ping = Message::new(MessageBody::Ping).to_json()?;
                    sink.send(WsMessage::Text(ping)).await.map_err(|e| {
                        AppError::Transport(format!("keepalive failed: {}", e))
                    })?;
                }
                Some(outgoing) = session_rx.recv() => {
                    let text = outgoing.to_json()?;
                    sink.send(WsMessage::Text(text)).await.map_err(|e| {
                        AppError::Transport(format!("send failed: {}", e))
                    })?;
                }
                frame = stream.next() => match frame {
                    None => return Ok(()),
                    Some(Err(e)) => {
                        return Err(AppError::Transport(format!("read failed: {}", e)));
                    }
                    Some(Ok(WsMessage::Text(text))) => {
                        match Message::from_json(&text) {
                            Ok(message) => {
                                debug!(msg_type = ?message.msg_type(), "hub frame");
                                if let Some(reply) =
                                    self.inner.dispatcher.dispatch(message).await
                                {
                                    let text = reply.to_json()?;
                                    sink.send(WsMessage::Text(text)).await.map_err(|e| {
                                        AppError::Transport(format!("send failed: {}", e))
                                    })?;
                                }
                            }
                            Err(e) => warn!("ignoring malformed hub frame: {}", e),
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        return Err(close_frame_error(frame));
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

fn close_frame_error(
    frame: Option<tokio_tungstenite::tungstenite::protocol::CloseFrame<'_>>,
) -> AppError {
    match frame {
        Some(frame) if matches!(u16::from(frame.code), 3000 | 3003) => {
            AppError::Auth(frame.reason.to_string())
        }
        Some(frame) => {
            AppError::Transport(format!("closed by hub: {} {}", frame.code, frame.reason))
        }
        None => AppError::Transport("closed by hub".to_string()),
    }
}
