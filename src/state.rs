use std::sync::Arc;

use tokio::sync::broadcast;

use crate::auth::TokenService;
use crate::config::ConfigStore;
use crate::hub::IngestService;
use crate::push::PushService;
use crate::signaling::SignalingBroker;
use crate::store::{CaptureStore, FcmDeviceStore, NotificationStore};

/// Application-wide state shared across handlers
pub struct AppState {
    /// Configuration store
    pub config: ConfigStore,
    /// JWT issue/verify
    pub tokens: TokenService,
    /// Notification persistence
    pub notifications: NotificationStore,
    /// Capture persistence
    pub captures: CaptureStore,
    /// Push token registry
    pub fcm_devices: FcmDeviceStore,
    /// Camera-session message handling
    pub ingest: IngestService,
    /// WebRTC signaling broker
    pub broker: Arc<SignalingBroker>,
    /// Shutdown signal sender
    pub shutdown_tx: broadcast::Sender<()>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ConfigStore,
        tokens: TokenService,
        notifications: NotificationStore,
        captures: CaptureStore,
        fcm_devices: FcmDeviceStore,
        push: PushService,
        broker: Arc<SignalingBroker>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Arc<Self> {
        let ingest = IngestService::new(
            config.clone(),
            notifications.clone(),
            captures.clone(),
            push,
        );

        Arc::new(Self {
            config,
            tokens,
            notifications,
            captures,
            fcm_devices,
            ingest,
            broker,
            shutdown_tx,
        })
    }

    /// Subscribe to shutdown signal
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }
}
