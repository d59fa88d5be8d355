//! On-device controller
//!
//! Wires the sensor loops, the mode state machine, the capture pipeline,
//! the hub transport, and the broadcaster-side signaling client into one
//! process. The object graph is assembled once in [`DoorbellController::new`]
//! and handed interfaces, so hardware can be swapped for mocks.

pub mod camera;
pub mod capture;
pub mod face;
pub mod machine;
pub mod rgb;
pub mod sensors;
pub mod settings;

pub use camera::{Frame, FrameSource, V4lCamera};
pub use capture::{Capture, CaptureQueue};
pub use face::{FaceDetector, NullFaceDetector};
pub use machine::{ControllerState, ModeController};
pub use rgb::{GpioRgb, NullRgb, RgbLight};
pub use sensors::{GpioSensor, Sensor, SensorEvent, SensorService};
pub use settings::Tunables;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::error::Result;
use crate::messages::{
    ErrorPayload, Message, MessageBody, MessageType, SensorKind, SettingsAckPayload,
    SettingsAction, StreamAckPayload,
};
use crate::signaling::{NullSignalHandler, PresenceSignal, SignalingClient};
use crate::transport::{MessageHandler, Transport};

/// Sensor events are rare; a small queue that blocks producers is enough
const EVENT_QUEUE_CAPACITY: usize = 64;
/// Frames are droppable; bounded with drop-oldest overflow
const CAPTURE_QUEUE_CAPACITY: usize = 32;
/// How long request/reply exchanges wait on the session
const REPLY_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Transport handlers
// ============================================================================

/// Answers hub keep-alive pings
struct PingHandler;

#[async_trait]
impl MessageHandler for PingHandler {
    async fn handle(&self, message: Message) -> Option<Message> {
        Some(Message::response(&message, MessageBody::Pong))
    }
}

/// `STREAM_START`: the hub asks the device to treat viewers as present
struct StreamStartHandler {
    machine: Arc<ModeController>,
}

#[async_trait]
impl MessageHandler for StreamStartHandler {
    async fn handle(&self, message: Message) -> Option<Message> {
        self.machine.on_viewers_present().await;
        Some(Message::response(
            &message,
            MessageBody::StreamAck(StreamAckPayload::default()),
        ))
    }
}

/// `STREAM_STOP`: mirror of stream-start, arms the cooldown
struct StreamStopHandler {
    machine: Arc<ModeController>,
}

#[async_trait]
impl MessageHandler for StreamStopHandler {
    async fn handle(&self, message: Message) -> Option<Message> {
        self.machine.on_viewers_gone().await;
        Some(Message::response(
            &message,
            MessageBody::StreamAck(StreamAckPayload::default()),
        ))
    }
}

/// Settings read/update over the session
struct SettingsHandler {
    tunables: Tunables,
    rgb: Arc<dyn RgbLight>,
}

#[async_trait]
impl MessageHandler for SettingsHandler {
    async fn handle(&self, message: Message) -> Option<Message> {
        let MessageBody::SettingsRequest(request) = &message.body else {
            return None;
        };

        let body = match request.action {
            SettingsAction::Get => MessageBody::SettingsAck(SettingsAckPayload {
                settings: self.tunables.snapshot(self.rgb.as_ref()),
            }),
            SettingsAction::Set => match &request.data {
                Some(patch) => match self.tunables.apply(patch, self.rgb.as_ref()) {
                    Ok(settings) => {
                        info!("settings updated over session");
                        MessageBody::SettingsAck(SettingsAckPayload { settings })
                    }
                    Err(e) => MessageBody::Error(ErrorPayload {
                        error: e.to_string(),
                    }),
                },
                None => MessageBody::Error(ErrorPayload {
                    error: "set requires a data object".to_string(),
                }),
            },
        };

        Some(Message::response(&message, body))
    }
}

// ============================================================================
// Controller assembly
// ============================================================================

/// The assembled device process
pub struct DoorbellController {
    config: ControllerConfig,
    tunables: Tunables,
    machine: Arc<ModeController>,
    transport: Transport,
    signaling: SignalingClient,
    queue: Arc<CaptureQueue>,
    events_tx: mpsc::Sender<SensorEvent>,
    events_rx: mpsc::Receiver<SensorEvent>,
    presence_rx: mpsc::Receiver<PresenceSignal>,
    button: Box<dyn Sensor>,
    motion: Box<dyn Sensor>,
    shutdown_tx: broadcast::Sender<()>,
}

impl DoorbellController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ControllerConfig,
        camera: Arc<dyn FrameSource>,
        detector: Arc<dyn FaceDetector>,
        rgb: Arc<dyn RgbLight>,
        button: Box<dyn Sensor>,
        motion: Box<dyn Sensor>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        let tunables = Tunables::from_config(&config);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let queue = Arc::new(CaptureQueue::new(CAPTURE_QUEUE_CAPACITY));

        let machine = ModeController::new(
            camera,
            detector,
            rgb.clone(),
            queue.clone(),
            events_tx.clone(),
            tunables.stop_motion.clone(),
            Duration::from_secs(config.streaming_cooldown_seconds),
            config.device_id.clone(),
        );

        let transport = Transport::new(
            config.ws_url.clone(),
            config.auth_token.clone(),
            Duration::from_secs(config.reconnect_backoff_seconds.max(1)),
            REPLY_TIMEOUT,
            shutdown_tx.clone(),
        );
        transport.register_handler(MessageType::Ping, Arc::new(PingHandler));
        transport.register_handler(
            MessageType::StreamStart,
            Arc::new(StreamStartHandler {
                machine: machine.clone(),
            }),
        );
        transport.register_handler(
            MessageType::StreamStop,
            Arc::new(StreamStopHandler {
                machine: machine.clone(),
            }),
        );
        transport.register_handler(
            MessageType::SettingsRequest,
            Arc::new(SettingsHandler {
                tunables: tunables.clone(),
                rgb: rgb.clone(),
            }),
        );

        let (presence_tx, presence_rx) = mpsc::channel(8);
        let signaling = SignalingClient::new(
            config.signaling_server_url.clone(),
            config.auth_token.clone(),
            config.room_id.clone(),
            Duration::from_secs(config.reconnect_backoff_seconds.max(1)),
            presence_tx,
            Arc::new(NullSignalHandler),
            shutdown_tx.clone(),
        );

        Self {
            config,
            tunables,
            machine,
            transport,
            signaling,
            queue,
            events_tx,
            events_rx,
            presence_rx,
            button,
            motion,
            shutdown_tx,
        }
    }

    /// Assemble against the real hardware described by the configuration
    pub fn with_hardware(
        config: ControllerConfig,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Result<Self> {
        let camera: Arc<dyn FrameSource> = Arc::new(V4lCamera::new(&config.camera));
        let rgb: Arc<dyn RgbLight> = Arc::new(GpioRgb::open(&config.rgb)?);
        // Button wired active-low, PIR reports active-high
        let button = Box::new(GpioSensor::open(&config.button, "doorbell-button", 0)?);
        let motion = Box::new(GpioSensor::open(&config.motion_sensor, "doorbell-motion", 1)?);

        Ok(Self::new(
            config,
            camera,
            Arc::new(NullFaceDetector),
            rgb,
            button,
            motion,
            shutdown_tx,
        ))
    }

    /// Run until the shutdown signal fires
    pub async fn run(self) -> Result<()> {
        let Self {
            config,
            tunables,
            machine,
            transport,
            signaling,
            queue,
            events_tx,
            mut events_rx,
            mut presence_rx,
            button,
            motion,
            shutdown_tx,
        } = self;

        info!(device_id = %config.device_id, "starting doorbell controller");

        {
            let transport = transport.clone();
            tokio::spawn(async move { transport.run().await });
        }

        tokio::spawn(async move { signaling.run().await });

        let button_service = SensorService::new(
            SensorKind::Button,
            config.device_id.clone(),
            tunables.button.clone(),
            events_tx.clone(),
            shutdown_tx.clone(),
        );
        tokio::spawn(async move { button_service.run(button).await });

        let motion_service = SensorService::new(
            SensorKind::Motion,
            config.device_id.clone(),
            tunables.motion.clone(),
            events_tx.clone(),
            shutdown_tx.clone(),
        );
        tokio::spawn(async move { motion_service.run(motion).await });

        // Sensor loops and the machine hold the remaining senders; the pump
        // below ends once every producer is gone
        drop(events_tx);

        tokio::spawn(capture::run_capture_sender(
            queue,
            transport.clone(),
            std::path::PathBuf::from(&config.camera.stop_motion.output_dir),
            shutdown_tx.clone(),
        ));

        // Presence pump: broker edges drive the machine
        {
            let machine = machine.clone();
            let mut shutdown = shutdown_tx.subscribe();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.recv() => break,
                        signal = presence_rx.recv() => match signal {
                            Some(PresenceSignal::ViewersPresent) => machine.on_viewers_present().await,
                            Some(PresenceSignal::ViewersGone) => machine.on_viewers_gone().await,
                            None => break,
                        }
                    }
                }
            });
        }

        // Event pump: FIFO from the sensor queue through the machine to
        // the hub
        let mut shutdown = shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                event = events_rx.recv() => match event {
                    None => break,
                    Some(event) => {
                        let forward = machine.handle_sensor_event(&event).await;
                        if forward {
                            let message = event_message(&event);
                            if let Err(e) = transport.send(message) {
                                warn!(id = %event.id, "event not delivered to hub: {}", e);
                            }
                        }
                    }
                }
            }
        }

        machine.shutdown().await;
        info!("doorbell controller stopped");
        Ok(())
    }
}

/// The event's id becomes the wire `msg_id`, which the hub persists as
/// `rpi_event_id`; captures point back at it through `associated_to`
fn event_message(event: &SensorEvent) -> Message {
    let body = match event.kind {
        SensorKind::Button => MessageBody::ButtonPressed,
        SensorKind::Motion => MessageBody::MotionDetected,
        SensorKind::Face => MessageBody::FaceDetected,
    };
    Message {
        msg_id: event.id.clone(),
        timestamp: event.timestamp,
        reply_to: None,
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RgbColor, SettingsPatch, StopMotionPatch};
    use crate::messages::SettingsRequestPayload;
    use parking_lot::Mutex as SyncMutex;

    fn settings_handler() -> (SettingsHandler, Arc<NullRgb>) {
        let rgb = Arc::new(NullRgb::default());
        let handler = SettingsHandler {
            tunables: Tunables::from_config(&ControllerConfig::default()),
            rgb: rgb.clone(),
        };
        (handler, rgb)
    }

    #[tokio::test]
    async fn test_settings_get_returns_snapshot() {
        let (handler, _) = settings_handler();

        let request = Message::new(MessageBody::SettingsRequest(SettingsRequestPayload {
            action: SettingsAction::Get,
            data: None,
        }));
        let reply = handler.handle(request.clone()).await.unwrap();

        let MessageBody::SettingsAck(ack) = &reply.body else {
            panic!("expected settings ack, got {:?}", reply.body);
        };
        assert_eq!(ack.settings.stop_motion.duration_seconds, 30);
        assert_eq!(reply.reply_to.as_deref(), Some(request.msg_id.as_str()));
    }

    #[tokio::test]
    async fn test_settings_set_applies_patch() {
        let (handler, rgb) = settings_handler();

        let request = Message::new(MessageBody::SettingsRequest(SettingsRequestPayload {
            action: SettingsAction::Set,
            data: Some(SettingsPatch {
                stop_motion: Some(StopMotionPatch {
                    interval_seconds: Some(2.0),
                    duration_seconds: None,
                }),
                color: Some(RgbColor { r: 0, g: 255, b: 0 }),
                ..Default::default()
            }),
        }));
        let reply = handler.handle(request).await.unwrap();

        let MessageBody::SettingsAck(ack) = &reply.body else {
            panic!("expected settings ack, got {:?}", reply.body);
        };
        assert_eq!(ack.settings.stop_motion.interval_seconds, 2.0);
        assert_eq!(rgb.color().g, 255);
    }

    #[tokio::test]
    async fn test_settings_set_without_data_errors() {
        let (handler, _) = settings_handler();

        let request = Message::new(MessageBody::SettingsRequest(SettingsRequestPayload {
            action: SettingsAction::Set,
            data: None,
        }));
        let reply = handler.handle(request).await.unwrap();
        assert!(matches!(reply.body, MessageBody::Error(_)));
    }

    struct StaticCamera;

    impl FrameSource for StaticCamera {
        fn open(&self) -> Result<()> {
            Ok(())
        }

        fn capture_frame(&self) -> Result<Frame> {
            Ok(Frame {
                data: bytes::Bytes::from_static(b"frame"),
                format: crate::messages::ImageFormat::Jpeg,
                width: 16,
                height: 16,
                timestamp: chrono::Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_stream_handlers_drive_machine() {
        let rgb = Arc::new(NullRgb::default());
        let queue = Arc::new(CaptureQueue::new(4));
        let (events_tx, _events_rx) = mpsc::channel(4);
        let machine = ModeController::new(
            Arc::new(StaticCamera),
            Arc::new(NullFaceDetector),
            rgb.clone(),
            queue,
            events_tx,
            Arc::new(SyncMutex::new(crate::config::StopMotionTuning {
                interval_seconds: 1.0,
                duration_seconds: 30,
            })),
            Duration::from_millis(10),
            "rpi".to_string(),
        );

        let start = StreamStartHandler {
            machine: machine.clone(),
        };
        let reply = start.handle(Message::new(MessageBody::StreamStart)).await;
        assert!(matches!(reply.unwrap().body, MessageBody::StreamAck(_)));
        assert_eq!(machine.state().await, ControllerState::Streaming);
        assert!(rgb.is_lit());

        let stop = StreamStopHandler {
            machine: machine.clone(),
        };
        let reply = stop.handle(Message::new(MessageBody::StreamStop)).await;
        assert!(matches!(reply.unwrap().body, MessageBody::StreamAck(_)));
        assert_eq!(machine.state().await, ControllerState::Idle);
        assert!(!rgb.is_lit());
    }

    #[tokio::test]
    async fn test_ping_handler_pongs() {
        let ping = Message::new(MessageBody::Ping);
        let reply = PingHandler.handle(ping.clone()).await.unwrap();
        assert_eq!(reply.body, MessageBody::Pong);
        assert_eq!(reply.reply_to.as_deref(), Some(ping.msg_id.as_str()));
    }

    #[test]
    fn test_event_message_preserves_event_identity() {
        let event = SensorEvent::new(SensorKind::Motion, "rpi");
        let message = event_message(&event);
        assert_eq!(message.msg_id, event.id);
        assert_eq!(message.timestamp, event.timestamp);
        assert_eq!(message.body, MessageBody::MotionDetected);
    }
}
