//! Camera-session message handling
//!
//! Every frame arriving on the device session lands here after envelope
//! decoding. Sensor events become notification rows plus a push fan-out;
//! captures are decoded, muxed, written to the capture directory, and linked
//! back to the notification whose `rpi_event_id` matches `associated_to`.
//!
//! The motion rate limit is a per-user check-then-insert; a per-user async
//! mutex serializes it so two motion frames racing on the same session (or a
//! reconnect replay) cannot both pass the gate.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::image::mux_to_storable;
use crate::config::ConfigStore;
use crate::error::{AppError, Result};
use crate::messages::{
    AckStatus, CaptureAckPayload, CapturePayload, ErrorPayload, Message, MessageBody,
    NotificationAckPayload, NotificationSyncResponsePayload, SensorKind,
};
use crate::push::PushService;
use crate::store::{CaptureStore, NotificationRow, NotificationStore};

/// Ingestion and correlation service shared by all camera sessions
#[derive(Clone)]
pub struct IngestService {
    config: ConfigStore,
    notifications: NotificationStore,
    captures: CaptureStore,
    push: PushService,
    /// Serializes the motion check-then-insert per user
    user_locks: Arc<Mutex<HashMap<i64, Arc<AsyncMutex<()>>>>>,
}

impl IngestService {
    pub fn new(
        config: ConfigStore,
        notifications: NotificationStore,
        captures: CaptureStore,
        push: PushService,
    ) -> Self {
        Self {
            config,
            notifications,
            captures,
            push,
            user_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Handle one decoded message from an authenticated session
    ///
    /// Returns the reply to send back, if any. Validation failures become
    /// `ERROR` replies; the session stays open.
    pub async fn handle_message(&self, user_id: i64, message: &Message) -> Option<Message> {
        let result = match &message.body {
            MessageBody::Ping => Ok(Some(Message::response(message, MessageBody::Pong))),
            MessageBody::Pong => Ok(None),
            MessageBody::MotionDetected | MessageBody::FaceDetected | MessageBody::ButtonPressed => {
                self.handle_sensor_event(user_id, message).await
            }
            MessageBody::Capture(payload) => {
                self.handle_capture(user_id, message, payload.clone()).await
            }
            MessageBody::NotificationSync(payload) => {
                let rows = self.notifications.recent(user_id, payload.limit).await;
                rows.map(|rows| {
                    Some(Message::response(
                        message,
                        MessageBody::NotificationSyncResponse(NotificationSyncResponsePayload {
                            notifications: rows.iter().map(NotificationRow::summary).collect(),
                        }),
                    ))
                })
            }
            other => {
                debug!(msg_type = ?other.msg_type(), "unhandled message type on camera session");
                Ok(None)
            }
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                warn!(user_id, msg_id = %message.msg_id, "message handling failed: {}", e);
                Some(Message::response(
                    message,
                    MessageBody::Error(ErrorPayload {
                        error: e.to_string(),
                    }),
                ))
            }
        }
    }

    async fn handle_sensor_event(
        &self,
        user_id: i64,
        message: &Message,
    ) -> Result<Option<Message>> {
        let kind = SensorKind::from_msg_type(message.msg_type())
            .ok_or_else(|| AppError::Validation("not a sensor event".to_string()))?;

        let lock = self.user_lock(user_id);
        let _guard = lock.lock().await;

        // A resend of an already-processed event (reconnect replay) must ack
        // as a success, not trip the rate limit
        if let Some(existing) = self.notifications.find_by_event_id(&message.msg_id).await? {
            if existing.user_id == Some(user_id) {
                debug!(user_id, rpi_event_id = %message.msg_id, "duplicate event, ack only");
                return Ok(Some(Message::response(
                    message,
                    MessageBody::NotificationAck(NotificationAckPayload {
                        status: AckStatus::Processed,
                        notification_id: Some(existing.id),
                    }),
                )));
            }
        }

        if kind == SensorKind::Motion && self.motion_rate_limited(user_id).await? {
            info!(user_id, msg_id = %message.msg_id, "motion notification rate limited");
            return Ok(Some(Message::response(
                message,
                MessageBody::NotificationAck(NotificationAckPayload {
                    status: AckStatus::RateLimited,
                    notification_id: None,
                }),
            )));
        }

        let (row, created) = self
            .notifications
            .create(user_id, kind.title(), kind.notification_type(), &message.msg_id)
            .await?;

        if created {
            info!(
                user_id,
                notification_id = row.id,
                rpi_event_id = %message.msg_id,
                "notification created"
            );
            self.push
                .notify_user(user_id, kind.title(), notification_data(&row))
                .await;
        } else {
            // Device resent the event after a reconnect; the row already
            // exists and the pushes already went out
            debug!(user_id, rpi_event_id = %message.msg_id, "duplicate event, ack only");
        }

        Ok(Some(Message::response(
            message,
            MessageBody::NotificationAck(NotificationAckPayload {
                status: AckStatus::Processed,
                notification_id: Some(row.id),
            }),
        )))
    }

    async fn handle_capture(
        &self,
        user_id: i64,
        message: &Message,
        payload: CapturePayload,
    ) -> Result<Option<Message>> {
        let raw = BASE64
            .decode(payload.image_data_b64.as_bytes())
            .map_err(|e| AppError::Validation(format!("invalid image_data_b64: {}", e)))?;

        let format = payload.image_format;
        let (width, height) = (payload.width, payload.height);
        let (bytes, extension) =
            tokio::task::spawn_blocking(move || mux_to_storable(format, &raw, width, height))
                .await
                .map_err(|e| AppError::Internal(format!("mux worker failed: {}", e)))??;

        let capture_dir = PathBuf::from(&self.config.get().capture_dir);
        tokio::fs::create_dir_all(&capture_dir).await?;

        let filename = format!(
            "{}_{}.{}",
            payload.timestamp.format("%Y%m%dT%H%M%S%3f"),
            &Uuid::new_v4().to_string()[..8],
            extension
        );
        let path = capture_dir.join(filename);
        tokio::fs::write(&path, &bytes).await?;

        // Captures may outrun their notification; persist unlinked rather
        // than fail, the row just never gets a parent
        let notification_id = self
            .notifications
            .find_by_event_id(&payload.associated_to)
            .await?
            .filter(|row| row.user_id == Some(user_id))
            .map(|row| row.id);

        if notification_id.is_none() {
            debug!(
                user_id,
                associated_to = %payload.associated_to,
                "capture arrived before its notification, storing unlinked"
            );
        }

        let row = self
            .captures
            .insert(notification_id, &path.to_string_lossy())
            .await?;

        info!(
            user_id,
            capture_id = row.id,
            notification_id = ?notification_id,
            has_face = payload.has_face,
            "capture stored"
        );

        Ok(Some(Message::response(
            message,
            MessageBody::CaptureAck(CaptureAckPayload {
                status: "saved".to_string(),
                capture_id: Some(row.id),
            }),
        )))
    }

    async fn motion_rate_limited(&self, user_id: i64) -> Result<bool> {
        let window_minutes = self.config.get().motion_rate_limit_minutes;
        if window_minutes <= 0 {
            return Ok(false);
        }

        let latest = self
            .notifications
            .latest_created_at(user_id, SensorKind::Motion.notification_type())
            .await?;

        Ok(match latest {
            Some(created_at) => Utc::now() - created_at < Duration::minutes(window_minutes),
            None => false,
        })
    }

    fn user_lock(&self, user_id: i64) -> Arc<AsyncMutex<()>> {
        let mut locks = self.user_locks.lock();
        locks
            .entry(user_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

/// Notification fields as the string map pushed to devices
fn notification_data(row: &NotificationRow) -> HashMap<String, String> {
    let mut data = HashMap::new();
    data.insert("id".to_string(), row.id.to_string());
    data.insert("title".to_string(), row.title.clone());
    data.insert("type".to_string(), row.notification_type.clone());
    data.insert("created_at".to_string(), row.created_at.to_rfc3339());
    if let Some(user_id) = row.user_id {
        data.insert("user_id".to_string(), user_id.to_string());
    }
    if let Some(event_id) = &row.rpi_event_id {
        data.insert("rpi_event_id".to_string(), event_id.clone());
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::messages::ImageFormat;
    use crate::push::{PushError, PushSender};
    use crate::store::test_util::test_pool;
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct RecordingSender {
        pushes: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl PushSender for RecordingSender {
        async fn send(
            &self,
            device_token: &str,
            title: &str,
            _data: &HashMap<String, String>,
        ) -> std::result::Result<(), PushError> {
            self.pushes
                .lock()
                .push((device_token.to_string(), title.to_string()));
            Ok(())
        }
    }

    async fn build_service(
        dir: &tempfile::TempDir,
    ) -> (IngestService, Arc<RecordingSender>, crate::store::FcmDeviceStore) {
        let config = ConfigStore::open(&dir.path().join("hub.db")).await.unwrap();
        let capture_dir = dir.path().join("captures").to_string_lossy().to_string();
        config
            .update(|c| {
                *c = HubConfig {
                    capture_dir,
                    motion_rate_limit_minutes: 1,
                    ..HubConfig::default()
                }
            })
            .await
            .unwrap();

        let pool = test_pool(&dir.path().join("data.db")).await;
        let devices = crate::store::FcmDeviceStore::new(pool.clone());
        let sender = Arc::new(RecordingSender {
            pushes: Mutex::new(Vec::new()),
        });
        let push = PushService::new(
            sender.clone(),
            devices.clone(),
            &crate::config::FcmConfig::default(),
        );

        let service = IngestService::new(
            config,
            NotificationStore::new(pool.clone()),
            CaptureStore::new(pool),
            push,
        );
        (service, sender, devices)
    }

    fn jpeg_capture(associated_to: &str) -> Message {
        Message::new(MessageBody::Capture(CapturePayload {
            associated_to: associated_to.to_string(),
            timestamp: Utc::now(),
            image_format: ImageFormat::Jpeg,
            image_data_b64: BASE64.encode(b"not-a-real-jpeg"),
            has_face: false,
            width: None,
            height: None,
        }))
    }

    #[tokio::test]
    async fn test_button_press_creates_notification_and_pushes() {
        let dir = tempdir().unwrap();
        let (service, sender, devices) = build_service(&dir).await;
        devices.register(7, "tk", "pixel-8", None, None).await.unwrap();

        let event = Message::new(MessageBody::ButtonPressed);
        let reply = service.handle_message(7, &event).await.unwrap();

        let MessageBody::NotificationAck(ack) = &reply.body else {
            panic!("expected notification ack, got {:?}", reply.body);
        };
        assert_eq!(ack.status, AckStatus::Processed);
        assert!(ack.notification_id.is_some());
        assert_eq!(reply.reply_to.as_deref(), Some(event.msg_id.as_str()));

        let pushes = sender.pushes.lock().clone();
        assert_eq!(pushes, vec![("tk".to_string(), "Doorbell Pressed".to_string())]);
    }

    #[tokio::test]
    async fn test_capture_links_to_notification_by_event_id() {
        let dir = tempdir().unwrap();
        let (service, _, _) = build_service(&dir).await;

        let event = Message::new(MessageBody::ButtonPressed);
        let reply = service.handle_message(7, &event).await.unwrap();
        let MessageBody::NotificationAck(ack) = &reply.body else {
            panic!("expected ack");
        };
        let notification_id = ack.notification_id.unwrap();

        let capture = jpeg_capture(&event.msg_id);
        let reply = service.handle_message(7, &capture).await.unwrap();
        let MessageBody::CaptureAck(ack) = &reply.body else {
            panic!("expected capture ack, got {:?}", reply.body);
        };
        assert_eq!(ack.status, "saved");

        let row = service
            .captures
            .find_by_id(ack.capture_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.notification_id, Some(notification_id));
        assert!(std::path::Path::new(&row.path).exists());
    }

    #[tokio::test]
    async fn test_capture_before_notification_stays_unlinked() {
        let dir = tempdir().unwrap();
        let (service, _, _) = build_service(&dir).await;

        let capture = jpeg_capture("never-seen-event");
        let reply = service.handle_message(7, &capture).await.unwrap();
        let MessageBody::CaptureAck(ack) = &reply.body else {
            panic!("expected capture ack");
        };

        let row = service
            .captures
            .find_by_id(ack.capture_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.notification_id, None);
    }

    #[tokio::test]
    async fn test_capture_not_linked_across_users() {
        let dir = tempdir().unwrap();
        let (service, _, _) = build_service(&dir).await;

        let event = Message::new(MessageBody::ButtonPressed);
        service.handle_message(7, &event).await.unwrap();

        // A different user's capture referencing user 7's event stays unlinked
        let capture = jpeg_capture(&event.msg_id);
        let reply = service.handle_message(8, &capture).await.unwrap();
        let MessageBody::CaptureAck(ack) = &reply.body else {
            panic!("expected capture ack");
        };
        let row = service
            .captures
            .find_by_id(ack.capture_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.notification_id, None);
    }

    #[tokio::test]
    async fn test_motion_rate_limit() {
        let dir = tempdir().unwrap();
        let (service, _, _) = build_service(&dir).await;

        let first = Message::new(MessageBody::MotionDetected);
        let reply = service.handle_message(7, &first).await.unwrap();
        let MessageBody::NotificationAck(ack) = &reply.body else {
            panic!("expected ack");
        };
        assert_eq!(ack.status, AckStatus::Processed);

        let second = Message::new(MessageBody::MotionDetected);
        let reply = service.handle_message(7, &second).await.unwrap();
        let MessageBody::NotificationAck(ack) = &reply.body else {
            panic!("expected ack");
        };
        assert_eq!(ack.status, AckStatus::RateLimited);
        assert_eq!(ack.notification_id, None);

        let rows = service.notifications.recent(7, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_button_press_not_rate_limited() {
        let dir = tempdir().unwrap();
        let (service, _, _) = build_service(&dir).await;

        for _ in 0..3 {
            let event = Message::new(MessageBody::ButtonPressed);
            let reply = service.handle_message(7, &event).await.unwrap();
            let MessageBody::NotificationAck(ack) = &reply.body else {
                panic!("expected ack");
            };
            assert_eq!(ack.status, AckStatus::Processed);
        }

        assert_eq!(service.notifications.recent(7, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_event_is_idempotent_and_pushes_once() {
        let dir = tempdir().unwrap();
        let (service, sender, devices) = build_service(&dir).await;
        devices.register(7, "tk", "pixel-8", None, None).await.unwrap();

        let event = Message::new(MessageBody::ButtonPressed);
        let first = service.handle_message(7, &event).await.unwrap();
        // Same msg_id arrives again after a reconnect
        let second = service.handle_message(7, &event).await.unwrap();

        let (MessageBody::NotificationAck(a), MessageBody::NotificationAck(b)) =
            (&first.body, &second.body)
        else {
            panic!("expected acks");
        };
        assert_eq!(a.status, AckStatus::Processed);
        assert_eq!(b.status, AckStatus::Processed);
        assert_eq!(a.notification_id, b.notification_id);

        assert_eq!(service.notifications.recent(7, 10).await.unwrap().len(), 1);
        assert_eq!(sender.pushes.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_motion_resend_is_idempotent_not_rate_limited() {
        let dir = tempdir().unwrap();
        let (service, _, _) = build_service(&dir).await;

        let event = Message::new(MessageBody::MotionDetected);
        let first = service.handle_message(7, &event).await.unwrap();
        // Same envelope replayed inside the rate-limit window
        let second = service.handle_message(7, &event).await.unwrap();

        let (MessageBody::NotificationAck(a), MessageBody::NotificationAck(b)) =
            (&first.body, &second.body)
        else {
            panic!("expected acks");
        };
        assert_eq!(a.status, AckStatus::Processed);
        assert_eq!(b.status, AckStatus::Processed);
        assert_eq!(a.notification_id, b.notification_id);
    }

    #[tokio::test]
    async fn test_ping_gets_pong() {
        let dir = tempdir().unwrap();
        let (service, _, _) = build_service(&dir).await;

        let ping = Message::new(MessageBody::Ping);
        let reply = service.handle_message(7, &ping).await.unwrap();
        assert_eq!(reply.body, MessageBody::Pong);
        assert_eq!(reply.reply_to.as_deref(), Some(ping.msg_id.as_str()));
    }

    #[tokio::test]
    async fn test_invalid_base64_gets_error_reply() {
        let dir = tempdir().unwrap();
        let (service, _, _) = build_service(&dir).await;

        let capture = Message::new(MessageBody::Capture(CapturePayload {
            associated_to: "e1".to_string(),
            timestamp: Utc::now(),
            image_format: ImageFormat::Jpeg,
            image_data_b64: "!!not base64!!".to_string(),
            has_face: false,
            width: None,
            height: None,
        }));
        let reply = service.handle_message(7, &capture).await.unwrap();
        assert!(matches!(reply.body, MessageBody::Error(_)));
    }

    #[tokio::test]
    async fn test_notification_sync_returns_recent_rows() {
        let dir = tempdir().unwrap();
        let (service, _, _) = build_service(&dir).await;

        let event = Message::new(MessageBody::ButtonPressed);
        service.handle_message(7, &event).await.unwrap();

        let sync = Message::new(MessageBody::NotificationSync(
            crate::messages::NotificationSyncPayload { limit: 10 },
        ));
        let reply = service.handle_message(7, &sync).await.unwrap();
        let MessageBody::NotificationSyncResponse(payload) = &reply.body else {
            panic!("expected sync response");
        };
        assert_eq!(payload.notifications.len(), 1);
        assert_eq!(
            payload.notifications[0].rpi_event_id.as_deref(),
            Some(event.msg_id.as_str())
        );
    }
}
