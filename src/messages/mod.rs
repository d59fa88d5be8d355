//! Wire messages shared by the hub and the device controller.
//!
//! Every frame on the camera session is one JSON object: an envelope with a
//! numeric `msg_type` discriminator, an opaque `msg_id`, the source
//! timestamp, an optional `reply_to` correlation id, and a type-dependent
//! `payload`. In code the payload is a tagged enum, one variant per message
//! type; the bag-of-optionals shape only exists at the serialization
//! boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::config::{DeviceSettings, SettingsPatch};

/// Message discriminator; serialized as a small integer on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum MessageType {
    Ping = 1,
    Pong = 2,
    Auth = 3,
    AuthResult = 4,
    MotionDetected = 5,
    FaceDetected = 6,
    ButtonPressed = 7,
    StreamStart = 8,
    StreamStop = 9,
    StreamAck = 10,
    SettingsRequest = 11,
    SettingsAck = 12,
    NotificationAck = 13,
    NotificationSync = 14,
    NotificationSyncResponse = 15,
    Capture = 16,
    CaptureAck = 17,
    Error = 18,
}

impl From<MessageType> for u8 {
    fn from(t: MessageType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = String;

    fn try_from(v: u8) -> Result<Self, String> {
        Ok(match v {
            1 => Self::Ping,
            2 => Self::Pong,
            3 => Self::Auth,
            4 => Self::AuthResult,
            5 => Self::MotionDetected,
            6 => Self::FaceDetected,
            7 => Self::ButtonPressed,
            8 => Self::StreamStart,
            9 => Self::StreamStop,
            10 => Self::StreamAck,
            11 => Self::SettingsRequest,
            12 => Self::SettingsAck,
            13 => Self::NotificationAck,
            14 => Self::NotificationSync,
            15 => Self::NotificationSyncResponse,
            16 => Self::Capture,
            17 => Self::CaptureAck,
            18 => Self::Error,
            other => return Err(format!("unknown msg_type {}", other)),
        })
    }
}

/// Which sensor produced an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Button,
    Motion,
    Face,
}

impl SensorKind {
    /// Message type the device reports this event as
    pub fn msg_type(self) -> MessageType {
        match self {
            Self::Button => MessageType::ButtonPressed,
            Self::Motion => MessageType::MotionDetected,
            Self::Face => MessageType::FaceDetected,
        }
    }

    /// Notification type string persisted by the hub
    pub fn notification_type(self) -> &'static str {
        match self {
            Self::Button => "button_pressed",
            Self::Motion => "motion_detected",
            Self::Face => "face_detected",
        }
    }

    /// Human-facing notification title
    pub fn title(self) -> &'static str {
        match self {
            Self::Button => "Doorbell Pressed",
            Self::Motion => "Motion Detected",
            Self::Face => "Face Detected",
        }
    }

    /// Inverse of [`SensorKind::msg_type`] for the event-bearing types
    pub fn from_msg_type(t: MessageType) -> Option<Self> {
        match t {
            MessageType::ButtonPressed => Some(Self::Button),
            MessageType::MotionDetected => Some(Self::Motion),
            MessageType::FaceDetected => Some(Self::Face),
            _ => None,
        }
    }
}

/// Pixel container of a capture frame on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpeg,
    Yuv420,
    Png,
}

// ============================================================================
// Payloads
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthPayload {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResultPayload {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuthResultPayload {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamAckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettingsAction {
    Get,
    Set,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsRequestPayload {
    pub action: SettingsAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<SettingsPatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsAckPayload {
    pub settings: DeviceSettings,
}

/// Outcome of a sensor-event message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Processed,
    RateLimited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationAckPayload {
    pub status: AckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSyncPayload {
    pub limit: u32,
}

/// Notification row as it travels to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSummary {
    pub id: i64,
    pub title: String,
    #[serde(rename = "type")]
    pub notification_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpi_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationSyncResponsePayload {
    pub notifications: Vec<NotificationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturePayload {
    /// `msg_id` of the sensor event that opened the recording window
    pub associated_to: String,
    pub timestamp: DateTime<Utc>,
    pub image_format: ImageFormat,
    pub image_data_b64: String,
    pub has_face: bool,
    /// Frame dimensions; required for raw formats, absent for containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureAckPayload {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub error: String,
}

// ============================================================================
// Envelope
// ============================================================================

/// Typed message body, one variant per wire message type
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Ping,
    Pong,
    Auth(AuthPayload),
    AuthResult(AuthResultPayload),
    MotionDetected,
    FaceDetected,
    ButtonPressed,
    StreamStart,
    StreamStop,
    StreamAck(StreamAckPayload),
    SettingsRequest(SettingsRequestPayload),
    SettingsAck(SettingsAckPayload),
    NotificationAck(NotificationAckPayload),
    NotificationSync(NotificationSyncPayload),
    NotificationSyncResponse(NotificationSyncResponsePayload),
    Capture(CapturePayload),
    CaptureAck(CaptureAckPayload),
    Error(ErrorPayload),
}

impl MessageBody {
    pub fn msg_type(&self) -> MessageType {
        match self {
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::Auth(_) => MessageType::Auth,
            Self::AuthResult(_) => MessageType::AuthResult,
            Self::MotionDetected => MessageType::MotionDetected,
            Self::FaceDetected => MessageType::FaceDetected,
            Self::ButtonPressed => MessageType::ButtonPressed,
            Self::StreamStart => MessageType::StreamStart,
            Self::StreamStop => MessageType::StreamStop,
            Self::StreamAck(_) => MessageType::StreamAck,
            Self::SettingsRequest(_) => MessageType::SettingsRequest,
            Self::SettingsAck(_) => MessageType::SettingsAck,
            Self::NotificationAck(_) => MessageType::NotificationAck,
            Self::NotificationSync(_) => MessageType::NotificationSync,
            Self::NotificationSyncResponse(_) => MessageType::NotificationSyncResponse,
            Self::Capture(_) => MessageType::Capture,
            Self::CaptureAck(_) => MessageType::CaptureAck,
            Self::Error(_) => MessageType::Error,
        }
    }

    fn payload_value(&self) -> Option<Value> {
        match self {
            Self::Ping
            | Self::Pong
            | Self::MotionDetected
            | Self::FaceDetected
            | Self::ButtonPressed
            | Self::StreamStart
            | Self::StreamStop => None,
            Self::Auth(p) => serde_json::to_value(p).ok(),
            Self::AuthResult(p) => serde_json::to_value(p).ok(),
            Self::StreamAck(p) => serde_json::to_value(p).ok(),
            Self::SettingsRequest(p) => serde_json::to_value(p).ok(),
            Self::SettingsAck(p) => serde_json::to_value(p).ok(),
            Self::NotificationAck(p) => serde_json::to_value(p).ok(),
            Self::NotificationSync(p) => serde_json::to_value(p).ok(),
            Self::NotificationSyncResponse(p) => serde_json::to_value(p).ok(),
            Self::Capture(p) => serde_json::to_value(p).ok(),
            Self::CaptureAck(p) => serde_json::to_value(p).ok(),
            Self::Error(p) => serde_json::to_value(p).ok(),
        }
    }

    fn from_parts(msg_type: MessageType, payload: Option<Value>) -> Result<Self, String> {
        fn decode<T: serde::de::DeserializeOwned>(
            msg_type: MessageType,
            payload: Option<Value>,
        ) -> Result<T, String> {
            let value = payload
                .ok_or_else(|| format!("{:?} message requires a payload", msg_type))?;
            serde_json::from_value(value)
                .map_err(|e| format!("invalid {:?} payload: {}", msg_type, e))
        }

        Ok(match msg_type {
            MessageType::Ping => Self::Ping,
            MessageType::Pong => Self::Pong,
            MessageType::Auth => Self::Auth(decode(msg_type, payload)?),
            MessageType::AuthResult => Self::AuthResult(decode(msg_type, payload)?),
            MessageType::MotionDetected => Self::MotionDetected,
            MessageType::FaceDetected => Self::FaceDetected,
            MessageType::ButtonPressed => Self::ButtonPressed,
            MessageType::StreamStart => Self::StreamStart,
            MessageType::StreamStop => Self::StreamStop,
            MessageType::StreamAck => {
                Self::StreamAck(match payload {
                    Some(value) => serde_json::from_value(value)
                        .map_err(|e| format!("invalid StreamAck payload: {}", e))?,
                    None => StreamAckPayload::default(),
                })
            }
            MessageType::SettingsRequest => Self::SettingsRequest(decode(msg_type, payload)?),
            MessageType::SettingsAck => Self::SettingsAck(decode(msg_type, payload)?),
            MessageType::NotificationAck => Self::NotificationAck(decode(msg_type, payload)?),
            MessageType::NotificationSync => Self::NotificationSync(decode(msg_type, payload)?),
            MessageType::NotificationSyncResponse => {
                Self::NotificationSyncResponse(decode(msg_type, payload)?)
            }
            MessageType::Capture => Self::Capture(decode(msg_type, payload)?),
            MessageType::CaptureAck => Self::CaptureAck(decode(msg_type, payload)?),
            MessageType::Error => Self::Error(decode(msg_type, payload)?),
        })
    }
}

/// Wire envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "WireMessage", try_from = "WireMessage")]
pub struct Message {
    pub msg_id: String,
    pub timestamp: DateTime<Utc>,
    pub reply_to: Option<String>,
    pub body: MessageBody,
}

impl Message {
    /// New message with a fresh id and the current time
    pub fn new(body: MessageBody) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            reply_to: None,
            body,
        }
    }

    /// New message answering `original` (sets `reply_to`)
    pub fn response(original: &Message, body: MessageBody) -> Self {
        Self {
            reply_to: Some(original.msg_id.clone()),
            ..Self::new(body)
        }
    }

    pub fn msg_type(&self) -> MessageType {
        self.body.msg_type()
    }

    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a JSON text frame
    pub fn from_json(raw: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Flat on-the-wire shape of [`Message`]
#[derive(Serialize, Deserialize)]
struct WireMessage {
    msg_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    payload: Option<Value>,
    msg_id: String,
    timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    reply_to: Option<String>,
}

impl From<Message> for WireMessage {
    fn from(m: Message) -> Self {
        Self {
            msg_type: m.body.msg_type(),
            payload: m.body.payload_value(),
            msg_id: m.msg_id,
            timestamp: m.timestamp,
            reply_to: m.reply_to,
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = String;

    fn try_from(w: WireMessage) -> Result<Self, String> {
        Ok(Self {
            body: MessageBody::from_parts(w.msg_type, w.payload)?,
            msg_id: w.msg_id,
            timestamp: w.timestamp,
            reply_to: w.reply_to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_type_wire_codes() {
        assert_eq!(u8::from(MessageType::Ping), 1);
        assert_eq!(u8::from(MessageType::Capture), 16);
        assert_eq!(u8::from(MessageType::Error), 18);
        assert_eq!(MessageType::try_from(7).unwrap(), MessageType::ButtonPressed);
        assert!(MessageType::try_from(0).is_err());
        assert!(MessageType::try_from(19).is_err());
    }

    #[test]
    fn test_envelope_roundtrip() {
        let msg = Message::new(MessageBody::Capture(CapturePayload {
            associated_to: "e1".to_string(),
            timestamp: Utc::now(),
            image_format: ImageFormat::Jpeg,
            image_data_b64: "aGVsbG8=".to_string(),
            has_face: true,
            width: None,
            height: None,
        }));

        let json = msg.to_json().unwrap();
        let decoded = Message::from_json(&json).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_wire_shape() {
        let msg = Message::new(MessageBody::MotionDetected);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["msg_type"], 5);
        assert_eq!(json["msg_id"], Value::String(msg.msg_id.clone()));
        assert!(json.get("payload").is_none());
        assert!(json.get("reply_to").is_none());
    }

    #[test]
    fn test_response_sets_reply_to() {
        let request = Message::new(MessageBody::Ping);
        let response = Message::response(&request, MessageBody::Pong);
        assert_eq!(response.reply_to.as_deref(), Some(request.msg_id.as_str()));
        assert_ne!(response.msg_id, request.msg_id);
    }

    #[test]
    fn test_missing_payload_rejected() {
        let raw = r#"{"msg_type": 16, "msg_id": "x", "timestamp": "2026-01-01T00:00:00Z"}"#;
        assert!(Message::from_json(raw).is_err());
    }

    #[test]
    fn test_stream_ack_payload_optional() {
        let raw = r#"{"msg_type": 10, "msg_id": "x", "timestamp": "2026-01-01T00:00:00Z"}"#;
        let msg = Message::from_json(raw).unwrap();
        assert_eq!(
            msg.body,
            MessageBody::StreamAck(StreamAckPayload { url: None })
        );
    }

    #[test]
    fn test_image_format_strings() {
        assert_eq!(
            serde_json::to_string(&ImageFormat::Yuv420).unwrap(),
            r#""yuv420""#
        );
        let format: ImageFormat = serde_json::from_str(r#""jpeg""#).unwrap();
        assert_eq!(format, ImageFormat::Jpeg);
    }

    #[test]
    fn test_sensor_kind_mapping() {
        assert_eq!(SensorKind::Button.title(), "Doorbell Pressed");
        assert_eq!(SensorKind::Motion.notification_type(), "motion_detected");
        assert_eq!(
            SensorKind::from_msg_type(MessageType::FaceDetected),
            Some(SensorKind::Face)
        );
        assert_eq!(SensorKind::from_msg_type(MessageType::Ping), None);
    }

    #[test]
    fn test_ack_status_strings() {
        let ack = NotificationAckPayload {
            status: AckStatus::RateLimited,
            notification_id: None,
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["status"], "rate_limited");
    }
}
