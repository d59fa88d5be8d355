//! Configuration schema for the hub process and the device controller.
//!
//! The hub configuration lives in SQLite (see [`super::store::ConfigStore`])
//! and can be updated at runtime. The controller configuration is a JSON file
//! on the device; the tunable subset of it (debounce, polling rate, stop-motion
//! timing, RGB color) is also what travels over the session as settings.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

// ============================================================================
// Hub configuration
// ============================================================================

/// Top-level hub configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// HTTP/WebSocket listener
    pub web: WebConfig,
    /// JWT signing material
    pub jwt: JwtConfig,
    /// Directory where decoded capture frames are stored
    pub capture_dir: String,
    /// Minimum gap between two motion notifications for the same user
    pub motion_rate_limit_minutes: i64,
    /// User that owns the appliance; `"rpi"` token subjects map here
    pub owner_user_id: i64,
    /// Push delivery provider
    pub fcm: FcmConfig,
    /// Signaling / TURN settings
    pub webrtc: WebRtcConfig,
    /// Per-subsystem timeouts
    pub timeouts: TimeoutConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            web: WebConfig::default(),
            jwt: JwtConfig::default(),
            capture_dir: "captures".to_string(),
            motion_rate_limit_minutes: 1,
            owner_user_id: 1,
            fcm: FcmConfig::default(),
            webrtc: WebRtcConfig::default(),
            timeouts: TimeoutConfig::default(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub bind_address: String,
    pub http_port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            http_port: 8000,
        }
    }
}

/// JWT configuration (access + refresh keys)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JwtConfig {
    /// Signing algorithm name, e.g. "HS256"
    pub algorithm: String,
    pub access: JwtKeyConfig,
    pub refresh: JwtKeyConfig,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            algorithm: "HS256".to_string(),
            access: JwtKeyConfig {
                key: String::new(),
                expires_seconds: 3600,
            },
            refresh: JwtKeyConfig {
                key: String::new(),
                expires_seconds: 60 * 60 * 24 * 14,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct JwtKeyConfig {
    pub key: String,
    pub expires_seconds: i64,
}

/// Push delivery provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FcmConfig {
    /// Send endpoint
    pub endpoint: String,
    /// Server credential passed as `Authorization: key=...`
    pub server_key: String,
    /// Retry attempts for transient delivery errors
    pub max_retries: u32,
}

impl Default for FcmConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://fcm.googleapis.com/fcm/send".to_string(),
            server_key: String::new(),
            max_retries: 3,
        }
    }
}

/// Signaling / TURN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    /// Room the appliance broadcasts into
    pub room_id: String,
    pub turn_server: TurnServerConfig,
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            room_id: "doorbell".to_string(),
            turn_server: TurnServerConfig::default(),
        }
    }
}

/// TURN server shared-secret configuration (coturn REST style)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TurnServerConfig {
    /// Host:port of the TURN server; empty disables credential issuance
    pub host: String,
    /// Shared secret used to mint time-limited credentials
    pub secret: String,
    /// Credential lifetime in seconds
    pub ttl_seconds: i64,
}

impl TurnServerConfig {
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty() && !self.secret.is_empty()
    }
}

/// Per-subsystem timeouts, all hot-reloadable
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// How long a sender waits on a reply future
    pub reply_secs: u64,
    /// Idle cutoff for WebSocket sessions
    pub ws_inactivity_secs: u64,
    /// Per-attempt push send timeout
    pub push_send_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            reply_secs: 10,
            ws_inactivity_secs: 60,
            push_send_secs: 5,
        }
    }
}

// ============================================================================
// Controller configuration (device side)
// ============================================================================

/// Top-level controller configuration, loaded from a JSON file on the device
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Hub camera-session endpoint, e.g. `ws://hub:8000/api/ws/camera`
    pub ws_url: String,
    /// Signaling endpoint, e.g. `ws://hub:8000/api/ws/webrtc`
    pub signaling_server_url: String,
    /// Bearer token presented on both connect URLs
    pub auth_token: String,
    /// Identifier stamped onto events this device produces
    pub device_id: String,
    /// Room the device broadcasts into
    pub room_id: String,
    pub button: SensorConfig,
    pub motion_sensor: SensorConfig,
    pub camera: CameraConfig,
    pub rgb: RgbConfig,
    /// Grace period after streaming ends during which motion is ignored
    pub streaming_cooldown_seconds: u64,
    /// Delay before the transport reconnects after a dropped session
    pub reconnect_backoff_seconds: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            ws_url: "ws://localhost:8000/api/ws/camera".to_string(),
            signaling_server_url: "ws://localhost:8000/api/ws/webrtc".to_string(),
            auth_token: String::new(),
            device_id: "rpi".to_string(),
            room_id: "doorbell".to_string(),
            button: SensorConfig {
                chip: "/dev/gpiochip0".to_string(),
                pin: 17,
                debounce_ms: 200,
                polling_rate_hz: 50,
            },
            motion_sensor: SensorConfig {
                chip: "/dev/gpiochip0".to_string(),
                pin: 27,
                debounce_ms: 2000,
                polling_rate_hz: 10,
            },
            camera: CameraConfig::default(),
            rgb: RgbConfig::default(),
            streaming_cooldown_seconds: 5,
            reconnect_backoff_seconds: 5,
        }
    }
}

impl ControllerConfig {
    /// Load the controller configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| AppError::Config(format!("parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.ws_url.is_empty() {
            return Err(AppError::Config("ws_url must be set".to_string()));
        }
        if self.auth_token.is_empty() {
            return Err(AppError::Config("auth_token must be set".to_string()));
        }
        if self.button.polling_rate_hz == 0 || self.motion_sensor.polling_rate_hz == 0 {
            return Err(AppError::Config(
                "sensor polling_rate_hz must be > 0".to_string(),
            ));
        }
        if self.camera.stop_motion.interval_seconds <= 0.0 {
            return Err(AppError::Config(
                "stop_motion interval_seconds must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Snapshot of the remotely tunable subset
    pub fn settings(&self) -> DeviceSettings {
        DeviceSettings {
            button: SensorTuning {
                debounce_ms: self.button.debounce_ms,
                polling_rate_hz: self.button.polling_rate_hz,
            },
            motion_sensor: SensorTuning {
                debounce_ms: self.motion_sensor.debounce_ms,
                polling_rate_hz: self.motion_sensor.polling_rate_hz,
            },
            stop_motion: StopMotionTuning {
                interval_seconds: self.camera.stop_motion.interval_seconds,
                duration_seconds: self.camera.stop_motion.duration_seconds,
            },
            color: self.rgb.color,
        }
    }
}

/// One polled GPIO sensor (button or PIR)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    /// GPIO character device, e.g. `/dev/gpiochip0`
    pub chip: String,
    pub pin: u32,
    /// Minimum gap between two accepted triggers
    pub debounce_ms: u64,
    pub polling_rate_hz: u32,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            chip: "/dev/gpiochip0".to_string(),
            pin: 0,
            debounce_ms: 200,
            polling_rate_hz: 50,
        }
    }
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    /// Capture device, e.g. `/dev/video0`
    pub device: String,
    pub resolution: Resolution,
    pub framerate: u32,
    /// Pixel format requested from the driver: "yuv420" or "mjpeg"
    pub format: String,
    pub stop_motion: StopMotionConfig,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            device: "/dev/video0".to_string(),
            resolution: Resolution {
                width: 1280,
                height: 720,
            },
            framerate: 30,
            format: "yuv420".to_string(),
            stop_motion: StopMotionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// Stop-motion capture window
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StopMotionConfig {
    /// Seconds between captured frames
    pub interval_seconds: f64,
    /// How long a recording window lasts without new sensor events
    pub duration_seconds: u64,
    /// Local spool directory for frames that could not be sent
    pub output_dir: String,
}

impl Default for StopMotionConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 1.0,
            duration_seconds: 30,
            output_dir: "stop_motion".to_string(),
        }
    }
}

/// RGB indicator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RgbConfig {
    pub chip: String,
    pub pins: RgbPins,
    /// PWM frequency in Hz (software PWM)
    pub freq: u32,
    pub color: RgbColor,
}

impl Default for RgbConfig {
    fn default() -> Self {
        Self {
            chip: "/dev/gpiochip0".to_string(),
            pins: RgbPins { r: 22, g: 23, b: 24 },
            freq: 100,
            color: RgbColor {
                r: 255,
                g: 0,
                b: 0,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default)]
pub struct RgbPins {
    pub r: u32,
    pub g: u32,
    pub b: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RgbColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

// ============================================================================
// Remotely tunable settings (travel over the session)
// ============================================================================

/// Snapshot of the device tunables returned for a settings read
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DeviceSettings {
    pub button: SensorTuning,
    pub motion_sensor: SensorTuning,
    pub stop_motion: StopMotionTuning,
    pub color: RgbColor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorTuning {
    pub debounce_ms: u64,
    pub polling_rate_hz: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StopMotionTuning {
    pub interval_seconds: f64,
    pub duration_seconds: u64,
}

/// Partial settings update; absent fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button: Option<SensorTuningPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub motion_sensor: Option<SensorTuningPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_motion: Option<StopMotionPatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<RgbColor>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorTuningPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debounce_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling_rate_hz: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopMotionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}
