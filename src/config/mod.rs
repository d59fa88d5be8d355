pub mod schema;
pub mod store;

pub use schema::{
    CameraConfig, ControllerConfig, DeviceSettings, FcmConfig, HubConfig, JwtConfig,
    JwtKeyConfig, Resolution, RgbColor, RgbConfig, RgbPins, SensorConfig, SensorTuning,
    SensorTuningPatch, SettingsPatch, StopMotionConfig, StopMotionPatch, StopMotionTuning,
    TimeoutConfig, TurnServerConfig, WebConfig, WebRtcConfig,
};
pub use store::ConfigStore;
