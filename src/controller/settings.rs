//! Live device tunables
//!
//! The remotely adjustable knobs (sensor debounce/polling, stop-motion
//! timing, RGB color) live in shared cells read by the running loops, so a
//! settings change over the session takes effect without restarting
//! anything.

use std::sync::Arc;

use parking_lot::Mutex;

use super::rgb::RgbLight;
use crate::config::{
    ControllerConfig, DeviceSettings, SensorTuning, SettingsPatch, StopMotionTuning,
};
use crate::error::{AppError, Result};

/// Shared tuning cells handed to the sensor loops and the state machine
#[derive(Clone)]
pub struct Tunables {
    pub button: Arc<Mutex<SensorTuning>>,
    pub motion: Arc<Mutex<SensorTuning>>,
    pub stop_motion: Arc<Mutex<StopMotionTuning>>,
}

impl Tunables {
    pub fn from_config(config: &ControllerConfig) -> Self {
        let settings = config.settings();
        Self {
            button: Arc::new(Mutex::new(settings.button)),
            motion: Arc::new(Mutex::new(settings.motion_sensor)),
            stop_motion: Arc::new(Mutex::new(settings.stop_motion)),
        }
    }

    /// Snapshot for a settings read
    pub fn snapshot(&self, rgb: &dyn RgbLight) -> DeviceSettings {
        DeviceSettings {
            button: *self.button.lock(),
            motion_sensor: *self.motion.lock(),
            stop_motion: *self.stop_motion.lock(),
            color: rgb.color(),
        }
    }

    /// Apply a partial update; validation failures leave everything as-is
    pub fn apply(&self, patch: &SettingsPatch, rgb: &dyn RgbLight) -> Result<DeviceSettings> {
        validate(patch)?;

        if let Some(button) = &patch.button {
            let mut tuning = self.button.lock();
            if let Some(debounce_ms) = button.debounce_ms {
                tuning.debounce_ms = debounce_ms;
            }
            if let Some(polling_rate_hz) = button.polling_rate_hz {
                tuning.polling_rate_hz = polling_rate_hz;
            }
        }

        if let Some(motion) = &patch.motion_sensor {
            let mut tuning = self.motion.lock();
            if let Some(debounce_ms) = motion.debounce_ms {
                tuning.debounce_ms = debounce_ms;
            }
            if let Some(polling_rate_hz) = motion.polling_rate_hz {
                tuning.polling_rate_hz = polling_rate_hz;
            }
        }

        if let Some(stop_motion) = &patch.stop_motion {
            let mut tuning = self.stop_motion.lock();
            if let Some(interval_seconds) = stop_motion.interval_seconds {
                tuning.interval_seconds = interval_seconds;
            }
            if let Some(duration_seconds) = stop_motion.duration_seconds {
                tuning.duration_seconds = duration_seconds;
            }
        }

        if let Some(color) = patch.color {
            rgb.set_color(color)?;
        }

        Ok(self.snapshot(rgb))
    }
}

fn validate(patch: &SettingsPatch) -> Result<()> {
    let mut bad_fields = Vec::new();

    for (name, sensor) in [
        ("button", &patch.button),
        ("motion_sensor", &patch.motion_sensor),
    ] {
        if let Some(sensor) = sensor {
            if sensor.polling_rate_hz == Some(0) {
                bad_fields.push(format!("{}.polling_rate_hz", name));
            }
        }
    }

    if let Some(stop_motion) = &patch.stop_motion {
        if matches!(stop_motion.interval_seconds, Some(v) if v <= 0.0) {
            bad_fields.push("stop_motion.interval_seconds".to_string());
        }
        if stop_motion.duration_seconds == Some(0) {
            bad_fields.push("stop_motion.duration_seconds".to_string());
        }
    }

    if bad_fields.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "invalid field(s): {}",
            bad_fields.join(", ")
        )))
    }
}
