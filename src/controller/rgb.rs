//! RGB indicator
//!
//! The light is the user-visible mode flag: on while the camera is in use
//! (recording or streaming), off when idle. Driven as three plain GPIO
//! output lines; a channel is lit when its color component is non-zero.

use gpio_cdev::{Chip, LineHandle, LineRequestFlags};
use parking_lot::Mutex;
use tracing::debug;

use crate::config::{RgbColor, RgbConfig};
use crate::error::{AppError, Result};

/// Indicator control surface
pub trait RgbLight: Send + Sync {
    fn turn_on(&self) -> Result<()>;
    fn turn_off(&self) -> Result<()>;
    fn set_color(&self, color: RgbColor) -> Result<()>;
    fn color(&self) -> RgbColor;
}

struct GpioRgbInner {
    lines: [LineHandle; 3],
    color: RgbColor,
    lit: bool,
}

/// GPIO-backed indicator
pub struct GpioRgb {
    inner: Mutex<GpioRgbInner>,
}

impl GpioRgb {
    pub fn open(config: &RgbConfig) -> Result<Self> {
        let mut chip = Chip::new(&config.chip)
            .map_err(|e| AppError::Config(format!("GPIO chip open failed: {}", e)))?;

        let mut request = |pin: u32| -> Result<LineHandle> {
            chip.get_line(pin)
                .map_err(|e| AppError::Config(format!("GPIO line {} failed: {}", pin, e)))?
                .request(LineRequestFlags::OUTPUT, 0, "doorbell-rgb")
                .map_err(|e| AppError::Config(format!("GPIO request failed: {}", e)))
        };

        let lines = [
            request(config.pins.r)?,
            request(config.pins.g)?,
            request(config.pins.b)?,
        ];

        Ok(Self {
            inner: Mutex::new(GpioRgbInner {
                lines,
                color: config.color,
                lit: false,
            }),
        })
    }

    fn apply(inner: &GpioRgbInner) -> Result<()> {
        let components = [inner.color.r, inner.color.g, inner.color.b];
        for (line, component) in inner.lines.iter().zip(components) {
            let value = if inner.lit && component > 0 { 1 } else { 0 };
            line.set_value(value)
                .map_err(|e| AppError::Gpio(format!("write failed: {}", e)))?;
        }
        Ok(())
    }
}

impl RgbLight for GpioRgb {
    fn turn_on(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.lit = true;
        debug!("RGB on");
        Self::apply(&inner)
    }

    fn turn_off(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.lit = false;
        debug!("RGB off");
        Self::apply(&inner)
    }

    fn set_color(&self, color: RgbColor) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.color = color;
        // A lit indicator changes color immediately
        if inner.lit {
            Self::apply(&inner)?;
        }
        Ok(())
    }

    fn color(&self) -> RgbColor {
        self.inner.lock().color
    }
}

/// No-hardware indicator; remembers the requested state
#[derive(Default)]
pub struct NullRgb {
    state: Mutex<(bool, RgbColor)>,
}

impl NullRgb {
    pub fn is_lit(&self) -> bool {
        self.state.lock().0
    }
}

impl RgbLight for NullRgb {
    fn turn_on(&self) -> Result<()> {
        self.state.lock().0 = true;
        Ok(())
    }

    fn turn_off(&self) -> Result<()> {
        self.state.lock().0 = false;
        Ok(())
    }

    fn set_color(&self, color: RgbColor) -> Result<()> {
        self.state.lock().1 = color;
        Ok(())
    }

    fn color(&self) -> RgbColor {
        self.state.lock().1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_rgb_tracks_state() {
        let rgb = NullRgb::default();
        assert!(!rgb.is_lit());

        rgb.turn_on().unwrap();
        assert!(rgb.is_lit());

        rgb.set_color(RgbColor { r: 0, g: 255, b: 0 }).unwrap();
        assert_eq!(rgb.color().g, 255);

        rgb.turn_off().unwrap();
        assert!(!rgb.is_lit());
    }
}
