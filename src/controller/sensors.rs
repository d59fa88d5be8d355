//! Sensor polling loops
//!
//! Each hardware sensor (doorbell button, PIR motion detector) runs its own
//! polling task: read the line, debounce, and enqueue one event per accepted
//! trigger. Debounce and polling rate are hot-swappable through the shared
//! tuning cell, so a settings change takes effect on the next poll.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use gpio_cdev::{Chip, LineHandle, LineRequestFlags};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{SensorConfig, SensorTuning};
use crate::error::{AppError, Result};
use crate::messages::SensorKind;

/// One debounced sensor trigger, as consumed by the state machine
#[derive(Debug, Clone, PartialEq)]
pub struct SensorEvent {
    /// Event id; becomes the wire `msg_id` and the hub's `rpi_event_id`
    pub id: String,
    pub kind: SensorKind,
    pub timestamp: chrono::DateTime<Utc>,
    pub source_device_id: String,
}

impl SensorEvent {
    pub fn new(kind: SensorKind, source_device_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
            source_device_id: source_device_id.to_string(),
        }
    }
}

/// A pollable input line
pub trait Sensor: Send {
    /// Whether the input is currently active; expected to return quickly
    fn triggered(&mut self) -> Result<bool>;
}

/// GPIO-backed sensor (active low, internal state in the line handle)
pub struct GpioSensor {
    handle: LineHandle,
    /// Raw value that counts as active
    active_value: u8,
}

impl GpioSensor {
    pub fn open(config: &SensorConfig, consumer: &str, active_value: u8) -> Result<Self> {
        let mut chip = Chip::new(&config.chip)
            .map_err(|e| AppError::Config(format!("GPIO chip open failed: {}", e)))?;
        let line = chip
            .get_line(config.pin)
            .map_err(|e| AppError::Config(format!("GPIO line {} failed: {}", config.pin, e)))?;
        let handle = line
            .request(LineRequestFlags::INPUT, 0, consumer)
            .map_err(|e| AppError::Config(format!("GPIO request failed: {}", e)))?;

        Ok(Self {
            handle,
            active_value,
        })
    }
}

impl Sensor for GpioSensor {
    fn triggered(&mut self) -> Result<bool> {
        let value = self
            .handle
            .get_value()
            .map_err(|e| AppError::Gpio(format!("read failed: {}", e)))?;
        Ok(value == self.active_value)
    }
}

/// Pure debounce gate: accepts a trigger when at least `debounce` has passed
/// since the last accepted one
#[derive(Default)]
pub struct DebounceGate {
    last_trigger: Option<Instant>,
}

impl DebounceGate {
    pub fn accept(&mut self, now: Instant, debounce: Duration) -> bool {
        let accepted = match self.last_trigger {
            Some(last) => now.duration_since(last) >= debounce,
            None => true,
        };
        if accepted {
            self.last_trigger = Some(now);
        }
        accepted
    }
}

/// Polling loop for one sensor
pub struct SensorService {
    kind: SensorKind,
    source_device_id: String,
    tuning: Arc<Mutex<SensorTuning>>,
    events_tx: mpsc::Sender<SensorEvent>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SensorService {
    pub fn new(
        kind: SensorKind,
        source_device_id: String,
        tuning: Arc<Mutex<SensorTuning>>,
        events_tx: mpsc::Sender<SensorEvent>,
        shutdown_tx: broadcast::Sender<()>,
    ) -> Self {
        Self {
            kind,
            source_device_id,
            tuning,
            events_tx,
            shutdown_tx,
        }
    }

    /// Run the polling loop until shutdown
    pub async fn run(&self, mut sensor: Box<dyn Sensor>) {
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut gate = DebounceGate::default();

        info!(kind = ?self.kind, "sensor polling started");

        loop {
            let (debounce, poll_interval) = {
                let tuning = self.tuning.lock();
                (
                    Duration::from_millis(tuning.debounce_ms),
                    Duration::from_secs_f64(1.0 / tuning.polling_rate_hz.max(1) as f64),
                )
            };

            match sensor.triggered() {
                Ok(true) => {
                    if gate.accept(Instant::now(), debounce) {
                        let event = SensorEvent::new(self.kind, &self.source_device_id);
                        debug!(kind = ?self.kind, id = %event.id, "sensor triggered");
                        // Events are rare and correlation-critical: block
                        // rather than drop when the queue is full
                        if self.events_tx.send(event).await.is_err() {
                            warn!(kind = ?self.kind, "event queue closed, stopping sensor");
                            break;
                        }
                    }
                }
                Ok(false) => {}
                Err(e) => warn!(kind = ?self.kind, "sensor read failed: {}", e),
            }

            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }

        info!(kind = ?self.kind, "sensor polling stopped");
    }
}
