//! Mode state machine
//!
//! The device is always in exactly one of three modes: idle, recording
//! (stop-motion), or streaming. Every transition happens under one async
//! mutex; timers and the capture loop are cancellable tasks owned by the
//! machine. The RGB indicator is on exactly while the camera is in use.
//!
//! Preemption rules: a viewer appearing ends any recording and switches to
//! streaming; sensor events never interrupt streaming; after the last
//! viewer leaves, motion is suppressed for a cooldown so the camera does
//! not re-trigger on its own stream artefacts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::camera::FrameSource;
use super::capture::{run_stop_motion, CaptureQueue};
use super::face::FaceDetector;
use super::rgb::RgbLight;
use super::sensors::SensorEvent;
use crate::config::StopMotionTuning;
use crate::messages::SensorKind;

/// Exclusive device mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Recording,
    Streaming,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "idle"),
            ControllerState::Recording => write!(f, "recording"),
            ControllerState::Streaming => write!(f, "streaming"),
        }
    }
}

/// One recording window: the stop-motion loop plus its timer
struct RecordingWindow {
    event_id: String,
    /// Distinguishes the live timer from superseded ones that may already
    /// have fired and are waiting on the state mutex
    generation: u64,
    timer_cancel: CancellationToken,
    capture_cancel: CancellationToken,
}

struct MachineInner {
    state: ControllerState,
    recording: Option<RecordingWindow>,
    cooldown_cancel: Option<CancellationToken>,
    next_generation: u64,
}

/// The state machine itself; shared as `Arc` so timers can call back in
pub struct ModeController {
    inner: Mutex<MachineInner>,
    /// True from streaming start until the post-streaming cooldown ends
    suppress_motion: AtomicBool,
    camera: Arc<dyn FrameSource>,
    detector: Arc<dyn FaceDetector>,
    rgb: Arc<dyn RgbLight>,
    queue: Arc<CaptureQueue>,
    events_tx: mpsc::Sender<SensorEvent>,
    stop_motion_tuning: Arc<SyncMutex<StopMotionTuning>>,
    cooldown: Duration,
    source_device_id: String,
}

impl ModeController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: Arc<dyn FrameSource>,
        detector: Arc<dyn FaceDetector>,
        rgb: Arc<dyn RgbLight>,
        queue: Arc<CaptureQueue>,
        events_tx: mpsc::Sender<SensorEvent>,
        stop_motion_tuning: Arc<SyncMutex<StopMotionTuning>>,
        cooldown: Duration,
        source_device_id: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(MachineInner {
                state: ControllerState::Idle,
                recording: None,
                cooldown_cancel: None,
                next_generation: 0,
            }),
            suppress_motion: AtomicBool::new(false),
            camera,
            detector,
            rgb,
            queue,
            events_tx,
            stop_motion_tuning,
            cooldown,
            source_device_id,
        })
    }

    /// Current mode
    pub async fn state(&self) -> ControllerState {
        self.inner.lock().await.state
    }

    /// React to a sensor event
    ///
    /// Returns false when the event is suppressed (motion during streaming
    /// or cooldown); suppressed events are not forwarded to the hub.
    pub async fn handle_sensor_event(self: &Arc<Self>, event: &SensorEvent) -> bool {
        if event.kind == SensorKind::Motion && self.suppress_motion.load(Ordering::Relaxed) {
            debug!(id = %event.id, "suppressing motion event (streaming/cooldown)");
            return false;
        }

        let mut inner = self.inner.lock().await;
        match inner.state {
            ControllerState::Idle => {
                info!(kind = ?event.kind, id = %event.id, "sensor event in idle, starting recording");
                self.begin_recording_locked(&mut inner, event);
            }
            ControllerState::Recording => {
                debug!(kind = ?event.kind, id = %event.id, "sensor event during recording, resetting timer");
                self.reset_timer_locked(&mut inner);
            }
            ControllerState::Streaming => {
                debug!(kind = ?event.kind, id = %event.id, "sensor event during streaming, no recording");
            }
        }
        true
    }

    /// A viewer appeared (broker presence or a remote stream-start)
    pub async fn on_viewers_present(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;

        // Streaming wins over everything; motion stays suppressed until
        // the cooldown after the last viewer leaves
        self.suppress_motion.store(true, Ordering::Relaxed);
        if let Some(cancel) = inner.cooldown_cancel.take() {
            cancel.cancel();
        }

        match inner.state {
            ControllerState::Recording => {
                info!("viewer present, preempting recording");
                self.stop_recording_locked(&mut inner, ControllerState::Streaming);
            }
            ControllerState::Idle => {
                self.transition_locked(&mut inner, ControllerState::Streaming);
            }
            ControllerState::Streaming => {}
        }
    }

    /// The last viewer left (or a remote stream-stop arrived)
    pub async fn on_viewers_gone(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;

        if inner.state == ControllerState::Streaming {
            self.transition_locked(&mut inner, ControllerState::Idle);
        }

        if let Some(cancel) = inner.cooldown_cancel.take() {
            cancel.cancel();
        }
        let cancel = CancellationToken::new();
        inner.cooldown_cancel = Some(cancel.clone());

        let machine = self.clone();
        let cooldown = self.cooldown;
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => debug!("streaming cooldown cancelled"),
                _ = tokio::time::sleep(cooldown) => {
                    machine.suppress_motion.store(false, Ordering::Relaxed);
                    info!("streaming cooldown complete, motion re-enabled");
                }
            }
        });
        info!(cooldown = ?self.cooldown, "streaming ended, cooldown armed");
    }

    /// Stop everything; terminal
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(recording) = inner.recording.take() {
            recording.timer_cancel.cancel();
            recording.capture_cancel.cancel();
        }
        if let Some(cancel) = inner.cooldown_cancel.take() {
            cancel.cancel();
        }
        self.transition_locked(&mut inner, ControllerState::Idle);
        info!("state machine shut down");
    }

    // ========================================================================
    // Locked helpers
    // ========================================================================

    fn begin_recording_locked(self: &Arc<Self>, inner: &mut MachineInner, event: &SensorEvent) {
        // The readiness probe is quick; a camera that cannot open aborts
        // the transition and the machine stays idle
        if let Err(e) = self.camera.open() {
            warn!("camera unavailable, recording not started: {}", e);
            return;
        }

        let capture_cancel = CancellationToken::new();
        tokio::spawn(run_stop_motion(
            event.id.clone(),
            self.source_device_id.clone(),
            self.camera.clone(),
            self.detector.clone(),
            self.queue.clone(),
            self.events_tx.clone(),
            self.stop_motion_tuning.clone(),
            capture_cancel.clone(),
        ));

        let generation = inner.next_generation;
        inner.next_generation += 1;
        let timer_cancel = self.arm_timer(generation);

        inner.recording = Some(RecordingWindow {
            event_id: event.id.clone(),
            generation,
            timer_cancel,
            capture_cancel,
        });
        self.transition_locked(inner, ControllerState::Recording);
    }

    fn reset_timer_locked(self: &Arc<Self>, inner: &mut MachineInner) {
        if inner.recording.is_none() {
            warn!("recording state without a window, ignoring reset");
            return;
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        let new_timer = self.arm_timer(generation);

        // New timer, same event id: captures keep correlating to the
        // event that opened the recording
        if let Some(recording) = inner.recording.as_mut() {
            recording.timer_cancel.cancel();
            recording.timer_cancel = new_timer;
            recording.generation = generation;
        }
    }

    fn arm_timer(self: &Arc<Self>, generation: u64) -> CancellationToken {
        let cancel = CancellationToken::new();
        let duration =
            Duration::from_secs(self.stop_motion_tuning.lock().duration_seconds.max(1));

        let machine = self.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => debug!("recording timer cancelled"),
                _ = tokio::time::sleep(duration) => machine.timer_expired(generation).await,
            }
        });

        cancel
    }

    async fn timer_expired(self: Arc<Self>, generation: u64) {
        let mut inner = self.inner.lock().await;

        let live = inner
            .recording
            .as_ref()
            .map(|recording| recording.generation == generation)
            .unwrap_or(false);

        if inner.state == ControllerState::Recording && live {
            info!("recording timer expired, stopping recording");
            self.stop_recording_locked(&mut inner, ControllerState::Idle);
        } else {
            debug!(generation, "stale recording timer, ignoring");
        }
    }

    fn stop_recording_locked(&self, inner: &mut MachineInner, next: ControllerState) {
        if let Some(recording) = inner.recording.take() {
            recording.timer_cancel.cancel();
            recording.capture_cancel.cancel();
            info!(event_id = %recording.event_id, "stop-motion ended");
        }
        self.transition_locked(inner, next);
    }

    fn transition_locked(&self, inner: &mut MachineInner, new: ControllerState) {
        if inner.state == new {
            return;
        }
        info!(from = %inner.state, to = %new, "state transition");
        inner.state = new;

        let result = match new {
            ControllerState::Recording | ControllerState::Streaming => self.rgb.turn_on(),
            ControllerState::Idle => self.rgb.turn_off(),
        };
        if let Err(e) = result {
            warn!("RGB update failed during transition: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::camera::Frame;
    use crate::controller::rgb::NullRgb;
    use bytes::Bytes;
    use chrono::Utc;

    struct StaticCamera;

    impl FrameSource for StaticCamera {
        fn open(&self) -> crate::Result<()> {
            Ok(())
        }

        fn capture_frame(&self) -> crate::Result<Frame> {
            Ok(Frame {
                data: Bytes::from_static(b"frame"),
                format: crate::messages::ImageFormat::Jpeg,
                width: 16,
                height: 16,
                timestamp: Utc::now(),
            })
        }
    }

    struct BrokenCamera;

    impl FrameSource for BrokenCamera {
        fn open(&self) -> crate::Result<()> {
            Err(crate::AppError::Camera("no device".to_string()))
        }

        fn capture_frame(&self) -> crate::Result<Frame> {
            Err(crate::AppError::Camera("no device".to_string()))
        }
    }

    struct NeverFace;

    impl crate::controller::face::FaceDetector for NeverFace {
        fn detect(&self, _frame: &Frame) -> bool {
            false
        }
    }

    struct Fixture {
        machine: Arc<ModeController>,
        rgb: Arc<NullRgb>,
        queue: Arc<CaptureQueue>,
        _events_rx: mpsc::Receiver<SensorEvent>,
    }

    fn fixture_with_camera(camera: Arc<dyn FrameSource>, duration_seconds: u64) -> Fixture {
        let rgb = Arc::new(NullRgb::default());
        let queue = Arc::new(CaptureQueue::new(64));
        let (events_tx, events_rx) = mpsc::channel(64);
        let tuning = Arc::new(SyncMutex::new(StopMotionTuning {
            interval_seconds: 0.05,
            duration_seconds,
        }));

        let machine = ModeController::new(
            camera,
            Arc::new(NeverFace),
            rgb.clone(),
            queue.clone(),
            events_tx,
            tuning,
            Duration::from_secs(5),
            "rpi".to_string(),
        );

        Fixture {
            machine,
            rgb,
            queue,
            _events_rx: events_rx,
        }
    }

    fn fixture(duration_seconds: u64) -> Fixture {
        fixture_with_camera(Arc::new(StaticCamera), duration_seconds)
    }

    fn event(kind: SensorKind) -> SensorEvent {
        SensorEvent::new(kind, "rpi")
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_event_starts_recording() {
        let f = fixture(30);

        assert!(f.machine.handle_sensor_event(&event(SensorKind::Button)).await);
        assert_eq!(f.machine.state().await, ControllerState::Recording);
        assert!(f.rgb.is_lit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_captures_keep_window_event_id_across_resets() {
        let f = fixture(30);
        let first = event(SensorKind::Motion);

        f.machine.handle_sensor_event(&first).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // A new event during recording resets the timer but not the window id
        f.machine.handle_sensor_event(&event(SensorKind::Motion)).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        let capture = f.queue.pop().await;
        assert_eq!(capture.event_id, first.id);
        assert_eq!(f.machine.state().await, ControllerState::Recording);

        f.machine.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_expiry_returns_to_idle() {
        let f = fixture(10);

        f.machine.handle_sensor_event(&event(SensorKind::Motion)).await;
        assert_eq!(f.machine.state().await, ControllerState::Recording);

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(f.machine.state().await, ControllerState::Idle);
        assert!(!f.rgb.is_lit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_once_per_window_despite_resets() {
        let f = fixture(10);

        f.machine.handle_sensor_event(&event(SensorKind::Motion)).await;
        tokio::time::sleep(Duration::from_secs(6)).await;

        // Reset at t=6; the original deadline (t=10) must not fire
        f.machine.handle_sensor_event(&event(SensorKind::Motion)).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(f.machine.state().await, ControllerState::Recording);

        // The re-armed deadline (t=16) does
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(f.machine.state().await, ControllerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewer_preempts_recording() {
        let f = fixture(30);

        f.machine.handle_sensor_event(&event(SensorKind::Motion)).await;
        assert_eq!(f.machine.state().await, ControllerState::Recording);

        f.machine.on_viewers_present().await;
        assert_eq!(f.machine.state().await, ControllerState::Streaming);
        // RGB stays on through the preemption
        assert!(f.rgb.is_lit());

        // The cancelled recording timer must not drag us back to idle
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.machine.state().await, ControllerState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sensor_events_ignored_while_streaming() {
        let f = fixture(30);

        f.machine.on_viewers_present().await;
        assert_eq!(f.machine.state().await, ControllerState::Streaming);

        // Button events are forwarded but never start a recording
        assert!(f.machine.handle_sensor_event(&event(SensorKind::Button)).await);
        assert_eq!(f.machine.state().await, ControllerState::Streaming);
        // Motion is suppressed outright
        assert!(!f.machine.handle_sensor_event(&event(SensorKind::Motion)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_suppresses_motion_then_releases() {
        let f = fixture(30);

        f.machine.on_viewers_present().await;
        f.machine.on_viewers_gone().await;
        assert_eq!(f.machine.state().await, ControllerState::Idle);
        assert!(!f.rgb.is_lit());

        // Inside the 5s cooldown: motion dropped, no recording
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!f.machine.handle_sensor_event(&event(SensorKind::Motion)).await);
        assert_eq!(f.machine.state().await, ControllerState::Idle);

        // After the cooldown: motion works again
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(f.machine.handle_sensor_event(&event(SensorKind::Motion)).await);
        assert_eq!(f.machine.state().await, ControllerState::Recording);
    }

    #[tokio::test(start_paused = true)]
    async fn test_viewers_returning_cancels_cooldown_release() {
        let f = fixture(30);

        f.machine.on_viewers_present().await;
        f.machine.on_viewers_gone().await;
        // Viewers come back mid-cooldown
        tokio::time::sleep(Duration::from_secs(2)).await;
        f.machine.on_viewers_present().await;

        // Long after the old cooldown would have expired, motion is still
        // suppressed because we are streaming again
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!f.machine.handle_sensor_event(&event(SensorKind::Motion)).await);
        assert_eq!(f.machine.state().await, ControllerState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_camera_failure_aborts_recording_transition() {
        let f = fixture_with_camera(Arc::new(BrokenCamera), 30);

        assert!(f.machine.handle_sensor_event(&event(SensorKind::Button)).await);
        assert_eq!(f.machine.state().await, ControllerState::Idle);
        assert!(!f.rgb.is_lit());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_from_recording() {
        let f = fixture(30);

        f.machine.handle_sensor_event(&event(SensorKind::Motion)).await;
        f.machine.shutdown().await;

        assert_eq!(f.machine.state().await, ControllerState::Idle);
        assert!(!f.rgb.is_lit());

        // No timer left to fire
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(f.machine.state().await, ControllerState::Idle);
    }
}
