//! Stop-motion capture pipeline
//!
//! While recording, a loop grabs one frame per interval, runs the face
//! classifier, and enqueues captures for the sender task. The capture queue
//! is bounded and drops its oldest entry on overflow: frames are plentiful
//! and replaceable, sensor events are not.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::camera::{Frame, FrameSource};
use super::face::FaceDetector;
use super::sensors::SensorEvent;
use crate::config::StopMotionTuning;
use crate::messages::{CapturePayload, ImageFormat, Message, MessageBody, SensorKind};
use crate::transport::Transport;

/// One frame tagged with the event that owns it
#[derive(Debug, Clone)]
pub struct Capture {
    /// Event id the hub will correlate this frame to
    pub event_id: String,
    pub frame: Frame,
    pub has_face: bool,
}

/// Bounded queue with drop-oldest overflow
pub struct CaptureQueue {
    inner: Mutex<VecDeque<Capture>>,
    capacity: usize,
    notify: Notify,
    dropped: AtomicU64,
}

impl CaptureQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue a capture, evicting the oldest one when full
    pub fn push(&self, capture: Capture) {
        {
            let mut queue = self.inner.lock();
            if queue.len() >= self.capacity {
                queue.pop_front();
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(dropped, "capture queue full, dropped oldest frame");
            }
            queue.push_back(capture);
        }
        self.notify.notify_one();
    }

    /// Wait for the next capture
    pub async fn pop(&self) -> Capture {
        loop {
            if let Some(capture) = self.inner.lock().pop_front() {
                return capture;
            }
            self.notify.notified().await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Total captures evicted since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// The stop-motion loop for one recording window
///
/// Runs until cancelled. Per tick: grab a frame (on a blocking worker),
/// classify it, feed a synthesized face event back into the sensor queue
/// when a face appears, and enqueue the capture tagged with the window's
/// event id. Camera errors are logged and the loop keeps going.
pub async fn run_stop_motion(
    event_id: String,
    source_device_id: String,
    camera: Arc<dyn FrameSource>,
    detector: Arc<dyn FaceDetector>,
    queue: Arc<CaptureQueue>,
    events_tx: mpsc::Sender<SensorEvent>,
    tuning: Arc<Mutex<StopMotionTuning>>,
    cancel: CancellationToken,
) {
    info!(event_id = %event_id, "stop-motion started");
    let mut frame_count: u64 = 0;

    loop {
        let started = Instant::now();
        let interval = Duration::from_secs_f64(tuning.lock().interval_seconds.max(0.01));

        let camera = camera.clone();
        let detector = detector.clone();
        let grab = tokio::task::spawn_blocking(move || {
            let frame = camera.capture_frame()?;
            let has_face = detector.detect(&frame);
            crate::Result::Ok((frame, has_face))
        });

        let grabbed = tokio::select! {
            _ = cancel.cancelled() => break,
            grabbed = grab => grabbed,
        };

        match grabbed {
            Ok(Ok((frame, has_face))) => {
                frame_count += 1;
                debug!(event_id = %event_id, frame_count, has_face, "captured frame");

                if has_face {
                    // The synthesized event resets the recording timer and
                    // gets its own notification on the hub; the frame that
                    // triggered it is filed under that event too
                    let face_event = SensorEvent::new(SensorKind::Face, &source_device_id);
                    queue.push(Capture {
                        event_id: face_event.id.clone(),
                        frame: frame.clone(),
                        has_face: true,
                    });
                    if events_tx.send(face_event).await.is_err() {
                        warn!("event queue closed, stopping stop-motion");
                        break;
                    }
                }

                queue.push(Capture {
                    event_id: event_id.clone(),
                    frame,
                    has_face,
                });
            }
            Ok(Err(e)) => warn!(event_id = %event_id, "frame capture failed: {}", e),
            Err(e) => warn!(event_id = %event_id, "capture worker failed: {}", e),
        }

        let sleep_for = interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(sleep_for) => {}
        }
    }

    info!(event_id = %event_id, frame_count, "stop-motion ended");
}

/// Drains the capture queue into the hub session
///
/// Runs for the lifetime of the controller. When the link is down the frame
/// is spooled to the stop-motion output directory instead; spooled frames
/// are not resent, the hub de-duplicates whatever the device replays.
pub async fn run_capture_sender(
    queue: Arc<CaptureQueue>,
    transport: Transport,
    spool_dir: PathBuf,
    shutdown_tx: broadcast::Sender<()>,
) {
    let mut shutdown = shutdown_tx.subscribe();

    loop {
        let capture = tokio::select! {
            _ = shutdown.recv() => break,
            capture = queue.pop() => capture,
        };

        let message = capture_message(&capture);
        if let Err(e) = transport.send(message) {
            debug!("capture not sent ({}), spooling to disk", e);
            if let Err(e) = spool_frame(&spool_dir, &capture).await {
                warn!("failed to spool frame: {}", e);
            }
        }
    }

    info!("capture sender stopped");
}

async fn spool_frame(dir: &Path, capture: &Capture) -> crate::Result<()> {
    tokio::fs::create_dir_all(dir).await?;

    let extension = match capture.frame.format {
        ImageFormat::Jpeg => "jpg",
        ImageFormat::Png => "png",
        ImageFormat::Yuv420 => "yuv",
    };
    let filename = format!(
        "frame_{}_{}.{}",
        capture.frame.timestamp.format("%Y%m%dT%H%M%S%3f"),
        &capture.event_id[..capture.event_id.len().min(8)],
        extension
    );
    tokio::fs::write(dir.join(filename), &capture.frame.data).await?;
    Ok(())
}

fn capture_message(capture: &Capture) -> Message {
    let frame = &capture.frame;
    let raw = matches!(frame.format, ImageFormat::Yuv420);
    Message::new(MessageBody::Capture(CapturePayload {
        associated_to: capture.event_id.clone(),
        timestamp: frame.timestamp,
        image_format: frame.format,
        image_data_b64: BASE64.encode(&frame.data),
        has_face: capture.has_face,
        width: raw.then_some(frame.width),
        height: raw.then_some(frame.height),
    }))
}
