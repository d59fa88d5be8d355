//! Face detection seam
//!
//! The classifier itself is an external model; the pipeline only needs a
//! yes/no per frame. Detection runs on the same worker thread as the frame
//! grab, so implementations may block.

use super::camera::Frame;

/// Pure-function face classifier
pub trait FaceDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> bool;
}

/// Detector used when no model is deployed; never matches
pub struct NullFaceDetector;

impl FaceDetector for NullFaceDetector {
    fn detect(&self, _frame: &Frame) -> bool {
        false
    }
}
