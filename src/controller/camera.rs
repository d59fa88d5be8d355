//! Camera abstraction
//!
//! Stop-motion needs exactly one frame per tick, so the camera surface is a
//! blocking `capture_frame` intended to run on a worker thread. The V4L2
//! implementation opens the device per grab, which keeps the device free
//! for the streaming stack between recording windows.

use std::path::PathBuf;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use v4l::buffer::Type as BufferType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::Format;
use v4l::FourCC;

use crate::config::CameraConfig;
use crate::error::{AppError, Result};
use crate::messages::ImageFormat;

/// Anything smaller is a corrupt or torn buffer
const MIN_FRAME_SIZE: usize = 1024;

/// One captured frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    pub timestamp: DateTime<Utc>,
}

/// Camera surface used by the capture pipeline
pub trait FrameSource: Send + Sync {
    /// Readiness probe; a failure here aborts entering stop-motion
    fn open(&self) -> Result<()>;

    /// Capture one frame (blocking; call from a worker thread)
    fn capture_frame(&self) -> Result<Frame>;
}

/// V4L2-backed camera
pub struct V4lCamera {
    device_path: PathBuf,
    width: u32,
    height: u32,
    fourcc: FourCC,
    output_format: ImageFormat,
}

impl V4lCamera {
    pub fn new(config: &CameraConfig) -> Self {
        let (fourcc, output_format) = match config.format.to_ascii_lowercase().as_str() {
            "mjpeg" | "jpeg" => (FourCC::new(b"MJPG"), ImageFormat::Jpeg),
            // Raw capture is YUYV on the wire from the driver; frames leave
            // the device as planar I420
            _ => (FourCC::new(b"YUYV"), ImageFormat::Yuv420),
        };

        Self {
            device_path: PathBuf::from(&config.device),
            width: config.resolution.width,
            height: config.resolution.height,
            fourcc,
            output_format,
        }
    }
}

impl FrameSource for V4lCamera {
    fn open(&self) -> Result<()> {
        Device::with_path(&self.device_path)
            .map(|_| ())
            .map_err(|e| AppError::Camera(format!("failed to open camera: {}", e)))
    }

    fn capture_frame(&self) -> Result<Frame> {
        let device = Device::with_path(&self.device_path)
            .map_err(|e| AppError::Camera(format!("failed to open camera: {}", e)))?;

        let fmt = Format::new(self.width, self.height, self.fourcc);
        let actual = device
            .set_format(&fmt)
            .map_err(|e| AppError::Camera(format!("failed to set format: {}", e)))?;

        let mut stream = MmapStream::with_buffers(&device, BufferType::VideoCapture, 2)
            .map_err(|e| AppError::Camera(format!("failed to create stream: {}", e)))?;

        // Skip torn first buffers from sensors that need a warm-up frame
        for attempt in 0..5 {
            match stream.next() {
                Ok((buf, _meta)) if buf.len() >= MIN_FRAME_SIZE => {
                    let timestamp = Utc::now();
                    let (data, format) = match self.output_format {
                        ImageFormat::Yuv420 => (
                            Bytes::from(yuyv_to_i420(buf, actual.width, actual.height)?),
                            ImageFormat::Yuv420,
                        ),
                        format => (Bytes::copy_from_slice(buf), format),
                    };
                    return Ok(Frame {
                        data,
                        format,
                        width: actual.width,
                        height: actual.height,
                        timestamp,
                    });
                }
                Ok(_) => {}
                Err(e) if attempt == 4 => {
                    return Err(AppError::Camera(format!("failed to grab frame: {}", e)));
                }
                Err(_) => {}
            }
        }

        Err(AppError::Camera("no valid frame captured".to_string()))
    }
}

/// Packed YUYV (4:2:2) to planar I420 (4:2:0), chroma from even rows
fn yuyv_to_i420(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>> {
    let w = width as usize;
    let h = height as usize;
    if w % 2 != 0 || h % 2 != 0 {
        return Err(AppError::Camera("frame dimensions must be even".to_string()));
    }
    if data.len() < w * h * 2 {
        return Err(AppError::Camera(format!(
            "yuyv buffer is {} bytes, expected {} for {}x{}",
            data.len(),
            w * h * 2,
            width,
            height
        )));
    }

    let mut out = vec![0u8; w * h * 3 / 2];
    let (y_plane, chroma) = out.split_at_mut(w * h);
    let (u_plane, v_plane) = chroma.split_at_mut(w * h / 4);

    for row in 0..h {
        for col in 0..w {
            y_plane[row * w + col] = data[(row * w + col) * 2];
        }
    }
    for row in (0..h).step_by(2) {
        for col in (0..w).step_by(2) {
            let src = (row * w + col) * 2;
            let dst = (row / 2) * (w / 2) + col / 2;
            u_plane[dst] = data[src + 1];
            v_plane[dst] = data[src + 3];
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_i420_layout() {
        // 2x2 frame: pixels (Y0 U Y1 V) per pair
        let data = [10u8, 100, 20, 200, 30, 110, 40, 210];
        let out = yuyv_to_i420(&data, 2, 2).unwrap();

        assert_eq!(out.len(), 6);
        // Y plane row-major
        assert_eq!(&out[..4], &[10, 20, 30, 40]);
        // One chroma sample per 2x2 block, from the even row
        assert_eq!(out[4], 100);
        assert_eq!(out[5], 200);
    }

    #[test]
    fn test_yuyv_rejects_short_buffer() {
        assert!(matches!(
            yuyv_to_i420(&[0u8; 4], 2, 2),
            Err(AppError::Camera(_))
        ));
    }

    #[test]
    fn test_yuyv_rejects_odd_dimensions() {
        assert!(matches!(
            yuyv_to_i420(&[0u8; 32], 3, 3),
            Err(AppError::Camera(_))
        ));
    }

    #[test]
    fn test_v4l_camera_format_selection() {
        let mut config = CameraConfig::default();
        config.format = "mjpeg".to_string();
        let camera = V4lCamera::new(&config);
        assert_eq!(camera.output_format, ImageFormat::Jpeg);

        config.format = "yuv420".to_string();
        let camera = V4lCamera::new(&config);
        assert_eq!(camera.output_format, ImageFormat::Yuv420);
    }
}
