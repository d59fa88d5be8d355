//! Frame muxing for stored captures
//!
//! Devices send frames as JPEG, PNG, or raw planar YUV420. JPEG and PNG are
//! stored as received; raw YUV is converted to an RGB image and encoded as
//! JPEG before it reaches the capture directory. The conversion is CPU-bound
//! and is expected to run on a blocking worker.

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use crate::error::{AppError, Result};
use crate::messages::ImageFormat;

/// Default JPEG quality for muxed raw frames
const JPEG_QUALITY: u8 = 85;

/// Convert an incoming frame to its storable form
///
/// Returns the bytes to write and the file extension to use. Raw YUV frames
/// require the device to declare the frame dimensions.
pub fn mux_to_storable(
    format: ImageFormat,
    data: &[u8],
    width: Option<u32>,
    height: Option<u32>,
) -> Result<(Vec<u8>, &'static str)> {
    match format {
        ImageFormat::Jpeg => Ok((data.to_vec(), "jpg")),
        ImageFormat::Png => Ok((data.to_vec(), "png")),
        ImageFormat::Yuv420 => {
            let (width, height) = match (width, height) {
                (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
                _ => {
                    return Err(AppError::Validation(
                        "yuv420 frames require width and height".to_string(),
                    ))
                }
            };
            let rgb = yuv420_to_rgb(data, width, height)?;
            let mut jpeg = Vec::new();
            JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
                .encode_image(&rgb)
                .map_err(|e| AppError::Internal(format!("jpeg encode failed: {}", e)))?;
            Ok((jpeg, "jpg"))
        }
    }
}

/// Planar I420 to packed RGB (BT.601 full-range approximation)
fn yuv420_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage> {
    let w = width as usize;
    let h = height as usize;
    if w % 2 != 0 || h % 2 != 0 {
        return Err(AppError::Validation(
            "yuv420 dimensions must be even".to_string(),
        ));
    }

    let y_len = w * h;
    let chroma_len = y_len / 4;
    let expected = y_len + 2 * chroma_len;
    if data.len() != expected {
        return Err(AppError::Validation(format!(
            "yuv420 buffer is {} bytes, expected {} for {}x{}",
            data.len(),
            expected,
            width,
            height
        )));
    }

    let (y_plane, rest) = data.split_at(y_len);
    let (u_plane, v_plane) = rest.split_at(chroma_len);

    let mut rgb = vec![0u8; w * h * 3];
    for row in 0..h {
        for col in 0..w {
            let y = y_plane[row * w + col] as i32;
            let chroma_index = (row / 2) * (w / 2) + col / 2;
            let u = u_plane[chroma_index] as i32 - 128;
            let v = v_plane[chroma_index] as i32 - 128;

            // Fixed-point BT.601 coefficients (x1024)
            let r = y + ((1436 * v) >> 10);
            let g = y - ((352 * u + 731 * v) >> 10);
            let b = y + ((1815 * u) >> 10);

            let out = (row * w + col) * 3;
            rgb[out] = r.clamp(0, 255) as u8;
            rgb[out + 1] = g.clamp(0, 255) as u8;
            rgb[out + 2] = b.clamp(0, 255) as u8;
        }
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or_else(|| AppError::Internal("rgb buffer size mismatch".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid_yuv(width: u32, height: u32, y: u8, u: u8, v: u8) -> Vec<u8> {
        let y_len = (width * height) as usize;
        let chroma_len = y_len / 4;
        let mut data = vec![y; y_len];
        data.extend(std::iter::repeat(u).take(chroma_len));
        data.extend(std::iter::repeat(v).take(chroma_len));
        data
    }

    #[test]
    fn test_jpeg_passthrough() {
        let data = vec![0xFF, 0xD8, 0xFF, 0xE0];
        let (out, ext) = mux_to_storable(ImageFormat::Jpeg, &data, None, None).unwrap();
        assert_eq!(out, data);
        assert_eq!(ext, "jpg");
    }

    #[test]
    fn test_yuv_requires_dimensions() {
        let data = solid_yuv(4, 4, 128, 128, 128);
        assert!(matches!(
            mux_to_storable(ImageFormat::Yuv420, &data, None, None),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_yuv_length_mismatch_rejected() {
        let data = vec![0u8; 10];
        assert!(matches!(
            mux_to_storable(ImageFormat::Yuv420, &data, Some(4), Some(4)),
            Err(AppError::Validation(_))
        ));
    }

    #[test]
    fn test_yuv_muxes_to_decodable_jpeg() {
        // Grey frame: y=128, neutral chroma
        let data = solid_yuv(16, 16, 128, 128, 128);
        let (jpeg, ext) = mux_to_storable(ImageFormat::Yuv420, &data, Some(16), Some(16)).unwrap();
        assert_eq!(ext, "jpg");

        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!(decoded.width(), 16);
        assert_eq!(decoded.height(), 16);
    }

    #[test]
    fn test_neutral_chroma_is_grey() {
        let rgb = yuv420_to_rgb(&solid_yuv(2, 2, 100, 128, 128), 2, 2).unwrap();
        let pixel = rgb.get_pixel(0, 0);
        assert_eq!(pixel.0, [100, 100, 100]);
    }
}
