//! Frame type and pixel conversions: YUYV/GREY/MJPG to RGB, luminance, mirroring.

use std::time::Instant;

/// A captured RGB camera frame.
///
/// Shared between stages as `Arc<Frame>`; a stage that needs to draw on the
/// pixels clones the frame first.
#[derive(Clone)]
pub struct Frame {
    /// Packed RGB8 pixel data (width * height * 3 bytes).
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub timestamp: Instant,
    pub sequence: u32,
}

impl Frame {
    /// Build a frame from packed RGB data, validating the buffer length.
    pub fn from_rgb(data: Vec<u8>, width: u32, height: u32, sequence: u32) -> Result<Self, FrameError> {
        let expected = (width * height * 3) as usize;
        if data.len() != expected {
            return Err(FrameError::InvalidLength {
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            data,
            width,
            height,
            timestamp: Instant::now(),
            sequence,
        })
    }

    /// Mean luminance (0.0–255.0) of the grayscale conversion.
    pub fn mean_luminance(&self) -> f32 {
        mean_luminance(&self.data)
    }

    /// Flip the frame left-to-right in place.
    pub fn mirror(&mut self) {
        mirror_rgb(&mut self.data, self.width, self.height);
    }
}

/// BT.601 luma of a single RGB pixel.
#[inline]
pub fn luma(r: u8, g: u8, b: u8) -> f32 {
    0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
}

/// Mean BT.601 luma over a packed RGB buffer. Empty buffers are fully dark.
pub fn mean_luminance(rgb: &[u8]) -> f32 {
    let pixels = rgb.len() / 3;
    if pixels == 0 {
        return 0.0;
    }
    let sum: f64 = rgb
        .chunks_exact(3)
        .map(|p| luma(p[0], p[1], p[2]) as f64)
        .sum();
    (sum / pixels as f64) as f32
}

/// Convert packed YUYV (4:2:2) to packed RGB.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V]; both pixels share the
/// chroma pair.
pub fn yuyv_to_rgb(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for quad in yuyv[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (quad[0], quad[1], quad[2], quad[3]);
        rgb.extend_from_slice(&ycbcr_to_rgb(y0, u, v));
        rgb.extend_from_slice(&ycbcr_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn ycbcr_to_rgb(y: u8, cb: u8, cr: u8) -> [u8; 3] {
    let y = y as f32;
    let cb = cb as f32 - 128.0;
    let cr = cr as f32 - 128.0;
    let r = y + 1.402 * cr;
    let g = y - 0.344_136 * cb - 0.714_136 * cr;
    let b = y + 1.772 * cb;
    [
        r.round().clamp(0.0, 255.0) as u8,
        g.round().clamp(0.0, 255.0) as u8,
        b.round().clamp(0.0, 255.0) as u8,
    ]
}

/// Replicate an 8-bit grayscale buffer into three channels.
pub fn grey_to_rgb(gray: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let pixels = (width * height) as usize;
    if gray.len() < pixels {
        return Err(FrameError::InvalidLength {
            expected: pixels,
            actual: gray.len(),
        });
    }
    Ok(gray[..pixels].iter().flat_map(|&p| [p, p, p]).collect())
}

/// Decode a single MJPG buffer to packed RGB.
///
/// Returns the decoded dimensions, which may differ from the negotiated ones
/// on drivers that lie about their output size.
pub fn mjpeg_to_rgb(jpeg: &[u8]) -> Result<(Vec<u8>, u32, u32), FrameError> {
    let img = image::load_from_memory_with_format(jpeg, image::ImageFormat::Jpeg)
        .map_err(|e| FrameError::Decode(e.to_string()))?
        .into_rgb8();
    let (w, h) = img.dimensions();
    Ok((img.into_raw(), w, h))
}

/// Flip a packed RGB buffer left-to-right in place.
pub fn mirror_rgb(rgb: &mut [u8], width: u32, height: u32) {
    let w = width as usize;
    let stride = w * 3;
    for row in rgb.chunks_exact_mut(stride).take(height as usize) {
        for x in 0..w / 2 {
            let left = x * 3;
            let right = (w - 1 - x) * 3;
            for c in 0..3 {
                row.swap(left + c, right + c);
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid buffer length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
    #[error("MJPG decode failed: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_rgb_neutral_chroma() {
        // 2x1 image with neutral chroma: RGB equals luma
        let yuyv = vec![100, 128, 200, 128];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert_eq!(rgb, vec![100, 100, 100, 200, 200, 200]);
    }

    #[test]
    fn test_yuyv_to_rgb_red_bias() {
        // High Cr pushes red up and green down
        let yuyv = vec![128, 128, 128, 200];
        let rgb = yuyv_to_rgb(&yuyv, 2, 1).unwrap();
        assert!(rgb[0] > 200, "red = {}", rgb[0]);
        assert!(rgb[1] < 128, "green = {}", rgb[1]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128];
        assert!(yuyv_to_rgb(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_grey_to_rgb() {
        let rgb = grey_to_rgb(&[7, 9], 2, 1).unwrap();
        assert_eq!(rgb, vec![7, 7, 7, 9, 9, 9]);
    }

    #[test]
    fn test_mean_luminance() {
        assert_eq!(mean_luminance(&[]), 0.0);
        let white = vec![255u8; 30];
        assert!((mean_luminance(&white) - 255.0).abs() < 0.01);
        let mut half = vec![0u8; 30];
        half[15..].fill(255);
        assert!((mean_luminance(&half) - 127.5).abs() < 0.01);
    }

    #[test]
    fn test_mirror_rgb() {
        // 3x1: red, green, blue → blue, green, red
        let mut rgb = vec![255, 0, 0, 0, 255, 0, 0, 0, 255];
        mirror_rgb(&mut rgb, 3, 1);
        assert_eq!(rgb, vec![0, 0, 255, 0, 255, 0, 255, 0, 0]);
    }

    #[test]
    fn test_mirror_twice_is_identity() {
        let orig: Vec<u8> = (0..4 * 2 * 3).map(|i| i as u8).collect();
        let mut rgb = orig.clone();
        mirror_rgb(&mut rgb, 4, 2);
        assert_ne!(rgb, orig);
        mirror_rgb(&mut rgb, 4, 2);
        assert_eq!(rgb, orig);
    }

    #[test]
    fn test_from_rgb_validates_length() {
        assert!(Frame::from_rgb(vec![0; 11], 2, 2, 0).is_err());
        let frame = Frame::from_rgb(vec![0; 12], 2, 2, 5).unwrap();
        assert_eq!(frame.sequence, 5);
    }

    #[test]
    fn test_mjpeg_roundtrip_dimensions() {
        let img = image::RgbImage::from_pixel(8, 4, image::Rgb([10, 200, 30]));
        let mut jpeg = Vec::new();
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut jpeg, 90)
            .encode_image(&img)
            .unwrap();
        let (rgb, w, h) = mjpeg_to_rgb(&jpeg).unwrap();
        assert_eq!((w, h), (8, 4));
        assert_eq!(rgb.len(), 8 * 4 * 3);
    }
}
