//! Box and label drawing, plus JPEG encoding of the annotated frame.

use crate::cache::{SpatialKey, SpatialResultCache, Verdict};
use ab_glyph::{FontVec, PxScale};
use gatewatch_core::FaceObservation;
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;
use std::time::Instant;

pub const RECOGNIZED: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNRECOGNIZED: Rgb<u8> = Rgb([255, 0, 0]);
pub const PENDING: Rgb<u8> = Rgb([255, 255, 0]);
pub const PENDING_LABEL: &str = "Scanning...";

const LABEL_SCALE: f32 = 20.0;
const LABEL_GAP: i32 = 10;
const LABEL_PAD: i32 = 3;
const STROKE: i32 = 2;

/// One box to draw, already in output-image coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    pub x0: i32,
    pub y0: i32,
    pub x1: i32,
    pub y1: i32,
    pub label: String,
    pub color: Rgb<u8>,
}

/// Pair each face with its cached result (or the pending style).
///
/// Cache lookups use source coordinates; when `mirror` is set the box is
/// flipped horizontally to line up with the mirrored image.
pub fn annotate(
    faces: &[FaceObservation],
    cache: &SpatialResultCache,
    bucket: u32,
    frame_width: u32,
    mirror: bool,
    now: Instant,
) -> Vec<Annotation> {
    faces
        .iter()
        .map(|face| {
            let key = SpatialKey::for_observation(face, bucket);
            let (label, color) = match cache.get_at(key, now) {
                Some(entry) => {
                    let color = match entry.verdict {
                        Verdict::Recognized => RECOGNIZED,
                        Verdict::Unrecognized => UNRECOGNIZED,
                    };
                    (entry.label, color)
                }
                None => (PENDING_LABEL.to_string(), PENDING),
            };

            let (x0, x1) = if mirror {
                let w = frame_width as f32;
                (w - face.x1, w - face.x0)
            } else {
                (face.x0, face.x1)
            };

            Annotation {
                x0: x0.round() as i32,
                y0: face.y0.round() as i32,
                x1: x1.round() as i32,
                y1: face.y1.round() as i32,
                label,
                color,
            }
        })
        .collect()
}

pub struct Overlay {
    font: Option<FontVec>,
}

impl Overlay {
    /// Load the label font. A missing or unreadable font is not fatal:
    /// boxes are still drawn, without text.
    pub fn load(font_path: Option<&Path>) -> Self {
        let font = font_path.and_then(|path| {
            let loaded = std::fs::read(path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| FontVec::try_from_vec(bytes).map_err(|e| e.to_string()));
            match loaded {
                Ok(font) => Some(font),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "label font unavailable; drawing boxes only");
                    None
                }
            }
        });
        Self { font }
    }

    pub fn without_labels() -> Self {
        Self { font: None }
    }

    pub fn has_labels(&self) -> bool {
        self.font.is_some()
    }

    pub fn draw(&self, img: &mut RgbImage, annotations: &[Annotation]) {
        let (w, h) = (img.width() as i32, img.height() as i32);

        for a in annotations {
            let x0 = a.x0.clamp(0, w - 1);
            let y0 = a.y0.clamp(0, h - 1);
            let x1 = a.x1.clamp(0, w - 1);
            let y1 = a.y1.clamp(0, h - 1);
            if x1 <= x0 || y1 <= y0 {
                continue;
            }

            for inset in 0..STROKE {
                let bw = x1 - x0 - 2 * inset;
                let bh = y1 - y0 - 2 * inset;
                if bw <= 0 || bh <= 0 {
                    break;
                }
                let rect = Rect::at(x0 + inset, y0 + inset).of_size(bw as u32, bh as u32);
                draw_hollow_rect_mut(img, rect, a.color);
            }

            if let Some(font) = &self.font {
                draw_label(img, font, x0, y0, &a.label, a.color);
            }
        }
    }
}

/// Label sits `LABEL_GAP` above the box on a filled background; if that
/// would leave the image, it goes just inside the top edge instead.
fn draw_label(img: &mut RgbImage, font: &FontVec, x: i32, box_top: i32, text: &str, color: Rgb<u8>) {
    if text.is_empty() {
        return;
    }
    let scale = PxScale::from(LABEL_SCALE);
    let (tw, th) = text_size(scale, font, text);
    let bg_w = tw as i32 + 2 * LABEL_PAD;
    let bg_h = th as i32 + 2 * LABEL_PAD;

    let mut top = box_top - LABEL_GAP - bg_h;
    if top < 0 {
        top = box_top + STROKE;
    }

    draw_filled_rect_mut(img, Rect::at(x, top).of_size(bg_w as u32, bg_h as u32), color);
    draw_text_mut(img, Rgb([0, 0, 0]), x + LABEL_PAD, top + LABEL_PAD, scale, font, text);
}

pub fn encode_jpeg(img: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100)).encode_image(img)?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheEntry;
    use gatewatch_core::Embedding;
    use std::time::Duration;

    fn face(x0: f32, y0: f32, x1: f32, y1: f32) -> FaceObservation {
        FaceObservation {
            x0,
            y0,
            x1,
            y1,
            score: 0.9,
            embedding: Embedding {
                values: vec![],
                model_version: None,
            },
        }
    }

    #[test]
    fn test_unresolved_face_is_pending() {
        let cache = SpatialResultCache::new();
        let out = annotate(&[face(10.0, 10.0, 80.0, 90.0)], &cache, 50, 640, false, Instant::now());
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, PENDING_LABEL);
        assert_eq!(out[0].color, PENDING);
        assert_eq!((out[0].x0, out[0].x1), (10, 80));
    }

    #[test]
    fn test_cached_result_styles_box_and_mirrors() {
        let cache = SpatialResultCache::new();
        let now = Instant::now();
        cache.put(
            SpatialKey { col: 3, row: 3 },
            CacheEntry {
                label: "Jane".into(),
                verdict: Verdict::Recognized,
                expires_at: now + Duration::from_secs(10),
            },
        );
        cache.put(
            SpatialKey { col: 9, row: 3 },
            CacheEntry {
                label: "Unknown".into(),
                verdict: Verdict::Unrecognized,
                expires_at: now + Duration::from_secs(10),
            },
        );

        let faces = [face(100.0, 100.0, 220.0, 260.0), face(420.0, 120.0, 540.0, 260.0)];
        let out = annotate(&faces, &cache, 50, 640, true, now);

        assert_eq!(out[0].label, "Jane");
        assert_eq!(out[0].color, RECOGNIZED);
        assert_eq!((out[0].x0, out[0].x1), (420, 540));
        assert_eq!((out[0].y0, out[0].y1), (100, 260));

        assert_eq!(out[1].label, "Unknown");
        assert_eq!(out[1].color, UNRECOGNIZED);
        assert_eq!((out[1].x0, out[1].x1), (100, 220));
    }

    #[test]
    fn test_draw_strokes_box_edges() {
        let mut img = RgbImage::new(100, 80);
        let overlay = Overlay::without_labels();
        overlay.draw(
            &mut img,
            &[Annotation {
                x0: 10,
                y0: 20,
                x1: 60,
                y1: 70,
                label: "x".into(),
                color: RECOGNIZED,
            }],
        );
        assert_eq!(*img.get_pixel(10, 40), RECOGNIZED);
        assert_eq!(*img.get_pixel(11, 40), RECOGNIZED);
        assert_eq!(*img.get_pixel(30, 20), RECOGNIZED);
        assert_eq!(*img.get_pixel(30, 40), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_out_of_bounds_box_is_clamped_or_skipped() {
        let mut img = RgbImage::new(50, 50);
        let overlay = Overlay::without_labels();
        overlay.draw(
            &mut img,
            &[
                Annotation { x0: -20, y0: -20, x1: 30, y1: 30, label: String::new(), color: PENDING },
                Annotation { x0: 80, y0: 0, x1: 120, y1: 40, label: String::new(), color: PENDING },
            ],
        );
        assert_eq!(*img.get_pixel(0, 10), PENDING);
    }

    #[test]
    fn test_missing_font_falls_back() {
        let overlay = Overlay::load(Some(Path::new("/nonexistent/font.ttf")));
        assert!(!overlay.has_labels());
    }

    #[test]
    fn test_encode_jpeg() {
        let img = RgbImage::from_pixel(32, 16, Rgb([40, 90, 200]));
        let jpeg = encode_jpeg(&img, 80).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (32, 16));
    }
}
