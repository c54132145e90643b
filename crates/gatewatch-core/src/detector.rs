//! SCRFD face detector via ONNX Runtime.
//!
//! Runs the SCRFD (Sample and Computation Redistribution for Efficient Face
//! Detection) model on letterboxed RGB input, with 3-stride anchor-free
//! decoding and NMS post-processing.

use crate::types::BoundingBox;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download from insightface and place in models/")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too short: expected {expected} RGB bytes, got {actual}")]
    InvalidFrame { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx, kps_idx).
type StrideOutputIndices = (usize, usize, usize);

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    input_height: usize,
    input_width: usize,
    /// Per-stride output indices [(score, bbox, kps)] for strides [8, 16, 32].
    stride_indices: [StrideOutputIndices; 3],
    threshold: f32,
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        let num_outputs = output_names.len();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded SCRFD model"
        );

        if num_outputs < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD model requires 9 outputs (3 strides × score/bbox/kps), got {num_outputs}"
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "SCRFD output tensor mapping");

        Ok(Self {
            session,
            input_height: SCRFD_INPUT_SIZE,
            input_width: SCRFD_INPUT_SIZE,
            stride_indices,
            threshold: SCRFD_CONFIDENCE_THRESHOLD,
        })
    }

    /// Override the raw decode threshold. Quality gating happens downstream;
    /// this only bounds how many anchors reach NMS.
    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.threshold = threshold;
        self
    }

    /// Detect faces in a packed RGB frame, returning boxes sorted by confidence.
    pub fn detect(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<BoundingBox>, DetectorError> {
        let expected = (width * height * 3) as usize;
        if rgb.len() < expected || width == 0 || height == 0 {
            return Err(DetectorError::InvalidFrame {
                expected,
                actual: rgb.len(),
            });
        }

        let (input, letterbox) = self.preprocess(rgb, width as usize, height as usize);

        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();

        for (stride_pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx, kps_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;
            let (_, kps) = outputs[kps_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("kps stride {stride}: {e}")))?;

            let dets = decode_stride(
                scores,
                bboxes,
                kps,
                stride,
                self.input_width,
                self.input_height,
                &letterbox,
                self.threshold,
            );
            all_detections.extend(dets);
        }

        // NMS output is already ordered by confidence.
        Ok(nms(all_detections, SCRFD_NMS_THRESHOLD))
    }

    /// Letterbox an RGB frame into the SCRFD NCHW input tensor.
    fn preprocess(&self, rgb: &[u8], width: usize, height: usize) -> (Array4<f32>, LetterboxInfo) {
        let scale_w = self.input_width as f32 / width as f32;
        let scale_h = self.input_height as f32 / height as f32;
        let scale = scale_w.min(scale_h);

        let new_w = ((width as f32 * scale).round() as usize).min(self.input_width);
        let new_h = ((height as f32 * scale).round() as usize).min(self.input_height);
        let pad_x = (self.input_width - new_w) as f32 / 2.0;
        let pad_y = (self.input_height - new_h) as f32 / 2.0;

        let letterbox = LetterboxInfo { scale, pad_x, pad_y };
        let resized = resize_bilinear_rgb(rgb, width, height, new_w, new_h);

        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;

        // Padding stays at 0.0, which is what SCRFD_MEAN normalizes to.
        let mut tensor = Array4::<f32>::zeros((1, 3, self.input_height, self.input_width));

        for y in 0..new_h {
            for x in 0..new_w {
                let src = (y * new_w + x) * 3;
                let ty = y + pad_y_start;
                let tx = x + pad_x_start;
                for c in 0..3 {
                    tensor[[0, c, ty, tx]] = (resized[src + c] as f32 - SCRFD_MEAN) / SCRFD_STD;
                }
            }
        }

        (tensor, letterbox)
    }
}

/// Bilinear resize of a packed RGB buffer.
fn resize_bilinear_rgb(
    rgb: &[u8],
    width: usize,
    height: usize,
    new_w: usize,
    new_h: usize,
) -> Vec<u8> {
    let mut resized = vec![0u8; new_w * new_h * 3];
    if new_w == 0 || new_h == 0 {
        return resized;
    }
    let inv_scale_x = width as f32 / new_w as f32;
    let inv_scale_y = height as f32 / new_h as f32;

    for y in 0..new_h {
        let src_y = (y as f32 + 0.5) * inv_scale_y - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, height as i32 - 1) as usize;
        let y1 = (y0 + 1).min(height - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..new_w {
            let src_x = (x as f32 + 0.5) * inv_scale_x - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, width as i32 - 1) as usize;
            let x1 = (x0 + 1).min(width - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            for c in 0..3 {
                let tl = rgb[(y0 * width + x0) * 3 + c] as f32;
                let tr = rgb[(y0 * width + x1) * 3 + c] as f32;
                let bl = rgb[(y1 * width + x0) * 3 + c] as f32;
                let br = rgb[(y1 * width + x1) * 3 + c] as f32;

                let val = tl * (1.0 - fx) * (1.0 - fy)
                    + tr * fx * (1.0 - fy)
                    + bl * (1.0 - fx) * fy
                    + br * fx * fy;

                resized[(y * new_w + x) * 3 + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    resized
}

/// Discover output tensor ordering by name.
///
/// SCRFD exports either name their outputs ("score_8", "bbox_16", ...) or use
/// generic numeric names. Unrecognized names fall back to the standard
/// positional ordering:
///   [0-2] = scores (strides 8, 16, 32)
///   [3-5] = bboxes (strides 8, 16, 32)
///   [6-8] = kps    (strides 8, 16, 32)
fn discover_output_indices(names: &[String]) -> [StrideOutputIndices; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };
    let lookup = |stride: usize| -> Option<StrideOutputIndices> {
        Some((find("score", stride)?, find("bbox", stride)?, find("kps", stride)?))
    };

    match (lookup(SCRFD_STRIDES[0]), lookup(SCRFD_STRIDES[1]), lookup(SCRFD_STRIDES[2])) {
        (Some(s8), Some(s16), Some(s32)) => {
            tracing::info!("SCRFD: using name-based output tensor mapping");
            [s8, s16, s32]
        }
        _ => {
            tracing::info!(
                ?names,
                "SCRFD: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes, [6-8]=kps"
            );
            [(0, 3, 6), (1, 4, 7), (2, 5, 8)]
        }
    }
}

/// Decode detections for a single stride level.
#[allow(clippy::too_many_arguments)]
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_width: usize,
    input_height: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_h = input_height / stride;
    let grid_w = input_width / stride;
    let num_anchors = grid_h * grid_w * SCRFD_ANCHORS_PER_CELL;
    let s = stride as f32;

    let unmap = |px: f32, py: f32| -> (f32, f32) {
        (
            (px - letterbox.pad_x) / letterbox.scale,
            (py - letterbox.pad_y) / letterbox.scale,
        )
    };

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / SCRFD_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid_w) as f32 * s;
        let anchor_cy = (anchor_idx / grid_w) as f32 * s;

        // Distances from the anchor to each edge, in stride units
        let bbox_off = idx * 4;
        if bbox_off + 3 >= bboxes.len() {
            continue;
        }
        let (x1, y1) = unmap(
            anchor_cx - bboxes[bbox_off] * s,
            anchor_cy - bboxes[bbox_off + 1] * s,
        );
        let (x2, y2) = unmap(
            anchor_cx + bboxes[bbox_off + 2] * s,
            anchor_cy + bboxes[bbox_off + 3] * s,
        );

        let kps_off = idx * 10;
        let landmarks = (kps_off + 9 < kps.len()).then(|| {
            std::array::from_fn(|i| {
                unmap(
                    anchor_cx + kps[kps_off + i * 2] * s,
                    anchor_cy + kps[kps_off + i * 2 + 1] * s,
                )
            })
        });

        detections.push(BoundingBox {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
            confidence: score,
            landmarks,
        });
    }

    detections
}

/// Greedy NMS: keep the most confident box, drop everything overlapping it
/// by more than `iou_threshold`, repeat.
fn nms(mut candidates: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<BoundingBox> = Vec::with_capacity(candidates.len().min(16));
    for candidate in candidates {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let overlap_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let overlap_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = overlap_w * overlap_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn boxed(x: f32, y: f32, side: f32, confidence: f32) -> BoundingBox {
        BoundingBox {
            x,
            y,
            width: side,
            height: side,
            confidence,
            landmarks: None,
        }
    }

    #[test]
    fn test_iou() {
        let a = boxed(0.0, 0.0, 10.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
        assert_eq!(iou(&a, &boxed(20.0, 20.0, 10.0, 1.0)), 0.0);
        // Half-width overlap: 50 / (100 + 100 - 50)
        assert!((iou(&a, &boxed(5.0, 0.0, 10.0, 1.0)) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_nms_keeps_best_of_each_cluster() {
        let result = nms(
            vec![
                boxed(300.0, 40.0, 80.0, 0.62),
                boxed(4.0, 2.0, 100.0, 0.85),
                boxed(0.0, 0.0, 100.0, 0.93),
                boxed(305.0, 44.0, 80.0, 0.71),
            ],
            0.4,
        );
        let confidences: Vec<f32> = result.iter().map(|b| b.confidence).collect();
        assert_eq!(confidences, vec![0.93, 0.71]);
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn test_decode_stride_maps_back_to_frame() {
        // 1280x720 frame letterboxed into 640x640: scale 0.5, pad_y 140
        let letterbox = LetterboxInfo { scale: 0.5, pad_x: 0.0, pad_y: 140.0 };
        let stride = 32;
        let cells = (640 / stride) * (640 / stride) * SCRFD_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; cells];
        let mut bboxes = vec![0.0f32; cells * 4];
        let kps = vec![0.0f32; cells * 10];

        // Anchor index 2*(row 5 * 20 + col 3): center (96, 160) in input space
        let idx = 2 * (5 * 20 + 3);
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 0.5, 1.0, 0.5]);

        let dets = decode_stride(&scores, &bboxes, &kps, stride, 640, 640, &letterbox, 0.5);
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        // x: (96 - 32) / 0.5 = 128, y: (160 - 16 - 140) / 0.5 = 8
        assert!((d.x - 128.0).abs() < 1e-3, "x = {}", d.x);
        assert!((d.y - 8.0).abs() < 1e-3, "y = {}", d.y);
        assert!((d.width - 128.0).abs() < 1e-3);
        assert!((d.height - 64.0).abs() < 1e-3);
        // All landmark offsets are zero → every landmark sits on the anchor
        let lms = d.landmarks.expect("landmarks decoded");
        assert!((lms[0].0 - 192.0).abs() < 1e-3);
        assert!((lms[0].1 - 40.0).abs() < 1e-3);
    }

    #[test]
    fn test_discover_output_indices_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32",
            "bbox_8",  "bbox_16",  "bbox_32",
            "kps_8",   "kps_16",   "kps_32",
        ].iter().map(|s| s.to_string()).collect();

        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_discover_output_indices_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "kps_8", "score_8",
            "bbox_16", "kps_16", "score_16",
            "bbox_32", "kps_32", "score_32",
        ].iter().map(|s| s.to_string()).collect();

        assert_eq!(discover_output_indices(&names), [(2, 0, 1), (5, 3, 4), (8, 6, 7)]);
    }

    #[test]
    fn test_discover_output_indices_positional_fallback() {
        let names: Vec<String> = (0..9).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_output_indices(&names), [(0, 3, 6), (1, 4, 7), (2, 5, 8)]);
    }

    #[test]
    fn test_bilinear_resize_uniform() {
        let rgb: Vec<u8> = [10u8, 128, 250].repeat(100 * 60);
        let resized = resize_bilinear_rgb(&rgb, 100, 60, 37, 23);
        assert_eq!(resized.len(), 37 * 23 * 3);
        assert!(resized.chunks_exact(3).all(|p| p == [10, 128, 250]));
    }

    #[test]
    fn test_bilinear_resize_keeps_channels_apart() {
        // Left half red, right half blue; downscale must not leak green
        let (w, h) = (8usize, 2usize);
        let mut rgb = vec![0u8; w * h * 3];
        for y in 0..h {
            for x in 0..w {
                let i = (y * w + x) * 3;
                if x < w / 2 { rgb[i] = 255 } else { rgb[i + 2] = 255 }
            }
        }
        let resized = resize_bilinear_rgb(&rgb, w, h, 4, 1);
        assert!(resized.chunks_exact(3).all(|p| p[1] == 0));
        assert_eq!(resized[0], 255);
        assert_eq!(resized[3 * 3 + 2], 255);
    }
}
