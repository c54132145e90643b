//! Warp a detected face onto the canonical 112x112 ArcFace crop.
//!
//! The five detected landmarks are fitted to the InsightFace reference
//! positions with a least-squares similarity (uniform scale, rotation,
//! translation), then the crop is resampled bilinearly from the RGB frame.

/// Reference landmark positions in the 112x112 crop:
/// eyes, nose tip, mouth corners.
const REFERENCE_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

const CROP: usize = 112;

/// `p' = [[a, -b], [b, a]] * p + t`
#[derive(Debug, Clone, Copy, PartialEq)]
struct Similarity {
    a: f32,
    b: f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Closed-form least-squares fit mapping `src` onto `dst`.
    ///
    /// Returns `None` when the source points are all coincident.
    fn fit(src: &[(f32, f32)], dst: &[(f32, f32)]) -> Option<Self> {
        let n = src.len().min(dst.len());
        if n == 0 {
            return None;
        }
        let mean = |pts: &[(f32, f32)]| {
            let (sx, sy) = pts[..n]
                .iter()
                .fold((0.0, 0.0), |(ax, ay), &(x, y)| (ax + x, ay + y));
            (sx / n as f32, sy / n as f32)
        };
        let (msx, msy) = mean(src);
        let (mdx, mdy) = mean(dst);

        let (mut dot, mut cross, mut norm) = (0.0f32, 0.0f32, 0.0f32);
        for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst).take(n) {
            let (sx, sy) = (sx - msx, sy - msy);
            let (dx, dy) = (dx - mdx, dy - mdy);
            dot += sx * dx + sy * dy;
            cross += sx * dy - sy * dx;
            norm += sx * sx + sy * sy;
        }
        if norm < 1e-9 {
            return None;
        }

        let a = dot / norm;
        let b = cross / norm;
        Some(Self {
            a,
            b,
            tx: mdx - (a * msx - b * msy),
            ty: mdy - (b * msx + a * msy),
        })
    }

    fn apply(&self, (x, y): (f32, f32)) -> (f32, f32) {
        (
            self.a * x - self.b * y + self.tx,
            self.b * x + self.a * y + self.ty,
        )
    }

    fn inverse(&self) -> Option<Self> {
        let det = self.a * self.a + self.b * self.b;
        if det < 1e-12 {
            return None;
        }
        let (a, b) = (self.a / det, -self.b / det);
        Some(Self {
            a,
            b,
            tx: -(a * self.tx - b * self.ty),
            ty: -(b * self.tx + a * self.ty),
        })
    }
}

/// Bilinear sample of channel `c`; outside the frame reads as black.
fn sample(rgb: &[u8], width: usize, height: usize, x: f32, y: f32, c: usize) -> f32 {
    let x0 = x.floor();
    let y0 = y.floor();
    let (fx, fy) = (x - x0, y - y0);
    let at = |px: i64, py: i64| -> f32 {
        if px < 0 || py < 0 || px >= width as i64 || py >= height as i64 {
            0.0
        } else {
            rgb[(py as usize * width + px as usize) * 3 + c] as f32
        }
    };
    let (x0, y0) = (x0 as i64, y0 as i64);
    let top = at(x0, y0) * (1.0 - fx) + at(x0 + 1, y0) * fx;
    let bottom = at(x0, y0 + 1) * (1.0 - fx) + at(x0 + 1, y0 + 1) * fx;
    top * (1.0 - fy) + bottom * fy
}

/// Fill a `size x size` RGB crop whose pixel `p` comes from `to_src(p)`.
fn warp(rgb: &[u8], width: usize, height: usize, to_src: &Similarity, size: usize) -> Vec<u8> {
    let mut out = vec![0u8; size * size * 3];
    for (i, px) in out.chunks_exact_mut(3).enumerate() {
        let (sx, sy) = to_src.apply(((i % size) as f32, (i / size) as f32));
        for (c, v) in px.iter_mut().enumerate() {
            *v = sample(rgb, width, height, sx, sy, c).round().clamp(0.0, 255.0) as u8;
        }
    }
    out
}

/// Produce the aligned 112x112 RGB crop for a face with the given landmarks.
///
/// Degenerate landmarks (all in one spot) yield a black crop.
pub fn align_face(rgb: &[u8], width: u32, height: u32, landmarks: &[(f32, f32); 5]) -> Vec<u8> {
    match Similarity::fit(landmarks, &REFERENCE_112).and_then(|t| t.inverse()) {
        Some(to_src) => warp(rgb, width as usize, height as usize, &to_src, CROP),
        None => vec![0u8; CROP * CROP * 3],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: (f32, f32), b: (f32, f32), tol: f32) -> bool {
        (a.0 - b.0).abs() < tol && (a.1 - b.1).abs() < tol
    }

    #[test]
    fn test_fit_identity() {
        let t = Similarity::fit(&REFERENCE_112, &REFERENCE_112).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4);
        assert!(t.b.abs() < 1e-4);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn test_fit_recovers_scale_and_shift() {
        // Landmarks of a face twice the crop size, offset by (30, 10).
        let src: Vec<(f32, f32)> = REFERENCE_112
            .iter()
            .map(|&(x, y)| (2.0 * x + 30.0, 2.0 * y + 10.0))
            .collect();
        let t = Similarity::fit(&src, &REFERENCE_112).unwrap();
        assert!((t.a - 0.5).abs() < 1e-3, "a = {}", t.a);
        assert!(t.b.abs() < 1e-3);
        for (s, d) in src.iter().zip(REFERENCE_112.iter()) {
            assert!(close(t.apply(*s), *d, 1e-2));
        }
    }

    #[test]
    fn test_inverse_roundtrip() {
        let t = Similarity { a: 0.8, b: 0.3, tx: 12.0, ty: -4.0 };
        let inv = t.inverse().unwrap();
        let p = (57.0, 23.0);
        assert!(close(inv.apply(t.apply(p)), p, 1e-3));
    }

    #[test]
    fn test_coincident_landmarks_give_black_crop() {
        let frame = vec![200u8; 16 * 16 * 3];
        let out = align_face(&frame, 16, 16, &[(8.0, 8.0); 5]);
        assert_eq!(out.len(), 112 * 112 * 3);
        assert!(out.iter().all(|&p| p == 0));
    }

    #[test]
    fn test_uniform_frame_stays_uniform_inside() {
        let frame = vec![128u8; 640 * 480 * 3];
        let identity = Similarity { a: 1.0, b: 0.0, tx: 0.0, ty: 0.0 };
        let out = warp(&frame, 640, 480, &identity, 112);
        assert!(out.iter().all(|&p| p == 128));
    }

    #[test]
    fn test_left_eye_lands_on_reference() {
        let (w, h) = (200usize, 200usize);
        let mut frame = vec![0u8; w * h * 3];
        let landmarks: [(f32, f32); 5] = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        // Red patch on the left eye.
        for py in 58..63 {
            for px in 78..83 {
                frame[(py * w + px) * 3] = 255;
            }
        }

        let aligned = align_face(&frame, w as u32, h as u32, &landmarks);
        let (rx, ry) = (
            REFERENCE_112[0].0.round() as usize,
            REFERENCE_112[0].1.round() as usize,
        );
        let mut red = 0u8;
        let mut green = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                red = red.max(aligned[(y * CROP + x) * 3]);
                green = green.max(aligned[(y * CROP + x) * 3 + 1]);
            }
        }
        assert!(red > 100, "no red near ({rx}, {ry}): {red}");
        assert_eq!(green, 0);
    }
}
