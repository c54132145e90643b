/// Raw detector output for one face, with optional facial landmarks.
#[derive(Debug, Clone)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn dim(&self) -> usize {
        self.values.len()
    }
}

/// One detected face from one inference pass.
///
/// Box corners are in source-frame pixel coordinates. Observations are
/// never updated; every pass produces a fresh list.
#[derive(Debug, Clone)]
pub struct FaceObservation {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
    /// Detection confidence in [0, 1].
    pub score: f32,
    pub embedding: Embedding,
}

impl FaceObservation {
    pub fn from_detection(bbox: &BoundingBox, embedding: Embedding) -> Self {
        Self {
            x0: bbox.x,
            y0: bbox.y,
            x1: bbox.x + bbox.width,
            y1: bbox.y + bbox.height,
            score: bbox.confidence,
            embedding,
        }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }
}
