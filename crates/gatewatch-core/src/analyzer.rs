//! The detection/embedding capability the pipeline consumes.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::FaceObservation;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("analyzer backend failed: {0}")]
    Backend(String),
}

/// Given an RGB image, produce zero or more face observations.
///
/// Implementations are driven from a single thread and need not be `Sync`;
/// the pipeline never calls `analyze` concurrently.
pub trait FaceAnalyzer {
    fn analyze(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceObservation>, AnalyzerError>;
}

/// SCRFD detection followed by ArcFace embedding for every detected face.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    /// Load both ONNX models. Fails fast if either is missing.
    pub fn load(scrfd_path: &str, arcface_path: &str) -> Result<Self, AnalyzerError> {
        let detector = FaceDetector::load(scrfd_path)?;
        tracing::info!(path = scrfd_path, "SCRFD detector loaded");

        let recognizer = FaceRecognizer::load(arcface_path)?;
        tracing::info!(path = arcface_path, "ArcFace recognizer loaded");

        Ok(Self {
            detector,
            recognizer,
        })
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(
        &mut self,
        rgb: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<FaceObservation>, AnalyzerError> {
        let faces = self.detector.detect(rgb, width, height)?;
        let mut observations = Vec::with_capacity(faces.len());

        for face in &faces {
            match self.recognizer.extract(rgb, width, height, face) {
                Ok(embedding) => observations.push(FaceObservation::from_detection(face, embedding)),
                Err(RecognizerError::NoLandmarks) => {
                    tracing::debug!(confidence = face.confidence, "face without landmarks skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(observations)
    }
}
