//! gatewatch-core: face detection and embedding.
//!
//! Uses SCRFD for face detection and ArcFace for embeddings, both running
//! via ONNX Runtime, behind the [`FaceAnalyzer`] trait.

pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod recognizer;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxFaceAnalyzer};
pub use recognizer::ARCFACE_EMBEDDING_DIM;
pub use types::{BoundingBox, Embedding, FaceObservation};

use std::path::PathBuf;

/// Where model files live unless configured otherwise.
pub fn default_model_dir() -> PathBuf {
    PathBuf::from("/usr/share/gatewatch/models")
}
