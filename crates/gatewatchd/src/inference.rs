//! Detection loop: latest frame in, published face list and dispatches out.

use crate::cache::SpatialKey;
use crate::dispatcher::{DispatchOutcome, VerificationDispatcher};
use crate::shutdown::Shutdown;
use gatewatch_core::{FaceAnalyzer, FaceObservation};
use gatewatch_hw::{Frame, FrameReader};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const IDLE_WAIT: Duration = Duration::from_millis(10);
const REPEAT_WAIT: Duration = Duration::from_millis(5);

/// The face list from the most recent completed inference pass.
///
/// Replaced wholesale; readers always see one complete pass.
#[derive(Default)]
pub struct DetectionSnapshot {
    current: Mutex<Arc<Vec<FaceObservation>>>,
}

impl DetectionSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&self) -> Arc<Vec<FaceObservation>> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn publish(&self, faces: Vec<FaceObservation>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Arc::new(faces);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QualityGates {
    pub min_brightness: f32,
    pub min_face_width: f32,
    pub min_det_score: f32,
}

impl QualityGates {
    pub fn accepts(&self, face: &FaceObservation) -> bool {
        face.score >= self.min_det_score && face.width() >= self.min_face_width
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    NoFrame,
    /// The latest frame was already processed.
    Repeat,
    /// Frame too dark; an empty snapshot was published.
    TooDark,
    /// Snapshot replaced with this many faces.
    Published(usize),
    /// Analyzer error; the previous snapshot stays.
    Failed,
}

pub struct InferenceWorker<A> {
    analyzer: A,
    snapshot: Arc<DetectionSnapshot>,
    dispatcher: Arc<VerificationDispatcher>,
    gates: QualityGates,
    bucket_size: u32,
    last_frame: Option<Arc<Frame>>,
}

impl<A: FaceAnalyzer> InferenceWorker<A> {
    pub fn new(
        analyzer: A,
        snapshot: Arc<DetectionSnapshot>,
        dispatcher: Arc<VerificationDispatcher>,
        gates: QualityGates,
        bucket_size: u32,
    ) -> Self {
        Self {
            analyzer,
            snapshot,
            dispatcher,
            gates,
            bucket_size,
            last_frame: None,
        }
    }

    /// One pass over whatever `frames` currently holds.
    pub fn run_pass(&mut self, frames: &FrameReader) -> PassOutcome {
        let Some(frame) = frames.read() else {
            return PassOutcome::NoFrame;
        };
        if self
            .last_frame
            .as_ref()
            .is_some_and(|last| Arc::ptr_eq(last, &frame))
        {
            return PassOutcome::Repeat;
        }
        let outcome = self.process(&frame);
        self.last_frame = Some(frame);
        outcome
    }

    /// Gate, detect, dispatch, then publish, for a single frame.
    pub fn process(&mut self, frame: &Frame) -> PassOutcome {
        let brightness = frame.mean_luminance();
        if brightness < self.gates.min_brightness {
            tracing::trace!(brightness, "frame too dark; skipping inference");
            self.snapshot.publish(Vec::new());
            return PassOutcome::TooDark;
        }

        let detected = match self.analyzer.analyze(&frame.data, frame.width, frame.height) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, sequence = frame.sequence, "inference failed; keeping previous detections");
                return PassOutcome::Failed;
            }
        };

        let accepted: Vec<FaceObservation> = detected
            .into_iter()
            .filter(|face| self.gates.accepts(face))
            .collect();

        for face in &accepted {
            let key = SpatialKey::for_observation(face, self.bucket_size);
            let outcome = self.dispatcher.maybe_dispatch(&face.embedding, key);
            if outcome == DispatchOutcome::Busy {
                tracing::debug!(col = key.col, row = key.row, "verification pool saturated");
            }
        }

        let count = accepted.len();
        self.snapshot.publish(accepted);
        PassOutcome::Published(count)
    }

    /// Loop until shutdown or the frame source fails.
    pub fn run(mut self, frames: FrameReader, shutdown: Shutdown) {
        tracing::info!("inference thread started");
        let mut passes: u64 = 0;

        while !shutdown.is_triggered() {
            if frames.has_failed() {
                tracing::warn!("frame source failed; inference thread stopping");
                break;
            }
            match self.run_pass(&frames) {
                PassOutcome::NoFrame => std::thread::sleep(IDLE_WAIT),
                PassOutcome::Repeat => std::thread::sleep(REPEAT_WAIT),
                _ => passes += 1,
            }
        }

        let stats = self.dispatcher.stats();
        tracing::info!(
            passes,
            dispatched = stats.dispatched.load(Ordering::Relaxed),
            verified = stats.succeeded.load(Ordering::Relaxed),
            failed = stats.failed.load(Ordering::Relaxed),
            in_flight = self.dispatcher.in_flight(),
            "inference thread exiting"
        );
    }
}

impl<A: FaceAnalyzer + Send + 'static> InferenceWorker<A> {
    pub fn spawn(
        self,
        frames: FrameReader,
        shutdown: Shutdown,
    ) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name("gatewatch-inference".into())
            .spawn(move || self.run(frames, shutdown))
    }
}
