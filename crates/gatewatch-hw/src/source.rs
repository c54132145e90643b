//! Continuous capture on a dedicated thread, exposing only the latest frame.

use crate::camera::CameraError;
use crate::frame::Frame;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::JoinHandle;

/// Undecodable frames in a row after which the device is treated as dead.
const MAX_CONSECUTIVE_BAD_FRAMES: u32 = 30;

/// Something that can produce frames, one per call.
///
/// `Ok(None)` means the device had nothing to hand over this tick (e.g. a
/// dequeue timeout); the capture loop just tries again.
/// [`CameraError::BadFrame`] drops that one frame. Any other `Err` is fatal.
pub trait FrameGrabber {
    fn grab(&mut self) -> Result<Option<Frame>, CameraError>;
}

/// Lifecycle of the capture thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Running,
    Failed,
    Stopped,
}

impl SourceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Running,
            1 => Self::Failed,
            _ => Self::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Running => 0,
            Self::Failed => 1,
            Self::Stopped => 2,
        }
    }
}

struct Shared {
    latest: Mutex<Option<Arc<Frame>>>,
    state: AtomicU8,
    stop: AtomicBool,
}

impl Shared {
    fn state(&self) -> SourceState {
        SourceState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: SourceState) {
        self.state.store(state.as_u8(), Ordering::Release);
    }

    fn read(&self) -> Option<Arc<Frame>> {
        if self.state() != SourceState::Running {
            return None;
        }
        self.latest.lock().ok()?.clone()
    }
}

/// Owns the capture thread. Dropping it stops capture and releases the device.
pub struct FrameSource {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

/// Cheap read-only view of a [`FrameSource`] for other threads.
#[derive(Clone)]
pub struct FrameReader {
    shared: Arc<Shared>,
}

impl FrameSource {
    /// Spawn the capture thread and open the device on it.
    ///
    /// `open` runs on the capture thread so the grabber never has to cross
    /// threads; its error (if any) is returned from here, so startup still
    /// fails fast.
    pub fn start<F, G>(open: F) -> Result<Self, CameraError>
    where
        F: FnOnce() -> Result<G, CameraError> + Send + 'static,
        G: FrameGrabber,
    {
        let shared = Arc::new(Shared {
            latest: Mutex::new(None),
            state: AtomicU8::new(SourceState::Running.as_u8()),
            stop: AtomicBool::new(false),
        });

        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<(), CameraError>>(1);
        let thread_shared = shared.clone();

        let handle = std::thread::Builder::new()
            .name("gatewatch-capture".into())
            .spawn(move || {
                let grabber = match open() {
                    Ok(g) => {
                        let _ = ready_tx.send(Ok(()));
                        g
                    }
                    Err(e) => {
                        thread_shared.set_state(SourceState::Failed);
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                capture_loop(grabber, &thread_shared);
            })
            .map_err(|e| CameraError::Thread(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                shared,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(CameraError::Thread("capture thread exited during startup".into()))
            }
        }
    }

    /// Most recent frame, or `None` if nothing was captured yet or the
    /// device has failed.
    pub fn read(&self) -> Option<Arc<Frame>> {
        self.shared.read()
    }

    pub fn state(&self) -> SourceState {
        self.shared.state()
    }

    pub fn has_failed(&self) -> bool {
        self.shared.state() == SourceState::Failed
    }

    pub fn reader(&self) -> FrameReader {
        FrameReader {
            shared: self.shared.clone(),
        }
    }

    /// Signal the capture thread, wait for it to release the device.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::error!("capture thread panicked");
            }
        }
        if self.shared.state() == SourceState::Running {
            self.shared.set_state(SourceState::Stopped);
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

impl FrameReader {
    pub fn read(&self) -> Option<Arc<Frame>> {
        self.shared.read()
    }

    pub fn has_failed(&self) -> bool {
        self.shared.state() == SourceState::Failed
    }
}

fn capture_loop<G: FrameGrabber>(mut grabber: G, shared: &Shared) {
    tracing::info!("capture thread started");
    let mut captured: u64 = 0;
    let mut bad_streak: u32 = 0;

    while !shared.stop.load(Ordering::Acquire) {
        match grabber.grab() {
            Ok(Some(frame)) => {
                captured += 1;
                bad_streak = 0;
                let frame = Arc::new(frame);
                match shared.latest.lock() {
                    Ok(mut latest) => *latest = Some(frame),
                    Err(_) => {
                        tracing::error!("latest-frame lock poisoned; stopping capture");
                        shared.set_state(SourceState::Failed);
                        break;
                    }
                }
            }
            Ok(None) => {
                tracing::debug!("no frame from device this tick");
            }
            Err(CameraError::BadFrame(reason)) => {
                bad_streak += 1;
                tracing::warn!(%reason, bad_streak, "dropping undecodable frame");
                if bad_streak >= MAX_CONSECUTIVE_BAD_FRAMES {
                    tracing::error!(bad_streak, captured, "device keeps sending garbage; frame source stopping");
                    shared.set_state(SourceState::Failed);
                    break;
                }
            }
            Err(e) => {
                tracing::error!(error = %e, captured, "capture failed; frame source stopping");
                shared.set_state(SourceState::Failed);
                break;
            }
        }
    }

    if let Ok(mut latest) = shared.latest.lock() {
        latest.take();
    }
    drop(grabber);
    tracing::info!(captured, "capture thread exiting");
}
