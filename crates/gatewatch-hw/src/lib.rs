//! gatewatch-hw: camera capture for the gatewatch pipeline.
//!
//! Provides V4L2-based camera access, RGB frame conversion, and the
//! latest-frame [`FrameSource`] that runs capture on its own thread.

pub mod camera;
pub mod frame;
pub mod source;

pub use camera::{Camera, CameraError, CameraStream, DeviceInfo, PixelFormat};
pub use frame::Frame;
pub use source::{FrameGrabber, FrameReader, FrameSource, SourceState};
