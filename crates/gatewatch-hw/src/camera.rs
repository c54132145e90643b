//! V4L2 camera capture via the `v4l` crate.

use crate::frame::{self, Frame};
use crate::source::FrameGrabber;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use v4l::buffer::Type as BufType;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

/// Driver-side buffer depth. One buffer means a stalled consumer can never
/// find a backlog of stale frames waiting in the driver.
const STREAM_BUFFERS: u32 = 1;

/// How long a single dequeue may block before the capture thread re-checks
/// its stop flag.
const DEQUEUE_TIMEOUT: Duration = Duration::from_millis(1000);

#[derive(Error, Debug)]
pub enum CameraError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),
    #[error("capture failed: {0}")]
    CaptureFailed(String),
    /// The device delivered a buffer that could not be decoded. The stream
    /// itself is still healthy.
    #[error("undecodable frame: {0}")]
    BadFrame(String),
    #[error("device busy")]
    DeviceBusy,
    #[error("format negotiation failed: {0}")]
    FormatNegotiationFailed(String),
    #[error("streaming not supported")]
    StreamingNotSupported,
    #[error("capture thread could not be started: {0}")]
    Thread(String),
}

/// Info about a discovered V4L2 device.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub path: String,
    pub name: String,
    pub driver: String,
    pub bus: String,
}

/// Negotiated pixel format for the camera.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// Motion-JPEG, one JPEG image per buffer.
    Mjpg,
    /// YUYV 4:2:2 packed (2 bytes/pixel).
    Yuyv,
    /// 8-bit grayscale (1 byte/pixel).
    Grey,
}

impl PixelFormat {
    fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        if fourcc == FourCC::new(b"MJPG") {
            Some(Self::Mjpg)
        } else if fourcc == FourCC::new(b"YUYV") {
            Some(Self::Yuyv)
        } else if fourcc == FourCC::new(b"GREY") {
            Some(Self::Grey)
        } else {
            None
        }
    }
}

/// V4L2 camera device handle.
pub struct Camera {
    device: Device,
    pub width: u32,
    pub height: u32,
    pub device_path: String,
    pub fourcc: FourCC,
    pixel_format: PixelFormat,
}

impl Camera {
    /// Open a V4L2 camera device by path (e.g., "/dev/video0") and negotiate
    /// the requested resolution.
    ///
    /// MJPG is requested first since most USB webcams only reach full frame
    /// rate at 720p in that format; YUYV and GREY are accepted if the driver
    /// negotiates them instead.
    pub fn open(device_path: &str, width: u32, height: u32) -> Result<Self, CameraError> {
        if !Path::new(device_path).exists() {
            return Err(CameraError::DeviceNotFound(device_path.to_string()));
        }
        let device = Device::with_path(device_path).map_err(|e| open_error(device_path, e))?;

        let caps = device
            .query_caps()
            .map_err(|e| CameraError::CaptureFailed(format!("capability query: {e}")))?;
        if !caps.capabilities.contains(v4l::capability::Flags::VIDEO_CAPTURE) {
            return Err(CameraError::StreamingNotSupported);
        }
        tracing::debug!(device = device_path, driver = %caps.driver, card = %caps.card, "capture device found");

        let (format, pixel_format) = negotiate(&device, width, height)?;
        if (format.width, format.height) != (width, height) {
            tracing::warn!(
                requested = %format_args!("{width}x{height}"),
                actual = %format_args!("{}x{}", format.width, format.height),
                "driver adjusted capture resolution"
            );
        }

        Ok(Self {
            device,
            width: format.width,
            height: format.height,
            device_path: device_path.to_string(),
            fourcc: format.fourcc,
            pixel_format,
        })
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    /// Start streaming with a single driver buffer, consuming the camera.
    pub fn into_stream(self) -> Result<CameraStream, CameraError> {
        let mut stream = MmapStream::with_buffers(&self.device, BufType::VideoCapture, STREAM_BUFFERS)
            .map_err(|e| CameraError::CaptureFailed(format!("failed to create mmap stream: {e}")))?;
        stream.set_timeout(DEQUEUE_TIMEOUT);

        tracing::debug!(device = %self.device_path, buffers = STREAM_BUFFERS, "capture stream started");

        Ok(CameraStream {
            stream,
            camera: self,
        })
    }

    /// Convert a raw driver buffer to packed RGB based on the negotiated format.
    fn buf_to_rgb(&self, buf: &[u8]) -> Result<(Vec<u8>, u32, u32), CameraError> {
        match self.pixel_format {
            PixelFormat::Mjpg => frame::mjpeg_to_rgb(buf)
                .map_err(|e| CameraError::BadFrame(e.to_string())),
            PixelFormat::Yuyv => frame::yuyv_to_rgb(buf, self.width, self.height)
                .map(|rgb| (rgb, self.width, self.height))
                .map_err(|e| CameraError::BadFrame(format!("YUYV conversion failed: {e}"))),
            PixelFormat::Grey => frame::grey_to_rgb(buf, self.width, self.height)
                .map(|rgb| (rgb, self.width, self.height))
                .map_err(|e| CameraError::BadFrame(format!("GREY conversion failed: {e}"))),
        }
    }

    /// Capture-capable nodes among `/dev/video0` through `/dev/video15`.
    pub fn list_devices() -> Vec<DeviceInfo> {
        (0..16)
            .map(|i| format!("/dev/video{i}"))
            .filter(|path| Path::new(path).exists())
            .filter_map(|path| {
                let caps = Device::with_path(&path).ok()?.query_caps().ok()?;
                caps.capabilities
                    .contains(v4l::capability::Flags::VIDEO_CAPTURE)
                    .then(|| DeviceInfo {
                        path,
                        name: caps.card,
                        driver: caps.driver,
                        bus: caps.bus,
                    })
            })
            .collect()
    }
}

fn open_error(device_path: &str, e: io::Error) -> CameraError {
    if e.raw_os_error() == Some(16) || e.to_string().contains("busy") {
        CameraError::DeviceBusy
    } else {
        CameraError::DeviceNotFound(format!("{device_path}: {e}"))
    }
}

/// Ask for MJPG at the requested size and accept whatever supported format
/// the driver settles on.
fn negotiate(device: &Device, width: u32, height: u32) -> Result<(v4l::Format, PixelFormat), CameraError> {
    let mut wanted = device
        .format()
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("get format: {e}")))?;
    wanted.fourcc = FourCC::new(b"MJPG");
    wanted.width = width;
    wanted.height = height;

    let format = device
        .set_format(&wanted)
        .map_err(|e| CameraError::FormatNegotiationFailed(format!("set format: {e}")))?;
    let pixel_format = PixelFormat::from_fourcc(format.fourcc).ok_or_else(|| {
        CameraError::FormatNegotiationFailed(format!(
            "driver chose {:?}; supported formats are MJPG, YUYV and GREY",
            format.fourcc
        ))
    })?;
    Ok((format, pixel_format))
}

/// A streaming camera: the device plus its memory-mapped capture queue.
pub struct CameraStream {
    // Declared before `camera` so the stream is torn down first.
    stream: MmapStream<'static>,
    camera: Camera,
}

impl FrameGrabber for CameraStream {
    fn grab(&mut self) -> Result<Option<Frame>, CameraError> {
        let (buf, meta) = match self.stream.next() {
            Ok(next) => next,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => {
                return Err(CameraError::CaptureFailed(format!(
                    "failed to dequeue buffer: {e}"
                )))
            }
        };

        let used = (meta.bytesused as usize).min(buf.len());
        let payload = if used > 0 { &buf[..used] } else { buf };
        let sequence = meta.sequence;

        let (rgb, width, height) = self.camera.buf_to_rgb(payload)?;
        let frame = Frame::from_rgb(rgb, width, height, sequence)
            .map_err(|e| CameraError::BadFrame(e.to_string()))?;
        Ok(Some(frame))
    }
}
