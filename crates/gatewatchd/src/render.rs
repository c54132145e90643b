//! Frame-rate loop: compose the annotated frame and hand it to the uplink.

use crate::cache::SpatialResultCache;
use crate::inference::DetectionSnapshot;
use crate::overlay::{self, Overlay};
use crate::shutdown::Shutdown;
use crate::uplink::{UplinkSender, UplinkStats};
use gatewatch_core::FaceObservation;
use gatewatch_hw::{Frame, FrameSource};
use image::RgbImage;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

const IDLE_WAIT: Duration = Duration::from_millis(10);
const STATUS_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("frame buffer does not match {width}x{height}")]
    BadFrame { width: u32, height: u32 },
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

/// Why the render loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderExit {
    Shutdown,
    SourceFailed,
}

/// Builds the outgoing image from a frame plus the current detections.
pub struct Compositor {
    overlay: Overlay,
    cache: Arc<SpatialResultCache>,
    bucket_size: u32,
    mirror: bool,
    jpeg_quality: u8,
}

impl Compositor {
    pub fn new(
        overlay: Overlay,
        cache: Arc<SpatialResultCache>,
        bucket_size: u32,
        mirror: bool,
        jpeg_quality: u8,
    ) -> Self {
        Self {
            overlay,
            cache,
            bucket_size,
            mirror,
            jpeg_quality,
        }
    }

    /// Draw onto a private copy of `frame`; the shared frame is untouched.
    pub fn compose(
        &self,
        frame: &Frame,
        faces: &[FaceObservation],
        now: Instant,
    ) -> Result<RgbImage, RenderError> {
        let mut copy = frame.clone();
        if self.mirror {
            copy.mirror();
        }
        let mut img = RgbImage::from_raw(copy.width, copy.height, copy.data).ok_or(
            RenderError::BadFrame {
                width: frame.width,
                height: frame.height,
            },
        )?;

        let annotations = overlay::annotate(
            faces,
            &self.cache,
            self.bucket_size,
            frame.width,
            self.mirror,
            now,
        );
        self.overlay.draw(&mut img, &annotations);
        Ok(img)
    }

    pub fn encode(&self, img: &RgbImage) -> Result<Vec<u8>, RenderError> {
        Ok(overlay::encode_jpeg(img, self.jpeg_quality)?)
    }
}

/// Periodically writes the latest encoded frame to disk for local viewing.
pub struct PreviewWriter {
    path: PathBuf,
    interval: Duration,
    last: Option<Instant>,
}

impl PreviewWriter {
    pub fn new(path: PathBuf, interval: Duration) -> Self {
        Self {
            path,
            interval,
            last: None,
        }
    }

    pub fn maybe_write(&mut self, jpeg: &[u8], now: Instant) {
        if self
            .last
            .is_some_and(|last| now.saturating_duration_since(last) < self.interval)
        {
            return;
        }
        self.last = Some(now);

        // Write-then-rename so viewers never see a torn file.
        let tmp = self.path.with_extension("tmp");
        let result = std::fs::write(&tmp, jpeg).and_then(|()| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            tracing::warn!(path = %self.path.display(), error = %e, "preview write failed");
        }
    }
}

pub struct RenderLoop {
    source: FrameSource,
    snapshot: Arc<DetectionSnapshot>,
    compositor: Compositor,
    uplink: UplinkSender,
    uplink_stats: Arc<UplinkStats>,
    preview: Option<PreviewWriter>,
}

impl RenderLoop {
    pub fn new(
        source: FrameSource,
        snapshot: Arc<DetectionSnapshot>,
        compositor: Compositor,
        uplink: UplinkSender,
        uplink_stats: Arc<UplinkStats>,
        preview: Option<PreviewWriter>,
    ) -> Self {
        Self {
            source,
            snapshot,
            compositor,
            uplink,
            uplink_stats,
            preview,
        }
    }

    /// Run until shutdown or device failure. The frame source is stopped
    /// (and the device released) before this returns.
    pub fn run(mut self, shutdown: &Shutdown) -> RenderExit {
        tracing::info!("render loop started");
        let mut last_seen: Option<Arc<Frame>> = None;
        let mut rendered: u64 = 0;
        let mut window_frames: u64 = 0;
        let mut last_status = Instant::now();

        let exit = loop {
            if shutdown.is_triggered() {
                break RenderExit::Shutdown;
            }
            if self.source.has_failed() {
                tracing::error!("frame source failed; stopping render loop");
                break RenderExit::SourceFailed;
            }

            let frame = match self.source.read() {
                Some(frame) if !last_seen.as_ref().is_some_and(|l| Arc::ptr_eq(l, &frame)) => frame,
                _ => {
                    std::thread::sleep(IDLE_WAIT);
                    continue;
                }
            };

            let now = Instant::now();
            let faces = self.snapshot.load();
            match self
                .compositor
                .compose(&frame, &faces, now)
                .and_then(|img| self.compositor.encode(&img))
            {
                Ok(jpeg) => {
                    if let Some(preview) = self.preview.as_mut() {
                        preview.maybe_write(&jpeg, now);
                    }
                    self.uplink.send(jpeg);
                    rendered += 1;
                    window_frames += 1;
                }
                Err(e) => tracing::warn!(error = %e, sequence = frame.sequence, "render failed"),
            }
            let frame_age = now.saturating_duration_since(frame.timestamp);
            last_seen = Some(frame);

            let elapsed = now.duration_since(last_status);
            if elapsed >= STATUS_INTERVAL {
                tracing::info!(
                    fps = window_frames as f64 / elapsed.as_secs_f64(),
                    faces = faces.len(),
                    frame_age_ms = frame_age.as_millis() as u64,
                    cached = self.compositor.cache.len(),
                    relay_connected = self.uplink_stats.is_connected(),
                    relay_sent = self.uplink_stats.sent.load(Ordering::Relaxed),
                    relay_dropped = self.uplink_stats.superseded.load(Ordering::Relaxed),
                    "status"
                );
                window_frames = 0;
                last_status = now;
            }
        };

        self.source.stop();
        tracing::info!(rendered, ?exit, "render loop exiting");
        exit
    }
}
