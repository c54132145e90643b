//! Startup wiring and orderly teardown of the capture, inference, verify,
//! render and uplink stages.

use crate::cache::SpatialResultCache;
use crate::config::Config;
use crate::dispatcher::{DispatcherSettings, VerificationDispatcher};
use crate::inference::{DetectionSnapshot, InferenceWorker, QualityGates};
use crate::overlay::Overlay;
use crate::render::{Compositor, PreviewWriter, RenderExit, RenderLoop};
use crate::shutdown::Shutdown;
use crate::uplink::{StreamUplink, UplinkSettings};
use crate::verifier::{HttpVerifier, VerifyError};
use gatewatch_core::{AnalyzerError, OnnxFaceAnalyzer};
use gatewatch_hw::{Camera, CameraError, FrameSource};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("model error: {0}")]
    Analyzer(#[from] AnalyzerError),
    #[error("verifier setup failed: {0}")]
    Verifier(#[from] VerifyError),
    #[error("failed to spawn worker thread: {0}")]
    Thread(#[from] std::io::Error),
}

/// Run the whole pipeline on the calling thread until `shutdown` fires or
/// the camera fails.
///
/// Models and the camera are opened before anything else starts, so a
/// missing model or busy device fails here instead of mid-stream. Must not
/// be called from inside an async task: the verifier uses a blocking HTTP
/// client and the uplink is joined with `block_on`.
pub fn run(
    config: &Config,
    runtime: &tokio::runtime::Handle,
    shutdown: Shutdown,
) -> Result<RenderExit, PipelineError> {
    let analyzer = OnnxFaceAnalyzer::load(&config.scrfd_model_path(), &config.arcface_model_path())?;
    let verifier = Arc::new(HttpVerifier::new(
        &config.verify_url,
        &config.source_id,
        config.verify_timeout(),
    )?);

    let device = config.camera_device.clone();
    let (width, height) = (config.capture_width, config.capture_height);
    let source = FrameSource::start(move || {
        let camera = Camera::open(&device, width, height)?;
        tracing::info!(
            device = %camera.device_path,
            width = camera.width,
            height = camera.height,
            format = ?camera.pixel_format(),
            "camera opened"
        );
        camera.into_stream()
    })?;

    let cache = Arc::new(SpatialResultCache::new());
    let snapshot = Arc::new(DetectionSnapshot::new());
    let dispatcher = Arc::new(VerificationDispatcher::start(
        verifier,
        cache.clone(),
        DispatcherSettings {
            debounce: config.debounce(),
            ttl: config.cache_ttl(),
            workers: config.verify_workers,
        },
    )?);

    let uplink = StreamUplink::spawn(
        runtime,
        UplinkSettings {
            url: config.relay_url.clone(),
            backoff: config.reconnect_backoff(),
        },
        shutdown.clone(),
    );

    let inference = InferenceWorker::new(
        analyzer,
        snapshot.clone(),
        dispatcher,
        QualityGates {
            min_brightness: config.min_brightness,
            min_face_width: config.min_face_width,
            min_det_score: config.min_det_score,
        },
        config.bucket_size,
    )
    .spawn(source.reader(), shutdown.clone());
    let inference = match inference {
        Ok(handle) => handle,
        Err(e) => {
            shutdown.trigger();
            runtime.block_on(uplink.join());
            return Err(e.into());
        }
    };

    let overlay = Overlay::load(config.font_path.as_deref());
    tracing::debug!(labels = overlay.has_labels(), "overlay ready");
    let compositor = Compositor::new(
        overlay,
        cache,
        config.bucket_size,
        config.mirror,
        config.jpeg_quality,
    );
    let preview = config
        .preview_path
        .clone()
        .map(|path| PreviewWriter::new(path, config.preview_interval()));

    tracing::info!(relay = %config.relay_url, verify = %config.verify_url, "pipeline running");
    let exit = RenderLoop::new(
        source,
        snapshot,
        compositor,
        uplink.sender(),
        uplink.stats(),
        preview,
    )
    .run(&shutdown);

    // The render loop may have stopped on its own (camera loss); make sure
    // every other stage sees it.
    shutdown.trigger();
    if inference.join().is_err() {
        tracing::error!("inference thread panicked");
    }
    runtime.block_on(uplink.join());

    Ok(exit)
}

/// Open the camera only long enough to confirm it works; used by `check`.
pub fn probe_camera(config: &Config) -> Result<FrameSource, CameraError> {
    let device = config.camera_device.clone();
    let (width, height) = (config.capture_width, config.capture_height);
    FrameSource::start(move || Camera::open(&device, width, height)?.into_stream())
}
