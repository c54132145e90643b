use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Daemon configuration.
///
/// Built from defaults, then an optional TOML file, then `GATEWATCH_*`
/// environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Mirror the outgoing stream left-to-right.
    pub mirror: bool,

    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,

    /// Frames whose mean luminance is below this skip inference entirely.
    pub min_brightness: f32,
    /// Faces narrower than this (pixels) are dropped.
    pub min_face_width: f32,
    /// Faces with a lower detection score are dropped.
    pub min_det_score: f32,
    /// Spatial key bucket edge, in pixels.
    pub bucket_size: u32,

    /// Minimum gap between any two verification dispatches.
    pub debounce_secs: f64,
    /// Lifetime of a cached verification result.
    pub cache_ttl_secs: f64,
    /// Upper bound on concurrent verification calls.
    pub verify_workers: usize,
    pub verify_url: String,
    pub verify_timeout_secs: f64,
    /// Identifies this device to the verification service.
    pub source_id: String,

    /// WebSocket relay receiving the annotated stream.
    pub relay_url: String,
    pub reconnect_backoff_secs: f64,
    pub jpeg_quality: u8,

    /// TrueType font for overlay labels. Labels are skipped if it can't be loaded.
    pub font_path: Option<PathBuf>,
    /// When set, the latest annotated frame is also written here.
    pub preview_path: Option<PathBuf>,
    pub preview_interval_secs: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 1280,
            capture_height: 720,
            mirror: true,
            model_dir: gatewatch_core::default_model_dir(),
            min_brightness: 40.0,
            min_face_width: 60.0,
            min_det_score: 0.6,
            bucket_size: 50,
            debounce_secs: 2.0,
            cache_ttl_secs: 10.0,
            verify_workers: 4,
            verify_url: "http://127.0.0.1:8000/attendance/identify".to_string(),
            verify_timeout_secs: 5.0,
            source_id: "gatewatch-01".to_string(),
            relay_url: "ws://127.0.0.1:8000/ws/video-input".to_string(),
            reconnect_backoff_secs: 2.0,
            jpeg_quality: 80,
            font_path: Some(PathBuf::from(
                "/usr/share/fonts/truetype/dejavu/DejaVuSans-Bold.ttf",
            )),
            preview_path: None,
            preview_interval_secs: 1.0,
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the file at `path` if given, then
    /// environment overrides. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Override fields from `GATEWATCH_*` environment variables.
    pub fn apply_env(&mut self) {
        env_string("GATEWATCH_CAMERA_DEVICE", &mut self.camera_device);
        env_parse("GATEWATCH_CAPTURE_WIDTH", &mut self.capture_width);
        env_parse("GATEWATCH_CAPTURE_HEIGHT", &mut self.capture_height);
        if let Ok(v) = std::env::var("GATEWATCH_MIRROR") {
            self.mirror = v != "0";
        }
        if let Ok(v) = std::env::var("GATEWATCH_MODEL_DIR") {
            self.model_dir = PathBuf::from(v);
        }
        env_parse("GATEWATCH_MIN_BRIGHTNESS", &mut self.min_brightness);
        env_parse("GATEWATCH_MIN_FACE_WIDTH", &mut self.min_face_width);
        env_parse("GATEWATCH_MIN_DET_SCORE", &mut self.min_det_score);
        env_parse("GATEWATCH_BUCKET_SIZE", &mut self.bucket_size);
        env_parse("GATEWATCH_DEBOUNCE_SECS", &mut self.debounce_secs);
        env_parse("GATEWATCH_CACHE_TTL_SECS", &mut self.cache_ttl_secs);
        env_parse("GATEWATCH_VERIFY_WORKERS", &mut self.verify_workers);
        env_string("GATEWATCH_VERIFY_URL", &mut self.verify_url);
        env_parse("GATEWATCH_VERIFY_TIMEOUT_SECS", &mut self.verify_timeout_secs);
        env_string("GATEWATCH_SOURCE_ID", &mut self.source_id);
        env_string("GATEWATCH_RELAY_URL", &mut self.relay_url);
        env_parse("GATEWATCH_RECONNECT_BACKOFF_SECS", &mut self.reconnect_backoff_secs);
        env_parse("GATEWATCH_JPEG_QUALITY", &mut self.jpeg_quality);
        if let Ok(v) = std::env::var("GATEWATCH_FONT_PATH") {
            self.font_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("GATEWATCH_PREVIEW_PATH") {
            self.preview_path = (!v.is_empty()).then(|| PathBuf::from(v));
        }
        env_parse("GATEWATCH_PREVIEW_INTERVAL_SECS", &mut self.preview_interval_secs);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.camera_device.is_empty() {
            return invalid("camera_device must not be empty");
        }
        if self.capture_width == 0 || self.capture_height == 0 {
            return invalid("capture resolution must be non-zero");
        }
        if self.bucket_size == 0 {
            return invalid("bucket_size must be non-zero");
        }
        if !(0.0..=1.0).contains(&self.min_det_score) {
            return invalid("min_det_score must be within [0, 1]");
        }
        if self.min_face_width < 0.0 || self.min_brightness < 0.0 {
            return invalid("quality thresholds must not be negative");
        }
        for (name, secs) in [
            ("debounce_secs", self.debounce_secs),
            ("cache_ttl_secs", self.cache_ttl_secs),
            ("verify_timeout_secs", self.verify_timeout_secs),
            ("reconnect_backoff_secs", self.reconnect_backoff_secs),
            ("preview_interval_secs", self.preview_interval_secs),
        ] {
            if !secs.is_finite() || secs < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a non-negative number of seconds"
                )));
            }
        }
        if self.verify_workers == 0 {
            return invalid("verify_workers must be at least 1");
        }
        if self.verify_url.is_empty() || self.relay_url.is_empty() {
            return invalid("verify_url and relay_url must be set");
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid("jpeg_quality must be within 1..=100");
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_secs_f64(self.debounce_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.cache_ttl_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.verify_timeout_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_backoff_secs)
    }

    pub fn preview_interval(&self) -> Duration {
        Duration::from_secs_f64(self.preview_interval_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn env_string(key: &str, slot: &mut String) {
    if let Ok(v) = std::env::var(key) {
        *slot = v;
    }
}

fn env_parse<T: FromStr>(key: &str, slot: &mut T) {
    let Ok(raw) = std::env::var(key) else {
        return;
    };
    match raw.parse() {
        Ok(v) => *slot = v,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.debounce(), Duration::from_secs(2));
        assert_eq!(config.cache_ttl(), Duration::from_secs(10));
        assert_eq!(config.bucket_size, 50);
        assert_eq!(config.jpeg_quality, 80);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml(
            r#"
            camera_device = "/dev/video4"
            debounce_secs = 1.0
            min_det_score = 0.75
            preview_path = "/tmp/gatewatch.jpg"
            "#,
        )
        .unwrap();
        assert_eq!(config.camera_device, "/dev/video4");
        assert_eq!(config.debounce(), Duration::from_secs(1));
        assert_eq!(config.min_det_score, 0.75);
        assert_eq!(config.preview_path, Some(PathBuf::from("/tmp/gatewatch.jpg")));
        assert_eq!(config.capture_width, 1280);
        assert_eq!(config.relay_url, "ws://127.0.0.1:8000/ws/video-input");
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(Config::from_toml("debounce = 3").is_err());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config { bucket_size: 0, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { jpeg_quality: 0, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { min_det_score: 1.5, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { cache_ttl_secs: -1.0, ..Config::default() };
        assert!(config.validate().is_err());

        config = Config { verify_workers: 0, ..Config::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serializes_back_to_toml() {
        let text = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed = Config::from_toml(&text).unwrap();
        assert_eq!(parsed.verify_url, Config::default().verify_url);
        assert_eq!(parsed.font_path, Config::default().font_path);
    }

    #[test]
    fn test_model_paths() {
        let config = Config {
            model_dir: PathBuf::from("/opt/models"),
            ..Config::default()
        };
        assert_eq!(config.scrfd_model_path(), "/opt/models/det_10g.onnx");
        assert_eq!(config.arcface_model_path(), "/opt/models/w600k_r50.onnx");
    }
}
