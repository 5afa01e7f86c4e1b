use crate::engine::EngineOptions;
use crate::pipeline::PipelineSettings;
use serde::Deserialize;
use sightline_hw::Backoff;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Engine configuration: TOML file values, then `SIGHTLINE_*` environment overrides.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Persisted gallery file.
    pub gallery_path: PathBuf,
    /// Minimum detector confidence for a box to count as a face (inclusive).
    pub confidence_threshold: f32,
    /// Euclidean distance below which a probe matches an identity.
    pub recognition_threshold: f32,
    pub detection_enabled: bool,
    pub tick_interval_ms: u64,
    /// Ticks an enrollment waits for a face before failing.
    pub enrollment_timeout_ticks: u32,
    /// Wait after a failed device open.
    pub reopen_backoff_ms: u64,
    /// Wait after a failed read before reopening.
    pub reconnect_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let settings = PipelineSettings::default();
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 640,
            capture_height: 480,
            gallery_path: default_gallery_path(),
            confidence_threshold: settings.confidence_threshold,
            recognition_threshold: settings.recognition_threshold,
            detection_enabled: settings.detection_enabled,
            tick_interval_ms: 100,
            enrollment_timeout_ticks: 50,
            reopen_backoff_ms: 1000,
            reconnect_backoff_ms: 500,
        }
    }
}

impl EngineConfig {
    /// Load configuration from `SIGHTLINE_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    /// Load a TOML file, then apply environment overrides.
    ///
    /// Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config.with_overrides(|key| std::env::var(key).ok()))
    }

    /// `load` when a path is given, `from_env` otherwise.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::from_env()),
        }
    }

    fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Apply overrides from `lookup`; values that fail to parse are ignored.
    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(device) = lookup("SIGHTLINE_CAMERA_DEVICE") {
            self.camera_device = device;
        }
        if let Some(path) = lookup("SIGHTLINE_GALLERY_PATH") {
            self.gallery_path = PathBuf::from(path);
        }
        override_parsed(&lookup, "SIGHTLINE_CAPTURE_WIDTH", &mut self.capture_width);
        override_parsed(&lookup, "SIGHTLINE_CAPTURE_HEIGHT", &mut self.capture_height);
        override_parsed(&lookup, "SIGHTLINE_CONFIDENCE_THRESHOLD", &mut self.confidence_threshold);
        override_parsed(&lookup, "SIGHTLINE_RECOGNITION_THRESHOLD", &mut self.recognition_threshold);
        override_parsed(&lookup, "SIGHTLINE_TICK_INTERVAL_MS", &mut self.tick_interval_ms);
        override_parsed(&lookup, "SIGHTLINE_ENROLLMENT_TIMEOUT_TICKS", &mut self.enrollment_timeout_ticks);
        override_parsed(&lookup, "SIGHTLINE_REOPEN_BACKOFF_MS", &mut self.reopen_backoff_ms);
        override_parsed(&lookup, "SIGHTLINE_RECONNECT_BACKOFF_MS", &mut self.reconnect_backoff_ms);
        if let Some(enabled) = lookup("SIGHTLINE_DETECTION_ENABLED").as_deref().and_then(parse_flag) {
            self.detection_enabled = enabled;
        }
        self
    }

    pub fn pipeline_settings(&self) -> PipelineSettings {
        PipelineSettings {
            confidence_threshold: self.confidence_threshold,
            recognition_threshold: self.recognition_threshold,
            detection_enabled: self.detection_enabled,
        }
    }

    pub fn backoff(&self) -> Backoff {
        Backoff {
            reopen: Duration::from_millis(self.reopen_backoff_ms),
            reconnect: Duration::from_millis(self.reconnect_backoff_ms),
        }
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            // A zero interval would spin the engine thread
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            enrollment_timeout_ticks: self.enrollment_timeout_ticks.max(1),
        }
    }
}

/// `$XDG_DATA_HOME/sightline/gallery.json`, falling back to `~/.local/share`.
pub fn default_gallery_path() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("sightline")
        .join("gallery.json")
}

fn override_parsed<T: FromStr>(lookup: impl Fn(&str) -> Option<String>, key: &str, target: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring invalid config override"),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
