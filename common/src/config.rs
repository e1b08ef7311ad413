use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub motion: MotionConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub event_log: EventLogConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureMode {
    /// Local capture device read through ffmpeg.
    Device,
    /// HTTP multipart MJPEG stream (IP camera).
    Mjpeg,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraConfig {
    #[serde(default = "default_capture_mode")]
    pub mode: CaptureMode,
    /// Capture device index, e.g. `0` for `/dev/video0`.
    #[serde(default)]
    pub device: u32,
    /// Stream URL, only used in mjpeg mode.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_fps")]
    pub fps: f64,
    #[serde(default = "default_overlay_timestamp")]
    pub overlay_timestamp: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MotionConfig {
    /// Ring buffer size. Also the number of pre-roll frames spliced into a
    /// recording, the quiet run needed to stop, and the cooldown length.
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    /// Motion score at or above which a frame counts as "moving".
    #[serde(default = "default_threshold")]
    pub threshold: u64,
    /// Consecutive moving frames required before recording starts.
    /// Zero is clamped to one by [`Config::validate`].
    #[serde(default = "default_threshold_frames")]
    pub threshold_frames: u32,
    /// Recording buffer length that forces a flush to storage.
    #[serde(default = "default_max_saved_frames")]
    pub max_saved_frames: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// MJPEG-in-AVI encoded by ffmpeg.
    Avi,
    /// A directory of numbered JPEG stills.
    Jpeg,
}

/// What the recorder does when a flush is refused for lack of disk space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LowSpacePolicy {
    /// Release the camera and exit with a failure status.
    Shutdown,
    /// Drop the frames and keep watching.
    Discard,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "default_min_free_space_gb")]
    pub min_free_space_gb: u64,
    #[serde(default = "default_format")]
    pub format: OutputFormat,
    #[serde(default = "default_low_space_policy")]
    pub on_insufficient_space: LowSpacePolicy,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventLogConfig {
    #[serde(default = "default_event_log_path")]
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            mode: default_capture_mode(),
            device: 0,
            url: None,
            width: default_width(),
            height: default_height(),
            fps: default_fps(),
            overlay_timestamp: default_overlay_timestamp(),
        }
    }
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            max_frames: default_max_frames(),
            threshold: default_threshold(),
            threshold_frames: default_threshold_frames(),
            max_saved_frames: default_max_saved_frames(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            min_free_space_gb: default_min_free_space_gb(),
            format: default_format(),
            on_insufficient_space: default_low_space_policy(),
        }
    }
}

impl Default for EventLogConfig {
    fn default() -> Self {
        Self {
            path: default_event_log_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFile(path.display().to_string(), e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the recorder cannot run with and clamp `threshold_frames`
    /// to at least one.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        if self.motion.max_frames == 0 {
            return Err(ConfigError::Invalid("motion.max_frames must be at least 1".into()));
        }
        if self.motion.max_saved_frames == 0 {
            return Err(ConfigError::Invalid(
                "motion.max_saved_frames must be at least 1".into(),
            ));
        }
        if self.camera.width == 0 || self.camera.height == 0 {
            return Err(ConfigError::Invalid(
                "camera.width and camera.height must be non-zero".into(),
            ));
        }
        if !self.camera.fps.is_finite() || self.camera.fps <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "camera.fps must be positive, got {}",
                self.camera.fps
            )));
        }
        if self.camera.mode == CaptureMode::Mjpeg && self.camera.url.is_none() {
            return Err(ConfigError::Invalid("camera.url is required in mjpeg mode".into()));
        }
        self.motion.threshold_frames = self.motion.threshold_frames.max(1);
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    ReadFile(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}

// Default value functions
fn default_capture_mode() -> CaptureMode {
    CaptureMode::Device
}
fn default_width() -> u32 {
    640
}
fn default_height() -> u32 {
    480
}
fn default_fps() -> f64 {
    30.0
}
fn default_overlay_timestamp() -> bool {
    true
}
fn default_max_frames() -> usize {
    15
}
fn default_threshold() -> u64 {
    15
}
fn default_threshold_frames() -> u32 {
    1
}
fn default_max_saved_frames() -> usize {
    1000
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_min_free_space_gb() -> u64 {
    1
}
fn default_format() -> OutputFormat {
    OutputFormat::Avi
}
fn default_low_space_policy() -> LowSpacePolicy {
    LowSpacePolicy::Shutdown
}
fn default_event_log_path() -> PathBuf {
    PathBuf::from("/var/log/motioncam/motion.log")
}
fn default_log_level() -> String {
    "info".into()
}
