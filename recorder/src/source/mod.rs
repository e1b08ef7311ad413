pub mod device;
pub mod mjpeg;

use motioncam_common::config::{CameraConfig, CaptureMode};
use motioncam_common::frame::{Frame, FrameError};

pub use device::DeviceSource;
pub use mjpeg::MjpegSource;

/// Supplies frames one at a time. Any error is fatal to the recorder.
pub trait FrameSource {
    async fn next_frame(&mut self) -> Result<Frame, SourceError>;

    /// Release the underlying device or connection.
    async fn release(&mut self) {}
}

/// The configured capture backend.
pub enum CaptureSource {
    Device(DeviceSource),
    Mjpeg(MjpegSource),
}

impl CaptureSource {
    pub async fn open(config: &CameraConfig) -> Result<Self, SourceError> {
        match config.mode {
            CaptureMode::Device => Ok(Self::Device(DeviceSource::open(config)?)),
            CaptureMode::Mjpeg => {
                let url = config
                    .url
                    .as_deref()
                    .ok_or_else(|| SourceError::Unavailable("camera.url is not set".into()))?;
                Ok(Self::Mjpeg(MjpegSource::connect(url).await?))
            }
        }
    }
}

impl FrameSource for CaptureSource {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        match self {
            Self::Device(source) => source.next_frame().await,
            Self::Mjpeg(source) => source.next_frame().await,
        }
    }

    async fn release(&mut self) {
        match self {
            Self::Device(source) => source.release().await,
            Self::Mjpeg(source) => source.release().await,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("capture source unavailable: {0}")]
    Unavailable(String),
    #[error("capture stream ended")]
    Ended,
    #[error("capture read failed: {0}")]
    Read(String),
    #[error("HTTP connection failed: {0}")]
    HttpConnect(reqwest::Error),
    #[error("HTTP stream error: {0}")]
    HttpStream(reqwest::Error),
    #[error("HTTP status {0}")]
    HttpStatus(u16),
    #[error(transparent)]
    Frame(#[from] FrameError),
}
