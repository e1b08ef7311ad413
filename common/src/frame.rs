use image::{GrayImage, RgbImage};
use std::sync::{Arc, OnceLock};

/// Frames are shared, never copied, between the ring buffer and recordings.
pub type SharedFrame = Arc<Frame>;

/// A captured RGB frame with timestamp metadata.
///
/// Pixel data is immutable once constructed. The single-channel intensity
/// image used for motion scoring is computed on first use and cached, so a
/// frame that stays in the ring buffer for many ticks is converted only once.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
    pub captured_at_ms: i64,
    pub seq: u64,
    luma: OnceLock<GrayImage>,
}

impl Frame {
    pub fn new(image: RgbImage, captured_at_ms: i64, seq: u64) -> Self {
        Self {
            image,
            captured_at_ms,
            seq,
            luma: OnceLock::new(),
        }
    }

    /// Build a frame from packed `rgb24` bytes, as emitted by ffmpeg's rawvideo muxer.
    pub fn from_rgb24(
        width: u32,
        height: u32,
        data: Vec<u8>,
        captured_at_ms: i64,
        seq: u64,
    ) -> Result<Self, FrameError> {
        let expected = width as usize * height as usize * 3;
        let got = data.len();
        let image = RgbImage::from_raw(width, height, data)
            .ok_or(FrameError::SizeMismatch { expected, got })?;
        Ok(Self::new(image, captured_at_ms, seq))
    }

    /// Decode a JPEG (or any format `image` can sniff) into an RGB frame.
    pub fn from_jpeg(jpeg_data: &[u8], captured_at_ms: i64, seq: u64) -> Result<Self, FrameError> {
        let img = image::load_from_memory(jpeg_data).map_err(|e| FrameError::Decode(e.to_string()))?;
        Ok(Self::new(img.to_rgb8(), captured_at_ms, seq))
    }

    pub fn into_shared(self) -> SharedFrame {
        Arc::new(self)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed `rgb24` pixel bytes, row-major.
    pub fn rgb24(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Single-channel intensity view of this frame.
    pub fn luma(&self) -> &GrayImage {
        self.luma.get_or_init(|| image::imageops::grayscale(&self.image))
    }

    pub fn captured_at(&self) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(self.captured_at_ms)
            .unwrap_or_else(chrono::Utc::now)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("raw frame has {got} bytes, expected {expected}")]
    SizeMismatch { expected: usize, got: usize },
    #[error("failed to decode frame image: {0}")]
    Decode(String),
}
