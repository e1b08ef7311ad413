use motioncam_common::config::{OutputFormat, StorageConfig};
use motioncam_common::frame::SharedFrame;
use std::path::{Path, PathBuf};
use sysinfo::Disks;
use tracing::{debug, info, warn};

use crate::recorder::encoder::{AviEncoder, EncoderError};
use crate::recorder::keys::{recording_stem, unique_recording_path};

const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

/// Outcome of a successful flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramesSaved {
    pub frames: usize,
    /// `None` when there was nothing to write.
    pub path: Option<PathBuf>,
}

/// Persists finished recordings.
pub trait RecordingSink {
    /// Write `frames` as one recording. Must not create any output when the
    /// storage headroom check fails.
    async fn flush(&mut self, frames: Vec<SharedFrame>) -> Result<FramesSaved, SinkError>;
}

/// Free-space source for the headroom check.
pub trait SpaceProbe: Send + Sync {
    /// Free bytes on the filesystem holding `path`, or `None` if unknown.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

/// Looks up the mounted disk holding a path via `sysinfo`.
pub struct SysinfoProbe;

impl SpaceProbe for SysinfoProbe {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let path = path.canonicalize().ok()?;
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

/// Writes recordings into a local directory, either as ffmpeg-encoded AVI
/// files or as directories of JPEG stills.
pub struct DiskSink {
    output_dir: PathBuf,
    format: OutputFormat,
    fps: f64,
    min_free_space_gb: u64,
    /// `None` disables the headroom check.
    probe: Option<Box<dyn SpaceProbe>>,
}

impl DiskSink {
    /// Create the output directory and probe free space once. If the probe
    /// cannot see the output directory the headroom check is turned off.
    pub fn new(config: &StorageConfig, fps: f64) -> Result<Self, SinkError> {
        std::fs::create_dir_all(&config.output_dir).map_err(|e| {
            SinkError::Io(format!(
                "failed to create output dir {}: {e}",
                config.output_dir.display()
            ))
        })?;

        let probe: Option<Box<dyn SpaceProbe>> =
            match SysinfoProbe.available_bytes(&config.output_dir) {
                Some(bytes) => {
                    info!(
                        output_dir = config.output_dir.display().to_string(),
                        free_gb = bytes / BYTES_PER_GB,
                        min_free_space_gb = config.min_free_space_gb,
                        "free disk space check enabled"
                    );
                    Some(Box::new(SysinfoProbe))
                }
                None => {
                    warn!(
                        output_dir = config.output_dir.display().to_string(),
                        "free disk space check not available, recordings will be written unconditionally"
                    );
                    None
                }
            };

        Ok(Self::with_probe(config, fps, probe))
    }

    pub fn with_probe(config: &StorageConfig, fps: f64, probe: Option<Box<dyn SpaceProbe>>) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            format: config.format,
            fps,
            min_free_space_gb: config.min_free_space_gb,
            probe,
        }
    }

    #[allow(dead_code)]
    pub fn disk_check_enabled(&self) -> bool {
        self.probe.is_some()
    }

    fn check_headroom(&self) -> Result<(), SinkError> {
        let Some(probe) = &self.probe else {
            return Ok(());
        };
        match probe.available_bytes(&self.output_dir) {
            Some(bytes) => {
                let available_gb = bytes / BYTES_PER_GB;
                debug!(available_gb, required_gb = self.min_free_space_gb, "headroom check");
                if available_gb < self.min_free_space_gb {
                    return Err(SinkError::InsufficientStorage {
                        available_gb,
                        required_gb: self.min_free_space_gb,
                    });
                }
                Ok(())
            }
            None => {
                warn!(
                    output_dir = self.output_dir.display().to_string(),
                    "free space probe failed, writing without headroom check"
                );
                Ok(())
            }
        }
    }

    async fn write_avi(&self, frames: &[SharedFrame]) -> Result<PathBuf, SinkError> {
        let (width, height) = (frames[0].width(), frames[0].height());
        let stem = recording_stem(&chrono::Local::now());
        let path = unique_recording_path(&self.output_dir, &stem, Some("avi"));

        let mut encoder = AviEncoder::start(&path, width, height, self.fps)?;
        for frame in frames {
            if let Err(e) = encoder.push_frame(frame).await {
                encoder.abort().await;
                return Err(e.into());
            }
        }
        encoder.finish().await?;
        Ok(path)
    }

    async fn write_jpeg(&self, frames: Vec<SharedFrame>) -> Result<PathBuf, SinkError> {
        let stem = recording_stem(&chrono::Local::now());
        let dir = unique_recording_path(&self.output_dir, &stem, None);

        let target = dir.clone();
        let written = tokio::task::spawn_blocking(move || -> Result<(), SinkError> {
            std::fs::create_dir_all(&target)
                .map_err(|e| SinkError::Io(format!("failed to create {}: {e}", target.display())))?;
            for (i, frame) in frames.iter().enumerate() {
                let path = target.join(format!("{i:06}.jpg"));
                frame
                    .image()
                    .save(&path)
                    .map_err(|e| SinkError::Image(format!("{}: {e}", path.display())))?;
            }
            Ok(())
        })
        .await
        .map_err(|e| SinkError::Io(format!("jpeg writer task failed: {e}")))?;

        if let Err(e) = written {
            if let Err(rm) = tokio::fs::remove_dir_all(&dir).await {
                warn!(path = dir.display().to_string(), error = %rm, "failed to delete partial recording");
            }
            return Err(e);
        }
        Ok(dir)
    }
}

impl RecordingSink for DiskSink {
    async fn flush(&mut self, frames: Vec<SharedFrame>) -> Result<FramesSaved, SinkError> {
        if frames.is_empty() {
            return Ok(FramesSaved {
                frames: 0,
                path: None,
            });
        }

        self.check_headroom()?;

        let count = frames.len();
        let path = match self.format {
            OutputFormat::Avi => self.write_avi(&frames).await?,
            OutputFormat::Jpeg => self.write_jpeg(frames).await?,
        };

        info!(
            frames = count,
            path = path.display().to_string(),
            "frames saved"
        );
        Ok(FramesSaved {
            frames: count,
            path: Some(path),
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("free space {available_gb}GB is below the required {required_gb}GB, frames not saved")]
    InsufficientStorage { available_gb: u64, required_gb: u64 },
    #[error("storage I/O error: {0}")]
    Io(String),
    #[error("failed to encode image: {0}")]
    Image(String),
    #[error(transparent)]
    Encode(#[from] EncoderError),
}
