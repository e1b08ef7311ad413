use motioncam_common::frame::Frame;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};
use tracing::{debug, error, info, warn};

/// ffmpeg subprocess turning raw rgb24 frames into an MJPEG AVI file.
pub struct AviEncoder {
    child: Child,
    stdin: ChildStdin,
    output_path: PathBuf,
    width: u32,
    height: u32,
    frame_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum EncoderError {
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("frame {got_w}x{got_h} does not match the {want_w}x{want_h} recording")]
    FrameSize {
        want_w: u32,
        want_h: u32,
        got_w: u32,
        got_h: u32,
    },
    #[error("failed to write frame to ffmpeg stdin: {0}")]
    Write(String),
    #[error("failed to wait for ffmpeg: {0}")]
    Wait(String),
    #[error("ffmpeg exited with non-zero status: {0}")]
    FfmpegFailed(String),
}

impl AviEncoder {
    /// Spawn ffmpeg writing `output_path`, expecting `width`x`height` rgb24 frames on stdin.
    pub fn start(output_path: &Path, width: u32, height: u32, fps: f64) -> Result<Self, EncoderError> {
        let size = format!("{width}x{height}");
        let fps_str = fps.to_string();

        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .args(["-loglevel", "error"])
            .args(["-f", "rawvideo"])
            .args(["-pix_fmt", "rgb24"])
            .args(["-s", &size])
            .args(["-r", &fps_str])
            .args(["-i", "pipe:0"])
            .args(["-c:v", "mjpeg"])
            .args(["-q:v", "3"])
            .arg("-y")
            .arg(output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| EncoderError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EncoderError::Spawn("could not get stdin handle".into()))?;

        debug!(
            size,
            fps,
            output = output_path.display().to_string(),
            "ffmpeg encoder started"
        );

        Ok(Self {
            child,
            stdin,
            output_path: output_path.to_path_buf(),
            width,
            height,
            frame_count: 0,
        })
    }

    pub async fn push_frame(&mut self, frame: &Frame) -> Result<(), EncoderError> {
        if (frame.width(), frame.height()) != (self.width, self.height) {
            return Err(EncoderError::FrameSize {
                want_w: self.width,
                want_h: self.height,
                got_w: frame.width(),
                got_h: frame.height(),
            });
        }
        self.stdin
            .write_all(frame.rgb24())
            .await
            .map_err(|e| EncoderError::Write(e.to_string()))?;
        self.frame_count += 1;
        Ok(())
    }

    /// Close stdin and wait for ffmpeg to finish the file.
    /// The partial output is removed if ffmpeg fails.
    pub async fn finish(self) -> Result<u32, EncoderError> {
        drop(self.stdin);

        let output = self
            .child
            .wait_with_output()
            .await
            .map_err(|e| EncoderError::Wait(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(stderr = %stderr, "ffmpeg exited with error");
            discard_partial(&self.output_path).await;
            return Err(EncoderError::FfmpegFailed(stderr.into_owned()));
        }

        info!(
            frame_count = self.frame_count,
            output = self.output_path.display().to_string(),
            "recording encoding complete"
        );

        Ok(self.frame_count)
    }

    /// Kill ffmpeg and remove whatever it wrote so far.
    pub async fn abort(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to kill ffmpeg encoder");
        }
        discard_partial(&self.output_path).await;
    }
}

async fn discard_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = path.display().to_string(), error = %e, "failed to delete partial recording");
        }
    }
}

/// Check whether ffmpeg is available on PATH. Logs a warning if not found.
pub async fn check_ffmpeg_available() {
    match Command::new("ffmpeg").arg("-version").output().await {
        Ok(out) if out.status.success() => {
            debug!("ffmpeg is available");
        }
        Ok(_) => {
            warn!("ffmpeg returned non-zero for -version; capture and encoding may fail");
        }
        Err(e) => {
            warn!(
                error = %e,
                "ffmpeg not found on PATH; device capture and AVI recordings will fail. \
                 Install ffmpeg or use the jpeg output format with an mjpeg camera."
            );
        }
    }
}
