use chrono::Utc;
use motioncam_common::config::CameraConfig;
use motioncam_common::frame::Frame;
use std::collections::VecDeque;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{FrameSource, SourceError};

/// ffmpeg stderr lines kept for the exit reason.
const STDERR_TAIL_LINES: usize = 8;

/// Timestamp burned into the top-left corner, `HH:MM:SS DD-MM-YYYY`.
const OVERLAY_FILTER: &str = "drawtext=text='%{localtime\\:%T %d-%m-%Y}':x=10:y=10:\
                              fontsize=24:fontcolor=white:borderw=2:bordercolor=black";

/// Local capture device read through an ffmpeg subprocess that emits raw
/// rgb24 frames of exactly `width`x`height` on stdout.
pub struct DeviceSource {
    child: Child,
    stdout: BufReader<ChildStdout>,
    /// Drains ffmpeg's stderr while capture runs; yields the last lines.
    stderr_tail: Option<JoinHandle<String>>,
    width: u32,
    height: u32,
    frame_len: usize,
    seq: u64,
}

impl DeviceSource {
    pub fn open(config: &CameraConfig) -> Result<Self, SourceError> {
        let args = ffmpeg_args(config);
        debug!(args = args.join(" "), "spawning ffmpeg capture");

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SourceError::Unavailable(format!("failed to spawn ffmpeg: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SourceError::Unavailable("could not get ffmpeg stdout".into()))?;
        let stderr_tail = child.stderr.take().map(|pipe| tokio::spawn(drain_stderr(pipe)));

        info!(
            device = device_input(config.device),
            width = config.width,
            height = config.height,
            fps = config.fps,
            overlay = config.overlay_timestamp,
            "capture device opened"
        );

        Ok(Self {
            child,
            stdout: BufReader::with_capacity(1 << 20, stdout),
            stderr_tail,
            width: config.width,
            height: config.height,
            frame_len: config.width as usize * config.height as usize * 3,
            seq: 0,
        })
    }

    /// Collect whatever ffmpeg said on stderr after it has exited.
    async fn exit_reason(&mut self) -> String {
        let stderr = match self.stderr_tail.take() {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let status = self.child.wait().await.map(|s| s.to_string());
        match (stderr.trim(), status) {
            ("", Ok(status)) => format!("ffmpeg exited ({status})"),
            ("", Err(e)) => format!("ffmpeg exited: {e}"),
            (msg, _) => msg.to_string(),
        }
    }
}

impl FrameSource for DeviceSource {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        let mut data = vec![0u8; self.frame_len];
        match self.stdout.read_exact(&mut data).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                let reason = self.exit_reason().await;
                return Err(SourceError::Unavailable(reason));
            }
            Err(e) => return Err(SourceError::Read(e.to_string())),
        }

        let seq = self.seq;
        self.seq += 1;
        Ok(Frame::from_rgb24(
            self.width,
            self.height,
            data,
            Utc::now().timestamp_millis(),
            seq,
        )?)
    }

    async fn release(&mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "failed to stop ffmpeg capture");
        } else {
            info!(frames = self.seq, "capture device released");
        }
    }
}

/// Read `pipe` to the end, logging each line and keeping the last few.
async fn drain_stderr<R: AsyncRead + Unpin>(pipe: R) -> String {
    let mut lines = BufReader::new(pipe).lines();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(line, "ffmpeg capture");
        if tail.len() == STDERR_TAIL_LINES {
            tail.pop_front();
        }
        tail.push_back(line);
    }
    Vec::from(tail).join("\n")
}

#[cfg(target_os = "macos")]
fn device_input(device: u32) -> String {
    device.to_string()
}

#[cfg(not(target_os = "macos"))]
fn device_input(device: u32) -> String {
    format!("/dev/video{device}")
}

#[cfg(target_os = "macos")]
const INPUT_FORMAT: &str = "avfoundation";

#[cfg(not(target_os = "macos"))]
const INPUT_FORMAT: &str = "v4l2";

fn ffmpeg_args(config: &CameraConfig) -> Vec<String> {
    let mut filters = vec![format!("scale={}:{}", config.width, config.height)];
    if config.overlay_timestamp {
        filters.push(OVERLAY_FILTER.to_string());
    }

    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-f".into(),
        INPUT_FORMAT.into(),
        "-framerate".into(),
        config.fps.to_string(),
        "-video_size".into(),
        format!("{}x{}", config.width, config.height),
        "-i".into(),
        device_input(config.device),
    ];
    args.extend([
        "-vf".into(),
        filters.join(","),
        "-f".into(),
        "rawvideo".into(),
        "-pix_fmt".into(),
        "rgb24".into(),
        "pipe:1".into(),
    ]);
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn camera(overlay_timestamp: bool) -> CameraConfig {
        CameraConfig {
            device: 2,
            width: 320,
            height: 240,
            fps: 15.0,
            overlay_timestamp,
            ..CameraConfig::default()
        }
    }

    #[tokio::test]
    async fn stderr_drain_keeps_last_lines() {
        let text: String = (0..20).map(|i| format!("line {i}\n")).collect();
        let tail = drain_stderr(text.as_bytes()).await;
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), STDERR_TAIL_LINES);
        assert_eq!(lines[0], "line 12");
        assert_eq!(lines[STDERR_TAIL_LINES - 1], "line 19");
    }

    #[tokio::test]
    async fn stderr_drain_of_silent_process_is_empty() {
        assert_eq!(drain_stderr(&b""[..]).await, "");
    }

    #[test]
    fn args_scale_to_configured_size() {
        let args = ffmpeg_args(&camera(false));
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "scale=320:240");
        assert!(args.contains(&"320x240".to_string()));
        assert!(args.contains(&"15".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("pipe:1"));
        assert!(args.windows(2).any(|w| w[0] == "-pix_fmt" && w[1] == "rgb24"));
    }

    #[test]
    fn overlay_adds_drawtext() {
        let args = ffmpeg_args(&camera(true));
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert!(args[vf + 1].starts_with("scale=320:240,drawtext="));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn device_index_maps_to_video_node() {
        let args = ffmpeg_args(&camera(false));
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(args[input + 1], "/dev/video2");
        assert_eq!(args[input - 5], "v4l2");
    }
}
