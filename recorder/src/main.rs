mod detector;
mod event_log;
mod recorder;
mod source;
mod storage;

use motioncam_common::config::{CaptureMode, Config, OutputFormat};
use recorder::{MotionSettings, Recorder};
use source::CaptureSource;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config from {}: {e}", config_path.display());
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.level.parse().unwrap_or_default()),
        )
        .init();

    info!(
        mode = ?config.camera.mode,
        width = config.camera.width,
        height = config.camera.height,
        fps = config.camera.fps,
        max_frames = config.motion.max_frames,
        threshold = config.motion.threshold,
        threshold_frames = config.motion.threshold_frames,
        max_saved_frames = config.motion.max_saved_frames,
        output_dir = config.storage.output_dir.display().to_string(),
        format = ?config.storage.format,
        "starting motioncam recorder"
    );

    if config.camera.mode == CaptureMode::Device || config.storage.format == OutputFormat::Avi {
        recorder::encoder::check_ffmpeg_available().await;
    }

    let sink = match storage::DiskSink::new(&config.storage, config.camera.fps) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to prepare output directory");
            std::process::exit(1);
        }
    };

    let event_log = event_log::EventLog::open(&config.event_log.path).await;

    let source = match CaptureSource::open(&config.camera).await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open capture source");
            std::process::exit(1);
        }
    };

    let recorder = match Recorder::start(
        source,
        sink,
        event_log,
        MotionSettings::from(&config.motion),
        config.storage.on_insufficient_space,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            error!(error = %e, "failed to fill frame buffer");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for interrupt");
            // Keep the sender alive so the recorder is not stopped.
            std::future::pending::<()>().await;
        }
        info!("interrupt received, finishing up");
        let _ = shutdown_tx.send(true);
    });

    info!("entering main capture loop");
    match recorder.run(shutdown_rx).await {
        Ok(summary) => {
            info!(
                skipped = summary.skipped_frames,
                discarded = summary.frames_discarded,
                "exiting"
            );
        }
        Err(e) => {
            error!(error = %e, "recorder stopped with error");
            std::process::exit(1);
        }
    }
}
