pub mod encoder;
pub mod keys;
pub mod state;

use motioncam_common::config::LowSpacePolicy;
use motioncam_common::frame::SharedFrame;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::detector::differ::InvalidFrameError;
use crate::detector::ring::RingError;
use crate::event_log::EventLog;
use crate::source::{FrameSource, SourceError};
use crate::storage::{RecordingSink, SinkError};

pub use state::{MotionEvent, MotionSettings, MotionStateMachine, Tick};

/// Counters reported when the recorder stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub skipped_frames: u64,
    pub recordings_started: u64,
    pub flushes: u64,
    pub frames_saved: u64,
    pub frames_discarded: u64,
}

/// Owns the capture source, the sink and the motion state machine, and
/// drives them one frame at a time until shutdown.
pub struct Recorder<S, K> {
    source: S,
    sink: K,
    event_log: EventLog,
    machine: MotionStateMachine,
    low_space: LowSpacePolicy,
    /// Consecutive frames whose size differs from the ring's, all of one size.
    resized: Vec<SharedFrame>,
    summary: RunSummary,
}

impl<S: FrameSource, K: RecordingSink> Recorder<S, K> {
    /// Read `settings.max_frames` frames from `source` to fill the ring buffer.
    pub async fn start(
        mut source: S,
        sink: K,
        event_log: EventLog,
        settings: MotionSettings,
        low_space: LowSpacePolicy,
    ) -> Result<Self, RecorderError> {
        let preroll = match prefill(&mut source, settings.max_frames).await {
            Ok(frames) => frames,
            Err(e) => {
                source.release().await;
                return Err(e.into());
            }
        };
        let machine = MotionStateMachine::new(settings, preroll)?;
        info!(frames = settings.max_frames, "frame buffer filled, init complete");

        Ok(Self {
            source,
            sink,
            event_log,
            machine,
            low_space,
            resized: Vec::new(),
            summary: RunSummary::default(),
        })
    }

    /// Process frames until `shutdown` flips to `true` (or its sender goes
    /// away), then flush any buffered recording once and release the source.
    ///
    /// The source is released on every exit path, including fatal errors.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<RunSummary, RecorderError> {
        let result = self.run_until_shutdown(&mut shutdown).await;
        let result = match result {
            Ok(()) => self.final_flush().await,
            Err(e) => Err(e),
        };
        self.source.release().await;

        match result {
            Ok(()) => {
                info!(
                    ticks = self.summary.ticks,
                    recordings = self.summary.recordings_started,
                    flushes = self.summary.flushes,
                    frames_saved = self.summary.frames_saved,
                    "recorder stopped"
                );
                Ok(self.summary)
            }
            Err(e) => Err(e),
        }
    }

    async fn run_until_shutdown(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<(), RecorderError> {
        loop {
            if *shutdown.borrow() {
                info!("shutdown requested");
                return Ok(());
            }

            let frame = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!("shutdown channel closed");
                        return Ok(());
                    }
                    continue;
                }
                frame = self.source.next_frame() => frame?,
            };

            self.process(frame.into_shared()).await?;
        }
    }

    async fn process(&mut self, frame: SharedFrame) -> Result<(), RecorderError> {
        let seq = frame.seq;
        let tick = match self.machine.tick(frame.clone()) {
            Ok(tick) => tick,
            Err(InvalidFrameError::DimensionMismatch { left, right }) => {
                self.summary.skipped_frames += 1;
                warn!(seq, frame = ?left, baseline = ?right, "frame size differs from baseline, skipping");
                return self.collect_resized(frame).await;
            }
            Err(e) => {
                self.summary.skipped_frames += 1;
                warn!(error = %e, seq, "cannot score frame, skipping");
                return Ok(());
            }
        };
        self.resized.clear();
        self.summary.ticks += 1;
        debug!(seq, score = tick.score, "frame scored");
        self.apply(tick).await
    }

    /// Once `max_frames` consecutive frames share a new size, rebuild the
    /// baseline from them so scoring resumes at the new size.
    async fn collect_resized(&mut self, frame: SharedFrame) -> Result<(), RecorderError> {
        let size = (frame.width(), frame.height());
        if self
            .resized
            .first()
            .is_some_and(|f| (f.width(), f.height()) != size)
        {
            self.resized.clear();
        }
        self.resized.push(frame);
        if self.resized.len() < self.machine.settings().max_frames {
            return Ok(());
        }

        let frames = std::mem::take(&mut self.resized);
        let tick = self.machine.rebase(frames)?;
        self.apply(tick).await
    }

    async fn apply(&mut self, tick: Tick) -> Result<(), RecorderError> {
        if let Some(event) = tick.event {
            if event == MotionEvent::Started {
                self.summary.recordings_started += 1;
            }
            self.event_log.record(event.message()).await;
        }

        if let Some(frames) = tick.flushed {
            self.flush(frames).await?;
        }
        Ok(())
    }

    async fn final_flush(&mut self) -> Result<(), RecorderError> {
        match self.machine.drain() {
            Some(frames) => {
                info!(frames = frames.len(), "saving buffered frames before exit");
                self.flush(frames).await
            }
            None => Ok(()),
        }
    }

    /// Hand `frames` to the sink. The frames are gone from memory either way.
    async fn flush(&mut self, frames: Vec<SharedFrame>) -> Result<(), RecorderError> {
        let count = frames.len() as u64;
        match self.sink.flush(frames).await {
            Ok(saved) => {
                debug!(frames = saved.frames, path = ?saved.path, "flush complete");
                self.summary.flushes += 1;
                self.summary.frames_saved += saved.frames as u64;
                Ok(())
            }
            Err(SinkError::InsufficientStorage {
                available_gb,
                required_gb,
            }) => {
                self.summary.frames_discarded += count;
                match self.low_space {
                    LowSpacePolicy::Shutdown => {
                        error!(
                            available_gb,
                            required_gb,
                            frames = count,
                            "disk space below minimum, frames not saved; stopping"
                        );
                        Err(RecorderError::InsufficientStorage {
                            available_gb,
                            required_gb,
                        })
                    }
                    LowSpacePolicy::Discard => {
                        warn!(
                            available_gb,
                            required_gb,
                            frames = count,
                            "disk space below minimum, frames discarded"
                        );
                        Ok(())
                    }
                }
            }
            Err(e) => {
                self.summary.frames_discarded += count;
                error!(error = %e, frames = count, "failed to save recording, frames lost");
                Ok(())
            }
        }
    }
}

async fn prefill<S: FrameSource>(source: &mut S, count: usize) -> Result<Vec<SharedFrame>, SourceError> {
    let mut frames = Vec::with_capacity(count);
    for _ in 0..count {
        frames.push(source.next_frame().await?.into_shared());
    }
    Ok(frames)
}

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Ring(#[from] RingError),
    #[error("disk space {available_gb}GB below required {required_gb}GB, frames not saved")]
    InsufficientStorage { available_gb: u64, required_gb: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FramesSaved;
    use image::{Rgb, RgbImage};
    use motioncam_common::frame::Frame;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Plays back a fixed list of frames, then requests shutdown and waits.
    struct ScriptedSource {
        frames: VecDeque<Frame>,
        shutdown: Option<watch::Sender<bool>>,
        released: Arc<Mutex<bool>>,
    }

    impl FrameSource for ScriptedSource {
        async fn next_frame(&mut self) -> Result<Frame, SourceError> {
            if let Some(frame) = self.frames.pop_front() {
                return Ok(frame);
            }
            match self.shutdown.take() {
                Some(tx) => {
                    let _ = tx.send(true);
                    std::future::pending().await
                }
                None => Err(SourceError::Ended),
            }
        }

        async fn release(&mut self) {
            *self.released.lock().unwrap() = true;
        }
    }

    #[derive(Clone, Default)]
    struct MemorySink {
        flushes: Arc<Mutex<Vec<Vec<u64>>>>,
        full: bool,
    }

    impl RecordingSink for MemorySink {
        async fn flush(&mut self, frames: Vec<SharedFrame>) -> Result<FramesSaved, SinkError> {
            if self.full {
                return Err(SinkError::InsufficientStorage {
                    available_gb: 0,
                    required_gb: 1,
                });
            }
            let n = frames.len();
            self.flushes
                .lock()
                .unwrap()
                .push(frames.iter().map(|f| f.seq).collect());
            Ok(FramesSaved { frames: n, path: None })
        }
    }

    fn solid(seq: u64, value: u8) -> Frame {
        Frame::new(RgbImage::from_pixel(4, 4, Rgb([value; 3])), seq as i64, seq)
    }

    fn settings(max_frames: usize, max_saved_frames: usize) -> MotionSettings {
        MotionSettings {
            max_frames,
            threshold: 100,
            threshold_frames: 1,
            max_saved_frames,
        }
    }

    /// Two black pre-roll frames, then the given pixel levels.
    fn script(levels: &[u8]) -> VecDeque<Frame> {
        let mut frames: VecDeque<Frame> = (0..2).map(|seq| solid(seq, 0)).collect();
        for (i, &level) in levels.iter().enumerate() {
            frames.push_back(solid(10 + i as u64, level));
        }
        frames
    }

    async fn run_script(
        levels: &[u8],
        settings: MotionSettings,
        sink: MemorySink,
        low_space: LowSpacePolicy,
    ) -> (Result<RunSummary, RecorderError>, Arc<Mutex<bool>>) {
        let (tx, rx) = watch::channel(false);
        let released = Arc::new(Mutex::new(false));
        let source = ScriptedSource {
            frames: script(levels),
            shutdown: Some(tx),
            released: released.clone(),
        };
        let recorder = Recorder::start(source, sink, EventLog::disabled(), settings, low_space)
            .await
            .unwrap();
        (recorder.run(rx).await, released)
    }

    #[tokio::test]
    async fn quiet_scene_saves_nothing() {
        let sink = MemorySink::default();
        let (result, released) =
            run_script(&[0, 0, 0, 0, 0], settings(2, 100), sink.clone(), LowSpacePolicy::Shutdown).await;
        let summary = result.unwrap();
        assert_eq!(summary.ticks, 5);
        assert_eq!(summary.recordings_started, 0);
        assert!(sink.flushes.lock().unwrap().is_empty());
        assert!(*released.lock().unwrap());
    }

    #[tokio::test]
    async fn shutdown_flushes_partial_recording_once() {
        let sink = MemorySink::default();
        // Black baseline, then white frames: motion against the oldest frame.
        let (result, released) =
            run_script(&[255, 255, 0], settings(2, 100), sink.clone(), LowSpacePolicy::Shutdown).await;
        let summary = result.unwrap();
        assert_eq!(summary.recordings_started, 1);
        assert_eq!(summary.flushes, 1);

        let flushes = sink.flushes.lock().unwrap();
        assert_eq!(flushes.len(), 1);
        // Pre-roll (0, 1) followed by every frame since the start.
        assert_eq!(flushes[0], vec![0, 1, 10, 11, 12]);
        assert_eq!(summary.frames_saved, 5);
        assert!(*released.lock().unwrap());
    }

    #[tokio::test]
    async fn size_cap_flushes_mid_run() {
        let sink = MemorySink::default();
        let (result, _) =
            run_script(&[255, 255, 255, 255], settings(2, 4), sink.clone(), LowSpacePolicy::Shutdown).await;
        let summary = result.unwrap();

        let flushes = sink.flushes.lock().unwrap();
        assert_eq!(flushes[0], vec![0, 1, 10, 11]);
        // The remainder is saved at shutdown.
        assert_eq!(flushes[1], vec![12, 13]);
        assert_eq!(summary.flushes, 2);
    }

    #[tokio::test]
    async fn insufficient_storage_stops_by_default() {
        let sink = MemorySink {
            full: true,
            ..MemorySink::default()
        };
        let (result, released) =
            run_script(&[255, 255, 255, 255], settings(2, 4), sink, LowSpacePolicy::Shutdown).await;
        assert!(matches!(
            result,
            Err(RecorderError::InsufficientStorage { .. })
        ));
        assert!(*released.lock().unwrap());
    }

    #[tokio::test]
    async fn insufficient_storage_can_discard_and_continue() {
        let sink = MemorySink {
            full: true,
            ..MemorySink::default()
        };
        let (result, _) =
            run_script(&[255, 255, 255, 255], settings(2, 4), sink, LowSpacePolicy::Discard).await;
        let summary = result.unwrap();
        assert_eq!(summary.ticks, 4);
        assert_eq!(summary.frames_saved, 0);
        assert_eq!(summary.frames_discarded, 6);
    }

    #[tokio::test]
    async fn source_failure_is_fatal_and_releases() {
        let released = Arc::new(Mutex::new(false));
        let source = ScriptedSource {
            frames: script(&[0]),
            shutdown: None,
            released: released.clone(),
        };
        let (_tx, rx) = watch::channel(false);
        let recorder = Recorder::start(
            source,
            MemorySink::default(),
            EventLog::disabled(),
            settings(2, 10),
            LowSpacePolicy::Shutdown,
        )
        .await
        .unwrap();
        let result = recorder.run(rx).await;
        assert!(matches!(result, Err(RecorderError::Source(SourceError::Ended))));
        assert!(*released.lock().unwrap());
    }

    #[tokio::test]
    async fn prefill_failure_releases_source() {
        let released = Arc::new(Mutex::new(false));
        let source = ScriptedSource {
            frames: VecDeque::from(vec![solid(0, 0)]),
            shutdown: None,
            released: released.clone(),
        };
        let result = Recorder::start(
            source,
            MemorySink::default(),
            EventLog::disabled(),
            settings(3, 10),
            LowSpacePolicy::Shutdown,
        )
        .await;
        assert!(matches!(result, Err(RecorderError::Source(SourceError::Ended))));
        assert!(*released.lock().unwrap());
    }

    #[tokio::test]
    async fn mismatched_frame_is_skipped() {
        let sink = MemorySink::default();
        let (tx, rx) = watch::channel(false);
        let mut frames = script(&[0]);
        frames.push_back(Frame::new(RgbImage::new(8, 8), 0, 99));
        frames.push_back(solid(12, 0));
        let source = ScriptedSource {
            frames,
            shutdown: Some(tx),
            released: Arc::new(Mutex::new(false)),
        };
        let recorder = Recorder::start(source, sink, EventLog::disabled(), settings(2, 10), LowSpacePolicy::Shutdown)
            .await
            .unwrap();
        let summary = recorder.run(rx).await.unwrap();
        assert_eq!(summary.ticks, 2);
        assert_eq!(summary.skipped_frames, 1);
    }

    #[tokio::test]
    async fn frame_size_change_rebuilds_baseline() {
        let sink = MemorySink::default();
        let (tx, rx) = watch::channel(false);
        // 4x4 pre-roll, then the camera switches to 8x8 for good.
        let mut frames = script(&[]);
        for (i, level) in [0u8, 0, 255, 255, 255, 0, 0, 0].into_iter().enumerate() {
            let seq = 20 + i as u64;
            frames.push_back(Frame::new(RgbImage::from_pixel(8, 8, Rgb([level; 3])), seq as i64, seq));
        }
        let source = ScriptedSource {
            frames,
            shutdown: Some(tx),
            released: Arc::new(Mutex::new(false)),
        };
        let recorder = Recorder::start(source, sink.clone(), EventLog::disabled(), settings(2, 100), LowSpacePolicy::Shutdown)
            .await
            .unwrap();
        let summary = recorder.run(rx).await.unwrap();

        // The first two 8x8 frames become the new baseline.
        assert_eq!(summary.skipped_frames, 2);
        assert_eq!(summary.ticks, 6);
        assert_eq!(summary.recordings_started, 1);
        let flushes = sink.flushes.lock().unwrap();
        assert_eq!(flushes[0], vec![20, 21, 22, 23, 24, 25, 26, 27]);
    }

    #[tokio::test]
    async fn resize_during_recording_saves_old_frames_separately() {
        let sink = MemorySink::default();
        let (tx, rx) = watch::channel(false);
        let mut frames = script(&[255, 255]);
        for seq in 20..22u64 {
            frames.push_back(Frame::new(RgbImage::new(8, 8), seq as i64, seq));
        }
        let source = ScriptedSource {
            frames,
            shutdown: Some(tx),
            released: Arc::new(Mutex::new(false)),
        };
        let recorder = Recorder::start(source, sink.clone(), EventLog::disabled(), settings(2, 100), LowSpacePolicy::Shutdown)
            .await
            .unwrap();
        let summary = recorder.run(rx).await.unwrap();

        assert_eq!(summary.recordings_started, 1);
        assert_eq!(summary.flushes, 1);
        assert_eq!(sink.flushes.lock().unwrap()[0], vec![0, 1, 10, 11]);
    }

    #[tokio::test]
    async fn event_log_gets_one_line_per_transition() {
        let dir = std::env::temp_dir().join(format!("motioncam-driver-log-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("motion.log");

        let (tx, rx) = watch::channel(false);
        let source = ScriptedSource {
            // Start on the first white frame, stop after two still ticks.
            frames: script(&[255, 255, 0, 0, 0, 0]),
            shutdown: Some(tx),
            released: Arc::new(Mutex::new(false)),
        };
        let recorder = Recorder::start(
            source,
            MemorySink::default(),
            EventLog::open(&path).await,
            settings(2, 100),
            LowSpacePolicy::Shutdown,
        )
        .await
        .unwrap();
        let summary = recorder.run(rx).await.unwrap();
        assert_eq!(summary.recordings_started, 1);
        assert_eq!(summary.flushes, 1);

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2, "{content}");
        assert!(lines[0].starts_with('['));
        assert!(lines[0].ends_with("] Started recording"));
        assert!(lines[1].ends_with("] Stopped recording"));
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn already_signalled_shutdown_processes_nothing() {
        let (tx, rx) = watch::channel(false);
        let source = ScriptedSource {
            frames: script(&[255, 255]),
            shutdown: None,
            released: Arc::new(Mutex::new(false)),
        };
        let recorder = Recorder::start(
            source,
            MemorySink::default(),
            EventLog::disabled(),
            settings(2, 10),
            LowSpacePolicy::Shutdown,
        )
        .await
        .unwrap();
        tx.send(true).unwrap();
        let summary = recorder.run(rx).await.unwrap();
        assert_eq!(summary.ticks, 0);
    }
}
