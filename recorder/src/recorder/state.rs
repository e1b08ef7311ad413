use motioncam_common::config::MotionConfig;
use motioncam_common::frame::SharedFrame;
use tracing::{debug, info, trace};

use crate::detector::differ::{self, InvalidFrameError};
use crate::detector::ring::{RingBuffer, RingError};

/// Tuning knobs for the motion state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionSettings {
    pub max_frames: usize,
    pub threshold: u64,
    pub threshold_frames: u32,
    pub max_saved_frames: usize,
}

impl From<&MotionConfig> for MotionSettings {
    fn from(config: &MotionConfig) -> Self {
        Self {
            max_frames: config.max_frames,
            threshold: config.threshold,
            threshold_frames: config.threshold_frames.max(1),
            max_saved_frames: config.max_saved_frames,
        }
    }
}

/// Observable phase. Cooldown is "idle, but not yet allowed to re-trigger".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Recording,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEvent {
    Started,
    Stopped,
}

impl MotionEvent {
    /// Line written to the event log for this transition.
    pub fn message(self) -> &'static str {
        match self {
            MotionEvent::Started => "Started recording",
            MotionEvent::Stopped => "Stopped recording",
        }
    }
}

/// Result of folding one frame into the state machine.
#[derive(Debug, Default)]
pub struct Tick {
    pub score: u64,
    /// At most one transition happens per tick: a start always coincides with
    /// a moving frame, which resets the quiet run that a stop needs.
    pub event: Option<MotionEvent>,
    /// A full recording buffer that must go to the sink. The machine's own
    /// buffer is already empty when this is returned.
    pub flushed: Option<Vec<SharedFrame>>,
}

/// Motion detection and recording state machine.
///
/// Purely synchronous: every call to [`tick`](Self::tick) scores one frame
/// against the oldest buffered frame, applies the start/append/quiet/stop/
/// cooldown/flush rules in a fixed order, and rolls the ring buffer. All I/O
/// (sink, event log) is left to the caller via the returned [`Tick`].
pub struct MotionStateMachine {
    settings: MotionSettings,
    ring: RingBuffer,
    /// Frames of the current (or just stopped) recording, pre-roll first.
    recording: Vec<SharedFrame>,
    is_recording: bool,
    /// Consecutive moving frames seen while idle.
    threshold_frame_count: u32,
    /// Consecutive still frames seen while recording.
    quiet_frame_count: usize,
    /// Ticks since the last stop, capped at `max_frames`.
    cooldown_count: usize,
}

impl MotionStateMachine {
    /// `preroll` must hold exactly `settings.max_frames` frames, oldest first.
    pub fn new(settings: MotionSettings, preroll: Vec<SharedFrame>) -> Result<Self, RingError> {
        let ring = RingBuffer::prefilled(preroll, settings.max_frames)?;
        Ok(Self {
            settings: MotionSettings {
                threshold_frames: settings.threshold_frames.max(1),
                ..settings
            },
            ring,
            recording: Vec::new(),
            is_recording: false,
            threshold_frame_count: 0,
            quiet_frame_count: 0,
            cooldown_count: settings.max_frames,
        })
    }

    /// Score `frame` against the current baseline and advance one tick.
    ///
    /// A frame that cannot be scored leaves the machine untouched.
    pub fn tick(&mut self, frame: SharedFrame) -> Result<Tick, InvalidFrameError> {
        let score = differ::score(&frame, self.ring.oldest())?;
        Ok(self.advance(frame, score))
    }

    /// Advance one tick with an already computed motion score.
    pub fn advance(&mut self, frame: SharedFrame, score: u64) -> Tick {
        let max_frames = self.settings.max_frames;
        let moving = score >= self.settings.threshold;
        let mut event = None;

        // Count consecutive moving frames while idle.
        if !self.is_recording {
            if moving && self.threshold_frame_count < self.settings.threshold_frames {
                self.threshold_frame_count += 1;
            } else if !moving {
                self.threshold_frame_count = 0;
            }
        }

        // Start: splice the whole ring in as pre-roll.
        if !self.is_recording
            && self.cooldown_count >= max_frames
            && self.threshold_frame_count >= self.settings.threshold_frames
        {
            self.recording.extend(self.ring.iter().cloned());
            self.threshold_frame_count = 0;
            self.is_recording = true;
            event = Some(MotionEvent::Started);
            info!(
                score,
                seq = frame.seq,
                preroll = max_frames,
                "IDLE→RECORDING: motion sustained, recording started"
            );
        }

        // Once the quiet run is complete the frame is not kept.
        if self.is_recording && self.quiet_frame_count < max_frames {
            self.recording.push(frame.clone());
        }

        if self.is_recording {
            if moving {
                self.quiet_frame_count = 0;
            } else {
                self.quiet_frame_count += 1;
            }
        }

        // Stop after `max_frames` consecutive still frames. The buffer stays
        // in memory until the size cap or shutdown flushes it.
        if self.is_recording && self.quiet_frame_count >= max_frames {
            self.is_recording = false;
            self.cooldown_count = 0;
            event = Some(MotionEvent::Stopped);
            info!(
                seq = frame.seq,
                buffered = self.recording.len(),
                "RECORDING→COOLDOWN: scene quiet, recording stopped"
            );
        }

        if !self.is_recording && self.cooldown_count < max_frames {
            self.cooldown_count += 1;
        }

        let flushed = if self.recording.len() >= self.settings.max_saved_frames {
            debug!(
                frames = self.recording.len(),
                recording = self.is_recording,
                "recording buffer full, handing off to sink"
            );
            Some(std::mem::take(&mut self.recording))
        } else {
            None
        };

        trace!(
            seq = frame.seq,
            score,
            moving,
            phase = ?self.phase(),
            threshold_frame_count = self.threshold_frame_count,
            quiet_frame_count = self.quiet_frame_count,
            cooldown_count = self.cooldown_count,
            "tick"
        );

        self.ring.push(frame);

        Tick {
            score,
            event,
            flushed,
        }
    }

    /// Replace the ring with `frames` after the source changed frame size.
    ///
    /// An active recording is stopped and everything buffered is handed back
    /// for flushing, since old and new sized frames cannot share a recording.
    /// Counters return to their startup values.
    pub fn rebase(&mut self, frames: Vec<SharedFrame>) -> Result<Tick, RingError> {
        let ring = RingBuffer::prefilled(frames, self.settings.max_frames)?;
        let was_recording = self.is_recording;

        self.ring = ring;
        self.is_recording = false;
        self.threshold_frame_count = 0;
        self.quiet_frame_count = 0;
        self.cooldown_count = self.settings.max_frames;

        let flushed = self.drain();
        info!(
            recording = was_recording,
            flushed = flushed.as_ref().map_or(0, Vec::len),
            "frame size changed, baseline rebuilt"
        );
        Ok(Tick {
            score: 0,
            event: was_recording.then_some(MotionEvent::Stopped),
            flushed,
        })
    }

    /// Take whatever is buffered, for the final flush at shutdown.
    /// Returns `None` when there is nothing to save.
    pub fn drain(&mut self) -> Option<Vec<SharedFrame>> {
        if self.recording.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.recording))
        }
    }

    pub fn phase(&self) -> Phase {
        if self.is_recording {
            Phase::Recording
        } else if self.cooldown_count < self.settings.max_frames {
            Phase::Cooldown
        } else {
            Phase::Idle
        }
    }

    #[allow(dead_code)]
    pub fn is_recording(&self) -> bool {
        self.is_recording
    }

    #[allow(dead_code)]
    pub fn threshold_frame_count(&self) -> u32 {
        self.threshold_frame_count
    }

    #[allow(dead_code)]
    pub fn quiet_frame_count(&self) -> usize {
        self.quiet_frame_count
    }

    #[allow(dead_code)]
    pub fn cooldown_count(&self) -> usize {
        self.cooldown_count
    }

    #[allow(dead_code)]
    pub fn buffered(&self) -> &[SharedFrame] {
        &self.recording
    }

    #[allow(dead_code)]
    pub fn ring(&self) -> &RingBuffer {
        &self.ring
    }

    pub fn settings(&self) -> &MotionSettings {
        &self.settings
    }
}
