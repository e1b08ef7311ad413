use motioncam_common::frame::SharedFrame;
use std::collections::VecDeque;

/// Fixed-size window of the most recent frames.
///
/// Always holds exactly `capacity` frames: it is built full from the startup
/// pre-roll and every [`push`](RingBuffer::push) evicts the oldest frame.
/// The oldest frame is the motion baseline; the whole window is the
/// pre-roll spliced into a new recording.
#[derive(Debug)]
pub struct RingBuffer {
    frames: VecDeque<SharedFrame>,
}

impl RingBuffer {
    /// Build a full ring from the startup frames, oldest first.
    pub fn prefilled(frames: Vec<SharedFrame>, capacity: usize) -> Result<Self, RingError> {
        if capacity == 0 {
            return Err(RingError::ZeroCapacity);
        }
        if frames.len() != capacity {
            return Err(RingError::WrongPrefill {
                capacity,
                got: frames.len(),
            });
        }
        Ok(Self {
            frames: VecDeque::from(frames),
        })
    }

    #[allow(dead_code)]
    pub fn capacity(&self) -> usize {
        self.frames.len()
    }

    pub fn oldest(&self) -> &SharedFrame {
        // Never empty: construction requires capacity >= 1 and push keeps the length.
        &self.frames[0]
    }

    #[allow(dead_code)]
    pub fn newest(&self) -> &SharedFrame {
        &self.frames[self.frames.len() - 1]
    }

    /// Insert `frame` at the tail and return the evicted oldest frame.
    pub fn push(&mut self, frame: SharedFrame) -> SharedFrame {
        self.frames.push_back(frame);
        // Length was capacity before the push, so there is always a front.
        self.frames
            .pop_front()
            .unwrap_or_else(|| unreachable!("ring buffer is never empty"))
    }

    /// Frames oldest-first.
    pub fn iter(&self) -> impl Iterator<Item = &SharedFrame> {
        self.frames.iter()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("ring buffer capacity must be at least 1")]
    ZeroCapacity,
    #[error("ring buffer of capacity {capacity} needs exactly {capacity} startup frames, got {got}")]
    WrongPrefill { capacity: usize, got: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use motioncam_common::frame::Frame;

    fn frame(seq: u64) -> SharedFrame {
        Frame::new(RgbImage::new(2, 2), seq as i64, seq).into_shared()
    }

    fn seqs(ring: &RingBuffer) -> Vec<u64> {
        ring.iter().map(|f| f.seq).collect()
    }

    #[test]
    fn prefill_must_match_capacity() {
        assert_eq!(
            RingBuffer::prefilled(vec![frame(0)], 2).unwrap_err(),
            RingError::WrongPrefill { capacity: 2, got: 1 }
        );
        assert_eq!(
            RingBuffer::prefilled(vec![], 0).unwrap_err(),
            RingError::ZeroCapacity
        );
    }

    #[test]
    fn push_evicts_oldest_and_keeps_size() {
        let mut ring = RingBuffer::prefilled(vec![frame(0), frame(1), frame(2)], 3).unwrap();
        assert_eq!(ring.oldest().seq, 0);
        assert_eq!(ring.newest().seq, 2);

        let evicted = ring.push(frame(3));
        assert_eq!(evicted.seq, 0);
        assert_eq!(ring.capacity(), 3);
        assert_eq!(seqs(&ring), vec![1, 2, 3]);

        for seq in 4..10 {
            ring.push(frame(seq));
            assert_eq!(ring.capacity(), 3);
        }
        assert_eq!(seqs(&ring), vec![7, 8, 9]);
        assert_eq!(ring.oldest().seq, 7);
    }

    #[test]
    fn single_slot_ring() {
        let mut ring = RingBuffer::prefilled(vec![frame(0)], 1).unwrap();
        assert_eq!(ring.push(frame(1)).seq, 0);
        assert_eq!(ring.oldest().seq, 1);
        assert_eq!(ring.newest().seq, 1);
    }

    #[test]
    fn frames_are_shared_not_copied() {
        let first = frame(0);
        let ring = RingBuffer::prefilled(vec![first.clone()], 1).unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, ring.oldest()));
    }
}
