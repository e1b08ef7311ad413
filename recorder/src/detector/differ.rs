use motioncam_common::frame::Frame;
use tracing::trace;

/// Motion score between two frames.
///
/// Both frames are reduced to intensity, the per-pixel absolute differences
/// are summed, and the sum is divided by `(height / 2) * (width / 2)` with
/// truncating integer arithmetic. Identical frames score 0; a full
/// black/white swap of the whole frame scores roughly `4 * 255`.
pub fn score(a: &Frame, b: &Frame) -> Result<u64, InvalidFrameError> {
    let (width, height) = (a.width(), a.height());
    if (b.width(), b.height()) != (width, height) {
        return Err(InvalidFrameError::DimensionMismatch {
            left: (width, height),
            right: (b.width(), b.height()),
        });
    }

    let normalizer = u64::from(height / 2) * u64::from(width / 2);
    if normalizer == 0 {
        return Err(InvalidFrameError::Degenerate { width, height });
    }

    let sum: u64 = a
        .luma()
        .as_raw()
        .iter()
        .zip(b.luma().as_raw())
        .map(|(pa, pb)| u64::from(pa.abs_diff(*pb)))
        .sum();

    let score = sum / normalizer;
    trace!(sum, normalizer, score, a = a.seq, b = b.seq, "frame diff");
    Ok(score)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidFrameError {
    #[error("frame of {width}x{height} is too small to score")]
    Degenerate { width: u32, height: u32 },
    #[error("cannot diff a {}x{} frame against a {}x{} frame", left.0, left.1, right.0, right.1)]
    DimensionMismatch { left: (u32, u32), right: (u32, u32) },
}
