//! Frame batching

use segmentfx_core::{Batch, Error, Frame, Result};

/// Groups `frames` into batches of `batch_size`, keeping frame order. The last
/// batch may be shorter. Batch ids count up from 0.
pub fn batch_frames(frames: Vec<Frame>, batch_size: usize) -> Result<Vec<Batch>> {
    if batch_size == 0 {
        return Err(Error::Config("batch_size must be > 0".to_string()));
    }

    let mut batches = Vec::with_capacity(frames.len().div_ceil(batch_size));
    let mut frames = frames.into_iter().peekable();
    while frames.peek().is_some() {
        let chunk: Vec<Frame> = frames.by_ref().take(batch_size).collect();
        batches.push(Batch::new(batches.len(), chunk));
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frames(n: usize) -> Vec<Frame> {
        (0..n).map(|i| Frame::new(i, RgbImage::new(2, 2))).collect()
    }

    #[test]
    fn test_last_batch_is_shorter() {
        let batches = batch_frames(frames(7), 3).unwrap();
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].frame_indices(), vec![0, 1, 2]);
        assert_eq!(batches[2].frame_indices(), vec![6]);
        assert_eq!(
            batches.iter().map(|b| b.id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
    }

    #[test]
    fn test_exact_multiple() {
        let batches = batch_frames(frames(100), 10).unwrap();
        assert_eq!(batches.len(), 10);
        assert!(batches.iter().all(|b| b.len() == 10));
    }

    #[test]
    fn test_empty_input() {
        assert!(batch_frames(Vec::new(), 4).unwrap().is_empty());
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(matches!(batch_frames(frames(3), 0), Err(Error::Config(_))));
    }
}
