//! Frame-skip interpolation for manual mode
//!
//! Only every `skip`-th frame (an anchor) goes through the model. A frame
//! `i + j` between anchors `i` and `i + skip` gets the per-pixel blend
//! `(M_i * (skip - j) + M_{i+skip} * j) / skip`, using integer division. Anchors
//! may arrive in any order: a gap is filled as soon as both of its anchors are
//! known.

use image::GrayImage;
use segmentfx_core::{Error, Result};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Mask for one frame, either from the model or blended from two anchors.
#[derive(Debug, Clone)]
pub struct ReconstructedMask {
    pub mask: GrayImage,
    pub stability_score: f32,
    pub interpolated: bool,
}

/// A gap filled between two anchors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub from_anchor: usize,
    pub to_anchor: usize,
    /// Frames reconstructed inside the gap
    pub frames: usize,
}

/// Final state of an interpolator.
#[derive(Debug)]
pub struct Interpolation {
    /// One entry per frame index
    pub frames: Vec<Option<ReconstructedMask>>,
    /// Frame indices left without a mask
    pub missing: Vec<usize>,
}

#[derive(Debug)]
pub struct Interpolator {
    frame_count: usize,
    skip: usize,
    size: Option<(u32, u32)>,
    anchors: BTreeMap<usize, (GrayImage, f32)>,
    frames: Vec<Option<ReconstructedMask>>,
}

impl Interpolator {
    pub fn new(frame_count: usize, skip: usize) -> Result<Self> {
        if skip == 0 {
            return Err(Error::Config("skip_frames must be > 0".to_string()));
        }
        Ok(Self {
            frame_count,
            skip,
            size: None,
            anchors: BTreeMap::new(),
            frames: vec![None; frame_count],
        })
    }

    /// Anchor indices: `0, skip, 2 * skip, ...` below the frame count.
    pub fn anchor_indices(&self) -> Vec<usize> {
        (0..self.frame_count).step_by(self.skip).collect()
    }

    /// Records the model mask for anchor `index` and fills every gap that now
    /// has both of its anchors. Returns the gaps filled by this call.
    pub fn insert_anchor(
        &mut self,
        index: usize,
        mask: GrayImage,
        stability_score: f32,
    ) -> Result<Vec<Gap>> {
        if index >= self.frame_count || index % self.skip != 0 {
            return Err(Error::Model(format!(
                "frame {} is not an anchor (skip {}, {} frames)",
                index, self.skip, self.frame_count
            )));
        }
        match self.size {
            Some(size) if size != mask.dimensions() => {
                return Err(Error::Model(format!(
                    "anchor {} mask is {:?}, expected {:?}",
                    index,
                    mask.dimensions(),
                    size
                )));
            }
            _ => self.size = Some(mask.dimensions()),
        }
        if self.anchors.contains_key(&index) {
            warn!(anchor = index, "anchor already recorded, ignoring");
            return Ok(Vec::new());
        }

        self.frames[index] = Some(ReconstructedMask {
            mask: mask.clone(),
            stability_score,
            interpolated: false,
        });
        self.anchors.insert(index, (mask, stability_score));

        let mut filled = Vec::new();
        if index >= self.skip && self.anchors.contains_key(&(index - self.skip)) {
            filled.push(self.fill_gap(index - self.skip));
        }
        if self.anchors.contains_key(&(index + self.skip)) {
            filled.push(self.fill_gap(index));
        }
        Ok(filled)
    }

    /// Blends the frames strictly between anchor `from` and anchor `from + skip`.
    fn fill_gap(&mut self, from: usize) -> Gap {
        let to = from + self.skip;
        let (Some((a, score_a)), Some((b, score_b))) =
            (self.anchors.get(&from), self.anchors.get(&to))
        else {
            return Gap {
                from_anchor: from,
                to_anchor: to,
                frames: 0,
            };
        };

        let skip = self.skip as u32;
        let mut frames = 0;
        for j in 1..self.skip {
            let (wa, wb) = (skip - j as u32, j as u32);
            let mask = GrayImage::from_fn(a.width(), a.height(), |x, y| {
                let va = a.get_pixel(x, y).0[0] as u32;
                let vb = b.get_pixel(x, y).0[0] as u32;
                image::Luma([((va * wa + vb * wb) / skip) as u8])
            });
            let stability_score = (score_a * wa as f32 + score_b * wb as f32) / skip as f32;
            self.frames[from + j] = Some(ReconstructedMask {
                mask,
                stability_score,
                interpolated: true,
            });
            frames += 1;
        }

        debug!(from_anchor = from, to_anchor = to, frames, "gap filled");
        Gap {
            from_anchor: from,
            to_anchor: to,
            frames,
        }
    }

    /// Anchors still waiting for their forward neighbour.
    pub fn pending_gaps(&self) -> Vec<usize> {
        self.anchors
            .keys()
            .copied()
            .filter(|&i| {
                let next = i + self.skip;
                next < self.frame_count && !self.anchors.contains_key(&next)
            })
            .collect()
    }

    pub fn finish(self) -> Interpolation {
        let missing = self
            .frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.is_none())
            .map(|(i, _)| i)
            .collect();
        Interpolation {
            frames: self.frames,
            missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn uniform(value: u8) -> GrayImage {
        GrayImage::from_pixel(3, 2, Luma([value]))
    }

    fn value(result: &Interpolation, index: usize) -> u8 {
        result.frames[index].as_ref().unwrap().mask.get_pixel(1, 1).0[0]
    }

    #[test]
    fn test_skip_two_midpoint() {
        let mut interp = Interpolator::new(3, 2).unwrap();
        assert!(interp.insert_anchor(0, uniform(0), 1.0).unwrap().is_empty());
        let gaps = interp.insert_anchor(2, uniform(255), 0.5).unwrap();
        assert_eq!(
            gaps,
            vec![Gap {
                from_anchor: 0,
                to_anchor: 2,
                frames: 1
            }]
        );

        let result = interp.finish();
        assert!(result.missing.is_empty());
        assert_eq!(value(&result, 1), 127);
        let mid = result.frames[1].as_ref().unwrap();
        assert!(mid.interpolated);
        assert!((mid.stability_score - 0.75).abs() < 1e-6);
        assert!(!result.frames[0].as_ref().unwrap().interpolated);
    }

    #[test]
    fn test_skip_four_weights() {
        let mut interp = Interpolator::new(5, 4).unwrap();
        interp.insert_anchor(0, uniform(0), 1.0).unwrap();
        interp.insert_anchor(4, uniform(200), 1.0).unwrap();
        let result = interp.finish();
        let values: Vec<u8> = (0..5).map(|i| value(&result, i)).collect();
        assert_eq!(values, vec![0, 50, 100, 150, 200]);
    }

    #[test]
    fn test_out_of_order_anchors() {
        let mut interp = Interpolator::new(7, 2).unwrap();
        interp.insert_anchor(4, uniform(255), 1.0).unwrap();
        interp.insert_anchor(0, uniform(255), 1.0).unwrap();
        assert_eq!(interp.pending_gaps(), vec![0, 4]);

        // anchor 2 closes both neighbouring gaps at once
        let gaps = interp.insert_anchor(2, uniform(0), 1.0).unwrap();
        assert_eq!(gaps.len(), 2);
        assert_eq!(interp.pending_gaps(), vec![4]);

        interp.insert_anchor(6, uniform(255), 1.0).unwrap();
        assert!(interp.pending_gaps().is_empty());

        let result = interp.finish();
        assert!(result.missing.is_empty());
        assert_eq!(value(&result, 1), 127);
        assert_eq!(value(&result, 3), 127);
        assert_eq!(value(&result, 5), 255);
    }

    #[test]
    fn test_trailing_frames_reported_missing() {
        let mut interp = Interpolator::new(6, 2).unwrap();
        for index in interp.anchor_indices() {
            interp.insert_anchor(index, uniform(9), 1.0).unwrap();
        }
        let result = interp.finish();
        assert_eq!(result.missing, vec![5]);
    }

    #[test]
    fn test_missing_anchor_leaves_gap() {
        let mut interp = Interpolator::new(5, 2).unwrap();
        interp.insert_anchor(0, uniform(1), 1.0).unwrap();
        interp.insert_anchor(4, uniform(1), 1.0).unwrap();
        let result = interp.finish();
        assert_eq!(result.missing, vec![1, 2, 3]);
    }

    #[test]
    fn test_rejects_non_anchor_and_size_mismatch() {
        let mut interp = Interpolator::new(5, 2).unwrap();
        assert!(interp.insert_anchor(1, uniform(0), 1.0).is_err());
        assert!(interp.insert_anchor(6, uniform(0), 1.0).is_err());
        interp.insert_anchor(0, uniform(0), 1.0).unwrap();
        assert!(interp
            .insert_anchor(2, GrayImage::new(5, 5), 1.0)
            .is_err());
        assert!(Interpolator::new(5, 0).is_err());
    }

    #[test]
    fn test_skip_one_has_no_gaps() {
        let mut interp = Interpolator::new(2, 1).unwrap();
        interp.insert_anchor(0, uniform(3), 1.0).unwrap();
        let gaps = interp.insert_anchor(1, uniform(4), 1.0).unwrap();
        assert_eq!(gaps[0].frames, 0);
        assert!(interp.finish().missing.is_empty());
    }
}
