//! Built-in region proposal model
//!
//! Splits the image into bright connected regions. Cheap and deterministic, it
//! stands in for a learned mask generator when none is configured.

use crate::error::VisionError;
use crate::models::{ModelLoader, SegmentationModel};
use image::imageops;
use image::{GrayImage, Luma, RgbImage};
use segmentfx_core::config::ModelConfig;
use segmentfx_core::mask::FOREGROUND;
use segmentfx_core::{BoundingBox, MaskProposal};
use std::collections::VecDeque;
use tracing::debug;

pub struct RegionProposalModel {
    min_region_area: u32,
    stability_offset: u8,
}

impl RegionProposalModel {
    pub fn new(config: &ModelConfig) -> Self {
        Self {
            min_region_area: config.min_region_area,
            stability_offset: config.stability_offset,
        }
    }

    /// Labels 4-connected foreground components. Returns one pixel list per component.
    fn components(foreground: &[bool], width: u32, height: u32) -> Vec<Vec<(u32, u32)>> {
        let (w, h) = (width as usize, height as usize);
        let mut visited = vec![false; foreground.len()];
        let mut components = Vec::new();

        for start in 0..foreground.len() {
            if !foreground[start] || visited[start] {
                continue;
            }
            visited[start] = true;
            let mut pixels = Vec::new();
            let mut queue = VecDeque::from([start]);

            while let Some(idx) = queue.pop_front() {
                let (x, y) = (idx % w, idx / w);
                pixels.push((x as u32, y as u32));

                let mut neighbours = Vec::with_capacity(4);
                if x > 0 {
                    neighbours.push(idx - 1);
                }
                if x + 1 < w {
                    neighbours.push(idx + 1);
                }
                if y > 0 {
                    neighbours.push(idx - w);
                }
                if y + 1 < h {
                    neighbours.push(idx + w);
                }
                for n in neighbours {
                    if foreground[n] && !visited[n] {
                        visited[n] = true;
                        queue.push_back(n);
                    }
                }
            }
            components.push(pixels);
        }
        components
    }

    /// Builds a proposal from component pixels. Stability is the share of pixels
    /// still above the threshold once it is raised by `stability_offset`.
    fn proposal(
        &self,
        gray: &GrayImage,
        pixels: &[(u32, u32)],
        threshold: u8,
    ) -> Option<MaskProposal> {
        let mut mask = GrayImage::new(gray.width(), gray.height());
        for &(x, y) in pixels {
            mask.put_pixel(x, y, Luma([FOREGROUND]));
        }
        let bbox = BoundingBox::from_mask(&mask)?;

        let raised = threshold as u16 + self.stability_offset as u16;
        let stable = pixels
            .iter()
            .filter(|&&(x, y)| gray.get_pixel(x, y).0[0] as u16 > raised)
            .count();

        Some(MaskProposal {
            segmentation: mask,
            bbox,
            area: pixels.len() as f32,
            stability_score: stable as f32 / pixels.len() as f32,
        })
    }
}

fn mean_luma<'a>(values: impl Iterator<Item = &'a u8>) -> Option<u8> {
    let (sum, count) = values.fold((0u64, 0u64), |(s, c), &v| (s + v as u64, c + 1));
    (count > 0).then(|| (sum / count) as u8)
}

impl SegmentationModel for RegionProposalModel {
    fn generate(&mut self, image: &RgbImage) -> Result<Vec<MaskProposal>, VisionError> {
        let gray = imageops::grayscale(image);
        let Some(threshold) = mean_luma(gray.as_raw().iter()) else {
            return Ok(Vec::new());
        };

        let foreground: Vec<bool> = gray.as_raw().iter().map(|&v| v > threshold).collect();
        let proposals: Vec<MaskProposal> =
            Self::components(&foreground, gray.width(), gray.height())
                .iter()
                .filter(|pixels| pixels.len() as u32 >= self.min_region_area)
                .filter_map(|pixels| self.proposal(&gray, pixels, threshold))
                .collect();

        debug!(threshold, proposals = proposals.len(), "region proposals generated");
        Ok(proposals)
    }

    fn predict(
        &mut self,
        image: &RgbImage,
        prompt: &BoundingBox,
    ) -> Result<Vec<MaskProposal>, VisionError> {
        let gray = imageops::grayscale(image);
        let (width, height) = gray.dimensions();
        if width == 0 || height == 0 || prompt.x1 >= width || prompt.y1 >= height {
            return Ok(Vec::new());
        }

        let inside = |x: u32, y: u32| prompt.contains(x, y);
        let threshold = mean_luma(
            gray.enumerate_pixels()
                .filter(|(x, y, _)| inside(*x, *y))
                .map(|(_, _, p)| &p.0[0]),
        )
        .unwrap_or(u8::MAX);

        let pixels: Vec<(u32, u32)> = gray
            .enumerate_pixels()
            .filter(|(x, y, p)| inside(*x, *y) && p.0[0] > threshold)
            .map(|(x, y, _)| (x, y))
            .collect();
        if pixels.is_empty() {
            return Ok(Vec::new());
        }

        Ok(self.proposal(&gray, &pixels, threshold).into_iter().collect())
    }

    fn name(&self) -> &str {
        "region-proposal"
    }
}

/// Loads `RegionProposalModel` instances after validating their parameters.
#[derive(Debug, Clone)]
pub struct RegionModelLoader {
    config: ModelConfig,
}

impl RegionModelLoader {
    pub fn new(config: ModelConfig) -> Self {
        Self { config }
    }
}

impl ModelLoader for RegionModelLoader {
    fn load(&self, worker_id: usize) -> Result<Box<dyn SegmentationModel>, VisionError> {
        if self.config.stability_offset == 0 {
            return Err(VisionError::Model(
                "stability_offset must be > 0".to_string(),
            ));
        }
        debug!(worker = worker_id, "region proposal model loaded");
        Ok(Box::new(RegionProposalModel::new(&self.config)))
    }
}
