//! Scripted model for exercising the pipeline without real inference
//!
//! Frames built with [`scripted_frame`] carry their index in their pixels, so a
//! `ScriptedModel` can decide per frame whether to answer, fail, panic or stall.

use crate::error::VisionError;
use crate::models::{ModelLoader, SegmentationModel};
use image::{GrayImage, Luma, Rgb, RgbImage};
use segmentfx_core::mask::FOREGROUND;
use segmentfx_core::{BoundingBox, MaskProposal};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Builds a uniform frame whose colour encodes `index`. Uniform frames keep
/// their colour through downsampling.
pub fn scripted_frame(index: usize, width: u32, height: u32) -> RgbImage {
    let encoded = [
        (index & 0xff) as u8,
        ((index >> 8) & 0xff) as u8,
        ((index >> 16) & 0xff) as u8,
    ];
    RgbImage::from_pixel(width, height, Rgb(encoded))
}

fn frame_index(image: &RgbImage) -> usize {
    if image.width() == 0 || image.height() == 0 {
        return 0;
    }
    let [a, b, c] = image.get_pixel(0, 0).0;
    a as usize | (b as usize) << 8 | (c as usize) << 16
}

#[derive(Debug, Clone, Default)]
pub struct Script {
    /// Areas of the proposals returned for every frame, in model order
    pub areas: Vec<f32>,
    pub areas_by_frame: HashMap<usize, Vec<f32>>,
    pub delay: Duration,
    pub delays: HashMap<usize, Duration>,
    pub failing_frames: HashSet<usize>,
    pub panicking_frames: HashSet<usize>,
    pub failing_workers: HashSet<usize>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_areas(mut self, areas: Vec<f32>) -> Self {
        self.areas = areas;
        self
    }

    pub fn with_frame_areas(mut self, frame: usize, areas: Vec<f32>) -> Self {
        self.areas_by_frame.insert(frame, areas);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_frame_delay(mut self, frame: usize, delay: Duration) -> Self {
        self.delays.insert(frame, delay);
        self
    }

    /// Stalls inference on `frame` for `duration`, simulating a stuck model call.
    pub fn hang_on(self, frame: usize, duration: Duration) -> Self {
        self.with_frame_delay(frame, duration)
    }

    pub fn fail_on(mut self, frame: usize) -> Self {
        self.failing_frames.insert(frame);
        self
    }

    pub fn panic_on(mut self, frame: usize) -> Self {
        self.panicking_frames.insert(frame);
        self
    }

    pub fn fail_load(mut self, worker: usize) -> Self {
        self.failing_workers.insert(worker);
        self
    }
}

pub struct ScriptedModel {
    script: Arc<Script>,
    calls: Arc<AtomicUsize>,
}

impl ScriptedModel {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn before_call(&self, image: &RgbImage) -> Result<usize, VisionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index = frame_index(image);

        let delay = self
            .script
            .delays
            .get(&index)
            .copied()
            .unwrap_or(self.script.delay);
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }

        if self.script.panicking_frames.contains(&index) {
            panic!("scripted panic on frame {}", index);
        }
        if self.script.failing_frames.contains(&index) {
            return Err(VisionError::Processing(format!(
                "scripted failure on frame {}",
                index
            )));
        }
        Ok(index)
    }

    /// Mask whose first `area` pixels (row-major) are foreground.
    fn block_proposal(width: u32, height: u32, area: f32) -> MaskProposal {
        let total = width as usize * height as usize;
        let filled = (area.max(0.0) as usize).min(total);
        let mut mask = GrayImage::new(width, height);
        for i in 0..filled {
            mask.put_pixel(i as u32 % width, i as u32 / width, Luma([FOREGROUND]));
        }
        let bbox = BoundingBox::from_mask(&mask).unwrap_or(BoundingBox::new(0, 0, 0, 0));
        MaskProposal {
            segmentation: mask,
            bbox,
            area,
            stability_score: 0.95,
        }
    }
}

impl SegmentationModel for ScriptedModel {
    fn generate(&mut self, image: &RgbImage) -> Result<Vec<MaskProposal>, VisionError> {
        let index = self.before_call(image)?;
        let areas = self
            .script
            .areas_by_frame
            .get(&index)
            .unwrap_or(&self.script.areas);
        Ok(areas
            .iter()
            .map(|&area| Self::block_proposal(image.width(), image.height(), area))
            .collect())
    }

    fn predict(
        &mut self,
        image: &RgbImage,
        prompt: &BoundingBox,
    ) -> Result<Vec<MaskProposal>, VisionError> {
        self.before_call(image)?;
        let mut mask = GrayImage::new(image.width(), image.height());
        for (x, y, pixel) in mask.enumerate_pixels_mut() {
            if prompt.contains(x, y) {
                *pixel = Luma([FOREGROUND]);
            }
        }
        let Some(bbox) = BoundingBox::from_mask(&mask) else {
            return Ok(Vec::new());
        };
        Ok(vec![MaskProposal {
            area: (bbox.width() * bbox.height()) as f32,
            segmentation: mask,
            bbox,
            stability_score: 0.9,
        }])
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Hands out `ScriptedModel`s that share one script and one call counter.
#[derive(Clone)]
pub struct ScriptedLoader {
    script: Arc<Script>,
    calls: Arc<AtomicUsize>,
    loads: Arc<AtomicUsize>,
}

impl ScriptedLoader {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(AtomicUsize::new(0)),
            loads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Total model invocations across every loaded instance.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Successful loads.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(&self, worker_id: usize) -> Result<Box<dyn SegmentationModel>, VisionError> {
        if self.script.failing_workers.contains(&worker_id) {
            return Err(VisionError::Model(format!(
                "scripted load failure for worker {}",
                worker_id
            )));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedModel {
            script: self.script.clone(),
            calls: self.calls.clone(),
        }))
    }
}
