//! Typed records passed between pipeline stages

use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;

/// A decoded video frame. Immutable once read.
#[derive(Debug, Clone)]
pub struct Frame {
    pub index: usize,
    pub pixels: RgbImage,
    pub original_size: (u32, u32),
}

impl Frame {
    pub fn new(index: usize, pixels: RgbImage) -> Self {
        let original_size = pixels.dimensions();
        Self {
            index,
            pixels,
            original_size,
        }
    }

    pub fn width(&self) -> u32 {
        self.original_size.0
    }

    pub fn height(&self) -> u32 {
        self.original_size.1
    }
}

/// A contiguous, id-tagged group of frames dispatched as one unit of work.
#[derive(Debug, Clone)]
pub struct Batch {
    pub id: usize,
    pub frames: Vec<Frame>,
}

impl Batch {
    pub fn new(id: usize, frames: Vec<Frame>) -> Self {
        Self { id, frames }
    }

    pub fn frame_indices(&self) -> Vec<usize> {
        self.frames.iter().map(|f| f.index).collect()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

/// Unit pulled from the task channel by a worker.
#[derive(Debug)]
pub enum Task {
    Batch(Batch),
    /// No more work for the worker that receives it.
    Sentinel,
}

impl Task {
    pub fn is_sentinel(&self) -> bool {
        matches!(self, Task::Sentinel)
    }
}

/// Inclusive pixel extent `(x1, y1) .. (x2, y2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl BoundingBox {
    pub fn new(x1: u32, y1: u32, x2: u32, y2: u32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Extent of all non-zero pixels, or `None` for an empty mask.
    pub fn from_mask(mask: &GrayImage) -> Option<Self> {
        let mut extent: Option<Self> = None;
        for (x, y, pixel) in mask.enumerate_pixels() {
            if pixel.0[0] == 0 {
                continue;
            }
            extent = Some(match extent {
                None => Self::new(x, y, x, y),
                Some(b) => Self::new(b.x1.min(x), b.y1.min(y), b.x2.max(x), b.y2.max(y)),
            });
        }
        extent
    }

    /// Maps coordinates from a downsampled image back to the original one.
    pub fn unscaled(&self, resize_factor: f32) -> Self {
        let f = |v: u32| (v as f32 / resize_factor) as u32;
        Self::new(f(self.x1), f(self.y1), f(self.x2), f(self.y2))
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x1 && x <= self.x2 && y >= self.y1 && y <= self.y2
    }

    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1) + 1
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1) + 1
    }

    pub fn to_array(&self) -> [u32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

/// One candidate object mask produced by a segmentation model.
#[derive(Debug, Clone)]
pub struct MaskProposal {
    /// Binary mask: 0 is background, 255 is the object.
    pub segmentation: GrayImage,
    pub bbox: BoundingBox,
    pub area: f32,
    pub stability_score: f32,
}

impl MaskProposal {
    /// Keeps the `k` largest proposals, largest first. Ties keep model order.
    pub fn top_by_area(mut proposals: Vec<MaskProposal>, k: usize) -> Vec<MaskProposal> {
        proposals.sort_by(|a, b| b.area.partial_cmp(&a.area).unwrap_or(Ordering::Equal));
        proposals.truncate(k);
        proposals
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameStatus {
    Ok,
    Failed,
    /// Never reported back (collector gave up, or the frame was not reconstructed).
    Missing,
}

/// Segmentation outcome for a single frame.
#[derive(Debug, Clone)]
pub struct FrameResult {
    pub frame_index: usize,
    pub masks: Vec<MaskProposal>,
    pub status: FrameStatus,
}

impl FrameResult {
    pub fn ok(frame_index: usize, masks: Vec<MaskProposal>) -> Self {
        Self {
            frame_index,
            masks,
            status: FrameStatus::Ok,
        }
    }

    pub fn failed(frame_index: usize) -> Self {
        Self {
            frame_index,
            masks: Vec::new(),
            status: FrameStatus::Failed,
        }
    }

    pub fn missing(frame_index: usize) -> Self {
        Self {
            frame_index,
            masks: Vec::new(),
            status: FrameStatus::Missing,
        }
    }
}

/// Message a worker pushes onto the result channel, one per batch.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_id: usize,
    pub worker_id: usize,
    pub frames: Vec<FrameResult>,
    pub processing_time: Duration,
    pub status: FrameStatus,
    pub error: Option<String>,
}

impl BatchResult {
    /// Failed batch: every frame is reported with no masks.
    pub fn failed(
        batch_id: usize,
        worker_id: usize,
        frame_indices: &[usize],
        error: impl Into<String>,
    ) -> Self {
        Self {
            batch_id,
            worker_id,
            frames: frame_indices.iter().map(|&i| FrameResult::failed(i)).collect(),
            processing_time: Duration::ZERO,
            status: FrameStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == FrameStatus::Ok
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerStatus {
    Starting,
    Ready,
    Processing,
    Terminating,
    Terminated,
    Dead,
}

impl WorkerStatus {
    pub fn is_alive(&self) -> bool {
        matches!(
            self,
            WorkerStatus::Starting
                | WorkerStatus::Ready
                | WorkerStatus::Processing
                | WorkerStatus::Terminating
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Auto,
    Manual,
}

/// How a finished run ended. A partial run names exactly what is missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Complete,
    Partial {
        missing_batches: Vec<usize>,
        missing_frames: Vec<usize>,
    },
}

impl RunOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, RunOutcome::Complete)
    }
}
