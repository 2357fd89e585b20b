//! segmentfx-pipeline: concurrent segmentation of video frames
//!
//! Frames are grouped into batches, pushed through a bounded task channel to a
//! fixed pool of worker threads (each owning one segmentation model), and the
//! per-batch results are collected with a bounded wait, put back in frame order
//! and written out as mask images, JSON metadata and a combined mask video.
//!
//! Manual mode samples every `skip`-th frame with a fixed box prompt and
//! reconstructs the frames in between by interpolation.

pub mod auto;
pub mod batcher;
pub mod channel;
pub mod collector;
pub mod interpolator;
pub mod lifecycle;
pub mod manual;
pub mod output;
pub mod report;
pub mod worker;

pub use auto::{AutoSegmenter, Segmentation};
pub use batcher::batch_frames;
pub use channel::{EnqueueError, TaskChannel};
pub use collector::{Collection, PipelineRun, ResultCollector, Tagged};
pub use interpolator::{Gap, Interpolation, Interpolator, ReconstructedMask};
pub use lifecycle::{Dispatch, LifecycleManager, LifecycleState};
pub use manual::{prompt_box, AnchorBatchResult, AnchorResult, ManualSegmenter, Reconstruction};
pub use output::{MaskRecord, OutputAssembler, OutputSummary};
pub use report::RunReport;
pub use worker::{segment_frame, SegmentParams, WorkerPool, WorkerSettings, WorkerSummary};
