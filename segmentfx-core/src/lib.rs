//! segmentfx-core: shared building blocks for the segmentfx video pipeline
//!
//! Holds the typed records that flow between pipeline stages (frames, batches,
//! mask proposals, per-frame results), the error taxonomy, the run configuration
//! and the observability events exposed to front ends.

pub mod config;
pub mod error;
pub mod events;
pub mod mask;
pub mod types;

pub use config::{
    ConfigError, ManualConfig, ModelConfig, OutputConfig, PipelineConfig, SegmentFxConfig,
    TimeoutConfig,
};
pub use error::{Error, Result};
pub use events::{ChannelSink, EventSink, PipelineEvent, RecordingSink, TracingSink};
pub use types::{
    Batch, BatchResult, BoundingBox, Frame, FrameResult, FrameStatus, MaskProposal, RunMode,
    RunOutcome, Task, WorkerStatus,
};
