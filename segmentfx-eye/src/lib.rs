//! segmentfx-eye: the pipeline's view of the outside world
//!
//! Segmentation models (the capability each worker owns), video decoding and
//! encoding, and the frame source that turns a decoded video into indexed frames.

pub mod error;
pub mod frame_source;
pub mod models;
pub mod video;

pub use error::VisionError;
pub use frame_source::{downsample, FrameSource};
pub use models::{ModelLoader, SegmentationModel};
pub use video::{DecodedVideo, EncodedVideo, ImageSequenceIo, MemoryVideoIo, VideoIo};
