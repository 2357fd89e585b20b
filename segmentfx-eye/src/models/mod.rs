//! Segmentation model capability

pub mod region;
pub mod scripted;

use crate::error::VisionError;
use image::RgbImage;
use segmentfx_core::{BoundingBox, MaskProposal};

pub use region::{RegionModelLoader, RegionProposalModel};
pub use scripted::{scripted_frame, Script, ScriptedLoader, ScriptedModel};

/// A segmentation model instance. An instance is used by one thread at a time
/// and may be called any number of times.
pub trait SegmentationModel: Send {
    /// Automatic mode: propose every object the model can find.
    fn generate(&mut self, image: &RgbImage) -> Result<Vec<MaskProposal>, VisionError>;

    /// Prompted mode: segment the object inside `prompt`.
    fn predict(
        &mut self,
        image: &RgbImage,
        prompt: &BoundingBox,
    ) -> Result<Vec<MaskProposal>, VisionError>;

    fn name(&self) -> &str;
}

/// Creates model instances, one per `worker_id`. Auto mode calls it on each
/// worker's own thread; manual mode loads every instance up front on the
/// calling thread and lends them to the pool threads.
pub trait ModelLoader: Send + Sync {
    fn load(&self, worker_id: usize) -> Result<Box<dyn SegmentationModel>, VisionError>;
}
