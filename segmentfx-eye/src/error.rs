//! Error types for segmentfx-eye

use segmentfx_core::Error as CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VisionError {
    #[error("Model error: {0}")]
    Model(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Video error: {0}")]
    Video(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
}

impl From<VisionError> for CoreError {
    fn from(err: VisionError) -> Self {
        match err {
            VisionError::Model(msg) | VisionError::Processing(msg) => CoreError::Model(msg),
            VisionError::Video(msg) => CoreError::Video(msg),
            VisionError::Config(msg) => CoreError::Config(msg),
            VisionError::Io(e) => CoreError::Io(e),
            VisionError::Image(e) => CoreError::Image(e),
        }
    }
}
