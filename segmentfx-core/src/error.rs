use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Worker {worker} failed to start: {reason}")]
    WorkerStartup { worker: usize, reason: String },

    #[error("No worker started successfully")]
    NoWorkers,

    #[error("Batch {batch} failed: {reason}")]
    BatchProcessing { batch: usize, reason: String },

    #[error("Channel timeout: {0}")]
    ChannelTimeout(String),

    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    #[error("Invalid lifecycle transition from {from} to {to}")]
    InvalidState { from: String, to: String },

    #[error("Model error: {0}")]
    Model(String),

    #[error("Video error: {0}")]
    Video(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient errors are retried by the caller instead of failing the run.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::ChannelTimeout(_) | Error::BatchProcessing { .. })
    }
}
