// Run configuration for segmentfx

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Automatic-mode pipeline parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Maximum masks retained per frame
    pub object_count: usize,
    /// Frames per dispatched batch
    pub batch_size: usize,
    /// Number of segmentation workers
    pub worker_count: usize,
    /// Downsample factor applied before inference, in (0, 1]
    pub resize_factor: f32,
    /// Optional cap on the number of frames read from the source
    pub max_frames: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            object_count: 5,
            batch_size: 1,
            worker_count: default_worker_count(),
            resize_factor: 0.5,
            max_frames: None,
        }
    }
}

/// Leaves two cores for the coordinator and the rest of the system.
pub fn default_worker_count() -> usize {
    num_cpus::get().saturating_sub(2).max(1)
}

/// Manual (box-prompted) tracking parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualConfig {
    /// Sampling stride; frames between anchors are interpolated
    pub skip_frames: usize,
    /// Anchors per batch
    pub batch_size: usize,
    /// Size of the in-process inference pool
    pub threads: usize,
}

impl Default for ManualConfig {
    fn default() -> Self {
        Self {
            skip_frames: 2,
            batch_size: 32,
            threads: 4,
        }
    }
}

/// Bounded waits used by the channels and the lifecycle manager
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub enqueue: Duration,
    pub dequeue: Duration,
    pub result: Duration,
    pub max_consecutive_timeouts: u32,
    pub join: Duration,
    pub startup: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            enqueue: Duration::from_secs(60),
            dequeue: Duration::from_secs(60),
            result: Duration::from_secs(600),
            max_consecutive_timeouts: 5,
            join: Duration::from_secs(120),
            startup: Duration::from_secs(300),
        }
    }
}

impl TimeoutConfig {
    /// How long a full task channel may go without any worker taking a task
    /// before the coordinator stops pushing. Same window after which the
    /// collector aborts on consecutive result timeouts.
    pub fn stall_budget(&self) -> Duration {
        self.result
            .checked_mul(self.max_consecutive_timeouts.saturating_add(1))
            .unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
    /// Frame rate used when the source carries no timing information
    pub default_fps: f64,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("segmentation_output"),
            default_fps: 30.0,
        }
    }
}

/// Parameters of the built-in region proposal model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Components smaller than this many pixels are discarded
    pub min_region_area: u32,
    /// Luma offset used to measure proposal stability
    pub stability_offset: u8,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            min_region_area: 16,
            stability_offset: 16,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentFxConfig {
    pub pipeline: PipelineConfig,
    pub manual: ManualConfig,
    pub timeouts: TimeoutConfig,
    pub output: OutputConfig,
    pub model: ModelConfig,
}

impl SegmentFxConfig {
    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::IoError(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_str(&content)
    }

    /// Load configuration from string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        // Try JSON first
        if let Ok(config) = serde_json::from_str::<SegmentFxConfig>(content) {
            return Ok(config);
        }

        // Try TOML
        if let Ok(config) = toml::from_str::<SegmentFxConfig>(content) {
            return Ok(config);
        }

        // Try YAML
        if let Ok(config) = serde_yaml::from_str::<SegmentFxConfig>(content) {
            return Ok(config);
        }

        Err(ConfigError::ParseError("Unknown format".to_string()))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Overlay `SEGMENTFX_*` environment variables onto this configuration
    pub fn apply_env(&mut self) {
        if let Some(workers) = env_parse::<usize>("SEGMENTFX_WORKERS") {
            self.pipeline.worker_count = workers;
        }

        if let Some(batch_size) = env_parse::<usize>("SEGMENTFX_BATCH_SIZE") {
            self.pipeline.batch_size = batch_size;
        }

        if let Some(object_count) = env_parse::<usize>("SEGMENTFX_OBJECT_COUNT") {
            self.pipeline.object_count = object_count;
        }

        if let Some(resize_factor) = env_parse::<f32>("SEGMENTFX_RESIZE_FACTOR") {
            self.pipeline.resize_factor = resize_factor;
        }

        if let Some(skip_frames) = env_parse::<usize>("SEGMENTFX_SKIP_FRAMES") {
            self.manual.skip_frames = skip_frames;
        }

        if let Ok(output_dir) = std::env::var("SEGMENTFX_OUTPUT_DIR") {
            self.output.output_dir = PathBuf::from(output_dir);
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::ValidationError(msg.to_string()));

        if self.pipeline.object_count == 0 {
            return invalid("pipeline.object_count must be > 0");
        }

        if self.pipeline.batch_size == 0 {
            return invalid("pipeline.batch_size must be > 0");
        }

        if self.pipeline.worker_count == 0 {
            return invalid("pipeline.worker_count must be > 0");
        }

        let factor = self.pipeline.resize_factor;
        if !factor.is_finite() || factor <= 0.0 || factor > 1.0 {
            return invalid("pipeline.resize_factor must be in (0, 1]");
        }

        if self.manual.skip_frames == 0 {
            return invalid("manual.skip_frames must be > 0");
        }

        if self.manual.batch_size == 0 {
            return invalid("manual.batch_size must be > 0");
        }

        if self.manual.threads == 0 {
            return invalid("manual.threads must be > 0");
        }

        let t = &self.timeouts;
        if [t.enqueue, t.dequeue, t.result, t.join, t.startup]
            .iter()
            .any(Duration::is_zero)
        {
            return invalid("timeouts must be non-zero");
        }

        if t.max_consecutive_timeouts == 0 {
            return invalid("timeouts.max_consecutive_timeouts must be > 0");
        }

        if !self.output.default_fps.is_finite() || self.output.default_fps <= 0.0 {
            return invalid("output.default_fps must be > 0");
        }

        Ok(())
    }

    /// Capacity of the shared task channel: two in-flight batches per worker.
    pub fn task_capacity(&self) -> usize {
        self.pipeline.worker_count.saturating_mul(2).max(1)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[derive(Debug)]
pub enum ConfigError {
    IoError(String),
    ParseError(String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "IO error: {}", e),
            ConfigError::ParseError(e) => write!(f, "Parse error: {}", e),
            ConfigError::ValidationError(e) => write!(f, "Validation error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<ConfigError> for crate::error::Error {
    fn from(err: ConfigError) -> Self {
        crate::error::Error::Config(err.to_string())
    }
}
