// segmentfx command line interface
// Runs automatic or box-prompted segmentation over a video and prints the run report

use anyhow::Context;
use clap::{Parser, Subcommand};
use segmentfx_core::SegmentFxConfig;
use segmentfx_eye::models::RegionModelLoader;
use segmentfx_eye::ImageSequenceIo;
use segmentfx_pipeline::{AutoSegmenter, ManualSegmenter, RunReport};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "segmentfx")]
#[command(about = "Parallel object segmentation for video", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON, TOML or YAML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace); RUST_LOG applies when unset
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output directory
    #[arg(long, short, global = true)]
    output: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Segment every frame with the worker pool
    Auto {
        /// Animated GIF, directory of frames, or a single image
        video: PathBuf,

        /// Masks kept per frame, largest first
        object_count: usize,

        /// Number of segmentation workers
        #[arg(long, short)]
        workers: Option<usize>,

        /// Frames per batch
        #[arg(long, short)]
        batch_size: Option<usize>,

        /// Downsample factor applied before inference, in (0, 1]
        #[arg(long, short)]
        resize_factor: Option<f32>,

        /// Read at most this many frames
        #[arg(long)]
        max_frames: Option<usize>,
    },

    /// Track the object outlined by a mask image, interpolating skipped frames
    Manual {
        /// Animated GIF, directory of frames, or a single image
        video: PathBuf,

        /// Mask image selecting the object; must match the frame size
        mask: PathBuf,

        /// Anchor frames per batch
        #[arg(long, short)]
        batch_size: Option<usize>,

        /// Run the model on every n-th frame
        #[arg(long, short)]
        skip_frames: Option<usize>,

        /// Model instances running in parallel
        #[arg(long, short)]
        threads: Option<usize>,
    },
}

impl Cli {
    /// Defaults, then the config file, then `SEGMENTFX_*` variables, then flags.
    fn load_config(&self) -> anyhow::Result<SegmentFxConfig> {
        let mut config = match &self.config {
            Some(path) => SegmentFxConfig::from_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
            None => SegmentFxConfig::default(),
        };
        config.apply_env();

        if let Some(output) = &self.output {
            config.output.output_dir = output.clone();
        }

        match &self.command {
            Commands::Auto {
                object_count,
                workers,
                batch_size,
                resize_factor,
                max_frames,
                ..
            } => {
                config.pipeline.object_count = *object_count;
                if let Some(workers) = workers {
                    config.pipeline.worker_count = *workers;
                }
                if let Some(batch_size) = batch_size {
                    config.pipeline.batch_size = *batch_size;
                }
                if let Some(resize_factor) = resize_factor {
                    config.pipeline.resize_factor = *resize_factor;
                }
                if max_frames.is_some() {
                    config.pipeline.max_frames = *max_frames;
                }
            }
            Commands::Manual {
                batch_size,
                skip_frames,
                threads,
                ..
            } => {
                if let Some(batch_size) = batch_size {
                    config.manual.batch_size = *batch_size;
                }
                if let Some(skip_frames) = skip_frames {
                    config.manual.skip_frames = *skip_frames;
                }
                if let Some(threads) = threads {
                    config.manual.threads = *threads;
                }
            }
        }

        config.validate().context("invalid configuration")?;
        Ok(config)
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    // stdout carries the report
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(cli: &Cli, config: SegmentFxConfig) -> anyhow::Result<RunReport> {
    let loader = Arc::new(RegionModelLoader::new(config.model.clone()));
    let video = Arc::new(ImageSequenceIo::new(config.output.default_fps));

    match &cli.command {
        Commands::Auto { video: path, .. } => {
            info!(
                video = %path.display(),
                workers = config.pipeline.worker_count,
                batch_size = config.pipeline.batch_size,
                "starting automatic segmentation"
            );
            AutoSegmenter::new(config, loader, video)
                .run(path)
                .with_context(|| format!("automatic segmentation of {} failed", path.display()))
        }
        Commands::Manual {
            video: path, mask, ..
        } => {
            info!(
                video = %path.display(),
                mask = %mask.display(),
                skip = config.manual.skip_frames,
                "starting manual segmentation"
            );
            ManualSegmenter::new(config, loader, video)
                .run(path, mask)
                .with_context(|| format!("manual segmentation of {} failed", path.display()))
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref());

    let config = cli.load_config()?;
    let report = run(&cli, config)?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if !report.is_complete() {
        warn!(
            missing_batches = report.missing_batches.len(),
            missing_frames = report.missing_frames.len(),
            "run finished with missing results"
        );
        std::process::exit(2);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "segmentfx",
            "--output",
            "out",
            "auto",
            "clip.gif",
            "3",
            "--workers",
            "2",
            "--batch-size",
            "8",
            "--resize-factor",
            "1.0",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.pipeline.object_count, 3);
        assert_eq!(config.pipeline.worker_count, 2);
        assert_eq!(config.pipeline.batch_size, 8);
        assert_eq!(config.pipeline.resize_factor, 1.0);
        assert_eq!(config.output.output_dir, PathBuf::from("out"));
    }

    #[test]
    fn test_manual_flags() {
        let cli = Cli::try_parse_from([
            "segmentfx",
            "manual",
            "frames",
            "mask.png",
            "--skip-frames",
            "4",
            "--threads",
            "1",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.manual.skip_frames, 4);
        assert_eq!(config.manual.threads, 1);
        assert_eq!(config.manual.batch_size, 32);
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let cli = Cli::try_parse_from(["segmentfx", "auto", "clip.gif", "0"]).unwrap();
        assert!(cli.load_config().is_err());
    }

    #[test]
    fn test_config_file_is_overridden_by_flags() {
        let dir = std::env::temp_dir().join(format!("segmentfx-cli-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.toml");
        std::fs::write(&path, "[pipeline]\nbatch_size = 4\nworker_count = 3\n").unwrap();

        let cli = Cli::try_parse_from([
            "segmentfx",
            "--config",
            path.to_str().unwrap(),
            "auto",
            "clip.gif",
            "2",
            "--batch-size",
            "6",
        ])
        .unwrap();
        let config = cli.load_config().unwrap();
        assert_eq!(config.pipeline.batch_size, 6);
        assert_eq!(config.pipeline.worker_count, 3);
        std::fs::remove_dir_all(&dir).ok();
    }
}
