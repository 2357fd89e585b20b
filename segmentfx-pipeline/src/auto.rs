//! Automatic mode: every frame goes through the worker pool

use crate::batcher::batch_frames;
use crate::collector::PipelineRun;
use crate::lifecycle::LifecycleManager;
use crate::output::{OutputAssembler, OutputSummary};
use crate::report::RunReport;
use crate::worker::WorkerSummary;
use segmentfx_core::{
    BatchResult, EventSink, Frame, FrameResult, PipelineEvent, Result, RunMode, SegmentFxConfig,
    TracingSink,
};
use segmentfx_eye::{FrameSource, ModelLoader, VideoIo};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

/// Frame-ordered results of one automatic run.
#[derive(Debug)]
pub struct Segmentation {
    pub run: PipelineRun,
    /// One entry per input frame, in frame order
    pub frames: Vec<FrameResult>,
    pub missing_batches: Vec<usize>,
    pub workers: Vec<WorkerSummary>,
}

pub struct AutoSegmenter {
    config: SegmentFxConfig,
    loader: Arc<dyn ModelLoader>,
    video: Arc<dyn VideoIo>,
    events: Arc<dyn EventSink>,
}

impl AutoSegmenter {
    pub fn new(
        config: SegmentFxConfig,
        loader: Arc<dyn ModelLoader>,
        video: Arc<dyn VideoIo>,
    ) -> Self {
        Self {
            config,
            loader,
            video,
            events: Arc::new(TracingSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &SegmentFxConfig {
        &self.config
    }

    /// Decodes `video_path`, segments every frame and writes the output
    /// directory.
    pub fn run(&self, video_path: &Path) -> Result<RunReport> {
        let started = Instant::now();
        self.config.validate()?;

        let source = FrameSource::open(
            self.video.as_ref(),
            video_path,
            self.config.pipeline.max_frames,
        )?;
        let (fps, size) = (source.fps(), source.size());
        let segmentation = self.segment(source.into_frames())?;

        self.write_output(&segmentation.frames, fps, size)?;
        Ok(self.finish(&segmentation, started))
    }

    pub fn write_output(
        &self,
        frames: &[FrameResult],
        fps: f64,
        size: (u32, u32),
    ) -> Result<OutputSummary> {
        OutputAssembler::new(&self.config.output.output_dir, self.video.as_ref())
            .write(frames, fps, size)
    }

    /// Builds the report and emits `RunFinished`.
    pub fn finish(&self, segmentation: &Segmentation, started: Instant) -> RunReport {
        let report = RunReport::build(
            &segmentation.run,
            RunMode::Auto,
            &segmentation.frames,
            segmentation.missing_batches.clone(),
            started.elapsed(),
        );
        self.events.emit(&PipelineEvent::RunFinished {
            run_id: report.run_id,
            outcome: report.outcome.clone(),
            collected: report.collected_batches,
            expected: report.expected_batches,
        });
        info!(
            frames = report.frames_processed,
            fps = report.frames_per_second,
            total_secs = report.total_time_secs,
            "automatic segmentation finished"
        );
        report
    }

    /// Runs the worker pool over `frames`. Returns one result per frame, in
    /// frame order, whatever order the batches completed in.
    pub fn segment(&self, frames: Vec<Frame>) -> Result<Segmentation> {
        let pipeline = &self.config.pipeline;
        let frame_count = frames.len();
        let batches = batch_frames(frames, pipeline.batch_size)?;
        let layout: BTreeMap<usize, Vec<usize>> =
            batches.iter().map(|b| (b.id, b.frame_indices())).collect();

        let mut run = PipelineRun::new(batches.len());
        self.events.emit(&PipelineEvent::RunStarted {
            run_id: run.id,
            mode: RunMode::Auto,
            frames: frame_count,
            batches: batches.len(),
            workers: pipeline.worker_count,
        });

        let mut lifecycle = LifecycleManager::new(&self.config, self.events.clone());
        lifecycle.start(self.loader.clone())?;
        let dispatch = lifecycle.dispatch(batches)?;
        lifecycle.drain()?;
        let collection = lifecycle.collect(&dispatch.dispatched, &mut run)?;
        let workers = lifecycle.stop()?;

        let mut missing_batches = collection.missing.clone();
        missing_batches.extend(&dispatch.undispatched);
        missing_batches.sort_unstable();

        let mut received: BTreeMap<usize, BatchResult> = collection
            .results
            .into_iter()
            .map(|r| (r.batch_id, r))
            .collect();
        let mut ordered = Vec::with_capacity(frame_count);
        for (batch_id, indices) in &layout {
            match received.remove(batch_id) {
                Some(result) => ordered.extend(result.frames),
                None => ordered.extend(indices.iter().map(|&i| FrameResult::missing(i))),
            }
        }

        Ok(Segmentation {
            run,
            frames: ordered,
            missing_batches,
            workers,
        })
    }
}
