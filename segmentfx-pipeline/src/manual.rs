//! Manual mode: box-prompted tracking over sampled frames
//!
//! The prompt box comes from the user's mask and is computed once. Anchor
//! frames (`0, skip, 2 * skip, ...`) are batched onto a small rayon pool, every
//! batch result is tagged with its batch id, and the frames in between are
//! reconstructed by the [`Interpolator`] as anchors arrive.

use crate::batcher::batch_frames;
use crate::collector::{PipelineRun, ResultCollector, Tagged};
use crate::interpolator::{Interpolator, ReconstructedMask};
use crate::output::{OutputAssembler, OutputSummary};
use crate::report::RunReport;
use crate::worker::panic_message;
use crossbeam::channel::unbounded;
use crossbeam::queue::ArrayQueue;
use image::GrayImage;
use segmentfx_core::mask::{foreground_area, intersect, resize_binary};
use segmentfx_core::{
    Batch, BoundingBox, Error, EventSink, Frame, FrameResult, MaskProposal, PipelineEvent,
    Result, RunMode, SegmentFxConfig, TracingSink,
};
use segmentfx_eye::{FrameSource, ModelLoader, SegmentationModel, VideoIo, VisionError};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Model output for one anchor frame, already limited to the user mask.
#[derive(Debug, Clone)]
pub struct AnchorResult {
    pub frame_index: usize,
    pub mask: GrayImage,
    pub stability_score: f32,
}

#[derive(Debug, Clone)]
pub struct AnchorBatchResult {
    pub batch_id: usize,
    pub frame_indices: Vec<usize>,
    pub anchors: Vec<AnchorResult>,
    pub processing_time: Duration,
    pub error: Option<String>,
}

impl Tagged for AnchorBatchResult {
    fn batch_id(&self) -> usize {
        self.batch_id
    }

    fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    fn processing_time(&self) -> Duration {
        self.processing_time
    }
}

/// Extent of the user mask's foreground. An empty mask has no box.
pub fn prompt_box(user_mask: &GrayImage) -> Result<BoundingBox> {
    BoundingBox::from_mask(user_mask)
        .ok_or_else(|| Error::Config("user mask has no foreground pixels".to_string()))
}

/// Shared by every manual-mode task.
struct AnchorJob {
    prompt: BoundingBox,
    user_mask: GrayImage,
    models: ArrayQueue<Box<dyn SegmentationModel>>,
}

impl AnchorJob {
    fn segment_anchor(
        &self,
        model: &mut dyn SegmentationModel,
        frame: &Frame,
    ) -> std::result::Result<AnchorResult, VisionError> {
        let best = model
            .predict(&frame.pixels, &self.prompt)?
            .into_iter()
            .max_by(|a, b| {
                a.stability_score
                    .partial_cmp(&b.stability_score)
                    .unwrap_or(Ordering::Equal)
            });

        let (mask, stability_score) = match best {
            Some(p) => (
                intersect(
                    &resize_binary(&p.segmentation, frame.original_size),
                    &self.user_mask,
                ),
                p.stability_score,
            ),
            None => (GrayImage::new(frame.width(), frame.height()), 0.0),
        };
        Ok(AnchorResult {
            frame_index: frame.index,
            mask,
            stability_score,
        })
    }

    fn process(&self, batch: Batch) -> AnchorBatchResult {
        let started = Instant::now();
        let mut result = AnchorBatchResult {
            batch_id: batch.id,
            frame_indices: batch.frame_indices(),
            anchors: Vec::new(),
            processing_time: Duration::ZERO,
            error: None,
        };

        let Some(mut model) = self.models.pop() else {
            result.error = Some("no model instance available".to_string());
            return result;
        };
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            batch
                .frames
                .iter()
                .map(|frame| self.segment_anchor(model.as_mut(), frame))
                .collect::<std::result::Result<Vec<_>, _>>()
        }));
        if self.models.push(model).is_err() {
            warn!(batch = batch.id, "model pool full, instance dropped");
        }

        match outcome {
            Ok(Ok(anchors)) => {
                result.anchors = anchors;
                result.processing_time = started.elapsed();
            }
            Ok(Err(e)) => result.error = Some(e.to_string()),
            Err(payload) => {
                result.error = Some(format!("panic: {}", panic_message(payload.as_ref())))
            }
        }
        if let Some(reason) = &result.error {
            warn!(batch = batch.id, %reason, "anchor batch failed");
        }
        result
    }
}

/// Frame-ordered output of a manual run.
#[derive(Debug)]
pub struct Reconstruction {
    pub run: PipelineRun,
    pub frames: Vec<FrameResult>,
    /// Frames whose mask was blended from two anchors
    pub interpolated: Vec<usize>,
    pub missing_batches: Vec<usize>,
}

pub struct ManualSegmenter {
    config: SegmentFxConfig,
    loader: Arc<dyn ModelLoader>,
    video: Arc<dyn VideoIo>,
    events: Arc<dyn EventSink>,
}

impl ManualSegmenter {
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

    pub fn run(&self, video_path: &Path, mask_path: &Path) -> Result<RunReport> {
        let started = Instant::now();
        self.config.validate()?;

        let source = FrameSource::open(
            self.video.as_ref(),
            video_path,
            self.config.pipeline.max_frames,
        )?;
        let user_mask = image::open(mask_path)?.to_luma8();
        let reconstruction = self.segment(&source, &user_mask)?;

        self.write_output(&reconstruction, source.fps(), source.size())?;
        Ok(self.finish(&reconstruction, started))
    }

    pub fn write_output(
        &self,
        reconstruction: &Reconstruction,
        fps: f64,
        size: (u32, u32),
    ) -> Result<OutputSummary> {
        OutputAssembler::new(&self.config.output.output_dir, self.video.as_ref())
            .with_interpolated(reconstruction.interpolated.iter().copied())
            .write(&reconstruction.frames, fps, size)
    }

    pub fn finish(&self, reconstruction: &Reconstruction, started: Instant) -> RunReport {
        let report = RunReport::build(
            &reconstruction.run,
            RunMode::Manual,
            &reconstruction.frames,
            reconstruction.missing_batches.clone(),
            started.elapsed(),
        );
        self.events.emit(&PipelineEvent::RunFinished {
            run_id: report.run_id,
            outcome: report.outcome.clone(),
            collected: report.collected_batches,
            expected: report.expected_batches,
        });
        info!(
            frames = reconstruction.frames.len(),
            interpolated = reconstruction.interpolated.len(),
            total_secs = report.total_time_secs,
            "manual segmentation finished"
        );
        report
    }

    /// Loads up to `manual.threads` model instances. Failed loads shrink the pool.
    fn load_models(&self) -> Result<ArrayQueue<Box<dyn SegmentationModel>>> {
        let threads = self.config.manual.threads.max(1);
        let models = ArrayQueue::new(threads);
        for id in 0..threads {
            match self.loader.load(id) {
                Ok(model) => {
                    if models.push(model).is_err() {
                        break;
                    }
                    self.events.emit(&PipelineEvent::WorkerReady { worker_id: id });
                }
                Err(e) => self.events.emit(&PipelineEvent::WorkerStartupFailed {
                    worker_id: id,
                    reason: e.to_string(),
                }),
            }
        }
        if models.is_empty() {
            return Err(Error::NoWorkers);
        }
        Ok(models)
    }

    /// Segments the anchors of `source` and reconstructs every frame.
    pub fn segment(&self, source: &FrameSource, user_mask: &GrayImage) -> Result<Reconstruction> {
        if user_mask.dimensions() != source.size() {
            return Err(Error::Config(format!(
                "user mask is {:?}, video frames are {:?}",
                user_mask.dimensions(),
                source.size()
            )));
        }
        let prompt = prompt_box(user_mask)?;
        let manual = &self.config.manual;
        let skip = manual.skip_frames;

        let batches = batch_frames(source.anchors(skip), manual.batch_size)?;
        let batch_ids: Vec<usize> = batches.iter().map(|b| b.id).collect();
        let mut run = PipelineRun::new(batches.len());
        self.events.emit(&PipelineEvent::RunStarted {
            run_id: run.id,
            mode: RunMode::Manual,
            frames: source.len(),
            batches: batches.len(),
            workers: manual.threads,
        });

        let models = self.load_models()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(models.len())
            .thread_name(|i| format!("segmentfx-manual-{}", i))
            .build()
            .map_err(|e| Error::Config(format!("thread pool: {}", e)))?;
        info!(
            threads = models.len(),
            anchors = batches.iter().map(Batch::len).sum::<usize>(),
            skip,
            ?prompt,
            "manual segmentation started"
        );

        let job = Arc::new(AnchorJob {
            prompt,
            user_mask: user_mask.clone(),
            models,
        });
        let (tx, rx) = unbounded();
        for batch in batches {
            self.events.emit(&PipelineEvent::BatchDispatched {
                batch_id: batch.id,
                frames: batch.len(),
            });
            let (tx, job) = (tx.clone(), job.clone());
            pool.spawn(move || {
                let _ = tx.send(job.process(batch));
            });
        }
        drop(tx);

        let mut interpolator = Interpolator::new(source.len(), skip)?;
        let events = self.events.as_ref();
        let collection = ResultCollector::from_config(&self.config.timeouts).collect_with(
            &rx,
            &batch_ids,
            &mut run,
            events,
            |result: &AnchorBatchResult| {
                for anchor in &result.anchors {
                    match interpolator.insert_anchor(
                        anchor.frame_index,
                        anchor.mask.clone(),
                        anchor.stability_score,
                    ) {
                        Ok(gaps) => {
                            for gap in gaps.into_iter().filter(|g| g.frames > 0) {
                                events.emit(&PipelineEvent::FramesInterpolated {
                                    from_anchor: gap.from_anchor,
                                    to_anchor: gap.to_anchor,
                                    frames: gap.frames,
                                });
                            }
                        }
                        Err(e) => warn!(anchor = anchor.frame_index, error = %e, "anchor rejected"),
                    }
                }
            },
        );

        let failed_anchors: BTreeSet<usize> = collection
            .results
            .iter()
            .filter(|r| !r.is_ok())
            .flat_map(|r| r.frame_indices.iter().copied())
            .collect();

        let interpolation = interpolator.finish();
        if !interpolation.missing.is_empty() {
            warn!(
                frames = interpolation.missing.len(),
                "frames left without a reconstructed mask"
            );
        }

        let mut interpolated = Vec::new();
        let frames = interpolation
            .frames
            .into_iter()
            .enumerate()
            .map(|(index, reconstructed)| match reconstructed {
                Some(rec) => {
                    if rec.interpolated {
                        interpolated.push(index);
                    }
                    reconstructed_frame(index, rec)
                }
                None if failed_anchors.contains(&index) => FrameResult::failed(index),
                None => FrameResult::missing(index),
            })
            .collect();

        Ok(Reconstruction {
            run,
            frames,
            interpolated,
            missing_batches: collection.missing,
        })
    }
}

/// A reconstructed mask becomes object 0 of its frame; an empty mask means no object.
fn reconstructed_frame(index: usize, rec: ReconstructedMask) -> FrameResult {
    match BoundingBox::from_mask(&rec.mask) {
        Some(bbox) => FrameResult::ok(
            index,
            vec![MaskProposal {
                area: foreground_area(&rec.mask) as f32,
                segmentation: rec.mask,
                bbox,
                stability_score: rec.stability_score,
            }],
        ),
        None => FrameResult::ok(index, Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use segmentfx_core::{FrameStatus, RecordingSink};
    use segmentfx_eye::models::{scripted_frame, Script, ScriptedLoader};

    fn source(n: usize) -> FrameSource {
        FrameSource::from_images((0..n).map(|i| scripted_frame(i, 8, 6)).collect(), 30.0, None)
            .unwrap()
    }

    /// Foreground in the 3x2 block at (2, 1).
    fn user_mask() -> GrayImage {
        GrayImage::from_fn(8, 6, |x, y| {
            if (2..5).contains(&x) && (1..3).contains(&y) {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    fn segmenter(
        script: Script,
        skip: usize,
        batch_size: usize,
    ) -> (ManualSegmenter, Arc<RecordingSink>) {
        let mut config = SegmentFxConfig::default();
        config.manual.skip_frames = skip;
        config.manual.batch_size = batch_size;
        config.manual.threads = 2;
        config.timeouts.result = Duration::from_secs(5);
        let events = Arc::new(RecordingSink::new());
        let segmenter = ManualSegmenter::new(
            config,
            Arc::new(ScriptedLoader::new(script)),
            Arc::new(segmentfx_eye::MemoryVideoIo::sink()),
        )
        .with_events(events.clone());
        (segmenter, events)
    }

    #[test]
    fn test_prompt_box_from_user_mask() {
        assert_eq!(prompt_box(&user_mask()).unwrap(), BoundingBox::new(2, 1, 4, 2));
        assert!(matches!(
            prompt_box(&GrayImage::new(4, 4)),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_every_frame_reconstructed() {
        let (segmenter, events) = segmenter(Script::new(), 2, 2);
        let reconstruction = segmenter.segment(&source(7), &user_mask()).unwrap();

        assert_eq!(reconstruction.frames.len(), 7);
        assert!(reconstruction
            .frames
            .iter()
            .all(|f| f.status == FrameStatus::Ok && f.masks.len() == 1));
        assert_eq!(reconstruction.interpolated, vec![1, 3, 5]);
        assert!(reconstruction.missing_batches.is_empty());

        let mask = &reconstruction.frames[3].masks[0];
        assert_eq!(mask.bbox, BoundingBox::new(2, 1, 4, 2));
        assert_eq!(mask.area, 6.0);
        assert_eq!(
            events.count(|e| matches!(e, PipelineEvent::FramesInterpolated { .. })),
            3
        );

        let report = segmenter.finish(&reconstruction, Instant::now());
        assert!(report.is_complete());
        assert_eq!(report.expected_batches, 2);
    }

    #[test]
    fn test_prediction_limited_to_user_mask() {
        // the scripted model fills the whole prompt box; the user mask is
        // narrower inside it
        let mut mask = user_mask();
        mask.put_pixel(3, 1, Luma([0]));
        let (segmenter, _) = segmenter(Script::new(), 1, 4);
        let reconstruction = segmenter.segment(&source(2), &mask).unwrap();
        let object = &reconstruction.frames[0].masks[0];
        assert_eq!(object.area, 5.0);
        assert_eq!(object.segmentation.get_pixel(3, 1).0[0], 0);
    }

    #[test]
    fn test_failed_anchor_batch_is_reported() {
        let (segmenter, _) = segmenter(Script::new().fail_on(4), 2, 1);
        let reconstruction = segmenter.segment(&source(5), &user_mask()).unwrap();

        let statuses: Vec<FrameStatus> = reconstruction.frames.iter().map(|f| f.status).collect();
        assert_eq!(
            statuses,
            vec![
                FrameStatus::Ok,
                FrameStatus::Ok,
                FrameStatus::Ok,
                FrameStatus::Missing,
                FrameStatus::Failed,
            ]
        );
        let report = segmenter.finish(&reconstruction, Instant::now());
        assert_eq!(report.failed_batches, 1);
        assert_eq!(report.missing_frames, vec![3]);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_mask_size_must_match_frames() {
        let (segmenter, _) = segmenter(Script::new(), 2, 2);
        assert!(matches!(
            segmenter.segment(&source(3), &GrayImage::new(4, 4)),
            Err(Error::Config(_))
        ));
    }
}
