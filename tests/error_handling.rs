// Failure paths: failed and panicking batches, stalled workers, startup failures

use segmentfx_core::{
    Error, FrameStatus, PipelineEvent, RecordingSink, RunOutcome, SegmentFxConfig,
};
use segmentfx_eye::models::{scripted_frame, Script, ScriptedLoader};
use segmentfx_eye::{DecodedVideo, ImageSequenceIo, MemoryVideoIo};
use segmentfx_pipeline::output::{MaskRecord, METADATA_FILE};
use segmentfx_pipeline::AutoSegmenter;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn config(output: &Path, workers: usize, batch_size: usize) -> SegmentFxConfig {
    let mut config = SegmentFxConfig::default();
    config.pipeline.worker_count = workers;
    config.pipeline.batch_size = batch_size;
    config.pipeline.object_count = 1;
    config.pipeline.resize_factor = 1.0;
    config.timeouts.dequeue = Duration::from_millis(20);
    config.timeouts.result = Duration::from_secs(10);
    config.timeouts.join = Duration::from_secs(10);
    config.output.output_dir = output.to_path_buf();
    config
}

fn video(frames: usize) -> Arc<MemoryVideoIo> {
    Arc::new(MemoryVideoIo::new(
        DecodedVideo::new((0..frames).map(|i| scripted_frame(i, 6, 6)).collect(), 30.0).unwrap(),
    ))
}

fn run(
    config: SegmentFxConfig,
    script: Script,
    video: Arc<MemoryVideoIo>,
    events: Arc<RecordingSink>,
) -> segmentfx_core::Result<segmentfx_pipeline::RunReport> {
    AutoSegmenter::new(config, Arc::new(ScriptedLoader::new(script)), video)
        .with_events(events)
        .run(Path::new("clip.gif"))
}

#[test]
fn test_failed_batch_writes_empty_combined_frames() {
    let dir = TempDir::new().unwrap();
    let video = video(6);
    let events = Arc::new(RecordingSink::new());
    let script = Script::new().with_areas(vec![9.0]).fail_on(3);

    let report = run(config(dir.path(), 2, 2), script, video.clone(), events.clone()).unwrap();

    // a failed batch still reported back; the run is not partial
    assert!(report.is_complete());
    assert_eq!(report.failed_batches, 1);
    assert_eq!(report.frames_processed, 4);

    let raw = std::fs::read_to_string(dir.path().join(METADATA_FILE)).unwrap();
    let records: Vec<MaskRecord> = serde_json::from_str(&raw).unwrap();
    let frames: Vec<usize> = records.iter().map(|r| r.frame).collect();
    assert_eq!(frames, vec![0, 1, 4, 5]);

    let combined = &video.encoded()[0].frames;
    assert_eq!(combined.len(), 6);
    assert!(combined[2].pixels().all(|p| p.0[0] == 0));
    assert!(combined[3].pixels().all(|p| p.0[0] == 0));
    assert_eq!(combined[4].get_pixel(0, 0).0[0], 255);
    assert_eq!(
        events.count(|e| matches!(e, PipelineEvent::BatchCompleted { ok: false, .. })),
        1
    );
}

#[test]
fn test_panicking_model_fails_only_its_batch() {
    let dir = TempDir::new().unwrap();
    let segmenter = AutoSegmenter::new(
        config(dir.path(), 1, 1),
        Arc::new(ScriptedLoader::new(
            Script::new().with_areas(vec![1.0]).panic_on(1),
        )),
        Arc::new(MemoryVideoIo::sink()),
    );
    let frames = (0..4)
        .map(|i| segmentfx_core::Frame::new(i, scripted_frame(i, 6, 6)))
        .collect();

    let segmentation = segmenter.segment(frames).unwrap();
    let statuses: Vec<FrameStatus> = segmentation.frames.iter().map(|f| f.status).collect();
    assert_eq!(
        statuses,
        vec![
            FrameStatus::Ok,
            FrameStatus::Failed,
            FrameStatus::Ok,
            FrameStatus::Ok,
        ]
    );
    // the single worker survived the panic and kept taking batches
    assert_eq!(segmentation.workers[0].batches_processed, 3);
    assert_eq!(segmentation.workers[0].batches_failed, 1);
}

#[test]
fn test_stalled_worker_aborts_collection() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), 1, 1);
    config.timeouts.enqueue = Duration::from_millis(100);
    config.timeouts.result = Duration::from_millis(50);
    config.timeouts.max_consecutive_timeouts = 2;
    config.timeouts.join = Duration::from_millis(100);
    let events = Arc::new(RecordingSink::new());
    let script = Script::new()
        .with_areas(vec![1.0])
        .hang_on(0, Duration::from_millis(1500));

    let started = Instant::now();
    let report = run(config, script, video(3), events.clone()).unwrap();

    assert!(started.elapsed() < Duration::from_millis(1400));
    assert!(!report.is_complete());
    assert_eq!(report.collected_batches, 0);
    assert_eq!(report.missing_batches, vec![0, 1, 2]);
    assert_eq!(report.missing_frames, vec![0, 1, 2]);
    assert!(matches!(report.outcome, RunOutcome::Partial { .. }));
    assert_eq!(
        events.count(|e| matches!(e, PipelineEvent::ResultTimeout { .. })),
        3
    );
    assert_eq!(
        events.count(|e| matches!(e, PipelineEvent::RunAborted { collected: 0, expected: 3 })),
        1
    );
    assert_eq!(
        events.count(|e| matches!(e, PipelineEvent::WorkerTerminated { forced: true, .. })),
        1
    );
}

#[test]
fn test_partial_startup_keeps_running() {
    let dir = TempDir::new().unwrap();
    let events = Arc::new(RecordingSink::new());
    let script = Script::new().with_areas(vec![1.0]).fail_load(1);

    let report = run(config(dir.path(), 3, 2), script, video(8), events.clone()).unwrap();
    assert!(report.is_complete());
    assert_eq!(report.frames_processed, 8);
    assert_eq!(
        events.count(|e| matches!(e, PipelineEvent::WorkerStartupFailed { worker_id: 1, .. })),
        1
    );
    assert_eq!(
        events.count(|e| matches!(e, PipelineEvent::WorkerReady { .. })),
        2
    );
}

#[test]
fn test_no_worker_starts() {
    let dir = TempDir::new().unwrap();
    let script = Script::new().fail_load(0).fail_load(1);
    let result = run(
        config(dir.path(), 2, 2),
        script,
        video(4),
        Arc::new(RecordingSink::new()),
    );
    assert!(matches!(result, Err(Error::NoWorkers)));
    assert!(!dir.path().join(METADATA_FILE).exists());
}

#[test]
fn test_invalid_configuration_rejected_before_work() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), 2, 2);
    config.pipeline.resize_factor = 1.5;
    let loader = ScriptedLoader::new(Script::new());

    let result = AutoSegmenter::new(config, Arc::new(loader.clone()), video(4))
        .run(Path::new("clip.gif"));
    assert!(matches!(result, Err(Error::Config(_))));
    assert_eq!(loader.loads(), 0);
}

#[test]
fn test_unreadable_video() {
    let dir = TempDir::new().unwrap();
    let result = AutoSegmenter::new(
        config(dir.path(), 1, 1),
        Arc::new(ScriptedLoader::new(Script::new())),
        Arc::new(ImageSequenceIo::default()),
    )
    .run(&dir.path().join("missing.gif"));
    assert!(result.is_err());
}
