// End-to-end runs of automatic segmentation

use image::{Luma, Rgb, RgbImage};
use segmentfx_core::{
    BoundingBox, FrameStatus, PipelineEvent, RecordingSink, RunMode, SegmentFxConfig,
};
use segmentfx_eye::models::{scripted_frame, RegionModelLoader, Script, ScriptedLoader};
use segmentfx_eye::{DecodedVideo, ImageSequenceIo, MemoryVideoIo};
use segmentfx_pipeline::output::{MaskRecord, METADATA_FILE};
use segmentfx_pipeline::AutoSegmenter;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn config(output: &Path, workers: usize, batch_size: usize) -> SegmentFxConfig {
    let mut config = SegmentFxConfig::default();
    config.pipeline.worker_count = workers;
    config.pipeline.batch_size = batch_size;
    config.pipeline.object_count = 1;
    config.pipeline.resize_factor = 1.0;
    config.timeouts.dequeue = Duration::from_millis(50);
    config.timeouts.result = Duration::from_secs(10);
    config.timeouts.join = Duration::from_secs(10);
    config.output.output_dir = output.to_path_buf();
    config
}

fn scripted_video(frames: usize, fps: f64) -> DecodedVideo {
    DecodedVideo::new(
        (0..frames).map(|i| scripted_frame(i, 8, 8)).collect(),
        fps,
    )
    .unwrap()
}

fn read_metadata(dir: &Path) -> Vec<MaskRecord> {
    let raw = std::fs::read_to_string(dir.join(METADATA_FILE)).unwrap();
    serde_json::from_str(&raw).unwrap()
}

#[test]
fn test_hundred_frames_four_workers() {
    let dir = TempDir::new().unwrap();
    let video = Arc::new(MemoryVideoIo::new(scripted_video(100, 25.0)));
    let events = Arc::new(RecordingSink::new());
    let loader = ScriptedLoader::new(Script::new().with_areas(vec![4.0, 2.0]));

    let report = AutoSegmenter::new(
        config(dir.path(), 4, 10),
        Arc::new(loader.clone()),
        video.clone(),
    )
    .with_events(events.clone())
    .run(Path::new("clip.gif"))
    .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.mode, RunMode::Auto);
    assert_eq!(report.expected_batches, 10);
    assert_eq!(report.collected_batches, 10);
    assert_eq!(report.failed_batches, 0);
    assert_eq!(report.frames_processed, 100);
    assert_eq!(loader.loads(), 4);
    assert_eq!(loader.calls(), 100);

    let records = read_metadata(dir.path());
    assert_eq!(records.len(), 100);
    let frames: Vec<usize> = records.iter().map(|r| r.frame).collect();
    assert_eq!(frames, (0..100).collect::<Vec<_>>());
    assert!(records.iter().all(|r| r.object_id == 0 && r.area == 4.0));
    assert!(dir.path().join("mask_frame0099_object00.png").exists());

    let encoded = video.encoded();
    assert_eq!(encoded.len(), 1);
    assert_eq!(encoded[0].frames.len(), 100);
    assert_eq!(encoded[0].fps, 25.0);
    assert_eq!(encoded[0].path, dir.path().join("combined_masks.gif"));

    assert_eq!(
        events.count(|e| matches!(e, PipelineEvent::WorkerReady { .. })),
        4
    );
    assert_eq!(
        events.count(|e| matches!(e, PipelineEvent::BatchCompleted { .. })),
        10
    );
    assert_eq!(
        events.count(|e| matches!(e, PipelineEvent::WorkerTerminated { forced: false, .. })),
        4
    );
    assert!(events.events().iter().any(|e| matches!(
        e,
        PipelineEvent::BatchCompleted {
            received: 10,
            expected: 10,
            ..
        }
    )));
    assert!(matches!(
        events.events().last(),
        Some(PipelineEvent::RunFinished {
            collected: 10,
            expected: 10,
            ..
        })
    ));
}

#[test]
fn test_order_restored_under_uneven_delays() {
    // deterministic spread of per-frame delays so later batches finish first
    let mut script = Script::new().with_areas(vec![1.0]);
    for frame in 0..24 {
        let delay = ((24 - frame) * 7 % 11) as u64 * 3;
        script = script.with_frame_delay(frame, Duration::from_millis(delay));
    }
    let dir = TempDir::new().unwrap();
    let segmenter = AutoSegmenter::new(
        config(dir.path(), 3, 3),
        Arc::new(ScriptedLoader::new(script)),
        Arc::new(MemoryVideoIo::sink()),
    );

    let frames = (0..24)
        .map(|i| segmentfx_core::Frame::new(i, scripted_frame(i, 8, 8)))
        .collect();
    let segmentation = segmenter.segment(frames).unwrap();
    let indices: Vec<usize> = segmentation.frames.iter().map(|f| f.frame_index).collect();
    assert_eq!(indices, (0..24).collect::<Vec<_>>());
    assert!(segmentation
        .frames
        .iter()
        .all(|f| f.status == FrameStatus::Ok));

    let batches: usize = segmentation.workers.iter().map(|w| w.batches_processed).sum();
    assert_eq!(batches, 8);
    assert!(segmentation.workers.iter().all(|w| w.sentinels_seen == 1));
}

#[test]
fn test_resize_round_trip_restores_original_resolution() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), 1, 2);
    config.pipeline.resize_factor = 0.5;
    let segmenter = AutoSegmenter::new(
        config,
        Arc::new(ScriptedLoader::new(Script::new().with_areas(vec![4.0]))),
        Arc::new(MemoryVideoIo::sink()),
    );

    let frames = vec![segmentfx_core::Frame::new(0, scripted_frame(0, 8, 8))];
    let segmentation = segmenter.segment(frames).unwrap();
    let mask = &segmentation.frames[0].masks[0];

    // four pixels at 4x4 fill the first row; at 8x8 that is the first two rows
    assert_eq!(mask.segmentation.dimensions(), (8, 8));
    assert_eq!(mask.area, 16.0);
    assert_eq!(mask.bbox, BoundingBox::new(0, 0, 6, 0));
    assert_eq!(mask.segmentation.get_pixel(7, 1).0[0], 255);
    assert_eq!(mask.segmentation.get_pixel(0, 2).0[0], 0);
}

/// 32x32 dark frames with a bright 8x8 square moving right by two pixels per frame.
fn write_square_frames(dir: &Path, count: u32) {
    for i in 0..count {
        let frame = RgbImage::from_fn(32, 32, |x, y| {
            let left = 2 + 2 * i;
            if (left..left + 8).contains(&x) && (10..18).contains(&y) {
                Rgb([250, 250, 250])
            } else {
                Rgb([10, 10, 10])
            }
        });
        frame.save(dir.join(format!("frame_{:03}.png", i))).unwrap();
    }
}

#[test]
fn test_region_model_on_image_sequence() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();
    write_square_frames(input.path(), 6);

    let config = config(output.path(), 2, 2);
    let report = AutoSegmenter::new(
        config.clone(),
        Arc::new(RegionModelLoader::new(config.model.clone())),
        Arc::new(ImageSequenceIo::new(12.0)),
    )
    .run(input.path())
    .unwrap();
    assert!(report.is_complete());
    assert_eq!(report.frames_processed, 6);

    let records = read_metadata(output.path());
    assert_eq!(records.len(), 6);
    for (i, record) in records.iter().enumerate() {
        let left = 2 + 2 * i as u32;
        assert_eq!(record.frame, i);
        assert_eq!(record.bbox, [left, 10, left + 7, 17]);
        assert_eq!(record.area, 64.0);
    }

    let mask = image::open(output.path().join("mask_frame0002_object00.png"))
        .unwrap()
        .to_luma8();
    assert_eq!(mask.get_pixel(6, 12), &Luma([255]));
    assert_eq!(mask.get_pixel(0, 0), &Luma([0]));
    assert!(output.path().join("combined_masks.gif").exists());
}

#[test]
fn test_max_frames_caps_the_run() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), 2, 4);
    config.pipeline.max_frames = Some(10);
    let report = AutoSegmenter::new(
        config,
        Arc::new(ScriptedLoader::new(Script::new().with_areas(vec![1.0]))),
        Arc::new(MemoryVideoIo::new(scripted_video(30, 30.0))),
    )
    .run(Path::new("clip.gif"))
    .unwrap();

    assert_eq!(report.frames_processed, 10);
    assert_eq!(report.expected_batches, 3);
    assert_eq!(read_metadata(dir.path()).len(), 10);
}

#[test]
fn test_slow_worker_behind_full_channel_completes() {
    let dir = TempDir::new().unwrap();
    let mut config = config(dir.path(), 1, 1);
    config.timeouts.enqueue = Duration::from_millis(10);
    config.timeouts.result = Duration::from_secs(5);
    let events = Arc::new(RecordingSink::new());
    let loader = ScriptedLoader::new(
        Script::new()
            .with_areas(vec![1.0])
            .with_delay(Duration::from_millis(100)),
    );

    let report = AutoSegmenter::new(
        config,
        Arc::new(loader),
        Arc::new(MemoryVideoIo::new(scripted_video(8, 25.0))),
    )
    .with_events(events.clone())
    .run(Path::new("clip.gif"))
    .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.collected_batches, 8);
    assert!(report.missing_batches.is_empty());
    assert_eq!(
        events.count(|e| matches!(e, PipelineEvent::ResultTimeout { .. })),
        0
    );
    // the worker got its sentinel and stopped on its own
    assert_eq!(
        events.count(|e| matches!(e, PipelineEvent::WorkerTerminated { forced: false, .. })),
        1
    );
}
