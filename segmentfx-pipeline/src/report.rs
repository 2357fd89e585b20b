//! Run statistics

use crate::collector::PipelineRun;
use chrono::{DateTime, Utc};
use segmentfx_core::{FrameResult, FrameStatus, RunMode, RunOutcome};
use serde::{Serialize, Serializer};
use std::time::Duration;
use uuid::Uuid;

/// Summary of one finished run, printed by the CLI as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub mode: RunMode,
    pub total_time_secs: f64,
    /// Sum of model time over successful batches
    pub segmentation_time_secs: f64,
    pub frames_processed: usize,
    pub frames_per_second: f64,
    pub expected_batches: usize,
    pub collected_batches: usize,
    pub failed_batches: usize,
    pub missing_batches: Vec<usize>,
    pub missing_frames: Vec<usize>,
    #[serde(serialize_with = "outcome_name")]
    pub outcome: RunOutcome,
}

/// The missing lists are already report fields; only the tag is repeated.
fn outcome_name<S: Serializer>(outcome: &RunOutcome, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(match outcome {
        RunOutcome::Complete => "complete",
        RunOutcome::Partial { .. } => "partial",
    })
}

impl RunReport {
    /// Builds the report from the run state and the frame-ordered results.
    /// Frames with status `Missing` make the run partial.
    pub fn build(
        run: &PipelineRun,
        mode: RunMode,
        frames: &[FrameResult],
        missing_batches: Vec<usize>,
        total_time: Duration,
    ) -> Self {
        let missing_frames: Vec<usize> = frames
            .iter()
            .filter(|f| f.status == FrameStatus::Missing)
            .map(|f| f.frame_index)
            .collect();
        let frames_processed = frames
            .iter()
            .filter(|f| f.status == FrameStatus::Ok)
            .count();

        let segmentation_time_secs = run.processing_time.as_secs_f64();
        let frames_per_second = if segmentation_time_secs > 0.0 {
            frames_processed as f64 / segmentation_time_secs
        } else {
            0.0
        };

        let outcome = if missing_batches.is_empty() && missing_frames.is_empty() {
            RunOutcome::Complete
        } else {
            RunOutcome::Partial {
                missing_batches: missing_batches.clone(),
                missing_frames: missing_frames.clone(),
            }
        };

        Self {
            run_id: run.id,
            started_at: run.started_at,
            mode,
            total_time_secs: total_time.as_secs_f64(),
            segmentation_time_secs,
            frames_processed,
            frames_per_second,
            expected_batches: run.expected,
            collected_batches: run.received,
            failed_batches: run.failed,
            missing_batches,
            missing_frames,
            outcome,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.outcome.is_complete()
    }
}
