//! Output assembly: per-object mask images, JSON metadata and the combined
//! mask video. Runs on the coordinator after collection, so nothing else
//! writes to the output directory concurrently.

use segmentfx_core::mask::combine_max;
use segmentfx_core::{FrameResult, FrameStatus, Result};
use segmentfx_eye::VideoIo;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const METADATA_FILE: &str = "mask_metadata.json";
pub const COMBINED_STEM: &str = "combined_masks";

/// One entry of `mask_metadata.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaskRecord {
    pub frame: usize,
    pub object_id: usize,
    pub filename: String,
    /// `[x1, y1, x2, y2]`, inclusive
    pub bbox: [u32; 4],
    pub area: f32,
    pub stability_score: f32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub interpolated: bool,
}

pub fn mask_filename(frame: usize, object: usize) -> String {
    format!("mask_frame{:04}_object{:02}.png", frame, object)
}

#[derive(Debug, Clone)]
pub struct OutputSummary {
    pub mask_files: usize,
    pub metadata_records: usize,
    pub video_frames: usize,
    pub metadata_path: PathBuf,
    pub video_path: Option<PathBuf>,
}

pub struct OutputAssembler<'a> {
    output_dir: PathBuf,
    video: &'a dyn VideoIo,
    interpolated: BTreeSet<usize>,
}

impl<'a> OutputAssembler<'a> {
    pub fn new(output_dir: impl AsRef<Path>, video: &'a dyn VideoIo) -> Self {
        Self {
            output_dir: output_dir.as_ref().to_path_buf(),
            video,
            interpolated: BTreeSet::new(),
        }
    }

    /// Frames whose masks were reconstructed by interpolation; their records
    /// carry `"interpolated": true`.
    pub fn with_interpolated(mut self, frames: impl IntoIterator<Item = usize>) -> Self {
        self.interpolated.extend(frames);
        self
    }

    /// Writes everything for `frames`, which must be in frame order. Failed and
    /// missing frames get no mask files and an all-zero combined frame.
    pub fn write(
        &self,
        frames: &[FrameResult],
        fps: f64,
        size: (u32, u32),
    ) -> Result<OutputSummary> {
        fs::create_dir_all(&self.output_dir)?;

        let mut records = Vec::new();
        let mut combined = Vec::with_capacity(frames.len());
        let mut skipped = 0;

        for frame in frames {
            if frame.status != FrameStatus::Ok {
                skipped += 1;
                combined.push(combine_max(size, std::iter::empty()));
                continue;
            }

            for (object_id, proposal) in frame.masks.iter().enumerate() {
                let filename = mask_filename(frame.frame_index, object_id);
                proposal.segmentation.save(self.output_dir.join(&filename))?;
                records.push(MaskRecord {
                    frame: frame.frame_index,
                    object_id,
                    filename,
                    bbox: proposal.bbox.to_array(),
                    area: proposal.area,
                    stability_score: proposal.stability_score,
                    interpolated: self.interpolated.contains(&frame.frame_index),
                });
            }
            combined.push(combine_max(
                size,
                frame.masks.iter().map(|m| &m.segmentation),
            ));
        }

        let metadata_path = self.output_dir.join(METADATA_FILE);
        let writer = BufWriter::new(File::create(&metadata_path)?);
        serde_json::to_writer_pretty(writer, &records)?;

        let video_path = if combined.is_empty() {
            warn!("no frames, combined mask video not written");
            None
        } else {
            let path = self.output_dir.join(format!(
                "{}.{}",
                COMBINED_STEM,
                self.video.container_extension()
            ));
            self.video.encode(&path, &combined, fps, size)?;
            Some(path)
        };

        if skipped > 0 {
            warn!(frames = skipped, "frames without masks written as empty");
        }
        info!(
            dir = %self.output_dir.display(),
            masks = records.len(),
            frames = combined.len(),
            "output written"
        );

        Ok(OutputSummary {
            mask_files: records.len(),
            metadata_records: records.len(),
            video_frames: combined.len(),
            metadata_path,
            video_path,
        })
    }
}
