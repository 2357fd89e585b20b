//! Indexed frame sequences read from a video

use crate::error::VisionError;
use crate::video::VideoIo;
use image::imageops::{self, FilterType};
use image::RgbImage;
use segmentfx_core::Frame;
use std::path::Path;
use tracing::info;

/// Ordered frames of one video. Indices start at 0 and increase by one.
#[derive(Debug, Clone)]
pub struct FrameSource {
    frames: Vec<Frame>,
    fps: f64,
    size: (u32, u32),
}

impl FrameSource {
    /// Decodes `path` through `io`, keeping at most `max_frames` frames.
    pub fn open(
        io: &dyn VideoIo,
        path: &Path,
        max_frames: Option<usize>,
    ) -> Result<Self, VisionError> {
        let video = io.decode(path)?;
        let source = Self::from_images(video.frames, video.fps, max_frames)?;
        info!(
            path = %path.display(),
            frames = source.len(),
            max_frames = ?max_frames,
            "frames prepared"
        );
        Ok(source)
    }

    pub fn from_images(
        images: Vec<RgbImage>,
        fps: f64,
        max_frames: Option<usize>,
    ) -> Result<Self, VisionError> {
        let limit = max_frames.unwrap_or(usize::MAX);
        let frames: Vec<Frame> = images
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(index, pixels)| Frame::new(index, pixels))
            .collect();

        let size = frames
            .first()
            .map(|f| f.original_size)
            .ok_or_else(|| VisionError::Video("no frames to read".to_string()))?;
        Ok(Self { frames, fps, size })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<Frame> {
        self.frames
    }

    /// Frames at indices `0, skip, 2*skip, ...`. A `skip` of 0 is treated as 1.
    pub fn anchors(&self, skip: usize) -> Vec<Frame> {
        self.frames
            .iter()
            .step_by(skip.max(1))
            .cloned()
            .collect()
    }
}

/// Downsamples `image` by `factor` (Triangle filter). Factor 1.0 returns a copy.
pub fn downsample(image: &RgbImage, factor: f32) -> RgbImage {
    if factor >= 1.0 || !factor.is_finite() || factor <= 0.0 {
        return image.clone();
    }
    let width = ((image.width() as f32 * factor) as u32).max(1);
    let height = ((image.height() as f32 * factor) as u32).max(1);
    imageops::resize(image, width, height, FilterType::Triangle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{DecodedVideo, MemoryVideoIo};
    use image::Rgb;

    fn images(n: usize) -> Vec<RgbImage> {
        (0..n)
            .map(|i| RgbImage::from_pixel(8, 6, Rgb([i as u8, 0, 0])))
            .collect()
    }

    #[test]
    fn test_from_images_indexes_in_order() {
        let source = FrameSource::from_images(images(5), 30.0, None).unwrap();
        assert_eq!(source.len(), 5);
        assert_eq!(source.size(), (8, 6));
        let indices: Vec<usize> = source.frames().iter().map(|f| f.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_max_frames_caps_source() {
        let source = FrameSource::from_images(images(10), 30.0, Some(3)).unwrap();
        assert_eq!(source.len(), 3);
        assert_eq!(source.frames()[2].pixels.get_pixel(0, 0).0[0], 2);
    }

    #[test]
    fn test_empty_source_is_an_error() {
        assert!(FrameSource::from_images(Vec::new(), 30.0, None).is_err());
        assert!(FrameSource::from_images(images(4), 30.0, Some(0)).is_err());
    }

    #[test]
    fn test_open_reads_through_video_io() {
        let io = MemoryVideoIo::new(DecodedVideo::new(images(4), 12.0).unwrap());
        let source = FrameSource::open(&io, Path::new("clip.gif"), None).unwrap();
        assert_eq!(source.len(), 4);
        assert_eq!(source.fps(), 12.0);
    }

    #[test]
    fn test_anchors_step_by_skip() {
        let source = FrameSource::from_images(images(7), 30.0, None).unwrap();
        let anchors: Vec<usize> = source.anchors(3).iter().map(|f| f.index).collect();
        assert_eq!(anchors, vec![0, 3, 6]);
        assert_eq!(source.anchors(1).len(), 7);
    }

    #[test]
    fn test_downsample_halves_dimensions() {
        let image = RgbImage::new(9, 4);
        assert_eq!(downsample(&image, 0.5).dimensions(), (4, 2));
        assert_eq!(downsample(&image, 1.0).dimensions(), (9, 4));
        assert_eq!(downsample(&RgbImage::new(1, 1), 0.1).dimensions(), (1, 1));
    }
}
