//! Video decoding and encoding
//!
//! Containers are reached through the `VideoIo` trait. `ImageSequenceIo` covers
//! what the `image` crate can read natively: animated GIFs, directories of still
//! frames and single images. `MemoryVideoIo` keeps everything in memory.

use crate::error::VisionError;
use image::codecs::gif::{GifDecoder, GifEncoder, Repeat};
use image::{AnimationDecoder, Delay, DynamicImage, GrayImage, RgbImage};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const FRAME_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// Frames of a decoded video, in presentation order.
#[derive(Debug, Clone)]
pub struct DecodedVideo {
    pub frames: Vec<RgbImage>,
    pub fps: f64,
    pub size: (u32, u32),
}

impl DecodedVideo {
    /// Builds a video from frames that all share the first frame's size.
    pub fn new(frames: Vec<RgbImage>, fps: f64) -> Result<Self, VisionError> {
        let size = frames
            .first()
            .map(|f| f.dimensions())
            .ok_or_else(|| VisionError::Video("video has no frames".to_string()))?;
        if let Some((i, f)) = frames
            .iter()
            .enumerate()
            .find(|(_, f)| f.dimensions() != size)
        {
            return Err(VisionError::Video(format!(
                "frame {} is {:?}, expected {:?}",
                i,
                f.dimensions(),
                size
            )));
        }
        if fps.is_nan() || fps <= 0.0 {
            return Err(VisionError::Video(format!("invalid frame rate {}", fps)));
        }
        Ok(Self { frames, fps, size })
    }
}

pub trait VideoIo: Send + Sync {
    fn decode(&self, path: &Path) -> Result<DecodedVideo, VisionError>;

    /// Writes single-channel frames as a video at `path`. Every frame must be `size`.
    fn encode(
        &self,
        path: &Path,
        frames: &[GrayImage],
        fps: f64,
        size: (u32, u32),
    ) -> Result<(), VisionError>;

    /// Extension (without the dot) of the container `encode` produces.
    fn container_extension(&self) -> &str;
}

fn check_encodable(frames: &[GrayImage], fps: f64, size: (u32, u32)) -> Result<(), VisionError> {
    if frames.is_empty() {
        return Err(VisionError::Video("nothing to encode".to_string()));
    }
    if fps.is_nan() || fps <= 0.0 {
        return Err(VisionError::Video(format!("invalid frame rate {}", fps)));
    }
    if let Some(i) = frames.iter().position(|f| f.dimensions() != size) {
        return Err(VisionError::Video(format!(
            "frame {} is {:?}, expected {:?}",
            i,
            frames[i].dimensions(),
            size
        )));
    }
    Ok(())
}

fn has_extension(path: &Path, accepted: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| accepted.iter().any(|a| a.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Video IO backed by the `image` crate codecs.
#[derive(Debug, Clone)]
pub struct ImageSequenceIo {
    /// Frame rate reported for inputs that carry none (still frames, zero GIF delays)
    default_fps: f64,
}

impl ImageSequenceIo {
    pub fn new(default_fps: f64) -> Self {
        Self { default_fps }
    }

    fn decode_gif(&self, path: &Path) -> Result<DecodedVideo, VisionError> {
        let decoder = GifDecoder::new(BufReader::new(File::open(path)?))?;
        let frames = decoder.into_frames().collect_frames()?;

        let fps = frames
            .first()
            .map(|f| {
                let (numer, denom) = f.delay().numer_denom_ms();
                if numer == 0 || denom == 0 {
                    self.default_fps
                } else {
                    1000.0 * denom as f64 / numer as f64
                }
            })
            .unwrap_or(self.default_fps);

        let images = frames
            .into_iter()
            .map(|f| DynamicImage::ImageRgba8(f.into_buffer()).to_rgb8())
            .collect();
        DecodedVideo::new(images, fps)
    }

    fn decode_directory(&self, dir: &Path) -> Result<DecodedVideo, VisionError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && has_extension(p, &FRAME_EXTENSIONS))
            .collect();
        paths.sort();

        if paths.is_empty() {
            return Err(VisionError::Video(format!(
                "no frame images in {}",
                dir.display()
            )));
        }

        let frames = paths
            .iter()
            .map(|p| image::open(p).map(|img| img.to_rgb8()))
            .collect::<Result<Vec<_>, _>>()?;
        DecodedVideo::new(frames, self.default_fps)
    }
}

impl Default for ImageSequenceIo {
    fn default() -> Self {
        Self::new(30.0)
    }
}

impl VideoIo for ImageSequenceIo {
    fn decode(&self, path: &Path) -> Result<DecodedVideo, VisionError> {
        if !path.exists() {
            return Err(VisionError::Video(format!(
                "cannot open video {}",
                path.display()
            )));
        }

        let video = if path.is_dir() {
            self.decode_directory(path)?
        } else if has_extension(path, &["gif"]) {
            self.decode_gif(path)?
        } else {
            let frame = image::open(path)?.to_rgb8();
            DecodedVideo::new(vec![frame], self.default_fps)?
        };

        info!(
            path = %path.display(),
            frames = video.frames.len(),
            fps = video.fps,
            width = video.size.0,
            height = video.size.1,
            "video decoded"
        );
        Ok(video)
    }

    fn encode(
        &self,
        path: &Path,
        frames: &[GrayImage],
        fps: f64,
        size: (u32, u32),
    ) -> Result<(), VisionError> {
        check_encodable(frames, fps, size)?;

        let delay_ms = (1000.0 / fps).round().max(1.0) as u32;
        let mut encoder = GifEncoder::new(BufWriter::new(File::create(path)?));
        encoder.set_repeat(Repeat::Infinite)?;
        for frame in frames {
            let rgba = DynamicImage::ImageLuma8(frame.clone()).to_rgba8();
            encoder.encode_frame(image::Frame::from_parts(
                rgba,
                0,
                0,
                Delay::from_numer_denom_ms(delay_ms, 1),
            ))?;
        }

        debug!(path = %path.display(), frames = frames.len(), "video encoded");
        Ok(())
    }

    fn container_extension(&self) -> &str {
        "gif"
    }
}

/// An encoded video captured by `MemoryVideoIo`.
#[derive(Debug, Clone)]
pub struct EncodedVideo {
    pub path: PathBuf,
    pub frames: Vec<GrayImage>,
    pub fps: f64,
    pub size: (u32, u32),
}

/// In-memory video IO: decodes to a fixed video and records encoded output.
#[derive(Debug)]
pub struct MemoryVideoIo {
    source: Option<DecodedVideo>,
    encoded: Mutex<Vec<EncodedVideo>>,
}

impl MemoryVideoIo {
    pub fn new(source: DecodedVideo) -> Self {
        Self {
            source: Some(source),
            encoded: Mutex::new(Vec::new()),
        }
    }

    /// Sink-only IO; `decode` always fails.
    pub fn sink() -> Self {
        Self {
            source: None,
            encoded: Mutex::new(Vec::new()),
        }
    }

    pub fn encoded(&self) -> Vec<EncodedVideo> {
        self.encoded.lock().clone()
    }
}

impl VideoIo for MemoryVideoIo {
    fn decode(&self, path: &Path) -> Result<DecodedVideo, VisionError> {
        self.source
            .clone()
            .ok_or_else(|| VisionError::Video(format!("cannot open video {}", path.display())))
    }

    fn encode(
        &self,
        path: &Path,
        frames: &[GrayImage],
        fps: f64,
        size: (u32, u32),
    ) -> Result<(), VisionError> {
        check_encodable(frames, fps, size)?;
        self.encoded.lock().push(EncodedVideo {
            path: path.to_path_buf(),
            frames: frames.to_vec(),
            fps,
            size,
        });
        Ok(())
    }

    fn container_extension(&self) -> &str {
        "gif"
    }
}
