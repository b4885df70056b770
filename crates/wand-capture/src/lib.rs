use anyhow::{bail, Context, Result};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};
use wand_config::{Flip, SourceConfig};

#[cfg(feature = "video")]
pub mod video;

/// A stream of camera frames.
///
/// `read` returns `None` on a transient failure or when a non-looping source is
/// exhausted; it never panics or errors. Callers skip the tick and try again.
pub trait VideoSource: Send {
    fn read(&mut self) -> Option<RgbaImage>;

    /// Release the underlying device or file
    fn end(&mut self) {}

    /// True once a non-looping source has nothing more to give
    fn is_exhausted(&self) -> bool {
        false
    }

    /// Human-readable description for status reporting
    fn describe(&self) -> String;
}

/// Status of the frame acquisition side of the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureStatus {
    pub is_capturing: bool,
    pub source: Option<String>,
    pub fps: f64,
    pub last_capture_time: Option<u64>,
    pub resolution: Option<(u32, u32)>,
    pub dropped_frames: u64,
}

impl Default for CaptureStatus {
    fn default() -> Self {
        Self {
            is_capturing: false,
            source: None,
            fps: 0.0,
            last_capture_time: None,
            resolution: None,
            dropped_frames: 0,
        }
    }
}

/// Rolling frames-per-second estimate, restarted every 5 seconds
#[derive(Debug)]
pub struct FpsCounter {
    frame_count: u64,
    timer: Instant,
}

impl FpsCounter {
    pub fn new() -> Self {
        Self {
            frame_count: 0,
            timer: Instant::now(),
        }
    }

    /// Count one frame and return the current rate
    pub fn tick(&mut self) -> f64 {
        self.frame_count += 1;
        let elapsed = self.timer.elapsed().as_secs_f64();
        let fps = if elapsed > 0.0 {
            self.frame_count as f64 / elapsed
        } else {
            0.0
        };

        if elapsed > 5.0 {
            self.frame_count = 0;
            self.timer = Instant::now();
        }
        fps
    }
}

impl Default for FpsCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// Milliseconds since the Unix epoch, for status timestamps
pub fn unix_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Per-frame flip and downscale applied by every source
#[derive(Debug, Clone, Default)]
pub struct FrameTransform {
    flip: Vec<Flip>,
    max_width: Option<u32>,
}

impl FrameTransform {
    pub fn new(config: &SourceConfig) -> Self {
        Self {
            flip: config.flip.clone(),
            max_width: config.max_width,
        }
    }

    pub fn apply(&self, mut frame: RgbaImage) -> RgbaImage {
        for flip in &self.flip {
            match flip {
                Flip::Horizontal => image::imageops::flip_horizontal_in_place(&mut frame),
                Flip::Vertical => image::imageops::flip_vertical_in_place(&mut frame),
            }
        }

        match self.max_width {
            Some(max_w) if max_w > 0 && frame.width() > max_w => {
                let scale = max_w as f64 / frame.width() as f64;
                let new_h = ((frame.height() as f64 * scale).round() as u32).max(1);
                image::imageops::resize(
                    &frame,
                    max_w,
                    new_h,
                    image::imageops::FilterType::Triangle,
                )
            }
            _ => frame,
        }
    }
}

/// Replays a fixed set of in-memory frames, optionally forever
pub struct FrameLooper {
    frames: Vec<RgbaImage>,
    index: usize,
    looping: bool,
}

impl FrameLooper {
    pub fn new(frames: Vec<RgbaImage>, looping: bool) -> Self {
        Self {
            frames,
            index: 0,
            looping,
        }
    }
}

impl VideoSource for FrameLooper {
    fn read(&mut self) -> Option<RgbaImage> {
        if self.index >= self.frames.len() {
            if !self.looping || self.frames.is_empty() {
                return None;
            }
            debug!("Looping back to frame 0");
            self.index = 0;
        }
        let frame = self.frames[self.index].clone();
        self.index += 1;
        Some(frame)
    }

    fn is_exhausted(&self) -> bool {
        !self.looping && self.index >= self.frames.len()
    }

    fn describe(&self) -> String {
        format!("[Frames] {} in memory", self.frames.len())
    }
}

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "bmp"];

/// Reads a directory of still images in file-name order, as if it were a video
pub struct ImageSequenceSource {
    dir: PathBuf,
    files: Vec<PathBuf>,
    index: usize,
    looping: bool,
    transform: FrameTransform,
}

impl ImageSequenceSource {
    pub fn open(dir: &Path, config: &SourceConfig) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read frame directory {}", dir.display()))?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();
        files.sort();

        if files.is_empty() {
            bail!("No image frames found in {}", dir.display());
        }
        info!("Image sequence {} ready with {} frames", dir.display(), files.len());

        Ok(Self {
            dir: dir.to_path_buf(),
            files,
            index: 0,
            looping: config.looping,
            transform: FrameTransform::new(config),
        })
    }

    pub fn frame_count(&self) -> usize {
        self.files.len()
    }
}

impl VideoSource for ImageSequenceSource {
    fn read(&mut self) -> Option<RgbaImage> {
        if self.index >= self.files.len() {
            if !self.looping {
                return None;
            }
            debug!("Looping {} back to the first frame", self.dir.display());
            self.index = 0;
        }
        let path = &self.files[self.index];
        self.index += 1;

        match image::open(path) {
            Ok(img) => Some(self.transform.apply(img.to_rgba8())),
            Err(e) => {
                warn!("Failed to decode frame {}: {}", path.display(), e);
                None
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        !self.looping && self.index >= self.files.len()
    }

    fn describe(&self) -> String {
        format!("[Frames] {}", self.dir.display())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(w: u32, h: u32, v: u8) -> RgbaImage {
        RgbaImage::from_pixel(w, h, image::Rgba([v, v, v, 255]))
    }

    #[test]
    fn test_looper_wraps_around() {
        let mut source = FrameLooper::new(vec![solid(4, 4, 1), solid(4, 4, 2)], true);
        let values: Vec<u8> = (0..5)
            .map(|_| source.read().unwrap().get_pixel(0, 0)[0])
            .collect();
        assert_eq!(values, vec![1, 2, 1, 2, 1]);
    }

    #[test]
    fn test_looper_without_looping_ends() {
        let mut source = FrameLooper::new(vec![solid(4, 4, 1)], false);
        assert!(!source.is_exhausted());
        assert!(source.read().is_some());
        assert!(source.is_exhausted());
        assert!(source.read().is_none());
        assert!(FrameLooper::new(vec![], true).read().is_none());
    }

    #[test]
    fn test_transform_flip_and_downscale() {
        let mut frame = solid(1600, 1200, 0);
        frame.put_pixel(0, 0, image::Rgba([255, 255, 255, 255]));
        let transform = FrameTransform::new(&SourceConfig {
            flip: vec![Flip::Horizontal],
            max_width: Some(800),
            ..Default::default()
        });
        let out = transform.apply(frame);
        assert_eq!(out.dimensions(), (800, 600));
        assert!(out.get_pixel(799, 0)[0] > 0);
        assert_eq!(out.get_pixel(0, 0)[0], 0);
    }

    #[test]
    fn test_image_sequence_skips_other_files() {
        let dir = tempfile::tempdir().unwrap();
        solid(8, 8, 10).save(dir.path().join("000.png")).unwrap();
        solid(8, 8, 20).save(dir.path().join("001.png")).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a frame").unwrap();

        let config = SourceConfig {
            looping: false,
            ..Default::default()
        };
        let mut source = ImageSequenceSource::open(dir.path(), &config).unwrap();
        assert_eq!(source.read().unwrap().get_pixel(0, 0)[0], 10);
        assert_eq!(source.read().unwrap().get_pixel(0, 0)[0], 20);
        assert!(source.read().is_none());
    }

    #[test]
    fn test_image_sequence_empty_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ImageSequenceSource::open(dir.path(), &SourceConfig::default()).is_err());
    }
}
