use image::{GrayImage, Luma, RgbaImage};
use imageproc::distance_transform::Norm;
use tracing::{debug, warn};
use wand_config::DetectorConfig;

/// Output of one preprocessing pass
#[derive(Debug, Clone)]
pub struct Preprocessed {
    /// Foreground intensity after background removal and smoothing
    pub gray: GrayImage,
    /// `gray` thresholded at the configured brightness and opened
    pub binary: GrayImage,
}

/// Prepares camera frames for tip detection.
///
/// Holds the only per-stream state of the detector: a rolling mean background
/// that stationary bright spots melt into.
pub struct Preprocessor {
    config: DetectorConfig,
    background: Option<Background>,
}

struct Background {
    width: u32,
    height: u32,
    mean: Vec<f32>,
}

impl Preprocessor {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            config: config.clone(),
            background: None,
        }
    }

    pub fn process(&mut self, frame: &RgbaImage) -> Preprocessed {
        let mut gray = image::imageops::grayscale(frame);

        if self.config.normalize_contrast {
            stretch_contrast(&mut gray);
        }

        if self.config.background_subtraction {
            gray = self.subtract_background(gray);
        }

        if self.config.blur_sigma > 0.0 {
            gray = imageproc::filter::gaussian_blur_f32(&gray, self.config.blur_sigma);
        }

        let mut binary = threshold(&gray, self.config.brightness_threshold);
        if self.config.open_radius > 0 {
            binary = imageproc::morphology::open(&binary, Norm::LInf, self.config.open_radius);
        }

        Preprocessed { gray, binary }
    }

    /// Forget the background model; the next frame re-seeds it
    pub fn reset_background(&mut self) {
        self.background = None;
    }

    fn subtract_background(&mut self, gray: GrayImage) -> GrayImage {
        let (w, h) = gray.dimensions();

        match &self.background {
            Some(bg) if bg.width == w && bg.height == h => {}
            Some(bg) => {
                warn!(
                    "Frame size changed from {}x{} to {}x{}, re-seeding background",
                    bg.width, bg.height, w, h
                );
                self.background = Some(Background::seed(&gray));
                return GrayImage::new(w, h);
            }
            None => {
                debug!("Seeding background model at {}x{}", w, h);
                self.background = Some(Background::seed(&gray));
                return GrayImage::new(w, h);
            }
        }
        let Some(bg) = self.background.as_mut() else {
            return GrayImage::new(w, h);
        };

        let alpha = self.config.background_alpha;
        let mut out = GrayImage::new(w, h);
        for ((mean, src), dst) in bg
            .mean
            .iter_mut()
            .zip(gray.as_raw().iter())
            .zip(out.iter_mut())
        {
            let v = *src as f32;
            *dst = (v - *mean).max(0.0).min(255.0) as u8;
            *mean += alpha * (v - *mean);
        }
        out
    }
}

impl Background {
    fn seed(gray: &GrayImage) -> Self {
        Self {
            width: gray.width(),
            height: gray.height(),
            mean: gray.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }
}

/// Stretch intensities so the darkest pixel becomes 0 and the brightest 255
fn stretch_contrast(gray: &mut GrayImage) {
    let (lo, hi) = gray
        .as_raw()
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    if hi <= lo {
        return;
    }
    let range = (hi - lo) as f32;
    for p in gray.iter_mut() {
        *p = (((*p - lo) as f32 / range) * 255.0).round() as u8;
    }
}

/// Bright pixels become 255, everything else 0
fn threshold(gray: &GrayImage, level: u8) -> GrayImage {
    let (w, h) = gray.dimensions();
    GrayImage::from_fn(w, h, |x, y| {
        if gray.get_pixel(x, y)[0] >= level {
            Luma([255u8])
        } else {
            Luma([0u8])
        }
    })
}
