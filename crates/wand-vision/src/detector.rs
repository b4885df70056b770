use crate::geometry::Point;
use crate::preprocess::{Preprocessed, Preprocessor};
use image::{GrayImage, Luma, RgbaImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use std::f32::consts::PI;
use tracing::debug;
use wand_config::{DetectionStrategy, DetectorConfig};

/// Anything that turns a camera frame into candidate tip positions.
pub trait PointDetector: Send {
    /// Candidates in detection order. An empty list is a normal outcome.
    fn detect(&mut self, frame: &RgbaImage) -> Vec<Point>;

    /// Drop any per-stream calibration state
    fn reset(&mut self) {}
}

/// Wand tip detector: preprocessing followed by one of the configured strategies.
pub struct TipDetector {
    config: DetectorConfig,
    preprocessor: Preprocessor,
}

/// Shape statistics of one connected component
#[derive(Debug, Clone, Default)]
struct Component {
    area: u32,
    sum_x: f64,
    sum_y: f64,
    sum_xx: f64,
    sum_yy: f64,
    sum_xy: f64,
    /// Pixel edges shared with background or the frame border
    exposed_edges: u32,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
}

impl Component {
    fn add(&mut self, x: u32, y: u32, exposed: u32) {
        if self.area == 0 {
            self.min_x = x;
            self.min_y = y;
            self.max_x = x;
            self.max_y = y;
        } else {
            self.min_x = self.min_x.min(x);
            self.min_y = self.min_y.min(y);
            self.max_x = self.max_x.max(x);
            self.max_y = self.max_y.max(y);
        }
        let (fx, fy) = (x as f64, y as f64);
        self.area += 1;
        self.sum_x += fx;
        self.sum_y += fy;
        self.sum_xx += fx * fx;
        self.sum_yy += fy * fy;
        self.sum_xy += fx * fy;
        self.exposed_edges += exposed;
    }

    fn centroid(&self) -> (f32, f32) {
        let n = self.area as f64;
        ((self.sum_x / n) as f32, (self.sum_y / n) as f32)
    }

    /// 4πA/P², with the perimeter estimated from exposed pixel edges
    fn circularity(&self) -> f32 {
        let perimeter = self.exposed_edges as f32 * PI / 4.0;
        if perimeter <= 0.0 {
            return 0.0;
        }
        (4.0 * PI * self.area as f32 / (perimeter * perimeter)).min(1.0)
    }

    /// Ratio of the second-moment eigenvalues: 1 for round, 0 for a line
    fn inertia_ratio(&self) -> f32 {
        let n = self.area as f64;
        let (cx, cy) = (self.sum_x / n, self.sum_y / n);
        let mu20 = self.sum_xx / n - cx * cx;
        let mu02 = self.sum_yy / n - cy * cy;
        let mu11 = self.sum_xy / n - cx * cy;

        let half_trace = (mu20 + mu02) / 2.0;
        let spread = (((mu20 - mu02) / 2.0).powi(2) + mu11 * mu11).sqrt();
        let major = half_trace + spread;
        let minor = (half_trace - spread).max(0.0);
        if major <= 1e-9 {
            return 1.0;
        }
        (minor / major) as f32
    }

    /// Radius of the circle spanning the component's bounding box
    fn enclosing_radius(&self) -> f32 {
        let w = (self.max_x - self.min_x + 1) as f32;
        let h = (self.max_y - self.min_y + 1) as f32;
        w.max(h) / 2.0
    }

    /// Fraction of the enclosing disc covered by the component
    fn disc_fill(&self) -> f32 {
        let r = self.enclosing_radius();
        (self.area as f32 / (PI * r * r)).min(1.0)
    }
}

impl TipDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            config: config.clone(),
            preprocessor: Preprocessor::new(config),
        }
    }

    pub fn strategy(&self) -> DetectionStrategy {
        self.config.strategy
    }

    /// Preprocess `frame` and run the configured strategy on it
    pub fn detect_frame(&mut self, frame: &RgbaImage) -> Vec<Point> {
        let pre = self.preprocessor.process(frame);
        self.detect_preprocessed(&pre)
    }

    pub fn detect_preprocessed(&self, pre: &Preprocessed) -> Vec<Point> {
        let points = match self.config.strategy {
            DetectionStrategy::Blob => self.find_blobs(&pre.binary),
            DetectionStrategy::Circle => self.find_circles(&pre.binary),
            DetectionStrategy::Brightest => self.find_brightest(pre),
        };
        if !points.is_empty() {
            debug!(
                "{:?} detector found {} candidate(s)",
                self.config.strategy,
                points.len()
            );
        }
        points
    }

    /// The candidate to track: highest score, earliest in detection order on ties.
    pub fn best(points: &[Point]) -> Option<Point> {
        points.iter().fold(None, |best: Option<Point>, p| match best {
            Some(b) if b.score >= p.score => Some(b),
            _ => Some(*p),
        })
    }

    fn find_blobs(&self, binary: &GrayImage) -> Vec<Point> {
        let cfg = &self.config;
        components(binary)
            .into_iter()
            .filter(|c| c.area >= cfg.min_area && c.area <= cfg.max_area)
            .filter_map(|c| {
                let circularity = c.circularity();
                let inertia = c.inertia_ratio();
                if circularity < cfg.min_circularity || inertia < cfg.min_inertia_ratio {
                    return None;
                }
                let (x, y) = c.centroid();
                let diameter = 2.0 * (c.area as f32 / PI).sqrt();
                let score = circularity * inertia * (c.area as f32).sqrt();
                Some(Point::with_shape(x, y, diameter, score))
            })
            .collect()
    }

    fn find_circles(&self, binary: &GrayImage) -> Vec<Point> {
        let cfg = &self.config;
        components(binary)
            .into_iter()
            .filter_map(|c| {
                let radius = c.enclosing_radius();
                if radius < cfg.min_radius || radius > cfg.max_radius {
                    return None;
                }
                let fill = c.disc_fill();
                if fill < cfg.min_circularity {
                    return None;
                }
                let (x, y) = c.centroid();
                Some(Point::with_shape(x, y, 2.0 * radius, fill * radius))
            })
            .collect()
    }

    /// First pixel (raster order) of the brightest value, if it clears the threshold
    fn find_brightest(&self, pre: &Preprocessed) -> Vec<Point> {
        let mut best: Option<(u32, u32, u8)> = None;
        for (x, y, p) in pre.gray.enumerate_pixels() {
            let v = p[0];
            if best.map_or(true, |(_, _, b)| v > b) {
                best = Some((x, y, v));
            }
        }
        match best {
            Some((x, y, v)) if v >= self.config.brightness_threshold => {
                vec![Point::with_shape(x as f32, y as f32, 0.0, v as f32 / 255.0)]
            }
            _ => Vec::new(),
        }
    }
}

impl PointDetector for TipDetector {
    fn detect(&mut self, frame: &RgbaImage) -> Vec<Point> {
        self.detect_frame(frame)
    }

    fn reset(&mut self) {
        self.preprocessor.reset_background();
    }
}

/// Label 8-connected foreground regions and gather their statistics in label order,
/// which is the raster order of each region's first pixel.
fn components(binary: &GrayImage) -> Vec<Component> {
    let labels = connected_components(binary, Connectivity::Eight, Luma([0u8]));
    let (w, h) = labels.dimensions();

    let mut stats: Vec<Component> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let id = label[0];
        if id == 0 {
            continue;
        }
        let idx = (id - 1) as usize;
        if idx >= stats.len() {
            stats.resize(idx + 1, Component::default());
        }

        let same = |nx: i64, ny: i64| -> bool {
            nx >= 0
                && ny >= 0
                && (nx as u32) < w
                && (ny as u32) < h
                && labels.get_pixel(nx as u32, ny as u32)[0] == id
        };
        let (xi, yi) = (x as i64, y as i64);
        let exposed = [(xi - 1, yi), (xi + 1, yi), (xi, yi - 1), (xi, yi + 1)]
            .iter()
            .filter(|&&(nx, ny)| !same(nx, ny))
            .count() as u32;

        stats[idx].add(x, y, exposed);
    }

    stats.retain(|c| c.area > 0);
    stats
}
