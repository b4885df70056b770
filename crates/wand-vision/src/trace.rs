use crate::geometry::{BoundingBox, Point};
use crate::motion::{MotionFilter, MotionVerdict};
use crate::sigil;
use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use wand_config::{MotionConfig, SigilConfig, TraceConfig};

const TRACE_INK: Luma<u8> = Luma([255]);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceState {
    Empty,
    Tracking,
    /// Complete gesture waiting to be classified. Points keep flowing in until `reset()`.
    Valid,
}

#[derive(Debug, Clone, Copy)]
pub struct TracePoint {
    pub point: Point,
    pub at: Instant,
}

/// What one tick did to the accumulator
#[derive(Debug, Clone)]
pub struct Observation {
    pub state: TraceState,
    /// Point appended to the buffer on this tick
    pub accepted: Option<Point>,
    /// Motion filter outcome for this tick's detection, if any
    pub verdict: Option<MotionVerdict>,
    /// The trace went stale and was cleared on this tick
    pub expired: bool,
}

/// Turns a stream of per-frame tip detections into one bounded gesture trace.
///
/// Accepted points are kept in a time-windowed FIFO and joined by line segments on a
/// frame-sized mask. Once enough points were collected the trace becomes `Valid` and
/// `get_a_spell_maybe()` yields the square sigil for the classifier.
pub struct TraceAccumulator {
    config: TraceConfig,
    sigil: SigilConfig,
    motion: MotionFilter,
    width: u32,
    height: u32,
    buffer: VecDeque<TracePoint>,
    mask: GrayImage,
    previous: Option<TracePoint>,
    started_at: Option<Instant>,
    last_detection: Option<Instant>,
    state: TraceState,
}

impl TraceAccumulator {
    pub fn new(
        trace: &TraceConfig,
        motion: &MotionConfig,
        sigil: &SigilConfig,
        width: u32,
        height: u32,
    ) -> Self {
        Self {
            config: trace.clone(),
            sigil: sigil.clone(),
            motion: MotionFilter::new(motion),
            width,
            height,
            buffer: VecDeque::with_capacity(trace.buffer_size),
            mask: GrayImage::new(width, height),
            previous: None,
            started_at: None,
            last_detection: None,
            state: TraceState::Empty,
        }
    }

    /// Feed one frame's worth of information: the best detection, or `None` when the
    /// detector found nothing or the frame was unusable.
    pub fn observe(&mut self, now: Instant, detection: Option<Point>) -> Observation {
        let detection = detection.filter(|p| {
            let finite = p.is_finite();
            if !finite {
                warn!("Dropping non-finite tip position ({}, {})", p.x, p.y);
            }
            finite
        });
        let mut observation = Observation {
            state: self.state,
            accepted: None,
            verdict: None,
            expired: false,
        };

        match detection {
            Some(point) => {
                self.last_detection = Some(now);
                let point = point.clamped(self.width, self.height);
                let verdict = self.judge(&point, now);
                observation.verdict = Some(verdict);
                if verdict.is_accepted() {
                    self.append(point, now);
                    observation.accepted = Some(point);
                }
            }
            None => {
                if self.previous.is_some() && self.since_last_detection(now) > self.max_duration() {
                    warn!("Wand not detected for a long time, resetting the trace");
                    self.reset();
                    observation.expired = true;
                }
            }
        }

        self.evict(now);
        if self.buffer.is_empty() && self.state != TraceState::Empty {
            debug!("All trace points aged out, resetting");
            self.reset();
            observation.expired = true;
        }

        // A wand held still counts as a pause just like a lost wand
        let paused = matches!(observation.verdict, None | Some(MotionVerdict::Stationary));
        if self.state == TraceState::Tracking && self.is_complete(now, paused) {
            info!(
                "Trace complete with {} points after {:.2}s",
                self.buffer.len(),
                self.elapsed(now).as_secs_f32()
            );
            self.state = TraceState::Valid;
        }

        observation.state = self.state;
        observation
    }

    /// Clear buffer, mask and motion history. A no-op on an empty accumulator.
    pub fn reset(&mut self) {
        if self.state == TraceState::Empty && self.previous.is_none() && self.buffer.is_empty() {
            return;
        }
        self.buffer.clear();
        self.mask.fill(0);
        self.previous = None;
        self.started_at = None;
        self.state = TraceState::Empty;
        debug!("Trace accumulator has been reset");
    }

    /// Follow a change in frame size. Any trace in progress is discarded.
    pub fn resize(&mut self, width: u32, height: u32) {
        if (width, height) == (self.width, self.height) {
            return;
        }
        info!(
            "Trace mask resized from {}x{} to {}x{}",
            self.width, self.height, width, height
        );
        self.width = width;
        self.height = height;
        self.mask = GrayImage::new(width, height);
        self.buffer.clear();
        self.previous = None;
        self.started_at = None;
        self.last_detection = None;
        self.state = TraceState::Empty;
    }

    /// Extent of the buffered points before any margin is applied
    pub fn raw_bounds(&self) -> Option<BoundingBox> {
        BoundingBox::enclosing(self.buffer.iter().map(|tp| &tp.point))
    }

    /// Extent of the buffered points grown by the sigil margin and clamped to the frame
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        self.raw_bounds()?
            .expand(self.sigil.margin)
            .clamp_to(self.width, self.height)
    }

    /// The extracted sigil once the trace is `Valid`, otherwise `None`
    pub fn get_a_spell_maybe(&self) -> Option<GrayImage> {
        if self.state != TraceState::Valid {
            return None;
        }
        let bounds = self.raw_bounds()?;
        Some(sigil::extract(
            &self.mask,
            &bounds,
            self.sigil.margin,
            self.sigil.output_size,
        ))
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn points(&self) -> impl Iterator<Item = &TracePoint> {
        self.buffer.iter()
    }

    pub fn mask(&self) -> &GrayImage {
        &self.mask
    }

    pub fn previous(&self) -> Option<&Point> {
        self.previous.as_ref().map(|tp| &tp.point)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn judge(&self, point: &Point, now: Instant) -> MotionVerdict {
        let dt = self
            .previous
            .map(|prev| now.saturating_duration_since(prev.at).as_secs_f32())
            .unwrap_or(0.0);
        self.motion
            .judge(point, self.previous.as_ref().map(|tp| &tp.point), dt)
    }

    fn append(&mut self, point: Point, now: Instant) {
        if self.state == TraceState::Empty {
            debug!("Trace started at ({:.1}, {:.1})", point.x, point.y);
            self.state = TraceState::Tracking;
            self.started_at = Some(now);
        }

        if let Some(prev) = self.previous {
            self.draw_segment(&prev.point, &point);
        }

        if self.buffer.len() >= self.config.buffer_size {
            self.buffer.pop_front();
        }
        let entry = TracePoint { point, at: now };
        self.buffer.push_back(entry);
        self.previous = Some(entry);
    }

    fn draw_segment(&mut self, from: &Point, to: &Point) {
        let thickness = self.config.line_thickness.max(1);
        if thickness == 1 {
            draw_line_segment_mut(&mut self.mask, (from.x, from.y), (to.x, to.y), TRACE_INK);
            return;
        }

        let radius = (thickness / 2) as i32;
        let steps = from.distance(to).ceil().max(1.0) as u32;
        for i in 0..=steps {
            let t = i as f32 / steps as f32;
            let x = from.x + (to.x - from.x) * t;
            let y = from.y + (to.y - from.y) * t;
            draw_filled_circle_mut(
                &mut self.mask,
                (x.round() as i32, y.round() as i32),
                radius,
                TRACE_INK,
            );
        }
    }

    fn evict(&mut self, now: Instant) {
        let max = self.max_duration();
        while let Some(front) = self.buffer.front() {
            if now.saturating_duration_since(front.at) > max {
                self.buffer.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_complete(&self, now: Instant, paused: bool) -> bool {
        let len = self.buffer.len();
        let capacity = self.config.buffer_size;

        if len >= capacity.saturating_sub(self.config.valid_slack) {
            return true;
        }

        if self.config.short_trace_needs_pause && !paused {
            return false;
        }
        let divisor = self.config.min_fraction_divisor.max(1);
        self.elapsed(now) < self.config.valid_window() && len > capacity / divisor
    }

    fn elapsed(&self, now: Instant) -> Duration {
        self.started_at
            .map(|start| now.saturating_duration_since(start))
            .unwrap_or_default()
    }

    fn since_last_detection(&self, now: Instant) -> Duration {
        self.last_detection
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default()
    }

    fn max_duration(&self) -> Duration {
        self.config.max_trace_duration()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn accumulator(config: TraceConfig) -> TraceAccumulator {
        TraceAccumulator::new(
            &config,
            &MotionConfig::default(),
            &SigilConfig::default(),
            320,
            240,
        )
    }

    fn at(t0: Instant, ms: u64) -> Instant {
        t0 + Duration::from_millis(ms)
    }

    #[test]
    fn test_reset_on_empty_is_noop() {
        let mut acc = accumulator(TraceConfig::default());
        acc.reset();
        acc.reset();
        assert_eq!(acc.state(), TraceState::Empty);
        assert!(acc.is_empty());
        assert!(acc.mask().pixels().all(|p| p[0] == 0));
        assert!(acc.get_a_spell_maybe().is_none());
    }

    #[test]
    fn test_first_point_starts_tracking_without_drawing() {
        let mut acc = accumulator(TraceConfig::default());
        let t0 = Instant::now();
        let obs = acc.observe(t0, Some(Point::new(100.0, 100.0)));
        assert_eq!(obs.state, TraceState::Tracking);
        assert_eq!(obs.verdict, Some(MotionVerdict::Baseline));
        assert_eq!(acc.len(), 1);
        assert!(acc.mask().pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_buffer_is_bounded() {
        let config = TraceConfig {
            buffer_size: 10,
            ..TraceConfig::default()
        };
        let mut acc = accumulator(config);
        let t0 = Instant::now();
        for i in 0..40u64 {
            acc.observe(at(t0, i * 30), Some(Point::new(10.0 + i as f32 * 2.0, 50.0)));
            assert!(acc.len() <= 10);
        }
        assert_eq!(acc.len(), 10);
        // Oldest entries were dropped first
        let first = acc.points().next().unwrap();
        assert_eq!(first.point.x, 70.0);
    }

    #[test]
    fn test_staleness_invariant_holds_every_tick() {
        let config = TraceConfig {
            buffer_size: 1000,
            max_trace_duration_ms: 300,
            ..TraceConfig::default()
        };
        let mut acc = accumulator(config);
        let t0 = Instant::now();
        for i in 0..60u64 {
            let now = at(t0, i * 40);
            let x = 20.0 + (i % 30) as f32 * 5.0;
            acc.observe(now, Some(Point::new(x, 100.0)));
            for tp in acc.points() {
                assert!(now.duration_since(tp.at) <= Duration::from_millis(300));
            }
        }
    }

    #[test]
    fn test_fast_jump_is_not_appended() {
        let mut acc = accumulator(TraceConfig::default());
        let t0 = Instant::now();
        acc.observe(t0, Some(Point::new(0.0, 0.0)));
        let obs = acc.observe(at(t0, 10), Some(Point::new(300.0, 200.0)));
        assert!(matches!(obs.verdict, Some(MotionVerdict::TooFast { .. })));
        assert!(obs.accepted.is_none());
        assert_eq!(acc.len(), 1);
        assert_eq!(acc.previous(), Some(&Point::new(0.0, 0.0)));
    }

    #[test]
    fn test_out_of_frame_point_is_clamped() {
        let mut acc = accumulator(TraceConfig::default());
        let obs = acc.observe(Instant::now(), Some(Point::new(-20.0, 900.0)));
        let p = obs.accepted.unwrap();
        assert_eq!((p.x, p.y), (0.0, 239.0));
    }

    #[test]
    fn test_non_finite_point_is_dropped() {
        let mut acc = accumulator(TraceConfig::default());
        let obs = acc.observe(Instant::now(), Some(Point::new(f32::NAN, 3.0)));
        assert!(obs.accepted.is_none());
        assert_eq!(acc.state(), TraceState::Empty);
    }

    #[test]
    fn test_short_gesture_completes_after_pause() {
        let mut acc = accumulator(TraceConfig::default());
        let t0 = Instant::now();
        // 8 points > 20 / 3, but under the 15 needed for a full buffer
        for i in 0..8u64 {
            let obs = acc.observe(at(t0, i * 30), Some(Point::new(50.0 + i as f32 * 3.0, 60.0)));
            assert_eq!(obs.state, TraceState::Tracking);
        }
        let obs = acc.observe(at(t0, 8 * 30), None);
        assert_eq!(obs.state, TraceState::Valid);
        assert!(acc.get_a_spell_maybe().is_some());
    }

    #[test]
    fn test_short_gesture_completes_when_held_still() {
        let mut acc = accumulator(TraceConfig::default());
        let t0 = Instant::now();
        for i in 0..8u64 {
            acc.observe(at(t0, i * 30), Some(Point::new(50.0 + i as f32 * 3.0, 60.0)));
        }
        assert_eq!(acc.state(), TraceState::Tracking);

        let end = Point::new(50.0 + 7.0 * 3.0, 60.0);
        let mut seen = Vec::new();
        for i in 8..20u64 {
            let obs = acc.observe(at(t0, i * 30), Some(end));
            if seen.last() != Some(&obs.state) {
                seen.push(obs.state);
            }
        }
        assert_eq!(seen.first(), Some(&TraceState::Valid));
        assert!(!seen.contains(&TraceState::Empty));
        assert_eq!(acc.len(), 8);
        assert!(acc.get_a_spell_maybe().is_some());
    }

    #[test]
    fn test_short_gesture_still_moving_is_not_complete() {
        let mut acc = accumulator(TraceConfig::default());
        let t0 = Instant::now();
        for i in 0..12u64 {
            let obs = acc.observe(at(t0, i * 30), Some(Point::new(50.0 + i as f32 * 3.0, 60.0)));
            assert_eq!(obs.state, TraceState::Tracking);
        }
    }

    #[test]
    fn test_short_gesture_without_pause_requirement() {
        let config = TraceConfig {
            short_trace_needs_pause: false,
            ..TraceConfig::default()
        };
        let mut acc = accumulator(config);
        let t0 = Instant::now();
        let mut last = TraceState::Empty;
        for i in 0..8u64 {
            last = acc
                .observe(at(t0, i * 30), Some(Point::new(50.0 + i as f32 * 3.0, 60.0)))
                .state;
        }
        assert_eq!(last, TraceState::Valid);
    }

    #[test]
    fn test_straight_line_end_to_end() {
        use crate::detector::PointDetector;

        // Stub detector replaying a diagonal at 100 px/s, one point every 30 ms
        struct Replay {
            points: std::vec::IntoIter<Point>,
        }
        impl PointDetector for Replay {
            fn detect(&mut self, _frame: &image::RgbaImage) -> Vec<Point> {
                self.points.next().into_iter().collect()
            }
        }

        let step = 100.0 * 0.030 / std::f32::consts::SQRT_2;
        let mut detector = Replay {
            points: (0..25)
                .map(|i| Point::new(50.0 + i as f32 * step, 50.0 + i as f32 * step))
                .collect::<Vec<_>>()
                .into_iter(),
        };
        let motion = MotionFilter::new(&MotionConfig::default());
        let mut acc = accumulator(TraceConfig::default());
        let frame = image::RgbaImage::new(320, 240);
        let t0 = Instant::now();

        let mut seen = vec![acc.state()];
        for i in 0..25u64 {
            let now = at(t0, i * 30);
            let best = crate::detector::TipDetector::best(&detector.detect(&frame));
            if let Some(p) = best {
                assert!(motion.check(&p, acc.previous(), 0.030).is_accepted());
            }
            let obs = acc.observe(now, best);
            if seen.last() != Some(&obs.state) {
                seen.push(obs.state);
            }
            if obs.state == TraceState::Valid {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![TraceState::Empty, TraceState::Tracking, TraceState::Valid]
        );

        let sigil = acc.get_a_spell_maybe().unwrap();
        assert_eq!(sigil.dimensions(), (224, 224));
        let on_diagonal = (0..224).filter(|&i| sigil.get_pixel(i, i)[0] > 0).count();
        assert!(on_diagonal > 50, "only {} diagonal pixels lit", on_diagonal);

        acc.reset();
        assert_eq!(acc.state(), TraceState::Empty);
        assert!(acc.mask().pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_dropout_auto_reset() {
        let mut acc = accumulator(TraceConfig::default());
        let t0 = Instant::now();
        acc.observe(t0, Some(Point::new(40.0, 40.0)));
        assert_eq!(acc.state(), TraceState::Tracking);

        let obs = acc.observe(at(t0, 2500), None);
        assert!(obs.expired);
        assert_eq!(obs.state, TraceState::Empty);
        assert!(acc.is_empty());
        assert!(acc.mask().pixels().all(|p| p[0] == 0));
    }

    #[test]
    fn test_short_dropout_is_tolerated() {
        let config = TraceConfig {
            min_fraction_divisor: 1,
            ..TraceConfig::default()
        };
        let mut acc = accumulator(config);
        let t0 = Instant::now();
        acc.observe(t0, Some(Point::new(40.0, 40.0)));
        acc.observe(at(t0, 30), Some(Point::new(43.0, 40.0)));
        let obs = acc.observe(at(t0, 1000), None);
        assert!(!obs.expired);
        assert_eq!(obs.state, TraceState::Tracking);
        assert!(acc.mask().pixels().any(|p| p[0] > 0));
    }

    #[test]
    fn test_bounding_box_grows_by_margin() {
        let sigil = SigilConfig {
            margin: 5,
            ..SigilConfig::default()
        };
        let mut acc = TraceAccumulator::new(
            &TraceConfig::default(),
            &MotionConfig::default(),
            &sigil,
            320,
            240,
        );
        assert!(acc.bounding_box().is_none());

        let t0 = Instant::now();
        for (i, (x, y)) in [(10.0, 20.0), (30.0, 40.0), (15.0, 25.0), (35.0, 45.0)]
            .into_iter()
            .enumerate()
        {
            let obs = acc.observe(at(t0, i as u64 * 200), Some(Point::new(x, y)));
            assert!(obs.accepted.is_some());
        }
        assert_eq!(acc.raw_bounds().unwrap().as_tuple(), (10, 20, 35, 45));
        assert_eq!(acc.bounding_box().unwrap().as_tuple(), (5, 15, 40, 50));
    }

    #[test]
    fn test_bounding_box_is_clamped_to_frame() {
        let mut acc = accumulator(TraceConfig::default());
        let t0 = Instant::now();
        acc.observe(t0, Some(Point::new(2.0, 230.0)));
        acc.observe(at(t0, 100), Some(Point::new(12.0, 236.0)));
        let bbox = acc.bounding_box().unwrap();
        assert_eq!((bbox.left, bbox.bottom), (0, 239));
    }

    #[test]
    fn test_resize_discards_trace() {
        let mut acc = accumulator(TraceConfig::default());
        acc.observe(Instant::now(), Some(Point::new(40.0, 40.0)));
        acc.resize(640, 480);
        assert_eq!(acc.dimensions(), (640, 480));
        assert_eq!(acc.mask().dimensions(), (640, 480));
        assert_eq!(acc.state(), TraceState::Empty);
    }
}
