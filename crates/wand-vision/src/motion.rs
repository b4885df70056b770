use crate::geometry::Point;
use tracing::{debug, warn};
use wand_config::MotionConfig;

/// Why a candidate was or was not accepted
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionVerdict {
    /// No previous point, the candidate becomes the baseline
    Baseline,
    Accepted { speed: f32 },
    /// Moved faster than `max_trace_speed`: most likely a different bright spot
    TooFast { speed: f32 },
    /// Moved less than `min_step_px`
    Stationary,
    /// Zero or negative time since the previous point; wait for the next frame
    SameTick,
}

impl MotionVerdict {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Self::Baseline | Self::Accepted { .. })
    }

    pub fn speed(&self) -> Option<f32> {
        match self {
            Self::Accepted { speed } | Self::TooFast { speed } => Some(*speed),
            _ => None,
        }
    }
}

/// Speed gate between consecutive tip positions
#[derive(Debug, Clone)]
pub struct MotionFilter {
    max_speed: f32,
    min_step: f32,
}

impl MotionFilter {
    pub fn new(config: &MotionConfig) -> Self {
        Self {
            max_speed: config.max_trace_speed,
            min_step: config.min_step_px,
        }
    }

    /// `dt` is the time in seconds since `previous` was accepted.
    pub fn check(&self, candidate: &Point, previous: Option<&Point>, dt: f32) -> MotionVerdict {
        let Some(previous) = previous else {
            return MotionVerdict::Baseline;
        };
        if !(dt > 0.0) || !dt.is_finite() {
            return MotionVerdict::SameTick;
        }

        let distance = candidate.distance(previous);
        if distance < self.min_step {
            return MotionVerdict::Stationary;
        }

        let speed = distance / dt;
        if speed > self.max_speed {
            MotionVerdict::TooFast { speed }
        } else {
            MotionVerdict::Accepted { speed }
        }
    }

    /// Whether `candidate` may extend a trace whose last point is `previous`
    pub fn accept(&self, candidate: &Point, previous: Option<&Point>, dt: f32) -> bool {
        self.judge(candidate, previous, dt).is_accepted()
    }

    /// `check` plus logging of rejections
    pub fn judge(&self, candidate: &Point, previous: Option<&Point>, dt: f32) -> MotionVerdict {
        let verdict = self.check(candidate, previous, dt);
        match verdict {
            MotionVerdict::TooFast { speed } => {
                warn!("Excessive wand speed detected: {:.2} pixels/second", speed)
            }
            MotionVerdict::SameTick => debug!("Detection in the same tick as previous, skipped"),
            MotionVerdict::Stationary => debug!("Stationary tip ignored"),
            _ => {}
        }
        verdict
    }
}
