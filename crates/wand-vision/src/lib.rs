pub mod detector;
pub mod geometry;
pub mod motion;
pub mod overlay;
pub mod preprocess;
pub mod sigil;
pub mod trace;

pub use detector::{PointDetector, TipDetector};
pub use geometry::{BoundingBox, Point};
pub use motion::{MotionFilter, MotionVerdict};
pub use overlay::render_overlay;
pub use preprocess::{Preprocessed, Preprocessor};
pub use trace::{Observation, TraceAccumulator, TracePoint, TraceState};
