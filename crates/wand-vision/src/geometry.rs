use serde::{Deserialize, Serialize};

/// A candidate wand-tip position in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
    /// Apparent diameter in pixels, 0 when unknown
    pub size: f32,
    /// Detector confidence, higher is better
    pub score: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self {
            x,
            y,
            size: 0.0,
            score: 0.0,
        }
    }

    pub fn with_shape(x: f32, y: f32, size: f32, score: f32) -> Self {
        Self { x, y, size, score }
    }

    pub fn distance(&self, other: &Point) -> f32 {
        (self.x - other.x).hypot(self.y - other.y)
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Pull the point inside a `width` x `height` frame
    pub fn clamped(&self, width: u32, height: u32) -> Self {
        let max_x = width.saturating_sub(1) as f32;
        let max_y = height.saturating_sub(1) as f32;
        Self {
            x: self.x.clamp(0.0, max_x),
            y: self.y.clamp(0.0, max_y),
            ..*self
        }
    }
}

/// Axis-aligned box in pixel coordinates. `right` and `bottom` are the last covered
/// column and row, so a box around one point has no extent but still covers a pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl BoundingBox {
    /// Smallest box containing every point, `None` for no points
    pub fn enclosing<'a, I>(points: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a Point>,
    {
        points.into_iter().fold(None, |acc, p| {
            let (x, y) = (p.x as i32, p.y as i32);
            Some(match acc {
                None => Self {
                    left: x,
                    top: y,
                    right: x,
                    bottom: y,
                },
                Some(b) => Self {
                    left: b.left.min(x),
                    top: b.top.min(y),
                    right: b.right.max(x),
                    bottom: b.bottom.max(y),
                },
            })
        })
    }

    pub fn expand(&self, margin: u32) -> Self {
        let m = margin.min(i32::MAX as u32) as i32;
        Self {
            left: self.left.saturating_sub(m),
            top: self.top.saturating_sub(m),
            right: self.right.saturating_add(m),
            bottom: self.bottom.saturating_add(m),
        }
    }

    /// Restrict the box to the pixels of a `width` x `height` frame. `None` when the
    /// two do not overlap.
    pub fn clamp_to(&self, width: u32, height: u32) -> Option<Self> {
        if width == 0 || height == 0 || self.right < self.left || self.bottom < self.top {
            return None;
        }
        let max_x = (width - 1).min(i32::MAX as u32) as i32;
        let max_y = (height - 1).min(i32::MAX as u32) as i32;
        if self.right < 0 || self.bottom < 0 || self.left > max_x || self.top > max_y {
            return None;
        }
        Some(Self {
            left: self.left.max(0),
            top: self.top.max(0),
            right: self.right.min(max_x),
            bottom: self.bottom.min(max_y),
        })
    }

    /// Horizontal extent, 0 for a single column
    pub fn width(&self) -> u32 {
        (self.right - self.left).max(0) as u32
    }

    pub fn height(&self) -> u32 {
        (self.bottom - self.top).max(0) as u32
    }

    /// Columns covered, `right` included
    pub fn columns(&self) -> u32 {
        self.width() + 1
    }

    pub fn rows(&self) -> u32 {
        self.height() + 1
    }

    /// No extent in either direction, e.g. the box of a single point
    pub fn is_point(&self) -> bool {
        self.width() == 0 && self.height() == 0
    }

    pub fn as_tuple(&self) -> (i32, i32, i32, i32) {
        (self.left, self.top, self.right, self.bottom)
    }
}
