use crate::geometry::Point;
use image::{GrayImage, Rgba, RgbaImage};
use imageproc::drawing::draw_hollow_circle_mut;

const MARKER_COLOR: Rgba<u8> = Rgba([0, 255, 0, 255]);
const MARKER_RADIUS: i32 = 5;

/// Debug view of a frame: the trace mask blended in red, detections ringed in green.
///
/// A mask of a different size than the frame is ignored.
pub fn render_overlay(
    frame: &RgbaImage,
    mask: &GrayImage,
    detections: &[Point],
    alpha: f32,
) -> RgbaImage {
    let mut out = frame.clone();
    let alpha = alpha.clamp(0.0, 1.0);

    if mask.dimensions() == frame.dimensions() {
        for (px, m) in out.pixels_mut().zip(mask.pixels()) {
            if m[0] > 0 {
                let red = px[0] as f32 + m[0] as f32 * alpha;
                px[0] = red.min(255.0) as u8;
            }
        }
    }

    for p in detections {
        let center = (p.x.round() as i32, p.y.round() as i32);
        for r in MARKER_RADIUS - 1..=MARKER_RADIUS + 1 {
            draw_hollow_circle_mut(&mut out, center, r, MARKER_COLOR);
        }
    }

    out
}
