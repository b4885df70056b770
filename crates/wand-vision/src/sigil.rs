use crate::geometry::BoundingBox;
use image::imageops::FilterType;
use image::GrayImage;
use tracing::debug;

/// Turn the part of `mask` inside `bounds` into a square classifier input.
///
/// The box is grown by `margin` and clamped to the mask, its edges included. The crop
/// is scaled uniformly to fit `output_size` and centered on a black canvas. Odd padding
/// leaves the extra pixel on the bottom/right. A box with no extent, or one outside the
/// mask, yields a blank canvas.
pub fn extract(mask: &GrayImage, bounds: &BoundingBox, margin: u32, output_size: u32) -> GrayImage {
    let mut canvas = GrayImage::new(output_size, output_size);
    if bounds.is_point() || output_size == 0 {
        debug!("Sigil box {:?} has no extent, returning blank canvas", bounds.as_tuple());
        return canvas;
    }

    let Some(crop_box) = bounds.expand(margin).clamp_to(mask.width(), mask.height()) else {
        debug!("Sigil box {:?} is outside the mask", bounds.as_tuple());
        return canvas;
    };

    let (cw, ch) = (crop_box.columns(), crop_box.rows());
    let crop = image::imageops::crop_imm(mask, crop_box.left as u32, crop_box.top as u32, cw, ch)
        .to_image();

    let scale = (output_size as f64 / cw as f64).min(output_size as f64 / ch as f64);
    let new_w = ((cw as f64 * scale) as u32).clamp(1, output_size);
    let new_h = ((ch as f64 * scale) as u32).clamp(1, output_size);
    let resized = image::imageops::resize(&crop, new_w, new_h, FilterType::Triangle);

    let pad_x = (output_size - new_w) / 2;
    let pad_y = (output_size - new_h) / 2;
    image::imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    canvas
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn mask_with_rect(w: u32, h: u32, r: BoundingBox) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let (x, y) = (x as i32, y as i32);
            if x >= r.left && x <= r.right && y >= r.top && y <= r.bottom {
                Luma([255])
            } else {
                Luma([0])
            }
        })
    }

    #[test]
    fn test_output_is_always_square() {
        let mask = GrayImage::new(640, 480);
        for bounds in [
            BoundingBox { left: 10, top: 10, right: 300, bottom: 40 },
            BoundingBox { left: 600, top: 5, right: 700, bottom: 470 },
            BoundingBox { left: 0, top: 0, right: 640, bottom: 480 },
            BoundingBox { left: 3, top: 3, right: 5, bottom: 200 },
        ] {
            let out = extract(&mask, &bounds, 10, 224);
            assert_eq!(out.dimensions(), (224, 224), "{:?}", bounds);
        }
    }

    #[test]
    fn test_degenerate_box_is_blank() {
        let mask = GrayImage::from_pixel(100, 100, Luma([255]));
        let bounds = BoundingBox { left: 50, top: 50, right: 50, bottom: 50 };
        let out = extract(&mask, &bounds, 0, 224);
        assert_eq!(out.dimensions(), (224, 224));
        assert!(out.pixels().all(|p| p[0] == 0));

        let outside = BoundingBox { left: 500, top: 500, right: 600, bottom: 600 };
        let out = extract(&mask, &outside, 5, 64);
        assert_eq!(out.dimensions(), (64, 64));
    }

    #[test]
    fn test_wide_crop_is_centered_vertically() {
        let content = BoundingBox { left: 20, top: 40, right: 219, bottom: 89 };
        let mask = mask_with_rect(300, 200, content);
        let out = extract(&mask, &content, 0, 100);

        // 200x50 scales to 100x25, padded 37 above and 38 below
        assert_eq!(out.get_pixel(50, 36)[0], 0);
        assert!(out.get_pixel(50, 50)[0] > 200);
        assert_eq!(out.get_pixel(50, 63)[0], 0);
    }

    #[test]
    fn test_edge_pixels_survive_without_margin() {
        // An L stroke whose last column and row sit exactly on the box edges
        let mut mask = GrayImage::new(50, 50);
        for x in 10..=30 {
            mask.put_pixel(x, 20, Luma([255]));
        }
        for y in 20..=30 {
            mask.put_pixel(30, y, Luma([255]));
        }
        let bounds = BoundingBox { left: 10, top: 20, right: 30, bottom: 30 };

        // 21x11 crop fits a 21 px canvas unscaled, 5 rows of padding above
        let out = extract(&mask, &bounds, 0, 21);
        assert_eq!(out.get_pixel(20, 10)[0], 255);
        assert_eq!(out.get_pixel(20, 15)[0], 255);
        assert_eq!(out.get_pixel(0, 5)[0], 255);
        assert_eq!(out.get_pixel(0, 15)[0], 0);
    }
}
