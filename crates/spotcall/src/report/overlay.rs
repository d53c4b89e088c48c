//! Spot outline overlay on the UV reference frame.

use image::{Rgb, RgbImage};
use plotters::prelude::*;

use crate::image_set::Rgb16Image;
use crate::mask::LabelMask;

/// Stretch a 16-bit frame to 8 bits using its brightest sample.
pub fn stretch_to_8bit(frame: &Rgb16Image) -> RgbImage {
    let max = frame.pixels().flat_map(|p| p.0).max().unwrap_or(0).max(1) as f64;
    let (w, h) = frame.dimensions();
    RgbImage::from_fn(w, h, |x, y| {
        let p = frame.get_pixel(x, y).0;
        Rgb(p.map(|v| ((v as f64 / max) * 255.0).round().min(255.0) as u8))
    })
}

/// Paint spot boundary pixels over the stretched frame.
///
/// Frame and mask sizes must match; the overlapping region is used otherwise.
pub fn render_overlay(frame: &Rgb16Image, mask: &LabelMask, color: [u8; 3]) -> RgbImage {
    let mut out = stretch_to_8bit(frame);
    let (mw, mh) = mask.dimensions();
    let (w, h) = out.dimensions();
    for y in 0..h.min(mh) {
        for x in 0..w.min(mw) {
            if mask.is_boundary(x, y) {
                out.put_pixel(x, y, Rgb(color));
            }
        }
    }
    out
}

/// Write each spot ID at its centroid.
pub fn draw_spot_labels(
    img: &mut RgbImage,
    mask: &LabelMask,
    color: [u8; 3],
) -> Result<(), Box<dyn std::error::Error>> {
    let (w, h) = img.dimensions();
    let buf: &mut [u8] = img;
    let root = BitMapBackend::with_buffer(buf, (w, h)).into_drawing_area();
    let style = ("sans-serif", 12)
        .into_font()
        .color(&RGBColor(color[0], color[1], color[2]));
    for spot in mask.spot_ids() {
        let Some([cx, cy]) = mask.centroid(spot) else {
            continue;
        };
        root.draw(&Text::new(
            spot.0.to_string(),
            (cx.round() as i32, cy.round() as i32),
            style.clone(),
        ))?;
    }
    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::SpotId;
    use crate::test_utils::disk_mask;

    #[test]
    fn stretch_maps_max_to_255() {
        let mut frame = Rgb16Image::new(2, 1);
        frame.put_pixel(0, 0, Rgb([1000, 500, 0]));
        let out = stretch_to_8bit(&frame);
        assert_eq!(out.get_pixel(0, 0).0, [255, 128, 0]);
        assert_eq!(out.get_pixel(1, 0).0, [0, 0, 0]);
    }

    #[test]
    fn overlay_colors_only_boundaries() {
        let mask = disk_mask(40, 40, &[([20.0, 20.0], 6.0)]);
        let frame = Rgb16Image::from_pixel(40, 40, Rgb([100, 100, 100]));
        let out = render_overlay(&frame, &mask, [255, 0, 255]);

        let [cx, cy] = mask.centroid(SpotId(1)).unwrap();
        assert_eq!(out.get_pixel(cx as u32, cy as u32).0, [255, 255, 255]);
        assert_eq!(out.get_pixel(0, 0).0, [255, 255, 255]);
        let n_boundary = out.pixels().filter(|p| p.0 == [255, 0, 255]).count();
        assert!(n_boundary > 0);
        assert!(n_boundary < mask.pixel_count(SpotId(1)));
    }
}
