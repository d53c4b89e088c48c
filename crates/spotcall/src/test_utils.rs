//! Shared synthetic-data helpers for unit tests.

use image::{Luma, Rgb};

use crate::base::{SpotId, Wavelength};
use crate::basis::BasisSpots;
use crate::image_set::{ChannelImage, ImageSet, PixelDepth, Rgb16Image};
use crate::mask::{LabelImage, LabelMask};
use crate::segment::RoiDetectConfig;

fn inside(x: u32, y: u32, center: [f64; 2], radius: f64) -> bool {
    let dx = x as f64 - center[0];
    let dy = y as f64 - center[1];
    (dx * dx + dy * dy).sqrt() <= radius
}

/// Render filled disks of `spot_rgb` on a `bg_rgb` background.
pub(crate) fn draw_spot_frame(
    w: u32,
    h: u32,
    spots: &[([f64; 2], f64)],
    spot_rgb: [u16; 3],
    bg_rgb: [u16; 3],
) -> Rgb16Image {
    Rgb16Image::from_fn(w, h, |x, y| {
        if spots.iter().any(|&(c, r)| inside(x, y, c, r)) {
            Rgb(spot_rgb)
        } else {
            Rgb(bg_rgb)
        }
    })
}

/// Label mask with the i-th disk labelled `i + 1`.
pub(crate) fn disk_mask(w: u32, h: u32, spots: &[([f64; 2], f64)]) -> LabelMask {
    let labels = LabelImage::from_fn(w, h, |x, y| {
        let label = spots
            .iter()
            .position(|&(c, r)| inside(x, y, c, r))
            .map_or(0, |i| i as u32 + 1);
        Luma([label])
    });
    LabelMask::new(labels)
}

/// Build an image set where spot `i` has color `colors[wavelength][i]` in
/// each wavelength frame and the background is black.
pub(crate) fn spot_image_set(
    cycle: u32,
    w: u32,
    h: u32,
    spots: &[([f64; 2], f64)],
    wavelengths: &[&str],
    colors: &[Vec<[u16; 3]>],
) -> ImageSet {
    let channels = wavelengths
        .iter()
        .zip(colors)
        .enumerate()
        .map(|(k, (wl, per_spot))| ChannelImage {
            wavelength: Wavelength::from(*wl),
            image: Rgb16Image::from_fn(w, h, |x, y| {
                spots
                    .iter()
                    .position(|&(c, r)| inside(x, y, c, r))
                    .map_or(Rgb([0, 0, 0]), |i| Rgb(per_spot[i]))
            }),
            timestamp: Some(1000 + k as i64),
        })
        .collect();
    ImageSet::new(cycle, PixelDepth::Sixteen, channels).expect("synthetic image set is valid")
}

/// Four spots in a row on a 64x24 frame.
pub(crate) const ROW_SPOTS: [([f64; 2], f64); 4] = [
    ([8.0, 12.0], 5.0),
    ([24.0, 12.0], 5.0),
    ([40.0, 12.0], 5.0),
    ([56.0, 12.0], 5.0),
];

const CYCLE_WLS: [&str; 5] = ["365", "445", "525", "590", "645"];

/// Cycle image set of [`ROW_SPOTS`] where spot `s` shows base `bases[s]`:
/// every spot is bright at 365 and spot `s` is bright at the
/// `bases[s] + 1`-th visible wavelength.
pub(crate) fn base_cycle_set(cycle: u32, bases: [usize; 4]) -> ImageSet {
    let colors: Vec<Vec<[u16; 3]>> = (0..CYCLE_WLS.len())
        .map(|w| {
            (0..4)
                .map(|s| {
                    if w == 0 {
                        [3000; 3]
                    } else if bases[s] + 1 == w {
                        [2000; 3]
                    } else {
                        [100; 3]
                    }
                })
                .collect()
        })
        .collect();
    spot_image_set(cycle, 64, 24, &ROW_SPOTS, &CYCLE_WLS, &colors)
}

/// Detection kernels small enough for the synthetic frames.
pub(crate) fn small_roi_config() -> RoiDetectConfig {
    RoiDetectConfig {
        median_ks: 1,
        erode_ks: 1,
        dilate_ks: 1,
        final_erode_ks: 0,
        ..Default::default()
    }
}

/// Spot `i + 1` is the reference for base `i`.
pub(crate) fn one_spot_per_base() -> BasisSpots {
    BasisSpots {
        a: vec![SpotId(1)],
        c: vec![SpotId(2)],
        g: vec![SpotId(3)],
        t: vec![SpotId(4)],
    }
}
