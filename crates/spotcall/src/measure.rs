//! Spot measurement extraction.
//!
//! For every labelled spot and every excitation channel, summarizes the spot's
//! pixels as RGB statistics (mean/median/std/min/max) plus HSV statistics
//! (mean/median/std). HSV is computed from pixel values normalized by the
//! source full scale, so hue and saturation do not depend on bit depth.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::base::{SpotId, Wavelength};
use crate::image_set::ImageSet;
use crate::mask::LabelMask;

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ExtractError {
    /// Image and mask dimensions disagree.
    ShapeMismatch { image: (u32, u32), mask: (u32, u32) },
}

impl std::fmt::Display for ExtractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ShapeMismatch { image, mask } => write!(
                f,
                "image set is {}x{} but spot mask is {}x{}",
                image.0, image.1, mask.0, mask.1
            ),
        }
    }
}

impl std::error::Error for ExtractError {}

// ── Types ──────────────────────────────────────────────────────────────────

/// Summary statistics of one spot in one excitation channel.
///
/// RGB values are in source pixel units; HSV components are in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpotStats {
    pub pixel_count: usize,
    pub mean_rgb: [f64; 3],
    pub median_rgb: [f64; 3],
    pub std_rgb: [f64; 3],
    pub min_rgb: [f64; 3],
    pub max_rgb: [f64; 3],
    pub mean_hsv: [f64; 3],
    pub median_hsv: [f64; 3],
    pub std_hsv: [f64; 3],
}

/// One row of the measurement table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasurementRow {
    pub spot: SpotId,
    pub cycle: u32,
    pub wavelength: Wavelength,
    /// Acquisition timestamp (image set average, or per channel in kinetic mode).
    pub time: Option<i64>,
    pub stats: SpotStats,
}

/// Destination for measurement rows as they are produced (e.g. a CSV file).
pub trait MeasurementSink {
    fn append(&mut self, row: &MeasurementRow) -> std::io::Result<()>;
}

/// Rows extracted from one image set.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub rows: Vec<MeasurementRow>,
    /// Rows the sink failed to persist. The rows are still in `rows`.
    pub sink_failures: usize,
}

// ── Color conversion ───────────────────────────────────────────────────────

/// Hexcone RGB→HSV for components in `[0, 1]`; hue is scaled to `[0, 1)`.
pub fn rgb_to_hsv(rgb: [f64; 3]) -> [f64; 3] {
    let [r, g, b] = rgb;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;
    let s = if max > 0.0 { delta / max } else { 0.0 };
    let h = if delta <= 0.0 {
        0.0
    } else if b == max {
        4.0 + (r - g) / delta
    } else if g == max {
        2.0 + (b - r) / delta
    } else {
        (g - b) / delta
    };
    [(h / 6.0).rem_euclid(1.0), s, max]
}

// ── Statistics ─────────────────────────────────────────────────────────────

fn median_of(values: &mut [f64]) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    values.sort_by(|a, b| a.total_cmp(b));
    let n = values.len();
    if n % 2 == 1 {
        values[n / 2]
    } else {
        0.5 * (values[n / 2 - 1] + values[n / 2])
    }
}

fn mean_std(values: &[f64]) -> (f64, f64) {
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Summarize a pixel population. `full_scale` normalizes values for HSV.
///
/// Returns `None` for an empty population.
pub fn stats_for_pixels(samples: &[[u16; 3]], full_scale: f64) -> Option<SpotStats> {
    if samples.is_empty() {
        return None;
    }
    let mut stats = SpotStats {
        pixel_count: samples.len(),
        mean_rgb: [0.0; 3],
        median_rgb: [0.0; 3],
        std_rgb: [0.0; 3],
        min_rgb: [0.0; 3],
        max_rgb: [0.0; 3],
        mean_hsv: [0.0; 3],
        median_hsv: [0.0; 3],
        std_hsv: [0.0; 3],
    };

    let hsv: Vec<[f64; 3]> = samples
        .iter()
        .map(|p| {
            rgb_to_hsv([
                p[0] as f64 / full_scale,
                p[1] as f64 / full_scale,
                p[2] as f64 / full_scale,
            ])
        })
        .collect();

    let mut buf = Vec::with_capacity(samples.len());
    for c in 0..3 {
        buf.clear();
        buf.extend(samples.iter().map(|p| p[c] as f64));
        let (mean, std) = mean_std(&buf);
        stats.mean_rgb[c] = mean;
        stats.std_rgb[c] = std;
        stats.min_rgb[c] = buf.iter().cloned().fold(f64::INFINITY, f64::min);
        stats.max_rgb[c] = buf.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        stats.median_rgb[c] = median_of(&mut buf);

        buf.clear();
        buf.extend(hsv.iter().map(|p| p[c]));
        let (mean, std) = mean_std(&buf);
        stats.mean_hsv[c] = mean;
        stats.std_hsv[c] = std;
        stats.median_hsv[c] = median_of(&mut buf);
    }
    Some(stats)
}

/// Gather the RGB values of the given linear pixel indices.
pub(crate) fn gather_pixels(raw: &[u16], indices: &[usize], out: &mut Vec<[u16; 3]>) {
    out.extend(
        indices
            .iter()
            .map(|&i| [raw[3 * i], raw[3 * i + 1], raw[3 * i + 2]]),
    );
}

// ── Extraction ─────────────────────────────────────────────────────────────

/// Extract per-spot, per-wavelength statistics for one cycle.
///
/// Spots without pixels in the mask are skipped. Rows are ordered by spot
/// then by the image set's channel order. Sink failures are logged and
/// counted; they never abort extraction.
pub fn extract_spot_measurements(
    images: &ImageSet,
    mask: &LabelMask,
    kinetic: bool,
    sink: Option<&mut dyn MeasurementSink>,
) -> Result<Extraction, ExtractError> {
    if images.dimensions() != mask.dimensions() {
        return Err(ExtractError::ShapeMismatch {
            image: images.dimensions(),
            mask: mask.dimensions(),
        });
    }

    let full_scale = images.depth().full_scale();
    let cycle = images.cycle();
    let time_avg = images.time_avg();
    let spots: Vec<SpotId> = mask.spot_ids().collect();

    let per_spot: Vec<Vec<MeasurementRow>> = spots
        .par_iter()
        .map(|&spot| {
            let Some(indices) = mask.pixels(spot) else {
                return Vec::new();
            };
            let mut samples = Vec::with_capacity(indices.len());
            images
                .channels()
                .iter()
                .filter_map(|ch| {
                    samples.clear();
                    gather_pixels(ch.image.as_raw(), indices, &mut samples);
                    let stats = stats_for_pixels(&samples, full_scale)?;
                    Some(MeasurementRow {
                        spot,
                        cycle,
                        wavelength: ch.wavelength.clone(),
                        time: if kinetic { ch.timestamp } else { time_avg },
                        stats,
                    })
                })
                .collect()
        })
        .collect();

    let rows: Vec<MeasurementRow> = per_spot.into_iter().flatten().collect();

    let mut sink_failures = 0usize;
    if let Some(sink) = sink {
        for row in &rows {
            if let Err(e) = sink.append(row) {
                sink_failures += 1;
                tracing::warn!(
                    "Failed to persist measurement {} cycle {} {}: {}",
                    row.spot,
                    row.cycle,
                    row.wavelength,
                    e
                );
            }
        }
    }

    tracing::info!(
        "Cycle {}: extracted {} rows from {} spots x {} channels",
        cycle,
        rows.len(),
        spots.len(),
        images.channels().len()
    );

    Ok(Extraction {
        rows,
        sink_failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{disk_mask, spot_image_set};
    use approx::assert_relative_eq;

    #[test]
    fn hsv_primary_colors() {
        assert_eq!(rgb_to_hsv([1.0, 0.0, 0.0]), [0.0, 1.0, 1.0]);
        let g = rgb_to_hsv([0.0, 1.0, 0.0]);
        assert_relative_eq!(g[0], 1.0 / 3.0, epsilon = 1e-12);
        let b = rgb_to_hsv([0.0, 0.0, 0.5]);
        assert_relative_eq!(b[0], 2.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(b[2], 0.5);
        // gray has no hue or saturation
        assert_eq!(rgb_to_hsv([0.4, 0.4, 0.4]), [0.0, 0.0, 0.4]);
        assert_eq!(rgb_to_hsv([0.0, 0.0, 0.0]), [0.0, 0.0, 0.0]);
        // magenta wraps around to 5/6
        let m = rgb_to_hsv([1.0, 0.0, 1.0]);
        assert_relative_eq!(m[0], 5.0 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn hsv_is_depth_independent() {
        let s8 = stats_for_pixels(&[[200, 100, 50]], 255.0).unwrap();
        let s16 = stats_for_pixels(&[[200 * 257, 100 * 257, 50 * 257]], 65535.0).unwrap();
        for c in 0..3 {
            assert_relative_eq!(s8.mean_hsv[c], s16.mean_hsv[c], epsilon = 1e-9);
        }
    }

    #[test]
    fn rgb_statistics() {
        let px = [[1, 10, 0], [2, 20, 0], [3, 30, 0], [10, 40, 0]];
        let s = stats_for_pixels(&px, 65535.0).unwrap();
        assert_eq!(s.pixel_count, 4);
        assert_relative_eq!(s.mean_rgb[0], 4.0);
        assert_relative_eq!(s.median_rgb[0], 2.5);
        assert_relative_eq!(s.median_rgb[1], 25.0);
        assert_relative_eq!(s.min_rgb[1], 10.0);
        assert_relative_eq!(s.max_rgb[0], 10.0);
        // population std of [10, 20, 30, 40]
        assert_relative_eq!(s.std_rgb[1], 125.0f64.sqrt(), epsilon = 1e-12);
        assert_relative_eq!(s.std_rgb[2], 0.0);
        assert!(stats_for_pixels(&[], 255.0).is_none());
    }

    struct FailingSink {
        attempts: usize,
    }

    impl MeasurementSink for FailingSink {
        fn append(&mut self, _row: &MeasurementRow) -> std::io::Result<()> {
            self.attempts += 1;
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
        }
    }

    #[test]
    fn extracts_rows_and_survives_sink_failures() {
        let spots = [([8.0, 8.0], 3.0), ([24.0, 8.0], 3.0)];
        let images = spot_image_set(
            3,
            32,
            16,
            &spots,
            &["445", "525"],
            &[
                vec![[100, 200, 300], [5, 5, 5]],
                vec![[7, 7, 7], [1000, 0, 0]],
            ],
        );
        let mask = disk_mask(32, 16, &spots);
        let mut sink = FailingSink { attempts: 0 };
        let out = extract_spot_measurements(&images, &mask, false, Some(&mut sink)).unwrap();

        assert_eq!(out.rows.len(), 4);
        assert_eq!(sink.attempts, 4);
        assert_eq!(out.sink_failures, 4);

        let r = &out.rows[0];
        assert_eq!(r.spot, SpotId(1));
        assert_eq!(r.cycle, 3);
        assert_eq!(r.wavelength, Wavelength::from("445"));
        assert_eq!(r.stats.mean_rgb, [100.0, 200.0, 300.0]);
        assert_eq!(r.time, images.time_avg());

        let r = &out.rows[3];
        assert_eq!(r.spot, SpotId(2));
        assert_eq!(r.wavelength, Wavelength::from("525"));
        assert_eq!(r.stats.mean_rgb, [1000.0, 0.0, 0.0]);
        assert_relative_eq!(r.stats.mean_hsv[0], 0.0);
    }

    #[test]
    fn kinetic_mode_uses_channel_timestamps() {
        let spots = [([4.0, 4.0], 2.0)];
        let images = spot_image_set(
            1,
            10,
            10,
            &spots,
            &["445", "525"],
            &[vec![[1, 1, 1]], vec![[2, 2, 2]]],
        );
        let mask = disk_mask(10, 10, &spots);
        let out = extract_spot_measurements(&images, &mask, true, None).unwrap();
        assert_eq!(out.rows[0].time, Some(1000));
        assert_eq!(out.rows[1].time, Some(1001));
    }

    #[test]
    fn mask_shape_mismatch_is_fatal() {
        let spots = [([4.0, 4.0], 2.0)];
        let images = spot_image_set(1, 10, 10, &spots, &["445"], &[vec![[1, 1, 1]]]);
        let mask = disk_mask(12, 10, &spots);
        let err = extract_spot_measurements(&images, &mask, false, None).unwrap_err();
        assert_eq!(
            err,
            ExtractError::ShapeMismatch {
                image: (10, 10),
                mask: (12, 10)
            }
        );
    }
}
