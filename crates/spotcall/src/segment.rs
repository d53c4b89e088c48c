//! Spot (ROI) detection on the UV reference channel.
//!
//! Pipeline: weighted gray conversion → 8-bit stretch → median filter →
//! mean threshold × scale → erosion / dilation with disk kernels → final
//! small erosion → 8-connected labelling → size filtering.
//!
//! Size filtering zeroes rejected spots without relabelling the survivors, so
//! spot IDs may have gaps. Downstream stages skip IDs with no pixels.

use std::collections::{HashMap, HashSet};

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::median_filter;
use imageproc::morphology::{dilate, erode};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::{Deserialize, Serialize};

use crate::base::Wavelength;
use crate::image_set::{ImageSet, Rgb16Image};
use crate::mask::{LabelImage, LabelMask};

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum SegmentError {
    InvalidConfig(String),
    MissingChannel(Wavelength),
}

impl std::fmt::Display for SegmentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid spot detection config: {}", msg),
            Self::MissingChannel(w) => {
                write!(f, "image set has no {} channel for spot detection", w)
            }
        }
    }
}

impl std::error::Error for SegmentError {}

// ── Config ─────────────────────────────────────────────────────────────────

/// Spot detection tuning (operator-adjustable).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoiDetectConfig {
    /// Median filter radius (pixels).
    pub median_ks: u32,
    /// Erosion disk radius (pixels).
    pub erode_ks: u32,
    /// Dilation disk radius (pixels).
    pub dilate_ks: u32,
    /// Radius of the final clean-up erosion (pixels).
    pub final_erode_ks: u32,
    /// Multiplier applied to the mean gray level to obtain the threshold.
    pub threshold_scale: f64,
    /// Spots smaller than this many pixels are discarded.
    pub min_size: Option<usize>,
    /// Spots larger than this many pixels are discarded.
    pub max_size: Option<usize>,
    /// Optional R, G, B weights for gray conversion (equal when unset).
    pub gray_weights: Option<[f64; 3]>,
}

impl Default for RoiDetectConfig {
    fn default() -> Self {
        Self {
            median_ks: 9,
            erode_ks: 16,
            dilate_ks: 13,
            final_erode_ks: 4,
            threshold_scale: 1.0,
            min_size: None,
            max_size: None,
            gray_weights: None,
        }
    }
}

impl RoiDetectConfig {
    pub fn validate(&self) -> Result<(), SegmentError> {
        for (name, v) in [
            ("erode_ks", self.erode_ks),
            ("dilate_ks", self.dilate_ks),
            ("final_erode_ks", self.final_erode_ks),
        ] {
            if v > u8::MAX as u32 {
                return Err(SegmentError::InvalidConfig(format!(
                    "{} must be <= 255, got {}",
                    name, v
                )));
            }
        }
        if !self.threshold_scale.is_finite() || self.threshold_scale <= 0.0 {
            return Err(SegmentError::InvalidConfig(
                "threshold_scale must be finite and > 0".to_string(),
            ));
        }
        if let (Some(lo), Some(hi)) = (self.min_size, self.max_size) {
            if lo > hi {
                return Err(SegmentError::InvalidConfig(format!(
                    "min_size ({}) exceeds max_size ({})",
                    lo, hi
                )));
            }
        }
        if let Some(w) = self.gray_weights {
            if w.iter().any(|v| !v.is_finite() || *v < 0.0) || w.iter().sum::<f64>() <= 0.0 {
                return Err(SegmentError::InvalidConfig(
                    "gray_weights must be non-negative with a positive sum".to_string(),
                ));
            }
        }
        Ok(())
    }
}

// ── Detection ──────────────────────────────────────────────────────────────

/// Result of one spot detection run.
#[derive(Debug, Clone)]
pub struct SpotDetection {
    pub mask: LabelMask,
    /// Connected components found before size filtering.
    pub n_candidates: usize,
    pub removed_too_large: usize,
    pub removed_too_small: usize,
}

impl SpotDetection {
    pub fn n_spots(&self) -> usize {
        self.mask.n_spots()
    }
}

/// Detect spots on the `uv` channel of an image set.
pub fn detect_spots(
    images: &ImageSet,
    uv: &Wavelength,
    config: &RoiDetectConfig,
) -> Result<SpotDetection, SegmentError> {
    let frame = images
        .get(uv)
        .ok_or_else(|| SegmentError::MissingChannel(uv.clone()))?;
    detect_spots_in_frame(frame, config)
}

/// Detect spots in a single RGB frame.
pub fn detect_spots_in_frame(
    frame: &Rgb16Image,
    config: &RoiDetectConfig,
) -> Result<SpotDetection, SegmentError> {
    config.validate()?;
    tracing::info!(
        "Detecting spots: median={}, erode={}, dilate={}, scale={}",
        config.median_ks,
        config.erode_ks,
        config.dilate_ks,
        config.threshold_scale
    );

    let gray = stretch_to_u8(frame, config.gray_weights);
    let filtered = if config.median_ks > 0 {
        median_filter(&gray, config.median_ks, config.median_ks)
    } else {
        gray
    };

    let binary = threshold_mean(&filtered, config.threshold_scale);
    let binary = morph(&binary, config.erode_ks, erode);
    let binary = morph(&binary, config.dilate_ks, dilate);
    let binary = morph(&binary, config.final_erode_ks, erode);

    let mut labels: LabelImage = connected_components(&binary, Connectivity::Eight, Luma([0u8]));

    let mut sizes: HashMap<u32, usize> = HashMap::new();
    for p in labels.pixels() {
        if p.0[0] != 0 {
            *sizes.entry(p.0[0]).or_default() += 1;
        }
    }
    let n_candidates = sizes.len();
    tracing::info!("{} spot candidates found", n_candidates);

    let mut rejected: HashSet<u32> = HashSet::new();
    let (mut too_large, mut too_small) = (0usize, 0usize);
    for (&label, &size) in &sizes {
        if config.max_size.is_some_and(|m| size > m) {
            tracing::debug!("Removing spot {} with area {} (too large)", label, size);
            rejected.insert(label);
            too_large += 1;
        } else if config.min_size.is_some_and(|m| size < m) {
            tracing::debug!("Removing spot {} with area {} (too small)", label, size);
            rejected.insert(label);
            too_small += 1;
        }
    }
    if !rejected.is_empty() {
        for p in labels.pixels_mut() {
            if rejected.contains(&p.0[0]) {
                p.0[0] = 0;
            }
        }
    }

    let mask = LabelMask::new(labels);
    tracing::info!(
        "{} spots kept ({} too large, {} too small)",
        mask.n_spots(),
        too_large,
        too_small
    );

    Ok(SpotDetection {
        mask,
        n_candidates,
        removed_too_large: too_large,
        removed_too_small: too_small,
    })
}

/// Weighted gray conversion, stretched so the brightest pixel maps to 255.
fn stretch_to_u8(frame: &Rgb16Image, weights: Option<[f64; 3]>) -> GrayImage {
    let w = weights.unwrap_or([1.0, 1.0, 1.0]);
    let wsum: f64 = w.iter().sum();
    let (width, height) = frame.dimensions();
    let gray: Vec<f64> = frame
        .pixels()
        .map(|p| (w[0] * p.0[0] as f64 + w[1] * p.0[1] as f64 + w[2] * p.0[2] as f64) / wsum)
        .collect();
    let max = gray.iter().cloned().fold(0.0f64, f64::max);
    let scale = if max > 0.0 { 255.0 / max } else { 0.0 };
    GrayImage::from_fn(width, height, |x, y| {
        let v = gray[y as usize * width as usize + x as usize] * scale;
        Luma([v.round().clamp(0.0, 255.0) as u8])
    })
}

fn threshold_mean(img: &GrayImage, scale: f64) -> GrayImage {
    let n = (img.width() as usize * img.height() as usize).max(1);
    let mean = img.pixels().map(|p| p.0[0] as f64).sum::<f64>() / n as f64;
    let thresh = scale * mean;
    GrayImage::from_fn(img.width(), img.height(), |x, y| {
        if img.get_pixel(x, y).0[0] as f64 > thresh {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

fn morph(img: &GrayImage, radius: u32, op: fn(&GrayImage, Norm, u8) -> GrayImage) -> GrayImage {
    if radius == 0 {
        return img.clone();
    }
    op(img, Norm::L2, radius as u8)
}
