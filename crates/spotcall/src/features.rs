//! Feature layout: which per-spot statistics form an observation vector.
//!
//! The layout fixes the row order of the basis matrix and of every
//! observation built from the measurement table. Rows are grouped by
//! wavelength, then by color channel.

use serde::{Deserialize, Serialize};

use crate::base::Wavelength;
use crate::measure::SpotStats;

/// Color channels contributing features for each wavelength.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalChannels {
    /// R, G and B: three features per wavelength.
    #[default]
    Rgb,
    /// Mean of R, G and B: one feature per wavelength.
    Luma,
}

impl SignalChannels {
    pub fn per_wavelength(self) -> usize {
        match self {
            Self::Rgb => 3,
            Self::Luma => 1,
        }
    }
}

/// Per-spot statistic used as the feature value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalStatistic {
    #[default]
    Mean,
    Median,
}

/// Feature extraction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Dark reference channel, subtracted from the others and then dropped.
    pub dark_wavelength: Wavelength,
    /// UV channel used for spot detection.
    pub uv_wavelength: Wavelength,
    pub channels: SignalChannels,
    pub statistic: SignalStatistic,
    /// Wavelengths forming the observation, in order. When unset, every
    /// measured wavelength except the dark reference is used in sorted order.
    pub basis_wavelengths: Option<Vec<Wavelength>>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            dark_wavelength: Wavelength::from("000"),
            uv_wavelength: Wavelength::from("365"),
            channels: SignalChannels::Rgb,
            statistic: SignalStatistic::Mean,
            basis_wavelengths: None,
        }
    }
}

impl FeatureConfig {
    /// Resolve the layout against the wavelengths actually measured.
    pub fn layout_for(&self, available: &[Wavelength]) -> FeatureLayout {
        let wavelengths = match &self.basis_wavelengths {
            Some(list) => list.clone(),
            None => {
                let mut wl: Vec<Wavelength> = available
                    .iter()
                    .filter(|w| **w != self.dark_wavelength)
                    .cloned()
                    .collect();
                wl.sort();
                wl.dedup();
                wl
            }
        };
        FeatureLayout {
            wavelengths,
            channels: self.channels,
            statistic: self.statistic,
        }
    }
}

/// Ordered feature definition shared by the basis and the observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureLayout {
    pub wavelengths: Vec<Wavelength>,
    pub channels: SignalChannels,
    pub statistic: SignalStatistic,
}

impl FeatureLayout {
    /// Number of features (K).
    pub fn len(&self) -> usize {
        self.wavelengths.len() * self.channels.per_wavelength()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Human-readable feature names, e.g. `445_R`.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.len());
        for wl in &self.wavelengths {
            match self.channels {
                SignalChannels::Rgb => {
                    for c in ["R", "G", "B"] {
                        names.push(format!("{}_{}", wl, c));
                    }
                }
                SignalChannels::Luma => names.push(format!("{}_L", wl)),
            }
        }
        names
    }

    /// Features of one wavelength, appended to `out`.
    pub fn push_features(&self, stats: &SpotStats, out: &mut Vec<f64>) {
        let rgb = match self.statistic {
            SignalStatistic::Mean => stats.mean_rgb,
            SignalStatistic::Median => stats.median_rgb,
        };
        match self.channels {
            SignalChannels::Rgb => out.extend_from_slice(&rgb),
            SignalChannels::Luma => out.push((rgb[0] + rgb[1] + rgb[2]) / 3.0),
        }
    }

    /// True when the set of wavelengths matches `other` regardless of order.
    pub fn covers_exactly(&self, other: &[Wavelength]) -> bool {
        let mut a = self.wavelengths.clone();
        let mut b = other.to_vec();
        a.sort();
        b.sort();
        a.dedup();
        b.dedup();
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::measure::stats_for_pixels;

    #[test]
    fn default_layout_drops_dark_and_sorts() {
        let cfg = FeatureConfig::default();
        let layout = cfg.layout_for(&["525".into(), "000".into(), "445".into(), "365".into()]);
        assert_eq!(
            layout.wavelengths,
            vec![Wavelength::from("365"), "445".into(), "525".into()]
        );
        assert_eq!(layout.len(), 9);
        assert_eq!(layout.feature_names()[3], "445_R");
    }

    #[test]
    fn luma_and_median_features() {
        let stats = stats_for_pixels(&[[30, 60, 90], [10, 20, 30], [20, 40, 60]], 255.0).unwrap();
        let layout = FeatureLayout {
            wavelengths: vec!["445".into()],
            channels: SignalChannels::Luma,
            statistic: SignalStatistic::Median,
        };
        let mut out = Vec::new();
        layout.push_features(&stats, &mut out);
        assert_eq!(out, vec![40.0]);
        assert_eq!(layout.feature_names(), vec!["445_L".to_string()]);
    }

    #[test]
    fn explicit_wavelength_list_is_kept() {
        let cfg = FeatureConfig {
            basis_wavelengths: Some(vec!["525".into(), "445".into()]),
            ..Default::default()
        };
        let layout = cfg.layout_for(&[]);
        assert_eq!(layout.wavelengths, vec![Wavelength::from("525"), "445".into()]);
        assert!(layout.covers_exactly(&["445".into(), "525".into()]));
        assert!(!layout.covers_exactly(&["445".into()]));
    }
}
