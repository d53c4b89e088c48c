//! Basis (crosstalk) matrix construction.
//!
//! Each column is the expected feature response of a spot carrying only one
//! base, measured on operator-designated reference spots of the calibration
//! image set. The JSON form (`spotcall.basis.v1`) stores the matrix together
//! with its feature layout so observations can be rebuilt in the same order.

use std::path::Path;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::base::{Base, SpotId, Wavelength, N_BASES};
use crate::features::FeatureLayout;
use crate::image_set::ImageSet;
use crate::mask::LabelMask;
use crate::measure::{gather_pixels, stats_for_pixels};

pub const BASIS_SCHEMA_V1: &str = "spotcall.basis.v1";

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum BasisError {
    /// No reference spots were given for a base.
    EmptySpotList(Base),
    /// A reference spot has no pixels in the mask.
    UnknownSpot { base: Base, spot: SpotId },
    /// The layout names a wavelength the calibration set does not carry.
    MissingWavelength(Wavelength),
    /// Fewer feature rows than bases; the system cannot have rank 4.
    TooFewFeatures { features: usize },
    /// Matrix shape does not match the layout.
    ShapeMismatch {
        expected: (usize, usize),
        got: (usize, usize),
    },
    IllConditioned { condition: f64, max: f64 },
}

impl std::fmt::Display for BasisError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptySpotList(b) => write!(f, "no basis spots given for base {}", b),
            Self::UnknownSpot { base, spot } => {
                write!(f, "basis spot {} for base {} has no pixels in the mask", spot, base)
            }
            Self::MissingWavelength(w) => {
                write!(f, "calibration image set has no {} channel", w)
            }
            Self::TooFewFeatures { features } => write!(
                f,
                "basis needs at least {} feature rows, layout has {}",
                N_BASES, features
            ),
            Self::ShapeMismatch { expected, got } => write!(
                f,
                "basis matrix is {}x{}, expected {}x{}",
                got.0, got.1, expected.0, expected.1
            ),
            Self::IllConditioned { condition, max } => write!(
                f,
                "basis matrix is ill-conditioned (condition number {:.3e} > {:.3e})",
                condition, max
            ),
        }
    }
}

impl std::error::Error for BasisError {}

// ── Config / inputs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BasisConfig {
    /// Largest accepted ratio of extreme singular values.
    pub max_condition_number: f64,
}

impl Default for BasisConfig {
    fn default() -> Self {
        Self {
            max_condition_number: 1e6,
        }
    }
}

/// Operator-designated reference spots, one list per base.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasisSpots {
    #[serde(rename = "A")]
    pub a: Vec<SpotId>,
    #[serde(rename = "C")]
    pub c: Vec<SpotId>,
    #[serde(rename = "G")]
    pub g: Vec<SpotId>,
    #[serde(rename = "T")]
    pub t: Vec<SpotId>,
}

impl BasisSpots {
    pub fn for_base(&self, base: Base) -> &[SpotId] {
        match base {
            Base::A => &self.a,
            Base::C => &self.c,
            Base::G => &self.g,
            Base::T => &self.t,
        }
    }
}

// ── Basis matrix ───────────────────────────────────────────────────────────

/// Validated K×4 basis matrix (rows = layout features, columns = A, C, G, T).
#[derive(Debug, Clone, PartialEq)]
pub struct BasisMatrix {
    layout: FeatureLayout,
    matrix: DMatrix<f64>,
    condition_number: f64,
}

/// Ratio of the largest to the smallest singular value (infinite when
/// rank-deficient).
pub fn condition_number(m: &DMatrix<f64>) -> f64 {
    let sv = m.clone().svd(false, false).singular_values;
    let max = sv.iter().cloned().fold(0.0f64, f64::max);
    let min = sv.iter().cloned().fold(f64::INFINITY, f64::min);
    if !(min > 0.0) || !max.is_finite() {
        f64::INFINITY
    } else {
        max / min
    }
}

impl BasisMatrix {
    /// Validate shape and conditioning of an existing matrix.
    pub fn from_matrix(
        layout: FeatureLayout,
        matrix: DMatrix<f64>,
        max_condition_number: f64,
    ) -> Result<Self, BasisError> {
        if layout.len() < N_BASES {
            return Err(BasisError::TooFewFeatures {
                features: layout.len(),
            });
        }
        if matrix.shape() != (layout.len(), N_BASES) {
            return Err(BasisError::ShapeMismatch {
                expected: (layout.len(), N_BASES),
                got: matrix.shape(),
            });
        }
        let condition = condition_number(&matrix);
        if !(condition <= max_condition_number) {
            return Err(BasisError::IllConditioned {
                condition,
                max: max_condition_number,
            });
        }
        Ok(Self {
            layout,
            matrix,
            condition_number: condition,
        })
    }

    pub fn layout(&self) -> &FeatureLayout {
        &self.layout
    }

    pub fn matrix(&self) -> &DMatrix<f64> {
        &self.matrix
    }

    pub fn condition_number(&self) -> f64 {
        self.condition_number
    }

    pub fn n_features(&self) -> usize {
        self.matrix.nrows()
    }

    /// Serialize to the `spotcall.basis.v1` JSON form.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        let spec = BasisSpecV1 {
            schema: BASIS_SCHEMA_V1.to_string(),
            layout: self.layout.clone(),
            features: self.layout.feature_names(),
            rows: (0..self.matrix.nrows())
                .map(|r| self.matrix.row(r).iter().cloned().collect())
                .collect(),
            condition_number: self.condition_number,
        };
        serde_json::to_string_pretty(&spec)
    }

    pub fn save_json(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }

    /// Load a basis matrix written by [`BasisMatrix::save_json`].
    pub fn from_json_file(
        path: &Path,
        max_condition_number: f64,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data, max_condition_number)
    }

    pub fn from_json_str(
        data: &str,
        max_condition_number: f64,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let spec: BasisSpecV1 = serde_json::from_str(data)?;
        if spec.schema != BASIS_SCHEMA_V1 {
            return Err(format!(
                "unsupported basis schema '{}' (expected '{}')",
                spec.schema, BASIS_SCHEMA_V1
            )
            .into());
        }
        if let Some(bad) = spec.rows.iter().position(|r| r.len() != N_BASES) {
            return Err(format!("basis row {} must have {} entries", bad, N_BASES).into());
        }
        let k = spec.rows.len();
        let matrix = DMatrix::from_fn(k, N_BASES, |r, c| spec.rows[r][c]);
        Ok(Self::from_matrix(spec.layout, matrix, max_condition_number)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BasisSpecV1 {
    schema: String,
    layout: FeatureLayout,
    /// Informational row labels; ignored on load.
    #[serde(default)]
    features: Vec<String>,
    rows: Vec<Vec<f64>>,
    #[serde(default)]
    condition_number: f64,
}

/// Build the basis matrix from the calibration image set.
///
/// Column `b` is the feature vector of the pooled pixels of every reference
/// spot of base `b`.
pub fn build_basis_matrix(
    images: &ImageSet,
    mask: &LabelMask,
    spots: &BasisSpots,
    layout: &FeatureLayout,
    config: &BasisConfig,
) -> Result<BasisMatrix, BasisError> {
    if layout.len() < N_BASES {
        return Err(BasisError::TooFewFeatures {
            features: layout.len(),
        });
    }
    let frames = layout
        .wavelengths
        .iter()
        .map(|wl| {
            images
                .get(wl)
                .ok_or_else(|| BasisError::MissingWavelength(wl.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let full_scale = images.depth().full_scale();

    let mut matrix = DMatrix::<f64>::zeros(layout.len(), N_BASES);
    for base in Base::ALL {
        let ids = spots.for_base(base);
        if ids.is_empty() {
            return Err(BasisError::EmptySpotList(base));
        }
        let mut indices = Vec::new();
        for &spot in ids {
            let px = mask
                .pixels(spot)
                .ok_or(BasisError::UnknownSpot { base, spot })?;
            indices.extend_from_slice(px);
        }

        let mut column = Vec::with_capacity(layout.len());
        let mut samples = Vec::with_capacity(indices.len());
        for frame in &frames {
            samples.clear();
            gather_pixels(frame.as_raw(), &indices, &mut samples);
            // indices is non-empty: every spot in the list has pixels
            if let Some(stats) = stats_for_pixels(&samples, full_scale) {
                layout.push_features(&stats, &mut column);
            }
        }
        matrix.set_column(base.index(), &nalgebra::DVector::from_vec(column));
        tracing::debug!(
            "Basis column {}: {} spots, {} pixels",
            base,
            ids.len(),
            indices.len()
        );
    }

    let basis = BasisMatrix::from_matrix(layout.clone(), matrix, config.max_condition_number)?;
    tracing::info!(
        "Basis matrix built: {}x{}, condition number {:.3e}",
        basis.n_features(),
        N_BASES,
        basis.condition_number()
    );
    Ok(basis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{SignalChannels, SignalStatistic};
    use crate::test_utils::{disk_mask, spot_image_set};
    use approx::assert_relative_eq;

    const SPOTS: [([f64; 2], f64); 5] = [
        ([8.0, 8.0], 3.0),
        ([24.0, 8.0], 3.0),
        ([40.0, 8.0], 3.0),
        ([8.0, 24.0], 3.0),
        ([24.0, 24.0], 3.0),
    ];

    fn luma_layout(wls: &[&str]) -> FeatureLayout {
        FeatureLayout {
            wavelengths: wls.iter().map(|w| Wavelength::from(*w)).collect(),
            channels: SignalChannels::Luma,
            statistic: SignalStatistic::Mean,
        }
    }

    /// Spot i+1 lights up only in wavelength i (spot 5 duplicates spot 1).
    fn pure_channel_set() -> (ImageSet, LabelMask) {
        let wls = ["445", "525", "590", "645"];
        let colors: Vec<Vec<[u16; 3]>> = (0..4)
            .map(|w| {
                (0..SPOTS.len())
                    .map(|s| if s % 4 == w { [1000, 1000, 1000] } else { [0, 0, 0] })
                    .collect()
            })
            .collect();
        (
            spot_image_set(1, 48, 32, &SPOTS, &wls, &colors),
            disk_mask(48, 32, &SPOTS),
        )
    }

    fn diagonal_spots() -> BasisSpots {
        BasisSpots {
            a: vec![SpotId(1), SpotId(5)],
            c: vec![SpotId(2)],
            g: vec![SpotId(3)],
            t: vec![SpotId(4)],
        }
    }

    #[test]
    fn pure_channel_spots_give_scaled_identity() {
        let (images, mask) = pure_channel_set();
        let layout = luma_layout(&["445", "525", "590", "645"]);
        let basis =
            build_basis_matrix(&images, &mask, &diagonal_spots(), &layout, &BasisConfig::default())
                .unwrap();
        let expected = DMatrix::<f64>::identity(4, 4) * 1000.0;
        assert_relative_eq!(basis.matrix().clone(), expected, epsilon = 1e-9);
        assert_relative_eq!(basis.condition_number(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn configuration_errors() {
        let (images, mask) = pure_channel_set();
        let layout = luma_layout(&["445", "525", "590", "645"]);
        let cfg = BasisConfig::default();

        let mut spots = diagonal_spots();
        spots.g.clear();
        assert_eq!(
            build_basis_matrix(&images, &mask, &spots, &layout, &cfg),
            Err(BasisError::EmptySpotList(Base::G))
        );

        let mut spots = diagonal_spots();
        spots.t.push(SpotId(42));
        assert_eq!(
            build_basis_matrix(&images, &mask, &spots, &layout, &cfg),
            Err(BasisError::UnknownSpot {
                base: Base::T,
                spot: SpotId(42)
            })
        );

        let short = luma_layout(&["445", "525"]);
        assert!(matches!(
            build_basis_matrix(&images, &mask, &diagonal_spots(), &short, &cfg),
            Err(BasisError::TooFewFeatures { features: 2 })
        ));

        let missing = luma_layout(&["445", "525", "590", "700"]);
        assert_eq!(
            build_basis_matrix(&images, &mask, &diagonal_spots(), &missing, &cfg),
            Err(BasisError::MissingWavelength("700".into()))
        );
    }

    #[test]
    fn duplicate_columns_are_ill_conditioned() {
        let (images, mask) = pure_channel_set();
        let layout = luma_layout(&["445", "525", "590", "645"]);
        let mut spots = diagonal_spots();
        spots.c = vec![SpotId(1)];
        let err =
            build_basis_matrix(&images, &mask, &spots, &layout, &BasisConfig::default()).unwrap_err();
        assert!(matches!(err, BasisError::IllConditioned { .. }));
    }

    #[test]
    fn json_roundtrip_keeps_layout() {
        let layout = luma_layout(&["445", "525", "590", "645"]);
        let m = DMatrix::from_row_slice(
            4,
            4,
            &[
                1.0, 0.2, 0.0, 0.0, //
                0.1, 1.0, 0.3, 0.0, //
                0.0, 0.1, 1.0, 0.2, //
                0.0, 0.0, 0.1, 1.0,
            ],
        );
        let basis = BasisMatrix::from_matrix(layout, m, 1e6).unwrap();
        let json = basis.to_json().unwrap();
        assert!(json.contains(crate::BASIS_SCHEMA_V1));
        let back = BasisMatrix::from_json_str(&json, 1e6).unwrap();
        assert_eq!(back.layout(), basis.layout());
        assert_relative_eq!(back.matrix().clone(), basis.matrix().clone(), epsilon = 1e-12);

        let bad = json.replace(BASIS_SCHEMA_V1, "spotcall.basis.v0");
        let err = BasisMatrix::from_json_str(&bad, 1e6).unwrap_err();
        assert!(err.to_string().contains("unsupported basis schema"));
    }
}
