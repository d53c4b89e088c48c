//! Color unmixing: observation → non-negative base amounts.
//!
//! Two solvers are available. `Nnls` (the default) runs the Lawson–Hanson
//! active-set method and never returns negative amounts. `PseudoInverse`
//! multiplies by the Moore–Penrose pseudoinverse of the basis, computed once
//! per [`Unmixer`]; its amounts may be negative.

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};

use crate::base::N_BASES;
use crate::basis::BasisMatrix;

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum UnmixError {
    /// Observation length differs from the basis row count.
    DimensionMismatch { expected: usize, got: usize },
    /// The observation contains NaN or infinity.
    NonFinite,
    /// NNLS did not settle within the iteration cap.
    NonConvergence { iterations: usize },
    /// A linear solve inside the solver failed.
    Solve(String),
}

impl std::fmt::Display for UnmixError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DimensionMismatch { expected, got } => write!(
                f,
                "observation has {} features, basis expects {}",
                got, expected
            ),
            Self::NonFinite => write!(f, "observation contains non-finite values"),
            Self::NonConvergence { iterations } => {
                write!(f, "NNLS did not converge after {} iterations", iterations)
            }
            Self::Solve(msg) => write!(f, "linear solve failed: {}", msg),
        }
    }
}

impl std::error::Error for UnmixError {}

// ── Config ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmixMethod {
    #[default]
    Nnls,
    PseudoInverse,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnmixConfig {
    pub method: UnmixMethod,
    /// NNLS inner-iteration cap.
    pub max_iter: usize,
    /// NNLS optimality tolerance on the dual vector.
    pub tol: f64,
    /// Singular values below this are treated as zero by the pseudoinverse.
    pub pinv_eps: f64,
}

impl Default for UnmixConfig {
    fn default() -> Self {
        Self {
            method: UnmixMethod::Nnls,
            max_iter: 100,
            tol: 1e-10,
            pinv_eps: 1e-12,
        }
    }
}

// ── NNLS ───────────────────────────────────────────────────────────────────

fn least_squares_on(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    cols: &[usize],
) -> Result<DVector<f64>, UnmixError> {
    let sub = a.select_columns(cols);
    sub.svd(true, true)
        .solve(b, 1e-14)
        .map_err(|e| UnmixError::Solve(e.to_string()))
}

/// Solve `min ‖A·x − b‖²` subject to `x ≥ 0` (Lawson–Hanson).
pub fn nnls(
    a: &DMatrix<f64>,
    b: &DVector<f64>,
    max_iter: usize,
    tol: f64,
) -> Result<DVector<f64>, UnmixError> {
    if a.nrows() != b.len() {
        return Err(UnmixError::DimensionMismatch {
            expected: a.nrows(),
            got: b.len(),
        });
    }
    if b.iter().any(|v| !v.is_finite()) {
        return Err(UnmixError::NonFinite);
    }

    let n = a.ncols();
    // dual-vector threshold in the units of A^T b
    let w_tol = tol * a.norm().max(1.0) * b.norm().max(1.0);
    let mut x = DVector::<f64>::zeros(n);
    let mut passive = vec![false; n];
    let mut iterations = 0usize;

    loop {
        let w = a.tr_mul(&(b - a * &x));
        let next = (0..n)
            .filter(|&j| !passive[j] && w[j] > w_tol)
            .max_by(|&i, &j| w[i].total_cmp(&w[j]));
        let Some(j) = next else {
            break;
        };
        passive[j] = true;

        loop {
            iterations += 1;
            if iterations > max_iter {
                return Err(UnmixError::NonConvergence { iterations: max_iter });
            }
            let cols: Vec<usize> = (0..n).filter(|&i| passive[i]).collect();
            let zp = least_squares_on(a, b, &cols)?;
            let mut z = DVector::<f64>::zeros(n);
            for (k, &i) in cols.iter().enumerate() {
                z[i] = zp[k];
            }

            if cols.iter().all(|&i| z[i] > 0.0) {
                x = z;
                break;
            }

            // step back to the boundary of the feasible region
            let alpha = cols
                .iter()
                .filter(|&&i| z[i] <= 0.0)
                .map(|&i| x[i] / (x[i] - z[i]))
                .fold(f64::INFINITY, f64::min);
            let step = (z - &x) * alpha;
            x += step;
            for &i in &cols {
                if x[i] <= tol {
                    x[i] = 0.0;
                    passive[i] = false;
                }
            }
        }
    }
    Ok(x)
}

// ── Unmixer ────────────────────────────────────────────────────────────────

/// Unmixing bound to one basis matrix.
#[derive(Debug, Clone)]
pub struct Unmixer {
    basis: DMatrix<f64>,
    pinv: Option<DMatrix<f64>>,
    config: UnmixConfig,
}

impl Unmixer {
    pub fn new(basis: &BasisMatrix, config: &UnmixConfig) -> Result<Self, UnmixError> {
        let m = basis.matrix().clone();
        let pinv = match config.method {
            UnmixMethod::Nnls => None,
            UnmixMethod::PseudoInverse => Some(
                m.clone()
                    .pseudo_inverse(config.pinv_eps)
                    .map_err(|e| UnmixError::Solve(e.to_string()))?,
            ),
        };
        Ok(Self {
            basis: m,
            pinv,
            config: config.clone(),
        })
    }

    pub fn method(&self) -> UnmixMethod {
        self.config.method
    }

    pub fn n_features(&self) -> usize {
        self.basis.nrows()
    }

    /// Base amounts (A, C, G, T) explaining one observation.
    pub fn unmix(&self, observation: &DVector<f64>) -> Result<[f64; N_BASES], UnmixError> {
        if observation.len() != self.basis.nrows() {
            return Err(UnmixError::DimensionMismatch {
                expected: self.basis.nrows(),
                got: observation.len(),
            });
        }
        if observation.iter().any(|v| !v.is_finite()) {
            return Err(UnmixError::NonFinite);
        }
        let x = match &self.pinv {
            Some(pinv) => pinv * observation,
            None => nnls(&self.basis, observation, self.config.max_iter, self.config.tol)?,
        };
        let mut out = [0.0; N_BASES];
        out.copy_from_slice(x.as_slice());
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{FeatureLayout, SignalChannels, SignalStatistic};
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn layout(k: usize) -> FeatureLayout {
        FeatureLayout {
            wavelengths: (0..k).map(|i| format!("{}", 400 + 50 * i).as_str().into()).collect(),
            channels: SignalChannels::Luma,
            statistic: SignalStatistic::Mean,
        }
    }

    fn basis(m: DMatrix<f64>) -> BasisMatrix {
        BasisMatrix::from_matrix(layout(m.nrows()), m, 1e6).unwrap()
    }

    fn crosstalk_matrix(rng: &mut StdRng, k: usize) -> DMatrix<f64> {
        DMatrix::from_fn(k, 4, |r, c| {
            let diag = if r % 4 == c { 1.0 } else { 0.0 };
            diag + rng.gen_range(0.0..0.3)
        })
    }

    #[test]
    fn identity_basis_is_exact() {
        let u = Unmixer::new(&basis(DMatrix::identity(4, 4)), &UnmixConfig::default()).unwrap();
        let x = u.unmix(&DVector::from_vec(vec![0.7, 0.2, 0.05, 0.05])).unwrap();
        for (got, want) in x.iter().zip([0.7, 0.2, 0.05, 0.05]) {
            assert_relative_eq!(*got, want, epsilon = 1e-12);
        }
    }

    #[test]
    fn nnls_roundtrip_on_random_bases() {
        let mut rng = StdRng::seed_from_u64(42);
        for trial in 0..50 {
            let k = if trial % 2 == 0 { 4 } else { 12 };
            let m = crosstalk_matrix(&mut rng, k);
            let truth = DVector::from_fn(4, |i, _| {
                if rng.gen_bool(0.25) && i != 0 {
                    0.0
                } else {
                    rng.gen_range(0.0..1000.0)
                }
            });
            let obs = &m * &truth;
            let x = nnls(&m, &obs, 100, 1e-10).unwrap();
            for i in 0..4 {
                assert_relative_eq!(x[i], truth[i], epsilon = 1e-6, max_relative = 1e-8);
            }
        }
    }

    #[test]
    fn nnls_clamps_where_least_squares_goes_negative() {
        let a = DMatrix::identity(4, 4);
        let b = DVector::from_vec(vec![1.0, -1.0, 0.5, 0.0]);
        let x = nnls(&a, &b, 100, 1e-12).unwrap();
        for (got, want) in x.iter().zip([1.0, 0.0, 0.5, 0.0]) {
            assert_relative_eq!(*got, want, epsilon = 1e-12);
        }

        let u = Unmixer::new(
            &basis(DMatrix::identity(4, 4)),
            &UnmixConfig {
                method: UnmixMethod::PseudoInverse,
                ..Default::default()
            },
        )
        .unwrap();
        let y = u.unmix(&b).unwrap();
        assert_relative_eq!(y[1], -1.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_observation_gives_zero_amounts() {
        let mut rng = StdRng::seed_from_u64(3);
        let m = crosstalk_matrix(&mut rng, 8);
        let x = nnls(&m, &DVector::zeros(8), 100, 1e-10).unwrap();
        assert!(x.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn pinv_matches_nnls_for_interior_solutions() {
        let mut rng = StdRng::seed_from_u64(11);
        let m = crosstalk_matrix(&mut rng, 12);
        let b = basis(m.clone());
        let nn = Unmixer::new(&b, &UnmixConfig::default()).unwrap();
        let pi = Unmixer::new(
            &b,
            &UnmixConfig {
                method: UnmixMethod::PseudoInverse,
                ..Default::default()
            },
        )
        .unwrap();
        let obs = &m * DVector::from_vec(vec![10.0, 20.0, 30.0, 40.0]);
        let (x, y) = (nn.unmix(&obs).unwrap(), pi.unmix(&obs).unwrap());
        for i in 0..4 {
            assert_relative_eq!(x[i], y[i], epsilon = 1e-8);
        }
    }

    #[test]
    fn rejects_bad_observations() {
        let u = Unmixer::new(&basis(DMatrix::identity(4, 4)), &UnmixConfig::default()).unwrap();
        assert_eq!(
            u.unmix(&DVector::zeros(3)),
            Err(UnmixError::DimensionMismatch { expected: 4, got: 3 })
        );
        assert_eq!(
            u.unmix(&DVector::from_vec(vec![1.0, f64::NAN, 0.0, 0.0])),
            Err(UnmixError::NonFinite)
        );
    }

    #[test]
    fn iteration_cap_is_reported() {
        let mut rng = StdRng::seed_from_u64(5);
        let m = crosstalk_matrix(&mut rng, 8);
        let obs = &m * DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(
            nnls(&m, &obs, 1, 1e-10),
            Err(UnmixError::NonConvergence { iterations: 1 })
        );
    }
}
