//! Phase correction.
//!
//! A strand that lags (probability `p`) adds no base in a cycle; one that
//! leads adds two (`q`) or three (`r`) bases. The (N+1)×(N+1) transition
//! matrix `P` carries `p` on the diagonal, `1 − p − q − r` on the first
//! super-diagonal, `q` on the second and `r` on the third. Row 0 of
//! `P^(t+1)` is the distribution of extension lengths after cycle `t`, so
//!
//! ```text
//! Q[i, t] = (P^(t+1))[0, i + 1]
//! ```
//!
//! is the share of the base at position `i` in the signal read at cycle
//! `t`. Observed per-base series are `X_obs = X_true · Q`; correction
//! multiplies by `Q⁻¹`.
//!
//! With `p = q = r = 0` every strand advances exactly one base per cycle
//! and `Q` is the identity.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::base::N_BASES;
use crate::basis::condition_number;

const SUM_TOLERANCE: f64 = 1e-12;

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum PhaseError {
    InvalidParameters(String),
    TooFewCycles(usize),
    /// `Q` is not invertible within the configured condition limit.
    Singular { condition: f64 },
    /// A series does not have one entry per modelled cycle.
    CycleCountMismatch { expected: usize, got: usize },
}

impl std::fmt::Display for PhaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidParameters(msg) => write!(f, "invalid phase parameters: {}", msg),
            Self::TooFewCycles(n) => write!(f, "phase model needs at least 1 cycle, got {}", n),
            Self::Singular { condition } => write!(
                f,
                "phase model singular (condition number {:.3e})",
                condition
            ),
            Self::CycleCountMismatch { expected, got } => write!(
                f,
                "series has {} cycles, phase model expects {}",
                got, expected
            ),
        }
    }
}

impl std::error::Error for PhaseError {}

// ── Parameters ─────────────────────────────────────────────────────────────

/// Lag / lead probabilities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseParams {
    /// No base added in a cycle.
    pub p: f64,
    /// Two bases added.
    pub q: f64,
    /// Three bases added.
    pub r: f64,
}

impl PhaseParams {
    pub fn new(p: f64, q: f64, r: f64) -> Self {
        Self { p, q, r }
    }

    pub fn validate(&self) -> Result<(), PhaseError> {
        for (name, v) in [("p", self.p), ("q", self.q), ("r", self.r)] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(PhaseError::InvalidParameters(format!(
                    "{} must be in [0, 1], got {}",
                    name, v
                )));
            }
        }
        let sum = self.p + self.q + self.r;
        if sum > 1.0 + SUM_TOLERANCE {
            return Err(PhaseError::InvalidParameters(format!(
                "p + q + r must be <= 1, got {}",
                sum
            )));
        }
        Ok(())
    }

    fn advance(&self) -> f64 {
        (1.0 - self.p - self.q - self.r).max(0.0)
    }

    fn key(&self) -> (u64, u64, u64) {
        (self.p.to_bits(), self.q.to_bits(), self.r.to_bits())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseConfig {
    #[serde(flatten)]
    pub params: PhaseParams,
    /// Largest accepted condition number of `Q`.
    pub max_condition_number: f64,
    /// Leave the last cycle out of post-phase outputs; its lead
    /// contributions were never observed.
    pub trim_last_cycle: bool,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        Self {
            params: PhaseParams::default(),
            max_condition_number: 1e10,
            trim_last_cycle: true,
        }
    }
}

// ── Model ──────────────────────────────────────────────────────────────────

/// The (N+1)×(N+1) transition matrix `P`.
pub fn transition_matrix(params: &PhaseParams, n_cycles: usize) -> DMatrix<f64> {
    let n = n_cycles + 1;
    DMatrix::from_fn(n, n, |i, j| match j as isize - i as isize {
        0 => params.p,
        1 => params.advance(),
        2 => params.q,
        3 => params.r,
        _ => 0.0,
    })
}

/// The N×N mixing matrix `Q`.
pub fn mixing_matrix(params: &PhaseParams, n_cycles: usize) -> DMatrix<f64> {
    let p = transition_matrix(params, n_cycles);
    let mut q = DMatrix::<f64>::zeros(n_cycles, n_cycles);
    let mut power = p.clone();
    for t in 0..n_cycles {
        if t > 0 {
            power = &power * &p;
        }
        for i in 0..n_cycles {
            q[(i, t)] = power[(0, i + 1)];
        }
    }
    q
}

/// Inverted phase model for one (p, q, r, N).
#[derive(Debug, Clone)]
pub struct PhaseModel {
    params: PhaseParams,
    n_cycles: usize,
    q: DMatrix<f64>,
    qinv: DMatrix<f64>,
    condition: f64,
}

impl PhaseModel {
    pub fn new(
        params: PhaseParams,
        n_cycles: usize,
        max_condition_number: f64,
    ) -> Result<Self, PhaseError> {
        params.validate()?;
        if n_cycles < 1 {
            return Err(PhaseError::TooFewCycles(n_cycles));
        }
        let q = mixing_matrix(&params, n_cycles);
        let condition = condition_number(&q);
        if !(condition <= max_condition_number) {
            return Err(PhaseError::Singular { condition });
        }
        let qinv = q
            .clone()
            .try_inverse()
            .ok_or(PhaseError::Singular { condition })?;
        if qinv.iter().any(|v| !v.is_finite()) {
            return Err(PhaseError::Singular { condition });
        }
        tracing::debug!(
            "Phase model p={} q={} r={} N={}: condition {:.3e}",
            params.p,
            params.q,
            params.r,
            n_cycles,
            condition
        );
        Ok(Self {
            params,
            n_cycles,
            q,
            qinv,
            condition,
        })
    }

    pub fn params(&self) -> PhaseParams {
        self.params
    }

    pub fn n_cycles(&self) -> usize {
        self.n_cycles
    }

    pub fn mixing(&self) -> &DMatrix<f64> {
        &self.q
    }

    pub fn inverse(&self) -> &DMatrix<f64> {
        &self.qinv
    }

    pub fn condition_number(&self) -> f64 {
        self.condition
    }

    fn apply(
        &self,
        m: &DMatrix<f64>,
        series: &[[f64; N_BASES]],
    ) -> Result<Vec<[f64; N_BASES]>, PhaseError> {
        if series.len() != self.n_cycles {
            return Err(PhaseError::CycleCountMismatch {
                expected: self.n_cycles,
                got: series.len(),
            });
        }
        // out[t][b] = Σ_i series[i][b] · m[i, t]
        Ok((0..self.n_cycles)
            .map(|t| {
                let mut out = [0.0; N_BASES];
                for (i, s) in series.iter().enumerate() {
                    let w = m[(i, t)];
                    for b in 0..N_BASES {
                        out[b] += s[b] * w;
                    }
                }
                out
            })
            .collect())
    }

    /// Undo phase mixing on one spot's per-cycle amounts.
    pub fn correct(&self, series: &[[f64; N_BASES]]) -> Result<Vec<[f64; N_BASES]>, PhaseError> {
        self.apply(&self.qinv, series)
    }

    /// Apply phase mixing (the forward model).
    pub fn forward(&self, series: &[[f64; N_BASES]]) -> Result<Vec<[f64; N_BASES]>, PhaseError> {
        self.apply(&self.q, series)
    }
}

/// Shared cache of inverted models keyed by (p, q, r, N).
#[derive(Debug, Default)]
pub struct PhaseModelCache {
    models: Mutex<HashMap<((u64, u64, u64), usize), Arc<PhaseModel>>>,
}

impl PhaseModelCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_build(
        &self,
        params: PhaseParams,
        n_cycles: usize,
        max_condition_number: f64,
    ) -> Result<Arc<PhaseModel>, PhaseError> {
        let key = (params.key(), n_cycles);
        if let Some(m) = self.lock().get(&key) {
            return Ok(Arc::clone(m));
        }
        let model = Arc::new(PhaseModel::new(params, n_cycles, max_condition_number)?);
        self.lock().insert(key, Arc::clone(&model));
        Ok(model)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<((u64, u64, u64), usize), Arc<PhaseModel>>> {
        // a panic while holding the lock leaves the map itself intact
        self.models.lock().unwrap_or_else(|e| e.into_inner())
    }
}
