//! Pipeline orchestrator: observations → unmix → phase correction → calls.

use std::collections::BTreeSet;
use std::sync::Arc;

use rayon::prelude::*;

use super::result::{BaseCallingResult, UnitFailure};
use crate::base::{SpotId, Wavelength, N_BASES};
use crate::basis::BasisMatrix;
use crate::call::{CallRecord, IndeterminateReason};
use crate::phase::{PhaseConfig, PhaseError, PhaseModel, PhaseModelCache};
use crate::table::MeasurementTable;
use crate::unmix::{UnmixConfig, UnmixError, Unmixer};

// ── Error type ─────────────────────────────────────────────────────────────

/// Failures that abort a whole base-calling run.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineError {
    EmptyTable,
    /// The table holds no cycle after the calibration cycle.
    NoSequencingCycles,
    /// Basis wavelengths absent from the measurement table.
    MissingWavelengths(Vec<Wavelength>),
    Unmix(UnmixError),
    Phase(PhaseError),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyTable => write!(f, "measurement table is empty"),
            Self::NoSequencingCycles => write!(f, "no sequencing cycles (>= 1) measured"),
            Self::MissingWavelengths(wls) => {
                let names: Vec<&str> = wls.iter().map(Wavelength::as_str).collect();
                write!(
                    f,
                    "measurement table lacks basis wavelengths: {}",
                    names.join(", ")
                )
            }
            Self::Unmix(e) => write!(f, "unmixing: {}", e),
            Self::Phase(e) => write!(f, "phase correction: {}", e),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<UnmixError> for PipelineError {
    fn from(e: UnmixError) -> Self {
        Self::Unmix(e)
    }
}

impl From<PhaseError> for PipelineError {
    fn from(e: PhaseError) -> Self {
        Self::Phase(e)
    }
}

// ── Orchestrator ───────────────────────────────────────────────────────────

/// Base caller bound to one basis matrix.
#[derive(Debug, Clone)]
pub struct BaseCaller {
    basis: BasisMatrix,
    unmixer: Unmixer,
    phase: PhaseConfig,
    cache: Arc<PhaseModelCache>,
}

struct SpotOutcome {
    pre: Vec<CallRecord>,
    post: Vec<CallRecord>,
    failures: Vec<UnitFailure>,
}

impl BaseCaller {
    pub fn new(
        basis: BasisMatrix,
        unmix: &UnmixConfig,
        phase: &PhaseConfig,
    ) -> Result<Self, PipelineError> {
        phase.params.validate()?;
        let unmixer = Unmixer::new(&basis, unmix)?;
        Ok(Self {
            basis,
            unmixer,
            phase: phase.clone(),
            cache: Arc::new(PhaseModelCache::new()),
        })
    }

    pub fn basis(&self) -> &BasisMatrix {
        &self.basis
    }

    pub fn phase_config(&self) -> &PhaseConfig {
        &self.phase
    }

    /// Replace the phase parameters; cached models stay valid.
    pub fn set_phase(&mut self, phase: &PhaseConfig) -> Result<(), PipelineError> {
        phase.params.validate()?;
        self.phase = phase.clone();
        Ok(())
    }

    /// Compute pre- and post-phase calls for every spot and cycle `1..=max`.
    pub fn call(&self, table: &MeasurementTable) -> Result<BaseCallingResult, PipelineError> {
        if table.is_empty() {
            return Err(PipelineError::EmptyTable);
        }
        self.check_wavelengths(table)?;
        let n_cycles = match table.max_cycle() {
            Some(c) if c >= 1 => c as usize,
            _ => return Err(PipelineError::NoSequencingCycles),
        };
        let (model, phase_error) = match self.cache.get_or_build(
            self.phase.params,
            n_cycles,
            self.phase.max_condition_number,
        ) {
            Ok(model) => (Some(model), None),
            Err(e) => {
                tracing::warn!("Phase correction skipped: {}", e);
                (None, Some(e))
            }
        };
        let n_post = if self.phase.trim_last_cycle && n_cycles > 1 {
            n_cycles - 1
        } else {
            n_cycles
        };

        let spots = table.spots();
        let outcomes: Vec<SpotOutcome> = spots
            .par_iter()
            .map(|&spot| self.call_spot(table, spot, n_cycles, n_post, model.as_deref()))
            .collect::<Result<_, _>>()?;

        let mut result = BaseCallingResult {
            spots,
            n_cycles,
            pre: Vec::with_capacity(outcomes.len() * n_cycles),
            post: Vec::with_capacity(outcomes.len() * n_post),
            failures: Vec::new(),
            phase_error,
        };
        for o in outcomes {
            result.pre.extend(o.pre);
            result.post.extend(o.post);
            result.failures.extend(o.failures);
        }
        for f in &result.failures {
            tracing::debug!("{} cycle {}: {}", f.spot, f.cycle, f.message);
        }
        tracing::info!(
            "Base calling: {} spots x {} cycles, {} failed units, {}/{} indeterminate pre/post",
            result.spots.len(),
            n_cycles,
            result.failures.len(),
            result.n_indeterminate(false),
            result.n_indeterminate(true)
        );
        Ok(result)
    }

    fn check_wavelengths(&self, table: &MeasurementTable) -> Result<(), PipelineError> {
        let present: BTreeSet<Wavelength> = table.wavelengths().into_iter().collect();
        let wanted = &self.basis.layout().wavelengths;
        let missing: Vec<Wavelength> = wanted
            .iter()
            .filter(|w| !present.contains(*w))
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(PipelineError::MissingWavelengths(missing));
        }
        for extra in present.iter().filter(|w| !wanted.contains(w)) {
            tracing::warn!("Wavelength {} is measured but not part of the basis", extra);
        }
        Ok(())
    }

    fn call_spot(
        &self,
        table: &MeasurementTable,
        spot: SpotId,
        n_cycles: usize,
        n_post: usize,
        model: Option<&PhaseModel>,
    ) -> Result<SpotOutcome, PipelineError> {
        let layout = self.basis.layout();
        let mut out = SpotOutcome {
            pre: Vec::with_capacity(n_cycles),
            post: Vec::with_capacity(n_post),
            failures: Vec::new(),
        };
        let mut series: Vec<Option<[f64; N_BASES]>> = Vec::with_capacity(n_cycles);

        for cycle in 1..=n_cycles as u32 {
            let observation = match table.observation(spot, cycle, layout) {
                Ok(obs) => obs,
                Err(e) => {
                    out.failures.push(UnitFailure {
                        spot,
                        cycle,
                        message: e.to_string(),
                    });
                    out.pre.push(CallRecord::indeterminate(
                        spot,
                        cycle,
                        IndeterminateReason::MissingMeasurement,
                    ));
                    series.push(None);
                    continue;
                }
            };
            match self.unmixer.unmix(&observation) {
                Ok(signal) => {
                    out.pre.push(CallRecord::from_signal(spot, cycle, signal));
                    series.push(Some(signal));
                }
                Err(e @ UnmixError::DimensionMismatch { .. }) => return Err(e.into()),
                Err(e) => {
                    let reason = match e {
                        UnmixError::NonFinite => IndeterminateReason::NonFinite,
                        _ => IndeterminateReason::UnmixFailed,
                    };
                    out.failures.push(UnitFailure {
                        spot,
                        cycle,
                        message: e.to_string(),
                    });
                    out.pre.push(CallRecord::indeterminate(spot, cycle, reason));
                    series.push(None);
                }
            }
        }

        let Some(model) = model else {
            out.post.extend((1..=n_post as u32).map(|cycle| {
                CallRecord::indeterminate(spot, cycle, IndeterminateReason::PhaseSingular)
            }));
            return Ok(out);
        };
        let complete: Option<Vec<[f64; N_BASES]>> = series.into_iter().collect();
        match complete {
            Some(values) => {
                let corrected = model.correct(&values)?;
                out.post.extend(
                    corrected
                        .into_iter()
                        .take(n_post)
                        .enumerate()
                        .map(|(t, s)| CallRecord::from_signal(spot, t as u32 + 1, s)),
                );
            }
            None => out.post.extend((1..=n_post as u32).map(|cycle| {
                CallRecord::indeterminate(spot, cycle, IndeterminateReason::PhaseUncorrectable)
            })),
        }
        Ok(out)
    }
}

/// One-shot base calling of a measurement table.
pub fn run_basecalling(
    table: &MeasurementTable,
    basis: &BasisMatrix,
    unmix: &UnmixConfig,
    phase: &PhaseConfig,
) -> Result<BaseCallingResult, PipelineError> {
    BaseCaller::new(basis.clone(), unmix, phase)?.call(table)
}
