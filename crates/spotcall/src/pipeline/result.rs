use crate::base::{SpotId, N_BASES};
use crate::call::{BaseCall, CallRecord};
use crate::phase::PhaseError;

/// A (spot, cycle) unit that could not be called, with the underlying cause.
#[derive(Debug, Clone, PartialEq)]
pub struct UnitFailure {
    pub spot: SpotId,
    pub cycle: u32,
    pub message: String,
}

/// Calls for one evaluation of the measurement table.
#[derive(Debug, Clone)]
pub struct BaseCallingResult {
    /// Spots in ascending ID order.
    pub spots: Vec<SpotId>,
    /// Number of sequencing cycles modelled (cycles `1..=n_cycles`).
    pub n_cycles: usize,
    /// Unmixed calls, spot-major then cycle.
    pub pre: Vec<CallRecord>,
    /// Phase-corrected calls, spot-major then cycle.
    pub post: Vec<CallRecord>,
    /// Units whose unmixing failed or whose measurements were missing.
    pub failures: Vec<UnitFailure>,
    /// Set when the phase model could not be built; every post-phase unit
    /// is then [`IndeterminateReason::PhaseSingular`](crate::IndeterminateReason).
    pub phase_error: Option<PhaseError>,
}

impl BaseCallingResult {
    /// Called sequence of one spot, `!` marking indeterminate cycles.
    pub fn sequence(&self, spot: SpotId, post: bool) -> String {
        let records = if post { &self.post } else { &self.pre };
        records
            .iter()
            .filter(|r| r.spot == spot)
            .map(|r| r.call.symbol())
            .collect()
    }

    /// Per-cycle signals of one spot; `None` for indeterminate cycles.
    pub fn signals(&self, spot: SpotId, post: bool) -> Vec<(u32, Option<[f64; N_BASES]>)> {
        let records = if post { &self.post } else { &self.pre };
        records
            .iter()
            .filter(|r| r.spot == spot)
            .map(|r| (r.cycle, r.signal))
            .collect()
    }

    pub fn n_indeterminate(&self, post: bool) -> usize {
        let records = if post { &self.post } else { &self.pre };
        records
            .iter()
            .filter(|r| matches!(r.call, BaseCall::Indeterminate(_)))
            .count()
    }
}
