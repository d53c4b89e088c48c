//! Per-(spot, cycle) base calling with purity and chastity scores.

use crate::base::{Base, SpotId, N_BASES};

/// Why a (spot, cycle) unit carries no call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndeterminateReason {
    /// All four amounts are zero after clamping.
    ZeroSignal,
    /// The signal contains NaN or infinity.
    NonFinite,
    /// A required measurement row was absent.
    MissingMeasurement,
    /// Unmixing failed for this unit.
    UnmixFailed,
    /// Phase correction could not be applied (some cycle of the spot was
    /// indeterminate before correction).
    PhaseUncorrectable,
    /// The phase model for the run could not be inverted.
    PhaseSingular,
}

impl IndeterminateReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ZeroSignal => "zero_signal",
            Self::NonFinite => "non_finite",
            Self::MissingMeasurement => "missing_measurement",
            Self::UnmixFailed => "unmix_failed",
            Self::PhaseUncorrectable => "phase_uncorrectable",
            Self::PhaseSingular => "phase_singular",
        }
    }
}

impl std::fmt::Display for IndeterminateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of calling one (spot, cycle).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BaseCall {
    Called {
        base: Base,
        /// Top amount over the sum of all four.
        purity: f64,
        /// Top amount over top plus runner-up.
        chastity: f64,
    },
    Indeterminate(IndeterminateReason),
}

impl BaseCall {
    pub fn base(&self) -> Option<Base> {
        match self {
            Self::Called { base, .. } => Some(*base),
            Self::Indeterminate(_) => None,
        }
    }

    pub fn purity(&self) -> Option<f64> {
        match self {
            Self::Called { purity, .. } => Some(*purity),
            Self::Indeterminate(_) => None,
        }
    }

    pub fn chastity(&self) -> Option<f64> {
        match self {
            Self::Called { chastity, .. } => Some(*chastity),
            Self::Indeterminate(_) => None,
        }
    }

    /// Base letter, or `!` when indeterminate.
    pub fn symbol(&self) -> char {
        self.base().map_or('!', Base::as_char)
    }

    pub fn is_called(&self) -> bool {
        matches!(self, Self::Called { .. })
    }
}

/// Call the dominant base of a four-amount signal ordered A, C, G, T.
///
/// Negative amounts are clamped to zero before scoring. Ties resolve to the
/// lowest base index.
pub fn call_base(signal: [f64; N_BASES]) -> BaseCall {
    if signal.iter().any(|v| !v.is_finite()) {
        return BaseCall::Indeterminate(IndeterminateReason::NonFinite);
    }
    let s = signal.map(|v| v.max(0.0));
    let sum: f64 = s.iter().sum();
    if sum <= 0.0 {
        return BaseCall::Indeterminate(IndeterminateReason::ZeroSignal);
    }

    let mut top = 0usize;
    for i in 1..N_BASES {
        if s[i] > s[top] {
            top = i;
        }
    }
    let second = (0..N_BASES)
        .filter(|&i| i != top)
        .map(|i| s[i])
        .fold(0.0f64, f64::max);

    let max = s[top];
    BaseCall::Called {
        base: Base::ALL[top],
        purity: max / sum,
        chastity: max / (max + second),
    }
}

/// One row of a pre- or post-phase call table.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub spot: SpotId,
    pub cycle: u32,
    /// Base amounts (A, C, G, T), absent when the unit is indeterminate.
    pub signal: Option<[f64; N_BASES]>,
    pub call: BaseCall,
}

impl CallRecord {
    pub fn from_signal(spot: SpotId, cycle: u32, signal: [f64; N_BASES]) -> Self {
        let call = call_base(signal);
        Self {
            spot,
            cycle,
            signal: call.is_called().then_some(signal),
            call,
        }
    }

    pub fn indeterminate(spot: SpotId, cycle: u32, reason: IndeterminateReason) -> Self {
        Self {
            spot,
            cycle,
            signal: None,
            call: BaseCall::Indeterminate(reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn pure_signal_has_unit_purity() {
        let call = call_base([0.0, 0.0, 3.5, 0.0]);
        assert_eq!(call.base(), Some(Base::G));
        assert_relative_eq!(call.purity().unwrap(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(call.chastity().unwrap(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn uniform_split_has_quarter_purity_and_first_index() {
        let call = call_base([2.0; 4]);
        assert_eq!(call.base(), Some(Base::A));
        assert_relative_eq!(call.purity().unwrap(), 0.25, epsilon = 1e-12);
        assert_relative_eq!(call.chastity().unwrap(), 0.5, epsilon = 1e-12);
    }

    #[test]
    fn zero_and_non_finite_are_indeterminate() {
        assert_eq!(
            call_base([0.0; 4]),
            BaseCall::Indeterminate(IndeterminateReason::ZeroSignal)
        );
        assert_eq!(
            call_base([-1.0, -0.5, 0.0, 0.0]),
            BaseCall::Indeterminate(IndeterminateReason::ZeroSignal)
        );
        assert_eq!(
            call_base([1.0, f64::NAN, 0.0, 0.0]),
            BaseCall::Indeterminate(IndeterminateReason::NonFinite)
        );
        assert_eq!(call_base([0.0; 4]).symbol(), '!');
    }

    #[test]
    fn negative_amounts_are_clamped() {
        let call = call_base([-0.3, 0.6, 0.2, 0.2]);
        assert_eq!(call.base(), Some(Base::C));
        assert_relative_eq!(call.purity().unwrap(), 0.6, epsilon = 1e-12);
        assert_relative_eq!(call.chastity().unwrap(), 0.75, epsilon = 1e-12);
    }

    #[test]
    fn chastity_bounds_on_random_signals() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let s: [f64; 4] = std::array::from_fn(|_| rng.gen_range(0.0..10.0));
            let call = call_base(s);
            let (purity, chastity) = (call.purity().unwrap(), call.chastity().unwrap());
            assert!(chastity > 0.0 && chastity <= 1.0);
            assert!(purity >= 0.25 - 1e-12 && purity <= chastity + 1e-12);
        }
    }

    #[test]
    fn record_drops_signal_when_indeterminate() {
        let r = CallRecord::from_signal(SpotId(3), 2, [0.0; 4]);
        assert!(r.signal.is_none());
        let r = CallRecord::from_signal(SpotId(3), 2, [0.7, 0.2, 0.05, 0.05]);
        assert_eq!(r.call.symbol(), 'A');
        assert_relative_eq!(r.call.purity().unwrap(), 0.7, epsilon = 1e-12);
    }
}
