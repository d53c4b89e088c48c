//! Per-run state machine driving the stages across acquisition cycles.
//!
//! Cycle 0 is calibration only. Cycle 1 runs spot detection and then waits
//! for the operator to confirm the basis spots (or redo detection). Once the
//! basis is confirmed, cycle 1 and every later cycle are measured into the
//! table. Cycles must arrive in increasing order.

use std::path::Path;

use crate::basis::{build_basis_matrix, BasisError, BasisMatrix, BasisSpots};
use crate::config::{ConfigError, SpotcallConfig};
use crate::image_set::ImageSet;
use crate::mask::LabelMask;
use crate::measure::{extract_spot_measurements, ExtractError, MeasurementSink};
use crate::phase::PhaseConfig;
use crate::pipeline::{BaseCaller, BaseCallingResult, PipelineError};
use crate::report::{write_report, ReportError, ReportInputs, ReportSummary};
use crate::segment::{detect_spots, RoiDetectConfig, SegmentError, SpotDetection};
use crate::table::{MeasurementTable, TableError};

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum SessionError {
    Closed,
    OutOfOrder { last: u32, got: u32 },
    InvalidState {
        state: SessionState,
        action: &'static str,
    },
    BasisNotConfirmed,
    Config(ConfigError),
    Segment(SegmentError),
    Basis(BasisError),
    Extract(ExtractError),
    Table(TableError),
    Pipeline(PipelineError),
    Report(ReportError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "session is closed"),
            Self::OutOfOrder { last, got } => {
                write!(f, "cycle {} received after cycle {}", got, last)
            }
            Self::InvalidState { state, action } => {
                write!(f, "cannot {} while {}", action, state)
            }
            Self::BasisNotConfirmed => write!(f, "basis spots have not been confirmed"),
            Self::Config(e) => write!(f, "{}", e),
            Self::Segment(e) => write!(f, "{}", e),
            Self::Basis(e) => write!(f, "{}", e),
            Self::Extract(e) => write!(f, "{}", e),
            Self::Table(e) => write!(f, "{}", e),
            Self::Pipeline(e) => write!(f, "{}", e),
            Self::Report(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ConfigError> for SessionError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<SegmentError> for SessionError {
    fn from(e: SegmentError) -> Self {
        Self::Segment(e)
    }
}

impl From<BasisError> for SessionError {
    fn from(e: BasisError) -> Self {
        Self::Basis(e)
    }
}

impl From<ExtractError> for SessionError {
    fn from(e: ExtractError) -> Self {
        Self::Extract(e)
    }
}

impl From<TableError> for SessionError {
    fn from(e: TableError) -> Self {
        Self::Table(e)
    }
}

impl From<PipelineError> for SessionError {
    fn from(e: PipelineError) -> Self {
        Self::Pipeline(e)
    }
}

impl From<ReportError> for SessionError {
    fn from(e: ReportError) -> Self {
        Self::Report(e)
    }
}

// ── State ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing received yet; cycle 0 or cycle 1 may come next.
    AwaitingCalibration,
    /// Cycle 0 done; waiting for the spot images of cycle 1.
    AwaitingSpotImages,
    /// Spots detected on cycle 1; waiting for basis confirmation or a redo.
    AwaitingBasis,
    Sequencing,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AwaitingCalibration => "awaiting calibration",
            Self::AwaitingSpotImages => "awaiting spot images",
            Self::AwaitingBasis => "awaiting basis confirmation",
            Self::Sequencing => "sequencing",
            Self::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What [`Session::ingest`] did with an image set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Calibration { cycle: u32 },
    SpotsDetected { cycle: u32, n_spots: usize },
    Measured {
        cycle: u32,
        rows: usize,
        sink_failures: usize,
    },
}

// ── Session ────────────────────────────────────────────────────────────────

pub struct Session {
    config: SpotcallConfig,
    state: SessionState,
    last_cycle: Option<u32>,
    reference: Option<ImageSet>,
    detection: Option<SpotDetection>,
    caller: Option<BaseCaller>,
    table: MeasurementTable,
    sink: Option<Box<dyn MeasurementSink + Send>>,
    sink_failures: usize,
}

impl Session {
    pub fn new(config: SpotcallConfig) -> Result<Self, SessionError> {
        config.validate()?;
        Ok(Self {
            config,
            state: SessionState::AwaitingCalibration,
            last_cycle: None,
            reference: None,
            detection: None,
            caller: None,
            table: MeasurementTable::new(),
            sink: None,
            sink_failures: 0,
        })
    }

    /// Persist every measured row through `sink` as well.
    pub fn with_sink(mut self, sink: Box<dyn MeasurementSink + Send>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SpotcallConfig {
        &self.config
    }

    pub fn last_cycle(&self) -> Option<u32> {
        self.last_cycle
    }

    pub fn table(&self) -> &MeasurementTable {
        &self.table
    }

    /// Spot mask of the run, once cycle 1 has been processed.
    pub fn mask(&self) -> Option<&LabelMask> {
        self.detection.as_ref().map(|d| &d.mask)
    }

    pub fn detection(&self) -> Option<&SpotDetection> {
        self.detection.as_ref()
    }

    /// Background-corrected image set of cycle 1.
    pub fn reference(&self) -> Option<&ImageSet> {
        self.reference.as_ref()
    }

    pub fn basis(&self) -> Option<&BasisMatrix> {
        self.caller.as_ref().map(BaseCaller::basis)
    }

    /// Rows the measurement sink failed to persist so far.
    pub fn sink_failures(&self) -> usize {
        self.sink_failures
    }

    fn require(&self, state: SessionState, action: &'static str) -> Result<(), SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        if self.state != state {
            return Err(SessionError::InvalidState {
                state: self.state,
                action,
            });
        }
        Ok(())
    }

    /// Process the image set of the next cycle.
    pub fn ingest(&mut self, mut images: ImageSet) -> Result<CycleOutcome, SessionError> {
        if self.state == SessionState::Closed {
            return Err(SessionError::Closed);
        }
        let cycle = images.cycle();
        if let Some(last) = self.last_cycle {
            if cycle <= last {
                return Err(SessionError::OutOfOrder { last, got: cycle });
            }
        }
        images.subtract_dark(&self.config.features.dark_wavelength);

        let outcome = match cycle {
            0 => {
                self.require(SessionState::AwaitingCalibration, "calibrate")?;
                tracing::info!("Cycle 0: calibration only");
                self.state = SessionState::AwaitingSpotImages;
                CycleOutcome::Calibration { cycle }
            }
            1 => {
                if !matches!(
                    self.state,
                    SessionState::AwaitingCalibration | SessionState::AwaitingSpotImages
                ) {
                    return Err(SessionError::InvalidState {
                        state: self.state,
                        action: "detect spots",
                    });
                }
                let det = detect_spots(&images, &self.config.features.uv_wavelength, &self.config.roi)?;
                let n_spots = det.n_spots();
                self.detection = Some(det);
                self.reference = Some(images);
                self.state = SessionState::AwaitingBasis;
                CycleOutcome::SpotsDetected { cycle, n_spots }
            }
            _ => {
                if self.state == SessionState::AwaitingBasis {
                    return Err(SessionError::BasisNotConfirmed);
                }
                self.require(SessionState::Sequencing, "measure a cycle")?;
                let rows = self.measure(&images)?;
                CycleOutcome::Measured {
                    cycle,
                    rows: rows.0,
                    sink_failures: rows.1,
                }
            }
        };
        self.last_cycle = Some(cycle);
        Ok(outcome)
    }

    /// Extract one cycle into the table; returns (rows, sink failures).
    fn measure(&mut self, images: &ImageSet) -> Result<(usize, usize), SessionError> {
        let mask = self
            .detection
            .as_ref()
            .map(|d| &d.mask)
            .ok_or(SessionError::BasisNotConfirmed)?;
        let sink = self
            .sink
            .as_mut()
            .map(|s| s.as_mut() as &mut dyn MeasurementSink);
        let extraction =
            extract_spot_measurements(images, mask, self.config.acquisition.kinetic, sink)?;
        let n = extraction.rows.len();
        self.table.extend(extraction.rows)?;
        self.sink_failures += extraction.sink_failures;
        Ok((n, extraction.sink_failures))
    }

    /// Rerun spot detection on cycle 1 with new parameters.
    pub fn redo_spot_detection(&mut self, roi: RoiDetectConfig) -> Result<usize, SessionError> {
        self.require(SessionState::AwaitingBasis, "redo spot detection")?;
        let reference = self
            .reference
            .as_ref()
            .ok_or(SessionError::InvalidState {
                state: self.state,
                action: "redo spot detection",
            })?;
        let det = detect_spots(reference, &self.config.features.uv_wavelength, &roi)?;
        let n_spots = det.n_spots();
        tracing::info!("Spot detection redone: {} spots", n_spots);
        self.detection = Some(det);
        self.config.roi = roi;
        Ok(n_spots)
    }

    /// Replace the detected spots with an externally prepared mask.
    pub fn use_spot_mask(&mut self, mask: LabelMask) -> Result<(), SessionError> {
        self.require(SessionState::AwaitingBasis, "replace the spot mask")?;
        if let Some(reference) = &self.reference {
            if reference.dimensions() != mask.dimensions() {
                return Err(ExtractError::ShapeMismatch {
                    image: reference.dimensions(),
                    mask: mask.dimensions(),
                }
                .into());
            }
        }
        let n = mask.n_spots();
        self.detection = Some(SpotDetection {
            mask,
            n_candidates: n,
            removed_too_large: 0,
            removed_too_small: 0,
        });
        Ok(())
    }

    /// Build the basis from the operator's spot lists and measure cycle 1.
    ///
    /// On error the session stays in [`SessionState::AwaitingBasis`].
    pub fn confirm_basis(&mut self, spots: &BasisSpots) -> Result<&BasisMatrix, SessionError> {
        self.require(SessionState::AwaitingBasis, "confirm the basis")?;
        let (Some(reference), Some(det)) = (self.reference.as_ref(), self.detection.as_ref()) else {
            return Err(SessionError::InvalidState {
                state: self.state,
                action: "confirm the basis",
            });
        };

        let layout = self.config.features.layout_for(&reference.wavelengths());
        let basis = build_basis_matrix(reference, &det.mask, spots, &layout, &self.config.basis)?;
        let caller = BaseCaller::new(basis, &self.config.unmix, &self.config.phase)?;

        let sink = self
            .sink
            .as_mut()
            .map(|s| s.as_mut() as &mut dyn MeasurementSink);
        let extraction =
            extract_spot_measurements(reference, &det.mask, self.config.acquisition.kinetic, sink)?;
        let mut table = MeasurementTable::new();
        table.extend(extraction.rows)?;

        self.sink_failures += extraction.sink_failures;
        self.table = table;
        self.state = SessionState::Sequencing;
        tracing::info!("Basis confirmed; cycle 1 measured ({} rows)", self.table.len());
        Ok(self.caller.insert(caller).basis())
    }

    /// Call every spot over all measured cycles.
    pub fn base_call(&self) -> Result<BaseCallingResult, SessionError> {
        if self.state == SessionState::Closed && self.caller.is_none() {
            return Err(SessionError::Closed);
        }
        let caller = self.caller.as_ref().ok_or(SessionError::BasisNotConfirmed)?;
        Ok(caller.call(&self.table)?)
    }

    /// Replace the phase parameters used by later calls.
    pub fn set_phase(&mut self, phase: PhaseConfig) -> Result<(), SessionError> {
        if let Some(caller) = self.caller.as_mut() {
            caller.set_phase(&phase)?;
        } else {
            phase.params.validate().map_err(PipelineError::from)?;
        }
        self.config.phase = phase;
        Ok(())
    }

    /// Write the run report for `result` into `out_dir`.
    pub fn write_report(
        &self,
        out_dir: &Path,
        result: &BaseCallingResult,
        measurement_csv: Option<&Path>,
    ) -> Result<ReportSummary, SessionError> {
        let basis = self.basis().ok_or(SessionError::BasisNotConfirmed)?;
        let uv_frame = self
            .reference
            .as_ref()
            .and_then(|r| r.get(&self.config.features.uv_wavelength));
        let inputs = ReportInputs {
            config: &self.config,
            result,
            basis,
            mask: self.mask(),
            uv_frame,
            measurement_csv,
        };
        Ok(write_report(out_dir, &inputs)?)
    }

    /// Stop accepting cycles. Results stay available.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            tracing::info!("Session closed after cycle {:?}", self.last_cycle);
        }
        self.state = SessionState::Closed;
    }
}
