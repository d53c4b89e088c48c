//! spotcall: base calling for sequencing-by-synthesis spot imaging.
//!
//! Each acquisition cycle yields one image per excitation wavelength. The
//! stages are:
//!
//! 1. **Acquisition** – pick and background-correct the frames of a cycle.
//! 2. **Segment** – detect spots on the UV reference channel (cycle 1 only).
//! 3. **Measure** – per-spot RGB/HSV statistics for every wavelength.
//! 4. **Basis** – crosstalk matrix from operator-chosen reference spots.
//! 5. **Unmix** – NNLS or pseudoinverse per (spot, cycle).
//! 6. **Phase** – undo phasing/prephasing with the inverse mixing matrix.
//! 7. **Call** – argmax base with purity and chastity scores.
//! 8. **Report** – call tables, plots and a run summary.
//!
//! # Public API
//! - [`Session`] drives the stages cycle by cycle; [`CycleWorker`] runs a
//!   session on a background thread.
//! - [`BaseCaller`] / [`run_basecalling`] recompute calls from a
//!   [`MeasurementTable`] at any time.
//! - [`SpotcallConfig`] aggregates every stage's tuning.

mod acquisition;
mod base;
mod basis;
mod call;
mod config;
mod csv_io;
mod features;
mod image_set;
mod mask;
mod measure;
mod phase;
mod pipeline;
pub mod report;
mod segment;
mod session;
mod table;
#[cfg(test)]
mod test_utils;
mod unmix;
mod worker;

pub use acquisition::{
    list_cycle_files, list_cycles, load_cycle, parse_file_name, select_frames, AcquisitionConfig,
    AcquisitionError, AcquisitionFile, DifferenceMode, FrameSelection,
};
pub use base::{Base, SpotId, Wavelength, N_BASES};
pub use basis::{
    build_basis_matrix, condition_number, BasisConfig, BasisError, BasisMatrix, BasisSpots,
    BASIS_SCHEMA_V1,
};
pub use call::{call_base, BaseCall, CallRecord, IndeterminateReason};
pub use config::{ConfigError, SpotcallConfig, CONFIG_SCHEMA_V1};
pub use csv_io::{
    read_measurement_csv, read_measurements, write_call_csv, write_call_table, CsvIoError,
    MeasurementCsvWriter, MEASUREMENT_CSV_FILE,
};
pub use features::{FeatureConfig, FeatureLayout, SignalChannels, SignalStatistic};
pub use image_set::{ChannelImage, ImageSet, ImageSetError, PixelDepth, Rgb16Image};
pub use mask::{LabelImage, LabelMask, MaskError};
pub use measure::{
    extract_spot_measurements, rgb_to_hsv, stats_for_pixels, ExtractError, Extraction,
    MeasurementRow, MeasurementSink, SpotStats,
};
pub use phase::{
    mixing_matrix, transition_matrix, PhaseConfig, PhaseError, PhaseModel, PhaseModelCache,
    PhaseParams,
};
pub use pipeline::{run_basecalling, BaseCaller, BaseCallingResult, PipelineError, UnitFailure};
pub use report::{ReportConfig, ReportError};
pub use segment::{
    detect_spots, detect_spots_in_frame, RoiDetectConfig, SegmentError, SpotDetection,
};
pub use session::{CycleOutcome, Session, SessionError, SessionState};
pub use table::{MeasurementTable, TableError};
pub use unmix::{nnls, UnmixConfig, UnmixError, UnmixMethod, Unmixer};
pub use worker::{BasisDecision, CycleWorker, ProcessingGate, WorkerError, WorkerEvent};
