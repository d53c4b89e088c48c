//! Run reporting: call tables, plots, ROI overlay and a text summary.
//!
//! [`write_report`] writes into one output directory:
//!
//! - `basecaller_output_data_pre.csv` / `basecaller_output_data_post.csv`
//! - `Purity {Pre,Post}-Phase N.png` and `Signal {Pre,Post}-Phase N.png`
//! - `basis.json`, `rois.png` (when a mask and UV frame are given)
//! - `report.txt`
//!
//! Plot pages and the spot-ID labels on `rois.png` are best effort: failures
//! are logged and counted in [`ReportSummary`].

mod overlay;
mod plots;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::basis::BasisMatrix;
use crate::config::SpotcallConfig;
use crate::csv_io::{write_call_csv, CsvIoError};
use crate::image_set::Rgb16Image;
use crate::mask::{LabelMask, MaskError};
use crate::pipeline::BaseCallingResult;

pub use overlay::{draw_spot_labels, render_overlay, stretch_to_8bit};

use plots::{draw_pages, group_by_spot, PlotKind};

pub const PRE_CALLS_FILE: &str = "basecaller_output_data_pre.csv";
pub const POST_CALLS_FILE: &str = "basecaller_output_data_post.csv";
pub const BASIS_FILE: &str = "basis.json";
pub const OVERLAY_FILE: &str = "rois.png";
pub const SUMMARY_FILE: &str = "report.txt";

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ReportError {
    Io(std::io::Error),
    Csv(CsvIoError),
    Mask(MaskError),
    Image(image::ImageError),
    Json(String),
}

impl std::fmt::Display for ReportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "report I/O error: {}", e),
            Self::Csv(e) => write!(f, "report table error: {}", e),
            Self::Mask(e) => write!(f, "report mask error: {}", e),
            Self::Image(e) => write!(f, "report image error: {}", e),
            Self::Json(msg) => write!(f, "report JSON error: {}", msg),
        }
    }
}

impl std::error::Error for ReportError {}

impl From<std::io::Error> for ReportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<CsvIoError> for ReportError {
    fn from(e: CsvIoError) -> Self {
        Self::Csv(e)
    }
}

impl From<MaskError> for ReportError {
    fn from(e: MaskError) -> Self {
        Self::Mask(e)
    }
}

impl From<image::ImageError> for ReportError {
    fn from(e: image::ImageError) -> Self {
        Self::Image(e)
    }
}

// ── Config ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Spot panels per plot page.
    pub spots_per_page: usize,
    /// Panel columns per page.
    pub grid_cols: usize,
    /// Panel size in pixels.
    pub panel_width: u32,
    pub panel_height: u32,
    /// Render purity and signal pages.
    pub plots: bool,
    /// Outline and label color on `rois.png`.
    pub overlay_color: [u8; 3],
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            spots_per_page: 24,
            grid_cols: 6,
            panel_width: 320,
            panel_height: 240,
            plots: true,
            overlay_color: [255, 0, 255],
        }
    }
}

impl ReportConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.spots_per_page == 0 {
            return Err("report.spots_per_page must be >= 1".to_string());
        }
        if self.grid_cols == 0 {
            return Err("report.grid_cols must be >= 1".to_string());
        }
        if self.panel_width < 64 || self.panel_height < 64 {
            return Err(format!(
                "report panels must be at least 64x64, got {}x{}",
                self.panel_width, self.panel_height
            ));
        }
        Ok(())
    }
}

// ── Report ─────────────────────────────────────────────────────────────────

/// Everything a report is built from.
pub struct ReportInputs<'a> {
    pub config: &'a SpotcallConfig,
    pub result: &'a BaseCallingResult,
    pub basis: &'a BasisMatrix,
    pub mask: Option<&'a LabelMask>,
    /// UV frame of the reference cycle, for `rois.png`.
    pub uv_frame: Option<&'a Rgb16Image>,
    /// Measurement CSV written during acquisition, listed in the summary.
    pub measurement_csv: Option<&'a Path>,
}

#[derive(Debug, Clone, Default)]
pub struct ReportSummary {
    pub files: Vec<PathBuf>,
    pub plot_failures: usize,
}

/// Write every report artifact into `out_dir` (created if missing).
pub fn write_report(out_dir: &Path, inputs: &ReportInputs<'_>) -> Result<ReportSummary, ReportError> {
    std::fs::create_dir_all(out_dir)?;
    let cfg = &inputs.config.report;
    let result = inputs.result;
    let mut summary = ReportSummary::default();

    let pre_path = out_dir.join(PRE_CALLS_FILE);
    write_call_csv(&pre_path, &result.pre)?;
    summary.files.push(pre_path);
    let post_path = out_dir.join(POST_CALLS_FILE);
    write_call_csv(&post_path, &result.post)?;
    summary.files.push(post_path);

    let basis_path = out_dir.join(BASIS_FILE);
    inputs
        .basis
        .save_json(&basis_path)
        .map_err(|e| ReportError::Json(e.to_string()))?;
    summary.files.push(basis_path);

    if let (Some(mask), Some(frame)) = (inputs.mask, inputs.uv_frame) {
        let mut img = render_overlay(frame, mask, cfg.overlay_color);
        if let Err(e) = draw_spot_labels(&mut img, mask, cfg.overlay_color) {
            tracing::warn!("Spot labels not drawn on {}: {}", OVERLAY_FILE, e);
            summary.plot_failures += 1;
        }
        let path = out_dir.join(OVERLAY_FILE);
        img.save(&path)?;
        summary.files.push(path);
    }

    if cfg.plots && !result.spots.is_empty() {
        let pages = [
            ("Purity Pre-Phase", PlotKind::Purity, &result.pre),
            ("Signal Pre-Phase", PlotKind::Signal, &result.pre),
            ("Purity Post-Phase", PlotKind::Purity, &result.post),
            ("Signal Post-Phase", PlotKind::Signal, &result.post),
        ];
        for (title, kind, records) in pages {
            let series = group_by_spot(&result.spots, records);
            let (written, failed) = draw_pages(out_dir, title, kind, &series, result.n_cycles, cfg);
            for (path, msg) in &failed {
                tracing::warn!("Plot {} failed: {}", path.display(), msg);
            }
            summary.plot_failures += failed.len();
            summary.files.extend(written);
        }
    }

    let text_path = out_dir.join(SUMMARY_FILE);
    let mut files = summary.files.clone();
    files.push(text_path.clone());
    std::fs::write(&text_path, summary_text(inputs, &files))?;
    summary.files.push(text_path);

    tracing::info!(
        "Report written to {}: {} files, {} plot failures",
        out_dir.display(),
        summary.files.len(),
        summary.plot_failures
    );
    Ok(summary)
}

/// Plain-text run summary listing parameters, counts and output files.
pub fn summary_text(inputs: &ReportInputs<'_>, files: &[PathBuf]) -> String {
    let cfg = inputs.config;
    let result = inputs.result;
    let roi = &cfg.roi;
    let phase = &cfg.phase.params;
    let mut s = String::new();

    // writing into a String cannot fail
    let _ = writeln!(s, "Base calling report");
    let _ = writeln!(s);
    let _ = writeln!(s, "Difference mode: {:?}", cfg.acquisition.difference_mode);
    let _ = writeln!(
        s,
        "ROI kernels: median {} erode {} dilate {} final erode {}",
        roi.median_ks, roi.erode_ks, roi.dilate_ks, roi.final_erode_ks
    );
    let _ = writeln!(s, "ROI threshold scale: {}", roi.threshold_scale);
    let _ = writeln!(s, "Unmixing: {:?}", cfg.unmix.method);
    let _ = writeln!(s, "Phase: p = {} q = {} r = {}", phase.p, phase.q, phase.r);
    let _ = writeln!(s);

    let basis = inputs.basis;
    let _ = writeln!(
        s,
        "Basis ({} features, condition number {:.3e}):",
        basis.n_features(),
        basis.condition_number()
    );
    let _ = writeln!(s, "  feature      A          C          G          T");
    for (name, row) in basis
        .layout()
        .feature_names()
        .iter()
        .zip(basis.matrix().row_iter())
    {
        let _ = write!(s, "  {:<8}", name);
        for v in row.iter() {
            let _ = write!(s, " {:>10.4}", v);
        }
        let _ = writeln!(s);
    }
    let _ = writeln!(s);

    let _ = writeln!(s, "Spots: {}", result.spots.len());
    let _ = writeln!(s, "Cycles: {}", result.n_cycles);
    let _ = writeln!(s, "Indeterminate (pre-phase): {}", result.n_indeterminate(false));
    let _ = writeln!(s, "Indeterminate (post-phase): {}", result.n_indeterminate(true));
    let _ = writeln!(s, "Unit failures: {}", result.failures.len());
    if let Some(e) = &result.phase_error {
        let _ = writeln!(s, "Phase correction not applied: {}", e);
    }
    let _ = writeln!(s);

    let _ = writeln!(s, "Sequences (pre / post):");
    for &spot in &result.spots {
        let _ = writeln!(
            s,
            "  {}  {}  {}",
            spot,
            result.sequence(spot, false),
            result.sequence(spot, true)
        );
    }
    let _ = writeln!(s);

    let _ = writeln!(s, "Files:");
    if let Some(path) = inputs.measurement_csv {
        let _ = writeln!(s, "  {}", path.display());
    }
    for path in files {
        let _ = writeln!(s, "  {}", path.display());
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::SpotId;
    use crate::call::{CallRecord, IndeterminateReason};
    use crate::features::{FeatureLayout, SignalChannels, SignalStatistic};
    use crate::pipeline::UnitFailure;
    use crate::PhaseError;
    use nalgebra::DMatrix;

    fn basis() -> BasisMatrix {
        let layout = FeatureLayout {
            wavelengths: ["445", "525", "590", "645"].iter().map(|w| (*w).into()).collect(),
            channels: SignalChannels::Luma,
            statistic: SignalStatistic::Mean,
        };
        BasisMatrix::from_matrix(layout, DMatrix::identity(4, 4), 1e6).unwrap()
    }

    fn result() -> BaseCallingResult {
        let pre = vec![
            CallRecord::from_signal(SpotId(1), 1, [0.9, 0.1, 0.0, 0.0]),
            CallRecord::indeterminate(SpotId(1), 2, IndeterminateReason::MissingMeasurement),
        ];
        let post = vec![
            CallRecord::indeterminate(SpotId(1), 1, IndeterminateReason::PhaseUncorrectable),
            CallRecord::indeterminate(SpotId(1), 2, IndeterminateReason::PhaseUncorrectable),
        ];
        BaseCallingResult {
            spots: vec![SpotId(1)],
            n_cycles: 2,
            pre,
            post,
            failures: vec![UnitFailure {
                spot: SpotId(1),
                cycle: 2,
                message: "missing".into(),
            }],
            phase_error: None,
        }
    }

    fn temp_dir(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("spotcall_report_{}_{}", tag, std::process::id()))
    }

    #[test]
    fn config_validation() {
        ReportConfig::default().validate().unwrap();
        let bad = ReportConfig {
            spots_per_page: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = ReportConfig {
            panel_width: 10,
            ..Default::default()
        };
        assert!(bad.validate().unwrap_err().contains("64x64"));
    }

    #[test]
    fn writes_tables_basis_and_summary_without_plots() {
        let mut config = SpotcallConfig::default();
        config.report.plots = false;
        let (result, basis) = (result(), basis());
        let dir = temp_dir("noplots");
        let inputs = ReportInputs {
            config: &config,
            result: &result,
            basis: &basis,
            mask: None,
            uv_frame: None,
            measurement_csv: None,
        };
        let summary = write_report(&dir, &inputs).unwrap();
        assert_eq!(summary.plot_failures, 0);
        assert_eq!(summary.files.len(), 4);

        let pre = std::fs::read_to_string(dir.join(PRE_CALLS_FILE)).unwrap();
        assert!(pre.lines().nth(2).unwrap().ends_with(",!,,,missing_measurement"));
        let text = std::fs::read_to_string(dir.join(SUMMARY_FILE)).unwrap();
        assert!(text.contains("spot_001  A!  !!"));
        assert!(text.contains("Unit failures: 1"));
        assert!(text.contains("445_L"));
        let reloaded = BasisMatrix::from_json_file(&dir.join(BASIS_FILE), 1e6).unwrap();
        assert_eq!(reloaded.matrix(), basis.matrix());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn summary_reports_singular_phase_model() {
        let config = SpotcallConfig::default();
        let basis = basis();
        let mut result = result();
        result.post = (1..=2)
            .map(|c| CallRecord::indeterminate(SpotId(1), c, IndeterminateReason::PhaseSingular))
            .collect();
        result.phase_error = Some(PhaseError::Singular {
            condition: f64::INFINITY,
        });
        let inputs = ReportInputs {
            config: &config,
            result: &result,
            basis: &basis,
            mask: None,
            uv_frame: None,
            measurement_csv: None,
        };
        let text = summary_text(&inputs, &[]);
        assert!(text.contains("Phase correction not applied: phase model singular"));
        assert!(text.contains("Indeterminate (post-phase): 2"));
        assert!(text.contains("spot_001  A!  !!"));

        let mut corrected = result.clone();
        corrected.phase_error = None;
        let inputs = ReportInputs {
            result: &corrected,
            ..inputs
        };
        assert!(!summary_text(&inputs, &[]).contains("Phase correction not applied"));
    }

    #[test]
    fn writes_overlay_when_mask_given() {
        let mut config = SpotcallConfig::default();
        config.report.plots = false;
        let (result, basis) = (result(), basis());
        let mask = crate::test_utils::disk_mask(32, 32, &[([16.0, 16.0], 5.0)]);
        let frame = Rgb16Image::from_pixel(32, 32, image::Rgb([50, 50, 50]));
        let dir = temp_dir("overlay");
        let inputs = ReportInputs {
            config: &config,
            result: &result,
            basis: &basis,
            mask: Some(&mask),
            uv_frame: Some(&frame),
            measurement_csv: None,
        };
        let summary = write_report(&dir, &inputs).unwrap();
        assert!(summary.files.contains(&dir.join(OVERLAY_FILE)));
        let img = image::open(dir.join(OVERLAY_FILE)).unwrap().to_rgb8();
        assert_eq!(img.dimensions(), (32, 32));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
