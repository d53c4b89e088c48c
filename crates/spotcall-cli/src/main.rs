//! Command-line interface for spotcall base calling.

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use spotcall::report::{render_overlay, ReportInputs};
use spotcall::{
    build_basis_matrix, detect_spots, extract_spot_measurements, list_cycles, load_cycle,
    mixing_matrix, read_measurement_csv, BasisMatrix, BasisSpots, CycleOutcome, DifferenceMode,
    LabelMask, MeasurementCsvWriter, MeasurementSink, PhaseModel, PhaseParams, Session, SpotId,
    SpotcallConfig, UnmixMethod, MEASUREMENT_CSV_FILE,
};

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "spotcall")]
#[command(about = "Spot detection, color unmixing, phase correction and base calling")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect spots on the UV channel of one cycle and save the label mask.
    Segment(SegmentArgs),

    /// Append per-spot measurements of one or more cycles to a CSV table.
    Extract(ExtractArgs),

    /// Build the basis matrix from reference spots.
    Basis(BasisArgs),

    /// Base-call a measurement table and write the report.
    Call(CallArgs),

    /// Process an acquisition directory end to end.
    Run(RunArgs),

    /// Print the phase mixing matrix Q (or its inverse).
    PhaseMatrix {
        #[command(flatten)]
        phase: PhaseArgs,

        /// Number of sequencing cycles.
        #[arg(long)]
        cycles: usize,

        /// Print Q⁻¹ instead of Q.
        #[arg(long)]
        inverse: bool,
    },

    /// Print the default configuration as JSON.
    DefaultConfig,
}

#[derive(Debug, Clone, Args)]
struct ConfigArgs {
    /// Session configuration (JSON, schema spotcall.config.v1).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Background removal for the visible channels.
    #[arg(long, value_enum)]
    difference: Option<DifferenceArg>,
}

#[derive(Debug, Clone, Args)]
struct RoiArgs {
    /// Median filter radius (pixels).
    #[arg(long)]
    median_ks: Option<u32>,

    /// Erosion disk radius (pixels).
    #[arg(long)]
    erode_ks: Option<u32>,

    /// Dilation disk radius (pixels).
    #[arg(long)]
    dilate_ks: Option<u32>,

    /// Multiplier on the mean gray level used as threshold.
    #[arg(long)]
    threshold_scale: Option<f64>,

    /// Discard spots smaller than this many pixels.
    #[arg(long)]
    min_size: Option<usize>,

    /// Discard spots larger than this many pixels.
    #[arg(long)]
    max_size: Option<usize>,
}

#[derive(Debug, Clone, Args)]
struct PhaseArgs {
    /// Probability that no base is added in a cycle (lag).
    #[arg(long)]
    p: Option<f64>,

    /// Probability that two bases are added in a cycle (lead).
    #[arg(long)]
    q: Option<f64>,

    /// Probability that three bases are added in a cycle.
    #[arg(long)]
    r: Option<f64>,
}

#[derive(Debug, Clone, Args)]
struct SpotListArgs {
    /// Reference spots for A (comma separated IDs).
    #[arg(long = "a", value_delimiter = ',', required = true)]
    a: Vec<String>,

    /// Reference spots for C.
    #[arg(long = "c", value_delimiter = ',', required = true)]
    c: Vec<String>,

    /// Reference spots for G.
    #[arg(long = "g", value_delimiter = ',', required = true)]
    g: Vec<String>,

    /// Reference spots for T.
    #[arg(long = "t", value_delimiter = ',', required = true)]
    t: Vec<String>,
}

#[derive(Debug, Clone, Args)]
struct SegmentArgs {
    /// Acquisition directory.
    #[arg(long)]
    dir: PathBuf,

    #[arg(long, default_value = "1")]
    cycle: u32,

    /// Output label mask (16-bit PNG).
    #[arg(long)]
    out: PathBuf,

    /// Also write the spot outline overlay.
    #[arg(long)]
    overlay: Option<PathBuf>,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(flatten)]
    roi: RoiArgs,
}

#[derive(Debug, Clone, Args)]
struct ExtractArgs {
    #[arg(long)]
    dir: PathBuf,

    /// Label mask written by `segment`.
    #[arg(long)]
    mask: PathBuf,

    /// Cycles to extract (comma separated); all cycles >= 1 when omitted.
    #[arg(long, value_delimiter = ',')]
    cycles: Vec<u32>,

    /// Measurement CSV to append to.
    #[arg(long, default_value = MEASUREMENT_CSV_FILE)]
    out: PathBuf,

    /// Stamp rows with per-channel times.
    #[arg(long)]
    kinetic: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Debug, Clone, Args)]
struct BasisArgs {
    #[arg(long)]
    dir: PathBuf,

    #[arg(long, default_value = "1")]
    cycle: u32,

    #[arg(long)]
    mask: PathBuf,

    #[command(flatten)]
    spots: SpotListArgs,

    /// Output basis JSON.
    #[arg(long)]
    out: PathBuf,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Debug, Clone, Args)]
struct CallArgs {
    /// Measurement CSV.
    #[arg(long)]
    measurements: PathBuf,

    /// Basis JSON written by `basis`.
    #[arg(long)]
    basis: PathBuf,

    /// Report directory.
    #[arg(long)]
    out_dir: PathBuf,

    /// Label mask, for the ROI overlay.
    #[arg(long)]
    mask: Option<PathBuf>,

    /// UV reference image, for the ROI overlay.
    #[arg(long)]
    uv_image: Option<PathBuf>,

    #[arg(long, value_enum)]
    method: Option<MethodArg>,

    /// Skip purity and signal plots.
    #[arg(long)]
    no_plots: bool,

    #[command(flatten)]
    phase: PhaseArgs,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    #[arg(long)]
    dir: PathBuf,

    #[arg(long)]
    out_dir: PathBuf,

    #[command(flatten)]
    spots: SpotListArgs,

    #[arg(long, value_enum)]
    method: Option<MethodArg>,

    #[arg(long)]
    no_plots: bool,

    #[command(flatten)]
    phase: PhaseArgs,

    #[command(flatten)]
    roi: RoiArgs,

    #[command(flatten)]
    config: ConfigArgs,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum MethodArg {
    Nnls,
    Pinv,
}

impl From<MethodArg> for UnmixMethod {
    fn from(m: MethodArg) -> Self {
        match m {
            MethodArg::Nnls => UnmixMethod::Nnls,
            MethodArg::Pinv => UnmixMethod::PseudoInverse,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum DifferenceArg {
    Dark,
    Temporal,
}

impl From<DifferenceArg> for DifferenceMode {
    fn from(d: DifferenceArg) -> Self {
        match d {
            DifferenceArg::Dark => DifferenceMode::Dark,
            DifferenceArg::Temporal => DifferenceMode::Temporal,
        }
    }
}

fn main() -> CliResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Segment(args) => run_segment(&args),
        Commands::Extract(args) => run_extract(&args),
        Commands::Basis(args) => run_basis(&args),
        Commands::Call(args) => run_call(&args),
        Commands::Run(args) => run_all(&args),
        Commands::PhaseMatrix {
            phase,
            cycles,
            inverse,
        } => run_phase_matrix(&phase, cycles, inverse),
        Commands::DefaultConfig => {
            println!("{}", SpotcallConfig::default().to_json()?);
            Ok(())
        }
    }
}

// ── Config overrides ───────────────────────────────────────────────────────

fn load_config(args: &ConfigArgs) -> CliResult<SpotcallConfig> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading config: {}", path.display());
            SpotcallConfig::from_json_file(path)?
        }
        None => SpotcallConfig::default(),
    };
    if let Some(d) = args.difference {
        config.acquisition.difference_mode = d.into();
    }
    Ok(config)
}

fn apply_roi(config: &mut SpotcallConfig, roi: &RoiArgs) {
    let cfg = &mut config.roi;
    if let Some(v) = roi.median_ks {
        cfg.median_ks = v;
    }
    if let Some(v) = roi.erode_ks {
        cfg.erode_ks = v;
    }
    if let Some(v) = roi.dilate_ks {
        cfg.dilate_ks = v;
    }
    if let Some(v) = roi.threshold_scale {
        cfg.threshold_scale = v;
    }
    if roi.min_size.is_some() {
        cfg.min_size = roi.min_size;
    }
    if roi.max_size.is_some() {
        cfg.max_size = roi.max_size;
    }
}

fn apply_phase(config: &mut SpotcallConfig, phase: &PhaseArgs) {
    let params = &mut config.phase.params;
    params.p = phase.p.unwrap_or(params.p);
    params.q = phase.q.unwrap_or(params.q);
    params.r = phase.r.unwrap_or(params.r);
}

fn parse_spot_lists(args: &SpotListArgs) -> CliResult<BasisSpots> {
    let parse = |list: &[String]| -> CliResult<Vec<SpotId>> {
        list.iter()
            .map(|s| s.parse::<SpotId>().map_err(CliError::from))
            .collect()
    };
    Ok(BasisSpots {
        a: parse(&args.a)?,
        c: parse(&args.c)?,
        g: parse(&args.g)?,
        t: parse(&args.t)?,
    })
}

// ── Commands ───────────────────────────────────────────────────────────────

fn run_segment(args: &SegmentArgs) -> CliResult<()> {
    let mut config = load_config(&args.config)?;
    apply_roi(&mut config, &args.roi);
    config.validate()?;

    let images = load_cycle(&args.dir, args.cycle, &config.features, &config.acquisition)?;
    let uv = &config.features.uv_wavelength;
    let det = detect_spots(&images, uv, &config.roi)?;
    det.mask.save_png(&args.out)?;
    println!(
        "Detected {} spots ({} candidates, {} too large, {} too small).",
        det.n_spots(),
        det.n_candidates,
        det.removed_too_large,
        det.removed_too_small
    );
    println!("Wrote {}", args.out.display());

    if let (Some(path), Some(frame)) = (&args.overlay, images.get(uv)) {
        render_overlay(frame, &det.mask, config.report.overlay_color).save(path)?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

fn run_extract(args: &ExtractArgs) -> CliResult<()> {
    let mut config = load_config(&args.config)?;
    config.acquisition.kinetic |= args.kinetic;
    config.validate()?;

    let mask = LabelMask::load_png(&args.mask)?;
    let cycles = if args.cycles.is_empty() {
        list_cycles(&args.dir, &config.acquisition)?
            .into_iter()
            .filter(|c| *c >= 1)
            .collect()
    } else {
        args.cycles.clone()
    };

    let mut writer = MeasurementCsvWriter::append_to(&args.out)?;
    let mut total = 0usize;
    for cycle in cycles {
        let images = load_cycle(&args.dir, cycle, &config.features, &config.acquisition)?;
        let extraction = extract_spot_measurements(
            &images,
            &mask,
            config.acquisition.kinetic,
            Some(&mut writer as &mut dyn MeasurementSink),
        )?;
        if extraction.sink_failures > 0 {
            tracing::warn!(
                "Cycle {}: {} rows not written to {}",
                cycle,
                extraction.sink_failures,
                args.out.display()
            );
        }
        total += extraction.rows.len();
    }
    println!("Appended {} rows to {}", total, args.out.display());
    Ok(())
}

fn run_basis(args: &BasisArgs) -> CliResult<()> {
    let config = load_config(&args.config)?;
    config.validate()?;

    let spots = parse_spot_lists(&args.spots)?;
    let images = load_cycle(&args.dir, args.cycle, &config.features, &config.acquisition)?;
    let mask = LabelMask::load_png(&args.mask)?;
    let layout = config.features.layout_for(&images.wavelengths());
    let basis = build_basis_matrix(&images, &mask, &spots, &layout, &config.basis)?;
    basis.save_json(&args.out)?;
    println!(
        "Basis {}x4, condition number {:.3e}",
        basis.n_features(),
        basis.condition_number()
    );
    println!("Wrote {}", args.out.display());
    Ok(())
}

fn run_call(args: &CallArgs) -> CliResult<()> {
    let mut config = load_config(&args.config)?;
    apply_phase(&mut config, &args.phase);
    if let Some(m) = args.method {
        config.unmix.method = m.into();
    }
    if args.no_plots {
        config.report.plots = false;
    }
    config.validate()?;

    let table = read_measurement_csv(&args.measurements)?;
    tracing::info!(
        "Loaded {} measurements ({} spots, {} cycles)",
        table.len(),
        table.spots().len(),
        table.cycles().len()
    );
    let basis = BasisMatrix::from_json_file(&args.basis, config.basis.max_condition_number)?;
    let result = spotcall::run_basecalling(&table, &basis, &config.unmix, &config.phase)?;

    let mask = args.mask.as_deref().map(LabelMask::load_png).transpose()?;
    let uv_frame = match &args.uv_image {
        Some(path) => Some(image::open(path)?.to_rgb16()),
        None => None,
    };
    let inputs = ReportInputs {
        config: &config,
        result: &result,
        basis: &basis,
        mask: mask.as_ref(),
        uv_frame: uv_frame.as_ref(),
        measurement_csv: Some(&args.measurements),
    };
    let summary = spotcall::report::write_report(&args.out_dir, &inputs)?;
    print_sequences(&result);
    println!(
        "Wrote {} files to {} ({} plot failures)",
        summary.files.len(),
        args.out_dir.display(),
        summary.plot_failures
    );
    Ok(())
}

fn run_all(args: &RunArgs) -> CliResult<()> {
    let mut config = load_config(&args.config)?;
    apply_roi(&mut config, &args.roi);
    apply_phase(&mut config, &args.phase);
    if let Some(m) = args.method {
        config.unmix.method = m.into();
    }
    if args.no_plots {
        config.report.plots = false;
    }
    let spots = parse_spot_lists(&args.spots)?;

    std::fs::create_dir_all(&args.out_dir)?;
    let csv_path = args.out_dir.join(MEASUREMENT_CSV_FILE);
    let writer = MeasurementCsvWriter::append_to(&csv_path)?;
    let mut session = Session::new(config.clone())?.with_sink(Box::new(writer));

    for cycle in list_cycles(&args.dir, &config.acquisition)? {
        let images = load_cycle(&args.dir, cycle, &config.features, &config.acquisition)?;
        match session.ingest(images)? {
            CycleOutcome::Calibration { .. } => {}
            CycleOutcome::SpotsDetected { n_spots, .. } => {
                println!("Cycle {}: {} spots detected", cycle, n_spots);
                let basis = session.confirm_basis(&spots)?;
                println!(
                    "Basis {}x4, condition number {:.3e}",
                    basis.n_features(),
                    basis.condition_number()
                );
            }
            CycleOutcome::Measured { rows, .. } => {
                println!("Cycle {}: {} rows measured", cycle, rows);
            }
        }
    }
    if session.sink_failures() > 0 {
        tracing::warn!(
            "{} rows could not be written to {}",
            session.sink_failures(),
            csv_path.display()
        );
    }

    let result = session.base_call()?;
    let summary = session.write_report(&args.out_dir, &result, Some(&csv_path))?;
    session.close();
    print_sequences(&result);
    println!(
        "Wrote {} files to {} ({} plot failures)",
        summary.files.len(),
        args.out_dir.display(),
        summary.plot_failures
    );
    Ok(())
}

fn run_phase_matrix(phase: &PhaseArgs, cycles: usize, inverse: bool) -> CliResult<()> {
    let params = PhaseParams::new(
        phase.p.unwrap_or(0.0),
        phase.q.unwrap_or(0.0),
        phase.r.unwrap_or(0.0),
    );
    let matrix = if inverse {
        let model = PhaseModel::new(params, cycles, SpotcallConfig::default().phase.max_condition_number)?;
        println!("condition number: {:.3e}", model.condition_number());
        model.inverse().clone()
    } else {
        params.validate()?;
        mixing_matrix(&params, cycles)
    };
    for row in matrix.row_iter() {
        let cells: Vec<String> = row.iter().map(|v| format!("{:>9.5}", v)).collect();
        println!("{}", cells.join(" "));
    }
    Ok(())
}

fn print_sequences(result: &spotcall::BaseCallingResult) {
    println!(
        "{} spots, {} cycles, {} / {} indeterminate (pre / post)",
        result.spots.len(),
        result.n_cycles,
        result.n_indeterminate(false),
        result.n_indeterminate(true)
    );
    if let Some(e) = &result.phase_error {
        println!("Phase correction not applied: {}", e);
    }
    for &spot in &result.spots {
        println!(
            "  {}  {}  {}",
            spot,
            result.sequence(spot, false),
            result.sequence(spot, true)
        );
    }
}

