//! Paged purity bar charts and signal line charts.
//!
//! Purity panels show the four base fractions of every cycle as grouped bars,
//! with the purity (in percent) printed over the called base. Signal panels
//! show each base amount and their total, normalised by the spot's cycle-1
//! total.

use std::path::{Path, PathBuf};

use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};

use super::ReportConfig;
use crate::base::{Base, SpotId, N_BASES};
use crate::call::CallRecord;

type DynError = Box<dyn std::error::Error>;

const PANEL_FONT: i32 = 14;
const BAR_WIDTH: f64 = 1.0 / 6.0;

fn base_color(base: Base) -> RGBColor {
    let [r, g, b] = base.color_rgb();
    RGBColor(r, g, b)
}

/// Records of one spot, in cycle order.
pub(super) struct SpotSeries<'a> {
    pub spot: SpotId,
    pub records: Vec<&'a CallRecord>,
}

impl SpotSeries<'_> {
    fn sequence(&self) -> String {
        self.records.iter().map(|r| r.call.symbol()).collect()
    }
}

pub(super) fn group_by_spot<'a>(
    spots: &[SpotId],
    records: &'a [CallRecord],
) -> Vec<SpotSeries<'a>> {
    spots
        .iter()
        .map(|&spot| SpotSeries {
            spot,
            records: records.iter().filter(|r| r.spot == spot).collect(),
        })
        .collect()
}

fn page_layout(n: usize, config: &ReportConfig) -> (usize, usize, (u32, u32)) {
    let cols = config.grid_cols.min(n).max(1);
    let rows = n.div_ceil(cols).max(1);
    let size = (
        cols as u32 * config.panel_width,
        rows as u32 * config.panel_height,
    );
    (rows, cols, size)
}

// ── Panel data ─────────────────────────────────────────────────────────────

/// One bar of a purity panel.
#[derive(Debug, Clone, Copy, PartialEq)]
struct FractionBar {
    left: f64,
    height: f64,
    base: Base,
}

/// Purity text drawn over the called base's bar.
#[derive(Debug, Clone, PartialEq)]
struct PurityLabel {
    x: f64,
    y: f64,
    text: String,
}

/// Fractions of the clamped amounts; `None` when nothing is left.
fn base_fractions(signal: &[f64; N_BASES]) -> Option<[f64; N_BASES]> {
    let s = signal.map(|v| v.max(0.0));
    let sum: f64 = s.iter().sum();
    (sum > 0.0 && sum.is_finite()).then(|| s.map(|v| v / sum))
}

/// Left edge of the bar of `base`; the four bars of a cycle sit centred on it.
fn bar_left(cycle: u32, base: Base) -> f64 {
    cycle as f64 + (base.index() as f64 - 2.0) * BAR_WIDTH
}

fn purity_bars(records: &[&CallRecord]) -> (Vec<FractionBar>, Vec<PurityLabel>) {
    let mut bars = Vec::with_capacity(records.len() * N_BASES);
    let mut labels = Vec::with_capacity(records.len());
    for r in records {
        let Some(fractions) = r.signal.as_ref().and_then(base_fractions) else {
            continue;
        };
        for base in Base::ALL {
            bars.push(FractionBar {
                left: bar_left(r.cycle, base),
                height: fractions[base.index()],
                base,
            });
        }
        if let (Some(base), Some(purity)) = (r.call.base(), r.call.purity()) {
            labels.push(PurityLabel {
                x: bar_left(r.cycle, base) + BAR_WIDTH / 2.0,
                y: purity + 0.01,
                text: format!("{:.1}", 100.0 * purity),
            });
        }
    }
    (bars, labels)
}

/// Normalised per-base traces and their total.
#[derive(Debug, Clone, Default, PartialEq)]
struct SignalTraces {
    bases: [Vec<(f64, f64)>; N_BASES],
    total: Vec<(f64, f64)>,
}

/// Total amount of the earliest cycle with a signal (cycle 1 when called).
fn reference_total(records: &[&CallRecord]) -> f64 {
    records
        .iter()
        .filter_map(|r| r.signal)
        .map(|s| s.iter().sum::<f64>())
        .find(|t| t.is_finite() && *t != 0.0)
        .unwrap_or(1.0)
}

fn signal_traces(records: &[&CallRecord]) -> SignalTraces {
    let norm = reference_total(records);
    let mut traces = SignalTraces::default();
    for r in records {
        let Some(signal) = r.signal else {
            continue;
        };
        let x = r.cycle as f64;
        for base in Base::ALL {
            traces.bases[base.index()].push((x, signal[base.index()] / norm));
        }
        traces.total.push((x, signal.iter().sum::<f64>() / norm));
    }
    traces
}

// ── Drawing ────────────────────────────────────────────────────────────────

/// Which chart to draw on every panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum PlotKind {
    Purity,
    Signal,
}

/// Draw every page of one chart kind. Returns the written files and the
/// failures (path, message); a failed page does not stop the others.
pub(super) fn draw_pages(
    out_dir: &Path,
    title: &str,
    kind: PlotKind,
    series: &[SpotSeries<'_>],
    n_cycles: usize,
    config: &ReportConfig,
) -> (Vec<PathBuf>, Vec<(PathBuf, String)>) {
    let mut written = Vec::new();
    let mut failed = Vec::new();
    for (page, chunk) in series.chunks(config.spots_per_page).enumerate() {
        let path = out_dir.join(format!("{} {}.png", title, page + 1));
        let res = match kind {
            PlotKind::Purity => draw_purity_page(&path, chunk, n_cycles, config),
            PlotKind::Signal => draw_signal_page(&path, chunk, n_cycles, config),
        };
        match res {
            Ok(()) => written.push(path),
            Err(e) => failed.push((path, e.to_string())),
        }
    }
    (written, failed)
}

fn draw_purity_page(
    path: &Path,
    spots: &[SpotSeries<'_>],
    n_cycles: usize,
    config: &ReportConfig,
) -> Result<(), DynError> {
    let (rows, cols, size) = page_layout(spots.len(), config);
    let root = BitMapBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((rows, cols));
    let x_max = n_cycles as f64 + 0.5;
    let label_style = TextStyle::from(("sans-serif", PANEL_FONT - 6).into_font())
        .pos(Pos::new(HPos::Center, VPos::Bottom));

    for (i, (panel, s)) in panels.iter().zip(spots).enumerate() {
        let mut chart = ChartBuilder::on(panel)
            .caption(
                format!("{} {}", s.spot, s.sequence()),
                ("sans-serif", PANEL_FONT).into_font(),
            )
            .margin(6)
            .x_label_area_size(20)
            .y_label_area_size(30)
            .build_cartesian_2d(0.5f64..x_max, 0f64..1.1f64)?;
        chart
            .configure_mesh()
            .x_labels(n_cycles.min(10))
            .y_labels(3)
            .label_style(("sans-serif", PANEL_FONT - 4).into_font())
            .light_line_style(WHITE.mix(0.0))
            .draw()?;

        let (bars, labels) = purity_bars(&s.records);
        for base in Base::ALL {
            let color = base_color(base);
            let anno = chart.draw_series(bars.iter().filter(|b| b.base == base).map(|b| {
                Rectangle::new(
                    [(b.left, 0.0), (b.left + BAR_WIDTH, b.height)],
                    color.filled(),
                )
            }))?;
            if i == 0 {
                anno.label(base.as_char().to_string()).legend(move |(x, y)| {
                    Rectangle::new([(x, y - 4), (x + 8, y + 4)], color.filled())
                });
            }
        }
        chart.draw_series(
            labels
                .iter()
                .map(|l| Text::new(l.text.clone(), (l.x, l.y), label_style.clone())),
        )?;
        if i == 0 {
            chart
                .configure_series_labels()
                .border_style(BLACK)
                .background_style(WHITE.mix(0.8))
                .label_font(("sans-serif", PANEL_FONT - 4).into_font())
                .draw()?;
        }
    }

    root.present()?;
    Ok(())
}

fn draw_signal_page(
    path: &Path,
    spots: &[SpotSeries<'_>],
    n_cycles: usize,
    config: &ReportConfig,
) -> Result<(), DynError> {
    let (rows, cols, size) = page_layout(spots.len(), config);
    let root = BitMapBackend::new(path, size).into_drawing_area();
    root.fill(&WHITE)?;
    let panels = root.split_evenly((rows, cols));
    let x_max = n_cycles as f64 + 0.5;

    for (i, (panel, s)) in panels.iter().zip(spots).enumerate() {
        let traces = signal_traces(&s.records);
        let values = traces
            .bases
            .iter()
            .chain(std::iter::once(&traces.total))
            .flatten()
            .map(|&(_, y)| y);
        let (lo, hi) = values.fold((0.0f64, 0.0f64), |(lo, hi), v| (lo.min(v), hi.max(v)));
        let hi = if hi > lo { hi * 1.05 } else { lo + 1.0 };

        let mut chart = ChartBuilder::on(panel)
            .caption(
                format!("{} {}", s.spot, s.sequence()),
                ("sans-serif", PANEL_FONT).into_font(),
            )
            .margin(6)
            .x_label_area_size(20)
            .y_label_area_size(40)
            .build_cartesian_2d(0.5f64..x_max, lo..hi)?;
        chart
            .configure_mesh()
            .x_labels(n_cycles.min(10))
            .y_labels(3)
            .label_style(("sans-serif", PANEL_FONT - 4).into_font())
            .light_line_style(WHITE.mix(0.0))
            .draw()?;

        let lines = Base::ALL
            .iter()
            .map(|b| (b.as_char().to_string(), base_color(*b), &traces.bases[b.index()]))
            .chain(std::iter::once(("Total".to_string(), BLACK, &traces.total)));
        for (name, color, points) in lines {
            let anno = chart.draw_series(LineSeries::new(points.iter().copied(), &color))?;
            if i == 0 {
                anno.label(name).legend(move |(x, y)| {
                    PathElement::new(vec![(x, y), (x + 10, y)], color)
                });
            }
            chart.draw_series(
                points
                    .iter()
                    .map(|&(x, y)| Circle::new((x, y), 2, color.filled())),
            )?;
        }
        if i == 0 {
            chart
                .configure_series_labels()
                .border_style(BLACK)
                .background_style(WHITE.mix(0.8))
                .label_font(("sans-serif", PANEL_FONT - 4).into_font())
                .draw()?;
        }
    }

    root.present()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::IndeterminateReason;
    use approx::assert_relative_eq;

    #[test]
    fn page_layout_fills_rows() {
        let cfg = ReportConfig {
            grid_cols: 4,
            panel_width: 100,
            panel_height: 50,
            ..Default::default()
        };
        assert_eq!(page_layout(10, &cfg), (3, 4, (400, 150)));
        assert_eq!(page_layout(2, &cfg), (1, 2, (200, 50)));
    }

    #[test]
    fn grouping_keeps_cycle_order_per_spot() {
        let records = vec![
            CallRecord::from_signal(SpotId(1), 1, [1.0, 0.0, 0.0, 0.0]),
            CallRecord::from_signal(SpotId(2), 1, [0.0, 1.0, 0.0, 0.0]),
            CallRecord::from_signal(SpotId(1), 2, [0.0, 0.0, 0.0, 1.0]),
        ];
        let groups = group_by_spot(&[SpotId(1), SpotId(2)], &records);
        assert_eq!(groups[0].sequence(), "AT");
        assert_eq!(groups[1].sequence(), "C");
    }

    #[test]
    fn purity_panel_has_four_fractions_per_cycle() {
        let records = [
            CallRecord::from_signal(SpotId(1), 1, [6.0, 2.0, 2.0, -1.0]),
            CallRecord::indeterminate(SpotId(1), 2, IndeterminateReason::ZeroSignal),
            CallRecord::from_signal(SpotId(1), 3, [1.0, 1.0, 0.0, 2.0]),
        ];
        let refs: Vec<&CallRecord> = records.iter().collect();
        let (bars, labels) = purity_bars(&refs);

        assert_eq!(bars.len(), 8);
        for (bar, want) in bars[..4].iter().zip([0.6, 0.2, 0.2, 0.0]) {
            assert_relative_eq!(bar.height, want, epsilon = 1e-12);
        }
        assert_relative_eq!(bars[0].left, 1.0 - 2.0 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(bars[7].left + BAR_WIDTH, 3.0 + 2.0 / 6.0, epsilon = 1e-12);

        assert_eq!(labels.len(), 2);
        assert_eq!(labels[0].text, "60.0");
        assert_relative_eq!(labels[0].x, 1.0 - 1.5 / 6.0, epsilon = 1e-12);
        assert_relative_eq!(labels[0].y, 0.61, epsilon = 1e-12);
        // T called in cycle 3
        assert_eq!(labels[1].text, "50.0");
        assert_relative_eq!(labels[1].x, 3.0 + 1.5 / 6.0, epsilon = 1e-12);
    }

    #[test]
    fn signal_traces_are_normalised_by_cycle_one_total() {
        let records = [
            CallRecord::from_signal(SpotId(1), 1, [8.0, 1.0, 1.0, 0.0]),
            CallRecord::from_signal(SpotId(1), 2, [1.0, 4.0, 0.0, 0.0]),
            CallRecord::indeterminate(SpotId(1), 3, IndeterminateReason::MissingMeasurement),
        ];
        let refs: Vec<&CallRecord> = records.iter().collect();
        let traces = signal_traces(&refs);

        assert_eq!(traces.total, vec![(1.0, 1.0), (2.0, 0.5)]);
        assert_eq!(traces.bases[0], vec![(1.0, 0.8), (2.0, 0.1)]);
        assert_eq!(traces.bases[1], vec![(1.0, 0.1), (2.0, 0.4)]);
        assert!(traces.bases.iter().all(|t| t.len() == 2));
    }

    #[test]
    fn missing_first_cycle_falls_back_to_next_total() {
        let records = [
            CallRecord::indeterminate(SpotId(1), 1, IndeterminateReason::UnmixFailed),
            CallRecord::from_signal(SpotId(1), 2, [2.0, 2.0, 0.0, 0.0]),
        ];
        let refs: Vec<&CallRecord> = records.iter().collect();
        assert_relative_eq!(reference_total(&refs), 4.0);
        assert_relative_eq!(reference_total(&[]), 1.0);
    }
}
