//! CSV persistence for measurement rows and call tables.
//!
//! The measurement file is appended to as cycles arrive and can be read back
//! into a [`MeasurementTable`]. The call tables are rewritten on every report.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::base::{SpotId, Wavelength};
use crate::call::CallRecord;
use crate::measure::{MeasurementRow, MeasurementSink, SpotStats};
use crate::table::{MeasurementTable, TableError};

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum CsvIoError {
    Io(std::io::Error),
    Csv(csv::Error),
    /// A record could not be interpreted (1-based data line).
    Parse { line: usize, message: String },
    Table(TableError),
}

impl std::fmt::Display for CsvIoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::Csv(e) => write!(f, "CSV error: {}", e),
            Self::Parse { line, message } => write!(f, "line {}: {}", line, message),
            Self::Table(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for CsvIoError {}

impl From<std::io::Error> for CsvIoError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<csv::Error> for CsvIoError {
    fn from(e: csv::Error) -> Self {
        Self::Csv(e)
    }
}

impl From<TableError> for CsvIoError {
    fn from(e: TableError) -> Self {
        Self::Table(e)
    }
}

// ── Measurement records ────────────────────────────────────────────────────

/// Flat on-disk form of a [`MeasurementRow`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct MeasurementRecord {
    roi: String,
    wavelength: String,
    #[serde(rename = "mean_R")]
    mean_r: f64,
    #[serde(rename = "mean_G")]
    mean_g: f64,
    #[serde(rename = "mean_B")]
    mean_b: f64,
    #[serde(rename = "median_R")]
    median_r: f64,
    #[serde(rename = "median_G")]
    median_g: f64,
    #[serde(rename = "median_B")]
    median_b: f64,
    #[serde(rename = "mean_H")]
    mean_h: f64,
    #[serde(rename = "mean_S")]
    mean_s: f64,
    #[serde(rename = "mean_V")]
    mean_v: f64,
    #[serde(rename = "median_H")]
    median_h: f64,
    #[serde(rename = "median_S")]
    median_s: f64,
    #[serde(rename = "median_V")]
    median_v: f64,
    #[serde(rename = "std_R")]
    std_r: f64,
    #[serde(rename = "std_G")]
    std_g: f64,
    #[serde(rename = "std_B")]
    std_b: f64,
    #[serde(rename = "std_H")]
    std_h: f64,
    #[serde(rename = "std_S")]
    std_s: f64,
    #[serde(rename = "std_V")]
    std_v: f64,
    #[serde(rename = "min_R")]
    min_r: f64,
    #[serde(rename = "min_G")]
    min_g: f64,
    #[serde(rename = "min_B")]
    min_b: f64,
    #[serde(rename = "max_R")]
    max_r: f64,
    #[serde(rename = "max_G")]
    max_g: f64,
    #[serde(rename = "max_B")]
    max_b: f64,
    cycle: u32,
    time: Option<i64>,
}

impl From<&MeasurementRow> for MeasurementRecord {
    fn from(row: &MeasurementRow) -> Self {
        let s = &row.stats;
        Self {
            roi: row.spot.to_string(),
            wavelength: row.wavelength.to_string(),
            mean_r: s.mean_rgb[0],
            mean_g: s.mean_rgb[1],
            mean_b: s.mean_rgb[2],
            median_r: s.median_rgb[0],
            median_g: s.median_rgb[1],
            median_b: s.median_rgb[2],
            mean_h: s.mean_hsv[0],
            mean_s: s.mean_hsv[1],
            mean_v: s.mean_hsv[2],
            median_h: s.median_hsv[0],
            median_s: s.median_hsv[1],
            median_v: s.median_hsv[2],
            std_r: s.std_rgb[0],
            std_g: s.std_rgb[1],
            std_b: s.std_rgb[2],
            std_h: s.std_hsv[0],
            std_s: s.std_hsv[1],
            std_v: s.std_hsv[2],
            min_r: s.min_rgb[0],
            min_g: s.min_rgb[1],
            min_b: s.min_rgb[2],
            max_r: s.max_rgb[0],
            max_g: s.max_rgb[1],
            max_b: s.max_rgb[2],
            cycle: row.cycle,
            time: row.time,
        }
    }
}

impl MeasurementRecord {
    /// The file carries no pixel count; it is restored as 0.
    fn into_row(self) -> Result<MeasurementRow, String> {
        let spot: SpotId = self.roi.parse()?;
        Ok(MeasurementRow {
            spot,
            cycle: self.cycle,
            wavelength: Wavelength::new(self.wavelength),
            time: self.time,
            stats: SpotStats {
                pixel_count: 0,
                mean_rgb: [self.mean_r, self.mean_g, self.mean_b],
                median_rgb: [self.median_r, self.median_g, self.median_b],
                std_rgb: [self.std_r, self.std_g, self.std_b],
                min_rgb: [self.min_r, self.min_g, self.min_b],
                max_rgb: [self.max_r, self.max_g, self.max_b],
                mean_hsv: [self.mean_h, self.mean_s, self.mean_v],
                median_hsv: [self.median_h, self.median_s, self.median_v],
                std_hsv: [self.std_h, self.std_s, self.std_v],
            },
        })
    }
}

/// Default name of the session measurement table.
pub const MEASUREMENT_CSV_FILE: &str = "basecaller_spot_data.csv";

/// Row-by-row measurement writer, flushed after every row.
pub struct MeasurementCsvWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl MeasurementCsvWriter<File> {
    /// Open `path` for appending; the header is written only to a new or
    /// empty file.
    pub fn append_to(path: &Path) -> Result<Self, CsvIoError> {
        let fresh = std::fs::metadata(path).map_or(true, |m| m.len() == 0);
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: csv::WriterBuilder::new()
                .has_headers(fresh)
                .from_writer(file),
        })
    }
}

impl<W: Write> MeasurementCsvWriter<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
        }
    }

    pub fn write_row(&mut self, row: &MeasurementRow) -> Result<(), CsvIoError> {
        self.writer.serialize(MeasurementRecord::from(row))?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> Result<W, CsvIoError> {
        self.writer
            .into_inner()
            .map_err(|e| CsvIoError::Io(e.into_error()))
    }
}

impl<W: Write> MeasurementSink for MeasurementCsvWriter<W> {
    fn append(&mut self, row: &MeasurementRow) -> std::io::Result<()> {
        self.write_row(row).map_err(|e| match e {
            CsvIoError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::Other, other.to_string()),
        })
    }
}

/// Rebuild a measurement table from CSV data.
pub fn read_measurements<R: Read>(reader: R) -> Result<MeasurementTable, CsvIoError> {
    let mut rdr = csv::Reader::from_reader(reader);
    let mut table = MeasurementTable::new();
    for (i, record) in rdr.deserialize::<MeasurementRecord>().enumerate() {
        let row = record?
            .into_row()
            .map_err(|message| CsvIoError::Parse { line: i + 1, message })?;
        table.insert(row)?;
    }
    Ok(table)
}

pub fn read_measurement_csv(path: &Path) -> Result<MeasurementTable, CsvIoError> {
    read_measurements(File::open(path)?)
}

// ── Call tables ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct CallCsvRecord {
    roi: String,
    cycle: u32,
    #[serde(rename = "signal_A")]
    signal_a: Option<f64>,
    #[serde(rename = "signal_C")]
    signal_c: Option<f64>,
    #[serde(rename = "signal_G")]
    signal_g: Option<f64>,
    #[serde(rename = "signal_T")]
    signal_t: Option<f64>,
    base: char,
    purity: Option<f64>,
    chastity: Option<f64>,
    status: String,
}

impl From<&CallRecord> for CallCsvRecord {
    fn from(r: &CallRecord) -> Self {
        let sig = |i: usize| r.signal.map(|s| s[i]);
        Self {
            roi: r.spot.to_string(),
            cycle: r.cycle,
            signal_a: sig(0),
            signal_c: sig(1),
            signal_g: sig(2),
            signal_t: sig(3),
            base: r.call.symbol(),
            purity: r.call.purity(),
            chastity: r.call.chastity(),
            status: match r.call {
                crate::call::BaseCall::Called { .. } => "ok".to_string(),
                crate::call::BaseCall::Indeterminate(reason) => reason.to_string(),
            },
        }
    }
}

/// Write a full pre- or post-phase call table.
pub fn write_call_table<W: Write>(writer: W, records: &[CallRecord]) -> Result<(), CsvIoError> {
    let mut wtr = csv::Writer::from_writer(writer);
    for r in records {
        wtr.serialize(CallCsvRecord::from(r))?;
    }
    wtr.flush()?;
    Ok(())
}

pub fn write_call_csv(path: &Path, records: &[CallRecord]) -> Result<(), CsvIoError> {
    write_call_table(File::create(path)?, records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::IndeterminateReason;
    use crate::measure::stats_for_pixels;

    fn row(spot: u32, cycle: u32, wl: &str) -> MeasurementRow {
        MeasurementRow {
            spot: SpotId(spot),
            cycle,
            wavelength: wl.into(),
            time: Some(1_700_000_000),
            stats: stats_for_pixels(&[[10, 20, 30], [30, 40, 50]], 65535.0).unwrap(),
        }
    }

    #[test]
    fn measurement_header_matches_legacy_columns() {
        let mut w = MeasurementCsvWriter::from_writer(Vec::new());
        w.write_row(&row(1, 1, "445")).unwrap();
        let text = String::from_utf8(w.into_inner().unwrap()).unwrap();
        let header = text.lines().next().unwrap();
        assert_eq!(
            header,
            "roi,wavelength,mean_R,mean_G,mean_B,median_R,median_G,median_B,\
             mean_H,mean_S,mean_V,median_H,median_S,median_V,std_R,std_G,std_B,\
             std_H,std_S,std_V,min_R,min_G,min_B,max_R,max_G,max_B,cycle,time"
        );
        assert!(text.lines().nth(1).unwrap().starts_with("spot_001,445,20.0,30.0,40.0"));
    }

    #[test]
    fn measurements_read_back_into_table() {
        let mut w = MeasurementCsvWriter::from_writer(Vec::new());
        for r in [row(1, 1, "445"), row(1, 1, "525"), row(12, 2, "445")] {
            w.append(&r).unwrap();
        }
        let bytes = w.into_inner().unwrap();
        let table = read_measurements(bytes.as_slice()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.spots(), vec![SpotId(1), SpotId(12)]);
        let got = table.get(SpotId(12), 2, &"445".into()).unwrap();
        let want = row(12, 2, "445");
        assert_eq!(got.time, want.time);
        assert_eq!(got.stats.mean_rgb, want.stats.mean_rgb);
        assert_eq!(got.stats.std_hsv, want.stats.std_hsv);
    }

    #[test]
    fn bad_roi_reports_line() {
        let mut w = MeasurementCsvWriter::from_writer(Vec::new());
        w.write_row(&row(1, 1, "445")).unwrap();
        let text = String::from_utf8(w.into_inner().unwrap())
            .unwrap()
            .replace("spot_001", "spot_x");
        let err = read_measurements(text.as_bytes()).unwrap_err();
        assert!(matches!(err, CsvIoError::Parse { line: 1, .. }));
    }

    #[test]
    fn indeterminate_calls_have_empty_numeric_cells() {
        let records = vec![
            CallRecord::from_signal(SpotId(1), 1, [0.7, 0.2, 0.05, 0.05]),
            CallRecord::indeterminate(SpotId(2), 1, IndeterminateReason::UnmixFailed),
        ];
        let mut out = Vec::new();
        write_call_table(&mut out, &records).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "roi,cycle,signal_A,signal_C,signal_G,signal_T,base,purity,chastity,status"
        );
        assert!(lines[1].starts_with("spot_001,1,0.7,0.2,0.05,0.05,A,"));
        assert!(lines[1].ends_with(",ok"));
        assert_eq!(lines[2], "spot_002,1,,,,,!,,,unmix_failed");
    }
}
