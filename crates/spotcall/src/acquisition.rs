//! Loading per-cycle image sets from an acquisition directory.
//!
//! Files are named `<prefix>_<wavelength>_C<cycle:03>_<time>.<ext>`. Within a
//! cycle, files sort by name; the UV channel uses its first frame and every
//! other channel its last frame.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::base::Wavelength;
use crate::features::FeatureConfig;
use crate::image_set::{ImageSet, ImageSetError};

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum AcquisitionError {
    Io(std::io::Error),
    NoFiles { cycle: u32 },
    MissingUv { cycle: u32, uv: Wavelength },
    Image { path: PathBuf, source: image::ImageError },
    ImageSet(ImageSetError),
}

impl std::fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {}", e),
            Self::NoFiles { cycle } => write!(f, "no image files for cycle {}", cycle),
            Self::MissingUv { cycle, uv } => write!(f, "no {} images in cycle {}", uv, cycle),
            Self::Image { path, source } => write!(f, "{}: {}", path.display(), source),
            Self::ImageSet(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for AcquisitionError {}

impl From<std::io::Error> for AcquisitionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<ImageSetError> for AcquisitionError {
    fn from(e: ImageSetError) -> Self {
        Self::ImageSet(e)
    }
}

// ── Config ─────────────────────────────────────────────────────────────────

/// How the background is removed from the visible channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DifferenceMode {
    /// Subtract the dark (`000`) frame, then drop it.
    #[default]
    Dark,
    /// Subtract each visible channel's first frame from its last frame.
    Temporal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    pub difference_mode: DifferenceMode,
    /// Accepted file extensions (case-insensitive).
    pub extensions: Vec<String>,
    /// Stamp rows with per-channel times instead of the set average.
    pub kinetic: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            difference_mode: DifferenceMode::Dark,
            extensions: vec!["tif".into(), "tiff".into(), "png".into()],
            kinetic: false,
        }
    }
}

// ── File names ─────────────────────────────────────────────────────────────

/// One frame file with the fields encoded in its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionFile {
    pub path: PathBuf,
    pub wavelength: Wavelength,
    pub cycle: u32,
    pub time: i64,
}

/// Parse `<prefix>_<wavelength>_C<cycle>_<time>.<ext>`.
pub fn parse_file_name(path: &Path) -> Option<AcquisitionFile> {
    let stem = path.file_stem()?.to_str()?;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() < 3 {
        return None;
    }
    let n = parts.len();
    let cycle = parts[n - 2].strip_prefix('C')?.parse().ok()?;
    let time = parts[n - 1].parse().ok()?;
    let wavelength = parts[n - 3];
    if wavelength.is_empty() {
        return None;
    }
    Some(AcquisitionFile {
        path: path.to_path_buf(),
        wavelength: Wavelength::from(wavelength),
        cycle,
        time,
    })
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
}

/// Frame files of one cycle, sorted by name.
pub fn list_cycle_files(
    dir: &Path,
    cycle: u32,
    config: &AcquisitionConfig,
) -> Result<Vec<AcquisitionFile>, AcquisitionError> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || !has_extension(&path, &config.extensions) {
            continue;
        }
        if let Some(f) = parse_file_name(&path) {
            if f.cycle == cycle {
                files.push(f);
            }
        }
    }
    files.sort_by(|a, b| a.path.file_name().cmp(&b.path.file_name()));
    Ok(files)
}

/// Cycle indices present in `dir`, ascending.
pub fn list_cycles(dir: &Path, config: &AcquisitionConfig) -> Result<Vec<u32>, AcquisitionError> {
    let mut cycles = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && has_extension(&path, &config.extensions) {
            if let Some(f) = parse_file_name(&path) {
                cycles.push(f.cycle);
            }
        }
    }
    cycles.sort_unstable();
    cycles.dedup();
    Ok(cycles)
}

/// Frames chosen for one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSelection {
    /// One frame per kept wavelength (dark included in `Dark` mode).
    pub frames: Vec<AcquisitionFile>,
    /// First frames subtracted in `Temporal` mode, per visible wavelength.
    pub subtrahends: Vec<AcquisitionFile>,
}

/// Pick frames from a sorted file list.
pub fn select_frames(
    files: &[AcquisitionFile],
    cycle: u32,
    features: &FeatureConfig,
    mode: DifferenceMode,
) -> Result<FrameSelection, AcquisitionError> {
    if files.is_empty() {
        return Err(AcquisitionError::NoFiles { cycle });
    }
    let uv = &features.uv_wavelength;
    let dark = &features.dark_wavelength;
    let mut wavelengths: Vec<&Wavelength> = files.iter().map(|f| &f.wavelength).collect();
    wavelengths.sort();
    wavelengths.dedup();
    if !wavelengths.contains(&uv) {
        return Err(AcquisitionError::MissingUv {
            cycle,
            uv: uv.clone(),
        });
    }

    let mut sel = FrameSelection {
        frames: Vec::new(),
        subtrahends: Vec::new(),
    };
    for wl in wavelengths {
        let mut of_wl = files.iter().filter(|f| &f.wavelength == wl);
        // non-empty: wl was collected from `files`
        let Some(first) = of_wl.next() else { continue };
        let last = of_wl.last().unwrap_or(first);
        if wl == uv {
            sel.frames.push(first.clone());
            continue;
        }
        match mode {
            DifferenceMode::Dark => sel.frames.push(last.clone()),
            DifferenceMode::Temporal if wl == dark => {}
            DifferenceMode::Temporal => {
                sel.frames.push(last.clone());
                if last.path != first.path {
                    sel.subtrahends.push(first.clone());
                } else {
                    tracing::warn!(
                        "Cycle {}: single {} frame, no temporal difference applied",
                        cycle,
                        wl
                    );
                }
            }
        }
    }
    Ok(sel)
}

fn open_image(path: &Path) -> Result<image::DynamicImage, AcquisitionError> {
    image::open(path).map_err(|source| AcquisitionError::Image {
        path: path.to_path_buf(),
        source,
    })
}

/// Load and background-correct the image set of one cycle.
pub fn load_cycle(
    dir: &Path,
    cycle: u32,
    features: &FeatureConfig,
    config: &AcquisitionConfig,
) -> Result<ImageSet, AcquisitionError> {
    let files = list_cycle_files(dir, cycle, config)?;
    let sel = select_frames(&files, cycle, features, config.difference_mode)?;

    let frames = sel
        .frames
        .iter()
        .map(|f| Ok((f.wavelength.clone(), open_image(&f.path)?, Some(f.time))))
        .collect::<Result<Vec<_>, AcquisitionError>>()?;
    let mut set = ImageSet::from_dynamic(cycle, frames)?;

    match config.difference_mode {
        DifferenceMode::Dark => {
            if !set.subtract_dark(&features.dark_wavelength) {
                tracing::warn!(
                    "Cycle {}: no {} frame, images used without dark subtraction",
                    cycle,
                    features.dark_wavelength
                );
            }
        }
        DifferenceMode::Temporal => {
            for sub in &sel.subtrahends {
                let img = ImageSet::from_dynamic(
                    cycle,
                    vec![(sub.wavelength.clone(), open_image(&sub.path)?, None)],
                )?;
                if let Some(frame) = img.get(&sub.wavelength) {
                    set.subtract_frame(&sub.wavelength, frame)?;
                }
            }
        }
    }

    tracing::info!(
        "Loaded cycle {} from {}: {} channels ({:?})",
        cycle,
        dir.display(),
        set.channels().len(),
        config.difference_mode
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str) -> AcquisitionFile {
        parse_file_name(Path::new(name)).unwrap()
    }

    #[test]
    fn parses_legacy_names() {
        let f = file("/data/00000011_001A_00011_365_C002_000601578.tif");
        assert_eq!(f.wavelength.as_str(), "365");
        assert_eq!(f.cycle, 2);
        assert_eq!(f.time, 601578);
        assert!(parse_file_name(Path::new("notes.txt")).is_none());
        assert!(parse_file_name(Path::new("a_445_X001_12.tif")).is_none());
    }

    #[test]
    fn uv_takes_first_and_visible_takes_last() {
        let files = vec![
            file("s_000_C001_10.tif"),
            file("s_365_C001_11.tif"),
            file("s_365_C001_12.tif"),
            file("s_445_C001_13.tif"),
            file("s_445_C001_14.tif"),
        ];
        let cfg = FeatureConfig::default();
        let sel = select_frames(&files, 1, &cfg, DifferenceMode::Dark).unwrap();
        let times: Vec<i64> = sel.frames.iter().map(|f| f.time).collect();
        assert_eq!(times, vec![10, 11, 14]);
        assert!(sel.subtrahends.is_empty());

        let sel = select_frames(&files, 1, &cfg, DifferenceMode::Temporal).unwrap();
        let times: Vec<i64> = sel.frames.iter().map(|f| f.time).collect();
        assert_eq!(times, vec![11, 14]);
        assert_eq!(sel.subtrahends.len(), 1);
        assert_eq!(sel.subtrahends[0].time, 13);
    }

    #[test]
    fn missing_uv_is_an_error() {
        let files = vec![file("s_445_C003_1.tif")];
        assert!(matches!(
            select_frames(&files, 3, &FeatureConfig::default(), DifferenceMode::Dark),
            Err(AcquisitionError::MissingUv { cycle: 3, .. })
        ));
        assert!(matches!(
            select_frames(&[], 3, &FeatureConfig::default(), DifferenceMode::Dark),
            Err(AcquisitionError::NoFiles { cycle: 3 })
        ));
    }

    #[test]
    fn loads_and_subtracts_dark_from_directory() {
        let dir = std::env::temp_dir().join(format!("spotcall_acq_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let save = |name: &str, v: u16| {
            image::ImageBuffer::<image::Rgb<u16>, Vec<u16>>::from_pixel(4, 3, image::Rgb([v, v, v]))
                .save(dir.join(name))
                .unwrap();
        };
        save("x_000_C001_100.png", 10);
        save("x_365_C001_101.png", 500);
        save("x_445_C001_102.png", 300);
        save("x_445_C002_200.png", 999);
        std::fs::write(dir.join("notes.txt"), "x").unwrap();
        assert_eq!(list_cycles(&dir, &AcquisitionConfig::default()).unwrap(), vec![1, 2]);

        let set = load_cycle(&dir, 1, &FeatureConfig::default(), &AcquisitionConfig::default())
            .unwrap();
        assert_eq!(set.wavelengths(), vec![Wavelength::from("365"), "445".into()]);
        assert_eq!(set.get(&"445".into()).unwrap().get_pixel(0, 0).0, [290; 3]);
        assert_eq!(set.time_avg(), Some(102));
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
