//! Multi-wavelength image set for one acquisition cycle.
//!
//! Each excitation wavelength contributes one RGB frame. Frames are stored as
//! 16-bit RGB regardless of the source depth; [`PixelDepth`] remembers the
//! source full scale so that HSV conversion can normalize into `[0, 1]`.

use image::{ColorType, DynamicImage, ImageBuffer, Rgb};

use crate::base::Wavelength;

/// 16-bit RGB frame.
pub type Rgb16Image = ImageBuffer<Rgb<u16>, Vec<u16>>;

// ── Error type ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ImageSetError {
    /// No channels were supplied.
    Empty,
    /// A channel's dimensions differ from the first channel.
    ShapeMismatch {
        wavelength: Wavelength,
        expected: (u32, u32),
        got: (u32, u32),
    },
    /// Channels were decoded from different color types.
    DepthMismatch {
        wavelength: Wavelength,
        expected: PixelDepth,
        got: PixelDepth,
    },
    /// The same wavelength appears twice.
    DuplicateWavelength(Wavelength),
    /// Source color type is not 8/16-bit gray or RGB.
    UnsupportedColor { wavelength: Wavelength, color: String },
    /// A subtrahend frame was supplied for a wavelength that is not in the set.
    UnknownWavelength(Wavelength),
}

impl std::fmt::Display for ImageSetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "image set has no channels"),
            Self::ShapeMismatch {
                wavelength,
                expected,
                got,
            } => write!(
                f,
                "channel {} is {}x{}, expected {}x{}",
                wavelength, got.0, got.1, expected.0, expected.1
            ),
            Self::DepthMismatch {
                wavelength,
                expected,
                got,
            } => write!(
                f,
                "channel {} has depth {:?}, expected {:?}",
                wavelength, got, expected
            ),
            Self::DuplicateWavelength(w) => write!(f, "duplicate wavelength {}", w),
            Self::UnsupportedColor { wavelength, color } => {
                write!(f, "channel {} has unsupported color type {}", wavelength, color)
            }
            Self::UnknownWavelength(w) => write!(f, "wavelength {} is not in the image set", w),
        }
    }
}

impl std::error::Error for ImageSetError {}

// ── Types ──────────────────────────────────────────────────────────────────

/// Bit depth of the source frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelDepth {
    Eight,
    Sixteen,
}

impl PixelDepth {
    /// Largest representable pixel value.
    pub fn full_scale(self) -> f64 {
        match self {
            Self::Eight => u8::MAX as f64,
            Self::Sixteen => u16::MAX as f64,
        }
    }

    fn of(color: ColorType) -> Option<Self> {
        match color {
            ColorType::L8 | ColorType::Rgb8 | ColorType::La8 | ColorType::Rgba8 => Some(Self::Eight),
            ColorType::L16 | ColorType::Rgb16 | ColorType::La16 | ColorType::Rgba16 => {
                Some(Self::Sixteen)
            }
            _ => None,
        }
    }
}

/// A single excitation channel.
#[derive(Debug, Clone)]
pub struct ChannelImage {
    pub wavelength: Wavelength,
    pub image: Rgb16Image,
    /// Acquisition timestamp of this frame, if known.
    pub timestamp: Option<i64>,
}

/// Ordered set of equally-sized frames, one per excitation wavelength.
#[derive(Debug, Clone)]
pub struct ImageSet {
    cycle: u32,
    depth: PixelDepth,
    dims: (u32, u32),
    channels: Vec<ChannelImage>,
}

impl ImageSet {
    /// Validate and assemble an image set from 16-bit RGB frames.
    pub fn new(
        cycle: u32,
        depth: PixelDepth,
        channels: Vec<ChannelImage>,
    ) -> Result<Self, ImageSetError> {
        let first = channels.first().ok_or(ImageSetError::Empty)?;
        let dims = first.image.dimensions();
        for (i, ch) in channels.iter().enumerate() {
            if ch.image.dimensions() != dims {
                return Err(ImageSetError::ShapeMismatch {
                    wavelength: ch.wavelength.clone(),
                    expected: dims,
                    got: ch.image.dimensions(),
                });
            }
            if channels[..i].iter().any(|c| c.wavelength == ch.wavelength) {
                return Err(ImageSetError::DuplicateWavelength(ch.wavelength.clone()));
            }
        }
        Ok(Self {
            cycle,
            depth,
            dims,
            channels,
        })
    }

    /// Assemble from decoded images of any 8/16-bit gray or RGB color type.
    ///
    /// Gray frames are replicated into R, G and B. All frames must share one
    /// source depth.
    pub fn from_dynamic(
        cycle: u32,
        frames: Vec<(Wavelength, DynamicImage, Option<i64>)>,
    ) -> Result<Self, ImageSetError> {
        let mut depth = None;
        let mut channels = Vec::with_capacity(frames.len());
        for (wavelength, img, timestamp) in frames {
            let this = PixelDepth::of(img.color()).ok_or_else(|| ImageSetError::UnsupportedColor {
                wavelength: wavelength.clone(),
                color: format!("{:?}", img.color()),
            })?;
            match depth {
                None => depth = Some(this),
                Some(d) if d != this => {
                    return Err(ImageSetError::DepthMismatch {
                        wavelength,
                        expected: d,
                        got: this,
                    })
                }
                Some(_) => {}
            }
            // to_rgb16 rescales 8-bit sources; undo that so values stay in
            // source units.
            let mut image = img.to_rgb16();
            if this == PixelDepth::Eight {
                for p in image.pixels_mut() {
                    for c in p.0.iter_mut() {
                        *c /= 257;
                    }
                }
            }
            channels.push(ChannelImage {
                wavelength,
                image,
                timestamp,
            });
        }
        Self::new(cycle, depth.unwrap_or(PixelDepth::Sixteen), channels)
    }

    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn depth(&self) -> PixelDepth {
        self.depth
    }

    /// Frame size as (width, height).
    pub fn dimensions(&self) -> (u32, u32) {
        self.dims
    }

    pub fn channels(&self) -> &[ChannelImage] {
        &self.channels
    }

    pub fn wavelengths(&self) -> Vec<Wavelength> {
        self.channels.iter().map(|c| c.wavelength.clone()).collect()
    }

    pub fn get(&self, wavelength: &Wavelength) -> Option<&Rgb16Image> {
        self.channels
            .iter()
            .find(|c| &c.wavelength == wavelength)
            .map(|c| &c.image)
    }

    pub fn contains(&self, wavelength: &Wavelength) -> bool {
        self.channels.iter().any(|c| &c.wavelength == wavelength)
    }

    /// Rounded mean of the known channel timestamps.
    pub fn time_avg(&self) -> Option<i64> {
        let times: Vec<i64> = self.channels.iter().filter_map(|c| c.timestamp).collect();
        if times.is_empty() {
            return None;
        }
        let sum: f64 = times.iter().map(|&t| t as f64).sum();
        Some((sum / times.len() as f64).round() as i64)
    }

    /// Subtract the dark reference frame from every other channel and drop it.
    ///
    /// Subtraction saturates at zero. Returns `false` when the set carries no
    /// dark channel, in which case it is left untouched.
    pub fn subtract_dark(&mut self, dark: &Wavelength) -> bool {
        let Some(idx) = self.channels.iter().position(|c| &c.wavelength == dark) else {
            return false;
        };
        let dark_frame = self.channels.remove(idx).image;
        for ch in &mut self.channels {
            saturating_sub_in_place(&mut ch.image, &dark_frame);
        }
        true
    }

    /// Subtract a per-wavelength reference frame (temporal difference images).
    pub fn subtract_frame(
        &mut self,
        wavelength: &Wavelength,
        frame: &Rgb16Image,
    ) -> Result<(), ImageSetError> {
        let dims = self.dims;
        let ch = self
            .channels
            .iter_mut()
            .find(|c| &c.wavelength == wavelength)
            .ok_or_else(|| ImageSetError::UnknownWavelength(wavelength.clone()))?;
        if frame.dimensions() != dims {
            return Err(ImageSetError::ShapeMismatch {
                wavelength: wavelength.clone(),
                expected: dims,
                got: frame.dimensions(),
            });
        }
        saturating_sub_in_place(&mut ch.image, frame);
        Ok(())
    }

    /// Drop a channel without subtracting it.
    pub fn remove(&mut self, wavelength: &Wavelength) -> Option<ChannelImage> {
        let idx = self.channels.iter().position(|c| &c.wavelength == wavelength)?;
        Some(self.channels.remove(idx))
    }
}

fn saturating_sub_in_place(img: &mut Rgb16Image, sub: &Rgb16Image) {
    for (p, s) in img.pixels_mut().zip(sub.pixels()) {
        for c in 0..3 {
            p.0[c] = p.0[c].saturating_sub(s.0[c]);
        }
    }
}
