//! Nucleotide identities and the small value types shared by every stage.

use std::fmt;
use std::str::FromStr;

/// One of the four bases, in the column order of the basis matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub enum Base {
    A,
    C,
    G,
    T,
}

/// Number of bases (columns of the basis matrix).
pub const N_BASES: usize = 4;

impl Base {
    /// All bases in column order.
    pub const ALL: [Base; N_BASES] = [Base::A, Base::C, Base::G, Base::T];

    /// Column index (A=0, C=1, G=2, T=3).
    pub fn index(self) -> usize {
        match self {
            Self::A => 0,
            Self::C => 1,
            Self::G => 2,
            Self::T => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn as_char(self) -> char {
        match self {
            Self::A => 'A',
            Self::C => 'C',
            Self::G => 'G',
            Self::T => 'T',
        }
    }

    /// Plot color as 8-bit RGB.
    pub fn color_rgb(self) -> [u8; 3] {
        match self {
            Self::A => [255, 165, 0],
            Self::C => [0, 160, 0],
            Self::G => [0, 0, 255],
            Self::T => [255, 0, 0],
        }
    }
}

impl fmt::Display for Base {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Identifier of a labelled spot, stable for the whole session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct SpotId(pub u32);

impl fmt::Display for SpotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "spot_{:03}", self.0)
    }
}

impl FromStr for SpotId {
    type Err = String;

    /// Accepts both `spot_007` and a bare `7`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim().trim_start_matches("spot_");
        digits
            .parse::<u32>()
            .map(SpotId)
            .map_err(|e| format!("invalid spot id '{}': {}", s, e))
    }
}

/// Excitation channel label, e.g. `"365"` or `"645"` (nanometres).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct Wavelength(pub String);

impl Wavelength {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Wavelength {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Wavelength {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_index_roundtrip() {
        for (i, b) in Base::ALL.iter().enumerate() {
            assert_eq!(b.index(), i);
            assert_eq!(Base::from_index(i), Some(*b));
        }
        assert_eq!(Base::from_index(4), None);
    }

    #[test]
    fn spot_id_display_and_parse() {
        let id = SpotId(7);
        assert_eq!(id.to_string(), "spot_007");
        assert_eq!("spot_007".parse::<SpotId>().unwrap(), id);
        assert_eq!("12".parse::<SpotId>().unwrap(), SpotId(12));
        assert!("spot_x".parse::<SpotId>().is_err());
    }
}
