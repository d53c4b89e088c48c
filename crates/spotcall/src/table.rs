//! In-memory measurement table keyed by (spot, cycle, wavelength).

use std::collections::{BTreeMap, BTreeSet};

use nalgebra::DVector;

use crate::base::{SpotId, Wavelength};
use crate::features::FeatureLayout;
use crate::measure::{MeasurementRow, SpotStats};

#[derive(Debug, Clone, PartialEq)]
pub enum TableError {
    /// No row exists for the requested key.
    MissingMeasurement {
        spot: SpotId,
        cycle: u32,
        wavelength: Wavelength,
    },
    /// A row with the same key is already present.
    DuplicateMeasurement {
        spot: SpotId,
        cycle: u32,
        wavelength: Wavelength,
    },
}

impl std::fmt::Display for TableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingMeasurement {
                spot,
                cycle,
                wavelength,
            } => write!(
                f,
                "no measurement for {} cycle {} wavelength {}",
                spot, cycle, wavelength
            ),
            Self::DuplicateMeasurement {
                spot,
                cycle,
                wavelength,
            } => write!(
                f,
                "duplicate measurement for {} cycle {} wavelength {}",
                spot, cycle, wavelength
            ),
        }
    }
}

impl std::error::Error for TableError {}

type Key = (SpotId, u32, Wavelength);

/// Append-only table of measurement rows.
#[derive(Debug, Clone, Default)]
pub struct MeasurementTable {
    rows: BTreeMap<Key, MeasurementRow>,
}

impl MeasurementTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Insert one row; a second row for the same key is rejected.
    pub fn insert(&mut self, row: MeasurementRow) -> Result<(), TableError> {
        let key = (row.spot, row.cycle, row.wavelength.clone());
        if self.rows.contains_key(&key) {
            return Err(TableError::DuplicateMeasurement {
                spot: key.0,
                cycle: key.1,
                wavelength: key.2,
            });
        }
        self.rows.insert(key, row);
        Ok(())
    }

    /// Insert all rows, stopping at the first duplicate.
    pub fn extend(&mut self, rows: impl IntoIterator<Item = MeasurementRow>) -> Result<(), TableError> {
        for row in rows {
            self.insert(row)?;
        }
        Ok(())
    }

    pub fn get(
        &self,
        spot: SpotId,
        cycle: u32,
        wavelength: &Wavelength,
    ) -> Result<&MeasurementRow, TableError> {
        self.rows
            .get(&(spot, cycle, wavelength.clone()))
            .ok_or_else(|| TableError::MissingMeasurement {
                spot,
                cycle,
                wavelength: wavelength.clone(),
            })
    }

    pub fn stats(
        &self,
        spot: SpotId,
        cycle: u32,
        wavelength: &Wavelength,
    ) -> Result<&SpotStats, TableError> {
        self.get(spot, cycle, wavelength).map(|r| &r.stats)
    }

    /// Observation vector of one spot at one cycle, in layout order.
    pub fn observation(
        &self,
        spot: SpotId,
        cycle: u32,
        layout: &FeatureLayout,
    ) -> Result<DVector<f64>, TableError> {
        let mut values = Vec::with_capacity(layout.len());
        for wl in &layout.wavelengths {
            layout.push_features(self.stats(spot, cycle, wl)?, &mut values);
        }
        Ok(DVector::from_vec(values))
    }

    /// Rows in (spot, cycle, wavelength) order.
    pub fn rows(&self) -> impl Iterator<Item = &MeasurementRow> {
        self.rows.values()
    }

    pub fn spots(&self) -> Vec<SpotId> {
        let set: BTreeSet<SpotId> = self.rows.keys().map(|k| k.0).collect();
        set.into_iter().collect()
    }

    pub fn cycles(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.rows.keys().map(|k| k.1).collect();
        set.into_iter().collect()
    }

    pub fn wavelengths(&self) -> Vec<Wavelength> {
        let set: BTreeSet<&Wavelength> = self.rows.keys().map(|k| &k.2).collect();
        set.into_iter().cloned().collect()
    }

    pub fn max_cycle(&self) -> Option<u32> {
        self.rows.keys().map(|k| k.1).max()
    }
}
