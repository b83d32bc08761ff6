//! Parsed spike-sorting output.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::error::{DataError, Result};
use crate::mda::{self, MdaArray, MdaDtype};

/// Spike events grouped by unit, plus the sampling frequency they refer to.
///
/// Spike times are frame indices into the recording that was sorted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Sorting {
    sampling_frequency: f64,
    units: BTreeMap<u32, Vec<u64>>,
    primary_channels: BTreeMap<u32, u32>,
}

/// Compact, serializable overview of a [`Sorting`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SortingSummary {
    pub sampling_frequency: f64,
    pub num_units: usize,
    pub total_spikes: usize,
    pub spikes_per_unit: BTreeMap<u32, usize>,
}

impl Sorting {
    pub fn new(sampling_frequency: f64) -> Self {
        Self {
            sampling_frequency,
            units: BTreeMap::new(),
            primary_channels: BTreeMap::new(),
        }
    }

    /// Add a unit with its spike train. Replaces any existing unit with the same id.
    pub fn with_unit(mut self, unit_id: u32, spike_train: Vec<u64>) -> Self {
        self.units.insert(unit_id, spike_train);
        self
    }

    pub fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    /// Unit ids in ascending order.
    pub fn unit_ids(&self) -> Vec<u32> {
        self.units.keys().copied().collect()
    }

    pub fn spike_train(&self, unit_id: u32) -> Option<&[u64]> {
        self.units.get(&unit_id).map(Vec::as_slice)
    }

    /// Channel on which a unit was detected, when the sorter reports one.
    pub fn primary_channel(&self, unit_id: u32) -> Option<u32> {
        self.primary_channels.get(&unit_id).copied()
    }

    pub fn total_spikes(&self) -> usize {
        self.units.values().map(Vec::len).sum()
    }

    pub fn summary(&self) -> SortingSummary {
        SortingSummary {
            sampling_frequency: self.sampling_frequency,
            num_units: self.units.len(),
            total_spikes: self.total_spikes(),
            spikes_per_unit: self.units.iter().map(|(id, t)| (*id, t.len())).collect(),
        }
    }

    /// Build a sorting from a `firings` array.
    ///
    /// The array must be 2-D with at least three rows: primary channel,
    /// spike frame and unit label. Frames are rounded to the nearest integer
    /// and each unit keeps its spikes in file order.
    pub fn from_firings(firings: &MdaArray, sampling_frequency: f64) -> Result<Self> {
        let (rows, events) = match firings.dims() {
            [r, n] if *r >= 3 => (*r, *n),
            dims => {
                return Err(DataError::Shape {
                    dims: dims.to_vec(),
                    message: "firings must be a 2-D array with at least 3 rows".to_string(),
                });
            }
        };

        let data = firings.data();
        let mut sorting = Self::new(sampling_frequency);
        for event in 0..events {
            let &[channel, frame, label, ..] = data.get(event * rows..).unwrap_or_default() else {
                return Err(DataError::Shape {
                    dims: firings.dims().to_vec(),
                    message: format!("event {event} lies past the end of the payload"),
                });
            };
            if frame < 0.0 || label < 0.0 || !frame.is_finite() || !label.is_finite() {
                return Err(DataError::Shape {
                    dims: firings.dims().to_vec(),
                    message: format!("event {event} has invalid frame {frame} or label {label}"),
                });
            }

            let unit = label.round() as u32;
            sorting.units.entry(unit).or_default().push(frame.round() as u64);
            if channel >= 0.0 {
                sorting.primary_channels.entry(unit).or_insert(channel.round() as u32);
            }
        }

        Ok(sorting)
    }

    /// Encode as a float64 `3 x N` firings array ordered by unit, then spike.
    pub fn to_firings(&self) -> Result<MdaArray> {
        let mut data = Vec::with_capacity(self.total_spikes() * 3);
        for (unit, train) in &self.units {
            let channel = self.primary_channels.get(unit).copied().unwrap_or(0);
            for &frame in train {
                data.push(f64::from(channel));
                data.push(frame as f64);
                data.push(f64::from(*unit));
            }
        }
        let events = data.len() / 3;
        MdaArray::new(MdaDtype::Float64, vec![3, events], data)
    }
}

/// Read a `firings.mda` file.
pub fn read_firings(path: &Path, sampling_frequency: f64) -> Result<Sorting> {
    let array = mda::read_mda(path)?;
    Sorting::from_firings(&array, sampling_frequency)
}

/// Write a sorting as `firings.mda`.
pub fn write_firings(path: &Path, sorting: &Sorting) -> Result<()> {
    mda::write_mda(path, &sorting.to_firings()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_firings_groups_events_by_label() {
        // Columns: (chan, frame, label)
        let arr = MdaArray::new(
            MdaDtype::Float64,
            vec![3, 4],
            vec![
                2.0, 100.0, 1.0, //
                5.0, 150.4, 7.0, //
                2.0, 300.0, 1.0, //
                5.0, 420.6, 7.0,
            ],
        )
        .unwrap();

        let sorting = Sorting::from_firings(&arr, 30_000.0).unwrap();
        assert_eq!(sorting.unit_ids(), vec![1, 7]);
        assert_eq!(sorting.spike_train(1), Some(&[100, 300][..]));
        assert_eq!(sorting.spike_train(7), Some(&[150, 421][..]));
        assert_eq!(sorting.primary_channel(7), Some(5));
        assert_eq!(sorting.total_spikes(), 4);
        assert_eq!(sorting.sampling_frequency(), 30_000.0);
    }

    #[test]
    fn from_firings_rejects_two_row_arrays() {
        let arr = MdaArray::new(MdaDtype::Float64, vec![2, 1], vec![0.0, 1.0]).unwrap();
        assert!(matches!(
            Sorting::from_firings(&arr, 1.0),
            Err(DataError::Shape { .. })
        ));
    }

    #[test]
    fn from_firings_rejects_negative_frames() {
        let arr = MdaArray::new(MdaDtype::Float64, vec![3, 1], vec![0.0, -5.0, 1.0]).unwrap();
        assert!(Sorting::from_firings(&arr, 1.0).is_err());
    }

    #[test]
    fn empty_sorting_encodes_zero_events() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("firings.mda");
        write_firings(&path, &Sorting::new(20_000.0)).unwrap();

        let loaded = read_firings(&path, 20_000.0).unwrap();
        assert!(loaded.unit_ids().is_empty());
        assert_eq!(loaded.total_spikes(), 0);
    }

    #[test]
    fn firings_file_reload_keeps_units() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("firings.mda");
        let sorting = Sorting::new(20_000.0)
            .with_unit(3, vec![10, 20, 30])
            .with_unit(4, vec![15]);
        write_firings(&path, &sorting).unwrap();

        let loaded = read_firings(&path, 20_000.0).unwrap();
        assert_eq!(loaded.unit_ids(), vec![3, 4]);
        assert_eq!(loaded.spike_train(3), Some(&[10, 20, 30][..]));
        assert_eq!(loaded.summary().spikes_per_unit[&4], 1);
    }
}
