//! Multichannel recording abstraction and its on-disk writers.
//!
//! The launcher never processes samples itself. It only needs to know the
//! sampling frequency, copy the traces into whatever file format a sorter
//! expects, and (for grouped runs) split channels by a property.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::error::{DataError, Result};
use crate::mda::{self, MdaArray, MdaDtype};

/// Channel property used for grouped runs unless the caller names another.
pub const GROUP_PROPERTY: &str = "group";

/// Read-only view of multichannel time-series data.
pub trait Recording: Send + Sync {
    /// Sampling frequency in Hz.
    fn sampling_frequency(&self) -> f64;

    /// Channel identifiers, in storage order.
    fn channel_ids(&self) -> &[u32];

    /// Number of samples per channel.
    fn num_frames(&self) -> usize;

    /// Samples of the channel at `channel_index` (an index into
    /// [`Recording::channel_ids`], not a channel id).
    fn trace(&self, channel_index: usize) -> Option<&[f32]>;

    /// Per-channel values of a named property, aligned with `channel_ids`.
    fn channel_property(&self, property: &str) -> Option<&[String]>;

    /// Names of all channel properties carried by this recording.
    fn property_names(&self) -> Vec<&str> {
        Vec::new()
    }

    fn num_channels(&self) -> usize {
        self.channel_ids().len()
    }
}

/// A recording whose traces live in memory.
#[derive(Debug, Clone, PartialEq)]
pub struct InMemoryRecording {
    sampling_frequency: f64,
    channel_ids: Vec<u32>,
    traces: Vec<Vec<f32>>,
    properties: BTreeMap<String, Vec<String>>,
}

impl InMemoryRecording {
    /// Build a recording from one trace per channel.
    ///
    /// All traces must have the same length and the sampling frequency must
    /// be a positive finite number.
    pub fn new(sampling_frequency: f64, channel_ids: Vec<u32>, traces: Vec<Vec<f32>>) -> Result<Self> {
        if !(sampling_frequency.is_finite() && sampling_frequency > 0.0) {
            return Err(DataError::InvalidRecording(format!(
                "sampling frequency must be positive, got {sampling_frequency}"
            )));
        }
        if channel_ids.len() != traces.len() {
            return Err(DataError::InvalidRecording(format!(
                "{} channel ids but {} traces",
                channel_ids.len(),
                traces.len()
            )));
        }
        if let Some(first) = traces.first() {
            if let Some(bad) = traces.iter().position(|t| t.len() != first.len()) {
                return Err(DataError::InvalidRecording(format!(
                    "trace {bad} has {} frames, expected {}",
                    traces[bad].len(),
                    first.len()
                )));
            }
        }

        Ok(Self {
            sampling_frequency,
            channel_ids,
            traces,
            properties: BTreeMap::new(),
        })
    }

    /// Attach a per-channel property. `values` must have one entry per channel.
    pub fn with_property(mut self, name: impl Into<String>, values: Vec<String>) -> Result<Self> {
        let name = name.into();
        if values.len() != self.channel_ids.len() {
            return Err(DataError::InvalidRecording(format!(
                "property {name:?} has {} values for {} channels",
                values.len(),
                self.channel_ids.len()
            )));
        }
        self.properties.insert(name, values);
        Ok(self)
    }

    /// Shorthand for attaching the [`GROUP_PROPERTY`].
    pub fn with_groups<T: ToString>(self, groups: &[T]) -> Result<Self> {
        self.with_property(GROUP_PROPERTY, groups.iter().map(ToString::to_string).collect())
    }
}

impl Recording for InMemoryRecording {
    fn sampling_frequency(&self) -> f64 {
        self.sampling_frequency
    }

    fn channel_ids(&self) -> &[u32] {
        &self.channel_ids
    }

    fn num_frames(&self) -> usize {
        self.traces.first().map_or(0, Vec::len)
    }

    fn trace(&self, channel_index: usize) -> Option<&[f32]> {
        self.traces.get(channel_index).map(Vec::as_slice)
    }

    fn channel_property(&self, property: &str) -> Option<&[String]> {
        self.properties.get(property).map(Vec::as_slice)
    }

    fn property_names(&self) -> Vec<&str> {
        self.properties.keys().map(String::as_str).collect()
    }
}

/// Partition a recording by the value of a channel property.
///
/// Each sub-recording keeps the sampling frequency, the channels that share
/// one property value (in their original order), and every other property
/// restricted to those channels. Fails if the property is missing.
pub fn split_by_property(
    recording: &dyn Recording,
    property: &str,
) -> Result<BTreeMap<String, InMemoryRecording>> {
    let channel_ids = recording.channel_ids();
    let values = recording
        .channel_property(property)
        .ok_or_else(|| DataError::MissingProperty {
            channel_id: channel_ids.first().copied().unwrap_or_default(),
            property: property.to_string(),
        })?;

    let mut members: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (index, value) in values.iter().enumerate() {
        members.entry(value.clone()).or_default().push(index);
    }

    let mut groups = BTreeMap::new();
    for (value, indices) in members {
        let mut ids = Vec::with_capacity(indices.len());
        let mut traces = Vec::with_capacity(indices.len());
        for &i in &indices {
            let trace = recording.trace(i).ok_or_else(|| {
                DataError::InvalidRecording(format!("channel index {i} has no trace"))
            })?;
            ids.push(channel_ids[i]);
            traces.push(trace.to_vec());
        }

        let mut sub = InMemoryRecording::new(recording.sampling_frequency(), ids, traces)?;
        for name in recording.property_names() {
            if let Some(all) = recording.channel_property(name) {
                let subset = indices.iter().map(|&i| all[i].clone()).collect();
                sub = sub.with_property(name, subset)?;
            }
        }

        debug!(property, group = %value, channels = indices.len(), "split recording group");
        groups.insert(value, sub);
    }

    Ok(groups)
}

/// Serializes a recording into a sorter's native input format.
pub trait RecordingWriter: Send + Sync {
    /// Name the format is known by in sorter scripts (e.g. `mda`).
    fn format(&self) -> &str;

    /// File name the recording is written to inside the output folder.
    fn file_name(&self) -> &str;

    /// Write `recording` to `path`.
    fn write(&self, recording: &dyn Recording, path: &Path) -> Result<()>;
}

/// Writes recordings as a `channels x frames` float32 MDA array.
#[derive(Debug, Clone, Copy, Default)]
pub struct MdaRecordingWriter;

impl MdaRecordingWriter {
    /// Lay the traces out column-major: all channels of frame 0, then frame 1...
    pub fn to_array(recording: &dyn Recording) -> Result<MdaArray> {
        let channels = recording.num_channels();
        let frames = recording.num_frames();
        let traces: Vec<&[f32]> = (0..channels)
            .map(|i| {
                recording.trace(i).ok_or_else(|| {
                    DataError::InvalidRecording(format!("channel index {i} has no trace"))
                })
            })
            .collect::<Result<_>>()?;

        let mut data = Vec::with_capacity(channels * frames);
        for frame in 0..frames {
            for trace in &traces {
                data.push(f64::from(trace[frame]));
            }
        }

        MdaArray::new(MdaDtype::Float32, vec![channels, frames], data)
    }
}

impl RecordingWriter for MdaRecordingWriter {
    fn format(&self) -> &str {
        "mda"
    }

    fn file_name(&self) -> &str {
        "recording.mda"
    }

    fn write(&self, recording: &dyn Recording, path: &Path) -> Result<()> {
        let array = Self::to_array(recording)?;
        mda::write_mda(path, &array)
    }
}

/// Load a `channels x frames` MDA file as a recording with channel ids `0..n`.
pub fn read_mda_recording(path: &Path, sampling_frequency: f64) -> Result<InMemoryRecording> {
    let array = mda::read_mda(path)?;
    let (channels, frames) = match array.dims() {
        [c, f] => (*c, *f),
        [f] => (1, *f),
        dims => {
            return Err(DataError::Shape {
                dims: dims.to_vec(),
                message: "a recording must be a channels x frames array".to_string(),
            });
        }
    };

    let data = array.data();
    let traces = (0..channels)
        .map(|ch| (0..frames).map(|f| data[ch + f * channels] as f32).collect())
        .collect();

    InMemoryRecording::new(sampling_frequency, (0..channels as u32).collect(), traces)
}
