//! Data collaborators for spikerun: recordings handed to sorters, the MDA
//! file format, and the parsed [`Sorting`] result.

pub mod error;
pub mod mda;
pub mod recording;
pub mod sorting;

pub use error::DataError;
pub use mda::{MdaArray, MdaDtype, read_mda, write_mda};
pub use recording::{
    GROUP_PROPERTY, InMemoryRecording, MdaRecordingWriter, Recording, RecordingWriter,
    read_mda_recording, split_by_property,
};
pub use sorting::{Sorting, SortingSummary, read_firings, write_firings};
