use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while reading or writing recording and sorting data.
#[derive(Debug, Error)]
pub enum DataError {
    /// A filesystem operation failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The MDA header could not be decoded.
    #[error("malformed MDA header: {0}")]
    MalformedHeader(String),

    /// The MDA header names a dtype code this codec does not know.
    #[error("unsupported MDA dtype code {0}")]
    UnsupportedDtype(i32),

    /// The payload ended before all declared entries were read.
    #[error("truncated MDA payload: expected {expected} bytes, found {actual}")]
    Truncated { expected: usize, actual: usize },

    /// An array had the wrong number of dimensions or rows for its use.
    #[error("unexpected array shape {dims:?}: {message}")]
    Shape { dims: Vec<usize>, message: String },

    /// A channel has no value for the requested property.
    #[error("channel {channel_id} has no value for property {property:?}")]
    MissingProperty { channel_id: u32, property: String },

    /// Channel traces passed to a recording do not line up.
    #[error("invalid recording: {0}")]
    InvalidRecording(String),
}

impl DataError {
    /// Wrap an I/O error together with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, DataError>;
