//! Error taxonomy for sorter runs.
//!
//! Every stage of a run fails with one of these variants and the run is
//! aborted immediately. There is no partial-result recovery and no retry.

use std::path::PathBuf;

use thiserror::Error;

use spikerun_data::DataError;

/// Errors raised while rendering a script template.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The template names a placeholder with no binding.
    #[error("template {template:?} uses placeholder {{{placeholder}}} but no value was bound")]
    MissingBinding { template: String, placeholder: String },

    /// The template file could not be read.
    #[error("failed to read template {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A `{` was opened but never closed.
    #[error("template {template:?} has an unterminated placeholder at byte {offset}")]
    Unterminated { template: String, offset: usize },
}

/// Errors raised by sorter adapters, the registry, and the run dispatcher.
#[derive(Debug, Error)]
pub enum SortError {
    /// The sorter is not installed, or a parameter failed validation.
    #[error("{message}{}", .instructions.as_deref().map(|i| format!("\n{i}")).unwrap_or_default())]
    Configuration {
        message: String,
        /// Installation instructions, present when the tool is missing.
        instructions: Option<String>,
    },

    /// A filesystem operation failed while preparing or finalizing a run.
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A script template could not be rendered.
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// The external tool did not exit successfully.
    #[error("{sorter} returned a non-zero exit code ({})", .exit_code.map_or_else(|| "terminated".to_string(), |c| c.to_string()))]
    Execution {
        sorter: String,
        /// `None` when the process was killed by a signal or the watchdog.
        exit_code: Option<i32>,
    },

    /// The tool's output files are missing or malformed.
    #[error("failed to parse result {path}: {message}")]
    ResultParse { path: PathBuf, message: String },

    /// No adapter is registered under the requested name.
    #[error("unknown sorter {name:?} (available: {})", .available.join(", "))]
    UnknownSorter { name: String, available: Vec<String> },
}

impl SortError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
            instructions: None,
        }
    }

    /// Convert a data-layer failure that happened while writing run inputs.
    pub(crate) fn from_write(path: impl Into<PathBuf>, err: DataError) -> Self {
        match err {
            DataError::Io { path, source } => Self::Io { path, source },
            other => Self::Io {
                path: path.into(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, other),
            },
        }
    }

    /// Convert a data-layer failure that happened while reading run outputs.
    pub(crate) fn from_parse(path: impl Into<PathBuf>, err: DataError) -> Self {
        Self::ResultParse {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// Exit code carried by an [`SortError::Execution`] failure.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Execution { exit_code, .. } => *exit_code,
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SortError>;
