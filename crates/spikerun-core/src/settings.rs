//! Runtime settings shared by the registry and every adapter run.
//!
//! This is the explicit configuration object handed to
//! [`crate::SorterRegistry`] at startup. Nothing here is global: install
//! paths set at runtime are passed to child processes through their
//! environment rather than by mutating the parent's.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::sorter::SorterKind;

/// Environment variable naming the MATLAB executable.
pub const MATLAB_ENV: &str = "SPIKERUN_MATLAB";
/// Environment variable holding a watchdog timeout in seconds.
pub const TIMEOUT_ENV: &str = "SPIKERUN_TIMEOUT_SECS";

/// Name of the environment variable holding a sorter's install root,
/// e.g. `hdsort` -> `HDSORT_PATH`.
pub fn install_env_var(sorter: &str) -> String {
    format!("{}_PATH", sorter.to_ascii_uppercase().replace('-', "_"))
}

/// Settings for running external sorters.
#[derive(Debug, Clone, PartialEq)]
pub struct SorterSettings {
    install_paths: BTreeMap<String, String>,
    /// Command used to start MATLAB (name on `$PATH` or absolute path).
    pub matlab_command: String,
    /// Keep generated shell scripts after the run for debugging.
    pub keep_temp_files: bool,
    /// Upper bound on concurrently running group sub-runs.
    pub max_parallel: usize,
    /// Optional watchdog on the external process. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Directory holding template overrides; embedded templates otherwise.
    pub templates_dir: Option<PathBuf>,
}

impl Default for SorterSettings {
    fn default() -> Self {
        Self {
            install_paths: BTreeMap::new(),
            matlab_command: "matlab".to_string(),
            keep_temp_files: true,
            max_parallel: std::thread::available_parallelism().map_or(1, |n| n.get()),
            timeout: None,
            templates_dir: None,
        }
    }
}

/// Watchdog limit for a number of seconds; `0` means no limit.
pub fn timeout_from_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

impl SorterSettings {
    /// Build settings from the environment. See [`SorterSettings::apply_env`].
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_env();
        settings
    }

    /// Override fields from the environment.
    ///
    /// Reads `<TOOL>_PATH` for every built-in sorter, [`MATLAB_ENV`] and
    /// [`TIMEOUT_ENV`], where `0` clears the limit. Unset or unparsable values
    /// leave fields untouched.
    pub fn apply_env(&mut self) {
        for kind in SorterKind::ALL {
            if let Ok(path) = std::env::var(install_env_var(kind.name())) {
                self.set_install_path(kind.name(), path);
            }
        }
        if let Ok(matlab) = std::env::var(MATLAB_ENV) {
            if !matlab.trim().is_empty() {
                self.matlab_command = matlab;
            }
        }
        if let Ok(raw) = std::env::var(TIMEOUT_ENV) {
            match raw.trim().parse::<u64>() {
                Ok(secs) => self.timeout = timeout_from_secs(secs),
                Err(_) => tracing::warn!(value = %raw, "ignoring invalid {TIMEOUT_ENV}"),
            }
        }
    }

    /// Raw install path configured for a sorter.
    pub fn install_path(&self, sorter: &str) -> Option<&str> {
        self.install_paths.get(sorter).map(String::as_str)
    }

    pub fn set_install_path(&mut self, sorter: &str, path: impl Into<String>) {
        self.install_paths.insert(sorter.to_string(), path.into());
    }

    pub fn with_install_path(mut self, sorter: &str, path: impl Into<String>) -> Self {
        self.set_install_path(sorter, path);
        self
    }

    /// Environment passed to every child process: one `<TOOL>_PATH` per
    /// configured sorter.
    pub fn child_env(&self) -> Vec<(String, String)> {
        self.install_paths
            .iter()
            .map(|(sorter, path)| (install_env_var(sorter), path.clone()))
            .collect()
    }
}
