//! Configuration file management for spikerun.
//!
//! Provides a TOML-based config file at `~/.config/spikerun/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use spikerun_core::SorterSettings;
use spikerun_core::settings::timeout_from_secs;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub matlab: MatlabSection,
    #[serde(default)]
    pub run: RunSection,
    /// Install root per sorter name.
    #[serde(default)]
    pub install_paths: BTreeMap<String, String>,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MatlabSection {
    /// MATLAB executable, on `$PATH` or absolute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// Kill the external tool after this many seconds; `0` disables the limit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep_temp_files: Option<bool>,
    /// Upper bound on concurrently sorted groups.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    /// Directory of template overrides.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub templates_dir: Option<PathBuf>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the spikerun config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/spikerun` or
/// `~/.config/spikerun`, never `~/Library/Application Support` on macOS.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("spikerun");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("spikerun")
}

/// Return the path to the spikerun config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Load the config file if there is one. A file that exists but does not
/// parse is still an error.
pub fn load_config_if_present() -> Result<Option<ConfigFile>> {
    if config_path().exists() {
        load_config().map(Some)
    } else {
        Ok(None)
    }
}

/// Serialize and write the config file, creating parent dirs as needed.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;
    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line; `None` defers to the rest of the chain.
#[derive(Debug, Default)]
pub struct CliOverrides {
    pub matlab: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl ConfigFile {
    fn apply_to(&self, settings: &mut SorterSettings) {
        for (sorter, path) in &self.install_paths {
            settings.set_install_path(sorter, path.clone());
        }
        if let Some(command) = &self.matlab.command {
            settings.matlab_command = command.clone();
        }
        if let Some(secs) = self.matlab.timeout_secs {
            settings.timeout = timeout_from_secs(secs);
        }
        if let Some(keep) = self.run.keep_temp_files {
            settings.keep_temp_files = keep;
        }
        if let Some(max) = self.run.max_parallel.filter(|m| *m > 0) {
            settings.max_parallel = max;
        }
        if let Some(dir) = &self.run.templates_dir {
            settings.templates_dir = Some(dir.clone());
        }
    }
}

/// Resolve sorter settings using the chain: CLI flag > env var > config file > default.
///
/// - Install paths: `<TOOL>_PATH` env > `[install_paths]`
/// - MATLAB command: `--matlab` > `SPIKERUN_MATLAB` env > `matlab.command` > `matlab`
/// - Timeout: `--timeout` > `SPIKERUN_TIMEOUT_SECS` env > `matlab.timeout_secs` > none
pub fn resolve_settings(cli: &CliOverrides) -> Result<SorterSettings> {
    let mut settings = SorterSettings::default();
    if let Some(file) = load_config_if_present()? {
        file.apply_to(&mut settings);
    }
    settings.apply_env();

    if let Some(matlab) = &cli.matlab {
        settings.matlab_command = matlab.clone();
    }
    if let Some(secs) = cli.timeout_secs {
        settings.timeout = timeout_from_secs(secs);
    }
    Ok(settings)
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
