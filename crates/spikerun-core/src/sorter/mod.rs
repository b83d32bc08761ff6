//! Sorter adapter interface.
//!
//! Every external tool is wrapped by a [`SorterAdapter`]. A run drives the
//! adapter through its stages strictly in order:
//!
//! ```text
//! validate -> prepare (serialize + render) -> execute (run + finalize)
//!                                                   |
//!                      parse (any time later) <-----+  artifacts on disk
//! ```
//!
//! Execute leaves everything [`SorterAdapter::parse`] needs in the output
//! folder, so a finished run can be parsed many times, by a different
//! process, without re-running the tool.

pub mod hdsort;

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use spikerun_data::{Recording, Sorting};

use crate::error::{Result, SortError};
use crate::executor::ScriptExecutor;
use crate::params::{ParamSet, ParamTable};
use crate::settings::SorterSettings;
use crate::shell::ExitReport;

pub use hdsort::HdSortAdapter;

/// Sidecar file recording the sampling frequency for later parsing.
pub const SAMPLERATE_FILE: &str = "samplerate.txt";

/// The closed set of built-in sorters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SorterKind {
    HdSort,
}

impl SorterKind {
    pub const ALL: [SorterKind; 1] = [SorterKind::HdSort];

    pub fn name(self) -> &'static str {
        match self {
            SorterKind::HdSort => "hdsort",
        }
    }

    /// A fresh adapter instance for this sorter.
    pub fn adapter(self) -> Arc<dyn SorterAdapter> {
        match self {
            SorterKind::HdSort => Arc::new(HdSortAdapter::new()),
        }
    }
}

impl fmt::Display for SorterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SorterKind {
    type Err = SortError;

    fn from_str(s: &str) -> Result<Self> {
        SorterKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| SortError::UnknownSorter {
                name: s.to_string(),
                available: SorterKind::ALL.iter().map(|k| k.name().to_string()).collect(),
            })
    }
}

/// A sorter named either by string or by kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SorterRef {
    Name(String),
    Kind(SorterKind),
}

impl SorterRef {
    pub fn name(&self) -> &str {
        match self {
            SorterRef::Name(n) => n,
            SorterRef::Kind(k) => k.name(),
        }
    }
}

impl From<&str> for SorterRef {
    fn from(name: &str) -> Self {
        SorterRef::Name(name.to_string())
    }
}

impl From<String> for SorterRef {
    fn from(name: String) -> Self {
        SorterRef::Name(name)
    }
}

impl From<SorterKind> for SorterRef {
    fn from(kind: SorterKind) -> Self {
        SorterRef::Kind(kind)
    }
}

/// Context for one run. Parameters are frozen once the job exists.
#[derive(Debug, Clone)]
pub struct SortJob {
    pub run_id: Uuid,
    pub sorter: String,
    /// Absolute path of the run's output folder.
    pub output_folder: PathBuf,
    pub params: ParamSet,
    pub settings: Arc<SorterSettings>,
    pub sampling_frequency: f64,
    /// Stream the tool's output to the terminal instead of a log file.
    pub verbose: bool,
}

impl SortJob {
    /// Log file for the tool's stdout/stderr, or `None` when verbose.
    pub fn log_file(&self) -> Option<PathBuf> {
        (!self.verbose).then(|| self.output_folder.join(format!("spikerun_{}.log", self.sorter)))
    }
}

/// A script rendered from a template, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedScript {
    pub file_name: String,
    pub contents: String,
}

/// One entry of the user-facing parameter form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GuiParam {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: serde_json::Value,
    pub default: serde_json::Value,
    pub title: String,
    /// Run option shared by every sorter rather than a tool parameter.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub base_param: bool,
}

/// Static metadata about a sorter.
#[derive(Debug, Clone)]
pub struct SorterDescriptor {
    pub name: String,
    pub installed: bool,
    pub default_params: ParamSet,
    pub gui_params: Vec<GuiParam>,
    pub installation_instructions: String,
}

/// Run options every sorter accepts, shown ahead of the tool's parameters.
pub fn base_gui_params() -> Vec<GuiParam> {
    let base = |name: &str, kind: &str, default: serde_json::Value, title: &str| GuiParam {
        name: name.to_string(),
        kind: kind.to_string(),
        value: default.clone(),
        default,
        title: title.to_string(),
        base_param: true,
    };
    vec![
        base("output_folder", "folder", serde_json::Value::Null, "Sorting output folder path"),
        base("verbose", "bool", serde_json::Value::Bool(false), "The verbosity of the underlying spike sorter"),
        base(
            "delete_output_folder",
            "bool",
            serde_json::Value::Bool(false),
            "If True, delete the results of the sorter, otherwise, it won't",
        ),
    ]
}

/// Parameter form for a table: base options then every table entry.
pub fn gui_params(table: &ParamTable) -> Vec<GuiParam> {
    let mut params = base_gui_params();
    params.extend(table.specs().iter().map(|spec| {
        let default = serde_json::to_value(&spec.default).unwrap_or(serde_json::Value::Null);
        GuiParam {
            name: spec.name.clone(),
            kind: spec.kind.to_string(),
            value: default.clone(),
            default,
            title: spec.title.clone(),
            base_param: false,
        }
    }));
    params
}

/// Adapter interface for one external spike-sorting tool.
///
/// Implementors must be object-safe so the registry can hold
/// `Arc<dyn SorterAdapter>`.
#[async_trait]
pub trait SorterAdapter: Send + Sync {
    /// Registry name (e.g. "hdsort").
    fn name(&self) -> &str;

    /// Schema of the tool's tunable parameters.
    fn param_table(&self) -> Arc<ParamTable>;

    /// Shown to the user when the tool is not installed.
    fn installation_instructions(&self) -> &str;

    /// Probe the install path configured in `settings`.
    fn is_installed(&self, settings: &SorterSettings) -> bool;

    /// Version string of the installed tool, or `"unknown"`.
    fn version(&self, settings: &SorterSettings) -> String;

    /// Stage 1: check installation and parameters.
    fn validate(&self, settings: &SorterSettings, params: &ParamSet) -> Result<()> {
        if !self.is_installed(settings) {
            return Err(SortError::Configuration {
                message: format!("{} is not installed", self.name()),
                instructions: Some(self.installation_instructions().to_string()),
            });
        }
        let table = self.param_table();
        for (name, value) in params.iter() {
            let spec = table
                .spec(name)
                .ok_or_else(|| SortError::config(format!("unknown parameter {name:?}")))?;
            spec.validate(value.clone())?;
        }
        Ok(())
    }

    /// Render the tool's scripts for `job`. Pure: same job, same output.
    fn render(&self, job: &SortJob) -> Result<Vec<RenderedScript>>;

    /// Stages 2 and 3: serialize the recording and write rendered scripts.
    fn prepare(&self, job: &SortJob, recording: &dyn Recording) -> Result<()>;

    /// Stages 4 and 5: run the tool, check its exit status, and write the
    /// metadata [`SorterAdapter::parse`] depends on.
    async fn execute(&self, job: &SortJob, executor: &dyn ScriptExecutor) -> Result<()>;

    /// Stage 6: read the tool's output folder into a [`Sorting`].
    fn parse(&self, output_folder: &Path) -> Result<Sorting>;

    /// Metadata for listings and parameter forms.
    fn descriptor(&self, settings: &SorterSettings) -> SorterDescriptor {
        let table = self.param_table();
        SorterDescriptor {
            name: self.name().to_string(),
            installed: self.is_installed(settings),
            gui_params: gui_params(&table),
            default_params: ParamSet::defaults(table),
            installation_instructions: self.installation_instructions().to_string(),
        }
    }
}

// Compile-time assertion: SorterAdapter must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn SorterAdapter) {}
};

/// Write rendered scripts into `folder`.
pub fn write_scripts(folder: &Path, scripts: &[RenderedScript]) -> Result<()> {
    for script in scripts {
        let path = folder.join(&script.file_name);
        std::fs::write(&path, &script.contents).map_err(|e| SortError::io(&path, e))?;
    }
    Ok(())
}

/// Turn a finished process into `Ok` or an [`SortError::Execution`].
pub fn check_exit(sorter: &str, report: &ExitReport) -> Result<()> {
    if report.success() {
        Ok(())
    } else {
        Err(SortError::Execution {
            sorter: sorter.to_string(),
            exit_code: report.code,
        })
    }
}

pub fn write_sampling_frequency(folder: &Path, sampling_frequency: f64) -> Result<()> {
    let path = folder.join(SAMPLERATE_FILE);
    std::fs::write(&path, format!("{sampling_frequency}")).map_err(|e| SortError::io(&path, e))
}

pub fn read_sampling_frequency(folder: &Path) -> Result<f64> {
    let path = folder.join(SAMPLERATE_FILE);
    let text = std::fs::read_to_string(&path).map_err(|e| SortError::ResultParse {
        path: path.clone(),
        message: e.to_string(),
    })?;
    match text.trim().parse::<f64>() {
        Ok(fs) if fs.is_finite() && fs > 0.0 => Ok(fs),
        _ => Err(SortError::ResultParse {
            path,
            message: format!("not a sampling frequency: {:?}", text.trim()),
        }),
    }
}
