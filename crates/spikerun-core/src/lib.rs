//! Orchestration layer for external spike-sorting tools.
//!
//! A [`SorterRegistry`] holds one [`SorterAdapter`] per tool. Running a
//! sorter validates its installation and parameters, writes the recording
//! and rendered scripts into an output folder, runs the tool as a child
//! process through a [`ScriptExecutor`], and parses what it left behind
//! into a [`Sorting`](spikerun_data::Sorting).

pub mod error;
pub mod executor;
pub mod params;
pub mod probe;
pub mod registry;
pub mod runner;
pub mod settings;
pub mod shell;
pub mod sorter;
pub mod template;

pub use error::{Result, SortError, TemplateError};
pub use executor::{ScriptExecutor, ScriptRequest, ShellExecutor};
pub use params::{ParamKind, ParamSet, ParamSpec, ParamTable, ParamValue};
pub use registry::SorterRegistry;
pub use runner::{
    RUN_LOG_FILE, RunLog, RunOptions, RunResult, SortRun, default_output_folder, get_result,
    run_hdsort, run_sorter, run_sorter_with_params,
};
pub use settings::SorterSettings;
pub use shell::{ExitReport, ShellScript};
pub use sorter::{
    GuiParam, HdSortAdapter, RenderedScript, SAMPLERATE_FILE, SortJob, SorterAdapter,
    SorterDescriptor, SorterKind, SorterRef,
};
