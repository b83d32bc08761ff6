//! The seam between adapters and child processes.
//!
//! Adapters never spawn processes directly; they hand a [`ScriptRequest`]
//! to a [`ScriptExecutor`]. Production code uses [`ShellExecutor`]; tests
//! substitute an executor that fakes the external tool.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::shell::{ExitReport, ShellScript};

/// Everything needed to run one generated script.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRequest {
    /// Sorter the script belongs to, for logging.
    pub sorter: String,
    /// Script text; dedented before it is written.
    pub script: String,
    /// Directory the script runs in (the run's output folder).
    pub working_dir: PathBuf,
    /// Extra environment for the child.
    pub env: Vec<(String, String)>,
    /// Where stdout/stderr go; `None` inherits the parent's terminal.
    pub log_file: Option<PathBuf>,
    pub keep_temp_files: bool,
    pub timeout: Option<Duration>,
}

/// Runs generated scripts to completion.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// Run `request` and block until the process exits.
    ///
    /// A non-zero exit is not an error here; it is reported in the
    /// [`ExitReport`] for the caller to judge.
    async fn execute(&self, request: &ScriptRequest) -> Result<ExitReport>;
}

// Compile-time assertion: ScriptExecutor must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn ScriptExecutor) {}
};

/// Executes scripts with [`ShellScript`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellExecutor;

#[async_trait]
impl ScriptExecutor for ShellExecutor {
    async fn execute(&self, request: &ScriptRequest) -> Result<ExitReport> {
        let mut script = ShellScript::new(&request.script)
            .current_dir(&request.working_dir)
            .envs(request.env.iter().cloned())
            .keep_temp_files(request.keep_temp_files);
        if let Some(log) = &request.log_file {
            script = script.log_to(log);
        }

        script.start()?;
        script.wait(request.timeout).await
    }
}
