//! Run dispatch.
//!
//! [`SortRun`] drives one adapter through validate, prepare, execute and
//! parse in a single output folder. [`run_sorter`] resolves the adapter,
//! applies parameter overrides and, for grouped runs, splits the recording
//! by a channel property and runs one [`SortRun`] per group.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use spikerun_data::{InMemoryRecording, Recording, Sorting, split_by_property};

use crate::error::{Result, SortError};
use crate::executor::ScriptExecutor;
use crate::params::{ParamSet, ParamValue};
use crate::registry::SorterRegistry;
use crate::settings::SorterSettings;
use crate::sorter::{SortJob, SorterAdapter, SorterKind, SorterRef};

/// Written into every output folder once the tool has run.
pub const RUN_LOG_FILE: &str = "spikerun_log.json";

/// Options for [`run_sorter`].
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Defaults to `./tmp_<sorter>`.
    pub output_folder: Option<PathBuf>,
    /// Remove the output folder once the result has been parsed.
    pub delete_output_folder: bool,
    /// Split channels by this property and sort each group separately.
    pub grouping_property: Option<String>,
    /// Run groups concurrently, at most `max_parallel` at a time.
    pub parallel: bool,
    /// Stream the tool's output to the terminal.
    pub verbose: bool,
}

/// Output folder used when the caller does not name one.
pub fn default_output_folder(sorter: &str) -> PathBuf {
    PathBuf::from(format!("tmp_{sorter}"))
}

/// Outcome of [`run_sorter`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunResult {
    Single(Sorting),
    /// One sorting per group value. Merging them is up to the caller.
    Grouped(BTreeMap<String, Sorting>),
}

impl RunResult {
    pub fn into_single(self) -> Option<Sorting> {
        match self {
            RunResult::Single(sorting) => Some(sorting),
            RunResult::Grouped(_) => None,
        }
    }

    pub fn into_grouped(self) -> Option<BTreeMap<String, Sorting>> {
        match self {
            RunResult::Grouped(groups) => Some(groups),
            RunResult::Single(_) => None,
        }
    }
}

/// Contents of [`RUN_LOG_FILE`].
#[derive(Debug, Clone, Serialize)]
pub struct RunLog {
    pub run_id: Uuid,
    pub sorter: String,
    pub output_folder: PathBuf,
    pub sampling_frequency: f64,
    pub params: serde_json::Value,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_secs: f64,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One adapter run in one output folder.
pub struct SortRun {
    adapter: Arc<dyn SorterAdapter>,
    job: SortJob,
}

impl SortRun {
    /// Freeze `params` into a new job. The output folder is made absolute
    /// but not created yet.
    pub fn new(
        adapter: Arc<dyn SorterAdapter>,
        settings: Arc<SorterSettings>,
        output_folder: &Path,
        params: ParamSet,
        sampling_frequency: f64,
        verbose: bool,
    ) -> Result<Self> {
        let output_folder =
            std::path::absolute(output_folder).map_err(|e| SortError::io(output_folder, e))?;
        let job = SortJob {
            run_id: Uuid::new_v4(),
            sorter: adapter.name().to_string(),
            output_folder,
            params,
            settings,
            sampling_frequency,
            verbose,
        };
        Ok(Self { adapter, job })
    }

    pub fn job(&self) -> &SortJob {
        &self.job
    }

    /// Validate, prepare and execute, in that order. Stops at the first
    /// failing stage.
    ///
    /// [`RUN_LOG_FILE`] is written once the tool has been launched, whether
    /// or not it succeeded. A run that fails before that leaves no log.
    pub async fn run(&self, recording: &dyn Recording, executor: &dyn ScriptExecutor) -> Result<()> {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(
            sorter = %self.job.sorter,
            run_id = %self.job.run_id,
            output_folder = %self.job.output_folder.display(),
            "starting run"
        );

        if let Err(e) = self.prepare_inputs(recording) {
            warn!(
                sorter = %self.job.sorter,
                run_id = %self.job.run_id,
                error = %e,
                "run failed before launching the tool"
            );
            return Err(e);
        }

        let outcome = self.adapter.execute(&self.job, executor).await;
        match &outcome {
            Ok(()) => info!(
                sorter = %self.job.sorter,
                run_id = %self.job.run_id,
                elapsed_secs = clock.elapsed().as_secs_f64(),
                "run finished"
            ),
            Err(e) => warn!(
                sorter = %self.job.sorter,
                run_id = %self.job.run_id,
                exit_code = ?e.exit_code(),
                error = %e,
                "run failed"
            ),
        }
        self.write_log(started_at, clock.elapsed(), &outcome);
        outcome
    }

    fn prepare_inputs(&self, recording: &dyn Recording) -> Result<()> {
        let job = &self.job;
        self.adapter.validate(&job.settings, &job.params)?;
        debug!(run_id = %job.run_id, "validated");

        std::fs::create_dir_all(&job.output_folder).map_err(|e| SortError::io(&job.output_folder, e))?;
        self.adapter.prepare(job, recording)?;
        debug!(run_id = %job.run_id, "prepared");
        Ok(())
    }

    /// Parse the output folder. Only meaningful after a successful
    /// [`SortRun::run`].
    pub fn result(&self) -> Result<Sorting> {
        self.adapter.parse(&self.job.output_folder)
    }

    fn write_log(&self, started_at: DateTime<Utc>, elapsed: Duration, outcome: &Result<()>) {
        let folder = &self.job.output_folder;
        let log = RunLog {
            run_id: self.job.run_id,
            sorter: self.job.sorter.clone(),
            output_folder: folder.clone(),
            sampling_frequency: self.job.sampling_frequency,
            params: self.job.params.to_json(),
            started_at,
            finished_at: Utc::now(),
            elapsed_secs: elapsed.as_secs_f64(),
            succeeded: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
        };

        let path = folder.join(RUN_LOG_FILE);
        let written = serde_json::to_vec_pretty(&log)
            .map_err(std::io::Error::other)
            .and_then(|bytes| std::fs::write(&path, bytes));
        if let Err(e) = written {
            warn!(path = %path.display(), error = %e, "failed to write run log");
        }
    }
}

/// Shared, cloneable inputs of every run spawned by one dispatch.
#[derive(Clone)]
struct Dispatch {
    adapter: Arc<dyn SorterAdapter>,
    settings: Arc<SorterSettings>,
    executor: Arc<dyn ScriptExecutor>,
    params: ParamSet,
    verbose: bool,
}

impl Dispatch {
    async fn run_one(&self, recording: &dyn Recording, folder: &Path) -> Result<Sorting> {
        let run = SortRun::new(
            Arc::clone(&self.adapter),
            Arc::clone(&self.settings),
            folder,
            self.params.clone(),
            recording.sampling_frequency(),
            self.verbose,
        )?;
        run.run(recording, self.executor.as_ref()).await?;
        run.result()
    }

    async fn run_sequential(
        &self,
        groups: BTreeMap<String, InMemoryRecording>,
        folder: &Path,
    ) -> Result<BTreeMap<String, Sorting>> {
        let mut sortings = BTreeMap::new();
        for (group, recording) in groups {
            info!(group = %group, "sorting group");
            let sorting = self.run_one(&recording, &folder.join(&group)).await?;
            sortings.insert(group, sorting);
        }
        Ok(sortings)
    }

    async fn run_parallel(
        &self,
        groups: BTreeMap<String, InMemoryRecording>,
        folder: &Path,
    ) -> Result<BTreeMap<String, Sorting>> {
        let semaphore = Arc::new(Semaphore::new(self.settings.max_parallel.max(1)));
        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for (group, recording) in groups {
            let dispatch = self.clone();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let group_folder = folder.join(&group);

            tasks.spawn(async move {
                let work = async {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| SortError::config("group scheduler closed"))?;
                    info!(group = %group, "sorting group");
                    dispatch.run_one(&recording, &group_folder).await
                };
                // Dropping `work` kills the group's child process.
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    result = work => Some(result),
                };
                (group, outcome)
            });
        }

        let mut sortings = BTreeMap::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok((group, Some(Ok(sorting)))) => {
                    sortings.insert(group, sorting);
                    continue;
                }
                Ok((group, None)) => {
                    debug!(group = %group, "group cancelled");
                    continue;
                }
                Ok((group, Some(Err(e)))) => {
                    warn!(group = %group, error = %e, "group failed, cancelling remaining groups");
                    e
                }
                Err(join_error) => {
                    warn!(error = %join_error, "group task aborted");
                    SortError::Execution {
                        sorter: self.adapter.name().to_string(),
                        exit_code: None,
                    }
                }
            };
            if first_error.is_none() {
                cancel.cancel();
                first_error = Some(failure);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(sortings),
        }
    }
}

fn check_group_name(group: &str) -> Result<()> {
    let bad = group.is_empty()
        || group == "."
        || group == ".."
        || group.contains(['/', '\\']);
    if bad {
        return Err(SortError::config(format!(
            "group value {group:?} cannot be used as a folder name"
        )));
    }
    Ok(())
}

/// Run a sorter with `params` applied over its defaults.
///
/// Fails with [`SortError::UnknownSorter`] before touching the filesystem
/// if `sorter` is not registered.
///
/// The output folder is not locked. Two concurrent runs must not be given
/// the same folder.
pub async fn run_sorter<I, K, V>(
    registry: &SorterRegistry,
    sorter: impl Into<SorterRef>,
    recording: Arc<dyn Recording>,
    options: RunOptions,
    params: I,
) -> Result<RunResult>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<ParamValue>,
{
    let adapter = registry.adapter(sorter)?;
    let mut set = ParamSet::defaults(adapter.param_table());
    set.update(params)?;
    run_with_params(registry, adapter, recording, options, set).await
}

/// Like [`run_sorter`], with a parameter set built by the caller.
pub async fn run_sorter_with_params(
    registry: &SorterRegistry,
    sorter: impl Into<SorterRef>,
    recording: Arc<dyn Recording>,
    options: RunOptions,
    params: ParamSet,
) -> Result<RunResult> {
    let adapter = registry.adapter(sorter)?;
    run_with_params(registry, adapter, recording, options, params).await
}

async fn run_with_params(
    registry: &SorterRegistry,
    adapter: Arc<dyn SorterAdapter>,
    recording: Arc<dyn Recording>,
    options: RunOptions,
    params: ParamSet,
) -> Result<RunResult> {
    let folder = options
        .output_folder
        .clone()
        .unwrap_or_else(|| default_output_folder(adapter.name()));
    let dispatch = Dispatch {
        adapter,
        settings: registry.shared_settings(),
        executor: registry.executor(),
        params,
        verbose: options.verbose,
    };

    let result = match &options.grouping_property {
        None => RunResult::Single(dispatch.run_one(recording.as_ref(), &folder).await?),
        Some(property) => {
            let groups = split_by_property(recording.as_ref(), property)
                .map_err(|e| SortError::config(format!("cannot group recording: {e}")))?;
            for group in groups.keys() {
                check_group_name(group)?;
            }
            info!(
                sorter = %dispatch.adapter.name(),
                property = %property,
                groups = groups.len(),
                parallel = options.parallel,
                "dispatching grouped run"
            );
            let sortings = if options.parallel {
                dispatch.run_parallel(groups, &folder).await?
            } else {
                dispatch.run_sequential(groups, &folder).await?
            };
            RunResult::Grouped(sortings)
        }
    };

    if options.delete_output_folder {
        if let Err(e) = std::fs::remove_dir_all(&folder) {
            warn!(output_folder = %folder.display(), error = %e, "failed to delete output folder");
        }
    }
    Ok(result)
}

/// Parse a finished run's output folder with the named sorter's parser.
pub fn get_result(registry: &SorterRegistry, sorter: impl Into<SorterRef>, output_folder: &Path) -> Result<Sorting> {
    registry.get_result(sorter, output_folder)
}

/// [`run_sorter`] for HDSort.
pub async fn run_hdsort<I, K, V>(
    registry: &SorterRegistry,
    recording: Arc<dyn Recording>,
    options: RunOptions,
    params: I,
) -> Result<RunResult>
where
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<str>,
    V: Into<ParamValue>,
{
    run_sorter(registry, SorterKind::HdSort, recording, options, params).await
}
