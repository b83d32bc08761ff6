//! `spikerun run` command: sort an MDA recording.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use spikerun_core::{RunOptions, SorterRegistry, run_sorter_with_params};
use spikerun_data::{GROUP_PROPERTY, Recording, read_mda_recording};

use crate::result_cmd::print_run_result;

/// Arguments of `spikerun run`, already parsed by clap.
#[derive(Debug)]
pub struct RunArgs {
    pub sorter: String,
    pub recording: PathBuf,
    pub sampling_frequency: f64,
    pub output_folder: Option<PathBuf>,
    pub delete_output_folder: bool,
    pub params: Vec<(String, String)>,
    /// One group value per channel; empty for an ungrouped run.
    pub groups: Vec<String>,
    pub parallel: bool,
    pub verbose: bool,
    pub json: bool,
}

/// Parse a `key=value` command-line pair.
pub fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}

/// Run the run command.
pub async fn run_sort(registry: &SorterRegistry, args: RunArgs) -> Result<()> {
    let mut params = registry.default_params(args.sorter.as_str())?;
    for (key, value) in &args.params {
        params
            .set_from_str(key, value)
            .with_context(|| format!("invalid --param {key}={value}"))?;
    }

    let mut recording = read_mda_recording(&args.recording, args.sampling_frequency)
        .with_context(|| format!("failed to read recording {}", args.recording.display()))?;

    let grouping_property = if args.groups.is_empty() {
        None
    } else {
        if args.groups.len() != recording.num_channels() {
            bail!(
                "--groups has {} values but the recording has {} channels",
                args.groups.len(),
                recording.num_channels()
            );
        }
        recording = recording
            .with_groups(&args.groups)
            .context("failed to assign channel groups")?;
        Some(GROUP_PROPERTY.to_string())
    };

    tracing::info!(
        sorter = %args.sorter,
        channels = recording.num_channels(),
        frames = recording.num_frames(),
        "loaded recording"
    );

    let options = RunOptions {
        output_folder: args.output_folder,
        delete_output_folder: args.delete_output_folder,
        grouping_property,
        parallel: args.parallel,
        verbose: args.verbose,
    };
    let result = run_sorter_with_params(registry, args.sorter.as_str(), Arc::new(recording), options, params)
        .await
        .with_context(|| format!("{} run failed", args.sorter))?;

    print_run_result(&result, args.json)
}
