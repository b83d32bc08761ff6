//! `spikerun result` command, plus sorting output shared with `run`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};

use spikerun_core::{RunResult, SorterRegistry};
use spikerun_data::{Sorting, SortingSummary};

/// Run the result command: parse a finished output folder.
pub fn run_result(registry: &SorterRegistry, sorter: &str, output_folder: &Path, json: bool) -> Result<()> {
    let sorting = registry
        .get_result(sorter, output_folder)
        .with_context(|| format!("failed to read {sorter} result from {}", output_folder.display()))?;
    print_sorting(&sorting, json)
}

pub fn print_run_result(result: &RunResult, json: bool) -> Result<()> {
    match result {
        RunResult::Single(sorting) => print_sorting(sorting, json),
        RunResult::Grouped(groups) if json => {
            let summaries: BTreeMap<&str, SortingSummary> = groups
                .iter()
                .map(|(group, sorting)| (group.as_str(), sorting.summary()))
                .collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            Ok(())
        }
        RunResult::Grouped(groups) => {
            for (group, sorting) in groups {
                println!("Group {group}:");
                print_summary(&sorting.summary(), "  ");
            }
            Ok(())
        }
    }
}

fn print_sorting(sorting: &Sorting, json: bool) -> Result<()> {
    let summary = sorting.summary();
    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, "");
    }
    Ok(())
}

fn print_summary(summary: &SortingSummary, indent: &str) {
    println!("{indent}Sampling frequency: {} Hz", summary.sampling_frequency);
    println!(
        "{indent}Units: {}, spikes: {}",
        summary.num_units, summary.total_spikes
    );
    for (unit, count) in &summary.spikes_per_unit {
        println!("{indent}  unit {unit}: {count} spikes");
    }
}
