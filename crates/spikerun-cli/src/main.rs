mod config;
mod list_cmd;
mod params_cmd;
mod result_cmd;
mod run_cmd;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};

use spikerun_core::probe::normalize_install_path;
use spikerun_core::settings::install_env_var;
use spikerun_core::SorterRegistry;

use config::CliOverrides;
use run_cmd::RunArgs;

#[derive(Parser)]
#[command(name = "spikerun", about = "Run MATLAB spike sorters on extracellular recordings")]
struct Cli {
    /// MATLAB executable (overrides SPIKERUN_MATLAB env var)
    #[arg(long, global = true)]
    matlab: Option<String>,

    /// Kill the sorter after this many seconds; 0 disables the limit
    #[arg(long, global = true)]
    timeout: Option<u64>,

    /// Debug logging, and stream sorter output to the terminal
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a spikerun config file
    Init {
        /// HDsort install root to record in the config
        #[arg(long)]
        hdsort_path: Option<String>,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// List known sorters and whether they are installed
    List {
        /// Only show installed sorters
        #[arg(long)]
        installed: bool,
    },
    /// Show the version of every installed sorter
    Versions,
    /// Show a sorter's parameters and defaults
    Params {
        /// Sorter name
        sorter: String,
        /// Print the GUI parameter descriptors as JSON
        #[arg(long)]
        json: bool,
    },
    /// Sort an MDA recording
    Run {
        /// Sorter name
        sorter: String,
        /// Recording in MDA format (channels x frames)
        #[arg(long)]
        recording: PathBuf,
        /// Sampling frequency of the recording in Hz
        #[arg(long)]
        sampling_frequency: f64,
        /// Output folder (default: tmp_<sorter>)
        #[arg(long)]
        output_folder: Option<PathBuf>,
        /// Remove the output folder once the result is read
        #[arg(long)]
        delete_output_folder: bool,
        /// Override a parameter, as key=value (repeatable)
        #[arg(long = "param", value_parser = run_cmd::parse_param)]
        params: Vec<(String, String)>,
        /// Channel groups, one per channel, comma separated; each group is sorted separately
        #[arg(long, value_delimiter = ',')]
        groups: Vec<String>,
        /// Sort groups concurrently
        #[arg(long)]
        parallel: bool,
        /// Print the result summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Read the result of a finished run from its output folder
    Result {
        /// Sorter name
        sorter: String,
        /// Output folder of the run
        output_folder: PathBuf,
        /// Print the result summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Record a sorter's install root in the config file
    SetPath {
        /// Sorter name
        sorter: String,
        /// Install root
        path: String,
    },
    /// Print shell completions
    Completions {
        shell: clap_complete::Shell,
    },
}

// -----------------------------------------------------------------------
// Init / set-path
// -----------------------------------------------------------------------

/// Execute the `spikerun init` command: write a fresh config file.
fn cmd_init(matlab: Option<&str>, hdsort_path: Option<&str>, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let mut cfg = config::ConfigFile::default();
    cfg.matlab.command = Some(matlab.unwrap_or("matlab").to_string());
    if let Some(raw) = hdsort_path {
        let root = normalize_install_path(raw).display().to_string();
        cfg.install_paths.insert("hdsort".to_string(), root);
    }

    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    if let Some(command) = &cfg.matlab.command {
        println!("  matlab.command = {command}");
    }
    for (sorter, root) in &cfg.install_paths {
        println!("  install_paths.{sorter} = {root}");
    }
    if cfg.install_paths.is_empty() {
        println!();
        println!("Next: run `spikerun set-path hdsort /path/to/HDsort`.");
    }
    Ok(())
}

/// Execute the `spikerun set-path` command.
fn cmd_set_path(overrides: &CliOverrides, sorter: &str, raw_path: &str) -> anyhow::Result<()> {
    let settings = config::resolve_settings(overrides)?;
    let mut registry = SorterRegistry::with_builtin(settings);

    let root = normalize_install_path(raw_path).display().to_string();
    let installed = registry.set_install_path(sorter, root.clone())?;

    let mut cfg = config::load_config_if_present()?.unwrap_or_default();
    cfg.install_paths.insert(sorter.to_string(), root.clone());
    config::save_config(&cfg)?;

    println!("Setting {} for subprocess calls to: {root}", install_env_var(sorter));
    if !installed {
        let adapter = registry.adapter(sorter)?;
        eprintln!("warning: {sorter} was not found at {root}");
        eprintln!("{}", adapter.installation_instructions());
    }
    Ok(())
}

// -----------------------------------------------------------------------
// Dispatch
// -----------------------------------------------------------------------

fn load_registry(overrides: &CliOverrides) -> anyhow::Result<SorterRegistry> {
    let settings = config::resolve_settings(overrides).context("failed to resolve settings")?;
    let registry = SorterRegistry::with_builtin(settings);
    tracing::debug!(?registry, "registry ready");
    Ok(registry)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let overrides = CliOverrides {
        matlab: cli.matlab.clone(),
        timeout_secs: cli.timeout,
    };

    match cli.command {
        Commands::Init { hdsort_path, force } => {
            cmd_init(cli.matlab.as_deref(), hdsort_path.as_deref(), force)?;
        }
        Commands::SetPath { sorter, path } => {
            cmd_set_path(&overrides, &sorter, &path)?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "spikerun", &mut std::io::stdout());
        }
        Commands::List { installed } => {
            let registry = load_registry(&overrides)?;
            list_cmd::run_list(&registry, installed);
        }
        Commands::Versions => {
            let registry = load_registry(&overrides)?;
            list_cmd::run_versions(&registry);
        }
        Commands::Params { sorter, json } => {
            let registry = load_registry(&overrides)?;
            params_cmd::run_params(&registry, &sorter, json)?;
        }
        Commands::Run {
            sorter,
            recording,
            sampling_frequency,
            output_folder,
            delete_output_folder,
            params,
            groups,
            parallel,
            json,
        } => {
            let registry = load_registry(&overrides)?;
            let args = RunArgs {
                sorter,
                recording,
                sampling_frequency,
                output_folder,
                delete_output_folder,
                params,
                groups,
                parallel,
                verbose: cli.verbose,
                json,
            };
            run_cmd::run_sort(&registry, args).await?;
        }
        Commands::Result {
            sorter,
            output_folder,
            json,
        } => {
            let registry = load_registry(&overrides)?;
            result_cmd::run_result(&registry, &sorter, &output_folder, json)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
