//! HDSort adapter.
//!
//! HDSort is a MATLAB package. A run writes the recording as MDA, renders a
//! master script and a config script into the output folder, and starts
//! MATLAB there with `-r hdsort_master`. The master script writes
//! `firings.mda`, which [`HdSortAdapter::parse`] reads back together with the
//! `samplerate.txt` sidecar.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use tracing::{debug, info};

use spikerun_data::{MdaRecordingWriter, Recording, RecordingWriter, Sorting, read_firings};

use super::{
    RenderedScript, SortJob, SorterAdapter, check_exit, read_sampling_frequency, write_scripts,
    write_sampling_frequency,
};
use crate::error::{Result, SortError};
use crate::executor::{ScriptExecutor, ScriptRequest};
use crate::params::{ParamSet, ParamTable};
use crate::probe::{self, Marker};
use crate::settings::SorterSettings;
use crate::template::{self, Bindings};

const PARAMS_TOML: &str = include_str!("../params/hdsort.toml");
const MASTER_TEMPLATE: &str = include_str!("templates/hdsort_master.m");
const CONFIG_TEMPLATE: &str = include_str!("templates/hdsort_config.m");
const READMDA_HELPER: &str = include_str!("templates/readmda.m");
const WRITEMDA_HELPER: &str = include_str!("templates/writemda.m");

pub const NAME: &str = "hdsort";
pub const MASTER_SCRIPT: &str = "hdsort_master.m";
pub const CONFIG_SCRIPT: &str = "hdsort_config.m";
pub const FIRINGS_FILE: &str = "firings.mda";
const SORT_NAME: &str = "hdsort_output";

/// `+hdsort` is the MATLAB package folder at the root of a checkout.
const MARKER: Marker = Marker::Dir("+hdsort");

pub const INSTALLATION_MESSAGE: &str = "\
To use HDSort run:

    >>> git clone https://git.bsse.ethz.ch/hima_public/HDsort.git

and provide the installation path by setting the HDSORT_PATH
environment variable or with:

    >>> spikerun set-path hdsort /path/to/HDsort

More information on HDSort at:
    https://git.bsse.ethz.ch/hima_public/HDsort.git";

/// The HDSort parameter table, parsed once from the embedded TOML.
///
/// # Panics
///
/// Panics if the embedded `hdsort.toml` is invalid, which is a build defect
/// covered by this module's tests.
pub fn param_table() -> Arc<ParamTable> {
    static TABLE: OnceLock<Arc<ParamTable>> = OnceLock::new();
    Arc::clone(TABLE.get_or_init(|| {
        Arc::new(ParamTable::from_toml(PARAMS_TOML).expect("embedded hdsort.toml is valid"))
    }))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HdSortAdapter {
    writer: MdaRecordingWriter,
}

impl HdSortAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    fn install_root(settings: &SorterSettings) -> Result<PathBuf> {
        settings
            .install_path(NAME)
            .filter(|p| !p.trim().is_empty())
            .map(probe::normalize_install_path)
            .ok_or_else(|| SortError::Configuration {
                message: "HDSort install path is not set".to_string(),
                instructions: Some(INSTALLATION_MESSAGE.to_string()),
            })
    }

    fn master_bindings(&self, job: &SortJob, hdsort_path: &Path) -> Result<Bindings> {
        let folder = &job.output_folder;
        let params = &job.params;
        let mut b = Bindings::new();
        b.insert("hdsort_path".into(), matlab_str(hdsort_path));
        b.insert("utils_path".into(), matlab_str(folder));
        b.insert("output_folder".into(), matlab_str(folder));
        b.insert("config_path".into(), matlab_str(&folder.join(CONFIG_SCRIPT)));
        b.insert("file_name".into(), matlab_str(&folder.join(self.writer.file_name())));
        b.insert("file_format".into(), self.writer.format().to_string());
        b.insert("sort_name".into(), SORT_NAME.to_string());
        b.insert("sampling_frequency".into(), format!("{}", job.sampling_frequency));
        b.insert("chunk_size".into(), param_text(params, "chunk_size")?);
        b.insert("loop_mode".into(), param_text(params, "loop_mode")?);
        Ok(b)
    }

    fn config_bindings(params: &ParamSet) -> Result<Bindings> {
        let flag = |name: &str| {
            params
                .bool(name)
                .ok_or_else(|| SortError::config(format!("parameter {name:?} is not a bool")))
        };
        let sign = params
            .i64("detect_sign")
            .ok_or_else(|| SortError::config("parameter \"detect_sign\" is not an int"))?;

        let mut b = Bindings::new();
        b.insert("filter".into(), if flag("filter")? { "1" } else { "0" }.to_string());
        b.insert("parfor".into(), flag("parfor")?.to_string());
        b.insert("detect_method".into(), if sign < 0 { "-" } else { "+" }.to_string());
        for name in ["hpf", "lpf", "detect_threshold", "n_pc_dims"] {
            b.insert(name.into(), param_text(params, name)?);
        }
        Ok(b)
    }

    fn shell_script(settings: &SorterSettings, folder: &Path) -> String {
        if cfg!(windows) {
            format!(
                "cd /d \"{}\"\n{} -nosplash -nodisplay -wait -r hdsort_master\n",
                folder.display(),
                settings.matlab_command
            )
        } else {
            format!(
                "#!/bin/sh\ncd {}\nexec {} -nosplash -nodisplay -r hdsort_master\n",
                sh_quote(&folder.display().to_string()),
                settings.matlab_command
            )
        }
    }
}

/// Quote a path for a single-quoted MATLAB string literal.
fn matlab_str(path: &Path) -> String {
    path.display().to_string().replace('\'', "''")
}

/// Quote `text` as one POSIX shell word.
fn sh_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}

fn param_text(params: &ParamSet, name: &str) -> Result<String> {
    params
        .get(name)
        .map(ToString::to_string)
        .ok_or_else(|| SortError::config(format!("missing parameter {name:?}")))
}

#[async_trait]
impl SorterAdapter for HdSortAdapter {
    fn name(&self) -> &str {
        NAME
    }

    fn param_table(&self) -> Arc<ParamTable> {
        param_table()
    }

    fn installation_instructions(&self) -> &str {
        INSTALLATION_MESSAGE
    }

    fn is_installed(&self, settings: &SorterSettings) -> bool {
        probe::is_installed(settings.install_path(NAME), MARKER)
    }

    fn version(&self, settings: &SorterSettings) -> String {
        probe::read_version_file(settings.install_path(NAME))
    }

    fn render(&self, job: &SortJob) -> Result<Vec<RenderedScript>> {
        let hdsort_path = Self::install_root(&job.settings)?;
        let templates_dir = job.settings.templates_dir.as_deref();

        let master = template::load_template(MASTER_SCRIPT, MASTER_TEMPLATE, templates_dir)?;
        let config = template::load_template(CONFIG_SCRIPT, CONFIG_TEMPLATE, templates_dir)?;

        let master = template::render(MASTER_SCRIPT, &master, &self.master_bindings(job, &hdsort_path)?)?;
        let config = template::render(CONFIG_SCRIPT, &config, &Self::config_bindings(&job.params)?)?;

        Ok(vec![
            RenderedScript {
                file_name: MASTER_SCRIPT.to_string(),
                contents: master,
            },
            RenderedScript {
                file_name: CONFIG_SCRIPT.to_string(),
                contents: config,
            },
            RenderedScript {
                file_name: "readmda.m".to_string(),
                contents: READMDA_HELPER.to_string(),
            },
            RenderedScript {
                file_name: "writemda.m".to_string(),
                contents: WRITEMDA_HELPER.to_string(),
            },
        ])
    }

    fn prepare(&self, job: &SortJob, recording: &dyn Recording) -> Result<()> {
        let folder = &job.output_folder;
        std::fs::create_dir_all(folder).map_err(|e| SortError::io(folder, e))?;

        let recording_path = folder.join(self.writer.file_name());
        self.writer
            .write(recording, &recording_path)
            .map_err(|e| SortError::from_write(&recording_path, e))?;
        debug!(
            path = %recording_path.display(),
            channels = recording.num_channels(),
            frames = recording.num_frames(),
            "wrote recording"
        );

        let scripts = self.render(job)?;
        write_scripts(folder, &scripts)
    }

    async fn execute(&self, job: &SortJob, executor: &dyn ScriptExecutor) -> Result<()> {
        let settings = &job.settings;
        let request = ScriptRequest {
            sorter: NAME.to_string(),
            script: Self::shell_script(settings, &job.output_folder),
            working_dir: job.output_folder.clone(),
            env: settings.child_env(),
            log_file: job.log_file(),
            keep_temp_files: settings.keep_temp_files,
            timeout: settings.timeout,
        };

        info!(run_id = %job.run_id, folder = %job.output_folder.display(), "starting HDSort");
        let report = executor.execute(&request).await?;
        check_exit(NAME, &report)?;
        info!(
            run_id = %job.run_id,
            elapsed_secs = report.elapsed.as_secs_f64(),
            "HDSort finished"
        );

        write_sampling_frequency(&job.output_folder, job.sampling_frequency)
    }

    fn parse(&self, output_folder: &Path) -> Result<Sorting> {
        let sampling_frequency = read_sampling_frequency(output_folder)?;
        let firings = output_folder.join(FIRINGS_FILE);
        read_firings(&firings, sampling_frequency).map_err(|e| SortError::from_parse(&firings, e))
    }
}
