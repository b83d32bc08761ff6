//! Shared test utilities for spikerun integration tests.
//!
//! Provides synthetic recordings, fake HDSort install trees, fake `matlab`
//! executables and a [`ScriptedExecutor`] that stands in for the external
//! tool without spawning a process.

use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;

use spikerun_core::{ExitReport, ScriptExecutor, ScriptRequest, SortError};
use spikerun_data::{GROUP_PROPERTY, InMemoryRecording, Sorting, write_firings};

/// Deterministic multichannel recording with values in `-8.0..=8.0`.
pub fn synthetic_recording(channels: usize, frames: usize, sampling_frequency: f64) -> InMemoryRecording {
    let traces = (0..channels)
        .map(|ch| {
            (0..frames)
                .map(|f| ((ch + 1) * f % 17) as f32 - 8.0)
                .collect()
        })
        .collect();
    InMemoryRecording::new(sampling_frequency, (0..channels as u32).collect(), traces)
        .expect("synthetic recording is well-formed")
}

/// A recording with one channel per entry of `groups`, tagged with the
/// `group` property.
pub fn grouped_recording(groups: &[&str], frames: usize, sampling_frequency: f64) -> InMemoryRecording {
    synthetic_recording(groups.len(), frames, sampling_frequency)
        .with_groups(groups)
        .expect("one group value per channel")
        .with_property("shank", groups.iter().map(|g| format!("shank-{g}")).collect())
        .expect("one shank value per channel")
}

/// Name of the property [`grouped_recording`] groups by.
pub fn group_property() -> String {
    GROUP_PROPERTY.to_string()
}

/// Two units with a handful of spikes each.
pub fn sample_sorting(sampling_frequency: f64) -> Sorting {
    Sorting::new(sampling_frequency)
        .with_unit(1, vec![10, 20, 30])
        .with_unit(2, vec![15, 25])
}

/// A temporary directory laid out like an HDSort checkout.
pub struct FakeInstall {
    dir: TempDir,
}

impl FakeInstall {
    /// Create `+hdsort/` and, when given, `version.txt`.
    pub fn hdsort(version: Option<&str>) -> Self {
        let dir = tempfile::tempdir().expect("failed to create install dir");
        std::fs::create_dir(dir.path().join("+hdsort")).expect("failed to create +hdsort");
        if let Some(version) = version {
            std::fs::write(dir.path().join("version.txt"), format!("{version}\n"))
                .expect("failed to write version.txt");
        }
        Self { dir }
    }

    /// An install directory missing the `+hdsort` marker.
    pub fn empty() -> Self {
        Self {
            dir: tempfile::tempdir().expect("failed to create install dir"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn path_string(&self) -> String {
        self.dir.path().display().to_string()
    }
}

/// Write a fake `matlab` that checks the rendered inputs, copies
/// `firings_source` to `firings.mda`, records `$HDSORT_PATH` and exits with
/// `exit_code`.
///
/// Returns the command to put in `SorterSettings::matlab_command`. The script
/// is run through `sh` rather than exec'd, so a freshly written file can
/// never fail with "text file busy".
#[cfg(unix)]
pub fn write_fake_matlab(dir: &Path, firings_source: &Path, exit_code: i32) -> String {
    use std::os::unix::fs::PermissionsExt;

    let script_path = dir.join("fake_matlab");
    let script = format!(
        "#!/bin/sh\n\
         test -f hdsort_master.m || exit 97\n\
         test -f hdsort_config.m || exit 98\n\
         test -f recording.mda || exit 99\n\
         printf '%s\\n' \"$*\" > matlab_args.txt\n\
         echo \"$HDSORT_PATH\" > hdsort_path.txt\n\
         cp \"{}\" firings.mda\n\
         exit {exit_code}\n",
        firings_source.display()
    );
    std::fs::write(&script_path, script).expect("failed to write fake matlab");
    std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
        .expect("failed to chmod fake matlab");
    format!("sh {}", script_path.display())
}

/// A fake `matlab` that never exits on its own. It starts `sleep` in the
/// background and writes that pid to `tool.pid` in its working directory.
#[cfg(unix)]
pub fn write_hanging_matlab(dir: &Path) -> String {
    let script_path = dir.join("hanging_matlab");
    std::fs::write(&script_path, "#!/bin/sh\nsleep 60 &\necho $! > tool.pid\nwait\n")
        .expect("failed to write hanging matlab");
    format!("sh {}", script_path.display())
}

/// Poll until `pid` is gone, for at most `limit`. A zombie counts as gone.
#[cfg(unix)]
pub fn wait_until_exited(pid: u32, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if !process_alive(pid) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let signalable = std::process::Command::new("sh")
        .arg("-c")
        .arg(format!("kill -0 {pid} 2>/dev/null"))
        .status()
        .is_ok_and(|status| status.success());
    if !signalable {
        return false;
    }
    // `kill -0` succeeds on zombies; on Linux the state letter tells them apart.
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => !stat
            .rsplit_once(')')
            .is_some_and(|(_, rest)| rest.trim_start().starts_with('Z')),
        Err(_) => true,
    }
}

/// Stands in for the external tool: records each request, writes a
/// `firings.mda` into the working directory on success, and reports a fixed
/// exit code.
pub struct ScriptedExecutor {
    exit_code: i32,
    firings: Option<Sorting>,
    requests: Mutex<Vec<ScriptRequest>>,
}

impl ScriptedExecutor {
    /// Exit 0 after writing `sorting` as the tool's output.
    pub fn succeeding(sorting: Sorting) -> Self {
        Self {
            exit_code: 0,
            firings: Some(sorting),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Exit with `exit_code` without producing output.
    pub fn failing(exit_code: i32) -> Self {
        Self {
            exit_code,
            firings: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Every request seen so far, in call order.
    pub fn requests(&self) -> Vec<ScriptRequest> {
        self.requests.lock().expect("requests lock poisoned").clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock poisoned").len()
    }
}

#[async_trait]
impl ScriptExecutor for ScriptedExecutor {
    async fn execute(&self, request: &ScriptRequest) -> spikerun_core::Result<ExitReport> {
        self.requests
            .lock()
            .expect("requests lock poisoned")
            .push(request.clone());

        if self.exit_code == 0 {
            if let Some(sorting) = &self.firings {
                let path = request.working_dir.join("firings.mda");
                write_firings(&path, sorting).map_err(|e| SortError::io(&path, std::io::Error::other(e)))?;
            }
        }

        Ok(ExitReport {
            code: Some(self.exit_code),
            timed_out: false,
            elapsed: Duration::from_millis(1),
        })
    }
}
