//! Shell invocation helper.
//!
//! [`ShellScript`] writes a script to a temporary directory, runs it as a
//! child process and reports its exit status through a `start()` / `wait()`
//! lifecycle. The script text is dedented first, so callers can build it
//! from an indented string literal.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{Result, SortError};

#[cfg(windows)]
const SCRIPT_NAME: &str = "run.bat";
#[cfg(not(windows))]
const SCRIPT_NAME: &str = "run.sh";

/// Outcome of a finished script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitReport {
    /// Exit code, or `None` if the process was killed by a signal or the
    /// watchdog.
    pub code: Option<i32>,
    /// Whether the watchdog fired.
    pub timed_out: bool,
    pub elapsed: Duration,
}

impl ExitReport {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// A script that runs as a child process.
#[derive(Debug)]
pub struct ShellScript {
    script: String,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    log_file: Option<PathBuf>,
    keep_temp_files: bool,
    child: Option<Child>,
    script_path: Option<PathBuf>,
    temp_dir: Option<TempDir>,
    started_at: Option<Instant>,
}

impl ShellScript {
    /// Create a script from (possibly indented) text.
    pub fn new(script: &str) -> Self {
        Self {
            script: dedent(script),
            working_dir: None,
            env: Vec::new(),
            log_file: None,
            keep_temp_files: false,
            child: None,
            script_path: None,
            temp_dir: None,
            started_at: None,
        }
    }

    /// Keep the generated script on disk after the run.
    pub fn keep_temp_files(mut self, keep: bool) -> Self {
        self.keep_temp_files = keep;
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add environment variables on top of the inherited environment.
    pub fn envs(mut self, vars: impl IntoIterator<Item = (String, String)>) -> Self {
        self.env.extend(vars);
        self
    }

    /// Send stdout and stderr to `path` instead of the parent's terminal.
    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    /// The dedented script text.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Where the script was written, once started.
    pub fn script_path(&self) -> Option<&Path> {
        self.script_path.as_deref()
    }

    /// Write the script and spawn it. Must be called inside a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        let temp_dir = tempfile::Builder::new()
            .prefix("spikerun_")
            .tempdir()
            .map_err(|e| SortError::io(std::env::temp_dir(), e))?;
        let script_path = temp_dir.path().join(SCRIPT_NAME);

        std::fs::write(&script_path, &self.script).map_err(|e| SortError::io(&script_path, e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| SortError::io(&script_path, e))?;
        }

        // Run through the interpreter rather than exec'ing the file we just
        // wrote: exec can fail with ETXTBSY while another thread forks.
        let mut cmd = if cfg!(windows) {
            let mut c = Command::new("cmd");
            c.arg("/C").arg(&script_path);
            c
        } else {
            let mut c = Command::new("/bin/sh");
            c.arg(&script_path);
            c
        };
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        // The script leads its own process group so the watchdog and
        // cancellation reach the tool it launches, not only the shell.
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);

        match &self.log_file {
            Some(log) => {
                let out = File::create(log).map_err(|e| SortError::io(log, e))?;
                let err = out.try_clone().map_err(|e| SortError::io(log, e))?;
                cmd.stdout(Stdio::from(out));
                cmd.stderr(Stdio::from(err));
            }
            None => {
                cmd.stdout(Stdio::inherit());
                cmd.stderr(Stdio::inherit());
            }
        }

        let child = cmd.spawn().map_err(|e| SortError::io(&script_path, e))?;
        debug!(script = %script_path.display(), pid = child.id(), "started shell script");

        self.child = Some(child);
        self.started_at = Some(Instant::now());
        self.script_path = Some(script_path);
        if self.keep_temp_files {
            let kept = temp_dir.keep();
            info!(dir = %kept.display(), "keeping generated script");
        } else {
            self.temp_dir = Some(temp_dir);
        }
        Ok(())
    }

    /// Block until the script exits.
    ///
    /// With a `timeout`, the child is killed when it expires and the report
    /// has `timed_out` set and no exit code.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitReport> {
        let script_path = self.script_path.clone().unwrap_or_default();
        let child = self
            .child
            .as_mut()
            .ok_or_else(|| SortError::io(&script_path, std::io::Error::other("script was not started")))?;
        let started = self.started_at.unwrap_or_else(Instant::now);

        let status = match timeout {
            None => Some(child.wait().await.map_err(|e| SortError::io(&script_path, e))?),
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(result) => Some(result.map_err(|e| SortError::io(&script_path, e))?),
                Err(_) => {
                    warn!(
                        script = %script_path.display(),
                        timeout_secs = limit.as_secs(),
                        "script exceeded watchdog timeout, killing"
                    );
                    kill_process_group(child);
                    if let Err(e) = child.kill().await {
                        warn!(script = %script_path.display(), error = %e, "failed to kill script");
                    }
                    None
                }
            },
        };

        self.child = None;
        // Dropping the temp dir removes the script unless it was kept.
        self.temp_dir = None;

        Ok(ExitReport {
            code: status.and_then(|s| s.code()),
            timed_out: status.is_none(),
            elapsed: started.elapsed(),
        })
    }
}

impl Drop for ShellScript {
    fn drop(&mut self) {
        // A cancelled run drops the script mid-wait; take the tool down with it.
        if let Some(child) = &self.child {
            kill_process_group(child);
        }
    }
}

/// SIGKILL every process in the child's group.
#[cfg(unix)]
fn kill_process_group(child: &Child) {
    let Some(pid) = child.id() else {
        return;
    };
    // SAFETY: the child was spawned with `process_group(0)`, so its pid is
    // also the id of a group that holds only the script and its descendants.
    let ret = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if ret != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "failed to kill process group");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

/// Strip leading blank lines and the whitespace prefix common to all
/// non-blank lines.
pub fn dedent(text: &str) -> String {
    let lines: Vec<&str> = text
        .lines()
        .skip_while(|l| l.trim().is_empty())
        .collect();
    let indent = lines
        .iter()
        .filter(|l| !l.trim().is_empty())
        .map(|l| leading_whitespace(l))
        .min_by_key(|prefix| prefix.len())
        .unwrap_or("");

    let mut out = String::with_capacity(text.len());
    for line in lines {
        if !line.trim().is_empty() {
            out.push_str(common_prefix_stripped(line, indent));
        }
        out.push('\n');
    }
    out
}

fn leading_whitespace(line: &str) -> &str {
    &line[..line.len() - line.trim_start().len()]
}

/// Remove `indent` from the front of `line`, or as much of it as the line
/// shares when the whitespace characters differ.
fn common_prefix_stripped<'a>(line: &'a str, indent: &str) -> &'a str {
    let shared: usize = line
        .char_indices()
        .zip(indent.chars())
        .take_while(|((_, a), b)| a == b)
        .map(|((_, a), _)| a.len_utf8())
        .sum();
    &line[shared..]
}
