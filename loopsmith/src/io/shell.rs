//! Shell execution capability.
//!
//! Gates, the dev server and the browser automation CLI all run through the
//! [`Shell`] trait so tests can script them without spawning processes.

use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use crate::io::process::{run_command_with_timeout, spawn_logged};

/// Parameters for a single shell command.
#[derive(Debug, Clone)]
pub struct ShellRequest {
    pub command: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Result of a shell command. A nonzero exit is a value, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutput {
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// A long-lived process started by [`Shell::spawn_background`].
pub trait BackgroundJob {
    /// Terminate the process. Killing an already exited job is not an error.
    fn kill(&mut self) -> Result<()>;
}

pub trait Shell {
    /// Run `request.command` through a POSIX shell and wait for it.
    fn run(&self, request: &ShellRequest) -> Result<ShellOutput>;

    /// Start `command` in the background with its output sent to `log_path`.
    fn spawn_background(
        &self,
        command: &str,
        workdir: &Path,
        log_path: &Path,
    ) -> Result<Box<dyn BackgroundJob>>;
}

/// Shell backed by `sh -c`.
pub struct SystemShell;

impl Shell for SystemShell {
    #[instrument(skip_all, fields(command = %request.command))]
    fn run(&self, request: &ShellRequest) -> Result<ShellOutput> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&request.command)
            .current_dir(&request.workdir);
        let output = run_command_with_timeout(cmd, request.timeout, request.output_limit_bytes)
            .with_context(|| format!("run `{}`", request.command))?;
        debug!(exit_code = ?output.status.code(), timed_out = output.timed_out, "shell command finished");
        Ok(ShellOutput {
            exit_code: output.status.code(),
            stdout: output.stdout_text(),
            stderr: output.stderr_text(),
            timed_out: output.timed_out,
            duration: output.duration,
        })
    }

    fn spawn_background(
        &self,
        command: &str,
        workdir: &Path,
        log_path: &Path,
    ) -> Result<Box<dyn BackgroundJob>> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(workdir);
        let child = spawn_logged(cmd, log_path).with_context(|| format!("start `{command}`"))?;
        Ok(Box::new(ChildJob { child }))
    }
}

struct ChildJob {
    child: Child,
}

impl BackgroundJob for ChildJob {
    fn kill(&mut self) -> Result<()> {
        if self.child.try_wait().context("poll background job")?.is_some() {
            return Ok(());
        }
        if let Err(err) = self.child.kill() {
            warn!(pid = self.child.id(), err = %err, "failed to kill background job");
        }
        self.child.wait().context("wait background job")?;
        Ok(())
    }
}

impl Drop for ChildJob {
    fn drop(&mut self) {
        if let Err(err) = self.kill() {
            warn!(err = %err, "background job cleanup failed");
        }
    }
}
