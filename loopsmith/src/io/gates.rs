//! Deterministic quality gates.
//!
//! A gate is a shell command whose exit code decides part of a task's
//! definition of done. Gates run strictly in order and stop at the first
//! failure; later gates are reported as "not reached", never as failed.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::task::Task;
use crate::io::config::{LoopConfig, load_config, write_config};
use crate::io::shell::{Shell, ShellRequest};

/// Where a gate came from. Only auto-detected gates are written back to config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateSource {
    Auto,
    #[default]
    Configured,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateCommand {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub source: GateSource,
}

impl GateCommand {
    pub fn configured(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            source: GateSource::Configured,
        }
    }

    pub fn auto(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            source: GateSource::Auto,
        }
    }
}

/// Per-command record. Only commands that actually ran produce one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateResult {
    pub name: String,
    pub command: String,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    Passed,
    /// A command ran and exited nonzero (or timed out, or failed to spawn).
    Failed,
    /// A command was refused before anything executed.
    Rejected,
    /// Nothing to run. Distinct from a pass.
    NoGates,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateReport {
    pub status: GateStatus,
    pub summary: String,
    pub failed_command: Option<String>,
    pub results: Vec<GateResult>,
    pub not_reached: Vec<String>,
}

impl GateReport {
    pub fn ok(&self) -> bool {
        self.status == GateStatus::Passed
    }
}

#[derive(Debug, Clone)]
pub struct GateOptions<'a> {
    pub workdir: &'a Path,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Reason a command string is refused, if any.
pub fn reject_reason(command: &str) -> Option<&'static str> {
    if command.trim().is_empty() {
        Some("empty command")
    } else if command.contains('\n') || command.contains('\r') {
        Some("command contains a newline")
    } else {
        None
    }
}

/// Run gates in order, stopping at the first failure.
///
/// Never returns an error: spawn failures are recorded as failed results.
#[instrument(skip_all, fields(gates = gates.len()))]
pub fn run_gates(shell: &dyn Shell, gates: &[GateCommand], options: &GateOptions<'_>) -> GateReport {
    if gates.is_empty() {
        return GateReport {
            status: GateStatus::NoGates,
            summary: "no gates configured".to_string(),
            failed_command: None,
            results: Vec::new(),
            not_reached: Vec::new(),
        };
    }

    for gate in gates {
        if let Some(reason) = reject_reason(&gate.command) {
            warn!(gate = %gate.name, reason, "gate command rejected");
            return GateReport {
                status: GateStatus::Rejected,
                summary: format!("gate `{}` rejected: {reason}", gate.name),
                failed_command: Some(gate.command.clone()),
                results: Vec::new(),
                not_reached: gates.iter().map(|g| g.name.clone()).collect(),
            };
        }
    }

    let mut results = Vec::new();
    for (idx, gate) in gates.iter().enumerate() {
        info!(gate = %gate.name, command = %gate.command, "running gate");
        let request = ShellRequest {
            command: gate.command.clone(),
            workdir: options.workdir.to_path_buf(),
            timeout: options.timeout,
            output_limit_bytes: options.output_limit_bytes,
        };
        let result = match shell.run(&request) {
            Ok(output) => GateResult {
                name: gate.name.clone(),
                command: gate.command.clone(),
                exit_code: output.exit_code,
                duration_ms: output.duration.as_millis() as u64,
                stdout: output.stdout,
                stderr: output.stderr,
                timed_out: output.timed_out,
            },
            Err(err) => {
                warn!(gate = %gate.name, err = %err, "gate failed to start");
                GateResult {
                    name: gate.name.clone(),
                    command: gate.command.clone(),
                    exit_code: None,
                    duration_ms: 0,
                    stdout: String::new(),
                    stderr: format!("{err:#}"),
                    timed_out: false,
                }
            }
        };
        let passed = result.passed();
        let summary = describe_failure(&result);
        results.push(result);
        if !passed {
            let not_reached = gates[idx + 1..].iter().map(|g| g.name.clone()).collect();
            return GateReport {
                status: GateStatus::Failed,
                summary,
                failed_command: Some(gate.command.clone()),
                results,
                not_reached,
            };
        }
    }

    GateReport {
        status: GateStatus::Passed,
        summary: format!("{} gate(s) passed", results.len()),
        failed_command: None,
        results,
        not_reached: Vec::new(),
    }
}

fn describe_failure(result: &GateResult) -> String {
    if result.timed_out {
        format!("gate `{}` timed out: {}", result.name, result.command)
    } else {
        match result.exit_code {
            Some(code) => format!(
                "gate `{}` failed with exit code {code}: {}",
                result.name, result.command
            ),
            None => format!("gate `{}` did not exit normally: {}", result.name, result.command),
        }
    }
}

/// Gates for one attempt: project gates followed by the task's `doneWhen`
/// commands, skipping commands already present.
pub fn attempt_gates(project: &[GateCommand], task: &Task) -> Vec<GateCommand> {
    let mut gates = project.to_vec();
    for (idx, command) in task.done_when.iter().enumerate() {
        if gates.iter().any(|g| g.command == *command) {
            continue;
        }
        gates.push(GateCommand::configured(
            format!("{}:done-when-{}", task.id, idx + 1),
            command.clone(),
        ));
    }
    gates
}

/// Gates configured by the user, or auto-detected ones when none are.
pub fn resolve_gates(root: &Path, config: &LoopConfig) -> Vec<GateCommand> {
    if !config.gates.is_empty() {
        return config.gates.clone();
    }
    detect_gates(root)
}

/// Inspect well-known build files in `root` and derive gate commands.
pub fn detect_gates(root: &Path) -> Vec<GateCommand> {
    let mut gates = Vec::new();

    if root.join("Cargo.toml").is_file() {
        gates.push(GateCommand::auto("cargo-build", "cargo build --all-targets"));
        gates.push(GateCommand::auto("cargo-test", "cargo test"));
    }

    if let Some(scripts) = package_scripts(root) {
        let runner = package_runner(root);
        for script in ["lint", "typecheck", "build", "test"] {
            if scripts.iter().any(|s| s == script) {
                gates.push(GateCommand::auto(
                    format!("{runner}-{script}"),
                    format!("{runner} run {script}"),
                ));
            }
        }
    }

    if root.join("go.mod").is_file() {
        gates.push(GateCommand::auto("go-build", "go build ./..."));
        gates.push(GateCommand::auto("go-test", "go test ./..."));
    }

    if gates.is_empty() && makefile_has_test_target(root) {
        gates.push(GateCommand::auto("make-test", "make test"));
    }

    gates
}

fn package_scripts(root: &Path) -> Option<Vec<String>> {
    let path = root.join("package.json");
    let contents = fs::read_to_string(&path).ok()?;
    let value: serde_json::Value = match serde_json::from_str(&contents) {
        Ok(value) => value,
        Err(err) => {
            warn!(path = %path.display(), err = %err, "package.json unreadable, skipping scripts");
            return None;
        }
    };
    let scripts = value.get("scripts")?.as_object()?;
    Some(scripts.keys().cloned().collect())
}

fn package_runner(root: &Path) -> &'static str {
    if root.join("pnpm-lock.yaml").is_file() {
        "pnpm"
    } else if root.join("yarn.lock").is_file() {
        "yarn"
    } else if root.join("bun.lockb").is_file() || root.join("bun.lock").is_file() {
        "bun"
    } else {
        "npm"
    }
}

fn makefile_has_test_target(root: &Path) -> bool {
    fs::read_to_string(root.join("Makefile"))
        .map(|contents| contents.lines().any(|line| line.starts_with("test:")))
        .unwrap_or(false)
}

/// Write auto-detected gates into the config file.
///
/// User-authored gates are never overwritten. Returns the gates now in effect.
pub fn persist_auto_gates(
    root: &Path,
    config_path: &Path,
    gates: &[GateCommand],
) -> Result<Vec<GateCommand>> {
    let mut config = load_config(config_path)?;
    if !config.gates.is_empty() {
        info!("config already lists gates, not persisting auto-detected ones");
        return Ok(config.gates);
    }
    let auto: Vec<GateCommand> = gates
        .iter()
        .filter(|g| g.source == GateSource::Auto)
        .cloned()
        .collect();
    if auto.is_empty() {
        return Ok(resolve_gates(root, &config));
    }
    config.gates = auto.clone();
    write_config(config_path, &config)?;
    info!(count = auto.len(), "persisted auto-detected gates");
    Ok(auto)
}

/// Write `gate.log` (human-readable) and `gates.json` (structured report).
pub fn write_gate_artifacts(log_path: &Path, json_path: &Path, report: &GateReport) -> Result<()> {
    let mut log = String::new();
    for result in &report.results {
        log.push_str(&format!(
            "=== {} ===\n$ {}\nexit: {}  duration: {}ms{}\n--- stdout ---\n{}\n--- stderr ---\n{}\n\n",
            result.name,
            result.command,
            result
                .exit_code
                .map_or_else(|| "none".to_string(), |c| c.to_string()),
            result.duration_ms,
            if result.timed_out { "  (timed out)" } else { "" },
            result.stdout,
            result.stderr,
        ));
    }
    for name in &report.not_reached {
        log.push_str(&format!("=== {name} ===\n(not reached)\n\n"));
    }
    log.push_str(&format!("summary: {}\n", report.summary));

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create gate log dir {}", parent.display()))?;
    }
    fs::write(log_path, log).with_context(|| format!("write gate log {}", log_path.display()))?;
    let mut json = serde_json::to_string_pretty(report)?;
    json.push('\n');
    fs::write(json_path, json).with_context(|| format!("write {}", json_path.display()))
}
