//! Browser-driven UI verification.
//!
//! The verifier walks NotStarted → Starting → Ready → Driving → Stopped. The
//! dev server and the browser session are owned by a teardown guard, so both
//! are stopped on every exit path, including step failures.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::artifacts::UiArtifacts;
use crate::io::config::UiConfig;
use crate::io::shell::{BackgroundJob, Shell, ShellRequest};

const FRONTEND_PACKAGES: [&str; 10] = [
    "react",
    "vue",
    "svelte",
    "next",
    "vite",
    "@angular/core",
    "solid-js",
    "astro",
    "nuxt",
    "preact",
];

/// Whether UI verification can run for this project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiPrereq {
    Ready,
    Disabled,
    NotFrontend,
    MissingBrowser,
    MissingConfig,
}

impl UiPrereq {
    pub fn describe(self) -> &'static str {
        match self {
            UiPrereq::Ready => "ready",
            UiPrereq::Disabled => "UI verification disabled",
            UiPrereq::NotFrontend => "not a frontend project",
            UiPrereq::MissingBrowser => "browser automation CLI not found",
            UiPrereq::MissingConfig => "ui.dev_command or ui.url not configured",
        }
    }
}

/// True when `package.json` depends on a known frontend framework.
pub fn is_frontend_project(root: &Path) -> bool {
    let Ok(contents) = fs::read_to_string(root.join("package.json")) else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&contents) else {
        return false;
    };
    ["dependencies", "devDependencies"].iter().any(|key| {
        value
            .get(key)
            .and_then(|deps| deps.as_object())
            .is_some_and(|deps| FRONTEND_PACKAGES.iter().any(|pkg| deps.contains_key(*pkg)))
    })
}

pub fn detect_prerequisites(root: &Path, config: &UiConfig, shell: &dyn Shell) -> UiPrereq {
    if !config.enabled {
        return UiPrereq::Disabled;
    }
    if !is_frontend_project(root) {
        return UiPrereq::NotFrontend;
    }
    let has_dev_command = config
        .dev_command
        .as_deref()
        .is_some_and(|cmd| !cmd.trim().is_empty());
    if !has_dev_command || config.url.trim().is_empty() {
        return UiPrereq::MissingConfig;
    }
    let probe = ShellRequest {
        command: format!("command -v {}", shell_quote(&config.browser_command)),
        workdir: root.to_path_buf(),
        timeout: Duration::from_secs(10),
        output_limit_bytes: 4096,
    };
    match shell.run(&probe) {
        Ok(output) if output.success() => UiPrereq::Ready,
        Ok(_) => UiPrereq::MissingBrowser,
        Err(err) => {
            warn!(err = %err, "browser lookup failed");
            UiPrereq::MissingBrowser
        }
    }
}

/// Readiness check for the dev server URL.
pub trait UrlProbe {
    fn is_up(&self, url: &str) -> bool;
}

/// Any HTTP response (even an error status) means the server is listening.
pub struct HttpProbe {
    agent: ureq::Agent,
}

impl HttpProbe {
    pub fn new() -> Self {
        Self {
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(2))
                .build(),
        }
    }
}

impl Default for HttpProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl UrlProbe for HttpProbe {
    fn is_up(&self, url: &str) -> bool {
        match self.agent.get(url).call() {
            Ok(_) | Err(ureq::Error::Status(..)) => true,
            Err(ureq::Error::Transport(_)) => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UiPhase {
    NotStarted,
    Starting,
    Ready,
    Driving,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiStep {
    pub name: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UiReport {
    pub passed: bool,
    pub summary: String,
    pub steps: Vec<UiStep>,
    /// Captured artifact files that exist on disk.
    pub artifacts: Vec<PathBuf>,
    /// Phases visited, in order.
    pub phases: Vec<UiPhase>,
}

pub struct UiVerifier<'a> {
    pub shell: &'a dyn Shell,
    pub probe: &'a dyn UrlProbe,
    pub config: &'a UiConfig,
    pub root: &'a Path,
    pub step_timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Owns the dev server and browser session for one verification run.
struct Teardown<'a> {
    verifier: &'a UiVerifier<'a>,
    server: Option<Box<dyn BackgroundJob>>,
    browser_open: bool,
    log: String,
}

impl Teardown<'_> {
    fn stop(&mut self) {
        if self.browser_open {
            self.browser_open = false;
            match self.verifier.browser(&["close"]) {
                Ok(output) if output.success() => {}
                Ok(output) => warn!(exit_code = ?output.exit_code, "browser close failed"),
                Err(err) => warn!(err = %err, "browser close failed"),
            }
        }
        if let Some(mut server) = self.server.take() {
            if let Err(err) = server.kill() {
                warn!(err = %err, "failed to stop dev server");
            } else {
                debug!("dev server stopped");
            }
        }
    }
}

impl Drop for Teardown<'_> {
    fn drop(&mut self) {
        self.stop();
    }
}

impl UiVerifier<'_> {
    /// Run the full verification, writing artifacts under `artifacts.dir`.
    #[instrument(skip_all, fields(url = %self.config.url))]
    pub fn run(&self, artifacts: &UiArtifacts) -> Result<UiReport> {
        fs::create_dir_all(&artifacts.dir)
            .with_context(|| format!("create ui dir {}", artifacts.dir.display()))?;
        let mut phases = vec![UiPhase::NotStarted];
        let mut steps = Vec::new();
        let mut teardown = Teardown {
            verifier: self,
            server: None,
            browser_open: false,
            log: String::new(),
        };

        let outcome = self.drive(artifacts, &mut teardown, &mut phases, &mut steps);
        teardown.stop();
        phases.push(UiPhase::Stopped);

        let log = std::mem::take(&mut teardown.log);
        fs::write(&artifacts.log_path, log)
            .with_context(|| format!("write {}", artifacts.log_path.display()))?;

        let (passed, summary) = match outcome {
            Ok(()) => (true, "UI verification passed".to_string()),
            Err(reason) => (false, reason),
        };
        info!(passed, "UI verification finished");
        let artifacts = [
            &artifacts.log_path,
            &artifacts.snapshot_path,
            &artifacts.screenshot_path,
            &artifacts.console_path,
            &artifacts.errors_path,
            &artifacts.dev_server_log_path,
        ]
        .into_iter()
        .filter(|p| p.exists())
        .cloned()
        .collect();
        Ok(UiReport {
            passed,
            summary,
            steps,
            artifacts,
            phases,
        })
    }

    fn drive(
        &self,
        artifacts: &UiArtifacts,
        teardown: &mut Teardown<'_>,
        phases: &mut Vec<UiPhase>,
        steps: &mut Vec<UiStep>,
    ) -> std::result::Result<(), String> {
        phases.push(UiPhase::Starting);
        let dev_command = self
            .config
            .dev_command
            .as_deref()
            .ok_or_else(|| "ui.dev_command not configured".to_string())?;
        let server = self
            .shell
            .spawn_background(dev_command, self.root, &artifacts.dev_server_log_path)
            .map_err(|err| format!("dev server failed to start: {err:#}"))?;
        teardown.server = Some(server);
        teardown.log.push_str(&format!("$ {dev_command} (background)\n"));

        if !self.wait_ready() {
            return Err(format!(
                "dev server did not respond at {} after {} attempts",
                self.config.url, self.config.ready_attempts
            ));
        }
        phases.push(UiPhase::Ready);

        phases.push(UiPhase::Driving);
        let screenshot = artifacts.screenshot_path.display().to_string();
        let plan: [(&str, Vec<&str>, Option<&Path>); 5] = [
            ("open", vec!["open", self.config.url.as_str()], None),
            (
                "snapshot",
                vec!["snapshot"],
                Some(artifacts.snapshot_path.as_path()),
            ),
            ("screenshot", vec!["screenshot", screenshot.as_str()], None),
            ("console", vec!["console"], Some(artifacts.console_path.as_path())),
            ("errors", vec!["errors"], Some(artifacts.errors_path.as_path())),
        ];
        for (name, args, capture) in plan {
            // A failed or timed-out open may still have started a session.
            if name == "open" {
                teardown.browser_open = true;
            }
            let step = self.step(name, &args, capture, teardown);
            let ok = step.ok;
            let detail = step.detail.clone();
            steps.push(step);
            if !ok {
                return Err(format!("browser step `{name}` failed: {detail}"));
            }
        }

        let page_errors = fs::read_to_string(&artifacts.errors_path).unwrap_or_default();
        if !page_errors.trim().is_empty() {
            return Err("page reported errors (see errors.log)".to_string());
        }

        let close = self.step("close", &["close"], None, teardown);
        teardown.browser_open = false;
        let ok = close.ok;
        steps.push(close);
        if !ok {
            return Err("browser step `close` failed".to_string());
        }
        Ok(())
    }

    fn wait_ready(&self) -> bool {
        let interval = Duration::from_millis(self.config.ready_interval_ms);
        for attempt in 1..=self.config.ready_attempts {
            if self.probe.is_up(&self.config.url) {
                debug!(attempt, "dev server ready");
                return true;
            }
            if attempt < self.config.ready_attempts {
                thread::sleep(interval);
            }
        }
        false
    }

    fn step(
        &self,
        name: &str,
        args: &[&str],
        capture: Option<&Path>,
        teardown: &mut Teardown<'_>,
    ) -> UiStep {
        match self.browser(args) {
            Ok(output) => {
                teardown.log.push_str(&format!(
                    "$ {} {}\nexit: {:?}\n{}{}\n",
                    self.config.browser_command,
                    args.join(" "),
                    output.exit_code,
                    output.stdout,
                    output.stderr
                ));
                if let Some(path) = capture
                    && let Err(err) = fs::write(path, &output.stdout)
                {
                    warn!(path = %path.display(), err = %err, "failed to write ui artifact");
                }
                let ok = output.success();
                let detail = if ok {
                    String::new()
                } else if output.timed_out {
                    "timed out".to_string()
                } else {
                    format!("exit code {:?}: {}", output.exit_code, output.stderr.trim())
                };
                UiStep {
                    name: name.to_string(),
                    ok,
                    detail,
                }
            }
            Err(err) => {
                teardown.log.push_str(&format!("$ {name}: {err:#}\n"));
                UiStep {
                    name: name.to_string(),
                    ok: false,
                    detail: format!("{err:#}"),
                }
            }
        }
    }

    fn browser(&self, args: &[&str]) -> Result<crate::io::shell::ShellOutput> {
        let mut command = format!(
            "{} --session {}",
            shell_quote(&self.config.browser_command),
            shell_quote(&self.config.session)
        );
        for arg in args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        self.shell.run(&ShellRequest {
            command,
            workdir: self.root.to_path_buf(),
            timeout: self.step_timeout,
            output_limit_bytes: self.output_limit_bytes,
        })
    }
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:@=".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// How a UI verification result affects the attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UiDecision {
    Skipped { reason: String },
    Passed,
    /// Failed or could not run, but UI verification is optional.
    Informational { reason: String },
    /// Treated like a gate failure.
    Blocking { reason: String },
}

pub fn decide_ui(prereq: UiPrereq, report: Option<&UiReport>, required: bool) -> UiDecision {
    match prereq {
        UiPrereq::Disabled | UiPrereq::NotFrontend => UiDecision::Skipped {
            reason: prereq.describe().to_string(),
        },
        UiPrereq::MissingBrowser | UiPrereq::MissingConfig => {
            let reason = format!("UI verification unavailable: {}", prereq.describe());
            if required {
                UiDecision::Blocking { reason }
            } else {
                UiDecision::Informational { reason }
            }
        }
        UiPrereq::Ready => match report {
            Some(report) if report.passed => UiDecision::Passed,
            Some(report) if required => UiDecision::Blocking {
                reason: report.summary.clone(),
            },
            Some(report) => UiDecision::Informational {
                reason: report.summary.clone(),
            },
            None => UiDecision::Informational {
                reason: "UI verification did not run".to_string(),
            },
        },
    }
}
