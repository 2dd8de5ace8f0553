//! Loop configuration stored under `.loopsmith/state/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::gates::GateCommand;
use crate::io::state_store::write_atomic;

/// Loop configuration (TOML).
///
/// This file is intended to be edited by humans and must remain stable and
/// automatable. Missing fields default to the reference policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoopConfig {
    /// Maximum number of task attempts per `loopsmith run`.
    pub max_items: u32,

    /// Agent used for build turns (platform default when unset).
    pub agent: Option<String>,

    /// Agent used for the judge turn (falls back to `agent`).
    pub verify_agent: Option<String>,

    /// Ceiling for a build turn to report idle, in seconds.
    pub build_timeout_secs: u64,

    /// Interval between session status polls, in milliseconds.
    pub poll_interval_ms: u64,

    /// Consecutive idle readings accepted as completion when the session was
    /// never observed busy.
    pub settle_polls: u32,

    /// Per-gate command timeout, in seconds.
    pub gate_timeout_secs: u64,

    /// Truncate captured stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Ceiling for the synchronous judge prompt, in seconds.
    pub judge_timeout_secs: u64,

    /// Delete the work session once every task is done.
    pub delete_session_on_done: bool,

    /// Deterministic quality gates. Empty means "auto-detect".
    pub gates: Vec<GateCommand>,

    pub platform: PlatformConfig,
    pub ui: UiConfig,
    pub progress: ProgressConfig,
}

/// Where the agent platform server lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlatformConfig {
    pub base_url: String,
    /// Directory passed to the platform; defaults to the project root.
    pub directory: Option<String>,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:4096".to_string(),
            directory: None,
        }
    }
}

/// Browser-driven UI verification settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UiConfig {
    pub enabled: bool,
    /// When set, missing prerequisites or a failed check block the task.
    pub required: bool,
    /// Command that starts the dev server (e.g. `npm run dev`).
    pub dev_command: Option<String>,
    /// URL polled for readiness and opened in the browser.
    pub url: String,
    /// Browser automation CLI.
    pub browser_command: String,
    /// Named browser session, isolating loopsmith from interactive use.
    pub session: String,
    pub ready_attempts: u32,
    pub ready_interval_ms: u64,
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            required: false,
            dev_command: None,
            url: "http://localhost:3000".to_string(),
            browser_command: "agent-browser".to_string(),
            session: "loopsmith".to_string(),
            ready_attempts: 60,
            ready_interval_ms: 1000,
        }
    }
}

/// Progress relay limits.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProgressConfig {
    pub max_lines: usize,
    pub min_interval_ms: u64,
    pub max_chars: usize,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            max_lines: 5,
            min_interval_ms: 900,
            max_chars: 800,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            max_items: 5,
            agent: None,
            verify_agent: None,
            build_timeout_secs: 20 * 60,
            poll_interval_ms: 1000,
            settle_polls: 2,
            gate_timeout_secs: 30 * 60,
            output_limit_bytes: 100_000,
            judge_timeout_secs: 20 * 60,
            delete_session_on_done: true,
            gates: Vec::new(),
            platform: PlatformConfig::default(),
            ui: UiConfig::default(),
            progress: ProgressConfig::default(),
        }
    }
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_items == 0 {
            return Err(anyhow!("max_items must be > 0"));
        }
        if self.build_timeout_secs == 0 {
            return Err(anyhow!("build_timeout_secs must be > 0"));
        }
        if self.poll_interval_ms == 0 {
            return Err(anyhow!("poll_interval_ms must be > 0"));
        }
        if self.gate_timeout_secs == 0 {
            return Err(anyhow!("gate_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.judge_timeout_secs == 0 {
            return Err(anyhow!("judge_timeout_secs must be > 0"));
        }
        if self.platform.base_url.trim().is_empty() {
            return Err(anyhow!("platform.base_url must not be empty"));
        }
        for gate in &self.gates {
            if gate.name.trim().is_empty() {
                return Err(anyhow!("gates[].name must not be empty"));
            }
        }
        if self.ui.enabled && self.ui.browser_command.trim().is_empty() {
            return Err(anyhow!("ui.browser_command must not be empty"));
        }
        Ok(())
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }

    pub fn judge_timeout(&self) -> Duration {
        Duration::from_secs(self.judge_timeout_secs)
    }

    pub fn verify_agent(&self) -> Option<&str> {
        self.verify_agent.as_deref().or(self.agent.as_deref())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::gates::GateSource;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, LoopConfig::default());
        assert_eq!(cfg.build_timeout(), Duration::from_secs(1200));
        assert_eq!(cfg.ui.ready_attempts, 60);
        assert_eq!(cfg.progress.min_interval_ms, 900);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = LoopConfig {
            agent: Some("build".to_string()),
            gates: vec![GateCommand::configured("test", "cargo test")],
            ..LoopConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_uses_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "max_items = 2\n\n[[gates]]\nname = \"lint\"\ncommand = \"npm run lint\"\n\n[ui]\nenabled = true\n",
        )
        .expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.max_items, 2);
        assert_eq!(cfg.gates.len(), 1);
        assert_eq!(cfg.gates[0].source, GateSource::Configured);
        assert!(cfg.ui.enabled);
        assert_eq!(cfg.ui.browser_command, "agent-browser");
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let cfg = LoopConfig {
            max_items: 0,
            ..LoopConfig::default()
        };
        assert!(cfg.validate().is_err());
        let cfg = LoopConfig {
            poll_interval_ms: 0,
            ..LoopConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn verify_agent_falls_back_to_build_agent() {
        let cfg = LoopConfig {
            agent: Some("build".to_string()),
            ..LoopConfig::default()
        };
        assert_eq!(cfg.verify_agent(), Some("build"));
    }
}
