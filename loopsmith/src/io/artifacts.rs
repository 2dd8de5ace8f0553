//! Per-attempt artifact directories under `.loopsmith/runs/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::types::Verdict;
use crate::io::paths::ProjectPaths;

/// Paths of one attempt's artifacts.
#[derive(Debug, Clone)]
pub struct RunDir {
    pub dir: PathBuf,
    pub build_prompt_path: PathBuf,
    pub gate_log_path: PathBuf,
    pub gates_json_path: PathBuf,
    pub verify_prompt_path: PathBuf,
    pub verdict_path: PathBuf,
    pub meta_path: PathBuf,
    pub ui: UiArtifacts,
}

/// UI verification captures.
#[derive(Debug, Clone)]
pub struct UiArtifacts {
    pub dir: PathBuf,
    pub log_path: PathBuf,
    pub snapshot_path: PathBuf,
    pub screenshot_path: PathBuf,
    pub console_path: PathBuf,
    pub errors_path: PathBuf,
    pub dev_server_log_path: PathBuf,
}

impl UiArtifacts {
    fn new(dir: PathBuf) -> Self {
        Self {
            log_path: dir.join("ui.log"),
            snapshot_path: dir.join("snapshot.txt"),
            screenshot_path: dir.join("screenshot.png"),
            console_path: dir.join("console.log"),
            errors_path: dir.join("errors.log"),
            dev_server_log_path: dir.join("dev_server.log"),
            dir,
        }
    }
}

impl RunDir {
    /// Directory name: `<YYYYmmdd-HHMMSS>-<iteration:04>`.
    pub fn name(iteration: u64, now: DateTime<Utc>) -> String {
        format!("{}-{iteration:04}", now.format("%Y%m%d-%H%M%S"))
    }

    pub fn at(dir: PathBuf) -> Self {
        Self {
            build_prompt_path: dir.join("build_prompt.md"),
            gate_log_path: dir.join("gate.log"),
            gates_json_path: dir.join("gates.json"),
            verify_prompt_path: dir.join("verify_prompt.md"),
            verdict_path: dir.join("verdict.md"),
            meta_path: dir.join("meta.json"),
            ui: UiArtifacts::new(dir.join("ui")),
            dir,
        }
    }

    /// Create a fresh directory for `iteration`.
    pub fn create(paths: &ProjectPaths, iteration: u64, now: DateTime<Utc>) -> Result<Self> {
        let run_dir = Self::at(paths.runs_dir.join(Self::name(iteration, now)));
        fs::create_dir_all(&run_dir.dir)
            .with_context(|| format!("create run dir {}", run_dir.dir.display()))?;
        Ok(run_dir)
    }

    pub fn write_text(&self, path: &Path, contents: &str) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create artifact dir {}", parent.display()))?;
        }
        fs::write(path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn write_meta(&self, meta: &AttemptMeta) -> Result<()> {
        let mut buf = serde_json::to_string_pretty(meta)?;
        buf.push('\n');
        self.write_text(&self.meta_path, &buf)
    }
}

/// How an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Completed,
    Blocked,
    /// The attempt stopped on an unexpected error.
    Aborted,
}

/// Summary of one attempt, written to `meta.json` on every exit path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptMeta {
    pub task_id: String,
    pub iteration: u64,
    pub session_id: Option<String>,
    pub outcome: AttemptOutcome,
    pub reason: Option<String>,
    pub gate: Verdict,
    pub ui: Verdict,
    pub verifier: Verdict,
    pub started_at: String,
    pub ended_at: String,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn run_dir_name_is_timestamp_and_padded_iteration() {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 4, 5, 6, 7)
            .single()
            .expect("valid time");
        assert_eq!(RunDir::name(12, now), "20260304-050607-0012");
    }

    #[test]
    fn create_lays_out_artifact_paths() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        let run_dir = RunDir::create(&paths, 1, Utc::now()).expect("create");
        assert!(run_dir.dir.is_dir());
        assert!(run_dir.dir.starts_with(&paths.runs_dir));
        assert!(run_dir.gate_log_path.ends_with("gate.log"));
        assert!(run_dir.ui.screenshot_path.ends_with("ui/screenshot.png"));
        assert!(!run_dir.ui.dir.exists());
    }

    #[test]
    fn write_meta_serializes_camel_case() {
        let temp = tempfile::tempdir().expect("tempdir");
        let run_dir = RunDir::at(temp.path().join("r"));
        let meta = AttemptMeta {
            task_id: "T-001".to_string(),
            iteration: 3,
            session_id: None,
            outcome: AttemptOutcome::Blocked,
            reason: Some("gate failed".to_string()),
            gate: Verdict::Fail,
            ui: Verdict::None,
            verifier: Verdict::None,
            started_at: "a".to_string(),
            ended_at: "b".to_string(),
            duration_ms: 10,
        };
        run_dir.write_meta(&meta).expect("write");
        let value: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&run_dir.meta_path).expect("read"))
                .expect("json");
        assert_eq!(value["taskId"], "T-001");
        assert_eq!(value["outcome"], "blocked");
        assert_eq!(value["gate"], "FAIL");
    }
}
