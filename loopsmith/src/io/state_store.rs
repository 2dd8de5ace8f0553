//! Run state storage (`.loopsmith/state/run_state.json`).
//!
//! Every write replaces the whole record (temp file + rename), so a crash can
//! never leave a half-written field. Callers mutate state through
//! [`StateStore::update`], which reads, merges a patch and writes back.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::types::{Phase, RunStatus, Verdict};
use crate::io::paths::ProjectPaths;

/// Persisted run bookkeeping for one repository.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct RunState {
    pub status: RunStatus,
    pub phase: Phase,
    /// Task the loop is working on (or worked on last).
    pub current_task_id: Option<String>,
    /// Global attempt counter, bumped once per attempt. Never decreases.
    pub iteration: u64,
    /// The single live work session for this repository.
    pub work_session_id: Option<String>,
    /// Message every attempt reverts the work session to.
    pub baseline_message_id: Option<String>,
    /// Artifact directory of the current or most recent attempt.
    pub run_dir: Option<String>,
    pub last_gate: Verdict,
    #[serde(rename = "lastUI")]
    pub last_ui: Verdict,
    pub last_verifier: Verdict,
    /// Session that invoked the current run; receives notifications.
    pub control_session_id: Option<String>,
    /// Human-readable reason for the last BLOCKED transition.
    pub last_reason: Option<String>,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

/// Partial update merged into [`RunState`] by [`StateStore::update`].
///
/// `None` leaves a field untouched. For optional fields `Some(None)` clears
/// the stored value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunStatePatch {
    pub status: Option<RunStatus>,
    pub phase: Option<Phase>,
    pub current_task_id: Option<Option<String>>,
    pub iteration: Option<u64>,
    pub work_session_id: Option<Option<String>>,
    pub baseline_message_id: Option<Option<String>>,
    pub run_dir: Option<Option<String>>,
    pub last_gate: Option<Verdict>,
    pub last_ui: Option<Verdict>,
    pub last_verifier: Option<Verdict>,
    pub control_session_id: Option<Option<String>>,
    pub last_reason: Option<Option<String>>,
}

impl RunStatePatch {
    /// Shallow merge: provided keys overwrite, the rest is preserved.
    pub fn apply(self, state: &mut RunState) {
        fn set<T>(slot: &mut T, value: Option<T>) {
            if let Some(value) = value {
                *slot = value;
            }
        }
        set(&mut state.status, self.status);
        set(&mut state.phase, self.phase);
        set(&mut state.current_task_id, self.current_task_id);
        set(&mut state.iteration, self.iteration);
        set(&mut state.work_session_id, self.work_session_id);
        set(&mut state.baseline_message_id, self.baseline_message_id);
        set(&mut state.run_dir, self.run_dir);
        set(&mut state.last_gate, self.last_gate);
        set(&mut state.last_ui, self.last_ui);
        set(&mut state.last_verifier, self.last_verifier);
        set(&mut state.control_session_id, self.control_session_id);
        set(&mut state.last_reason, self.last_reason);
    }
}

/// File-backed store for [`RunState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(paths: &ProjectPaths) -> Self {
        Self::at(paths.run_state_path.clone())
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load run state, falling back to the default for a missing or corrupt file.
    pub fn read(&self) -> Result<RunState> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "run state missing, using default");
            return Ok(RunState::default());
        }
        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("read run state {}", self.path.display()))?;
        match serde_json::from_str::<RunState>(&contents) {
            Ok(state) => {
                debug!(iteration = state.iteration, status = %state.status, "run state loaded");
                Ok(state)
            }
            Err(err) => {
                warn!(path = %self.path.display(), err = %err, "run state corrupt, using default");
                Ok(RunState::default())
            }
        }
    }

    /// Atomically replace the stored record.
    pub fn write(&self, state: &RunState) -> Result<()> {
        debug!(path = %self.path.display(), iteration = state.iteration, status = %state.status, "writing run state");
        let mut buf = serde_json::to_string_pretty(state)?;
        buf.push('\n');
        write_atomic(&self.path, &buf)
    }

    /// Read-merge-write. Always refreshes `updatedAt` (and stamps `createdAt`
    /// on first use). Returns the stored state.
    pub fn update(&self, patch: RunStatePatch) -> Result<RunState> {
        let mut state = self.read()?;
        patch.apply(&mut state);
        let now = now_timestamp();
        if state.created_at.is_none() {
            state.created_at = Some(now.clone());
        }
        state.updated_at = Some(now);
        self.write(&state)?;
        Ok(state)
    }

    /// Bump the global iteration counter and return the new value.
    pub fn bump_iteration(&self) -> Result<u64> {
        let current = self.read()?.iteration;
        let next = current + 1;
        self.update(RunStatePatch {
            iteration: Some(next),
            ..RunStatePatch::default()
        })?;
        Ok(next)
    }
}

/// RFC 3339 UTC timestamp with millisecond precision.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
