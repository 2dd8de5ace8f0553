//! Human-readable project status for `loopsmith status`.

use std::fmt;

use anyhow::Result;

use crate::core::task::TaskStatus;
use crate::io::backlog::{FeatureStatus, load_backlog};
use crate::io::lock::{LockInfo, read_lock};
use crate::io::paths::{ProjectPaths, prd_is_complete};
use crate::io::state_store::{RunState, StateStore};
use crate::io::task_store::load_tasks;
use crate::select::{SelectOutcome, select_task};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub state: RunState,
    pub prd_complete: bool,
    pub task_counts: Vec<(TaskStatus, usize)>,
    pub next: SelectOutcome,
    pub features_open: usize,
    pub features_planned: usize,
    pub features_implemented: usize,
    /// Holder of the run lock, when a run is active.
    pub lock: Option<LockInfo>,
}

pub fn status_report(paths: &ProjectPaths) -> Result<StatusReport> {
    let state = StateStore::new(paths).read()?;
    let tasks = load_tasks(&paths.tasks_path)?;
    let backlog = load_backlog(&paths.backlog_path)?;
    Ok(StatusReport {
        state,
        prd_complete: prd_is_complete(paths)?,
        task_counts: tasks.counts(),
        next: select_task(&tasks),
        features_open: backlog.count(FeatureStatus::Open),
        features_planned: backlog.count(FeatureStatus::Planned),
        features_implemented: backlog.count(FeatureStatus::Implemented),
        lock: read_lock(&paths.lock_path),
    })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = &self.state;
        writeln!(
            f,
            "status: {}  phase: {}  iteration: {}",
            state.status, state.phase, state.iteration
        )?;
        if !self.prd_complete {
            writeln!(f, "prd: draft")?;
        }
        if let Some(task) = &state.current_task_id {
            writeln!(f, "current task: {task}")?;
        }
        writeln!(
            f,
            "verdicts: gate={} ui={} judge={}",
            state.last_gate, state.last_ui, state.last_verifier
        )?;
        if let Some(reason) = &state.last_reason {
            writeln!(f, "last reason: {reason}")?;
        }
        if let Some(dir) = &state.run_dir {
            writeln!(f, "last run dir: {dir}")?;
        }
        if let Some(session) = &state.work_session_id {
            writeln!(f, "work session: {session}")?;
        }
        let counts: Vec<String> = self
            .task_counts
            .iter()
            .filter(|(_, n)| *n > 0)
            .map(|(status, n)| format!("{}={n}", status.as_str()))
            .collect();
        if counts.is_empty() {
            writeln!(f, "tasks: none")?;
        } else {
            writeln!(f, "tasks: {}", counts.join(" "))?;
        }
        match &self.next {
            SelectOutcome::Complete => writeln!(f, "next: none")?,
            SelectOutcome::Next(task) => writeln!(f, "next: {} {}", task.id, task.title)?,
        }
        writeln!(
            f,
            "backlog: open={} planned={} implemented={}",
            self.features_open, self.features_planned, self.features_implemented
        )?;
        if let Some(lock) = &self.lock {
            writeln!(f, "run active: pid {} since {}", lock.pid, lock.started_at)?;
        }
        Ok(())
    }
}
