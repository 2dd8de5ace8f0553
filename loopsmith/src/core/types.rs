//! Shared deterministic types for the loop core.
//!
//! These enums are persisted in `run_state.json` and `tasks.json`; their
//! serialized spellings are part of the on-disk contract.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Overall status of the run for a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    /// Work is in progress or resumable.
    #[default]
    Doing,
    /// Every task reached a terminal status.
    Done,
    /// The last attempt blocked; a human (or a new run) must intervene.
    Blocked,
}

/// Workflow phase the project is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Requirements are still being written.
    #[default]
    Prd,
    /// Tasks are being planned from the PRD and backlog.
    Plan,
    /// The run loop is executing tasks.
    Run,
}

/// Outcome of a verification stage (gates, UI, judge).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    /// The stage has not run yet (or was skipped).
    #[default]
    None,
    Pass,
    Fail,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunStatus::Doing => "DOING",
            RunStatus::Done => "DONE",
            RunStatus::Blocked => "BLOCKED",
        })
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Prd => "prd",
            Phase::Plan => "plan",
            Phase::Run => "run",
        })
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Verdict::None => "NONE",
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
        })
    }
}
