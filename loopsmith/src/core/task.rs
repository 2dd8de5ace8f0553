//! Task model persisted in `.loopsmith/state/tasks.json`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::core::types::Verdict;

/// Prefix of ordinal task ids (`T-001`, `T-002`, ...).
pub const TASK_ID_PREFIX: &str = "T-";

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Open,
    InProgress,
    Blocked,
    Completed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal tasks are never selected again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

/// Record of the most recent execution attempt for a task.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastAttempt {
    /// Global iteration number the attempt ran under.
    pub iteration: u64,
    /// Judge verdict (NONE if the attempt stopped before judging).
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<String>,
    /// Human-readable reason when the attempt blocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A unit of work advanced by one loop iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    #[serde(default)]
    pub status: TaskStatus,
    pub title: String,
    /// Glob patterns the task is expected to touch.
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub acceptance: Vec<String>,
    /// Gate commands that define "done" for this task, run after project gates.
    #[serde(default)]
    pub done_when: Vec<String>,
    /// Artifact references (paths relative to the repository root).
    #[serde(default)]
    pub evidence: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt: Option<LastAttempt>,
}

impl Task {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: TaskStatus::Open,
            title: title.into(),
            scope: Vec::new(),
            parent_id: None,
            depends_on: BTreeSet::new(),
            labels: BTreeSet::new(),
            acceptance: Vec::new(),
            done_when: Vec::new(),
            evidence: Vec::new(),
            last_attempt: None,
        }
    }

    /// Append evidence paths, skipping ones already recorded.
    pub fn add_evidence<I, S>(&mut self, items: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for item in items {
            let item = item.into();
            if !self.evidence.contains(&item) {
                self.evidence.push(item);
            }
        }
    }
}

/// Ordered task list. Stored order is the execution order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskList {
    pub version: u32,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Default for TaskList {
    fn default() -> Self {
        Self {
            version: 1,
            tasks: Vec::new(),
        }
    }
}

impl TaskList {
    /// Allocate the next ordinal id. Ids are never reused, even when the
    /// highest-numbered task was removed by hand, because allocation is based
    /// on the maximum ordinal currently present plus one.
    pub fn next_id(&self) -> String {
        let next = self
            .tasks
            .iter()
            .filter_map(|task| task_ordinal(&task.id))
            .max()
            .unwrap_or(0)
            + 1;
        format_task_id(next)
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// Append a new task with a freshly allocated id and return that id.
    pub fn push_new(&mut self, mut task: Task) -> String {
        let id = self.next_id();
        task.id = id.clone();
        self.tasks.push(task);
        id
    }

    /// Count tasks per status, in a stable order.
    pub fn counts(&self) -> Vec<(TaskStatus, usize)> {
        [
            TaskStatus::Open,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ]
        .into_iter()
        .map(|status| {
            let count = self.tasks.iter().filter(|t| t.status == status).count();
            (status, count)
        })
        .collect()
    }
}

/// Parse the ordinal from a `T-<digits>` id.
pub fn task_ordinal(id: &str) -> Option<u32> {
    let digits = id.strip_prefix(TASK_ID_PREFIX)?;
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn format_task_id(ordinal: u32) -> String {
    format!("{TASK_ID_PREFIX}{ordinal:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_id_starts_at_one() {
        assert_eq!(TaskList::default().next_id(), "T-001");
    }

    #[test]
    fn next_id_uses_max_ordinal_not_length() {
        let mut list = TaskList::default();
        list.tasks.push(Task::new("T-002", "b"));
        list.tasks.push(Task::new("T-010", "c"));
        assert_eq!(list.next_id(), "T-011");
    }

    #[test]
    fn push_new_assigns_fresh_ids() {
        let mut list = TaskList::default();
        let first = list.push_new(Task::new("", "first"));
        let second = list.push_new(Task::new("", "second"));
        assert_eq!(first, "T-001");
        assert_eq!(second, "T-002");
        assert_eq!(list.get("T-002").map(|t| t.title.as_str()), Some("second"));
    }

    #[test]
    fn ordinal_rejects_foreign_ids() {
        assert_eq!(task_ordinal("T-007"), Some(7));
        assert_eq!(task_ordinal("T-"), None);
        assert_eq!(task_ordinal("PI-3"), None);
        assert_eq!(task_ordinal("T-1a"), None);
    }

    #[test]
    fn task_serializes_camel_case() {
        let mut task = Task::new("T-001", "t");
        task.done_when.push("cargo test".to_string());
        task.parent_id = Some("T-000".to_string());
        let json = serde_json::to_value(&task).expect("json");
        assert!(json.get("doneWhen").is_some());
        assert!(json.get("parentId").is_some());
        assert!(json.get("dependsOn").is_some());
        assert!(json.get("lastAttempt").is_none());
    }

    #[test]
    fn add_evidence_skips_duplicates() {
        let mut task = Task::new("T-001", "t");
        task.add_evidence(["a", "b"]);
        task.add_evidence(["b", "c"]);
        assert_eq!(task.evidence, vec!["a", "b", "c"]);
    }
}
