//! Selection helpers for `loopsmith select` and `loopsmith status`.

use std::path::Path;

use anyhow::{Context, Result};

use crate::core::selector::{next_eligible, unmet_dependencies};
use crate::core::task::{TaskList, TaskStatus};
use crate::io::paths::ProjectPaths;
use crate::io::task_store::load_tasks;

/// Structured selection outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Every task is completed or cancelled (or there are none).
    Complete,
    Next(SelectedTask),
}

/// Minimal selected task metadata for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectedTask {
    pub id: String,
    pub title: String,
    pub status: TaskStatus,
    /// Dependencies that are not completed yet. Advisory only.
    pub unmet_dependencies: Vec<String>,
}

pub fn select_task(tasks: &TaskList) -> SelectOutcome {
    match next_eligible(&tasks.tasks) {
        None => SelectOutcome::Complete,
        Some(task) => SelectOutcome::Next(SelectedTask {
            id: task.id.clone(),
            title: task.title.clone(),
            status: task.status,
            unmet_dependencies: unmet_dependencies(task, &tasks.tasks)
                .into_iter()
                .map(str::to_string)
                .collect(),
        }),
    }
}

/// Load the task list from disk and select the next task.
pub fn select_from_root(root: &Path) -> Result<SelectOutcome> {
    let paths = ProjectPaths::new(root);
    let tasks = load_tasks(&paths.tasks_path).context("load tasks for selection")?;
    Ok(select_task(&tasks))
}
