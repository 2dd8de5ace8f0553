//! Deterministic selection logic for the task list.

use crate::core::task::{Task, TaskStatus};

/// Find the first task, in stored order, whose status is not terminal.
///
/// Returns `None` if every task is completed or cancelled (or the list is empty).
pub fn next_eligible(tasks: &[Task]) -> Option<&Task> {
    tasks.iter().find(|task| !task.status.is_terminal())
}

/// Ids in `task.depends_on` that are not completed (or do not exist).
///
/// Dependencies are advisory: selection does not consult them, callers may warn.
pub fn unmet_dependencies<'a>(task: &'a Task, tasks: &[Task]) -> Vec<&'a str> {
    task.depends_on
        .iter()
        .filter(|dep| {
            !tasks
                .iter()
                .any(|t| &t.id == *dep && t.status == TaskStatus::Completed)
        })
        .map(String::as_str)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, status: TaskStatus) -> Task {
        let mut task = Task::new(id, format!("{id} title"));
        task.status = status;
        task
    }

    #[test]
    fn selects_first_non_terminal_in_stored_order() {
        let tasks = vec![
            task("T-003", TaskStatus::Completed),
            task("T-001", TaskStatus::Cancelled),
            task("T-004", TaskStatus::Blocked),
            task("T-002", TaskStatus::Open),
        ];
        assert_eq!(next_eligible(&tasks).map(|t| t.id.as_str()), Some("T-004"));
    }

    #[test]
    fn in_progress_tasks_are_resumed() {
        let tasks = vec![
            task("T-001", TaskStatus::Completed),
            task("T-002", TaskStatus::InProgress),
        ];
        assert_eq!(next_eligible(&tasks).map(|t| t.id.as_str()), Some("T-002"));
    }

    #[test]
    fn returns_none_iff_all_terminal() {
        assert!(next_eligible(&[]).is_none());
        let tasks = vec![
            task("T-001", TaskStatus::Completed),
            task("T-002", TaskStatus::Cancelled),
        ];
        assert!(next_eligible(&tasks).is_none());

        let statuses = [
            TaskStatus::Open,
            TaskStatus::InProgress,
            TaskStatus::Blocked,
            TaskStatus::Completed,
            TaskStatus::Cancelled,
        ];
        for a in statuses {
            for b in statuses {
                let tasks = vec![task("T-001", a), task("T-002", b)];
                let all_terminal = a.is_terminal() && b.is_terminal();
                assert_eq!(next_eligible(&tasks).is_none(), all_terminal, "{a:?} {b:?}");
            }
        }
    }

    #[test]
    fn unmet_dependencies_lists_incomplete_and_missing() {
        let mut target = task("T-003", TaskStatus::Open);
        target.depends_on.insert("T-001".to_string());
        target.depends_on.insert("T-002".to_string());
        target.depends_on.insert("T-009".to_string());
        let tasks = vec![
            task("T-001", TaskStatus::Completed),
            task("T-002", TaskStatus::Open),
            target.clone(),
        ];
        assert_eq!(unmet_dependencies(&target, &tasks), vec!["T-002", "T-009"]);
    }
}
