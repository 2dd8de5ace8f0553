//! Semantic invariants not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::task::{Task, task_ordinal};

/// Check semantic invariants of the task list:
/// - No duplicate ids
/// - Ids follow the `T-<digits>` ordinal format
/// - `dependsOn` and `parentId` reference existing tasks
/// - No task depends on itself
pub fn validate_task_invariants(tasks: &[Task]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for task in tasks {
        if !seen.insert(task.id.as_str()) {
            errors.push(format!("duplicate id '{}'", task.id));
        }
        if task_ordinal(&task.id).is_none() {
            errors.push(format!("{}: id must look like T-001", task.id));
        }
    }

    let ids: HashSet<&str> = tasks.iter().map(|t| t.id.as_str()).collect();
    for task in tasks {
        for dep in &task.depends_on {
            if dep == &task.id {
                errors.push(format!("{}: depends on itself", task.id));
            } else if !ids.contains(dep.as_str()) {
                errors.push(format!("{}: dependsOn references unknown id '{dep}'", task.id));
            }
        }
        if let Some(parent) = &task.parent_id
            && !ids.contains(parent.as_str())
        {
            errors.push(format!("{}: parentId references unknown id '{parent}'", task.id));
        }
    }
    errors
}
