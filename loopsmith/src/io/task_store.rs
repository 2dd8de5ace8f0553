//! Task list load/save helpers with schema + invariant validation.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, anyhow};
use jsonschema::{Validator, validator_for};
use serde_json::Value;
use tracing::debug;

use crate::core::invariants::validate_task_invariants;
use crate::core::task::TaskList;
use crate::io::state_store::write_atomic;

const TASKS_SCHEMA: &str = include_str!("../../schemas/tasks.schema.json");

static TASKS_VALIDATOR: LazyLock<Result<Validator, String>> = LazyLock::new(|| {
    let schema: Value = serde_json::from_str(TASKS_SCHEMA).map_err(|err| err.to_string())?;
    validator_for(&schema).map_err(|err| err.to_string())
});

/// Load and validate the task list (schema + invariants).
///
/// A missing file yields an empty list.
pub fn load_tasks(path: &Path) -> Result<TaskList> {
    if !path.exists() {
        debug!(path = %path.display(), "tasks file missing, using empty list");
        return Ok(TaskList::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read tasks {}", path.display()))?;
    let value: Value = serde_json::from_str(&contents)
        .with_context(|| format!("parse tasks {}", path.display()))?;
    validate_schema(&value).with_context(|| format!("validate {}", path.display()))?;
    let list: TaskList = serde_json::from_value(value)
        .with_context(|| format!("deserialize tasks {}", path.display()))?;
    validate_invariants(&list)?;
    Ok(list)
}

/// Atomically write the task list after re-checking invariants.
pub fn write_tasks(path: &Path, list: &TaskList) -> Result<()> {
    validate_invariants(list)?;
    let mut buf = serde_json::to_string_pretty(list)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn validate_schema(value: &Value) -> Result<()> {
    let validator = TASKS_VALIDATOR
        .as_ref()
        .map_err(|err| anyhow!("invalid tasks schema: {err}"))?;
    let messages: Vec<String> = validator
        .iter_errors(value)
        .map(|err| err.to_string())
        .collect();
    if messages.is_empty() {
        return Ok(());
    }
    Err(anyhow!(
        "tasks schema validation failed: {}",
        messages.join("; ")
    ))
}

fn validate_invariants(list: &TaskList) -> Result<()> {
    let errors = validate_task_invariants(&list.tasks);
    if errors.is_empty() {
        return Ok(());
    }
    Err(anyhow!("task invariants failed: {}", errors.join("; ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{Task, TaskStatus};

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        let mut list = TaskList::default();
        let mut task = Task::new("", "first");
        task.acceptance.push("works".to_string());
        list.push_new(task);
        let mut second = Task::new("", "second");
        second.depends_on.insert("T-001".to_string());
        second.status = TaskStatus::Blocked;
        list.push_new(second);

        write_tasks(&path, &list).expect("write");
        assert_eq!(load_tasks(&path).expect("load"), list);
    }

    #[test]
    fn missing_file_is_empty_list() {
        let temp = tempfile::tempdir().expect("tempdir");
        let list = load_tasks(&temp.path().join("tasks.json")).expect("load");
        assert!(list.tasks.is_empty());
    }

    #[test]
    fn schema_rejects_unknown_status() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        fs::write(
            &path,
            r#"{"version":1,"tasks":[{"id":"T-001","title":"x","status":"finished"}]}"#,
        )
        .expect("write");
        let err = load_tasks(&path).unwrap_err();
        assert!(format!("{err:#}").contains("schema validation failed"));
    }

    #[test]
    fn invariants_reject_unknown_dependency() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("tasks.json");
        fs::write(
            &path,
            r#"{"version":1,"tasks":[{"id":"T-001","title":"x","dependsOn":["T-009"]}]}"#,
        )
        .expect("write");
        let err = load_tasks(&path).unwrap_err();
        assert!(err.to_string().contains("unknown id 'T-009'"));
    }

    #[test]
    fn write_refuses_duplicate_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut list = TaskList::default();
        list.tasks.push(Task::new("T-001", "a"));
        list.tasks.push(Task::new("T-001", "b"));
        assert!(write_tasks(&temp.path().join("tasks.json"), &list).is_err());
    }
}
