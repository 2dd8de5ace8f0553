//! Feature backlog (`.loopsmith/state/backlog.json`).
//!
//! A feature request spawns zero or more tasks when planned. The link is by
//! id only: tasks outlive the feature's planning status.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::core::task::{TaskList, TaskStatus};
use crate::io::state_store::{now_timestamp, write_atomic};

const FEATURE_ID_PREFIX: &str = "F-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureStatus {
    #[default]
    Open,
    Planned,
    Implemented,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRequest {
    pub id: String,
    pub title: String,
    pub request: String,
    #[serde(default)]
    pub status: FeatureStatus,
    #[serde(default)]
    pub task_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backlog {
    pub version: u32,
    #[serde(default)]
    pub features: Vec<FeatureRequest>,
}

impl Default for Backlog {
    fn default() -> Self {
        Self {
            version: 1,
            features: Vec::new(),
        }
    }
}

impl Backlog {
    pub fn get(&self, id: &str) -> Option<&FeatureRequest> {
        self.features.iter().find(|f| f.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut FeatureRequest> {
        self.features.iter_mut().find(|f| f.id == id)
    }

    fn next_id(&self) -> String {
        let next = self
            .features
            .iter()
            .filter_map(|f| f.id.strip_prefix(FEATURE_ID_PREFIX)?.parse::<u32>().ok())
            .max()
            .unwrap_or(0)
            + 1;
        format!("{FEATURE_ID_PREFIX}{next:03}")
    }

    /// Append an open feature request and return its id.
    pub fn add_feature(&mut self, title: &str, request: &str) -> String {
        let id = self.next_id();
        self.features.push(FeatureRequest {
            id: id.clone(),
            title: title.trim().to_string(),
            request: request.trim().to_string(),
            status: FeatureStatus::Open,
            task_ids: Vec::new(),
            created_at: Some(now_timestamp()),
        });
        id
    }

    pub fn count(&self, status: FeatureStatus) -> usize {
        self.features.iter().filter(|f| f.status == status).count()
    }
}

/// Mark planned features implemented once every task they spawned is completed.
///
/// Returns the ids that changed.
pub fn refresh_feature_statuses(backlog: &mut Backlog, tasks: &TaskList) -> Vec<String> {
    let mut changed = Vec::new();
    for feature in &mut backlog.features {
        if feature.status != FeatureStatus::Planned || feature.task_ids.is_empty() {
            continue;
        }
        let all_done = feature.task_ids.iter().all(|id| {
            tasks
                .get(id)
                .is_some_and(|task| task.status == TaskStatus::Completed)
        });
        if all_done {
            info!(feature = %feature.id, "feature implemented");
            feature.status = FeatureStatus::Implemented;
            changed.push(feature.id.clone());
        }
    }
    changed
}

/// Load the backlog. A missing file yields an empty backlog.
pub fn load_backlog(path: &Path) -> Result<Backlog> {
    if !path.exists() {
        debug!(path = %path.display(), "backlog missing, using empty backlog");
        return Ok(Backlog::default());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read backlog {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse backlog {}", path.display()))
}

pub fn write_backlog(path: &Path, backlog: &Backlog) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(backlog)?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Task;

    #[test]
    fn add_feature_allocates_ids() {
        let mut backlog = Backlog::default();
        assert_eq!(backlog.add_feature("Login", "Users can log in"), "F-001");
        assert_eq!(backlog.add_feature("Logout", "  Users can log out "), "F-002");
        let feature = backlog.get("F-002").expect("feature");
        assert_eq!(feature.request, "Users can log out");
        assert_eq!(feature.status, FeatureStatus::Open);
    }

    #[test]
    fn refresh_marks_fully_completed_features() {
        let mut backlog = Backlog::default();
        let done = backlog.add_feature("a", "a");
        let pending = backlog.add_feature("b", "b");
        backlog.get_mut(&done).expect("f").status = FeatureStatus::Planned;
        backlog.get_mut(&done).expect("f").task_ids = vec!["T-001".to_string()];
        backlog.get_mut(&pending).expect("f").status = FeatureStatus::Planned;
        backlog.get_mut(&pending).expect("f").task_ids =
            vec!["T-001".to_string(), "T-002".to_string()];

        let mut tasks = TaskList::default();
        let mut first = Task::new("T-001", "one");
        first.status = TaskStatus::Completed;
        tasks.tasks.push(first);
        tasks.tasks.push(Task::new("T-002", "two"));

        let changed = refresh_feature_statuses(&mut backlog, &tasks);
        assert_eq!(changed, vec![done.clone()]);
        assert_eq!(backlog.get(&done).expect("f").status, FeatureStatus::Implemented);
        assert_eq!(backlog.get(&pending).expect("f").status, FeatureStatus::Planned);
    }

    #[test]
    fn refresh_ignores_missing_tasks() {
        let mut backlog = Backlog::default();
        let id = backlog.add_feature("a", "a");
        let feature = backlog.get_mut(&id).expect("f");
        feature.status = FeatureStatus::Planned;
        feature.task_ids = vec!["T-404".to_string()];
        assert!(refresh_feature_statuses(&mut backlog, &TaskList::default()).is_empty());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("backlog.json");
        let mut backlog = Backlog::default();
        backlog.add_feature("x", "y");
        write_backlog(&path, &backlog).expect("write");
        assert_eq!(load_backlog(&path).expect("load"), backlog);
    }
}
