//! Backlog decomposition for `loopsmith plan`.
//!
//! A feature request becomes one or more tasks. With the agent, the work
//! session is asked for a JSON envelope; anything that fails to parse or
//! validate falls back to a single task derived from the request itself.

use std::fs;
use std::sync::LazyLock;

use anyhow::{Result, anyhow, bail};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::envelope::extract_typed;
use crate::core::task::Task;
use crate::core::types::Phase;
use crate::io::backlog::{FeatureRequest, FeatureStatus, load_backlog, write_backlog};
use crate::io::config::LoopConfig;
use crate::io::paths::ProjectPaths;
use crate::io::platform::{AgentPlatform, PromptRequest};
use crate::io::prompts::{DecomposeInputs, PromptEngine};
use crate::io::session::SessionManager;
use crate::io::state_store::{RunStatePatch, StateStore};
use crate::io::task_store::{load_tasks, write_tasks};

const DECOMPOSE_SCHEMA: &str = include_str!("../schemas/decompose.schema.json");

static DECOMPOSE_SCHEMA_VALUE: LazyLock<Result<Value, String>> =
    LazyLock::new(|| serde_json::from_str(DECOMPOSE_SCHEMA).map_err(|err| err.to_string()));

pub struct PlanDeps<'a> {
    pub paths: &'a ProjectPaths,
    pub config: &'a LoopConfig,
    pub platform: &'a dyn AgentPlatform,
    pub prompts: &'a PromptEngine,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanOutcome {
    pub feature_id: String,
    pub task_ids: Vec<String>,
    /// Set when the agent reply was unusable (or the agent was not asked).
    pub fallback_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    tasks: Vec<TaskDraft>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskDraft {
    title: String,
    #[serde(default)]
    acceptance: Vec<String>,
    #[serde(default)]
    done_when: Vec<String>,
    #[serde(default)]
    scope: Vec<String>,
    #[serde(default)]
    labels: Vec<String>,
}

impl TaskDraft {
    fn fallback(feature: &FeatureRequest) -> Self {
        Self {
            title: feature.title.clone(),
            acceptance: vec![feature.request.clone()],
            done_when: Vec::new(),
            scope: Vec::new(),
            labels: Vec::new(),
        }
    }

    fn into_task(self, feature_id: &str) -> Task {
        let mut task = Task::new("T-000", self.title.trim());
        task.acceptance = self.acceptance;
        task.done_when = self
            .done_when
            .into_iter()
            .map(|cmd| cmd.trim().to_string())
            .filter(|cmd| !cmd.is_empty() && !cmd.contains('\n'))
            .collect();
        task.scope = self.scope;
        task.labels = self.labels.into_iter().collect();
        task.labels.insert(format!("feature:{feature_id}"));
        task
    }
}

/// Turn backlog feature `feature_id` into tasks.
#[instrument(skip(deps))]
pub fn plan_feature(deps: &PlanDeps<'_>, feature_id: &str, use_agent: bool) -> Result<PlanOutcome> {
    let mut backlog = load_backlog(&deps.paths.backlog_path)?;
    let feature = backlog
        .get(feature_id)
        .cloned()
        .ok_or_else(|| anyhow!("unknown feature {feature_id}"))?;
    if feature.status != FeatureStatus::Open {
        bail!("feature {feature_id} is already planned");
    }
    let mut tasks = load_tasks(&deps.paths.tasks_path)?;

    let (drafts, fallback_reason) = if use_agent {
        match ask_agent(deps, &feature, &tasks.tasks)? {
            Ok(drafts) => (drafts, None),
            Err(reason) => {
                warn!(reason = %reason, "decomposition unusable, using fallback task");
                (vec![TaskDraft::fallback(&feature)], Some(reason))
            }
        }
    } else {
        (
            vec![TaskDraft::fallback(&feature)],
            Some("agent not consulted".to_string()),
        )
    };

    let task_ids: Vec<String> = drafts
        .into_iter()
        .map(|draft| tasks.push_new(draft.into_task(feature_id)))
        .collect();
    write_tasks(&deps.paths.tasks_path, &tasks)?;

    if let Some(entry) = backlog.get_mut(feature_id) {
        entry.status = FeatureStatus::Planned;
        entry.task_ids = task_ids.clone();
    }
    write_backlog(&deps.paths.backlog_path, &backlog)?;
    StateStore::new(deps.paths).update(RunStatePatch {
        phase: Some(Phase::Plan),
        ..RunStatePatch::default()
    })?;

    info!(feature = feature_id, tasks = task_ids.len(), "feature planned");
    Ok(PlanOutcome {
        feature_id: feature_id.to_string(),
        task_ids,
        fallback_reason,
    })
}

/// Ask the work session for a decomposition. The outer error is a platform
/// or I/O failure; the inner error is an unusable reply.
fn ask_agent(
    deps: &PlanDeps<'_>,
    feature: &FeatureRequest,
    existing: &[Task],
) -> Result<Result<Vec<TaskDraft>, String>> {
    let store = StateStore::new(deps.paths);
    let sessions = SessionManager::new(deps.platform, &store, deps.paths, deps.prompts);
    let session = sessions.reset_session(deps.config.agent.as_deref())?;

    let prd = fs::read_to_string(&deps.paths.prd_path).ok();
    let prompt = deps.prompts.render_decompose(&DecomposeInputs {
        feature,
        existing,
        prd: prd.as_deref(),
    })?;
    let reply = deps.platform.prompt(
        &session.session_id,
        &PromptRequest::text(prompt).with_agent(deps.config.agent.as_deref()),
    )?;

    let schema = match DECOMPOSE_SCHEMA_VALUE.as_ref() {
        Ok(schema) => schema,
        Err(err) => return Ok(Err(format!("decompose schema is invalid: {err}"))),
    };
    Ok(extract_typed::<Envelope>(&reply.text, schema)
        .map(|envelope| envelope.tasks)
        .map_err(|err| err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskStatus;
    use crate::io::backlog::Backlog;
    use crate::test_support::{FakePlatform, PlatformCall, TestProject};

    fn setup() -> (TestProject, String) {
        let project = TestProject::new().expect("project");
        let mut backlog = Backlog::default();
        let id = backlog.add_feature("Login", "Users can sign in with email");
        project.write_backlog(&backlog).expect("backlog");
        (project, id)
    }

    fn plan(project: &TestProject, platform: &FakePlatform, id: &str, agent: bool) -> PlanOutcome {
        let config = LoopConfig::default();
        let prompts = PromptEngine::new(20_000).expect("prompts");
        let deps = PlanDeps {
            paths: project.paths(),
            config: &config,
            platform,
            prompts: &prompts,
        };
        plan_feature(&deps, id, agent).expect("plan")
    }

    #[test]
    fn agent_envelope_becomes_tasks() {
        let (project, id) = setup();
        let platform = FakePlatform::new();
        platform.push_reply(
            "Here is the plan:\n```json\n{\"tasks\": [\
             {\"title\": \"Login form\", \"doneWhen\": [\"npm test\"]},\
             {\"title\": \"Session cookie\", \"acceptance\": [\"cookie is httpOnly\"]}]}\n```\n",
        );
        let outcome = plan(&project, &platform, &id, true);
        assert_eq!(outcome.task_ids, vec!["T-001", "T-002"]);
        assert!(outcome.fallback_reason.is_none());

        let tasks = project.tasks().expect("tasks");
        assert_eq!(tasks.tasks[0].title, "Login form");
        assert_eq!(tasks.tasks[0].done_when, vec!["npm test"]);
        assert!(tasks.tasks[1].labels.contains("feature:F-001"));
        assert_eq!(tasks.tasks[1].status, TaskStatus::Open);

        let backlog = project.backlog().expect("backlog");
        let feature = backlog.get(&id).expect("feature");
        assert_eq!(feature.status, FeatureStatus::Planned);
        assert_eq!(feature.task_ids, vec!["T-001", "T-002"]);
        assert_eq!(project.state().expect("state").phase, Phase::Plan);
        assert!(
            platform
                .calls()
                .iter()
                .any(|call| matches!(call, PlatformCall::Revert { .. }))
        );
    }

    #[test]
    fn malformed_reply_falls_back_to_single_task() {
        let (project, id) = setup();
        let platform = FakePlatform::new();
        platform.push_reply("I think you should build a login page.");
        let outcome = plan(&project, &platform, &id, true);
        assert_eq!(outcome.task_ids, vec!["T-001"]);
        assert!(outcome.fallback_reason.is_some());
        let tasks = project.tasks().expect("tasks");
        assert_eq!(tasks.tasks[0].title, "Login");
        assert_eq!(tasks.tasks[0].acceptance, vec!["Users can sign in with email"]);
    }

    #[test]
    fn schema_violation_falls_back() {
        let (project, id) = setup();
        let platform = FakePlatform::new();
        platform.push_reply("```json\n{\"tasks\": []}\n```");
        let outcome = plan(&project, &platform, &id, true);
        assert_eq!(outcome.task_ids.len(), 1);
        assert!(
            outcome
                .fallback_reason
                .expect("reason")
                .contains("schema")
        );
    }

    #[test]
    fn no_agent_skips_platform() {
        let (project, id) = setup();
        let platform = FakePlatform::new();
        let outcome = plan(&project, &platform, &id, false);
        assert_eq!(outcome.task_ids, vec!["T-001"]);
        assert!(platform.calls().is_empty());
    }

    #[test]
    fn planned_feature_is_not_replanned() {
        let (project, id) = setup();
        let platform = FakePlatform::new();
        plan(&project, &platform, &id, false);
        let config = LoopConfig::default();
        let prompts = PromptEngine::new(20_000).expect("prompts");
        let deps = PlanDeps {
            paths: project.paths(),
            config: &config,
            platform: &platform,
            prompts: &prompts,
        };
        assert!(plan_feature(&deps, &id, false).is_err());
        assert!(plan_feature(&deps, "F-999", false).is_err());
    }

    #[test]
    fn embedded_schema_parses() {
        assert!(DECOMPOSE_SCHEMA_VALUE.is_ok());
    }
}
