//! Work session lifecycle.
//!
//! A repository has at most one live work session. Its id and baseline
//! message id live in the run state; every attempt reverts the session to the
//! baseline so the agent starts from the same rules without the cost of a
//! fresh session.

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::io::paths::ProjectPaths;
use crate::io::platform::{AgentPlatform, PlatformError, PromptRequest};
use crate::io::prompts::{BaselineInputs, PromptEngine};
use crate::io::state_store::{RunStatePatch, StateStore};

/// Ready-to-use work session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    pub baseline_message_id: String,
}

/// Result of [`SessionManager::ensure_not_in_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionGuard {
    Ok,
    Blocked { reason: String },
}

/// Result of [`delete_best_effort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// Already gone; treated as success.
    NotFound,
    /// Target was the protected control session.
    SkippedControl,
    Failed,
    /// No session to delete.
    None,
}

pub struct SessionManager<'a> {
    platform: &'a dyn AgentPlatform,
    store: &'a StateStore,
    paths: &'a ProjectPaths,
    prompts: &'a PromptEngine,
}

impl<'a> SessionManager<'a> {
    pub fn new(
        platform: &'a dyn AgentPlatform,
        store: &'a StateStore,
        paths: &'a ProjectPaths,
        prompts: &'a PromptEngine,
    ) -> Self {
        Self {
            platform,
            store,
            paths,
            prompts,
        }
    }

    /// Return the stored session if the platform still knows it, otherwise
    /// create one and install the baseline.
    #[instrument(skip(self))]
    pub fn ensure_session(&self, agent: Option<&str>) -> Result<SessionHandle> {
        let state = self.store.read()?;

        if let Some(session_id) = state.work_session_id.as_deref() {
            match self.platform.get(session_id) {
                Ok(_) => {
                    if let Some(baseline) = state.baseline_message_id {
                        debug!(session_id, "reusing work session");
                        return Ok(SessionHandle {
                            session_id: session_id.to_string(),
                            baseline_message_id: baseline,
                        });
                    }
                    info!(session_id, "work session has no baseline, installing one");
                    return self.install_baseline(session_id, agent);
                }
                Err(PlatformError::NotFound(_)) => {
                    warn!(session_id, "stored work session no longer exists, recreating");
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("look up work session {session_id}"));
                }
            }
        }

        let title = format!("loopsmith: {}", self.project_name());
        let session_id = self
            .platform
            .create(&title)
            .context("create work session")?;
        info!(session_id = %session_id, "created work session");
        self.install_baseline(&session_id, agent)
    }

    /// Ensure a session, then revert it to its baseline message.
    #[instrument(skip(self))]
    pub fn reset_session(&self, agent: Option<&str>) -> Result<SessionHandle> {
        let handle = self.ensure_session(agent)?;
        self.platform
            .revert(&handle.session_id, &handle.baseline_message_id)
            .with_context(|| format!("revert work session {}", handle.session_id))?;
        debug!(session_id = %handle.session_id, "work session reverted to baseline");
        Ok(handle)
    }

    /// Refuse control operations issued from inside the work session itself.
    pub fn ensure_not_in_session(&self, caller_session: Option<&str>) -> Result<SessionGuard> {
        let Some(caller) = caller_session else {
            return Ok(SessionGuard::Ok);
        };
        let state = self.store.read()?;
        if state.work_session_id.as_deref() == Some(caller) {
            return Ok(SessionGuard::Blocked {
                reason: format!(
                    "session {caller} is the loopsmith work session; run loop commands from another session"
                ),
            });
        }
        Ok(SessionGuard::Ok)
    }

    /// Forget the stored session ids (after the session was deleted).
    pub fn forget_session(&self) -> Result<()> {
        self.store.update(RunStatePatch {
            work_session_id: Some(None),
            baseline_message_id: Some(None),
            ..RunStatePatch::default()
        })?;
        Ok(())
    }

    fn install_baseline(&self, session_id: &str, agent: Option<&str>) -> Result<SessionHandle> {
        let text = self.render_baseline()?;
        let request = PromptRequest::text(text).with_agent(agent).no_reply();
        let reply = self
            .platform
            .prompt(session_id, &request)
            .with_context(|| format!("send baseline to {session_id}"))?;
        self.store.update(RunStatePatch {
            work_session_id: Some(Some(session_id.to_string())),
            baseline_message_id: Some(Some(reply.message_id.clone())),
            ..RunStatePatch::default()
        })?;
        info!(session_id, baseline = %reply.message_id, "baseline installed");
        Ok(SessionHandle {
            session_id: session_id.to_string(),
            baseline_message_id: reply.message_id,
        })
    }

    fn render_baseline(&self) -> Result<String> {
        let paths = self.paths;
        let protected: Vec<String> = [
            &paths.run_state_path,
            &paths.config_path,
            &paths.tasks_path,
            &paths.backlog_path,
            &paths.lock_path,
        ]
        .into_iter()
        .map(|p| paths.relative(p))
        .collect();
        self.prompts.render_baseline(&BaselineInputs {
            protected_files: &protected,
            prd_path: &paths.relative(&paths.prd_path),
            tasks_path: &paths.relative(&paths.tasks_path),
            runs_dir: &paths.relative(&paths.runs_dir),
        })
    }

    fn project_name(&self) -> String {
        self.paths
            .root
            .file_name()
            .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned())
    }
}

/// Delete `session` unless it is the protected control session.
///
/// Never fails; a missing session counts as deleted.
pub fn delete_best_effort(
    platform: &dyn AgentPlatform,
    session: Option<&str>,
    protected: Option<&str>,
) -> DeleteOutcome {
    let Some(session) = session else {
        return DeleteOutcome::None;
    };
    if protected == Some(session) {
        debug!(session, "not deleting the control session");
        return DeleteOutcome::SkippedControl;
    }
    match platform.delete(session) {
        Ok(()) => {
            info!(session, "work session deleted");
            DeleteOutcome::Deleted
        }
        Err(PlatformError::NotFound(_)) => DeleteOutcome::NotFound,
        Err(err) => {
            warn!(session, err = %err, "failed to delete work session");
            DeleteOutcome::Failed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::state_store::RunState;
    use crate::test_support::{FakePlatform, PlatformCall};

    struct Fixture {
        _temp: tempfile::TempDir,
        paths: ProjectPaths,
        store: StateStore,
        prompts: PromptEngine,
        platform: FakePlatform,
    }

    fn fixture() -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = ProjectPaths::new(temp.path());
        let store = StateStore::new(&paths);
        Fixture {
            _temp: temp,
            paths,
            store,
            prompts: PromptEngine::new(10_000).expect("prompts"),
            platform: FakePlatform::new(),
        }
    }

    impl Fixture {
        fn manager(&self) -> SessionManager<'_> {
            SessionManager::new(&self.platform, &self.store, &self.paths, &self.prompts)
        }
    }

    #[test]
    fn ensure_session_is_idempotent() {
        let fx = fixture();
        let first = fx.manager().ensure_session(Some("build")).expect("first");
        let second = fx.manager().ensure_session(Some("build")).expect("second");
        assert_eq!(first, second);
        assert_eq!(fx.platform.created_sessions().len(), 1);

        let state = fx.store.read().expect("read");
        assert_eq!(state.work_session_id.as_deref(), Some(first.session_id.as_str()));
        assert_eq!(
            state.baseline_message_id.as_deref(),
            Some(first.baseline_message_id.as_str())
        );
    }

    #[test]
    fn baseline_is_sent_without_reply() {
        let fx = fixture();
        let handle = fx.manager().ensure_session(None).expect("ensure");
        let prompt = fx
            .platform
            .calls()
            .into_iter()
            .find_map(|call| match call {
                PlatformCall::Prompt { session, request } => Some((session, request)),
                _ => None,
            })
            .expect("baseline prompt");
        assert_eq!(prompt.0, handle.session_id);
        assert!(prompt.1.no_reply);
    }

    #[test]
    fn missing_session_is_recreated() {
        let fx = fixture();
        fx.store
            .write(&RunState {
                work_session_id: Some("ses_gone".to_string()),
                baseline_message_id: Some("msg_gone".to_string()),
                ..RunState::default()
            })
            .expect("write");
        let handle = fx.manager().ensure_session(None).expect("ensure");
        assert_ne!(handle.session_id, "ses_gone");
        assert_eq!(fx.platform.created_sessions().len(), 1);
    }

    #[test]
    fn other_lookup_errors_propagate() {
        let fx = fixture();
        let session = fx.platform.add_session();
        fx.store
            .write(&RunState {
                work_session_id: Some(session),
                baseline_message_id: Some("msg_1".to_string()),
                ..RunState::default()
            })
            .expect("write");
        fx.platform.fail_lookups();
        assert!(fx.manager().ensure_session(None).is_err());
        assert!(fx.platform.created_sessions().is_empty());
    }

    #[test]
    fn reset_reverts_to_baseline() {
        let fx = fixture();
        let handle = fx.manager().reset_session(None).expect("reset");
        assert!(fx.platform.calls().contains(&PlatformCall::Revert {
            session: handle.session_id.clone(),
            message: handle.baseline_message_id.clone(),
        }));
    }

    #[test]
    fn guard_blocks_work_session_caller() {
        let fx = fixture();
        let handle = fx.manager().ensure_session(None).expect("ensure");
        assert!(matches!(
            fx.manager()
                .ensure_not_in_session(Some(&handle.session_id))
                .expect("guard"),
            SessionGuard::Blocked { .. }
        ));
        assert_eq!(
            fx.manager().ensure_not_in_session(Some("ses_control")).expect("guard"),
            SessionGuard::Ok
        );
        assert_eq!(
            fx.manager().ensure_not_in_session(None).expect("guard"),
            SessionGuard::Ok
        );
    }

    #[test]
    fn delete_best_effort_outcomes() {
        let platform = FakePlatform::new();
        let live = platform.add_session();
        assert_eq!(delete_best_effort(&platform, None, None), DeleteOutcome::None);
        assert_eq!(
            delete_best_effort(&platform, Some(&live), Some(&live)),
            DeleteOutcome::SkippedControl
        );
        assert_eq!(
            delete_best_effort(&platform, Some(&live), None),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            delete_best_effort(&platform, Some(&live), None),
            DeleteOutcome::NotFound
        );
        let other = platform.add_session();
        platform.fail_deletes();
        assert_eq!(
            delete_best_effort(&platform, Some(&other), None),
            DeleteOutcome::Failed
        );
    }
}
