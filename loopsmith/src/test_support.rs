//! Scripted collaborators and project scaffolding for tests.
//!
//! Enabled for unit tests and, through the `test-support` feature, for the
//! integration tests under `tests/`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::task::{Task, TaskList};
use crate::io::backlog::{Backlog, load_backlog, write_backlog};
use crate::io::config::{LoopConfig, write_config};
use crate::io::notify::{Notifier, ToastVariant};
use crate::io::paths::{InitOptions, ProjectPaths, init_project};
use crate::io::platform::{
    AgentEvent, AgentPlatform, MessageInfo, PlatformError, PlatformResult, PromptReply,
    PromptRequest, SessionActivity, SessionInfo,
};
use crate::io::shell::{BackgroundJob, Shell, ShellOutput, ShellRequest};
use crate::io::state_store::{RunState, StateStore};
use crate::io::task_store::{load_tasks, write_tasks};

/// Judge reply that advances a task.
pub const PASS_REPLY: &str = "All checks look good.\n\nStatus: PASS\nEXIT_SIGNAL: true\n";
/// Judge reply that blocks a task.
pub const FAIL_REPLY: &str = "The login form is missing.\n\nStatus: FAIL\nEXIT_SIGNAL: false\n";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Call recorded by [`FakePlatform`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlatformCall {
    Create { title: String },
    UpdateTitle { session: String, title: String },
    Prompt { session: String, request: PromptRequest },
    PromptAsync { session: String, request: PromptRequest },
    Revert { session: String, message: String },
    Delete { session: String },
    Abort { session: String },
}

impl PlatformCall {
    /// Text of a prompt call, if this is one.
    pub fn prompt_text(&self) -> Option<String> {
        match self {
            PlatformCall::Prompt { request, .. } | PlatformCall::PromptAsync { request, .. } => {
                Some(
                    request
                        .parts
                        .iter()
                        .map(|part| match part {
                            crate::io::platform::PromptPart::Text { text } => text.as_str(),
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                )
            }
            _ => None,
        }
    }
}

#[derive(Default)]
struct PlatformState {
    next_id: u32,
    sessions: HashMap<String, Option<String>>,
    messages: HashMap<String, MessageInfo>,
    created: Vec<String>,
    calls: Vec<PlatformCall>,
    replies: VecDeque<String>,
    activity: HashMap<String, VecDeque<SessionActivity>>,
    busy: HashSet<String>,
    events: HashMap<String, Vec<AgentEvent>>,
    failing_status_polls: u32,
    fail_lookups: bool,
    fail_deletes: bool,
    fail_creates: bool,
}

impl PlatformState {
    fn allocate(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{:03}", self.next_id)
    }

    fn require(&self, session: &str) -> PlatformResult<()> {
        if self.sessions.contains_key(session) {
            Ok(())
        } else {
            Err(PlatformError::NotFound(format!("session {session}")))
        }
    }
}

/// In-memory agent platform with scripted replies and activity.
///
/// Sessions absent from the activity script report idle. Synchronous prompts
/// answer with queued replies, falling back to [`PASS_REPLY`].
#[derive(Default)]
pub struct FakePlatform {
    state: Mutex<PlatformState>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live session without recording a `create` call.
    pub fn add_session(&self) -> String {
        let mut state = lock(&self.state);
        let id = state.allocate("ses");
        state.sessions.insert(id.clone(), None);
        id
    }

    pub fn has_session(&self, session: &str) -> bool {
        lock(&self.state).sessions.contains_key(session)
    }

    /// Sessions created through [`AgentPlatform::create`].
    pub fn created_sessions(&self) -> Vec<String> {
        lock(&self.state).created.clone()
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        lock(&self.state).calls.clone()
    }

    /// Queue the text of the next synchronous reply.
    pub fn push_reply(&self, text: &str) {
        lock(&self.state).replies.push_back(text.to_string());
    }

    /// Activity readings returned by successive status polls for `session`.
    pub fn script_activity(&self, session: &str, readings: Vec<SessionActivity>) {
        lock(&self.state)
            .activity
            .insert(session.to_string(), readings.into());
    }

    /// Report `session` busy forever.
    pub fn hold_busy(&self, session: &str) {
        lock(&self.state).busy.insert(session.to_string());
    }

    /// Keep every session that gets created busy forever.
    pub fn hold_all_busy(&self) {
        lock(&self.state).busy.insert("*".to_string());
    }

    pub fn fail_status_polls(&self, count: u32) {
        lock(&self.state).failing_status_polls = count;
    }

    pub fn push_events(&self, session: &str, events: Vec<AgentEvent>) {
        lock(&self.state)
            .events
            .entry(session.to_string())
            .or_default()
            .extend(events);
    }

    /// Make `get` fail with a server error.
    pub fn fail_lookups(&self) {
        lock(&self.state).fail_lookups = true;
    }

    pub fn fail_deletes(&self) {
        lock(&self.state).fail_deletes = true;
    }

    pub fn fail_creates(&self) {
        lock(&self.state).fail_creates = true;
    }
}

impl AgentPlatform for FakePlatform {
    fn create(&self, title: &str) -> PlatformResult<String> {
        let mut state = lock(&self.state);
        state.calls.push(PlatformCall::Create {
            title: title.to_string(),
        });
        if state.fail_creates {
            return Err(PlatformError::Transport("connection refused".to_string()));
        }
        let id = state.allocate("ses");
        state.sessions.insert(id.clone(), Some(title.to_string()));
        state.created.push(id.clone());
        Ok(id)
    }

    fn update_title(&self, session_id: &str, title: &str) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(PlatformCall::UpdateTitle {
            session: session_id.to_string(),
            title: title.to_string(),
        });
        state.require(session_id)?;
        state
            .sessions
            .insert(session_id.to_string(), Some(title.to_string()));
        Ok(())
    }

    fn prompt(&self, session_id: &str, request: &PromptRequest) -> PlatformResult<PromptReply> {
        let mut state = lock(&self.state);
        state.calls.push(PlatformCall::Prompt {
            session: session_id.to_string(),
            request: request.clone(),
        });
        state.require(session_id)?;
        let message_id = state.allocate("msg");
        let text = if request.no_reply {
            String::new()
        } else {
            state
                .replies
                .pop_front()
                .unwrap_or_else(|| PASS_REPLY.to_string())
        };
        state.messages.insert(
            message_id.clone(),
            MessageInfo {
                id: message_id.clone(),
                role: "assistant".to_string(),
                text: text.clone(),
            },
        );
        Ok(PromptReply { message_id, text })
    }

    fn prompt_async(&self, session_id: &str, request: &PromptRequest) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(PlatformCall::PromptAsync {
            session: session_id.to_string(),
            request: request.clone(),
        });
        state.require(session_id)
    }

    fn revert(&self, session_id: &str, message_id: &str) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(PlatformCall::Revert {
            session: session_id.to_string(),
            message: message_id.to_string(),
        });
        state.require(session_id)
    }

    fn status(&self) -> PlatformResult<HashMap<String, SessionActivity>> {
        let mut state = lock(&self.state);
        if state.failing_status_polls > 0 {
            state.failing_status_polls -= 1;
            return Err(PlatformError::Transport("status unavailable".to_string()));
        }
        let all_busy = state.busy.contains("*");
        let sessions: Vec<String> = state.sessions.keys().cloned().collect();
        let mut map = HashMap::new();
        for session in sessions {
            if all_busy || state.busy.contains(&session) {
                map.insert(session, SessionActivity::Busy);
            } else if let Some(reading) = state
                .activity
                .get_mut(&session)
                .and_then(VecDeque::pop_front)
            {
                map.insert(session, reading);
            }
        }
        Ok(map)
    }

    fn get(&self, session_id: &str) -> PlatformResult<SessionInfo> {
        let state = lock(&self.state);
        if state.fail_lookups {
            return Err(PlatformError::Http {
                status: 500,
                body: "internal error".to_string(),
            });
        }
        match state.sessions.get(session_id) {
            Some(title) => Ok(SessionInfo {
                id: session_id.to_string(),
                title: title.clone(),
            }),
            None => Err(PlatformError::NotFound(format!("session {session_id}"))),
        }
    }

    fn message(&self, session_id: &str, message_id: &str) -> PlatformResult<MessageInfo> {
        let state = lock(&self.state);
        state.require(session_id)?;
        state
            .messages
            .get(message_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("message {message_id}")))
    }

    fn delete(&self, session_id: &str) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(PlatformCall::Delete {
            session: session_id.to_string(),
        });
        if state.fail_deletes {
            return Err(PlatformError::Http {
                status: 500,
                body: "delete failed".to_string(),
            });
        }
        match state.sessions.remove(session_id) {
            Some(_) => Ok(()),
            None => Err(PlatformError::NotFound(format!("session {session_id}"))),
        }
    }

    fn abort(&self, session_id: &str) -> PlatformResult<()> {
        let mut state = lock(&self.state);
        state.calls.push(PlatformCall::Abort {
            session: session_id.to_string(),
        });
        state.require(session_id)?;
        state.busy.remove(session_id);
        Ok(())
    }

    fn drain_events(&self, session_id: &str) -> PlatformResult<Vec<AgentEvent>> {
        Ok(lock(&self.state)
            .events
            .remove(session_id)
            .unwrap_or_default())
    }
}

enum ScriptedRun {
    Output(ShellOutput),
    Error(String),
}

/// Shell that replays queued results instead of spawning processes.
///
/// Runs with nothing queued succeed with empty output. Background jobs are
/// recorded separately from [`ScriptedShell::commands`].
#[derive(Default)]
pub struct ScriptedShell {
    queue: Mutex<VecDeque<ScriptedRun>>,
    commands: Mutex<Vec<String>>,
    background: Mutex<Vec<String>>,
    kills: Arc<AtomicUsize>,
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_exit(&self, code: i32, stdout: &str) {
        lock(&self.queue).push_back(ScriptedRun::Output(ShellOutput {
            exit_code: Some(code),
            stdout: stdout.to_string(),
            stderr: String::new(),
            timed_out: false,
            duration: Duration::from_millis(1),
        }));
    }

    pub fn push_timeout(&self) {
        lock(&self.queue).push_back(ScriptedRun::Output(ShellOutput {
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            timed_out: true,
            duration: Duration::from_millis(1),
        }));
    }

    /// The next run fails to spawn.
    pub fn push_error(&self, message: &str) {
        lock(&self.queue).push_back(ScriptedRun::Error(message.to_string()));
    }

    /// Commands passed to [`Shell::run`], in order.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).clone()
    }

    pub fn background_commands(&self) -> Vec<String> {
        lock(&self.background).clone()
    }

    pub fn killed_jobs(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl Shell for ScriptedShell {
    fn run(&self, request: &ShellRequest) -> Result<ShellOutput> {
        lock(&self.commands).push(request.command.clone());
        match lock(&self.queue).pop_front() {
            Some(ScriptedRun::Output(output)) => Ok(output),
            Some(ScriptedRun::Error(message)) => Err(anyhow!(message)),
            None => Ok(ShellOutput {
                exit_code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
                timed_out: false,
                duration: Duration::from_millis(1),
            }),
        }
    }

    fn spawn_background(
        &self,
        command: &str,
        _workdir: &Path,
        log_path: &Path,
    ) -> Result<Box<dyn BackgroundJob>> {
        lock(&self.background).push(command.to_string());
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(log_path, format!("started: {command}\n"))?;
        Ok(Box::new(FakeJob {
            kills: Arc::clone(&self.kills),
            killed: false,
        }))
    }
}

struct FakeJob {
    kills: Arc<AtomicUsize>,
    killed: bool,
}

impl BackgroundJob for FakeJob {
    fn kill(&mut self) -> Result<()> {
        if !self.killed {
            self.killed = true;
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// Notifier that records every toast.
#[derive(Default)]
pub struct RecordingNotifier {
    toasts: Mutex<Vec<(String, ToastVariant)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toasts(&self) -> Vec<(String, ToastVariant)> {
        lock(&self.toasts).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn toast(&self, message: &str, variant: ToastVariant) -> Result<()> {
        lock(&self.toasts).push((message.to_string(), variant));
        Ok(())
    }
}

/// Initialized `.loopsmith/` project in a temp directory.
pub struct TestProject {
    temp: TempDir,
    paths: ProjectPaths,
}

impl TestProject {
    /// Scaffold a project with a finished PRD.
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir()?;
        let paths = init_project(temp.path(), &InitOptions { force: false })?;
        fs::write(&paths.prd_path, "# Product Requirements\n\nA todo app.\n")?;
        Ok(Self { temp, paths })
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn paths(&self) -> &ProjectPaths {
        &self.paths
    }

    pub fn store(&self) -> StateStore {
        StateStore::new(&self.paths)
    }

    pub fn state(&self) -> Result<RunState> {
        self.store().read()
    }

    pub fn write_config(&self, config: &LoopConfig) -> Result<()> {
        write_config(&self.paths.config_path, config)
    }

    /// Store tasks under fresh sequential ids (`T-001`, ...).
    pub fn write_tasks(&self, tasks: Vec<Task>) -> Result<TaskList> {
        let mut list = TaskList::default();
        for task in tasks {
            list.push_new(task);
        }
        write_tasks(&self.paths.tasks_path, &list)?;
        Ok(list)
    }

    pub fn tasks(&self) -> Result<TaskList> {
        load_tasks(&self.paths.tasks_path)
    }

    pub fn backlog(&self) -> Result<Backlog> {
        load_backlog(&self.paths.backlog_path)
    }

    pub fn write_backlog(&self, backlog: &Backlog) -> Result<()> {
        write_backlog(&self.paths.backlog_path, backlog)
    }
}

/// Task with a title and defaults; the id is reassigned on write.
pub fn task(title: &str) -> Task {
    Task::new("T-000", title)
}
