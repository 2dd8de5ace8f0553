use loopsmith::core::task::TaskStatus;
use loopsmith::core::types::{RunStatus, Verdict};
use loopsmith::io::backlog::{Backlog, FeatureStatus};
use loopsmith::io::config::LoopConfig;
use loopsmith::io::gates::GateCommand;
use loopsmith::io::lock::RunLock;
use loopsmith::io::prompts::PromptEngine;
use loopsmith::io::shell::{Shell, SystemShell};
use loopsmith::io::ui_verify::UrlProbe;
use loopsmith::progress::ProgressRegistry;
use loopsmith::run::{
    BlockReason, ReasonCode, RunCommandResult, RunDeps, RunOptions, StopReason, run_command,
};
use loopsmith::test_support::{
    FAIL_REPLY, FakePlatform, RecordingNotifier, ScriptedShell, TestProject, task,
};

const CHANNEL: &str = "test";

struct ClosedPort;

impl UrlProbe for ClosedPort {
    fn is_up(&self, _url: &str) -> bool {
        false
    }
}

struct Harness {
    project: TestProject,
    config: LoopConfig,
    platform: FakePlatform,
    notifier: RecordingNotifier,
    progress: ProgressRegistry,
    prompts: PromptEngine,
}

impl Harness {
    fn new() -> Self {
        let project = TestProject::new().expect("project");
        let mut config = LoopConfig::default();
        config.gates = vec![GateCommand::configured("check", "true")];
        config.poll_interval_ms = 5;
        config.settle_polls = 1;
        config.progress.min_interval_ms = 0;
        project.write_config(&config).expect("config");
        Self {
            project,
            config,
            platform: FakePlatform::new(),
            notifier: RecordingNotifier::new(),
            progress: ProgressRegistry::new(),
            prompts: PromptEngine::new(20_000).expect("prompts"),
        }
    }

    fn with_config(mut self, edit: impl FnOnce(&mut LoopConfig)) -> Self {
        edit(&mut self.config);
        self.project.write_config(&self.config).expect("config");
        self
    }

    fn run(&self, shell: &dyn Shell, max_items: u32) -> RunCommandResult {
        self.progress
            .create(CHANNEL, Box::new(|_| Ok(())), self.config.progress.max_lines);
        let deps = RunDeps {
            paths: self.project.paths(),
            config: &self.config,
            platform: &self.platform,
            shell,
            notifier: &self.notifier,
            probe: &ClosedPort,
            progress: &self.progress,
            prompts: &self.prompts,
        };
        let options = RunOptions {
            max_items,
            control_session: None,
            progress_channel: CHANNEL.to_string(),
        };
        run_command(&deps, &options)
    }
}

fn finished(result: RunCommandResult) -> loopsmith::run::RunOutcome {
    match result {
        RunCommandResult::Finished(outcome) => outcome,
        other => panic!("expected a finished run, got {other:?}"),
    }
}

#[test]
fn empty_task_list_stops_without_attempts() {
    let harness = Harness::new();
    let outcome = finished(harness.run(&ScriptedShell::new(), 5));
    assert_eq!(outcome.attempted, 0);
    assert_eq!(outcome.stop, StopReason::NoMoreEligibleItems);
    let state = harness.project.state().expect("state");
    assert_eq!(state.status, RunStatus::Doing);
    assert!(harness.platform.created_sessions().is_empty());
}

#[test]
fn passing_task_completes_and_deletes_session() {
    let harness = Harness::new();
    harness
        .project
        .write_tasks(vec![task("add login form")])
        .expect("tasks");

    let outcome = finished(harness.run(&SystemShell, 5));
    assert_eq!(outcome.attempted, 1);
    assert_eq!(outcome.completed, 1);
    assert_eq!(outcome.stop, StopReason::NoMoreEligibleItems);

    let tasks = harness.project.tasks().expect("tasks");
    let done = &tasks.tasks[0];
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.evidence.iter().any(|path| path.ends_with("verdict.md")));

    let state = harness.project.state().expect("state");
    assert_eq!(state.status, RunStatus::Done);
    assert_eq!(state.last_gate, Verdict::Pass);
    assert_eq!(state.last_verifier, Verdict::Pass);
    assert!(state.work_session_id.is_none());

    let created = harness.platform.created_sessions();
    assert_eq!(created.len(), 1);
    assert!(!harness.platform.has_session(&created[0]));
    assert!(!harness.project.paths().lock_path.exists());
}

#[test]
fn failing_gate_blocks_task_with_command_in_reason() {
    let harness = Harness::new().with_config(|cfg| {
        cfg.gates = vec![GateCommand::configured("tests", "exit 2")];
    });
    harness
        .project
        .write_tasks(vec![task("add login form"), task("add logout")])
        .expect("tasks");

    let outcome = finished(harness.run(&SystemShell, 5));
    assert_eq!(outcome.attempted, 1);
    assert_eq!(outcome.completed, 0);
    match &outcome.stop {
        StopReason::StoppedOnFailure { task_id, reason } => {
            assert_eq!(task_id, "T-001");
            assert!(matches!(reason, BlockReason::GateFailed { .. }));
        }
        other => panic!("unexpected stop {other:?}"),
    }
    assert!(outcome.summary().contains("stopped early due to failure"));

    let tasks = harness.project.tasks().expect("tasks");
    let blocked = &tasks.tasks[0];
    assert_eq!(blocked.status, TaskStatus::Blocked);
    assert!(blocked.evidence.iter().any(|path| path.ends_with("gate.log")));
    let reason = blocked
        .last_attempt
        .as_ref()
        .and_then(|attempt| attempt.reason.clone())
        .expect("reason");
    assert!(reason.contains("exit 2"), "reason was {reason}");
    assert_eq!(tasks.tasks[1].status, TaskStatus::Open);

    let state = harness.project.state().expect("state");
    assert_eq!(state.status, RunStatus::Blocked);
    assert_eq!(state.last_gate, Verdict::Fail);
    assert!(state.work_session_id.is_some());
}

#[test]
fn build_timeout_blocks_and_aborts_session() {
    let harness = Harness::new().with_config(|cfg| cfg.build_timeout_secs = 1);
    harness
        .project
        .write_tasks(vec![task("slow task")])
        .expect("tasks");
    harness.platform.hold_all_busy();

    let outcome = finished(harness.run(&ScriptedShell::new(), 5));
    match &outcome.stop {
        StopReason::StoppedOnFailure { reason, .. } => {
            assert!(matches!(reason, BlockReason::BuildTimedOut { .. }));
            assert!(reason.to_string().contains("timed out"));
        }
        other => panic!("unexpected stop {other:?}"),
    }
    assert!(
        harness
            .platform
            .calls()
            .iter()
            .any(|call| matches!(call, loopsmith::test_support::PlatformCall::Abort { .. }))
    );
    assert_eq!(
        harness.project.tasks().expect("tasks").tasks[0].status,
        TaskStatus::Blocked
    );
}

#[test]
fn judge_rejection_blocks() {
    let harness = Harness::new();
    harness
        .project
        .write_tasks(vec![task("add login form")])
        .expect("tasks");
    harness.platform.push_reply(FAIL_REPLY);

    let outcome = finished(harness.run(&ScriptedShell::new(), 5));
    assert!(matches!(
        outcome.stop,
        StopReason::StoppedOnFailure {
            reason: BlockReason::JudgeRejected,
            ..
        }
    ));
    let state = harness.project.state().expect("state");
    assert_eq!(state.last_gate, Verdict::Pass);
    assert_eq!(state.last_verifier, Verdict::Fail);
}

#[test]
fn max_items_stops_after_limit() {
    let harness = Harness::new();
    harness
        .project
        .write_tasks(vec![task("one"), task("two"), task("three")])
        .expect("tasks");

    let outcome = finished(harness.run(&ScriptedShell::new(), 2));
    assert_eq!(outcome.attempted, 2);
    assert_eq!(outcome.completed, 2);
    assert_eq!(outcome.stop, StopReason::ReachedMaxItems);
    let tasks = harness.project.tasks().expect("tasks");
    assert_eq!(tasks.tasks[2].status, TaskStatus::Open);
    assert_eq!(harness.project.state().expect("state").iteration, 2);
}

#[test]
fn held_lock_refuses_run() {
    let harness = Harness::new();
    harness
        .project
        .write_tasks(vec![task("add login form")])
        .expect("tasks");
    let _held = RunLock::acquire(&harness.project.paths().lock_path).expect("lock");

    match harness.run(&ScriptedShell::new(), 5) {
        RunCommandResult::Refused(err) => assert_eq!(err.code, ReasonCode::RunLocked),
        other => panic!("expected refusal, got {other:?}"),
    }
    assert!(harness.platform.calls().is_empty());
}

#[test]
fn platform_failure_crashes_into_blocked_state() {
    let harness = Harness::new();
    harness
        .project
        .write_tasks(vec![task("add login form")])
        .expect("tasks");
    harness.platform.fail_creates();

    let result = harness.run(&ScriptedShell::new(), 5);
    assert!(matches!(result, RunCommandResult::Crashed { .. }));
    assert!(result.summary().contains("failed unexpectedly"));
    let state = harness.project.state().expect("state");
    assert_eq!(state.status, RunStatus::Blocked);
    assert!(!harness.project.paths().lock_path.exists());
}

#[test]
fn completing_feature_tasks_marks_feature_implemented() {
    let harness = Harness::new();
    let mut login = task("login form");
    login.labels.insert("feature:F-001".to_string());
    let tasks = harness.project.write_tasks(vec![login]).expect("tasks");
    let mut backlog = Backlog::default();
    let id = backlog.add_feature("Login", "Users can sign in");
    if let Some(feature) = backlog.get_mut(&id) {
        feature.status = FeatureStatus::Planned;
        feature.task_ids = vec![tasks.tasks[0].id.clone()];
    }
    harness.project.write_backlog(&backlog).expect("backlog");

    finished(harness.run(&ScriptedShell::new(), 5));
    let backlog = harness.project.backlog().expect("backlog");
    assert_eq!(
        backlog.get(&id).expect("feature").status,
        FeatureStatus::Implemented
    );
}

fn frontend_harness(required: bool) -> Harness {
    let harness = Harness::new().with_config(|cfg| {
        cfg.ui.enabled = true;
        cfg.ui.required = required;
        cfg.ui.dev_command = Some("npm run dev".to_string());
        cfg.ui.ready_attempts = 2;
        cfg.ui.ready_interval_ms = 1;
    });
    std::fs::write(
        harness.project.root().join("package.json"),
        r#"{"dependencies": {"react": "^19.0.0"}}"#,
    )
    .expect("package.json");
    harness
        .project
        .write_tasks(vec![task("add login form")])
        .expect("tasks");
    harness
}

#[test]
fn required_ui_with_missing_browser_blocks_like_a_gate() {
    let harness = frontend_harness(true);
    let shell = ScriptedShell::new();
    shell.push_exit(0, "");
    shell.push_exit(1, "");

    let outcome = finished(harness.run(&shell, 5));
    match &outcome.stop {
        StopReason::StoppedOnFailure { task_id, reason } => {
            assert_eq!(task_id, "T-001");
            assert!(matches!(reason, BlockReason::UiFailed { .. }));
            assert!(reason.to_string().contains("browser automation CLI not found"));
        }
        other => panic!("unexpected stop {other:?}"),
    }
    assert!(shell.commands()[1].starts_with("command -v"));

    let tasks = harness.project.tasks().expect("tasks");
    assert_eq!(tasks.tasks[0].status, TaskStatus::Blocked);
    let state = harness.project.state().expect("state");
    assert_eq!(state.status, RunStatus::Blocked);
    assert_eq!(state.last_gate, Verdict::Pass);
    assert_eq!(state.last_ui, Verdict::Fail);
    assert_eq!(state.last_verifier, Verdict::None);
}

#[test]
fn required_ui_with_unreachable_server_blocks() {
    let harness = frontend_harness(true);
    let shell = ScriptedShell::new();

    let outcome = finished(harness.run(&shell, 5));
    assert!(matches!(
        outcome.stop,
        StopReason::StoppedOnFailure {
            reason: BlockReason::UiFailed { .. },
            ..
        }
    ));
    assert_eq!(shell.background_commands(), vec!["npm run dev"]);
    assert_eq!(shell.killed_jobs(), 1);
    let state = harness.project.state().expect("state");
    assert_eq!(state.last_ui, Verdict::Fail);
    let tasks = harness.project.tasks().expect("tasks");
    assert!(tasks.tasks[0].evidence.iter().any(|path| path.ends_with("ui.log")));
}

#[test]
fn optional_ui_with_missing_browser_still_advances() {
    let harness = frontend_harness(false);
    let shell = ScriptedShell::new();
    shell.push_exit(0, "");
    shell.push_exit(1, "");

    let outcome = finished(harness.run(&shell, 5));
    assert_eq!(outcome.completed, 1);
    assert_eq!(outcome.stop, StopReason::NoMoreEligibleItems);
    let state = harness.project.state().expect("state");
    assert_eq!(state.status, RunStatus::Done);
    assert_eq!(state.last_ui, Verdict::None);
    assert_eq!(state.last_verifier, Verdict::Pass);
}
