//! Orchestration for `loopsmith run`.
//!
//! One attempt walks SELECT → BUILD → GATE → [UI_VERIFY] → JUDGE and ends in
//! ADVANCE or BLOCK. Run state is persisted at every transition and each
//! attempt leaves a `meta.json` in its run directory, whatever the exit path.
//! A blocked attempt stops the whole run.

use std::fmt;
use std::fs;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, instrument, warn};

use crate::core::judge::parse_verdict;
use crate::core::selector::{next_eligible, unmet_dependencies};
use crate::core::task::{LastAttempt, Task, TaskList, TaskStatus};
use crate::core::types::{Phase, RunStatus, Verdict};
use crate::io::artifacts::{AttemptMeta, AttemptOutcome, RunDir};
use crate::io::backlog::{load_backlog, refresh_feature_statuses, write_backlog};
use crate::io::config::LoopConfig;
use crate::io::dispatch::{Completion, WaitOptions, await_completion, submit};
use crate::io::gates::{
    GateCommand, GateOptions, GateSource, GateStatus, attempt_gates, persist_auto_gates,
    resolve_gates, run_gates, write_gate_artifacts,
};
use crate::io::lock::{LockError, RunLock};
use crate::io::notify::{Notifier, ToastVariant, notify_best_effort};
use crate::io::paths::{ProjectPaths, prd_is_complete};
use crate::io::platform::{AgentPlatform, PromptRequest};
use crate::io::prompts::{BuildInputs, PromptEngine, VerifyInputs};
use crate::io::session::{DeleteOutcome, SessionGuard, SessionManager, delete_best_effort};
use crate::io::shell::Shell;
use crate::io::state_store::{RunState, RunStatePatch, StateStore, now_timestamp};
use crate::io::task_store::{load_tasks, write_tasks};
use crate::io::ui_verify::{
    UiDecision, UiPrereq, UiReport, UiVerifier, UrlProbe, decide_ui, detect_prerequisites,
};
use crate::progress::{ActivityChannel, FlushOptions, ProgressLine, ProgressRegistry, Stage};

/// Message recorded when the loop fails on an unexpected error.
pub const CRASH_MESSAGE: &str = "failed unexpectedly, check logs";

/// Collaborators the run loop drives.
pub struct RunDeps<'a> {
    pub paths: &'a ProjectPaths,
    pub config: &'a LoopConfig,
    pub platform: &'a dyn AgentPlatform,
    pub shell: &'a dyn Shell,
    pub notifier: &'a dyn Notifier,
    pub probe: &'a dyn UrlProbe,
    pub progress: &'a ProgressRegistry,
    pub prompts: &'a PromptEngine,
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub max_items: u32,
    /// Session that invoked the run. Never deleted, receives notifications.
    pub control_session: Option<String>,
    /// Progress channel to report into (created by the caller).
    pub progress_channel: String,
}

/// Machine-readable configuration error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReasonCode {
    PrdIncomplete,
    NoPlan,
    NoGates,
    InWorkSession,
    RunLocked,
}

impl ReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::PrdIncomplete => "prd_incomplete",
            ReasonCode::NoPlan => "no_plan",
            ReasonCode::NoGates => "no_gates",
            ReasonCode::InWorkSession => "in_work_session",
            ReasonCode::RunLocked => "run_locked",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The run was refused before any session work started.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} [{code}]")]
pub struct PreflightError {
    pub code: ReasonCode,
    pub message: String,
}

impl PreflightError {
    fn new(code: ReasonCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Why an attempt blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    BuildTimedOut { after: Duration },
    GateFailed { command: Option<String>, summary: String },
    NoGates,
    UiFailed { summary: String },
    JudgeRejected,
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::BuildTimedOut { after } => write!(
                f,
                "build timed out after {}s waiting for the work session to become idle",
                after.as_secs()
            ),
            BlockReason::GateFailed { summary, .. } => f.write_str(summary),
            BlockReason::NoGates => f.write_str("no gates configured for this attempt"),
            BlockReason::UiFailed { summary } => write!(f, "UI verification failed: {summary}"),
            BlockReason::JudgeRejected => {
                f.write_str("judge did not pass the task (needs Status: PASS and EXIT_SIGNAL: true)")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    ReachedMaxItems,
    NoMoreEligibleItems,
    StoppedOnFailure { task_id: String, reason: BlockReason },
}

impl StopReason {
    pub fn label(&self) -> &'static str {
        match self {
            StopReason::ReachedMaxItems => "reached max items",
            StopReason::NoMoreEligibleItems => "no more eligible items",
            StopReason::StoppedOnFailure { .. } => "stopped early due to failure",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub attempted: u32,
    pub completed: u32,
    pub stop: StopReason,
}

impl RunOutcome {
    pub fn summary(&self) -> String {
        let base = format!(
            "attempted {}, completed {}: {}",
            self.attempted,
            self.completed,
            self.stop.label()
        );
        match &self.stop {
            StopReason::StoppedOnFailure { task_id, reason } => {
                format!("{base} ({task_id}: {reason})")
            }
            _ => base,
        }
    }
}

/// Result of the whole `run` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunCommandResult {
    Finished(RunOutcome),
    Refused(PreflightError),
    /// An unexpected error stopped the loop; the run is BLOCKED.
    Crashed { message: String },
}

impl RunCommandResult {
    pub fn summary(&self) -> String {
        match self {
            RunCommandResult::Finished(outcome) => outcome.summary(),
            RunCommandResult::Refused(err) => format!("run refused: {err}"),
            RunCommandResult::Crashed { message } => format!("run {message}"),
        }
    }
}

/// What preflight resolved for the run.
#[derive(Debug, Clone)]
pub struct Preflight {
    pub gates: Vec<GateCommand>,
}

/// Configuration checks done before any session work.
pub fn preflight(
    paths: &ProjectPaths,
    config: &LoopConfig,
    state: &RunState,
    caller: Option<&str>,
) -> Result<Preflight, PreflightError> {
    if let Some(caller) = caller
        && state.work_session_id.as_deref() == Some(caller)
    {
        return Err(PreflightError::new(
            ReasonCode::InWorkSession,
            "run was invoked from inside the work session; use another session",
        ));
    }
    match prd_is_complete(paths) {
        Ok(true) => {}
        Ok(false) => {
            return Err(PreflightError::new(
                ReasonCode::PrdIncomplete,
                format!(
                    "{} is still a draft; finish the requirements first",
                    paths.relative(&paths.prd_path)
                ),
            ));
        }
        Err(err) => {
            return Err(PreflightError::new(
                ReasonCode::PrdIncomplete,
                format!("cannot read PRD: {err:#}"),
            ));
        }
    }
    if !paths.tasks_path.exists() {
        return Err(PreflightError::new(
            ReasonCode::NoPlan,
            "no task list yet; run `loopsmith plan` or `loopsmith task add`",
        ));
    }
    let tasks = load_tasks(&paths.tasks_path).map_err(|err| {
        PreflightError::new(ReasonCode::NoPlan, format!("task list is invalid: {err:#}"))
    })?;

    let gates = resolve_gates(&paths.root, config);
    let task_gates = tasks
        .tasks
        .iter()
        .any(|task| !task.status.is_terminal() && !task.done_when.is_empty());
    if gates.is_empty() && !task_gates {
        return Err(PreflightError::new(
            ReasonCode::NoGates,
            "no gates configured or detected; add [[gates]] to the config",
        ));
    }
    Ok(Preflight { gates })
}

/// Execute `loopsmith run`: lock, preflight, loop and cleanup.
///
/// Never returns an error. Unexpected failures become
/// [`RunCommandResult::Crashed`] with the run state forced to BLOCKED.
#[instrument(skip_all, fields(max_items = options.max_items))]
pub fn run_command(deps: &RunDeps<'_>, options: &RunOptions) -> RunCommandResult {
    let store = StateStore::new(deps.paths);

    let lock = match RunLock::acquire(&deps.paths.lock_path) {
        Ok(lock) => lock,
        Err(err @ LockError::Held { .. }) => {
            return RunCommandResult::Refused(PreflightError::new(
                ReasonCode::RunLocked,
                err.to_string(),
            ));
        }
        Err(err) => return crashed(&store, deps, anyhow!(err)),
    };

    let result = match store.read() {
        Ok(state) => match preflight(
            deps.paths,
            deps.config,
            &state,
            options.control_session.as_deref(),
        ) {
            Ok(pre) => execute(deps, options, &store, pre),
            Err(err) => {
                info!(code = %err.code, "run refused");
                RunCommandResult::Refused(err)
            }
        },
        Err(err) => crashed(&store, deps, err),
    };

    cleanup(deps, options, &store);
    drop(lock);
    result
}

fn execute(
    deps: &RunDeps<'_>,
    options: &RunOptions,
    store: &StateStore,
    pre: Preflight,
) -> RunCommandResult {
    let guarded = catch_unwind(AssertUnwindSafe(|| -> Result<RunOutcome> {
        let gates = if pre.gates.iter().any(|g| g.source == GateSource::Auto) {
            persist_auto_gates(&deps.paths.root, &deps.paths.config_path, &pre.gates)?
        } else {
            pre.gates
        };
        store.update(RunStatePatch {
            control_session_id: Some(options.control_session.clone()),
            ..RunStatePatch::default()
        })?;
        run_loop(deps, options, &gates)
    }));
    match guarded {
        Ok(Ok(outcome)) => {
            info!(summary = %outcome.summary(), "run finished");
            RunCommandResult::Finished(outcome)
        }
        Ok(Err(err)) => crashed(store, deps, err),
        Err(panic) => {
            let detail = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic".to_string());
            crashed(store, deps, anyhow!("panic: {detail}"))
        }
    }
}

/// Record an unexpected failure: log it, block the run and its current task.
fn crashed(store: &StateStore, deps: &RunDeps<'_>, err: anyhow::Error) -> RunCommandResult {
    error!(err = ?err, "run failed unexpectedly");
    let reason = format!("{CRASH_MESSAGE}: {err:#}");
    match store.update(RunStatePatch {
        status: Some(RunStatus::Blocked),
        last_reason: Some(Some(CRASH_MESSAGE.to_string())),
        ..RunStatePatch::default()
    }) {
        Ok(state) => {
            if let Some(task_id) = state.current_task_id.as_deref()
                && let Err(update_err) = update_task(deps.paths, task_id, |task| {
                    if task.status == TaskStatus::InProgress {
                        task.status = TaskStatus::Blocked;
                        if let Some(attempt) = task.last_attempt.as_mut() {
                            attempt.reason = Some(reason.clone());
                            attempt.ended_at = Some(now_timestamp());
                        }
                    }
                })
            {
                warn!(err = %update_err, "failed to block the in-progress task");
            }
        }
        Err(store_err) => warn!(err = %store_err, "failed to record crash in run state"),
    }
    notify_best_effort(
        deps.notifier,
        &format!("loopsmith run {CRASH_MESSAGE}"),
        ToastVariant::Error,
    );
    RunCommandResult::Crashed {
        message: CRASH_MESSAGE.to_string(),
    }
}

/// Best-effort teardown run after every `run` invocation.
fn cleanup(deps: &RunDeps<'_>, options: &RunOptions, store: &StateStore) {
    let state = match store.read() {
        Ok(state) => state,
        Err(err) => {
            warn!(err = %err, "cleanup could not read run state");
            RunState::default()
        }
    };
    if state.status == RunStatus::Done && deps.config.delete_session_on_done {
        let outcome = delete_best_effort(
            deps.platform,
            state.work_session_id.as_deref(),
            options.control_session.as_deref(),
        );
        if matches!(outcome, DeleteOutcome::Deleted | DeleteOutcome::NotFound) {
            let manager = SessionManager::new(deps.platform, store, deps.paths, deps.prompts);
            if let Err(err) = manager.forget_session() {
                warn!(err = %err, "failed to clear work session ids");
            }
        }
    }
    let force = FlushOptions {
        force: true,
        ..FlushOptions::default()
    };
    deps.progress.flush(&options.progress_channel, force);
    deps.progress.dispose(&options.progress_channel);
}

/// Attempt tasks in stored order until one blocks, none remain, or
/// `options.max_items` attempts were made.
pub fn run_loop(
    deps: &RunDeps<'_>,
    options: &RunOptions,
    gates: &[GateCommand],
) -> Result<RunOutcome> {
    let store = StateStore::new(deps.paths);
    let mut attempted = 0u32;
    let mut completed = 0u32;

    loop {
        let tasks = load_tasks(&deps.paths.tasks_path)?;
        let Some(task) = next_eligible(&tasks.tasks).cloned() else {
            if !tasks.tasks.is_empty() {
                store.update(RunStatePatch {
                    status: Some(RunStatus::Done),
                    last_reason: Some(None),
                    ..RunStatePatch::default()
                })?;
                notify_best_effort(deps.notifier, "loopsmith: all tasks done", ToastVariant::Success);
            }
            return Ok(RunOutcome {
                attempted,
                completed,
                stop: StopReason::NoMoreEligibleItems,
            });
        };
        if attempted >= options.max_items {
            return Ok(RunOutcome {
                attempted,
                completed,
                stop: StopReason::ReachedMaxItems,
            });
        }

        let unmet = unmet_dependencies(&task, &tasks.tasks);
        if !unmet.is_empty() {
            warn!(task = %task.id, unmet = ?unmet, "selected task has unfinished dependencies");
        }

        attempted += 1;
        match run_attempt(deps, options, gates, &task)? {
            AttemptResult::Advanced => completed += 1,
            AttemptResult::Blocked(reason) => {
                return Ok(RunOutcome {
                    attempted,
                    completed,
                    stop: StopReason::StoppedOnFailure {
                        task_id: task.id,
                        reason,
                    },
                });
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum AttemptResult {
    Advanced,
    Blocked(BlockReason),
}

/// Mutable bookkeeping of one attempt, written to `meta.json`.
struct Attempt<'a> {
    task: &'a Task,
    iteration: u64,
    run_dir: RunDir,
    session_id: Option<String>,
    gate: Verdict,
    ui: Verdict,
    verifier: Verdict,
    evidence: Vec<String>,
}

#[instrument(skip_all, fields(task = %task.id))]
fn run_attempt(
    deps: &RunDeps<'_>,
    options: &RunOptions,
    gates: &[GateCommand],
    task: &Task,
) -> Result<AttemptResult> {
    let store = StateStore::new(deps.paths);
    let started = Instant::now();
    let started_at = now_timestamp();

    let iteration = store.bump_iteration()?;
    let run_dir = RunDir::create(deps.paths, iteration, Utc::now())?;
    store.update(RunStatePatch {
        status: Some(RunStatus::Doing),
        phase: Some(Phase::Run),
        current_task_id: Some(Some(task.id.clone())),
        run_dir: Some(Some(deps.paths.relative(&run_dir.dir))),
        last_gate: Some(Verdict::None),
        last_ui: Some(Verdict::None),
        last_verifier: Some(Verdict::None),
        last_reason: Some(None),
        ..RunStatePatch::default()
    })?;
    info!(iteration, run_dir = %run_dir.dir.display(), "attempt started");

    let mut attempt = Attempt {
        task,
        iteration,
        run_dir,
        session_id: None,
        gate: Verdict::None,
        ui: Verdict::None,
        verifier: Verdict::None,
        evidence: Vec::new(),
    };
    let result = drive_attempt(deps, options, gates, &store, &mut attempt, &started_at);

    let (outcome, reason) = match &result {
        Ok(AttemptResult::Advanced) => (AttemptOutcome::Completed, None),
        Ok(AttemptResult::Blocked(reason)) => (AttemptOutcome::Blocked, Some(reason.to_string())),
        Err(err) => (AttemptOutcome::Aborted, Some(format!("{err:#}"))),
    };
    let meta = AttemptMeta {
        task_id: task.id.clone(),
        iteration,
        session_id: attempt.session_id.clone(),
        outcome,
        reason,
        gate: attempt.gate,
        ui: attempt.ui,
        verifier: attempt.verifier,
        started_at,
        ended_at: now_timestamp(),
        duration_ms: started.elapsed().as_millis() as u64,
    };
    if let Err(err) = attempt.run_dir.write_meta(&meta) {
        warn!(err = %err, "failed to write attempt meta");
    }
    result
}

fn drive_attempt(
    deps: &RunDeps<'_>,
    options: &RunOptions,
    gates: &[GateCommand],
    store: &StateStore,
    attempt: &mut Attempt<'_>,
    started_at: &str,
) -> Result<AttemptResult> {
    let task = attempt.task;
    let config = deps.config;
    let channel = options.progress_channel.as_str();
    let report = |stage: Stage, text: String| {
        deps.progress
            .push(channel, ProgressLine::new(stage, text, Some(&task.id)));
        let options = FlushOptions {
            force: false,
            min_interval: Duration::from_millis(config.progress.min_interval_ms),
        };
        deps.progress.flush(channel, options);
    };

    // BUILD
    let sessions = SessionManager::new(deps.platform, store, deps.paths, deps.prompts);
    let session = sessions.reset_session(config.agent.as_deref())?;
    attempt.session_id = Some(session.session_id.clone());

    let previous_failure = task
        .last_attempt
        .as_ref()
        .and_then(|last| last.reason.clone());
    let iteration = attempt.iteration;
    let attempt_started = started_at.to_string();
    update_task(deps.paths, &task.id, |t| {
        t.status = TaskStatus::InProgress;
        t.last_attempt = Some(LastAttempt {
            iteration,
            verdict: Verdict::None,
            started_at: Some(attempt_started),
            ended_at: None,
            reason: None,
        });
    })?;

    let gates = attempt_gates(gates, task);
    let gate_commands: Vec<String> = gates.iter().map(|g| g.command.clone()).collect();
    let prd = fs::read_to_string(&deps.paths.prd_path).ok();
    let build_prompt = deps.prompts.render_build(&BuildInputs {
        task,
        iteration,
        gates: &gate_commands,
        previous_failure: previous_failure.as_deref(),
        prd: prd.as_deref(),
    })?;
    let run_dir = attempt.run_dir.clone();
    run_dir.write_text(&run_dir.build_prompt_path, &build_prompt)?;
    attempt.evidence.push(deps.paths.relative(&run_dir.build_prompt_path));

    report(Stage::Build, format!("building (iteration {iteration})"));
    let handle = submit(
        deps.platform,
        &session.session_id,
        &PromptRequest::text(build_prompt).with_agent(config.agent.as_deref()),
    )?;
    let mut activity = ActivityChannel::new(
        deps.notifier,
        Stage::Build,
        config.progress.max_chars,
        Duration::from_millis(config.progress.min_interval_ms),
    );
    let wait = WaitOptions {
        timeout: config.build_timeout(),
        poll_interval: config.poll_interval(),
        settle_polls: config.settle_polls,
    };
    let completion = await_completion(deps.platform, &handle, &wait, &mut |events| {
        activity.record(events);
        activity.flush(false);
    });
    activity.flush(true);
    if completion == Completion::TimedOut {
        if let Err(err) = deps.platform.abort(&session.session_id) {
            warn!(err = %err, "failed to abort timed-out build");
        }
        return block(
            deps,
            store,
            attempt,
            BlockReason::BuildTimedOut {
                after: config.build_timeout(),
            },
        );
    }

    // GATE
    report(Stage::Gate, format!("running {} gate(s)", gates.len()));
    let gate_report = run_gates(
        deps.shell,
        &gates,
        &GateOptions {
            workdir: &deps.paths.root,
            timeout: config.gate_timeout(),
            output_limit_bytes: config.output_limit_bytes,
        },
    );
    write_gate_artifacts(&run_dir.gate_log_path, &run_dir.gates_json_path, &gate_report)?;
    attempt.evidence.push(deps.paths.relative(&run_dir.gate_log_path));
    attempt.evidence.push(deps.paths.relative(&run_dir.gates_json_path));
    attempt.gate = if gate_report.ok() {
        Verdict::Pass
    } else {
        Verdict::Fail
    };
    store.update(RunStatePatch {
        last_gate: Some(attempt.gate),
        ..RunStatePatch::default()
    })?;
    report(Stage::Gate, gate_report.summary.clone());
    if !gate_report.ok() {
        let reason = match gate_report.status {
            GateStatus::NoGates => BlockReason::NoGates,
            _ => BlockReason::GateFailed {
                command: gate_report.failed_command.clone(),
                summary: gate_report.summary.clone(),
            },
        };
        return block(deps, store, attempt, reason);
    }

    // UI_VERIFY
    let prereq = detect_prerequisites(&deps.paths.root, &config.ui, deps.shell);
    let ui_report = if prereq == UiPrereq::Ready {
        report(Stage::Ui, "verifying UI in the browser".to_string());
        let verifier = UiVerifier {
            shell: deps.shell,
            probe: deps.probe,
            config: &config.ui,
            root: &deps.paths.root,
            step_timeout: config.gate_timeout(),
            output_limit_bytes: config.output_limit_bytes,
        };
        Some(verifier.run(&run_dir.ui)?)
    } else {
        None
    };
    let decision = decide_ui(prereq, ui_report.as_ref(), config.ui.required);
    attempt.ui = ui_verdict(ui_report.as_ref(), &decision);
    store.update(RunStatePatch {
        last_ui: Some(attempt.ui),
        ..RunStatePatch::default()
    })?;
    let ui_artifacts: Vec<String> = ui_report
        .as_ref()
        .map(|r| r.artifacts.iter().map(|p| deps.paths.relative(p)).collect())
        .unwrap_or_default();
    attempt.evidence.extend(ui_artifacts.iter().cloned());
    let ui_summary = match &decision {
        UiDecision::Skipped { reason } => format!("skipped: {reason}"),
        UiDecision::Passed => "passed".to_string(),
        UiDecision::Informational { reason } => format!("failed (informational): {reason}"),
        UiDecision::Blocking { reason } => format!("failed: {reason}"),
    };
    if let UiDecision::Blocking { reason } = decision {
        return block(deps, store, attempt, BlockReason::UiFailed { summary: reason });
    }

    // JUDGE
    report(Stage::Judge, "asking the judge".to_string());
    let verify_prompt = deps.prompts.render_verify(&VerifyInputs {
        task,
        gate_summary: &gate_report.summary,
        gate_log: &deps.paths.relative(&run_dir.gate_log_path),
        gate_json: &deps.paths.relative(&run_dir.gates_json_path),
        ui_summary: ui_report.as_ref().map(|_| ui_summary.as_str()),
        ui_artifacts: &ui_artifacts,
        build_prompt: &deps.paths.relative(&run_dir.build_prompt_path),
    })?;
    run_dir.write_text(&run_dir.verify_prompt_path, &verify_prompt)?;
    let reply = deps
        .platform
        .prompt(
            &session.session_id,
            &PromptRequest::text(verify_prompt).with_agent(config.verify_agent()),
        )
        .context("send verify prompt")?;
    run_dir.write_text(&run_dir.verdict_path, &reply.text)?;
    attempt.evidence.push(deps.paths.relative(&run_dir.verdict_path));

    let verdict = parse_verdict(&reply.text);
    attempt.verifier = verdict.status;
    store.update(RunStatePatch {
        last_verifier: Some(verdict.status),
        ..RunStatePatch::default()
    })?;
    if !verdict.is_pass() {
        return block(deps, store, attempt, BlockReason::JudgeRejected);
    }

    // ADVANCE
    advance(deps, attempt)?;
    report(Stage::Judge, "completed".to_string());
    Ok(AttemptResult::Advanced)
}

fn ui_verdict(report: Option<&UiReport>, decision: &UiDecision) -> Verdict {
    match (report, decision) {
        (Some(report), _) if report.passed => Verdict::Pass,
        (Some(_), _) | (None, UiDecision::Blocking { .. }) => Verdict::Fail,
        (None, _) => Verdict::None,
    }
}

fn advance(deps: &RunDeps<'_>, attempt: &Attempt<'_>) -> Result<()> {
    let evidence = attempt.evidence.clone();
    let tasks = update_task(deps.paths, &attempt.task.id, |t| {
        t.status = TaskStatus::Completed;
        t.add_evidence(evidence);
        if let Some(last) = t.last_attempt.as_mut() {
            last.verdict = Verdict::Pass;
            last.ended_at = Some(now_timestamp());
        }
    })?;

    let mut backlog = load_backlog(&deps.paths.backlog_path)?;
    let changed = refresh_feature_statuses(&mut backlog, &tasks);
    if !changed.is_empty() {
        write_backlog(&deps.paths.backlog_path, &backlog)?;
    }

    info!(task = %attempt.task.id, "task completed");
    notify_best_effort(
        deps.notifier,
        &format!("{} completed: {}", attempt.task.id, attempt.task.title),
        ToastVariant::Success,
    );
    Ok(())
}

fn block(
    deps: &RunDeps<'_>,
    store: &StateStore,
    attempt: &Attempt<'_>,
    reason: BlockReason,
) -> Result<AttemptResult> {
    let message = reason.to_string();
    let evidence = attempt.evidence.clone();
    let verdict = attempt.verifier;
    update_task(deps.paths, &attempt.task.id, |t| {
        t.status = TaskStatus::Blocked;
        t.add_evidence(evidence);
        if let Some(last) = t.last_attempt.as_mut() {
            last.verdict = verdict;
            last.ended_at = Some(now_timestamp());
            last.reason = Some(message.clone());
        }
    })?;
    store.update(RunStatePatch {
        status: Some(RunStatus::Blocked),
        last_reason: Some(Some(message.clone())),
        ..RunStatePatch::default()
    })?;
    warn!(task = %attempt.task.id, reason = %message, "task blocked");
    notify_best_effort(
        deps.notifier,
        &format!("{} blocked: {message}", attempt.task.id),
        ToastVariant::Error,
    );
    Ok(AttemptResult::Blocked(reason))
}

/// Load the task list, apply `edit` to task `id` and write it back.
fn update_task(
    paths: &ProjectPaths,
    id: &str,
    edit: impl FnOnce(&mut Task),
) -> Result<TaskList> {
    let mut tasks = load_tasks(&paths.tasks_path)?;
    let task = tasks
        .get_mut(id)
        .ok_or_else(|| anyhow!("task {id} disappeared from {}", paths.tasks_path.display()))?;
    edit(task);
    write_tasks(&paths.tasks_path, &tasks)?;
    Ok(tasks)
}

/// Refuse control commands issued from inside the work session.
pub fn guard_control_session(
    paths: &ProjectPaths,
    platform: &dyn AgentPlatform,
    prompts: &PromptEngine,
    caller: Option<&str>,
) -> Result<Option<PreflightError>> {
    let store = StateStore::new(paths);
    let manager = SessionManager::new(platform, &store, paths, prompts);
    Ok(match manager.ensure_not_in_session(caller)? {
        SessionGuard::Ok => None,
        SessionGuard::Blocked { reason } => {
            Some(PreflightError::new(ReasonCode::InWorkSession, reason))
        }
    })
}
