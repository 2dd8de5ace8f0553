//! Run orchestration core for a PRD → plan → build → verify agent loop.
//!
//! The crate drives an external LLM coding agent through one task at a time:
//! a build turn in a long-lived work session, deterministic quality gates,
//! optional browser-based UI verification and an LLM-judged verdict. Every
//! transition is persisted under `.loopsmith/` so an interrupted run can be
//! resumed by invoking `loopsmith run` again.
//!
//! - **[`core`]**: Pure, deterministic logic (task model, selection, verdict
//!   and envelope parsing). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (filesystem, shell, agent platform,
//!   browser automation). Each collaborator sits behind a trait so tests can
//!   script it.
//! - **[`progress`]**: Best-effort, rate-limited relay of in-flight output.
//!
//! Orchestration modules ([`run`], [`plan`], [`status`], [`select`]) coordinate
//! core logic with I/O to implement CLI commands.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod plan;
pub mod progress;
pub mod run;
pub mod select;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
