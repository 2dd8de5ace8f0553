//! Asynchronous build dispatch and completion polling.
//!
//! A build turn is two explicit operations: [`submit`] sends the prompt
//! without waiting, and [`await_completion`] polls the platform's status map
//! until the session is idle or the deadline passes.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::budget::remaining_budget;
use crate::io::platform::{AgentEvent, AgentPlatform, PromptRequest, SessionActivity};

/// A submitted turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkHandle {
    pub session_id: String,
    pub submitted_at: Instant,
}

#[derive(Debug, Clone, Copy)]
pub struct WaitOptions {
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Consecutive idle readings accepted as completion when the session was
    /// never seen busy (the turn may finish between two polls).
    pub settle_polls: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Idle,
    TimedOut,
}

/// Fire-and-forget dispatch of a prompt.
#[instrument(skip(platform, request))]
pub fn submit(
    platform: &dyn AgentPlatform,
    session_id: &str,
    request: &PromptRequest,
) -> Result<WorkHandle> {
    platform
        .prompt_async(session_id, request)
        .with_context(|| format!("dispatch prompt to {session_id}"))?;
    info!(session_id, "build dispatched");
    Ok(WorkHandle {
        session_id: session_id.to_string(),
        submitted_at: Instant::now(),
    })
}

/// Poll until the session reports idle or `options.timeout` elapses.
///
/// Status lookup failures are logged and polling continues. Events drained
/// from the platform are handed to `on_events` after every poll.
#[instrument(skip_all, fields(session_id = %handle.session_id, timeout_secs = options.timeout.as_secs()))]
pub fn await_completion(
    platform: &dyn AgentPlatform,
    handle: &WorkHandle,
    options: &WaitOptions,
    on_events: &mut dyn FnMut(Vec<AgentEvent>),
) -> Completion {
    let deadline = handle.submitted_at + options.timeout;
    let mut seen_busy = false;
    let mut idle_streak = 0u32;

    loop {
        match platform.drain_events(&handle.session_id) {
            Ok(events) if !events.is_empty() => on_events(events),
            Ok(_) => {}
            Err(err) => debug!(err = %err, "event drain failed"),
        }

        match platform.status() {
            Ok(map) => {
                let activity = map
                    .get(&handle.session_id)
                    .copied()
                    .unwrap_or(SessionActivity::Idle);
                match activity {
                    SessionActivity::Busy | SessionActivity::Retry => {
                        seen_busy = true;
                        idle_streak = 0;
                    }
                    SessionActivity::Idle => {
                        idle_streak += 1;
                        if seen_busy || idle_streak >= options.settle_polls.max(1) {
                            info!(
                                elapsed_ms = handle.submitted_at.elapsed().as_millis() as u64,
                                "session idle"
                            );
                            return Completion::Idle;
                        }
                    }
                }
            }
            Err(err) => warn!(err = %err, "status poll failed, retrying"),
        }

        let Some(remaining) = remaining_budget(deadline) else {
            warn!("session did not become idle before the deadline");
            return Completion::TimedOut;
        };
        thread::sleep(options.poll_interval.min(remaining));
    }
}
