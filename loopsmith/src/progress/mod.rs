//! Best-effort relay of in-flight run output to an observer.
//!
//! A [`ProgressRegistry`] owns one channel per control session. Channels keep
//! a short ring of recent lines and a revision counter; [`ProgressRegistry::flush`]
//! hands the ring to the channel's consumer at most once per interval. Nothing
//! here can fail the run: delivery errors are logged and dropped.

pub mod activity;

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use tracing::{debug, warn};

pub use activity::ActivityChannel;

pub const DEFAULT_MAX_LINES: usize = 5;
pub const MIN_LINES: usize = 3;
pub const MAX_LINES: usize = 8;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(900);
const MAX_LINE_CHARS: usize = 160;

/// Stage of an attempt a progress line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Select,
    Build,
    Gate,
    Ui,
    Judge,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Select => "select",
            Stage::Build => "build",
            Stage::Gate => "gate",
            Stage::Ui => "ui",
            Stage::Judge => "judge",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressLine {
    pub stage: Stage,
    pub text: String,
    pub task_id: Option<String>,
}

impl ProgressLine {
    pub fn new(stage: Stage, text: impl Into<String>, task_id: Option<&str>) -> Self {
        Self {
            stage,
            text: text.into(),
            task_id: task_id.map(str::to_string),
        }
    }
}

/// What a consumer receives on delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub channel: String,
    pub revision: u64,
    pub lines: Vec<ProgressLine>,
}

impl ProgressSnapshot {
    pub fn render(&self) -> String {
        self.lines
            .iter()
            .map(|line| match &line.task_id {
                Some(task) => format!("[{}] {task}: {}", line.stage, line.text),
                None => format!("[{}] {}", line.stage, line.text),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

pub type Consumer = Box<dyn Fn(&ProgressSnapshot) -> Result<()> + Send>;

#[derive(Debug, Clone, Copy)]
pub struct FlushOptions {
    pub force: bool,
    pub min_interval: Duration,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            force: false,
            min_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushResult {
    Delivered,
    /// Nothing changed since the last delivery.
    Unchanged,
    /// Delivered too recently.
    Throttled,
    /// The consumer returned an error; the next flush retries.
    Failed,
    UnknownChannel,
}

struct Channel {
    lines: VecDeque<ProgressLine>,
    /// Most recent text per stage, kept after the line leaves the ring.
    last_by_stage: HashMap<Stage, String>,
    max_lines: usize,
    revision: u64,
    delivered_revision: u64,
    last_delivery: Option<Instant>,
    consumer: Consumer,
}

/// Registry of progress channels keyed by control session id.
#[derive(Default)]
pub struct ProgressRegistry {
    channels: Mutex<HashMap<String, Channel>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a channel. `max_lines` is clamped to 3..=8.
    pub fn create(&self, channel: &str, consumer: Consumer, max_lines: usize) {
        let max_lines = max_lines.clamp(MIN_LINES, MAX_LINES);
        debug!(channel, max_lines, "progress channel created");
        self.lock().insert(
            channel.to_string(),
            Channel {
                lines: VecDeque::with_capacity(max_lines),
                last_by_stage: HashMap::new(),
                max_lines,
                revision: 0,
                delivered_revision: 0,
                last_delivery: None,
                consumer,
            },
        );
    }

    pub fn lookup(&self, channel: &str) -> Option<ProgressSnapshot> {
        self.lock().get(channel).map(|state| snapshot(channel, state))
    }

    /// Drop a channel. Returns whether it existed.
    pub fn dispose(&self, channel: &str) -> bool {
        let removed = self.lock().remove(channel).is_some();
        if removed {
            debug!(channel, "progress channel disposed");
        }
        removed
    }

    /// Append a normalized line. Returns false when the channel is unknown,
    /// the text is blank, or it repeats the previous line of the same stage.
    pub fn push(&self, channel: &str, line: ProgressLine) -> bool {
        let text = normalize_line(&line.text);
        if text.is_empty() {
            return false;
        }
        let mut channels = self.lock();
        let Some(state) = channels.get_mut(channel) else {
            return false;
        };
        if state.last_by_stage.get(&line.stage) == Some(&text) {
            return false;
        }
        state.last_by_stage.insert(line.stage, text.clone());
        if state.lines.len() == state.max_lines {
            state.lines.pop_front();
        }
        state.lines.push_back(ProgressLine { text, ..line });
        state.revision += 1;
        true
    }

    pub fn flush(&self, channel: &str, options: FlushOptions) -> FlushResult {
        let mut channels = self.lock();
        let Some(state) = channels.get_mut(channel) else {
            return FlushResult::UnknownChannel;
        };
        if state.revision == state.delivered_revision {
            return FlushResult::Unchanged;
        }
        if !options.force
            && state
                .last_delivery
                .is_some_and(|at| at.elapsed() < options.min_interval)
        {
            return FlushResult::Throttled;
        }
        let snap = snapshot(channel, state);
        match (state.consumer)(&snap) {
            Ok(()) => {
                state.delivered_revision = state.revision;
                state.last_delivery = Some(Instant::now());
                FlushResult::Delivered
            }
            Err(err) => {
                warn!(channel, err = %err, "progress delivery failed");
                FlushResult::Failed
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Channel>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn snapshot(channel: &str, state: &Channel) -> ProgressSnapshot {
    ProgressSnapshot {
        channel: channel.to_string(),
        revision: state.revision,
        lines: state.lines.iter().cloned().collect(),
    }
}

/// Collapse whitespace runs to single spaces and clip long lines.
pub fn normalize_line(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    clip_chars(&collapsed, MAX_LINE_CHARS)
}

pub(crate) fn clip_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    clipped.push('…');
    clipped
}
