//! Rich progress variant: agent activity relayed as toasts.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::io::notify::{Notifier, ToastVariant, notify_best_effort};
use crate::io::platform::AgentEvent;
use crate::progress::{Stage, clip_chars};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ToolState {
    Running,
    Completed,
    Errored,
}

/// Accumulates agent events for one stage into a capped text buffer and
/// flushes it as rate-limited toasts.
pub struct ActivityChannel<'a> {
    notifier: &'a dyn Notifier,
    max_chars: usize,
    min_interval: Duration,
    stage: Stage,
    buffer: String,
    tools: HashMap<String, ToolState>,
    patches: HashSet<String>,
    dirty: bool,
    last_toast: Option<Instant>,
}

impl<'a> ActivityChannel<'a> {
    pub fn new(
        notifier: &'a dyn Notifier,
        stage: Stage,
        max_chars: usize,
        min_interval: Duration,
    ) -> Self {
        Self {
            notifier,
            max_chars: max_chars.max(1),
            min_interval,
            stage,
            buffer: String::new(),
            tools: HashMap::new(),
            patches: HashSet::new(),
            dirty: false,
            last_toast: None,
        }
    }

    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    pub fn record(&mut self, events: Vec<AgentEvent>) {
        for event in events {
            self.record_event(event);
        }
    }

    pub fn record_event(&mut self, event: AgentEvent) {
        match event {
            AgentEvent::TextDelta { delta, .. } => self.append(&delta),
            AgentEvent::ToolStart { call_id, tool } => {
                if self.tools.contains_key(&call_id) {
                    return;
                }
                self.tools.insert(call_id, ToolState::Running);
                self.append_line(&format!("▸ {tool}"));
            }
            AgentEvent::ToolComplete { call_id, tool } => {
                if self.finish_tool(call_id, ToolState::Completed) {
                    self.append_line(&format!("✓ {tool}"));
                }
            }
            AgentEvent::ToolError { call_id, tool } => {
                if self.finish_tool(call_id, ToolState::Errored) {
                    self.append_line(&format!("✗ {tool}"));
                }
            }
            AgentEvent::Patch { content } => {
                let digest = hex::encode(Sha256::digest(content.as_bytes()));
                if !self.patches.insert(digest) {
                    debug!("duplicate patch event ignored");
                    return;
                }
                self.append_line(&format!("patched {}", content.trim()));
            }
        }
    }

    /// Toast the buffer if it changed and the interval
    /// allows. Returns whether a toast was sent.
    pub fn flush(&mut self, force: bool) -> bool {
        if !self.dirty {
            return false;
        }
        if !force
            && self
                .last_toast
                .is_some_and(|at| at.elapsed() < self.min_interval)
        {
            return false;
        }
        let body = self.buffer.trim();
        if body.is_empty() {
            self.dirty = false;
            return false;
        }
        let message = format!("[{}] {body}", self.stage);
        notify_best_effort(self.notifier, &message, ToastVariant::Info);
        self.dirty = false;
        self.last_toast = Some(Instant::now());
        true
    }

    fn finish_tool(&mut self, call_id: String, state: ToolState) -> bool {
        match self.tools.get(&call_id) {
            Some(ToolState::Completed | ToolState::Errored) => false,
            _ => {
                self.tools.insert(call_id, state);
                true
            }
        }
    }

    fn append_line(&mut self, line: &str) {
        if !self.buffer.is_empty() && !self.buffer.ends_with('\n') {
            self.buffer.push('\n');
        }
        self.buffer.push_str(line);
        self.buffer.push('\n');
        self.trim();
    }

    fn append(&mut self, text: &str) {
        self.buffer.push_str(text);
        self.trim();
    }

    fn trim(&mut self) {
        let len = self.buffer.chars().count();
        if len > self.max_chars {
            self.buffer = self.buffer.chars().skip(len - self.max_chars).collect();
        }
        self.dirty = true;
    }
}

/// Single-line toast text for a long message.
pub fn toast_text(text: &str, max_chars: usize) -> String {
    clip_chars(&text.split_whitespace().collect::<Vec<_>>().join(" "), max_chars)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingNotifier;

    fn tool_start(id: &str) -> AgentEvent {
        AgentEvent::ToolStart {
            call_id: id.to_string(),
            tool: "bash".to_string(),
        }
    }

    fn tool_done(id: &str) -> AgentEvent {
        AgentEvent::ToolComplete {
            call_id: id.to_string(),
            tool: "bash".to_string(),
        }
    }

    #[test]
    fn late_tool_start_is_ignored() {
        let notifier = RecordingNotifier::new();
        let mut channel = ActivityChannel::new(&notifier, Stage::Build, 800, Duration::ZERO);
        channel.record(vec![tool_start("c1"), tool_done("c1"), tool_start("c1"), tool_done("c1")]);
        assert_eq!(channel.buffer(), "▸ bash\n✓ bash\n");
    }

    #[test]
    fn completion_without_start_is_recorded_once() {
        let notifier = RecordingNotifier::new();
        let mut channel = ActivityChannel::new(&notifier, Stage::Build, 800, Duration::ZERO);
        channel.record(vec![
            tool_done("c9"),
            AgentEvent::ToolError {
                call_id: "c9".to_string(),
                tool: "bash".to_string(),
            },
        ]);
        assert_eq!(channel.buffer(), "✓ bash\n");
    }

    #[test]
    fn duplicate_patches_are_dropped() {
        let notifier = RecordingNotifier::new();
        let mut channel = ActivityChannel::new(&notifier, Stage::Build, 800, Duration::ZERO);
        let patch = AgentEvent::Patch {
            content: "src/main.rs".to_string(),
        };
        channel.record(vec![patch.clone(), patch]);
        assert_eq!(channel.buffer(), "patched src/main.rs\n");
    }

    #[test]
    fn buffer_keeps_the_tail_and_toasts_carry_the_stage() {
        let notifier = RecordingNotifier::new();
        let mut channel = ActivityChannel::new(&notifier, Stage::Judge, 10, Duration::ZERO);
        channel.record_event(AgentEvent::TextDelta {
            part_id: "p1".to_string(),
            delta: "abcdefghijklmnop".to_string(),
        });
        assert_eq!(channel.buffer(), "ghijklmnop");
        assert!(channel.flush(false));
        assert_eq!(notifier.toasts()[0].0, "[judge] ghijklmnop");
    }

    #[test]
    fn flush_is_rate_limited() {
        let notifier = RecordingNotifier::new();
        let mut channel = ActivityChannel::new(&notifier, Stage::Build, 800, Duration::from_secs(60));
        assert!(!channel.flush(false));
        channel.record_event(tool_start("c1"));
        assert!(channel.flush(false));
        channel.record_event(tool_done("c1"));
        assert!(!channel.flush(false));
        assert!(channel.flush(true));
        assert!(!channel.flush(true));
        let toasts = notifier.toasts();
        assert_eq!(toasts.len(), 2);
        assert_eq!(toasts[0].0, "[build] ▸ bash");
    }

    #[test]
    fn toast_text_is_single_line() {
        assert_eq!(toast_text("a\nb   c", 80), "a b c");
    }
}
