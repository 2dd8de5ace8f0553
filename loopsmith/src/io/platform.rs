//! Agent session platform abstraction.
//!
//! The [`AgentPlatform`] trait decouples the run loop from the concrete chat
//! server (currently an OpenCode HTTP server). Tests use a scripted platform
//! that records calls without any network access.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    /// The session or message does not exist (anymore).
    #[error("not found: {0}")]
    NotFound(String),
    #[error("platform returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("platform unreachable: {0}")]
    Transport(String),
    #[error("unexpected platform response: {0}")]
    Decode(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }
}

pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PromptPart {
    Text { text: String },
}

/// One prompt turn sent to a session.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PromptRequest {
    pub parts: Vec<PromptPart>,
    pub agent: Option<String>,
    /// Record the message without asking the agent to answer.
    pub no_reply: bool,
}

impl PromptRequest {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            parts: vec![PromptPart::Text { text: text.into() }],
            ..Self::default()
        }
    }

    pub fn with_agent(mut self, agent: Option<&str>) -> Self {
        self.agent = agent.map(str::to_string);
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }
}

/// Reply to a synchronous prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptReply {
    pub message_id: String,
    /// Concatenated text parts of the reply.
    pub text: String,
}

/// Activity of a session as reported by the platform's status map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionActivity {
    Idle,
    Busy,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub id: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub id: String,
    pub role: String,
    pub text: String,
}

/// In-flight output observed while a turn runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    TextDelta { part_id: String, delta: String },
    ToolStart { call_id: String, tool: String },
    ToolComplete { call_id: String, tool: String },
    ToolError { call_id: String, tool: String },
    Patch { content: String },
}

pub trait AgentPlatform {
    fn create(&self, title: &str) -> PlatformResult<String>;

    fn update_title(&self, session_id: &str, title: &str) -> PlatformResult<()>;

    /// Send a prompt and wait for the agent to finish its turn.
    fn prompt(&self, session_id: &str, request: &PromptRequest) -> PlatformResult<PromptReply>;

    /// Send a prompt without waiting; completion is observed via [`Self::status`].
    fn prompt_async(&self, session_id: &str, request: &PromptRequest) -> PlatformResult<()>;

    /// Drop every message after `message_id`.
    fn revert(&self, session_id: &str, message_id: &str) -> PlatformResult<()>;

    /// Activity per session. Sessions absent from the map are idle.
    fn status(&self) -> PlatformResult<HashMap<String, SessionActivity>>;

    fn get(&self, session_id: &str) -> PlatformResult<SessionInfo>;

    fn message(&self, session_id: &str, message_id: &str) -> PlatformResult<MessageInfo>;

    fn delete(&self, session_id: &str) -> PlatformResult<()>;

    /// Stop the turn currently running in the session.
    fn abort(&self, session_id: &str) -> PlatformResult<()>;

    /// Events produced since the previous call for this session.
    fn drain_events(&self, _session_id: &str) -> PlatformResult<Vec<AgentEvent>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_part_serializes_with_type_tag() {
        let json = serde_json::to_value(PromptPart::Text {
            text: "hi".to_string(),
        })
        .expect("json");
        assert_eq!(json, serde_json::json!({"type": "text", "text": "hi"}));
    }

    #[test]
    fn prompt_request_builders() {
        let request = PromptRequest::text("rules").with_agent(Some("build")).no_reply();
        assert!(request.no_reply);
        assert_eq!(request.agent.as_deref(), Some("build"));
        assert_eq!(request.parts.len(), 1);
    }
}
