//! OpenCode HTTP client implementing [`AgentPlatform`] and [`Notifier`].

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::io::notify::{Notifier, ToastVariant};
use crate::io::platform::{
    AgentEvent, AgentPlatform, MessageInfo, PlatformError, PlatformResult, PromptReply,
    PromptRequest, SessionActivity, SessionInfo,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OpencodeClient {
    agent: ureq::Agent,
    base_url: String,
    directory: Option<String>,
    /// Ceiling for synchronous prompts, which block until the agent's turn ends.
    prompt_timeout: Duration,
    cursor: Mutex<EventCursor>,
}

impl OpencodeClient {
    pub fn new(base_url: &str, directory: Option<String>, prompt_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(5))
            .build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
            directory,
            prompt_timeout,
            cursor: Mutex::new(EventCursor::default()),
        }
    }

    fn request(&self, method: &str, path: &str, timeout: Duration) -> ureq::Request {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.agent.request(method, &url).timeout(timeout);
        if let Some(dir) = &self.directory {
            request = request.query("directory", dir);
        }
        request
    }

    fn send(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        timeout: Duration,
    ) -> PlatformResult<ureq::Response> {
        debug!(method, path, "opencode request");
        let request = self.request(method, path, timeout);
        let result = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        result.map_err(|err| map_error(path, err))
    }

    fn send_json<T: DeserializeOwned>(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
        timeout: Duration,
    ) -> PlatformResult<T> {
        let response = self.send(method, path, body, timeout)?;
        response
            .into_json::<T>()
            .map_err(|err| PlatformError::Decode(format!("{path}: {err}")))
    }
}

fn map_error(path: &str, err: ureq::Error) -> PlatformError {
    match err {
        ureq::Error::Status(404, _) => PlatformError::NotFound(path.to_string()),
        ureq::Error::Status(status, response) => PlatformError::Http {
            status,
            body: response.into_string().unwrap_or_default(),
        },
        ureq::Error::Transport(transport) => PlatformError::Transport(transport.to_string()),
    }
}

fn prompt_body(request: &PromptRequest) -> Value {
    let mut body = json!({ "parts": request.parts });
    if let Some(agent) = &request.agent {
        body["agent"] = json!(agent);
    }
    if request.no_reply {
        body["noReply"] = json!(true);
    }
    body
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
}

#[derive(Debug, Deserialize)]
struct SessionRecord {
    id: String,
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageEnvelope {
    info: MessageHeader,
    #[serde(default)]
    parts: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct MessageHeader {
    id: String,
    #[serde(default)]
    role: String,
}

#[derive(Debug, Deserialize)]
struct StatusEntry {
    #[serde(rename = "type")]
    kind: String,
}

/// Concatenate the text parts of a message.
pub fn extract_text(parts: &[Value]) -> String {
    parts
        .iter()
        .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n")
}

impl AgentPlatform for OpencodeClient {
    #[instrument(skip(self))]
    fn create(&self, title: &str) -> PlatformResult<String> {
        let created: CreatedSession = self.send_json(
            "POST",
            "/session",
            Some(json!({ "title": title })),
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        Ok(created.id)
    }

    fn update_title(&self, session_id: &str, title: &str) -> PlatformResult<()> {
        self.send(
            "PATCH",
            &format!("/session/{session_id}"),
            Some(json!({ "title": title })),
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        Ok(())
    }

    #[instrument(skip(self, request), fields(no_reply = request.no_reply))]
    fn prompt(&self, session_id: &str, request: &PromptRequest) -> PlatformResult<PromptReply> {
        let reply: MessageEnvelope = self.send_json(
            "POST",
            &format!("/session/{session_id}/message"),
            Some(prompt_body(request)),
            self.prompt_timeout,
        )?;
        Ok(PromptReply {
            message_id: reply.info.id,
            text: extract_text(&reply.parts),
        })
    }

    #[instrument(skip(self, request))]
    fn prompt_async(&self, session_id: &str, request: &PromptRequest) -> PlatformResult<()> {
        self.send(
            "POST",
            &format!("/session/{session_id}/prompt_async"),
            Some(prompt_body(request)),
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        Ok(())
    }

    fn revert(&self, session_id: &str, message_id: &str) -> PlatformResult<()> {
        self.send(
            "POST",
            &format!("/session/{session_id}/revert"),
            Some(json!({ "messageID": message_id })),
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        Ok(())
    }

    fn status(&self) -> PlatformResult<HashMap<String, SessionActivity>> {
        let raw: HashMap<String, StatusEntry> =
            self.send_json("GET", "/session/status", None, DEFAULT_REQUEST_TIMEOUT)?;
        Ok(raw
            .into_iter()
            .map(|(id, entry)| {
                let activity = match entry.kind.as_str() {
                    "busy" => SessionActivity::Busy,
                    "retry" => SessionActivity::Retry,
                    _ => SessionActivity::Idle,
                };
                (id, activity)
            })
            .collect())
    }

    fn get(&self, session_id: &str) -> PlatformResult<SessionInfo> {
        let record: SessionRecord = self.send_json(
            "GET",
            &format!("/session/{session_id}"),
            None,
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        Ok(SessionInfo {
            id: record.id,
            title: record.title,
        })
    }

    fn message(&self, session_id: &str, message_id: &str) -> PlatformResult<MessageInfo> {
        let envelope: MessageEnvelope = self.send_json(
            "GET",
            &format!("/session/{session_id}/message/{message_id}"),
            None,
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        Ok(MessageInfo {
            id: envelope.info.id,
            role: envelope.info.role,
            text: extract_text(&envelope.parts),
        })
    }

    fn delete(&self, session_id: &str) -> PlatformResult<()> {
        self.send(
            "DELETE",
            &format!("/session/{session_id}"),
            None,
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        Ok(())
    }

    fn abort(&self, session_id: &str) -> PlatformResult<()> {
        self.send(
            "POST",
            &format!("/session/{session_id}/abort"),
            None,
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        Ok(())
    }

    fn drain_events(&self, session_id: &str) -> PlatformResult<Vec<AgentEvent>> {
        let messages: Vec<Value> = self.send_json(
            "GET",
            &format!("/session/{session_id}/message"),
            None,
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        let mut cursor = match self.cursor.lock() {
            Ok(cursor) => cursor,
            Err(poisoned) => {
                warn!("event cursor poisoned, resetting");
                let mut cursor = poisoned.into_inner();
                *cursor = EventCursor::default();
                cursor
            }
        };
        Ok(cursor.collect(&messages))
    }
}

impl Notifier for OpencodeClient {
    fn toast(&self, message: &str, variant: ToastVariant) -> Result<()> {
        self.send(
            "POST",
            "/tui/show-toast",
            Some(json!({ "message": message, "variant": variant })),
            DEFAULT_REQUEST_TIMEOUT,
        )?;
        Ok(())
    }
}

/// Tracks what has already been reported from a session's message list so
/// repeated polls only yield new output.
#[derive(Debug, Default)]
pub struct EventCursor {
    text_lengths: HashMap<String, usize>,
    tool_states: HashMap<String, String>,
}

impl EventCursor {
    /// Convert assistant message parts into events not seen before.
    pub fn collect(&mut self, messages: &[Value]) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        for message in messages {
            let role = message
                .pointer("/info/role")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if role != "assistant" {
                continue;
            }
            let Some(parts) = message.get("parts").and_then(Value::as_array) else {
                continue;
            };
            for part in parts {
                self.collect_part(part, &mut events);
            }
        }
        events
    }

    fn collect_part(&mut self, part: &Value, events: &mut Vec<AgentEvent>) {
        let part_id = part
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match part.get("type").and_then(Value::as_str) {
            Some("text") => {
                let text = part.get("text").and_then(Value::as_str).unwrap_or_default();
                let seen = self.text_lengths.entry(part_id.clone()).or_insert(0);
                if text.len() > *seen && text.is_char_boundary(*seen) {
                    events.push(AgentEvent::TextDelta {
                        part_id,
                        delta: text[*seen..].to_string(),
                    });
                }
                *seen = text.len();
            }
            Some("tool") => {
                let call_id = part
                    .get("callID")
                    .and_then(Value::as_str)
                    .map_or(part_id, str::to_string);
                let tool = part
                    .get("tool")
                    .and_then(Value::as_str)
                    .unwrap_or("tool")
                    .to_string();
                let status = part
                    .pointer("/state/status")
                    .and_then(Value::as_str)
                    .unwrap_or("pending")
                    .to_string();
                if self.tool_states.get(&call_id) == Some(&status) {
                    return;
                }
                self.tool_states.insert(call_id.clone(), status.clone());
                match status.as_str() {
                    "completed" => events.push(AgentEvent::ToolComplete { call_id, tool }),
                    "error" => events.push(AgentEvent::ToolError { call_id, tool }),
                    _ => events.push(AgentEvent::ToolStart { call_id, tool }),
                }
            }
            Some("patch") => {
                let files = part
                    .get("files")
                    .and_then(Value::as_array)
                    .map(|files| {
                        files
                            .iter()
                            .filter_map(Value::as_str)
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .unwrap_or_default();
                let content = if files.is_empty() {
                    part.get("hash")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string()
                } else {
                    files
                };
                if !content.is_empty() {
                    events.push(AgentEvent::Patch { content });
                }
            }
            _ => {}
        }
    }
}
