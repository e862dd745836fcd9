//! Typed events and options for the AICLI runner
//!
//! The CLI writes newline-delimited JSON to stdout. Each parsed object is
//! translated into one [`StreamEvent`] variant keyed by its `type` field,
//! so downstream consumers (broadcaster, queues) work over one sum type
//! instead of reflecting on string-keyed maps.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;

/// Permission modes accepted by the CLI.
///
/// Unknown mode strings silently reset to [`PermissionMode::Default`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// CLI prompts for permission as needed
    #[default]
    Default,
    /// Plan mode: read-only analysis
    Plan,
    /// Automatically accept file edits
    AcceptEdits,
}

impl PermissionMode {
    /// Parse a mode string; anything unrecognized resets to `Default`.
    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "plan" => Self::Plan,
            "acceptEdits" => Self::AcceptEdits,
            _ => Self::Default,
        }
    }

    /// The flag value passed to the CLI.
    pub fn as_flag_value(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Plan => "plan",
            Self::AcceptEdits => "acceptEdits",
        }
    }
}

/// Permission-related CLI flags.
///
/// When `skip_permissions` is set, only `--dangerously-skip-permissions`
/// is emitted and the other three flags are suppressed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionFlags {
    /// Permission mode for the session
    pub mode: PermissionMode,
    /// Tools the CLI may use without prompting
    pub allowed_tools: Vec<String>,
    /// Tools the CLI must never use
    pub disallowed_tools: Vec<String>,
    /// Bypass the permission system entirely
    pub skip_permissions: bool,
}

/// Options for one runner invocation.
#[derive(Debug, Clone, Default)]
pub struct RunnerOptions {
    /// Working directory for the child process
    pub working_dir: Option<PathBuf>,
    /// Permission flags
    pub permissions: PermissionFlags,
    /// Correlation id attached to emitted events
    pub request_id: Option<String>,
    /// Explicit CLI binary, overriding discovery
    pub cli_path: Option<PathBuf>,
    /// Extra environment variables for the child
    pub env: HashMap<String, String>,
}

impl RunnerOptions {
    /// Create an options builder.
    pub fn builder() -> RunnerOptionsBuilder {
        RunnerOptionsBuilder::default()
    }
}

/// Builder for [`RunnerOptions`].
#[derive(Debug, Default)]
pub struct RunnerOptionsBuilder {
    options: RunnerOptions,
}

impl RunnerOptionsBuilder {
    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.working_dir = Some(dir.into());
        self
    }

    /// Set the permission mode.
    pub fn permission_mode(mut self, mode: PermissionMode) -> Self {
        self.options.permissions.mode = mode;
        self
    }

    /// Set the allowed tool list.
    pub fn allowed_tools(mut self, tools: Vec<String>) -> Self {
        self.options.permissions.allowed_tools = tools;
        self
    }

    /// Set the disallowed tool list.
    pub fn disallowed_tools(mut self, tools: Vec<String>) -> Self {
        self.options.permissions.disallowed_tools = tools;
        self
    }

    /// Bypass the permission system.
    pub fn skip_permissions(mut self, skip: bool) -> Self {
        self.options.permissions.skip_permissions = skip;
        self
    }

    /// Attach a correlation id to emitted events.
    pub fn request_id(mut self, id: impl Into<String>) -> Self {
        self.options.request_id = Some(id.into());
        self
    }

    /// Use an explicit CLI binary.
    pub fn cli_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.cli_path = Some(path.into());
        self
    }

    /// Add an environment variable for the child process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.env.insert(key.into(), value.into());
        self
    }

    /// Build the options.
    pub fn build(self) -> RunnerOptions {
        self.options
    }
}

/// One typed event from a session's child process.
///
/// Every variant carries the owning `session_id`; request-scoped variants
/// also carry the `request_id` of the prompt that produced them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum StreamEvent {
    /// First line of a session: `{"type":"system","subtype":"init",...}`
    #[serde(rename_all = "camelCase")]
    SystemInit {
        session_id: String,
        data: Value,
    },
    /// Assistant text/content message
    #[serde(rename_all = "camelCase")]
    AssistantMessage {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        is_complete: bool,
        data: Value,
    },
    /// Assistant invoked a tool
    #[serde(rename_all = "camelCase")]
    ToolUse {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: Value,
    },
    /// A tool produced a result
    #[serde(rename_all = "camelCase")]
    ToolResult {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: Value,
    },
    /// Terminal `{"type":"result",...}` object
    #[serde(rename_all = "camelCase")]
    ConversationResult {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: Value,
    },
    /// The assistant is waiting on a permission decision
    #[serde(rename_all = "camelCase")]
    PermissionRequired {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        data: Value,
    },
    /// Child process spawned
    #[serde(rename_all = "camelCase")]
    ProcessStart {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    /// Child process exited
    #[serde(rename_all = "camelCase")]
    ProcessExit {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    /// A line of child stderr
    #[serde(rename_all = "camelCase")]
    ProcessStderr {
        session_id: String,
        line: String,
    },
    /// Raw parsed object from the stream; one per object
    #[serde(rename_all = "camelCase")]
    StreamChunk {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<String>,
        chunk: Value,
        is_last: bool,
    },
    /// Stream-level failure
    #[serde(rename_all = "camelCase")]
    StreamError {
        session_id: String,
        error: String,
    },
    /// Long-running command progress marker
    #[serde(rename_all = "camelCase")]
    CommandProgress {
        session_id: String,
        data: Value,
    },
}

impl StreamEvent {
    /// Event name as clients see it.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SystemInit { .. } => "systemInit",
            Self::AssistantMessage { .. } => "assistantMessage",
            Self::ToolUse { .. } => "toolUse",
            Self::ToolResult { .. } => "toolResult",
            Self::ConversationResult { .. } => "conversationResult",
            Self::PermissionRequired { .. } => "permissionRequired",
            Self::ProcessStart { .. } => "processStart",
            Self::ProcessExit { .. } => "processExit",
            Self::ProcessStderr { .. } => "processStderr",
            Self::StreamChunk { .. } => "streamChunk",
            Self::StreamError { .. } => "streamError",
            Self::CommandProgress { .. } => "commandProgress",
        }
    }

    /// The session this event belongs to.
    pub fn session_id(&self) -> &str {
        match self {
            Self::SystemInit { session_id, .. }
            | Self::AssistantMessage { session_id, .. }
            | Self::ToolUse { session_id, .. }
            | Self::ToolResult { session_id, .. }
            | Self::ConversationResult { session_id, .. }
            | Self::PermissionRequired { session_id, .. }
            | Self::ProcessStart { session_id, .. }
            | Self::ProcessExit { session_id, .. }
            | Self::ProcessStderr { session_id, .. }
            | Self::StreamChunk { session_id, .. }
            | Self::StreamError { session_id, .. }
            | Self::CommandProgress { session_id, .. } => session_id,
        }
    }

    /// Event payload as a JSON value, for wire framing.
    pub fn payload(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Build a text `assistantMessage` event, the shape used for progress
    /// and completion notices.
    pub fn assistant_text(session_id: impl Into<String>, text: &str, is_complete: bool) -> Self {
        Self::AssistantMessage {
            session_id: session_id.into(),
            request_id: None,
            is_complete,
            data: serde_json::json!({
                "content": [{ "type": "text", "text": text }]
            }),
        }
    }

    /// First text fragment carried by an `assistantMessage`, if any.
    pub fn assistant_text_content(&self) -> Option<&str> {
        match self {
            Self::AssistantMessage { data, .. } => data
                .get("content")
                .and_then(|c| c.as_array())
                .and_then(|a| a.first())
                .and_then(|b| b.get("text"))
                .and_then(|t| t.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_mode_lossy_parse() {
        assert_eq!(PermissionMode::from_str_lossy("plan"), PermissionMode::Plan);
        assert_eq!(
            PermissionMode::from_str_lossy("acceptEdits"),
            PermissionMode::AcceptEdits
        );
        assert_eq!(
            PermissionMode::from_str_lossy("yolo"),
            PermissionMode::Default
        );
        assert_eq!(PermissionMode::from_str_lossy(""), PermissionMode::Default);
    }

    #[test]
    fn test_event_names() {
        let e = StreamEvent::SystemInit {
            session_id: "s".into(),
            data: Value::Null,
        };
        assert_eq!(e.name(), "systemInit");
        assert_eq!(e.session_id(), "s");

        let e = StreamEvent::StreamChunk {
            session_id: "s".into(),
            request_id: None,
            chunk: Value::Null,
            is_last: true,
        };
        assert_eq!(e.name(), "streamChunk");
    }

    #[test]
    fn test_assistant_text_round_trip() {
        let e = StreamEvent::assistant_text("s1", "Still working…", false);
        assert_eq!(e.assistant_text_content(), Some("Still working…"));
        match &e {
            StreamEvent::AssistantMessage { is_complete, .. } => assert!(!is_complete),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn test_event_serializes_camel_case() {
        let e = StreamEvent::StreamChunk {
            session_id: "s".into(),
            request_id: Some("r".into()),
            chunk: serde_json::json!({"type": "content", "data": "x"}),
            is_last: true,
        };
        let v = e.payload();
        assert_eq!(v["event"], "streamChunk");
        assert_eq!(v["sessionId"], "s");
        assert_eq!(v["isLast"], true);
    }

    #[test]
    fn test_options_builder() {
        let opts = RunnerOptions::builder()
            .working_dir("/tmp/project")
            .permission_mode(PermissionMode::Plan)
            .allowed_tools(vec!["Read".into(), "Grep".into()])
            .request_id("req-1")
            .build();
        assert_eq!(opts.permissions.mode, PermissionMode::Plan);
        assert_eq!(opts.permissions.allowed_tools.len(), 2);
        assert_eq!(opts.request_id.as_deref(), Some("req-1"));
    }
}
