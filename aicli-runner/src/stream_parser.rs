//! Incremental stream-JSON parser
//!
//! Stdout from the CLI arrives in arbitrary-sized byte chunks. The parser
//! accumulates them into a line buffer and, for each completed line,
//! attempts a JSON parse; lines that fail as a whole are scanned for
//! embedded complete objects. Each recovered object yields a typed event
//! plus a raw `streamChunk`, with the last chunk of a batch flagged.

use crate::types::StreamEvent;
use crate::validation::extract_complete_objects_from_line;
use serde_json::Value;
use tracing::{debug, warn};

/// Incremental parser for one child process's stdout.
pub struct StreamParser {
    session_id: String,
    request_id: Option<String>,
    buffer: String,
}

impl StreamParser {
    /// Create a parser bound to a session (and optional request).
    pub fn new(session_id: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            session_id: session_id.into(),
            request_id,
            buffer: String::new(),
        }
    }

    /// Feed a raw stdout chunk; returns the events completed by it.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut objects = Vec::new();
        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            objects.extend(parse_line(line.trim()));
        }
        self.events_for(objects)
    }

    /// Feed an already-decoded block of output (may span many lines).
    pub fn push_text(&mut self, text: &str) -> Vec<StreamEvent> {
        self.push_chunk(text.as_bytes())
    }

    /// Consume whatever remains in the buffer as a final line.
    pub fn flush(&mut self) -> Vec<StreamEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let trimmed = rest.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }
        let objects = parse_line(trimmed);
        self.events_for(objects)
    }

    /// Translate a batch of raw objects into events: a typed event per
    /// recognized `type`, plus a `streamChunk` per object with the batch
    /// tail flagged `is_last`.
    fn events_for(&self, objects: Vec<Value>) -> Vec<StreamEvent> {
        let count = objects.len();
        let mut events = Vec::with_capacity(count * 2);
        for (i, object) in objects.into_iter().enumerate() {
            if let Some(typed) = self.classify(&object) {
                events.push(typed);
            }
            events.push(StreamEvent::StreamChunk {
                session_id: self.session_id.clone(),
                request_id: self.request_id.clone(),
                chunk: object,
                is_last: i + 1 == count,
            });
        }
        events
    }

    /// Map one raw object onto a typed event by its `type` field.
    fn classify(&self, object: &Value) -> Option<StreamEvent> {
        let session_id = self.session_id.clone();
        let request_id = self.request_id.clone();
        let object_type = object.get("type").and_then(|v| v.as_str())?;

        match object_type {
            "system" => {
                let subtype = object.get("subtype").and_then(|v| v.as_str());
                if subtype == Some("init") {
                    Some(StreamEvent::SystemInit {
                        session_id,
                        data: object.clone(),
                    })
                } else {
                    debug!("Ignoring system subtype: {:?}", subtype);
                    None
                }
            }
            "assistant" => Some(StreamEvent::AssistantMessage {
                session_id,
                request_id,
                is_complete: true,
                data: object
                    .get("message")
                    .cloned()
                    .unwrap_or_else(|| object.clone()),
            }),
            "tool_use" => Some(StreamEvent::ToolUse {
                session_id,
                request_id,
                data: object.clone(),
            }),
            "tool_result" => Some(StreamEvent::ToolResult {
                session_id,
                request_id,
                data: object.clone(),
            }),
            "result" => Some(StreamEvent::ConversationResult {
                session_id,
                request_id,
                data: object.clone(),
            }),
            "permission_request" | "permission_required" => {
                Some(StreamEvent::PermissionRequired {
                    session_id,
                    request_id,
                    data: object.clone(),
                })
            }
            "progress" | "command_progress" => Some(StreamEvent::CommandProgress {
                session_id,
                data: object.clone(),
            }),
            "error" => Some(StreamEvent::StreamError {
                session_id,
                error: object
                    .get("error")
                    .and_then(|v| v.as_str())
                    .or_else(|| object.get("message").and_then(|v| v.as_str()))
                    .unwrap_or("unknown stream error")
                    .to_string(),
            }),
            other => {
                debug!("Unclassified stream object type: {}", other);
                None
            }
        }
    }
}

/// Parse one line: whole-line JSON first, then character-scan recovery.
fn parse_line(line: &str) -> Vec<Value> {
    if line.is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(line) {
        Ok(value) => vec![value],
        Err(e) => {
            let recovered = extract_complete_objects_from_line(line);
            if recovered.is_empty() {
                warn!("Dropped unparseable stream line: {} - {}", e, line);
            }
            recovered
        }
    }
}
