//! Validation utilities for stream-JSON and client input
//!
//! Everything the runner and gateway accept from the outside world passes
//! through here: CLI stdout lines, client prompts, attachments, stream
//! chunks. Malformed stream fragments are dropped silently; malformed
//! client input fails with a descriptive reason.

use crate::errors::{Result, RunnerError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum prompt length in characters
pub const MAX_PROMPT_CHARS: usize = 50_000;
/// Maximum content length in characters
pub const MAX_CONTENT_CHARS: usize = 100_000;
/// Maximum number of attachments per request
pub const MAX_ATTACHMENTS: usize = 10;
/// Maximum attachment size in bytes (10 MiB)
pub const MAX_ATTACHMENT_BYTES: u64 = 10 * 1024 * 1024;

/// True iff `s` (trimmed) parses as one complete JSON value.
///
/// Unterminated strings/objects and trailing garbage both return false.
pub fn is_valid_complete_json(s: &str) -> bool {
    serde_json::from_str::<Value>(s.trim()).is_ok()
}

/// Interpret `s` as newline-delimited JSON.
///
/// Each non-blank line is parsed; a line that fails as a whole is scanned
/// with [`extract_complete_objects_from_line`] and any recovered objects
/// are kept. Source order is preserved.
pub fn parse_stream_json_output(s: &str) -> Vec<Value> {
    let mut out = Vec::new();
    for line in s.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => out.push(value),
            Err(_) => out.extend(extract_complete_objects_from_line(line)),
        }
    }
    out
}

/// Scan a line character-by-character and emit each complete top-level
/// JSON object it contains.
///
/// Tracks string, escape, and nesting state so braces inside string
/// literals do not confuse the scan. Malformed fragments are dropped.
pub fn extract_complete_objects_from_line(line: &str) -> Vec<Value> {
    scan_top_level(line, false)
}

/// The last complete JSON value contained in `s`.
///
/// The whole (trimmed) input wins when it parses; otherwise the scanner
/// collects every top-level object or array span and the last one that
/// parses is returned.
pub fn extract_last_complete_json(s: &str) -> Option<Value> {
    let trimmed = s.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    scan_top_level(trimmed, true).into_iter().last()
}

/// Shared bracket scanner. `include_arrays` also emits top-level arrays.
fn scan_top_level(input: &str, include_arrays: bool) -> Vec<Value> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start: Option<usize> = None;
    let mut open = '{';
    let mut close = '}';
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in input.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' if start.is_some() => in_string = true,
            '{' | '[' => {
                if start.is_none() {
                    if c == '[' && !include_arrays {
                        continue;
                    }
                    start = Some(i);
                    open = c;
                    close = if c == '{' { '}' } else { ']' };
                    depth = 1;
                } else if c == open {
                    depth += 1;
                }
            }
            '}' | ']' => {
                if let Some(s0) = start {
                    if c == close {
                        depth -= 1;
                        if depth == 0 {
                            let slice = &input[s0..i + c.len_utf8()];
                            if let Ok(value) = serde_json::from_str::<Value>(slice) {
                                out.push(value);
                            }
                            start = None;
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}

/// Sanitize a client prompt: strip NUL bytes and truncate to
/// [`MAX_PROMPT_CHARS`]. Fails when the result is empty.
pub fn sanitize_prompt(prompt: &str) -> Result<String> {
    let sanitized: String = prompt
        .chars()
        .filter(|c| *c != '\0')
        .take(MAX_PROMPT_CHARS)
        .collect();
    if sanitized.trim().is_empty() {
        return Err(RunnerError::validation("prompt must not be empty"));
    }
    Ok(sanitized)
}

/// Sanitize free-form content: `None` coerces to empty, NUL and control
/// characters other than `\t`, `\n`, `\r` are stripped, and the result is
/// truncated to [`MAX_CONTENT_CHARS`].
pub fn sanitize_content(content: Option<&str>) -> String {
    let Some(content) = content else {
        return String::new();
    };
    content
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\t' | '\n' | '\r'))
        .take(MAX_CONTENT_CHARS)
        .collect()
}

/// Output formats a client may request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Json,
    Text,
    Markdown,
    StreamJson,
}

impl OutputFormat {
    /// Flag value as the CLI expects it.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Text => "text",
            Self::Markdown => "markdown",
            Self::StreamJson => "stream-json",
        }
    }
}

/// Validate a requested output format, case-insensitively.
///
/// `None` defaults to [`OutputFormat::Json`]; any unknown string fails.
pub fn validate_format(format: Option<&str>) -> Result<OutputFormat> {
    let Some(format) = format else {
        return Ok(OutputFormat::Json);
    };
    match format.to_ascii_lowercase().as_str() {
        "json" => Ok(OutputFormat::Json),
        "text" => Ok(OutputFormat::Text),
        "markdown" => Ok(OutputFormat::Markdown),
        "stream-json" => Ok(OutputFormat::StreamJson),
        other => Err(RunnerError::validation(format!(
            "unsupported format: {other}"
        ))),
    }
}

/// Kinds of attachments a client may submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    File,
    Code,
}

/// A validated attachment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Validate a raw attachment list.
///
/// At most [`MAX_ATTACHMENTS`] entries; each must carry a known `type`;
/// `size` is capped at [`MAX_ATTACHMENT_BYTES`]; a missing `name` defaults
/// to `attachment_{index}`.
pub fn validate_attachments(list: &[Value]) -> Result<Vec<Attachment>> {
    if list.len() > MAX_ATTACHMENTS {
        return Err(RunnerError::validation(format!(
            "too many attachments: {} (max {})",
            list.len(),
            MAX_ATTACHMENTS
        )));
    }

    let mut out = Vec::with_capacity(list.len());
    for (index, raw) in list.iter().enumerate() {
        let obj = raw.as_object().ok_or_else(|| {
            RunnerError::validation(format!("attachment {index} is not an object"))
        })?;

        let kind = match obj.get("type").and_then(|v| v.as_str()) {
            Some("image") => AttachmentKind::Image,
            Some("file") => AttachmentKind::File,
            Some("code") => AttachmentKind::Code,
            Some(other) => {
                return Err(RunnerError::validation(format!(
                    "attachment {index} has unknown type: {other}"
                )))
            }
            None => {
                return Err(RunnerError::validation(format!(
                    "attachment {index} is missing type"
                )))
            }
        };

        let size = obj.get("size").and_then(|v| v.as_u64());
        if let Some(size) = size {
            if size > MAX_ATTACHMENT_BYTES {
                return Err(RunnerError::validation(format!(
                    "attachment {index} exceeds {MAX_ATTACHMENT_BYTES} bytes"
                )));
            }
        }

        let name = obj
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("attachment_{index}"));

        let content = obj
            .get("content")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        out.push(Attachment {
            kind,
            name,
            size,
            content,
        });
    }
    Ok(out)
}

/// Classify a raw stream chunk as deliverable or not.
///
/// Rejects non-objects, chunks missing `type` or `data`, `content` chunks
/// whose content is empty/whitespace, and `tool_use` chunks without a
/// tool name.
pub fn validate_stream_chunk(chunk: &Value) -> bool {
    let Some(obj) = chunk.as_object() else {
        return false;
    };
    let Some(chunk_type) = obj.get("type").and_then(|v| v.as_str()) else {
        return false;
    };
    let Some(data) = obj.get("data") else {
        return false;
    };

    match chunk_type {
        "content" => {
            let text = data
                .as_str()
                .or_else(|| obj.get("content").and_then(|v| v.as_str()));
            matches!(text, Some(t) if !t.trim().is_empty())
        }
        "tool_use" => {
            let name = obj
                .get("name")
                .or_else(|| data.get("name"))
                .and_then(|v| v.as_str());
            matches!(name, Some(n) if !n.is_empty())
        }
        _ => true,
    }
}

/// Extract the most useful final value from a batch of responses.
///
/// The last response carrying a `result` field wins; otherwise all
/// `content` string fields are concatenated in order; otherwise the last
/// response itself is returned.
pub fn extract_final_result(responses: &[Value]) -> Option<Value> {
    if let Some(with_result) = responses.iter().rev().find(|r| r.get("result").is_some()) {
        return Some(with_result.clone());
    }

    let concatenated: String = responses
        .iter()
        .filter_map(|r| r.get("content").and_then(|c| c.as_str()))
        .collect::<Vec<_>>()
        .join("");
    if !concatenated.is_empty() {
        return Some(Value::String(concatenated));
    }

    responses.last().cloned()
}

/// First `session_id` present in a batch of responses.
pub fn extract_session_id(responses: &[Value]) -> Option<String> {
    responses
        .iter()
        .find_map(|r| r.get("session_id").and_then(|v| v.as_str()))
        .map(str::to_string)
}
