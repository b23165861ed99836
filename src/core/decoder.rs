//! Decoding of `data:` payloads into stream events.
//!
//! Both endpoint variants share the same framing; they only differ in the JSON
//! carried by each frame. Plain completions send OpenAI-style deltas, while the
//! tool-augmented endpoint sends `{type, ...}` events.

use std::fmt;

use serde_json::Value;
use tracing::debug;

use crate::api::{ChatResponse, McpEvent, Usage};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Answer text (plain delta or typed `assistant` event).
    Content(String),
    /// A standalone reasoning trace from the tool-augmented endpoint.
    Reasoning(String),
    ToolCall {
        name: String,
        arguments: Value,
        reasoning: Option<String>,
    },
    ToolResult {
        name: String,
        result: Value,
    },
    /// Progress information; logged, never stored.
    Status(String),
    /// Error reported inside the stream.
    Error(String),
    Usage(Usage),
}

#[derive(Debug)]
pub enum DecodeError {
    Json {
        payload: String,
        source: serde_json::Error,
    },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Json { payload, source } => {
                write!(f, "Failed to parse JSON: {source} - Data: {payload}")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DecodeError::Json { source, .. } => Some(source),
        }
    }
}

/// Decode one `data:` payload. A payload may yield several events (usage and
/// content travel together in plain deltas) or none at all.
pub fn decode_line(payload: &str) -> Result<Vec<StreamEvent>, DecodeError> {
    let value: Value = serde_json::from_str(payload).map_err(|source| DecodeError::Json {
        payload: payload.to_string(),
        source,
    })?;

    if let Some(kind) = value.get("type").and_then(Value::as_str) {
        if McpEvent::KNOWN_TYPES.contains(&kind) {
            let event: McpEvent =
                serde_json::from_value(value).map_err(|source| DecodeError::Json {
                    payload: payload.to_string(),
                    source,
                })?;
            return Ok(from_mcp_event(event).into_iter().collect());
        }
        if value.get("choices").is_none() {
            debug!(kind, "ignoring unknown stream event type");
            return Ok(Vec::new());
        }
    }

    if value.get("choices").is_none() {
        if let Some(summary) = extract_error_summary(&value) {
            return Ok(vec![StreamEvent::Error(summary)]);
        }
    }

    let response: ChatResponse =
        serde_json::from_value(value).map_err(|source| DecodeError::Json {
            payload: payload.to_string(),
            source,
        })?;

    let mut events = Vec::new();
    if let Some(usage) = response.usage {
        events.push(StreamEvent::Usage(usage));
    }
    if let Some(content) = response
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
    {
        if !content.is_empty() {
            events.push(StreamEvent::Content(content));
        }
    }
    Ok(events)
}

fn from_mcp_event(event: McpEvent) -> Option<StreamEvent> {
    match event {
        McpEvent::Reasoning { content } if !content.is_empty() => {
            Some(StreamEvent::Reasoning(content))
        }
        McpEvent::ToolCall {
            name,
            arguments,
            reasoning,
        } if !name.is_empty() => Some(StreamEvent::ToolCall {
            name,
            arguments: arguments
                .filter(|value| !value.is_null())
                .unwrap_or_else(|| Value::Object(Default::default())),
            reasoning: reasoning.filter(|text| !text.is_empty()),
        }),
        McpEvent::ToolResult { name, result } if !name.is_empty() => {
            Some(StreamEvent::ToolResult {
                name,
                result: result
                    .filter(|value| !value.is_null())
                    .unwrap_or_else(|| Value::String(String::new())),
            })
        }
        McpEvent::Status { message } => Some(StreamEvent::Status(message)),
        McpEvent::Assistant { content } if !content.is_empty() => {
            Some(StreamEvent::Content(content))
        }
        McpEvent::Error { message } => Some(StreamEvent::Error(message)),
        _ => None,
    }
}

/// Body of a `tool_call` message.
pub fn format_tool_call(name: &str, arguments: &Value, reasoning: Option<&str>) -> String {
    let payload = serde_json::json!({
        "name": name,
        "arguments": arguments,
        "reasoning": reasoning.unwrap_or_default(),
    });
    serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string())
}

/// Body of a `tool_result` message.
pub fn format_tool_result(name: &str, result: &Value) -> String {
    let payload = serde_json::json!({
        "name": name,
        "result": result,
    });
    serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string())
}

fn extract_error_summary(value: &Value) -> Option<String> {
    let summary = value
        .pointer("/error/message")
        .and_then(|v| v.as_str())
        .map(str::to_owned)
        .or_else(|| {
            value
                .get("error")
                .and_then(Value::as_str)
                .map(str::to_owned)
        });

    summary.map(|text| {
        let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
        collapsed.trim().to_string()
    })
}

/// Turn an HTTP error body into a readable block for the transcript.
pub fn format_api_error(error_text: &str) -> String {
    let trimmed = error_text.trim();

    if trimmed.is_empty() {
        return "API Error:\n```\n<empty>\n```".to_string();
    }

    if let Ok(json_value) = serde_json::from_str::<Value>(trimmed) {
        if let Ok(pretty_json) = serde_json::to_string_pretty(&json_value) {
            let summary = extract_error_summary(&json_value).or_else(|| {
                json_value
                    .get("message")
                    .and_then(|v| v.as_str().map(str::to_owned))
            });
            if let Some(summary) = summary.filter(|s| !s.is_empty()) {
                return format!("API Error: {}\n```json\n{}\n```", summary, pretty_json);
            }
            return format!("API Error:\n```json\n{}\n```", pretty_json);
        }
    }

    if trimmed.starts_with('<') && trimmed.ends_with('>') {
        format!("API Error:\n```xml\n{}\n```", trimmed)
    } else {
        format!("API Error:\n```\n{}\n```", trimmed)
    }
}
