use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of the `messages` array sent to the completion endpoint.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn text(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: MessageContent::Text(content.into()),
        }
    }
}

/// Plain text, or a content-parts array when the message carries media.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessageContent::Text(text) => Some(text),
            MessageContent::Parts(_) => None,
        }
    }
}

#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: MediaUrl },
    AudioUrl { audio_url: MediaUrl },
}

#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct MediaUrl {
    pub url: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
pub struct ChatResponseDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ChatResponseChoice {
    #[serde(default)]
    pub delta: ChatResponseDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ChatResponse {
    #[serde(default)]
    pub choices: Vec<ChatResponseChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Token counters as reported by the server. Values are cumulative for the
/// request they belong to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

impl Usage {
    pub fn total(total_tokens: u64) -> Self {
        Self {
            total_tokens: Some(total_tokens),
            ..Self::default()
        }
    }
}

/// Typed frames emitted by the tool-augmented endpoint.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum McpEvent {
    Reasoning {
        #[serde(default)]
        content: String,
    },
    ToolCall {
        #[serde(default)]
        name: String,
        #[serde(default)]
        arguments: Option<Value>,
        #[serde(default)]
        reasoning: Option<String>,
    },
    ToolResult {
        #[serde(default)]
        name: String,
        #[serde(default)]
        result: Option<Value>,
    },
    Status {
        #[serde(default)]
        message: String,
    },
    Assistant {
        #[serde(default)]
        content: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

impl McpEvent {
    pub const KNOWN_TYPES: [&'static str; 6] = [
        "reasoning",
        "tool_call",
        "tool_result",
        "status",
        "assistant",
        "error",
    ];
}
