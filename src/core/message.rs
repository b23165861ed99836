use serde::{Deserialize, Serialize};

use crate::core::render::MarkupRenderer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Role {
    User,
    Assistant,
    Thinking,
    Reasoning,
    ToolCall,
    ToolResult,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Thinking => "thinking",
            Role::Reasoning => "reasoning",
            Role::ToolCall => "tool_call",
            Role::ToolResult => "tool_result",
        }
    }

    /// Role name sent to the completion endpoint, if the role is transmitted.
    pub fn to_api_role(self) -> Option<&'static str> {
        match self {
            Role::User => Some("user"),
            Role::Assistant => Some("assistant"),
            _ => None,
        }
    }

    /// Reasoning traces belong to one turn and never merge with neighbours.
    pub fn is_reasoning(self) -> bool {
        matches!(self, Role::Thinking | Role::Reasoning)
    }
}

impl AsRef<str> for Role {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl PartialEq<&str> for Role {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl TryFrom<&str> for Role {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "thinking" => Ok(Role::Thinking),
            "reasoning" => Ok(Role::Reasoning),
            "tool_call" => Ok(Role::ToolCall),
            "tool_result" => Ok(Role::ToolResult),
            _ => Err(format!("invalid message role: {value}")),
        }
    }
}

impl TryFrom<String> for Role {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::try_from(value.as_str())
    }
}

impl From<Role> for String {
    fn from(value: Role) -> Self {
        value.as_str().to_string()
    }
}

/// Media attached to a message, as data URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachments {
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub audios: Vec<String>,
}

impl Attachments {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.audios.is_empty()
    }

    pub fn extend(&mut self, other: Attachments) {
        self.images.extend(other.images);
        self.audios.extend(other.audios);
    }
}

/// A transcript entry.
///
/// `content` is the source of truth; `rendered` is always derived from it and
/// is never persisted. Both are private so that every edit goes through
/// [`Message::set_content`] and keeps them in step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    content: String,
    #[serde(skip)]
    rendered: String,
    #[serde(default, skip_serializing_if = "Attachments::is_empty")]
    pub attachments: Attachments,
    /// Presentation hint for thinking/reasoning messages.
    #[serde(default)]
    pub expanded: bool,
    /// Error-flavored assistant message. Shown to the user, never sent back
    /// to the model.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub error: bool,
}

impl Message {
    pub fn new(
        role: Role,
        content: impl Into<String>,
        attachments: Attachments,
        renderer: &dyn MarkupRenderer,
    ) -> Self {
        let content = content.into();
        let rendered = renderer.render(&content);
        Self {
            role,
            content,
            rendered,
            attachments,
            expanded: false,
            error: false,
        }
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn rendered(&self) -> &str {
        &self.rendered
    }

    pub(crate) fn set_content(&mut self, content: String, renderer: &dyn MarkupRenderer) {
        self.rendered = renderer.render(&content);
        self.content = content;
    }

    pub(crate) fn push_content(&mut self, more: &str, renderer: &dyn MarkupRenderer) {
        self.content.push_str(more);
        self.rendered = renderer.render(&self.content);
    }

    /// Re-derive markup after deserialization.
    pub(crate) fn rerender(&mut self, renderer: &dyn MarkupRenderer) {
        self.rendered = renderer.render(&self.content);
    }

    pub fn is_user(&self) -> bool {
        self.role == Role::User
    }

    pub fn is_assistant(&self) -> bool {
        self.role == Role::Assistant
    }
}
