use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::Usage;
use crate::core::message::Message;

pub const PLACEHOLDER_CHAT_NAME: &str = "New Chat";

/// Opaque chat identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn generate(now: DateTime<Utc>) -> Self {
        let mut bytes = [0u8; 6];
        // Without entropy, a process-wide counter keeps ids distinct.
        if getrandom::fill(&mut bytes).is_err() {
            use std::sync::atomic::{AtomicU64, Ordering};
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            bytes.copy_from_slice(&n.to_le_bytes()[..6]);
        }
        let suffix: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        Self(format!("chat_{}_{}", now.timestamp_millis(), suffix))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ChatId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ChatId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Latest server-reported usage for the request in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    #[serde(default)]
    pub current_request: Option<UsageSnapshot>,
}

impl TokenUsage {
    /// Fold a cumulative usage report into the running totals.
    ///
    /// A report is applied only when at least one counter it carries is
    /// strictly larger than the snapshot for the current request; anything
    /// else is a stale or duplicate event. Returns whether totals changed.
    pub fn merge(&mut self, usage: &Usage) -> bool {
        let previous = self.current_request.unwrap_or_default();
        let grew = |reported: Option<u64>, seen: u64| reported.is_some_and(|value| value > seen);
        let is_new = grew(usage.prompt_tokens, previous.prompt_tokens)
            || grew(usage.completion_tokens, previous.completion_tokens)
            || grew(usage.total_tokens, previous.total_tokens);
        if !is_new {
            return false;
        }

        let next = UsageSnapshot {
            prompt_tokens: usage.prompt_tokens.unwrap_or(0),
            completion_tokens: usage.completion_tokens.unwrap_or(0),
            total_tokens: usage.total_tokens.unwrap_or(0),
        };
        self.prompt_tokens = (self.prompt_tokens + next.prompt_tokens).saturating_sub(previous.prompt_tokens);
        self.completion_tokens =
            (self.completion_tokens + next.completion_tokens).saturating_sub(previous.completion_tokens);
        self.total_tokens = (self.total_tokens + next.total_tokens).saturating_sub(previous.total_tokens);
        self.current_request = Some(next);
        true
    }

    /// Start accounting for a new request.
    pub fn begin_request(&mut self) {
        self.current_request = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: ChatId,
    pub name: String,
    pub model: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub mcp_mode: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_k: Option<f64>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_size: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Chat {
    pub fn new(
        id: ChatId,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        mcp_mode: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            name: PLACEHOLDER_CHAT_NAME.to_string(),
            model: model.into(),
            history: Vec::new(),
            system_prompt: system_prompt.into(),
            mcp_mode,
            temperature: None,
            top_p: None,
            top_k: None,
            token_usage: TokenUsage::default(),
            context_size: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_placeholder_name(&self) -> bool {
        self.name == PLACEHOLDER_CHAT_NAME
    }

    pub fn remaining_tokens(&self) -> Option<u64> {
        self.context_size
            .map(|size| size.saturating_sub(self.token_usage.total_tokens))
    }

    pub fn context_usage_percent(&self) -> Option<f64> {
        self.context_size.filter(|size| *size > 0).map(|size| {
            (self.token_usage.total_tokens as f64 / size as f64 * 100.0).min(100.0)
        })
    }
}

const CHAT_NAME_MAX_CHARS: usize = 50;

/// Display name derived from the first user message.
pub fn derive_chat_name(content: &str) -> String {
    let trimmed = content.trim();
    if trimmed.chars().count() <= CHAT_NAME_MAX_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(CHAT_NAME_MAX_CHARS).collect();
    format!("{}...", cut.trim_end())
}
