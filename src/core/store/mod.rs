//! The authoritative in-memory model of every chat.
//!
//! All structural edits go through [`ConversationStore`] so that derived state
//! (rendered markup, display names, timestamps, the persistence revision)
//! stays consistent. Interested parties subscribe with a [`StoreObserver`]
//! instead of the store reaching out to any presentation layer.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::api::{ChatMessage, ContentPart, MediaUrl, MessageContent, Usage};
use crate::core::chat::{derive_chat_name, Chat, ChatId, TokenUsage};
use crate::core::message::{Attachments, Message, Role};
use crate::core::render::{code_block_languages, MarkdownRenderer, MarkupRenderer};
use crate::utils::syntax::{ensure_language, LanguageLoad};


#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A message was added (or merged into the last one). Renderers scroll to
    /// the bottom on this event.
    MessageAppended { chat: ChatId, index: usize },
    /// An existing message's content was replaced in place.
    MessageUpdated { chat: ChatId, index: usize },
    UsageUpdated { chat: ChatId, usage: TokenUsage },
    /// Chats were created, removed, renamed, reconfigured or refocused. Message
    /// and usage edits are reported by their own variants; all of them bump
    /// [`ConversationStore::revision`].
    Changed,
}

impl StoreEvent {
    pub fn chat_id(&self) -> Option<&ChatId> {
        match self {
            StoreEvent::MessageAppended { chat, .. }
            | StoreEvent::MessageUpdated { chat, .. }
            | StoreEvent::UsageUpdated { chat, .. } => Some(chat),
            StoreEvent::Changed => None,
        }
    }
}

pub trait StoreObserver: Send {
    /// Called after the mutation is applied. `chat` is the affected chat when
    /// the event names one.
    fn on_event(&mut self, event: &StoreEvent, chat: Option<&Chat>);
}

/// Resolves the languages of newly rendered code blocks so highlighting can
/// run after insertion. Each language is resolved once per process.
#[derive(Debug, Default)]
pub struct HighlightTracker;

impl HighlightTracker {
    pub fn new() -> Self {
        Self
    }
}

impl StoreObserver for HighlightTracker {
    fn on_event(&mut self, event: &StoreEvent, chat: Option<&Chat>) {
        let index = match event {
            StoreEvent::MessageAppended { index, .. } | StoreEvent::MessageUpdated { index, .. } => {
                *index
            }
            _ => return,
        };
        let Some(message) = chat.and_then(|chat| chat.history.get(index)) else {
            return;
        };
        for lang in code_block_languages(message.content()) {
            match ensure_language(&lang) {
                LanguageLoad::Loaded => debug!(lang = %lang, "loaded highlighter grammar"),
                LanguageLoad::Unknown => debug!(lang = %lang, "no grammar for language"),
                LanguageLoad::AlreadyResolved => {}
            }
        }
    }
}

/// Settings applied to chats the store creates on its own (the initial chat
/// and replacements after deletion).
#[derive(Debug, Clone, Default)]
pub struct ChatDefaults {
    pub model: String,
    pub system_prompt: String,
    pub mcp_mode: bool,
}

pub struct ConversationStore {
    chats: Vec<Chat>,
    active: ChatId,
    defaults: ChatDefaults,
    renderer: Box<dyn MarkupRenderer>,
    observers: Vec<Box<dyn StoreObserver>>,
    revision: u64,
}

impl ConversationStore {
    pub fn new(defaults: ChatDefaults) -> Self {
        Self::with_renderer(defaults, Box::new(MarkdownRenderer))
    }

    pub fn with_renderer(defaults: ChatDefaults, renderer: Box<dyn MarkupRenderer>) -> Self {
        let first = Self::default_chat(&defaults);
        let active = first.id.clone();
        Self {
            chats: vec![first],
            active,
            defaults,
            renderer,
            observers: Vec::new(),
            revision: 0,
        }
    }

    fn default_chat(defaults: &ChatDefaults) -> Chat {
        let now = Utc::now();
        Chat::new(
            ChatId::generate(now),
            defaults.model.clone(),
            defaults.system_prompt.clone(),
            defaults.mcp_mode,
            now,
        )
    }

    pub fn subscribe(&mut self, observer: Box<dyn StoreObserver>) {
        self.observers.push(observer);
    }

    /// Monotonic counter bumped on every mutation.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn defaults(&self) -> &ChatDefaults {
        &self.defaults
    }

    fn emit(&mut self, event: StoreEvent) {
        self.revision += 1;
        let mut observers = std::mem::take(&mut self.observers);
        let chat = event
            .chat_id()
            .and_then(|id| self.chats.iter().find(|chat| &chat.id == id));
        for observer in observers.iter_mut() {
            observer.on_event(&event, chat);
        }
        self.observers = observers;
    }

    // ---- lookup -------------------------------------------------------------

    pub fn chats(&self) -> &[Chat] {
        &self.chats
    }

    pub fn chat(&self, id: &ChatId) -> Option<&Chat> {
        self.chats.iter().find(|chat| &chat.id == id)
    }

    fn chat_mut(&mut self, id: &ChatId) -> Option<&mut Chat> {
        self.chats.iter_mut().find(|chat| &chat.id == id)
    }

    pub fn contains(&self, id: &ChatId) -> bool {
        self.chat(id).is_some()
    }

    pub fn active_id(&self) -> &ChatId {
        &self.active
    }

    pub fn active_chat(&self) -> &Chat {
        self.chat(&self.active).unwrap_or(&self.chats[0])
    }

    /// Chats ordered by most recent activity first.
    pub fn chats_by_recency(&self) -> Vec<&Chat> {
        let mut chats: Vec<&Chat> = self.chats.iter().collect();
        chats.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        chats
    }

    fn resolve_target(&self, target: Option<&ChatId>) -> ChatId {
        target.cloned().unwrap_or_else(|| self.active.clone())
    }

    // ---- chat lifecycle -----------------------------------------------------

    pub fn create_chat(
        &mut self,
        model: impl Into<String>,
        system_prompt: impl Into<String>,
        mcp_mode: bool,
    ) -> &Chat {
        let now = Utc::now();
        let chat = Chat::new(ChatId::generate(now), model, system_prompt, mcp_mode, now);
        let id = chat.id.clone();
        self.chats.push(chat);
        self.active = id;
        self.emit(StoreEvent::Changed);
        self.active_chat()
    }

    pub fn switch_chat(&mut self, id: &ChatId) -> bool {
        if !self.contains(id) {
            return false;
        }
        if &self.active != id {
            self.active = id.clone();
            self.emit(StoreEvent::Changed);
        }
        true
    }

    /// Remove a chat. When it was active another chat takes focus; when it was
    /// the last one a fresh default chat replaces it.
    pub fn delete_chat(&mut self, id: &ChatId) -> bool {
        let Some(position) = self.chats.iter().position(|chat| &chat.id == id) else {
            return false;
        };
        self.chats.remove(position);

        if self.chats.is_empty() {
            let replacement = Self::default_chat(&self.defaults);
            self.active = replacement.id.clone();
            self.chats.push(replacement);
        } else if &self.active == id {
            let next = position.min(self.chats.len() - 1);
            self.active = self.chats[next].id.clone();
        }
        self.emit(StoreEvent::Changed);
        true
    }

    /// Remove every chat, leaving one fresh default chat. Returns the ids that
    /// were removed.
    pub fn delete_all_chats(&mut self) -> Vec<ChatId> {
        let removed: Vec<ChatId> = self.chats.drain(..).map(|chat| chat.id).collect();
        let replacement = Self::default_chat(&self.defaults);
        self.active = replacement.id.clone();
        self.chats.push(replacement);
        self.emit(StoreEvent::Changed);
        removed
    }

    /// Remove chats whose last activity is more than `days` days before `now`.
    pub fn delete_chats_older_than(&mut self, days: u32, now: DateTime<Utc>) -> Vec<ChatId> {
        let cutoff = now - Duration::days(i64::from(days));
        let removed: Vec<ChatId> = self
            .chats
            .iter()
            .filter(|chat| chat.updated_at < cutoff)
            .map(|chat| chat.id.clone())
            .collect();
        if removed.is_empty() {
            return removed;
        }

        self.chats.retain(|chat| chat.updated_at >= cutoff);
        if self.chats.is_empty() {
            let replacement = Self::default_chat(&self.defaults);
            self.chats.push(replacement);
        }
        if !self.chats.iter().any(|chat| chat.id == self.active) {
            self.active = self.chats_by_recency()[0].id.clone();
        }
        self.emit(StoreEvent::Changed);
        removed
    }

    pub fn rename_chat(&mut self, id: &ChatId, name: &str) -> bool {
        let name = name.trim();
        if name.is_empty() {
            return false;
        }
        let Some(chat) = self.chat_mut(id) else {
            return false;
        };
        chat.name = name.to_string();
        chat.updated_at = Utc::now();
        self.emit(StoreEvent::Changed);
        true
    }

    fn configure(&mut self, id: &ChatId, apply: impl FnOnce(&mut Chat)) -> bool {
        let Some(chat) = self.chat_mut(id) else {
            return false;
        };
        apply(chat);
        chat.updated_at = Utc::now();
        self.emit(StoreEvent::Changed);
        true
    }

    pub fn set_model(&mut self, id: &ChatId, model: &str) -> bool {
        self.configure(id, |chat| chat.model = model.to_string())
    }

    pub fn set_system_prompt(&mut self, id: &ChatId, prompt: &str) -> bool {
        self.configure(id, |chat| chat.system_prompt = prompt.to_string())
    }

    pub fn set_mcp_mode(&mut self, id: &ChatId, enabled: bool) -> bool {
        self.configure(id, |chat| chat.mcp_mode = enabled)
    }

    pub fn set_generation_params(
        &mut self,
        id: &ChatId,
        temperature: Option<f64>,
        top_p: Option<f64>,
        top_k: Option<f64>,
    ) -> bool {
        self.configure(id, |chat| {
            chat.temperature = temperature;
            chat.top_p = top_p;
            chat.top_k = top_k;
        })
    }

    pub fn set_context_size(&mut self, id: &ChatId, context_size: Option<u64>) -> bool {
        self.configure(id, |chat| chat.context_size = context_size)
    }

    /// Drop a chat's history and usage counters, keeping its settings.
    pub fn clear_history(&mut self, id: &ChatId) -> bool {
        self.configure(id, |chat| {
            chat.history.clear();
            chat.token_usage = TokenUsage::default();
        })
    }

    // ---- messages -----------------------------------------------------------

    /// Append content to a chat, merging into the last message when it has the
    /// same role. Thinking and reasoning content always starts a new message.
    /// Returns the index of the message that now holds the content.
    pub fn append(
        &mut self,
        role: Role,
        content: &str,
        attachments: Attachments,
        target: Option<&ChatId>,
    ) -> Option<usize> {
        let id = self.resolve_target(target);
        let renderer = &*self.renderer;
        let chat = self.chats.iter_mut().find(|chat| chat.id == id)?;

        let merge = !role.is_reasoning()
            && chat
                .history
                .last()
                .is_some_and(|last| last.role == role && !last.error);

        let index = if merge {
            let index = chat.history.len() - 1;
            let last = &mut chat.history[index];
            last.push_content(content, renderer);
            last.attachments.extend(attachments);
            index
        } else {
            let mut message = Message::new(role, content, attachments, renderer);
            if role.is_reasoning() {
                message.expanded = !chat.mcp_mode;
            }
            chat.history.push(message);
            chat.history.len() - 1
        };

        if role == Role::User && chat.has_placeholder_name() && !content.trim().is_empty() {
            chat.name = derive_chat_name(content);
        }
        chat.updated_at = Utc::now();

        self.emit(StoreEvent::MessageAppended { chat: id, index });
        Some(index)
    }

    /// Append an error-flavored assistant message. It never merges with
    /// neighbours and is not sent back to the model.
    pub fn append_error(&mut self, content: &str, target: Option<&ChatId>) -> Option<usize> {
        let id = self.resolve_target(target);
        let renderer = &*self.renderer;
        let chat = self.chats.iter_mut().find(|chat| chat.id == id)?;
        let mut message = Message::new(Role::Assistant, content, Attachments::default(), renderer);
        message.error = true;
        chat.history.push(message);
        chat.updated_at = Utc::now();
        let index = chat.history.len() - 1;
        self.emit(StoreEvent::MessageAppended { chat: id, index });
        Some(index)
    }

    /// Insert a new message at `index` (clamped to the history length).
    pub fn insert_message(
        &mut self,
        id: &ChatId,
        index: usize,
        role: Role,
        content: &str,
        expanded: bool,
    ) -> Option<usize> {
        let renderer = &*self.renderer;
        let chat = self.chats.iter_mut().find(|chat| &chat.id == id)?;
        let index = index.min(chat.history.len());
        let mut message = Message::new(role, content, Attachments::default(), renderer);
        message.expanded = expanded;
        chat.history.insert(index, message);
        chat.updated_at = Utc::now();
        self.emit(StoreEvent::MessageAppended {
            chat: id.clone(),
            index,
        });
        Some(index)
    }

    /// Replace the content of an existing message in place.
    pub fn update_message(&mut self, id: &ChatId, index: usize, content: &str) -> bool {
        let renderer = &*self.renderer;
        let Some(chat) = self.chats.iter_mut().find(|chat| &chat.id == id) else {
            return false;
        };
        let Some(message) = chat.history.get_mut(index) else {
            return false;
        };
        message.set_content(content.to_string(), renderer);
        chat.updated_at = Utc::now();
        self.emit(StoreEvent::MessageUpdated {
            chat: id.clone(),
            index,
        });
        true
    }

    pub fn message(&self, id: &ChatId, index: usize) -> Option<&Message> {
        self.chat(id).and_then(|chat| chat.history.get(index))
    }

    // ---- usage --------------------------------------------------------------

    pub fn merge_usage(&mut self, usage: &Usage, target: Option<&ChatId>) -> bool {
        let id = self.resolve_target(target);
        let Some(chat) = self.chat_mut(&id) else {
            return false;
        };
        if !chat.token_usage.merge(usage) {
            debug!(chat = %id, "ignoring stale usage report");
            return false;
        }
        let snapshot = chat.token_usage.clone();
        self.emit(StoreEvent::UsageUpdated {
            chat: id,
            usage: snapshot,
        });
        true
    }

    pub fn begin_request_usage(&mut self, id: &ChatId) {
        if let Some(chat) = self.chat_mut(id) {
            chat.token_usage.begin_request();
        }
    }

    // ---- request projection -------------------------------------------------

    /// Project a chat into the `messages` array for the completion endpoint.
    /// Presentation-only entries (reasoning traces, tool transcripts, error
    /// notices) are dropped; media attachments become content parts.
    pub fn messages_for_request(&self, id: &ChatId) -> Vec<ChatMessage> {
        let Some(chat) = self.chat(id) else {
            return Vec::new();
        };

        let mut messages = Vec::with_capacity(chat.history.len() + 1);
        if !chat.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::text("system", chat.system_prompt.clone()));
        }

        for message in &chat.history {
            if message.error {
                continue;
            }
            let Some(role) = message.role.to_api_role() else {
                continue;
            };
            let content = if message.attachments.is_empty() {
                MessageContent::Text(message.content().to_string())
            } else {
                let mut parts = vec![ContentPart::Text {
                    text: message.content().to_string(),
                }];
                parts.extend(message.attachments.images.iter().map(|url| {
                    ContentPart::ImageUrl {
                        image_url: MediaUrl { url: url.clone() },
                    }
                }));
                parts.extend(message.attachments.audios.iter().map(|url| {
                    ContentPart::AudioUrl {
                        audio_url: MediaUrl { url: url.clone() },
                    }
                }));
                MessageContent::Parts(parts)
            };
            messages.push(ChatMessage {
                role: role.to_string(),
                content,
            });
        }
        messages
    }

    // ---- persistence hooks --------------------------------------------------

    /// Replace all chats with restored ones. Rendered markup is re-derived.
    pub fn restore(&mut self, mut chats: Vec<Chat>, active: Option<ChatId>) {
        if chats.is_empty() {
            return;
        }
        let renderer = &*self.renderer;
        for chat in chats.iter_mut() {
            for message in chat.history.iter_mut() {
                message.rerender(renderer);
            }
        }
        self.chats = chats;
        self.active = match active {
            Some(id) if self.contains(&id) => id,
            _ => self.chats_by_recency()[0].id.clone(),
        };
        self.emit(StoreEvent::Changed);
    }
}
