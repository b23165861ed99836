//! Per-chat request lifecycle: submission, stream event application,
//! cancellation, timeouts and throughput tracking.
//!
//! Every chat has at most one request in flight. Stream tasks never touch the
//! store; they report over the manager's channel and the controller applies
//! their messages here. A message whose request id no longer matches the
//! chat's registered request is a late delivery and is dropped.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::ChatRequest;
use crate::core::chat::ChatId;
use crate::core::chat_stream::{
    spawn_stream, CompletionRequest, CompletionTransport, StreamMessage, StreamMessageKind,
    StreamParams, CHAT_ENDPOINT, MCP_CHAT_ENDPOINT,
};
use crate::core::decoder::{format_tool_call, format_tool_result, StreamEvent};
use crate::core::message::{Attachments, Role};
use crate::core::store::ConversationStore;
use crate::core::thinking::{split_thinking, SegmentSink, ThinkingSplitter};
use crate::utils::url::construct_api_url;

pub const CANCELLED_MESSAGE: &str = "Request cancelled by user";

#[derive(Debug, Clone)]
pub struct RequestSettings {
    pub base_url: String,
    pub request_timeout: Duration,
    pub mcp_request_timeout: Duration,
}

impl Default for RequestSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            request_timeout: Duration::from_secs(30),
            mcp_request_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Sending,
    Streaming,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    Completed,
    Cancelled,
    TimedOut,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    UnknownChat(ChatId),
    EmptyPrompt,
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::UnknownChat(id) => write!(f, "Unknown chat: {id}"),
            RequestError::EmptyPrompt => write!(f, "Nothing to send"),
        }
    }
}

impl std::error::Error for RequestError {}

/// Where the current response is being written. A burst is the run of
/// messages since the last tool message or error.
#[derive(Debug, Default)]
struct ResponseCursor {
    /// History length when the current burst began.
    burst_start: usize,
    /// Assistant message of the current burst.
    assistant_index: Option<usize>,
    /// Raw content of the current burst, tags included.
    raw_assistant: String,
    thinking_index: Option<usize>,
    thinking_text: String,
    pending_visible: String,
}

pub struct ActiveRequest {
    pub request_id: u64,
    cancel: CancellationToken,
    pub phase: RequestPhase,
    pub mcp_mode: bool,
    pub started_at: Instant,
    /// Idle limit; the deadline moves forward whenever the stream reports.
    pub timeout: Duration,
    pub deadline: Instant,
    pub tokens_received: u64,
    pub current_rate: f64,
    pub peak_rate: f64,
    splitter: ThinkingSplitter,
    cursor: ResponseCursor,
}

/// Writes splitter output and decoded events into the store for one chat.
struct StoreWriter<'a> {
    store: &'a mut ConversationStore,
    chat: &'a ChatId,
    cursor: &'a mut ResponseCursor,
    expanded: bool,
}

impl StoreWriter<'_> {
    fn flush_visible(&mut self) {
        if self.cursor.pending_visible.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.cursor.pending_visible);
        if let Some(index) =
            self.store
                .append(Role::Assistant, &text, Attachments::default(), Some(self.chat))
        {
            self.cursor.assistant_index = Some(index);
        }
    }

    /// Place a reasoning-style message before the burst's assistant message,
    /// or at the end when there is none yet.
    fn insert_before_assistant(&mut self, role: Role, content: &str) -> Option<usize> {
        let at = match self.cursor.assistant_index {
            Some(index)
                if self
                    .store
                    .message(self.chat, index)
                    .is_some_and(|message| message.is_assistant()) =>
            {
                index
            }
            _ => usize::MAX,
        };
        let inserted = self
            .store
            .insert_message(self.chat, at, role, content, self.expanded)?;
        if at != usize::MAX {
            self.cursor.assistant_index = Some(inserted + 1);
        }
        Some(inserted)
    }

    fn history_len(&self) -> usize {
        self.store
            .chat(self.chat)
            .map_or(0, |chat| chat.history.len())
    }

    fn end_burst(&mut self) {
        self.cursor.burst_start = self.history_len();
        self.cursor.assistant_index = None;
        self.cursor.raw_assistant.clear();
    }

    fn append_tool(&mut self, role: Role, content: &str) {
        self.flush_visible();
        self.store
            .insert_message(self.chat, usize::MAX, role, content, false);
        self.end_burst();
    }

    fn apply(&mut self, splitter: &mut ThinkingSplitter, event: StreamEvent) {
        match event {
            StreamEvent::Content(text) => {
                self.cursor.raw_assistant.push_str(&text);
                splitter.push(&text, self);
            }
            StreamEvent::Reasoning(text) => {
                self.flush_visible();
                self.insert_before_assistant(Role::Reasoning, &text);
            }
            StreamEvent::ToolCall {
                name,
                arguments,
                reasoning,
            } => {
                let body = format_tool_call(&name, &arguments, reasoning.as_deref());
                self.append_tool(Role::ToolCall, &body);
            }
            StreamEvent::ToolResult { name, result } => {
                let body = format_tool_result(&name, &result);
                self.append_tool(Role::ToolResult, &body);
            }
            StreamEvent::Status(message) => info!(chat = %self.chat, status = %message, "server status"),
            StreamEvent::Error(message) => {
                self.flush_visible();
                self.store.append_error(&message, Some(self.chat));
                self.end_burst();
            }
            StreamEvent::Usage(usage) => {
                self.store.merge_usage(&usage, Some(self.chat));
            }
        }
    }

    /// Repair the burst's assistant message from its raw content when tags
    /// slipped past incremental detection.
    fn backstop(&mut self) {
        let Some(index) = self.cursor.assistant_index else {
            return;
        };
        let split = split_thinking(&self.cursor.raw_assistant);
        if split.thinking.is_empty() {
            return;
        }
        let Some(current) = self.store.message(self.chat, index) else {
            return;
        };
        if !current.is_assistant() {
            return;
        }
        if current.content().trim() != split.regular {
            debug!(chat = %self.chat, "repairing assistant content after stream");
            self.store.update_message(self.chat, index, &split.regular);
        }

        let burst_start = self.cursor.burst_start;
        let already_shown = self.store.chat(self.chat).is_some_and(|chat| {
            chat.history
                .iter()
                .skip(burst_start)
                .any(|m| m.role == Role::Thinking && m.content().trim() == split.thinking)
        });
        if !already_shown {
            self.insert_before_assistant(Role::Thinking, &split.thinking);
        }
    }
}

impl SegmentSink for StoreWriter<'_> {
    fn visible(&mut self, text: &str) {
        self.cursor.pending_visible.push_str(text);
    }

    fn thinking_started(&mut self) {
        self.flush_visible();
        self.cursor.thinking_index = None;
        self.cursor.thinking_text.clear();
    }

    fn thinking(&mut self, text: &str) {
        self.cursor.thinking_text.push_str(text);
        let content = self.cursor.thinking_text.clone();
        let existing = self.cursor.thinking_index.filter(|&index| {
            self.store
                .message(self.chat, index)
                .is_some_and(|message| message.role == Role::Thinking)
        });
        match existing {
            Some(index) => {
                self.store.update_message(self.chat, index, &content);
            }
            None => {
                self.cursor.thinking_index = self.insert_before_assistant(Role::Thinking, &content);
            }
        }
    }

    fn thinking_finished(&mut self) {
        self.cursor.thinking_index = None;
        self.cursor.thinking_text.clear();
    }
}

fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

pub fn timeout_message(mcp_mode: bool, timeout: Duration) -> String {
    if mcp_mode {
        "Request timeout: MCP processing is taking longer than expected. Please try again."
            .to_string()
    } else {
        format!(
            "Request timeout: the server sent nothing for {} seconds. Please try again.",
            timeout.as_secs()
        )
    }
}

pub struct RequestManager {
    transport: Arc<dyn CompletionTransport>,
    settings: RequestSettings,
    tx: mpsc::UnboundedSender<StreamMessage>,
    active: HashMap<ChatId, ActiveRequest>,
    next_request_id: u64,
    peak_rates: HashMap<ChatId, f64>,
    last_outcomes: HashMap<ChatId, RequestOutcome>,
}

impl RequestManager {
    pub fn new(
        transport: Arc<dyn CompletionTransport>,
        settings: RequestSettings,
    ) -> (Self, mpsc::UnboundedReceiver<StreamMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                transport,
                settings,
                tx,
                active: HashMap::new(),
                next_request_id: 0,
                peak_rates: HashMap::new(),
                last_outcomes: HashMap::new(),
            },
            rx,
        )
    }

    pub fn is_active(&self, chat: &ChatId) -> bool {
        self.active.contains_key(chat)
    }

    pub fn active_request(&self, chat: &ChatId) -> Option<&ActiveRequest> {
        self.active.get(chat)
    }

    pub fn last_outcome(&self, chat: &ChatId) -> Option<&RequestOutcome> {
        self.last_outcomes.get(chat)
    }

    /// Send `prompt` on `chat`. An outstanding request on the same chat is
    /// cancelled first. Returns the new request id.
    pub fn submit(
        &mut self,
        store: &mut ConversationStore,
        chat_id: &ChatId,
        prompt: &str,
        attachments: Attachments,
    ) -> Result<u64, RequestError> {
        if !store.contains(chat_id) {
            return Err(RequestError::UnknownChat(chat_id.clone()));
        }
        if prompt.trim().is_empty() && attachments.is_empty() {
            return Err(RequestError::EmptyPrompt);
        }
        if self.is_active(chat_id) {
            self.cancel(store, chat_id);
        }

        store.append(Role::User, prompt, attachments, Some(chat_id));
        store.begin_request_usage(chat_id);

        let Some(chat) = store.chat(chat_id) else {
            return Err(RequestError::UnknownChat(chat_id.clone()));
        };
        let burst_start = chat.history.len();
        let mcp_mode = chat.mcp_mode;
        let body = ChatRequest {
            model: chat.model.clone(),
            messages: store.messages_for_request(chat_id),
            stream: true,
            temperature: chat.temperature,
            top_p: chat.top_p,
            top_k: chat.top_k,
        };
        let path = if mcp_mode {
            MCP_CHAT_ENDPOINT
        } else {
            CHAT_ENDPOINT
        };
        let request = CompletionRequest {
            endpoint: construct_api_url(&self.settings.base_url, path),
            body,
        };
        let timeout = if mcp_mode {
            self.settings.mcp_request_timeout
        } else {
            self.settings.request_timeout
        };

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let cancel = CancellationToken::new();
        let now = Instant::now();

        info!(chat = %chat_id, request_id, endpoint = %request.endpoint, "submitting request");
        spawn_stream(StreamParams {
            transport: Arc::clone(&self.transport),
            request,
            chat_id: chat_id.clone(),
            request_id,
            cancel_token: cancel.clone(),
            timeout,
            tx: self.tx.clone(),
        });

        self.last_outcomes.remove(chat_id);
        self.active.insert(
            chat_id.clone(),
            ActiveRequest {
                request_id,
                cancel,
                phase: RequestPhase::Sending,
                mcp_mode,
                started_at: now,
                timeout,
                deadline: now + timeout,
                tokens_received: 0,
                current_rate: 0.0,
                peak_rate: 0.0,
                splitter: ThinkingSplitter::new(),
                cursor: ResponseCursor {
                    burst_start,
                    ..ResponseCursor::default()
                },
            },
        );
        Ok(request_id)
    }

    /// Apply one message from a stream task. Returns the outcome when the
    /// message ended its request.
    pub fn handle_message(
        &mut self,
        store: &mut ConversationStore,
        message: StreamMessage,
    ) -> Option<RequestOutcome> {
        let StreamMessage {
            chat_id,
            request_id,
            kind,
        } = message;

        let Some(request) = self
            .active
            .get_mut(&chat_id)
            .filter(|request| request.request_id == request_id)
        else {
            debug!(chat = %chat_id, request_id, "discarding late stream message");
            return None;
        };

        match kind {
            StreamMessageKind::Connected => {
                request.phase = RequestPhase::Streaming;
                request.deadline = Instant::now() + request.timeout;
                None
            }
            StreamMessageKind::Events(events) => {
                request.phase = RequestPhase::Streaming;
                request.deadline = Instant::now() + request.timeout;
                let ActiveRequest {
                    splitter,
                    cursor,
                    tokens_received,
                    mcp_mode,
                    ..
                } = request;
                let mut writer = StoreWriter {
                    store,
                    chat: &chat_id,
                    cursor,
                    expanded: !*mcp_mode,
                };
                for event in events {
                    if let StreamEvent::Content(text) = &event {
                        *tokens_received += estimate_tokens(text);
                    }
                    writer.apply(splitter, event);
                }
                writer.flush_visible();
                None
            }
            StreamMessageKind::Finished => {
                self.finish(store, &chat_id, None);
                Some(self.conclude(&chat_id, RequestOutcome::Completed))
            }
            StreamMessageKind::Failed(reason) => {
                self.finish(store, &chat_id, Some(&reason));
                Some(self.conclude(&chat_id, RequestOutcome::Failed(reason)))
            }
            StreamMessageKind::TimedOut => {
                let text = timeout_message(request.mcp_mode, request.timeout);
                self.finish(store, &chat_id, Some(&text));
                Some(self.conclude(&chat_id, RequestOutcome::TimedOut))
            }
        }
    }

    /// Flush held-back text, run the completion backstop on success, and
    /// append `error` when the request ended badly.
    fn finish(&mut self, store: &mut ConversationStore, chat: &ChatId, error: Option<&str>) {
        let Some(request) = self.active.get_mut(chat) else {
            return;
        };
        let ActiveRequest {
            splitter,
            cursor,
            mcp_mode,
            ..
        } = request;
        let mut writer = StoreWriter {
            store,
            chat,
            cursor,
            expanded: !*mcp_mode,
        };
        splitter.finish(&mut writer);
        writer.flush_visible();
        match error {
            None => writer.backstop(),
            Some(text) => {
                writer.store.append_error(text, Some(chat));
            }
        }
    }

    fn conclude(&mut self, chat: &ChatId, outcome: RequestOutcome) -> RequestOutcome {
        if let Some(request) = self.active.remove(chat) {
            request.cancel.cancel();
            if request.peak_rate > 0.0 {
                self.peak_rates.insert(chat.clone(), request.peak_rate);
            }
            info!(chat = %chat, request_id = request.request_id, ?outcome, "request finished");
        }
        self.last_outcomes.insert(chat.clone(), outcome.clone());
        outcome
    }

    /// Stop the chat's request on user demand. Returns whether one was active.
    pub fn cancel(&mut self, store: &mut ConversationStore, chat: &ChatId) -> bool {
        let Some(request) = self.active.get(chat) else {
            return false;
        };
        request.cancel.cancel();
        self.finish(store, chat, Some(CANCELLED_MESSAGE));
        self.conclude(chat, RequestOutcome::Cancelled);
        true
    }

    /// Drop a chat's request without writing anything, used when the chat
    /// itself is going away.
    pub fn forget_chat(&mut self, chat: &ChatId) {
        if let Some(request) = self.active.remove(chat) {
            request.cancel.cancel();
            debug!(chat = %chat, request_id = request.request_id, "forgot request of deleted chat");
        }
        self.peak_rates.remove(chat);
        self.last_outcomes.remove(chat);
    }

    /// Time out requests that have been silent past their idle deadline. The
    /// transport enforces the same limit; this catches tasks that never got
    /// to report.
    pub fn check_deadlines(&mut self, store: &mut ConversationStore, now: Instant) -> Vec<ChatId> {
        let expired: Vec<ChatId> = self
            .active
            .iter()
            .filter(|(_, request)| request.deadline <= now)
            .map(|(chat, _)| chat.clone())
            .collect();
        for chat in &expired {
            if let Some(request) = self.active.get(chat) {
                warn!(chat = %chat, request_id = request.request_id, "request deadline passed");
                request.cancel.cancel();
                let text = timeout_message(request.mcp_mode, request.timeout);
                self.finish(store, chat, Some(&text));
                self.conclude(chat, RequestOutcome::TimedOut);
            }
        }
        expired
    }

    /// Recompute throughput for the displayed chat only.
    pub fn poll_rates(&mut self, displayed: &ChatId, now: Instant) {
        let Some(request) = self.active.get_mut(displayed) else {
            return;
        };
        let elapsed = now.saturating_duration_since(request.started_at).as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        request.current_rate = request.tokens_received as f64 / elapsed;
        if request.current_rate > request.peak_rate {
            request.peak_rate = request.current_rate;
        }
    }

    /// Live rate while the chat streams, otherwise its last recorded peak.
    pub fn rate_display(&self, chat: &ChatId) -> Option<f64> {
        match self.active.get(chat) {
            Some(request) => Some(request.current_rate),
            None => self.peak_rates.get(chat).copied(),
        }
    }
}

#[cfg(test)]
mod tests;
