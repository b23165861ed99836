//! The controller: owns every piece of mutable state and runs the single loop
//! that applies user commands, stream messages and timers to it.

use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::core::chat::{Chat, ChatId};
use crate::core::chat_stream::{CompletionTransport, StreamMessage};
use crate::core::config::Config;
use crate::core::message::{Attachments, Role};
use crate::core::persistence::{Debouncer, Persistence, SaveOutcome, StorageBackend};
use crate::core::requests::{RequestError, RequestManager, RequestOutcome, RequestSettings};
use crate::core::store::{ChatDefaults, ConversationStore, HighlightTracker, StoreObserver};
use crate::utils::logging::TranscriptLog;


#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    UnknownChat(ChatId),
    /// The only remaining chat cannot be deleted.
    LastChat,
    EmptyName,
    Request(RequestError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::UnknownChat(id) => write!(f, "No chat with id {id}"),
            SessionError::LastChat => write!(f, "Cannot delete the last remaining chat"),
            SessionError::EmptyName => write!(f, "Chat name cannot be empty"),
            SessionError::Request(err) => err.fmt(f),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<RequestError> for SessionError {
    fn from(err: RequestError) -> Self {
        SessionError::Request(err)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionTimers {
    pub persist_debounce: Duration,
    pub rate_poll: Duration,
}

impl Default for SessionTimers {
    fn default() -> Self {
        Self {
            persist_debounce: Duration::from_millis(500),
            rate_poll: Duration::from_millis(500),
        }
    }
}

/// Receives what the loop cannot handle on its own.
pub trait SessionDriver {
    type Command;

    fn on_command(&mut self, session: &mut Session, command: Self::Command) -> ControlFlow<()>;

    fn on_outcome(
        &mut self,
        _session: &Session,
        _chat: &ChatId,
        _outcome: &RequestOutcome,
    ) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

pub struct Session {
    store: ConversationStore,
    requests: RequestManager,
    stream_rx: mpsc::UnboundedReceiver<StreamMessage>,
    persistence: Persistence,
    debouncer: Debouncer,
    seen_revision: u64,
    transcript: TranscriptLog,
    pending_prompts: HashMap<ChatId, String>,
    rate_poll: Duration,
}

impl Session {
    /// Build a session, restoring whatever `backend` holds.
    pub fn new(
        transport: Arc<dyn CompletionTransport>,
        backend: Box<dyn StorageBackend>,
        defaults: ChatDefaults,
        settings: RequestSettings,
        timers: SessionTimers,
    ) -> Self {
        let mut store = ConversationStore::new(defaults);
        store.subscribe(Box::new(HighlightTracker::new()));

        let mut persistence = Persistence::new(backend);
        if persistence.restore_into(&mut store) {
            info!(chats = store.chats().len(), "restored saved chats");
        }

        let (requests, stream_rx) = RequestManager::new(transport, settings);
        let seen_revision = store.revision();
        Self {
            store,
            requests,
            stream_rx,
            persistence,
            debouncer: Debouncer::new(timers.persist_debounce),
            seen_revision,
            transcript: TranscriptLog::disabled(),
            pending_prompts: HashMap::new(),
            rate_poll: timers.rate_poll,
        }
    }

    pub fn from_config(
        config: &Config,
        transport: Arc<dyn CompletionTransport>,
        backend: Box<dyn StorageBackend>,
    ) -> Self {
        Self::new(
            transport,
            backend,
            config.chat_defaults(),
            config.request_settings(),
            SessionTimers {
                persist_debounce: config.persist_debounce(),
                rate_poll: config.rate_poll_interval(),
            },
        )
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    pub fn requests(&self) -> &RequestManager {
        &self.requests
    }

    pub fn subscribe(&mut self, observer: Box<dyn StoreObserver>) {
        self.store.subscribe(observer);
    }

    pub fn persistence(&self) -> &Persistence {
        &self.persistence
    }

    pub fn transcript(&self) -> &TranscriptLog {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut TranscriptLog {
        &mut self.transcript
    }

    pub fn set_transcript(&mut self, transcript: TranscriptLog) {
        self.transcript = transcript;
    }

    pub fn active_chat(&self) -> &Chat {
        self.store.active_chat()
    }

    pub fn is_dirty(&self) -> bool {
        self.debouncer.is_dirty()
    }

    // ---- user controls --------------------------------------------------

    /// Send a prompt on the active chat.
    pub fn submit(&mut self, prompt: &str, attachments: Attachments) -> Result<u64, SessionError> {
        let chat = self.store.active_id().clone();
        self.submit_to(&chat, prompt, attachments)
    }

    pub fn submit_to(
        &mut self,
        chat: &ChatId,
        prompt: &str,
        attachments: Attachments,
    ) -> Result<u64, SessionError> {
        let request_id = self
            .requests
            .submit(&mut self.store, chat, prompt, attachments)?;
        self.pending_prompts.insert(chat.clone(), prompt.to_string());
        self.track_changes(Instant::now());
        Ok(request_id)
    }

    /// Cancel the active chat's request. Returns whether one was running.
    pub fn stop(&mut self) -> bool {
        let chat = self.store.active_id().clone();
        let stopped = self.requests.cancel(&mut self.store, &chat);
        if stopped {
            self.pending_prompts.remove(&chat);
            self.track_changes(Instant::now());
        }
        stopped
    }

    pub fn new_chat(&mut self) -> ChatId {
        let defaults = self.store.defaults().clone();
        let id = self
            .store
            .create_chat(defaults.model, defaults.system_prompt, defaults.mcp_mode)
            .id
            .clone();
        self.track_changes(Instant::now());
        id
    }

    pub fn switch_chat(&mut self, chat: &ChatId) -> Result<(), SessionError> {
        if !self.store.switch_chat(chat) {
            return Err(SessionError::UnknownChat(chat.clone()));
        }
        self.track_changes(Instant::now());
        Ok(())
    }

    pub fn delete_chat(&mut self, chat: &ChatId) -> Result<(), SessionError> {
        if !self.store.contains(chat) {
            return Err(SessionError::UnknownChat(chat.clone()));
        }
        if self.store.chats().len() == 1 {
            return Err(SessionError::LastChat);
        }
        self.forget(chat);
        self.store.delete_chat(chat);
        self.track_changes(Instant::now());
        Ok(())
    }

    pub fn rename_chat(&mut self, chat: &ChatId, name: &str) -> Result<(), SessionError> {
        if !self.store.contains(chat) {
            return Err(SessionError::UnknownChat(chat.clone()));
        }
        if !self.store.rename_chat(chat, name) {
            return Err(SessionError::EmptyName);
        }
        self.track_changes(Instant::now());
        Ok(())
    }

    pub fn delete_all(&mut self) -> Vec<ChatId> {
        let removed = self.store.delete_all_chats();
        for chat in &removed {
            self.forget(chat);
        }
        self.track_changes(Instant::now());
        removed
    }

    pub fn delete_older_than(&mut self, days: u32) -> Vec<ChatId> {
        let removed = self.store.delete_chats_older_than(days, Utc::now());
        for chat in &removed {
            self.forget(chat);
        }
        self.track_changes(Instant::now());
        removed
    }

    pub fn set_mcp_mode(&mut self, enabled: bool) {
        let chat = self.store.active_id().clone();
        self.store.set_mcp_mode(&chat, enabled);
        self.track_changes(Instant::now());
    }

    pub fn set_system_prompt(&mut self, prompt: &str) {
        let chat = self.store.active_id().clone();
        self.store.set_system_prompt(&chat, prompt);
        self.track_changes(Instant::now());
    }

    pub fn set_model(&mut self, model: &str) {
        let chat = self.store.active_id().clone();
        self.store.set_model(&chat, model);
        self.track_changes(Instant::now());
    }

    /// Sampling parameters sent with the active chat's requests; `None`
    /// leaves the server default.
    pub fn set_generation_params(
        &mut self,
        temperature: Option<f64>,
        top_p: Option<f64>,
        top_k: Option<f64>,
    ) {
        let chat = self.store.active_id().clone();
        self.store
            .set_generation_params(&chat, temperature, top_p, top_k);
        self.track_changes(Instant::now());
    }

    pub fn set_context_size(&mut self, context_size: Option<u64>) {
        let chat = self.store.active_id().clone();
        self.store.set_context_size(&chat, context_size);
        self.track_changes(Instant::now());
    }

    pub fn clear_history(&mut self) {
        let chat = self.store.active_id().clone();
        self.requests.cancel(&mut self.store, &chat);
        self.pending_prompts.remove(&chat);
        self.store.clear_history(&chat);
        self.track_changes(Instant::now());
    }

    /// Write the store now, dropping any pending debounce.
    pub fn flush(&mut self) -> SaveOutcome {
        self.debouncer.clear();
        self.persistence.save(&self.store)
    }

    fn forget(&mut self, chat: &ChatId) {
        self.requests.forget_chat(chat);
        self.pending_prompts.remove(chat);
    }

    fn track_changes(&mut self, now: Instant) {
        let revision = self.store.revision();
        if revision != self.seen_revision {
            self.seen_revision = revision;
            self.debouncer.mark_dirty(now);
        }
    }

    // ---- event loop -----------------------------------------------------

    /// Apply one stream message; returns the outcome when it ended a request.
    pub fn handle_stream_message(&mut self, message: StreamMessage) -> Option<(ChatId, RequestOutcome)> {
        let chat = message.chat_id.clone();
        let outcome = self.requests.handle_message(&mut self.store, message);
        self.track_changes(Instant::now());
        let outcome = outcome?;
        self.record_turn(&chat, &outcome);
        Some((chat, outcome))
    }

    /// Rate polling for the displayed chat plus the deadline sweep.
    pub fn tick(&mut self, now: Instant) -> Vec<(ChatId, RequestOutcome)> {
        let displayed = self.store.active_id().clone();
        self.requests.poll_rates(&displayed, now);

        let expired = self.requests.check_deadlines(&mut self.store, now);
        self.track_changes(now);
        expired
            .into_iter()
            .map(|chat| {
                self.pending_prompts.remove(&chat);
                (chat, RequestOutcome::TimedOut)
            })
            .collect()
    }

    fn record_turn(&mut self, chat: &ChatId, outcome: &RequestOutcome) {
        let Some(prompt) = self.pending_prompts.remove(chat) else {
            return;
        };
        if *outcome != RequestOutcome::Completed || !self.transcript.is_active() {
            return;
        }
        let Some(chat) = self.store.chat(chat) else {
            return;
        };
        let reply = chat
            .history
            .iter()
            .rev()
            .find(|message| message.role == Role::Assistant && !message.error)
            .map(|message| message.content())
            .unwrap_or_default();
        if let Err(err) = self.transcript.log_turn(&chat.name, &prompt, reply) {
            warn!(error = %err, "failed to write transcript");
        }
    }

    /// Run until the driver breaks or `commands` closes, then flush.
    pub async fn run<D: SessionDriver>(
        &mut self,
        commands: &mut mpsc::UnboundedReceiver<D::Command>,
        driver: &mut D,
    ) {
        let mut rate_tick = time::interval(self.rate_poll);
        rate_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let flush_at = self.debouncer.deadline();
            let flow = tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        let flow = driver.on_command(self, command);
                        self.track_changes(Instant::now());
                        flow
                    }
                    None => ControlFlow::Break(()),
                },
                Some(message) = self.stream_rx.recv() => {
                    match self.handle_stream_message(message) {
                        Some((chat, outcome)) => driver.on_outcome(self, &chat, &outcome),
                        None => ControlFlow::Continue(()),
                    }
                }
                _ = rate_tick.tick() => {
                    let mut flow = ControlFlow::Continue(());
                    for (chat, outcome) in self.tick(Instant::now()) {
                        if driver.on_outcome(self, &chat, &outcome).is_break() {
                            flow = ControlFlow::Break(());
                        }
                    }
                    flow
                }
                _ = sleep_until_opt(flush_at), if flush_at.is_some() => {
                    if self.debouncer.due(Instant::now()) {
                        debug!(revision = self.seen_revision, "debounced save");
                        self.persistence.save(&self.store);
                    }
                    ControlFlow::Continue(())
                }
            };
            if flow.is_break() {
                break;
            }
        }

        if self.debouncer.is_dirty() {
            self.flush();
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
