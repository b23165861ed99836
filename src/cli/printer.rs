//! Live terminal output of streamed replies.

use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::chat::{Chat, ChatId};
use crate::core::message::Role;
use crate::core::store::{StoreEvent, StoreObserver};

/// Set while a reply line is open on the terminal. Whoever prints next ends
/// the line first.
#[derive(Debug, Clone, Default)]
pub struct OpenLine(Arc<AtomicBool>);

impl OpenLine {
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }

    fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

struct Streaming {
    index: usize,
    printed: usize,
}

/// Prints assistant text as it grows, plus one-line notices for thinking,
/// tool traffic and errors.
pub struct StreamPrinter<W: Write + Send> {
    out: W,
    open_line: OpenLine,
    streaming: HashMap<ChatId, Streaming>,
    last_chat: Option<ChatId>,
    headers: bool,
}

impl<W: Write + Send> StreamPrinter<W> {
    pub fn new(out: W, open_line: OpenLine) -> Self {
        Self {
            out,
            open_line,
            streaming: HashMap::new(),
            last_chat: None,
            headers: true,
        }
    }

    /// Skip the `[chat name]` lines, for single-chat output.
    pub fn without_headers(mut self) -> Self {
        self.headers = false;
        self
    }

    fn begin_block(&mut self, chat: &Chat) {
        if self.open_line.take() {
            let _ = writeln!(self.out);
        }
        if self.headers && self.last_chat.as_ref() != Some(&chat.id) {
            let _ = writeln!(self.out, "[{}]", chat.name);
        }
        self.last_chat = Some(chat.id.clone());
    }

    fn notice(&mut self, chat: &Chat, text: &str) {
        self.begin_block(chat);
        let _ = writeln!(self.out, "{text}");
    }

    fn stream(&mut self, chat: &Chat, index: usize, content: &str) {
        let continuing = self
            .streaming
            .get(&chat.id)
            .is_some_and(|s| s.index == index);
        if !continuing {
            self.begin_block(chat);
            self.streaming.insert(chat.id.clone(), Streaming { index, printed: 0 });
        }
        let Some(state) = self.streaming.get_mut(&chat.id) else {
            return;
        };
        if let Some(delta) = content.get(state.printed..) {
            let _ = write!(self.out, "{delta}");
        }
        state.printed = content.len();
        self.open_line.set();
    }

    /// Keep the tracked index in step with insertions above it.
    fn shift_for_insert(&mut self, chat: &ChatId, index: usize) {
        if let Some(state) = self.streaming.get_mut(chat) {
            if index <= state.index {
                state.index += 1;
            }
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

impl<W: Write + Send> StoreObserver for StreamPrinter<W> {
    fn on_event(&mut self, event: &StoreEvent, chat: Option<&Chat>) {
        let (appended, index) = match event {
            StoreEvent::MessageAppended { index, .. } => (true, *index),
            StoreEvent::MessageUpdated { index, .. } => (false, *index),
            _ => return,
        };
        let Some(chat) = chat else {
            return;
        };
        let Some(message) = chat.history.get(index) else {
            return;
        };

        match message.role {
            Role::User => {
                self.streaming.remove(&chat.id);
            }
            Role::Assistant if message.error => {
                self.notice(chat, &format!("❌ {}", message.content()));
            }
            Role::Assistant => self.stream(chat, index, message.content()),
            role if appended => {
                self.shift_for_insert(&chat.id, index);
                let text = match role {
                    Role::ToolCall => format!("🔧 {}", first_line(message.content())),
                    Role::ToolResult => format!("📎 {}", first_line(message.content())),
                    _ => "💭 thinking…".to_string(),
                };
                self.notice(chat, &text);
            }
            _ => {}
        }
        let _ = self.out.flush();
    }
}
