//! Line-oriented chat loop.

use std::io::Write;
use std::ops::ControlFlow;
use std::path::PathBuf;

use crate::cli::attach::PendingAttachments;
use crate::cli::printer::OpenLine;
use crate::core::chat::{Chat, ChatId};
use crate::core::requests::RequestOutcome;
use crate::core::session::{Session, SessionDriver};
use crate::utils::logging::dump_chat;

const HELP: &str = "\
Commands:
  /new                 Start a new chat
  /chats               List chats, most recent first
  /switch <n|id>       Focus another chat
  /delete [n|id]       Delete a chat (default: the current one)
  /rename <name>       Rename the current chat
  /stop                Cancel the current chat's request
  /mcp [on|off]        Toggle tool-augmented mode for the current chat
  /system [prompt]     Show or set the system prompt
  /model [name]        Show or set the model
  /params [k=v ...]    Show or set temperature, top_p and top_k (/params reset)
  /context <n|off>     Set the current chat's context window in tokens
  /attach <file>       Attach an image, audio or text file to the next prompt
  /purge [days]        Delete chats idle for more than <days>, or all chats
  /clear               Clear the current chat's history
  /usage               Token usage and throughput
  /log [file]          Start or pause the transcript
  /dump <file>         Write the current chat to a text file
  /quit                Save and exit";

const PARAMS_USAGE: &str = "Usage: /params [reset | temperature=<0-2> top_p=<0-1> top_k=<n>]";

/// One sampling parameter assignment from `/params`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampling {
    Temperature(f64),
    TopP(f64),
    TopK(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Prompt(String),
    New,
    Chats,
    Switch(String),
    Delete(Option<String>),
    Rename(String),
    Stop,
    Mcp(Option<bool>),
    System(Option<String>),
    Model(Option<String>),
    /// Empty shows the current values.
    Params(Vec<Sampling>),
    ResetParams,
    Context(Option<u64>),
    Attach(PathBuf),
    Purge(Option<u32>),
    Clear,
    Usage,
    Log(Option<PathBuf>),
    Dump(PathBuf),
    Help,
    Quit,
    Empty,
    Invalid(String),
}

fn parse_sampling(assignment: &str) -> Option<Sampling> {
    let (key, value) = assignment.split_once('=')?;
    let value: f64 = value.trim().parse().ok().filter(|v: &f64| v.is_finite())?;
    match key.trim() {
        "temperature" | "temp" if (0.0..=2.0).contains(&value) => Some(Sampling::Temperature(value)),
        "top_p" | "top-p" if (0.0..=1.0).contains(&value) => Some(Sampling::TopP(value)),
        "top_k" | "top-k" if value >= 1.0 && value.fract() == 0.0 => Some(Sampling::TopK(value)),
        _ => None,
    }
}

fn parse_params(rest: Option<String>) -> ReplCommand {
    let Some(rest) = rest else {
        return ReplCommand::Params(Vec::new());
    };
    if rest == "reset" {
        return ReplCommand::ResetParams;
    }
    match rest
        .split_whitespace()
        .map(parse_sampling)
        .collect::<Option<Vec<_>>>()
    {
        Some(updates) => ReplCommand::Params(updates),
        None => ReplCommand::Invalid(PARAMS_USAGE.to_string()),
    }
}

fn rest_arg(rest: &str) -> Option<String> {
    let rest = rest.trim();
    (!rest.is_empty()).then(|| rest.to_string())
}

pub fn parse_line(line: &str) -> ReplCommand {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(command) = trimmed.strip_prefix('/') else {
        return ReplCommand::Prompt(line.trim_end().to_string());
    };

    let (name, rest) = command.split_once(char::is_whitespace).unwrap_or((command, ""));
    let arg = rest_arg(rest);
    match (name, arg) {
        ("new", _) => ReplCommand::New,
        ("chats", _) => ReplCommand::Chats,
        ("switch", Some(target)) => ReplCommand::Switch(target),
        ("delete", target) => ReplCommand::Delete(target),
        ("rename", Some(name)) => ReplCommand::Rename(name),
        ("stop", _) => ReplCommand::Stop,
        ("mcp", None) => ReplCommand::Mcp(None),
        ("mcp", Some(value)) => match value.as_str() {
            "on" => ReplCommand::Mcp(Some(true)),
            "off" => ReplCommand::Mcp(Some(false)),
            _ => ReplCommand::Invalid("Usage: /mcp [on|off]".to_string()),
        },
        ("system", prompt) => ReplCommand::System(prompt),
        ("model", model) => ReplCommand::Model(model),
        ("params", rest) => parse_params(rest),
        ("context", Some(size)) => match size.as_str() {
            "off" => ReplCommand::Context(None),
            _ => match size.parse::<u64>() {
                Ok(n) if n > 0 => ReplCommand::Context(Some(n)),
                _ => ReplCommand::Invalid("Usage: /context <tokens|off>".to_string()),
            },
        },
        ("attach", Some(path)) => ReplCommand::Attach(PathBuf::from(path)),
        ("purge", None) => ReplCommand::Purge(None),
        ("purge", Some(days)) => match days.parse() {
            Ok(days) => ReplCommand::Purge(Some(days)),
            Err(_) => ReplCommand::Invalid("Usage: /purge [days]".to_string()),
        },
        ("clear", _) => ReplCommand::Clear,
        ("usage", _) => ReplCommand::Usage,
        ("log", path) => ReplCommand::Log(path.map(PathBuf::from)),
        ("dump", Some(path)) => ReplCommand::Dump(PathBuf::from(path)),
        ("help", _) => ReplCommand::Help,
        ("quit" | "exit", _) => ReplCommand::Quit,
        ("switch" | "rename" | "attach" | "dump" | "context", None) => {
            ReplCommand::Invalid(format!("/{name} needs an argument. Try /help."))
        }
        _ => ReplCommand::Invalid(format!("Unknown command /{name}. Try /help.")),
    }
}

/// Executes REPL commands against a session.
pub struct Repl<W: Write> {
    out: W,
    open_line: OpenLine,
    attachments: PendingAttachments,
}

impl<W: Write> Repl<W> {
    pub fn new(out: W, open_line: OpenLine) -> Self {
        Self {
            out,
            open_line,
            attachments: PendingAttachments::default(),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn say(&mut self, text: impl AsRef<str>) {
        if self.open_line.take() {
            let _ = writeln!(self.out);
        }
        let _ = writeln!(self.out, "{}", text.as_ref());
        let _ = self.out.flush();
    }

    /// `n` from the `/chats` listing, or a chat id.
    fn resolve(&self, session: &Session, target: &str) -> Option<ChatId> {
        let store = session.store();
        if let Ok(n) = target.parse::<usize>() {
            return store
                .chats_by_recency()
                .get(n.checked_sub(1)?)
                .map(|chat| chat.id.clone());
        }
        let id = ChatId::from(target);
        store.contains(&id).then_some(id)
    }

    fn list_chats(&mut self, session: &Session) {
        let active = session.store().active_id().clone();
        let lines: Vec<String> = session
            .store()
            .chats_by_recency()
            .iter()
            .enumerate()
            .map(|(i, chat)| {
                let marker = if chat.id == active { '*' } else { ' ' };
                let streaming = if session.requests().is_active(&chat.id) {
                    ", streaming"
                } else {
                    ""
                };
                format!(
                    "{:>3}. {marker} {} ({}, {} messages{streaming})",
                    i + 1,
                    chat.name,
                    chat.model,
                    chat.history.len()
                )
            })
            .collect();
        for line in lines {
            self.say(line);
        }
    }

    fn describe_params(chat: &Chat) -> String {
        fn show(value: Option<f64>) -> String {
            value.map_or_else(|| "default".to_string(), |v| v.to_string())
        }
        format!(
            "Parameters: temperature {}, top_p {}, top_k {}",
            show(chat.temperature),
            show(chat.top_p),
            show(chat.top_k)
        )
    }

    fn usage(&mut self, session: &Session) {
        let chat = session.active_chat();
        let usage = &chat.token_usage;
        let mut lines = vec![format!(
            "Tokens: prompt {}, completion {}, total {}",
            usage.prompt_tokens, usage.completion_tokens, usage.total_tokens
        )];
        if let (Some(remaining), Some(percent)) =
            (chat.remaining_tokens(), chat.context_usage_percent())
        {
            lines.push(format!("Context: {percent:.0}% used, {remaining} tokens left"));
        }
        match session.requests().rate_display(&chat.id) {
            Some(rate) if session.requests().is_active(&chat.id) => {
                lines.push(format!("Rate: {rate:.1} tokens/s"))
            }
            Some(rate) => lines.push(format!("Peak rate: {rate:.1} tokens/s")),
            None => {}
        }
        for line in lines {
            self.say(line);
        }
    }

    pub fn execute(&mut self, session: &mut Session, command: ReplCommand) -> ControlFlow<()> {
        match command {
            ReplCommand::Empty => {}
            ReplCommand::Prompt(prompt) => {
                let (full, media) = self.attachments.compose(&prompt);
                match session.submit(&full, media) {
                    Ok(_) => self.attachments.clear(),
                    Err(err) => self.say(format!("❌ {err}")),
                }
            }
            ReplCommand::New => {
                session.new_chat();
                self.say("✅ Started a new chat");
            }
            ReplCommand::Chats => self.list_chats(session),
            ReplCommand::Switch(target) => match self.resolve(session, &target) {
                Some(id) => {
                    if let Err(err) = session.switch_chat(&id) {
                        self.say(format!("❌ {err}"));
                    } else {
                        let name = session.active_chat().name.clone();
                        self.say(format!("Switched to: {name}"));
                    }
                }
                None => self.say(format!("❌ No chat matches '{target}'")),
            },
            ReplCommand::Delete(target) => {
                let id = match target {
                    Some(target) => self.resolve(session, &target),
                    None => Some(session.store().active_id().clone()),
                };
                match id.map(|id| session.delete_chat(&id)) {
                    Some(Ok(())) => self.say("✅ Chat deleted"),
                    Some(Err(err)) => self.say(format!("❌ {err}")),
                    None => self.say("❌ No such chat"),
                }
            }
            ReplCommand::Rename(name) => {
                let id = session.store().active_id().clone();
                match session.rename_chat(&id, &name) {
                    Ok(()) => self.say(format!("✅ Renamed to: {}", name.trim())),
                    Err(err) => self.say(format!("❌ {err}")),
                }
            }
            ReplCommand::Stop => {
                if !session.stop() {
                    self.say("Nothing to stop");
                }
            }
            ReplCommand::Mcp(value) => {
                let enabled = value.unwrap_or(!session.active_chat().mcp_mode);
                session.set_mcp_mode(enabled);
                self.say(format!("MCP mode {}", if enabled { "on" } else { "off" }));
            }
            ReplCommand::System(None) => {
                let prompt = session.active_chat().system_prompt.clone();
                if prompt.is_empty() {
                    self.say("(no system prompt)");
                } else {
                    self.say(prompt);
                }
            }
            ReplCommand::System(Some(prompt)) => {
                session.set_system_prompt(&prompt);
                self.say("✅ System prompt updated");
            }
            ReplCommand::Model(None) => {
                let model = session.active_chat().model.clone();
                self.say(format!("Model: {model}"));
            }
            ReplCommand::Model(Some(model)) => {
                session.set_model(&model);
                self.say(format!("✅ Model set to: {model}"));
            }
            ReplCommand::Params(updates) if updates.is_empty() => {
                self.say(Self::describe_params(session.active_chat()));
            }
            ReplCommand::Params(updates) => {
                let chat = session.active_chat();
                let (mut temperature, mut top_p, mut top_k) =
                    (chat.temperature, chat.top_p, chat.top_k);
                for update in updates {
                    match update {
                        Sampling::Temperature(v) => temperature = Some(v),
                        Sampling::TopP(v) => top_p = Some(v),
                        Sampling::TopK(v) => top_k = Some(v),
                    }
                }
                session.set_generation_params(temperature, top_p, top_k);
                self.say(format!("✅ {}", Self::describe_params(session.active_chat())));
            }
            ReplCommand::ResetParams => {
                session.set_generation_params(None, None, None);
                self.say("✅ Parameters reset to server defaults");
            }
            ReplCommand::Context(size) => {
                session.set_context_size(size);
                match size {
                    Some(n) => self.say(format!("✅ Context window: {n} tokens")),
                    None => self.say("✅ Context window cleared"),
                }
            }
            ReplCommand::Attach(path) => match self.attachments.add_file(&path) {
                Ok(description) => {
                    let pending = self.attachments.len();
                    self.say(format!("📎 Attached {description} ({pending} pending)"));
                }
                Err(err) => self.say(format!("❌ Cannot attach {}: {err}", path.display())),
            },
            ReplCommand::Purge(days) => {
                let removed = match days {
                    Some(days) => session.delete_older_than(days),
                    None => session.delete_all(),
                };
                self.say(format!("✅ Deleted {} chat(s)", removed.len()));
            }
            ReplCommand::Clear => {
                session.clear_history();
                self.attachments.clear();
                self.say("✅ History cleared");
            }
            ReplCommand::Usage => self.usage(session),
            ReplCommand::Log(path) => {
                let transcript = session.transcript_mut();
                let result = match path {
                    Some(path) => transcript.set_log_file(path),
                    None => transcript.toggle(),
                };
                match result {
                    Ok(message) => self.say(message),
                    Err(err) => self.say(format!("❌ {err}")),
                }
            }
            ReplCommand::Dump(path) => match dump_chat(session.active_chat(), &path) {
                Ok(()) => self.say(format!("✅ Wrote {}", path.display())),
                Err(err) => self.say(format!("❌ Dump failed: {err}")),
            },
            ReplCommand::Help => self.say(HELP),
            ReplCommand::Invalid(message) => self.say(message),
            ReplCommand::Quit => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }
}

impl<W: Write> SessionDriver for Repl<W> {
    type Command = String;

    fn on_command(&mut self, session: &mut Session, line: String) -> ControlFlow<()> {
        self.execute(session, parse_line(&line))
    }

    fn on_outcome(
        &mut self,
        session: &Session,
        chat: &ChatId,
        outcome: &RequestOutcome,
    ) -> ControlFlow<()> {
        if self.open_line.take() {
            let _ = writeln!(self.out);
            let _ = self.out.flush();
        }
        if chat != session.store().active_id() && *outcome == RequestOutcome::Completed {
            if let Some(name) = session.store().chat(chat).map(|chat| chat.name.clone()) {
                self.say(format!("✅ Reply finished in: {name}"));
            }
        }
        ControlFlow::Continue(())
    }
}
