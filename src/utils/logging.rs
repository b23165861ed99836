use crate::core::chat::Chat;
use crate::core::message::Role;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::error::Error;
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "MUXCHAT_LOG";

/// Install the global `tracing` subscriber. Diagnostics go to stderr unless
/// `log_file` is given; the filter comes from `MUXCHAT_LOG` (default `warn`).
pub fn init_tracing(log_file: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match log_file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.with_writer(io::stderr).try_init(),
    };
    installed.map_err(|err| -> Box<dyn Error> { err })
}

/// Plain-text transcript of completed turns, appended as they finish.
pub struct TranscriptLog {
    file_path: Option<PathBuf>,
    is_active: bool,
}

impl TranscriptLog {
    pub fn new(file_path: Option<PathBuf>) -> Result<Self, Box<dyn Error>> {
        if let Some(path) = &file_path {
            Self::test_file_access(path)?;
        }
        let is_active = file_path.is_some();
        Ok(Self {
            file_path,
            is_active,
        })
    }

    pub fn disabled() -> Self {
        Self {
            file_path: None,
            is_active: false,
        }
    }

    pub fn set_log_file(&mut self, path: PathBuf) -> Result<String, Box<dyn Error>> {
        Self::test_file_access(&path)?;
        let message = format!("Transcript enabled to: {}", path.display());
        self.file_path = Some(path);
        self.is_active = true;
        Ok(message)
    }

    pub fn toggle(&mut self) -> Result<String, Box<dyn Error>> {
        match &self.file_path {
            Some(path) => {
                if self.is_active {
                    self.log_message("## Transcript paused")?;
                    self.is_active = false;
                    Ok(format!("Transcript paused (file: {})", path.display()))
                } else {
                    self.is_active = true;
                    Ok(format!("Transcript resumed to: {}", path.display()))
                }
            }
            None => Err("No transcript file specified. Use /log <filename> first.".into()),
        }
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn status(&self) -> String {
        let name = |path: &Path| {
            path.file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .into_owned()
        };
        match (&self.file_path, self.is_active) {
            (None, _) => "disabled".to_string(),
            (Some(path), true) => format!("active ({})", name(path)),
            (Some(path), false) => format!("paused ({})", name(path)),
        }
    }

    /// Append one completed exchange.
    pub fn log_turn(
        &self,
        chat_name: &str,
        prompt: &str,
        reply: &str,
    ) -> Result<(), Box<dyn Error>> {
        self.log_message(&format!("## {chat_name}\nYou: {prompt}"))?;
        if !reply.is_empty() {
            self.log_message(reply)?;
        }
        Ok(())
    }

    pub fn log_message(&self, content: &str) -> Result<(), Box<dyn Error>> {
        let Some(path) = self.file_path.as_ref().filter(|_| self.is_active) else {
            return Ok(());
        };

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut writer = BufWriter::with_capacity(64 * 1024, file);
        for line in content.lines() {
            writeln!(writer, "{line}")?;
        }
        writeln!(writer)?;
        writer.flush()?;
        Ok(())
    }

    fn test_file_access(path: &Path) -> Result<(), Box<dyn Error>> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.flush()?;
        Ok(())
    }
}

/// Write a whole chat as plain text, replacing `path` atomically.
pub fn dump_chat(chat: &Chat, path: &Path) -> Result<(), Box<dyn Error>> {
    let parent = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp_file = NamedTempFile::new_in(parent)?;

    writeln!(temp_file, "# {}", chat.name)?;
    writeln!(temp_file)?;
    if !chat.system_prompt.trim().is_empty() {
        write_block(temp_file.as_file_mut(), &format!("System: {}", chat.system_prompt))?;
    }
    for message in &chat.history {
        let text = match message.role {
            Role::User => format!("You: {}", message.content()),
            Role::Assistant if message.content().is_empty() => continue,
            Role::Assistant => message.content().to_string(),
            Role::Thinking | Role::Reasoning => format!("## {}\n{}", message.role.as_str(), message.content()),
            // Tool transcripts are kept out of dumps.
            Role::ToolCall | Role::ToolResult => continue,
        };
        write_block(temp_file.as_file_mut(), &text)?;
    }

    temp_file.flush()?;
    temp_file.as_file().sync_all()?;
    temp_file.persist(path)?;
    Ok(())
}

fn write_block(file: &mut File, text: &str) -> io::Result<()> {
    for line in text.lines() {
        writeln!(file, "{line}")?;
    }
    writeln!(file)
}
