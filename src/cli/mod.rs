//! Command-line interface parsing and handling
//!
//! This module handles parsing command-line arguments and executing the appropriate commands.

pub mod attach;
pub mod printer;
pub mod repl;
pub mod send;

use std::error::Error;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

use crate::cli::attach::PendingAttachments;
use crate::cli::printer::{OpenLine, StreamPrinter};
use crate::cli::repl::Repl;
use crate::cli::send::run_send;
use crate::core::chat_stream::HttpTransport;
use crate::core::config::Config;
use crate::core::persistence::{FileStorage, MemoryStorage, SaveOutcome, StorageBackend};
use crate::core::session::Session;
use crate::utils::logging::{init_tracing, TranscriptLog};

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("VERGEN_GIT_DESCRIBE"),
    ", built ",
    env!("VERGEN_BUILD_DATE"),
    ")"
);

#[derive(Parser)]
#[command(name = "muxchat", version, long_version = LONG_VERSION)]
#[command(about = "A multi-chat streaming client for OpenAI-compatible completion servers")]
#[command(
    long_about = "muxchat talks to a streaming chat completion server, either the plain \
chat/completions endpoint or the tool-augmented mcp/chat/completions endpoint. \
Several chats can stream at once; all of them are saved between runs.\n\n\
Environment Variables:\n\
  MUXCHAT_BASE_URL  Server base URL (overrides the config file)\n\
  MUXCHAT_API_KEY   Bearer token sent with every request\n\
  MUXCHAT_LOG       Diagnostic log filter, e.g. 'muxchat=debug' (default: warn)\n\n\
Type /help inside the chat loop for the list of commands."
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Write diagnostic logs to this file instead of stderr
    #[arg(short = 'l', long, global = true)]
    pub log: Option<PathBuf>,

    /// Append completed turns to this transcript file
    #[arg(short = 't', long, global = true)]
    pub transcript: Option<PathBuf>,

    /// Use this config file instead of the default location
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    /// Keep chats in memory only; nothing is read from or written to disk
    #[arg(long, global = true)]
    pub ephemeral: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the interactive chat loop (default)
    Chat,
    /// Send a single prompt and print the reply
    Send {
        /// Use the tool-augmented endpoint
        #[arg(long)]
        mcp: bool,
        /// Model to use instead of the configured default
        #[arg(short = 'm', long)]
        model: Option<String>,
        /// Attach a file (repeatable)
        #[arg(short = 'a', long = "attach", value_name = "FILE")]
        attachments: Vec<PathBuf>,
        /// Prompt text
        #[arg(trailing_var_arg = true, required = true)]
        prompt: Vec<String>,
    },
    /// Print the effective configuration
    Config,
    /// Set a configuration value
    Set {
        /// Configuration key to set
        key: String,
        /// Value to set (multiple words are joined with spaces)
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        value: Vec<String>,
    },
    /// Unset a configuration value
    Unset {
        /// Configuration key to unset
        key: String,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    tokio::runtime::Runtime::new()?.block_on(async_main())
}

fn config_path(args: &Args) -> Result<PathBuf, Box<dyn Error>> {
    match &args.config {
        Some(path) => Ok(path.clone()),
        None => Ok(Config::get_config_path()?),
    }
}

fn storage_for(config: &Config, ephemeral: bool) -> Result<Box<dyn StorageBackend>, Box<dyn Error>> {
    if ephemeral {
        return Ok(Box::new(MemoryStorage::new()));
    }
    let dir = config
        .data_dir()
        .ok_or("No data directory available; set data-dir or use --ephemeral")?;
    std::fs::create_dir_all(&dir)?;
    Ok(Box::new(FileStorage::new(dir, Some(config.storage_quota()))))
}

fn build_session(config: &Config, args: &Args) -> Result<Session, Box<dyn Error>> {
    let transport = HttpTransport::new(reqwest::Client::new(), config.api_key.clone());
    let mut session = Session::from_config(
        config,
        Arc::new(transport),
        storage_for(config, args.ephemeral)?,
    );
    if let Some(path) = &args.transcript {
        session.set_transcript(TranscriptLog::new(Some(path.clone()))?);
    }
    Ok(session)
}

async fn async_main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(args.log.as_deref())?;

    let path = config_path(&args)?;
    match &args.command {
        Some(Commands::Config) => {
            Config::load(Some(path.as_path()))?.print_all();
            Ok(())
        }
        Some(Commands::Set { key, value }) => {
            let mut config = Config::load_from_path(&path)?;
            let value = value.join(" ");
            config.set_value(key, &value)?;
            config.save_to_path(&path)?;
            println!("✅ Set {key}");
            Ok(())
        }
        Some(Commands::Unset { key }) => {
            let mut config = Config::load_from_path(&path)?;
            config.unset_value(key)?;
            config.save_to_path(&path)?;
            println!("✅ Unset {key}");
            Ok(())
        }
        Some(Commands::Send {
            mcp,
            model,
            attachments,
            prompt,
        }) => {
            let mut config = Config::load(Some(path.as_path()))?;
            if let Some(model) = model {
                config.default_model = Some(model.clone());
            }
            let prompt = prompt.join(" ");
            let mut pending = PendingAttachments::default();
            for file in attachments {
                pending.add_file(file)?;
            }
            let (full, media) = pending.take_for_prompt(&prompt);
            let session = build_session(&config, &args)?;
            run_send(session, &full, *mcp, media).await
        }
        Some(Commands::Chat) | None => {
            let config = Config::load(Some(path.as_path()))?;
            let session = build_session(&config, &args)?;
            run_chat(session, &path).await
        }
    }
}

async fn run_chat(mut session: Session, config_path: &Path) -> Result<(), Box<dyn Error>> {
    let open_line = OpenLine::default();
    session.subscribe(Box::new(StreamPrinter::new(io::stdout(), open_line.clone())));

    println!(
        "muxchat {} | chat: {} | model: {} | config: {}",
        env!("CARGO_PKG_VERSION"),
        session.active_chat().name,
        session.active_chat().model,
        config_path.display()
    );
    println!("Type a message, or /help for commands.");

    let (tx, mut rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut repl = Repl::new(io::stdout(), open_line);
    session.run(&mut rx, &mut repl).await;

    match session.flush() {
        SaveOutcome::Saved => info!("chats saved on exit"),
        SaveOutcome::Degraded => eprintln!("⚠️  Storage is full; message histories were not saved"),
        SaveOutcome::Failed => eprintln!("❌ Failed to save chats"),
    }
    Ok(())
}
