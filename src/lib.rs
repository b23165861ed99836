//! muxchat is a multi-chat client for streaming LLM completion servers.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`api`] defines the request and response payloads of the plain
//!   `chat/completions` endpoint and the typed events of the tool-augmented
//!   `mcp/chat/completions` endpoint.
//! - [`core`] owns the streaming pipeline (SSE tokenizer, event decoder,
//!   thinking-tag splitter), the conversation store, per-chat request
//!   lifecycles, persistence and configuration, tied together by
//!   [`core::session::Session`].
//! - [`cli`] parses arguments and runs the line-oriented chat loop and the
//!   one-shot `send` command.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod api;
pub mod cli;
pub mod core;
pub mod utils;
