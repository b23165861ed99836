pub mod chat;
pub mod chat_stream;
pub mod config;
pub mod decoder;
pub mod message;
pub mod persistence;
pub mod render;
pub mod requests;
pub mod session;
pub mod sse;
pub mod store;
pub mod thinking;
