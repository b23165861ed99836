use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// User configuration as stored in `config.toml`. Every field is optional;
/// unset fields fall back to the defaults in [`crate::core::config::defaults`].
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    /// Server root the completion endpoints are appended to
    pub base_url: Option<String>,
    /// Bearer token sent with each request
    pub api_key: Option<String>,
    /// Model for newly created chats
    pub default_model: Option<String>,
    /// System prompt for newly created chats
    pub system_prompt: Option<String>,
    /// Whether new chats use the tool-augmented endpoint
    pub mcp_mode: Option<bool>,
    pub request_timeout_secs: Option<u64>,
    pub mcp_request_timeout_secs: Option<u64>,
    /// Quiet period before chats are written to disk
    pub persist_debounce_ms: Option<u64>,
    /// How often the displayed chat's token rate is recomputed
    pub rate_poll_ms: Option<u64>,
    /// Upper bound for the chat store on disk, in bytes
    pub storage_quota_bytes: Option<u64>,
    /// Where chats are stored; defaults to the platform data directory
    pub data_dir: Option<PathBuf>,
}

/// Keys accepted by `muxchat set` / `muxchat unset`.
pub const CONFIG_KEYS: [&str; 11] = [
    "base-url",
    "api-key",
    "default-model",
    "system-prompt",
    "mcp-mode",
    "request-timeout",
    "mcp-request-timeout",
    "persist-debounce-ms",
    "rate-poll-ms",
    "storage-quota",
    "data-dir",
];

/// Get a user-friendly display string for a path
/// Converts absolute paths to use ~ notation on Unix-like systems when possible
///
/// # Examples
/// - Unix: `/home/user/.config/muxchat` → `~/.config/muxchat`
/// - macOS: `/Users/user/Library/Application Support/...` → `~/Library/Application Support/...`
pub fn path_display<P: AsRef<Path>>(path: P) -> String {
    let path = path.as_ref();

    #[cfg(unix)]
    {
        if let Some(home) = std::env::var_os("HOME") {
            let home_path = PathBuf::from(home);
            if let Ok(relative) = path.strip_prefix(&home_path) {
                return format!("~/{}", relative.display());
            }
        }
    }

    path.display().to_string()
}

/// Mask all but the last four characters of a secret for display.
pub fn mask_secret(secret: &str) -> String {
    let count = secret.chars().count();
    if count <= 4 {
        return "*".repeat(count);
    }
    let tail: String = secret.chars().skip(count - 4).collect();
    format!("{}{}", "*".repeat(count - 4), tail)
}
