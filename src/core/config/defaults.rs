use crate::core::config::data::{Config, CONFIG_KEYS};
use crate::core::config::io::ConfigError;
use crate::core::requests::RequestSettings;
use crate::core::store::ChatDefaults;
use crate::utils::url::validate_base_url;
use directories::ProjectDirs;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_MODEL: &str = "gpt-4";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MCP_REQUEST_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_PERSIST_DEBOUNCE_MS: u64 = 500;
pub const DEFAULT_RATE_POLL_MS: u64 = 500;
pub const DEFAULT_STORAGE_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

pub const ENV_BASE_URL: &str = "MUXCHAT_BASE_URL";
pub const ENV_API_KEY: &str = "MUXCHAT_API_KEY";

impl Config {
    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL)
    }

    pub fn default_model(&self) -> &str {
        self.default_model.as_deref().unwrap_or(DEFAULT_MODEL)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn mcp_request_timeout(&self) -> Duration {
        Duration::from_secs(
            self.mcp_request_timeout_secs
                .unwrap_or(DEFAULT_MCP_REQUEST_TIMEOUT_SECS),
        )
    }

    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(
            self.persist_debounce_ms
                .unwrap_or(DEFAULT_PERSIST_DEBOUNCE_MS),
        )
    }

    pub fn rate_poll_interval(&self) -> Duration {
        Duration::from_millis(self.rate_poll_ms.unwrap_or(DEFAULT_RATE_POLL_MS).max(1))
    }

    pub fn storage_quota(&self) -> usize {
        self.storage_quota_bytes
            .unwrap_or(DEFAULT_STORAGE_QUOTA_BYTES) as usize
    }

    pub fn data_dir(&self) -> Option<PathBuf> {
        self.data_dir.clone().or_else(|| {
            ProjectDirs::from("org", "muxchat", "muxchat").map(|dirs| dirs.data_dir().to_path_buf())
        })
    }

    pub fn chat_defaults(&self) -> ChatDefaults {
        ChatDefaults {
            model: self.default_model().to_string(),
            system_prompt: self.system_prompt.clone().unwrap_or_default(),
            mcp_mode: self.mcp_mode.unwrap_or(false),
        }
    }

    pub fn request_settings(&self) -> RequestSettings {
        RequestSettings {
            base_url: self.base_url().to_string(),
            request_timeout: self.request_timeout(),
            mcp_request_timeout: self.mcp_request_timeout(),
        }
    }

    /// Apply `MUXCHAT_BASE_URL` / `MUXCHAT_API_KEY` from the process
    /// environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = Some(url);
        }
        if let Some(key) = lookup(ENV_API_KEY).filter(|v| !v.trim().is_empty()) {
            self.api_key = Some(key);
        }
        self
    }

    /// Set a value by its CLI key name.
    pub fn set_value(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        match key {
            "base-url" => {
                let url = validate_base_url(value).map_err(|reason| invalid(key, value, &reason))?;
                self.base_url = Some(url);
            }
            "api-key" => self.api_key = Some(value.to_string()),
            "default-model" => self.default_model = Some(value.to_string()),
            "system-prompt" => self.system_prompt = Some(value.to_string()),
            "mcp-mode" => self.mcp_mode = Some(parse_bool(key, value)?),
            "request-timeout" => self.request_timeout_secs = Some(parse_positive(key, value)?),
            "mcp-request-timeout" => {
                self.mcp_request_timeout_secs = Some(parse_positive(key, value)?)
            }
            "persist-debounce-ms" => self.persist_debounce_ms = Some(parse_number(key, value)?),
            "rate-poll-ms" => self.rate_poll_ms = Some(parse_positive(key, value)?),
            "storage-quota" => self.storage_quota_bytes = Some(parse_positive(key, value)?),
            "data-dir" => self.data_dir = Some(PathBuf::from(value)),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn unset_value(&mut self, key: &str) -> Result<(), ConfigError> {
        match key {
            "base-url" => self.base_url = None,
            "api-key" => self.api_key = None,
            "default-model" => self.default_model = None,
            "system-prompt" => self.system_prompt = None,
            "mcp-mode" => self.mcp_mode = None,
            "request-timeout" => self.request_timeout_secs = None,
            "mcp-request-timeout" => self.mcp_request_timeout_secs = None,
            "persist-debounce-ms" => self.persist_debounce_ms = None,
            "rate-poll-ms" => self.rate_poll_ms = None,
            "storage-quota" => self.storage_quota_bytes = None,
            "data-dir" => self.data_dir = None,
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    pub fn known_keys() -> &'static [&'static str] {
        &CONFIG_KEYS
    }
}

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Ok(true),
        "off" | "false" | "no" | "0" => Ok(false),
        _ => Err(invalid(key, value, "expected on or off")),
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64, ConfigError> {
    value
        .parse()
        .map_err(|_| invalid(key, value, "expected a whole number"))
}

fn parse_positive(key: &str, value: &str) -> Result<u64, ConfigError> {
    match parse_number(key, value)? {
        0 => Err(invalid(key, value, "must be greater than zero")),
        n => Ok(n),
    }
}
