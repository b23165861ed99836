use crate::core::config::data::{mask_secret, path_display, Config};

impl Config {
    /// Lines describing the effective configuration, unset values marked.
    pub fn describe(&self) -> Vec<String> {
        fn show<T: std::fmt::Display>(value: &Option<T>, fallback: impl std::fmt::Display) -> String {
            match value {
                Some(value) => value.to_string(),
                None => format!("{fallback} (default)"),
            }
        }

        let mut lines = vec!["Current configuration:".to_string()];
        lines.push(format!("  base-url: {}", show(&self.base_url, self.base_url())));
        lines.push(match &self.api_key {
            Some(key) => format!("  api-key: {}", mask_secret(key)),
            None => "  api-key: (unset)".to_string(),
        });
        lines.push(format!(
            "  default-model: {}",
            show(&self.default_model, self.default_model())
        ));
        lines.push(match &self.system_prompt {
            Some(prompt) => format!("  system-prompt: {prompt}"),
            None => "  system-prompt: (unset)".to_string(),
        });
        lines.push(format!(
            "  mcp-mode: {}",
            match self.mcp_mode.unwrap_or(false) {
                true => "on",
                false => "off",
            }
        ));
        lines.push(format!(
            "  request-timeout: {}s",
            self.request_timeout().as_secs()
        ));
        lines.push(format!(
            "  mcp-request-timeout: {}s",
            self.mcp_request_timeout().as_secs()
        ));
        lines.push(format!(
            "  persist-debounce-ms: {}",
            self.persist_debounce().as_millis()
        ));
        lines.push(format!("  rate-poll-ms: {}", self.rate_poll_interval().as_millis()));
        lines.push(format!("  storage-quota: {} bytes", self.storage_quota()));
        lines.push(match self.data_dir() {
            Some(dir) => format!("  data-dir: {}", path_display(dir)),
            None => "  data-dir: (unavailable)".to_string(),
        });
        lines
    }

    pub fn print_all(&self) {
        for line in self.describe() {
            println!("{line}");
        }
    }
}
