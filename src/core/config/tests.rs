use super::data::{mask_secret, path_display, Config};
use super::io::ConfigError;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_nonexistent_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nonexistent_config.toml");

    let config = Config::load_from_path(&config_path).expect("Failed to load config");

    assert_eq!(config, Config::default());
    assert_eq!(config.base_url(), "http://localhost:8080");
    assert_eq!(config.request_timeout(), Duration::from_secs(30));
    assert_eq!(config.mcp_request_timeout(), Duration::from_secs(300));
    assert_eq!(config.persist_debounce(), Duration::from_millis(500));
    assert_eq!(config.rate_poll_interval(), Duration::from_millis(500));
    assert_eq!(config.storage_quota(), 5 * 1024 * 1024);
}

#[test]
fn test_config_persistence_lifecycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nested").join("config.toml");

    // Phase 1: Initial save and load
    let config = Config {
        base_url: Some("http://gpu-box:8080".to_string()),
        default_model: Some("llama-3".to_string()),
        ..Default::default()
    };
    config
        .save_to_path(&config_path)
        .expect("Failed to save config");
    let loaded = Config::load_from_path(&config_path).expect("Failed to load config");
    assert_eq!(loaded.base_url(), "http://gpu-box:8080");
    assert_eq!(loaded.default_model(), "llama-3");

    // Phase 2: Modify through the CLI key names
    let mut config = loaded;
    config.set_value("mcp-mode", "on").unwrap();
    config.set_value("request-timeout", "45").unwrap();
    config
        .save_to_path(&config_path)
        .expect("Failed to save modified config");
    let loaded = Config::load_from_path(&config_path).expect("Failed to load modified config");
    assert_eq!(loaded.mcp_mode, Some(true));
    assert_eq!(loaded.request_timeout(), Duration::from_secs(45));
    assert_eq!(loaded.default_model(), "llama-3");

    // Phase 3: Unset and verify persistence of None
    let mut config = loaded;
    config.unset_value("default-model").unwrap();
    config
        .save_to_path(&config_path)
        .expect("Failed to save unset config");
    let loaded = Config::load_from_path(&config_path).expect("Failed to load unset config");
    assert_eq!(loaded.default_model, None);
    assert_eq!(loaded.mcp_mode, Some(true));
}

#[test]
fn invalid_toml_reports_path() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, "base_url = [").unwrap();

    let err = Config::load_from_path(&config_path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().starts_with("Failed to parse config at"));
}

#[test]
fn set_value_validates_input() {
    let mut config = Config::default();

    assert!(matches!(
        config.set_value("base-url", "ftp://example.com"),
        Err(ConfigError::Invalid { .. })
    ));
    assert!(matches!(
        config.set_value("base-url", "http://gpu-box:notaport"),
        Err(ConfigError::Invalid { .. })
    ));
    assert!(matches!(
        config.set_value("request-timeout", "0"),
        Err(ConfigError::Invalid { .. })
    ));
    assert!(matches!(
        config.set_value("mcp-mode", "maybe"),
        Err(ConfigError::Invalid { .. })
    ));
    assert!(matches!(
        config.set_value("theme", "dark"),
        Err(ConfigError::UnknownKey(_))
    ));
    assert!(matches!(
        config.unset_value("theme"),
        Err(ConfigError::UnknownKey(_))
    ));
    assert_eq!(config, Config::default());

    config.set_value("base-url", " https://api.example.com/v1 ").unwrap();
    config.set_value("persist-debounce-ms", "0").unwrap();
    config.set_value("data-dir", "/tmp/muxchat").unwrap();
    assert_eq!(config.base_url(), "https://api.example.com/v1");
    assert_eq!(config.persist_debounce(), Duration::ZERO);
    assert_eq!(config.data_dir(), Some(PathBuf::from("/tmp/muxchat")));
}

#[test]
fn every_known_key_can_be_unset() {
    let mut config = Config::default();
    for key in Config::known_keys() {
        config.unset_value(key).expect("known key");
    }
}

#[test]
fn environment_overrides_file_values() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("MUXCHAT_BASE_URL", "http://override:9000"),
        ("MUXCHAT_API_KEY", "sk-env"),
    ]);
    let config = Config {
        base_url: Some("http://file:8080".to_string()),
        api_key: Some("sk-file".to_string()),
        ..Default::default()
    }
    .with_overrides_from(|name| env.get(name).map(|v| v.to_string()));

    assert_eq!(config.base_url(), "http://override:9000");
    assert_eq!(config.api_key.as_deref(), Some("sk-env"));

    let untouched = Config {
        api_key: Some("sk-file".to_string()),
        ..Default::default()
    }
    .with_overrides_from(|_| Some("  ".to_string()));
    assert_eq!(untouched.api_key.as_deref(), Some("sk-file"));
}

#[test]
fn derived_settings_follow_config() {
    let config = Config {
        default_model: Some("qwen".to_string()),
        system_prompt: Some("Be brief.".to_string()),
        mcp_mode: Some(true),
        mcp_request_timeout_secs: Some(600),
        ..Default::default()
    };

    let defaults = config.chat_defaults();
    assert_eq!(defaults.model, "qwen");
    assert_eq!(defaults.system_prompt, "Be brief.");
    assert!(defaults.mcp_mode);

    let settings = config.request_settings();
    assert_eq!(settings.mcp_request_timeout, Duration::from_secs(600));
    assert_eq!(settings.request_timeout, Duration::from_secs(30));
}

#[test]
fn describe_masks_the_api_key() {
    let config = Config {
        api_key: Some("sk-1234567890".to_string()),
        ..Default::default()
    };
    let text = config.describe().join("\n");
    assert!(text.contains("api-key: *********7890"));
    assert!(!text.contains("sk-1234567890"));
    assert!(text.contains("base-url: http://localhost:8080 (default)"));
}

#[test]
fn mask_secret_handles_short_values() {
    assert_eq!(mask_secret(""), "");
    assert_eq!(mask_secret("abc"), "***");
    assert_eq!(mask_secret("abcdef"), "**cdef");
}

#[test]
fn path_display_keeps_relative_paths() {
    assert_eq!(path_display("relative/dir"), "relative/dir");
}
