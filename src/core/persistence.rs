//! Durable copy of the conversation store.
//!
//! The whole store is written as one JSON blob under [`CHATS_KEY`]. Writes are
//! debounced by the controller; when the backend runs out of room the blob is
//! retried without message histories so at least the chat list survives.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::core::chat::{Chat, ChatId};
use crate::core::store::{ChatDefaults, ConversationStore};

pub const CHATS_KEY: &str = "muxchat_chats";
pub const LEGACY_SYSTEM_PROMPT_KEY: &str = "system_prompt";

#[derive(Debug)]
pub enum StorageError {
    QuotaExceeded {
        key: String,
        needed: usize,
        quota: usize,
    },
    Io {
        key: String,
        source: io::Error,
    },
    Serialize(serde_json::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::QuotaExceeded { key, needed, quota } => write!(
                f,
                "Storage quota exceeded writing {key}: {needed} bytes needed, {quota} allowed"
            ),
            StorageError::Io { key, source } => write!(f, "Storage error for {key}: {source}"),
            StorageError::Serialize(source) => write!(f, "Failed to serialize chats: {source}"),
        }
    }
}

impl std::error::Error for StorageError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StorageError::QuotaExceeded { .. } => None,
            StorageError::Io { source, .. } => Some(source),
            StorageError::Serialize(source) => Some(source),
        }
    }
}

/// String key/value storage.
pub trait StorageBackend: Send {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove(&mut self, key: &str) -> Result<(), StorageError>;
}

/// One `<key>.json` file per key under a data directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
    quota: Option<usize>,
}

impl FileStorage {
    pub fn new(dir: impl Into<PathBuf>, quota: Option<usize>) -> Self {
        Self {
            dir: dir.into(),
            quota,
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Bytes used by every stored key except `key`.
    fn used_by_others(&self, key: &str) -> usize {
        let own = self.path_for(key);
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return 0;
        };
        entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path() != own)
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "json"))
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len() as usize)
            .sum()
    }
}

impl StorageBackend for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let io_err = |source: io::Error| StorageError::Io {
            key: key.to_string(),
            source,
        };

        if let Some(quota) = self.quota {
            let needed = self.used_by_others(key) + value.len();
            if needed > quota {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    quota,
                });
            }
        }

        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut temp_file = NamedTempFile::new_in(&self.dir).map_err(io_err)?;
        temp_file.write_all(value.as_bytes()).map_err(io_err)?;
        temp_file.as_file_mut().sync_all().map_err(io_err)?;
        temp_file
            .persist(self.path_for(key))
            .map_err(|err| io_err(err.error))?;
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StorageError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// Process-local storage, used for `--ephemeral` sessions and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    entries: HashMap<String, String>,
    quota: Option<usize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quota(quota: usize) -> Self {
        Self {
            entries: HashMap::new(),
            quota: Some(quota),
        }
    }
}

impl StorageBackend for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        if let Some(quota) = self.quota {
            let others: usize = self
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            let needed = others + value.len();
            if needed > quota {
                return Err(StorageError::QuotaExceeded {
                    key: key.to_string(),
                    needed,
                    quota,
                });
            }
        }
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StorageError> {
        self.entries.remove(key);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub chats: Vec<Chat>,
    #[serde(default)]
    pub active_chat_id: Option<ChatId>,
    pub last_saved: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// Quota was exceeded; only chat metadata was written.
    Degraded,
    Failed,
}

pub struct Persistence {
    backend: Box<dyn StorageBackend>,
}

impl Persistence {
    pub fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &dyn StorageBackend {
        &*self.backend
    }

    pub fn save(&mut self, store: &ConversationStore) -> SaveOutcome {
        let state = PersistedState {
            chats: store.chats().to_vec(),
            active_chat_id: Some(store.active_id().clone()),
            last_saved: Utc::now(),
        };

        match self.write(&state) {
            Ok(()) => {
                debug!(chats = state.chats.len(), "saved chats");
                SaveOutcome::Saved
            }
            Err(StorageError::QuotaExceeded { needed, quota, .. }) => {
                warn!(needed, quota, "storage quota exceeded; saving chats without history");
                let mut trimmed = state;
                for chat in trimmed.chats.iter_mut() {
                    chat.history.clear();
                }
                match self.write(&trimmed) {
                    Ok(()) => SaveOutcome::Degraded,
                    Err(e) => {
                        warn!(error = %e, "giving up on saving chats");
                        SaveOutcome::Failed
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to save chats");
                SaveOutcome::Failed
            }
        }
    }

    fn write(&mut self, state: &PersistedState) -> Result<(), StorageError> {
        let json = serde_json::to_string(state).map_err(StorageError::Serialize)?;
        self.backend.set(CHATS_KEY, &json)
    }

    /// Read the saved state. Corrupted data is removed and treated as absent;
    /// a legacy bare system prompt is migrated into a single chat.
    pub fn load(&mut self, defaults: &ChatDefaults) -> Option<PersistedState> {
        match self.backend.get(CHATS_KEY) {
            Ok(Some(json)) => match serde_json::from_str::<PersistedState>(&json) {
                Ok(state) if !state.chats.is_empty() => return Some(state),
                Ok(_) => debug!("saved state holds no chats"),
                Err(e) => {
                    warn!(error = %e, "discarding corrupted chat state");
                    if let Err(e) = self.backend.remove(CHATS_KEY) {
                        warn!(error = %e, "failed to remove corrupted chat state");
                    }
                }
            },
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "failed to read chat state");
                return None;
            }
        }
        self.migrate_legacy(defaults)
    }

    fn migrate_legacy(&mut self, defaults: &ChatDefaults) -> Option<PersistedState> {
        let prompt = match self.backend.get(LEGACY_SYSTEM_PROMPT_KEY) {
            Ok(Some(prompt)) => prompt,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "failed to read legacy system prompt");
                return None;
            }
        };

        let now = Utc::now();
        let chat = Chat::new(
            ChatId::generate(now),
            defaults.model.clone(),
            prompt,
            defaults.mcp_mode,
            now,
        );
        if let Err(e) = self.backend.remove(LEGACY_SYSTEM_PROMPT_KEY) {
            warn!(error = %e, "failed to remove legacy system prompt");
        }
        info!("migrated legacy system prompt into a chat");
        Some(PersistedState {
            active_chat_id: Some(chat.id.clone()),
            chats: vec![chat],
            last_saved: now,
        })
    }

    /// Load into `store`, returning whether anything was restored.
    pub fn restore_into(&mut self, store: &mut ConversationStore) -> bool {
        let defaults = store.defaults().clone();
        match self.load(&defaults) {
            Some(state) => {
                store.restore(state.chats, state.active_chat_id);
                true
            }
            None => false,
        }
    }
}

/// Trailing-edge debounce: a flush is due once no mutation has been seen for
/// the configured delay.
#[derive(Debug, Clone)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn mark_dirty(&mut self, now: Instant) {
        self.deadline = Some(now + self.delay);
    }

    pub fn is_dirty(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// True (and reset) when the quiet period has elapsed.
    pub fn due(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::message::{Attachments, Role};

    fn defaults() -> ChatDefaults {
        ChatDefaults {
            model: "m".into(),
            system_prompt: String::new(),
            mcp_mode: false,
        }
    }

    fn store_with_history() -> ConversationStore {
        let mut store = ConversationStore::new(defaults());
        store.append(Role::User, "Hello", Attachments::default(), None);
        store.append(Role::Assistant, &"long answer ".repeat(200), Attachments::default(), None);
        store
    }

    #[test]
    fn save_and_restore_round_trip() {
        let mut persistence = Persistence::new(Box::new(MemoryStorage::new()));
        let store = store_with_history();
        assert_eq!(persistence.save(&store), SaveOutcome::Saved);

        let mut restored = ConversationStore::new(defaults());
        assert!(persistence.restore_into(&mut restored));
        assert_eq!(restored.active_id(), store.active_id());
        let chat = restored.active_chat();
        assert_eq!(chat.name, "Hello");
        assert_eq!(chat.history.len(), 2);
        assert!(chat.history[0].rendered().contains("Hello"));
    }

    #[test]
    fn quota_failure_degrades_to_metadata() {
        let store = store_with_history();
        let full = serde_json::to_string(store.chats()).unwrap().len();
        let mut persistence = Persistence::new(Box::new(MemoryStorage::with_quota(full / 2)));

        assert_eq!(persistence.save(&store), SaveOutcome::Degraded);
        let state = persistence.load(&defaults()).unwrap();
        assert_eq!(state.chats.len(), 1);
        assert_eq!(state.chats[0].name, "Hello");
        assert!(state.chats[0].history.is_empty());
    }

    #[test]
    fn tiny_quota_fails_without_panicking() {
        let store = store_with_history();
        let mut persistence = Persistence::new(Box::new(MemoryStorage::with_quota(10)));
        assert_eq!(persistence.save(&store), SaveOutcome::Failed);
        assert!(persistence.load(&defaults()).is_none());
    }

    #[test]
    fn corrupted_state_is_removed() {
        let mut backend = MemoryStorage::new();
        backend.set(CHATS_KEY, "{not json").unwrap();
        let mut persistence = Persistence::new(Box::new(backend));

        assert!(persistence.load(&defaults()).is_none());
        assert!(persistence.backend().get(CHATS_KEY).unwrap().is_none());
    }

    #[test]
    fn legacy_system_prompt_becomes_a_chat() {
        let mut backend = MemoryStorage::new();
        backend
            .set(LEGACY_SYSTEM_PROMPT_KEY, "You are terse.")
            .unwrap();
        let mut persistence = Persistence::new(Box::new(backend));

        let state = persistence.load(&defaults()).unwrap();
        assert_eq!(state.chats.len(), 1);
        assert_eq!(state.chats[0].system_prompt, "You are terse.");
        assert_eq!(state.active_chat_id.as_ref(), Some(&state.chats[0].id));
        assert!(persistence
            .backend()
            .get(LEGACY_SYSTEM_PROMPT_KEY)
            .unwrap()
            .is_none());
    }

    #[test]
    fn file_storage_writes_atomically_and_enforces_quota() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path().join("data"), Some(32));

        assert!(storage.get("a").unwrap().is_none());
        storage.set("a", "0123456789").unwrap();
        assert_eq!(storage.get("a").unwrap().as_deref(), Some("0123456789"));

        // Overwriting a key does not count its old size.
        storage.set("a", &"x".repeat(30)).unwrap();
        let err = storage.set("b", "0123456789").unwrap_err();
        assert!(matches!(err, StorageError::QuotaExceeded { needed: 40, quota: 32, .. }));

        storage.remove("a").unwrap();
        storage.remove("a").unwrap();
        storage.set("b", "0123456789").unwrap();
    }

    #[test]
    fn debouncer_fires_after_quiet_period() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_millis(500));
        assert!(!debouncer.due(start));

        debouncer.mark_dirty(start);
        debouncer.mark_dirty(start + Duration::from_millis(300));
        assert!(!debouncer.due(start + Duration::from_millis(600)));
        assert!(debouncer.due(start + Duration::from_millis(800)));
        assert!(!debouncer.is_dirty());
        assert!(!debouncer.due(start + Duration::from_millis(900)));
    }
}
