//! Durable snapshots of conversations, one record per conversation id.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::error::ChatError;
use crate::events::Conversation;

/// Key-value persistence for conversations.
///
/// `save` and `remove` must be durable when they return `Ok`.
pub trait SnapshotStore: Send + Sync {
    fn load_all(&self) -> Result<Vec<Conversation>, ChatError>;
    fn save(&self, conversation: &Conversation) -> Result<(), ChatError>;
    fn remove(&self, id: &str) -> Result<(), ChatError>;
}

impl<T: SnapshotStore + ?Sized> SnapshotStore for Arc<T> {
    fn load_all(&self) -> Result<Vec<Conversation>, ChatError> {
        (**self).load_all()
    }

    fn save(&self, conversation: &Conversation) -> Result<(), ChatError> {
        (**self).save(conversation)
    }

    fn remove(&self, id: &str) -> Result<(), ChatError> {
        (**self).remove(id)
    }
}

/// One pretty-printed JSON file per conversation
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, ChatError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .map_err(|e| ChatError::storage("Failed to create conversations directory", e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

impl SnapshotStore for FileStore {
    fn load_all(&self) -> Result<Vec<Conversation>, ChatError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| ChatError::storage("Failed to read conversations directory", e))?;

        let mut conversations = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| ChatError::storage("Failed to read directory entry", e))?;
            let path = entry.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }

            let parsed = fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|content| {
                    serde_json::from_str::<Conversation>(&content).map_err(|e| e.to_string())
                });
            match parsed {
                Ok(conversation) => conversations.push(conversation),
                Err(e) => warn!("Skipping unreadable conversation {}: {}", path.display(), e),
            }
        }

        Ok(conversations)
    }

    fn save(&self, conversation: &Conversation) -> Result<(), ChatError> {
        let content = serde_json::to_string_pretty(conversation)
            .map_err(|e| ChatError::storage("Failed to serialize conversation", e))?;

        // Write-then-rename so a crash never leaves a torn file behind.
        let path = self.path_for(&conversation.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", conversation.id));
        let mut file = fs::File::create(&tmp)
            .map_err(|e| ChatError::storage("Failed to create snapshot", e))?;
        file.write_all(content.as_bytes())
            .map_err(|e| ChatError::storage("Failed to write snapshot", e))?;
        file.sync_all()
            .map_err(|e| ChatError::storage("Failed to sync snapshot", e))?;
        fs::rename(&tmp, &path)
            .map_err(|e| ChatError::storage("Failed to commit snapshot", e))?;
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), ChatError> {
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ChatError::storage("Failed to delete conversation", e)),
        }
    }
}

/// Non-durable store for tests and `--ephemeral` sessions
#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<String, Conversation>>,
    fail_writes: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conversations(conversations: impl IntoIterator<Item = Conversation>) -> Self {
        let store = Self::default();
        if let Ok(mut records) = store.records.lock() {
            for conversation in conversations {
                records.insert(conversation.id.clone(), conversation);
            }
        }
        store
    }

    /// Make every later `save`/`remove` fail
    pub fn fail_writes(&self, fail: bool) {
        if let Ok(mut flag) = self.fail_writes.lock() {
            *flag = fail;
        }
    }

    pub fn snapshot(&self, id: &str) -> Option<Conversation> {
        self.records.lock().ok()?.get(id).cloned()
    }

    fn check_writable(&self) -> Result<(), ChatError> {
        match self.fail_writes.lock() {
            Ok(flag) if *flag => Err(ChatError::Storage("writes are disabled".to_string())),
            _ => Ok(()),
        }
    }
}

impl SnapshotStore for MemoryStore {
    fn load_all(&self) -> Result<Vec<Conversation>, ChatError> {
        let records = self
            .records
            .lock()
            .map_err(|e| ChatError::storage("Memory store poisoned", e))?;
        Ok(records.values().cloned().collect())
    }

    fn save(&self, conversation: &Conversation) -> Result<(), ChatError> {
        self.check_writable()?;
        let mut records = self
            .records
            .lock()
            .map_err(|e| ChatError::storage("Memory store poisoned", e))?;
        records.insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    fn remove(&self, id: &str) -> Result<(), ChatError> {
        self.check_writable()?;
        let mut records = self
            .records
            .lock()
            .map_err(|e| ChatError::storage("Memory store poisoned", e))?;
        records.remove(id);
        Ok(())
    }
}
