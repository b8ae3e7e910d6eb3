use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ChatError;
use crate::events::{Conversation, ConversationSummary, Feedback, Message, Role, DEFAULT_TITLE};
use crate::llm::RequestMessage;
use crate::storage::SnapshotStore;

/// Registry of all conversations, written through to a [`SnapshotStore`].
///
/// Every mutation runs under one lock, is applied to a copy, persisted, and
/// only then committed in memory. A failed write leaves the registry as it
/// was.
pub struct ConversationStore {
    backend: Box<dyn SnapshotStore>,
    inner: Mutex<StoreState>,
}

struct StoreState {
    conversations: HashMap<String, Conversation>,
    /// Last stamp handed out; stamps are strictly increasing
    last_stamp: DateTime<Utc>,
}

impl StoreState {
    fn next_stamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let stamp = if now > self.last_stamp {
            now
        } else {
            self.last_stamp + Duration::microseconds(1)
        };
        self.last_stamp = stamp;
        stamp
    }
}

impl ConversationStore {
    /// Load every persisted conversation from `backend`
    pub fn open(backend: Box<dyn SnapshotStore>) -> Result<Self, ChatError> {
        let loaded = backend.load_all()?;
        let last_stamp = loaded
            .iter()
            .map(|c| c.updated_at)
            .max()
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let conversations: HashMap<_, _> = loaded.into_iter().map(|c| (c.id.clone(), c)).collect();
        info!(count = conversations.len(), "Loaded conversations");

        Ok(Self {
            backend,
            inner: Mutex::new(StoreState {
                conversations,
                last_stamp,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        // Writes commit only after persisting, so a poisoned map is still consistent.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Create an empty conversation
    pub fn create(&self, title: Option<&str>) -> Result<Conversation, ChatError> {
        let mut state = self.state();
        let now = state.next_stamp();
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TITLE);

        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            likes: 0,
            dislikes: 0,
        };
        self.backend.save(&conversation)?;
        state
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        debug!(id = %conversation.id, "Created conversation");
        Ok(conversation)
    }

    pub fn get(&self, id: &str) -> Result<Conversation, ChatError> {
        self.state()
            .conversations
            .get(id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state().conversations.contains_key(id)
    }

    /// Append a message at the tail and advance `updated_at`
    pub fn append(&self, id: &str, message: Message) -> Result<(), ChatError> {
        self.mutate(id, |conversation| {
            conversation.messages.push(message);
            Ok(())
        })
    }

    /// Append several messages as one durable write
    pub fn append_all(&self, id: &str, messages: Vec<Message>) -> Result<(), ChatError> {
        self.mutate(id, |conversation| {
            conversation.messages.extend(messages);
            Ok(())
        })
    }

    /// Replace every message from index `from` on, as one durable write
    pub fn replace_tail(
        &self,
        id: &str,
        from: usize,
        messages: Vec<Message>,
    ) -> Result<(), ChatError> {
        self.mutate(id, |conversation| {
            if from > conversation.messages.len() {
                return Err(ChatError::BadRequest(format!(
                    "message {} is past the end of the conversation",
                    from
                )));
            }
            conversation.messages.truncate(from);
            conversation.messages.extend(messages);
            Ok(())
        })
    }

    pub fn rename(&self, id: &str, title: &str) -> Result<(), ChatError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::BadRequest("title must not be empty".to_string()));
        }
        self.mutate(id, |conversation| {
            conversation.title = title.to_string();
            Ok(())
        })
    }

    /// Drop the newest message, returning it
    pub fn remove_last(&self, id: &str) -> Result<Option<Message>, ChatError> {
        let mut removed = None;
        self.mutate(id, |conversation| {
            removed = conversation.messages.pop();
            Ok(())
        })?;
        Ok(removed)
    }

    pub fn rate(&self, id: &str, feedback: Feedback) -> Result<(), ChatError> {
        self.mutate(id, |conversation| {
            match feedback {
                Feedback::Like => conversation.likes += 1,
                Feedback::Dislike => conversation.dislikes += 1,
            }
            Ok(())
        })
    }

    pub fn delete(&self, id: &str) -> Result<(), ChatError> {
        let mut state = self.state();
        if !state.conversations.contains_key(id) {
            return Err(ChatError::NotFound(id.to_string()));
        }
        self.backend.remove(id)?;
        state.conversations.remove(id);
        debug!(id, "Deleted conversation");
        Ok(())
    }

    /// Summaries ordered by `updated_at`, newest first
    pub fn list(&self) -> Vec<ConversationSummary> {
        let state = self.state();
        let mut summaries: Vec<_> = state.conversations.values().map(Conversation::summary).collect();
        summaries.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Id of the most recently updated conversation
    pub fn most_recent(&self) -> Option<String> {
        self.list().into_iter().next().map(|s| s.id)
    }

    /// Messages of a conversation in request form, excluding system entries
    pub fn history(&self, id: &str) -> Result<Vec<RequestMessage>, ChatError> {
        let conversation = self.get(id)?;
        Ok(conversation
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(RequestMessage::from)
            .collect())
    }

    fn mutate<F>(&self, id: &str, apply: F) -> Result<(), ChatError>
    where
        F: FnOnce(&mut Conversation) -> Result<(), ChatError>,
    {
        let mut state = self.state();
        let mut updated = state
            .conversations
            .get(id)
            .cloned()
            .ok_or_else(|| ChatError::NotFound(id.to_string()))?;

        apply(&mut updated)?;
        updated.updated_at = state.next_stamp().max(updated.updated_at);

        self.backend.save(&updated)?;
        state.conversations.insert(id.to_string(), updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileStore, MemoryStore};
    use std::sync::Arc;

    fn memory_store() -> ConversationStore {
        ConversationStore::open(Box::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn create_uses_default_or_given_title() {
        let store = memory_store();
        let a = store.create(None).unwrap();
        let b = store.create(Some("  Rust questions ")).unwrap();
        assert_eq!(a.title, DEFAULT_TITLE);
        assert_eq!(b.title, "Rust questions");
        assert_ne!(a.id, b.id);
        assert!(a.messages.is_empty());
    }

    #[test]
    fn append_puts_message_at_tail_and_advances_updated_at() {
        let store = memory_store();
        let id = store.create(None).unwrap().id;
        store.append(&id, Message::user("hi")).unwrap();
        let before = store.get(&id).unwrap();

        store.append(&id, Message::assistant("hello", None)).unwrap();
        let after = store.get(&id).unwrap();

        assert_eq!(after.messages.len(), before.messages.len() + 1);
        assert_eq!(after.messages.last().unwrap().content, "hello");
        assert!(after.updated_at > before.updated_at);
    }

    #[test]
    fn unknown_id_is_not_found() {
        let store = memory_store();
        assert_eq!(
            store.append("nope", Message::user("x")),
            Err(ChatError::NotFound("nope".to_string()))
        );
        assert!(matches!(store.get("nope"), Err(ChatError::NotFound(_))));
        assert!(matches!(store.rename("nope", "t"), Err(ChatError::NotFound(_))));
        assert!(matches!(store.delete("nope"), Err(ChatError::NotFound(_))));
    }

    #[test]
    fn list_orders_by_most_recent_update() {
        let store = memory_store();
        let a = store.create(Some("a")).unwrap().id;
        let b = store.create(Some("b")).unwrap().id;
        let c = store.create(Some("c")).unwrap().id;
        store.append(&a, Message::user("bump")).unwrap();

        let ids: Vec<_> = store.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.clone(), c.clone(), b.clone()]);
        assert_eq!(store.most_recent(), Some(a));
    }

    #[test]
    fn delete_removes_from_list() {
        let store = memory_store();
        let a = store.create(None).unwrap().id;
        let b = store.create(None).unwrap().id;
        store.delete(&a).unwrap();
        let ids: Vec<_> = store.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![b]);
        assert!(!store.contains(&a));
    }

    #[test]
    fn failed_write_leaves_memory_unchanged() {
        let backend = Arc::new(MemoryStore::new());
        let store = ConversationStore::open(Box::new(backend.clone())).unwrap();
        let id = store.create(None).unwrap().id;

        backend.fail_writes(true);
        assert!(matches!(
            store.append(&id, Message::user("lost")),
            Err(ChatError::Storage(_))
        ));
        assert!(matches!(store.delete(&id), Err(ChatError::Storage(_))));
        let conversation = store.get(&id).unwrap();
        assert!(conversation.messages.is_empty());
    }

    #[test]
    fn remove_last_and_rate() {
        let store = memory_store();
        let id = store.create(None).unwrap().id;
        assert_eq!(store.remove_last(&id).unwrap(), None);
        store.append(&id, Message::user("one")).unwrap();
        store.append(&id, Message::user("two")).unwrap();
        assert_eq!(store.remove_last(&id).unwrap().unwrap().content, "two");

        store.rate(&id, Feedback::Like).unwrap();
        store.rate(&id, Feedback::Like).unwrap();
        store.rate(&id, Feedback::Dislike).unwrap();
        let summary = &store.list()[0];
        assert_eq!((summary.likes, summary.dislikes), (2, 1));
        assert_eq!(summary.message_count, 1);
    }

    #[test]
    fn mutations_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = {
            let store = ConversationStore::open(Box::new(FileStore::new(dir.path()).unwrap())).unwrap();
            let id = store.create(None).unwrap().id;
            store.append(&id, Message::user("hi")).unwrap();
            store.rename(&id, "Greetings").unwrap();
            id
        };

        let store = ConversationStore::open(Box::new(FileStore::new(dir.path()).unwrap())).unwrap();
        let conversation = store.get(&id).unwrap();
        assert_eq!(conversation.title, "Greetings");
        assert_eq!(conversation.messages.len(), 1);

        // Stamps keep increasing past what was loaded.
        store.append(&id, Message::user("again")).unwrap();
        assert!(store.get(&id).unwrap().updated_at > conversation.updated_at);
    }

    #[test]
    fn history_skips_system_messages() {
        let store = memory_store();
        let id = store.create(None).unwrap().id;
        store
            .append_all(
                &id,
                vec![
                    Message::system("note"),
                    Message::user("hi"),
                    Message::assistant("hello", Some("greeting".into())),
                ],
            )
            .unwrap();
        let history = store.history(&id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[1].content, "hello");
    }

    #[test]
    fn replace_tail_swaps_the_last_exchange() {
        let store = memory_store();
        let id = store.create(None).unwrap().id;
        store
            .append_all(
                &id,
                vec![
                    Message::user("hi"),
                    Message::user("what is 2+2"),
                    Message::assistant("five", None),
                ],
            )
            .unwrap();

        store
            .replace_tail(&id, 1, vec![Message::user("what is 2+2"), Message::assistant("4", None)])
            .unwrap();
        let contents: Vec<_> = store.get(&id).unwrap().messages.into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["hi", "what is 2+2", "4"]);

        assert!(matches!(
            store.replace_tail(&id, 4, vec![Message::user("x")]),
            Err(ChatError::BadRequest(_))
        ));
        assert_eq!(store.get(&id).unwrap().messages.len(), 3);
    }

    #[test]
    fn empty_title_is_rejected() {
        let store = memory_store();
        let id = store.create(None).unwrap().id;
        assert!(matches!(store.rename(&id, "  "), Err(ChatError::BadRequest(_))));
    }
}
