use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::ChatError;

/// Title given to conversations until something better is known.
pub const DEFAULT_TITLE: &str = "New conversation";

/// Role of a message author
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// Single entry of a conversation. Never modified after it is appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Set on assistant messages saved from a stream that failed midway.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            thinking: None,
            timestamp: Utc::now(),
            incomplete: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>, thinking: Option<String>) -> Self {
        let mut message = Self::new(Role::Assistant, content);
        message.thinking = thinking.filter(|t| !t.is_empty());
        message
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn mark_incomplete(mut self) -> Self {
        self.incomplete = true;
        self
    }
}

/// A conversation thread and everything persisted about it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub likes: u32,
    #[serde(default)]
    pub dislikes: u32,
}

impl Conversation {
    pub fn summary(&self) -> ConversationSummary {
        ConversationSummary {
            id: self.id.clone(),
            title: self.title.clone(),
            updated_at: self.updated_at,
            message_count: self.messages.len(),
            likes: self.likes,
            dislikes: self.dislikes,
        }
    }

    pub fn has_default_title(&self) -> bool {
        self.title == DEFAULT_TITLE
    }
}

/// What the conversation list shows for one conversation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub updated_at: DateTime<Utc>,
    pub message_count: usize,
    pub likes: u32,
    pub dislikes: u32,
}

/// User verdict on a conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Feedback {
    Like,
    Dislike,
}

/// What a display update represents
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    /// More text arrived; the stream is still open
    Partial,
    /// The stream ended normally; `text` is the complete answer
    Final,
    /// The stream ended with an error; `text` is whatever arrived before it
    Error(ChatError),
}

/// Snapshot of an in-flight answer handed to the UI.
///
/// `text` and `thinking` always hold everything accumulated so far, not just
/// the newest delta, so a sink can simply redraw.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayUpdate {
    pub conversation_id: String,
    /// Position in this stream's update sequence, starting at 0
    pub seq: u64,
    pub text: String,
    pub thinking: String,
    pub kind: UpdateKind,
}

impl DisplayUpdate {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.kind, UpdateKind::Partial)
    }
}

/// Events delivered to the UI sink
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// Streaming output for one conversation, in emission order
    Display(DisplayUpdate),
    /// The conversation list changed (create, rename, delete, new messages)
    Conversations(Vec<ConversationSummary>),
    /// A different conversation became active
    ActiveChanged(Option<String>),
    /// A conversation got a generated or provisional title
    TitleChanged { id: String, title: String },
    /// A submission failed after its display stream ended, such as a
    /// finished answer that could not be saved
    Failed { id: String, error: ChatError },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn role_names_match_wire_format() {
        assert_eq!(Role::Assistant.as_ref(), "assistant");
        assert_eq!(Role::from_str("user").unwrap(), Role::User);
        assert_eq!(serde_json::to_string(&Role::System).unwrap(), "\"system\"");
    }

    #[test]
    fn complete_messages_omit_optional_fields() {
        let json = serde_json::to_value(Message::assistant("4", Some(String::new()))).unwrap();
        assert!(json.get("thinking").is_none());
        assert!(json.get("incomplete").is_none());

        let partial = Message::assistant("4 is", Some("adding".into())).mark_incomplete();
        let json = serde_json::to_value(&partial).unwrap();
        assert_eq!(json["thinking"], "adding");
        assert_eq!(json["incomplete"], true);
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, partial);
    }

    #[test]
    fn feedback_parses_lowercase() {
        assert_eq!(Feedback::from_str("like").unwrap(), Feedback::Like);
        assert_eq!(Feedback::Dislike.to_string(), "dislike");
    }
}
