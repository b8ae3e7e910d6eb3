//! Error types surfaced by the chat pipeline.
//!
//! Every error carries a kind and a short remediation hint so the UI can show
//! something actionable without knowing where the failure happened.

use std::fmt;
use strum::{AsRefStr, Display, EnumIter};
use thiserror::Error;

/// Classification of a [`ChatError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr, EnumIter)]
pub enum ErrorKind {
    TransientNetworkError,
    AuthenticationError,
    BadRequestError,
    NotFoundError,
    BusyError,
    ConfigurationError,
    StorageError,
}

/// The error type shared by the transport, the store and the orchestrator.
///
/// Displays as `<kind>: <detail>; <hint>`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// Connection failure, timeout or 5xx response. Retried by the transport
    /// and only surfaced once every attempt failed.
    TransientNetwork { message: String, attempts: u32 },

    /// 401/403 from the endpoint or a rejected credential.
    Authentication(String),

    /// Any other 4xx, or a request that is malformed before it is sent.
    BadRequest(String),

    NotFound(String),

    Busy(String),

    Configuration(String),

    Storage(String),
}

impl fmt::Display for ChatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}; {}", self.kind(), self.detail(), self.hint())
    }
}

impl ChatError {
    pub fn transient(message: impl Into<String>) -> Self {
        ChatError::TransientNetwork {
            message: message.into(),
            attempts: 1,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ChatError::TransientNetwork { .. } => ErrorKind::TransientNetworkError,
            ChatError::Authentication(_) => ErrorKind::AuthenticationError,
            ChatError::BadRequest(_) => ErrorKind::BadRequestError,
            ChatError::NotFound(_) => ErrorKind::NotFoundError,
            ChatError::Busy(_) => ErrorKind::BusyError,
            ChatError::Configuration(_) => ErrorKind::ConfigurationError,
            ChatError::Storage(_) => ErrorKind::StorageError,
        }
    }

    /// What went wrong, without the kind or the hint
    pub fn detail(&self) -> String {
        match self {
            ChatError::TransientNetwork { message, attempts } => {
                format!("{} (after {} attempt(s))", message, attempts)
            }
            ChatError::NotFound(id) => format!("no conversation with id {}", id),
            ChatError::Busy(id) => {
                format!("conversation {} already has a response in progress", id)
            }
            ChatError::Authentication(detail)
            | ChatError::BadRequest(detail)
            | ChatError::Configuration(detail)
            | ChatError::Storage(detail) => detail.clone(),
        }
    }

    /// Short human-readable remediation for the UI.
    pub fn hint(&self) -> &'static str {
        match self.kind() {
            ErrorKind::TransientNetworkError => "check network connectivity and try again",
            ErrorKind::AuthenticationError => "verify the API key",
            ErrorKind::BadRequestError => "check the model name and the message contents",
            ErrorKind::NotFoundError => "refresh the conversation list",
            ErrorKind::BusyError => "wait for the current response or cancel it",
            ErrorKind::ConfigurationError => "fix the configuration and restart",
            ErrorKind::StorageError => "check that the data directory is writable",
        }
    }

    /// Whether the transport may retry after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::TransientNetwork { .. })
    }

    /// Map a non-success HTTP status to an error. 4xx is never retried.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = extract_error_message(body).unwrap_or_else(|| body.trim().to_string());
        let message = if detail.is_empty() {
            format!("HTTP {}", status)
        } else {
            format!("HTTP {}: {}", status, detail)
        };
        match status {
            401 | 403 => ChatError::Authentication(message),
            400..=499 => ChatError::BadRequest(message),
            _ => ChatError::transient(message),
        }
    }

    /// Classify a reqwest failure that happened before or during the response.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return ChatError::from_status(status.as_u16(), "");
        }
        if err.is_builder() {
            return ChatError::BadRequest(format!("invalid request: {}", err));
        }
        if err.is_timeout() {
            return ChatError::transient(format!("request timed out: {}", err));
        }
        if err.is_connect() {
            return ChatError::transient(format!("connection error: {}", err));
        }
        ChatError::transient(format!("request failed: {}", err))
    }

    pub(crate) fn storage(context: &str, err: impl std::fmt::Display) -> Self {
        ChatError::Storage(format!("{}: {}", context, err))
    }
}

/// Pull `error.message` out of an OpenAI-style error body.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .map(String::from)
}
