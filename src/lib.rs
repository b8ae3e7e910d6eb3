//! Streaming multi-conversation chat front-end for OpenAI-compatible
//! chat-completions endpoints.

pub mod agent;
pub mod commands;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod llm;
pub mod prompts;
pub mod session;
pub mod storage;
pub mod streaming;

pub use agent::{ChatOrchestrator, ChatSettings, Outcome, Submission, SubmissionState, SubmitOptions};
pub use config::Config;
pub use error::{ChatError, ErrorKind};
pub use events::{Conversation, DisplayUpdate, Message, Role, UiEvent, UpdateKind};
pub use llm::{HttpTransport, RawFragment, RetryPolicy, RetryableTransport, Transport};
pub use session::ConversationStore;
pub use streaming::StreamAssembler;
