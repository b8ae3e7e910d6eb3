use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use strum::{AsRefStr, Display};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, ThrottleConfig};
use crate::error::ChatError;
use crate::events::{
    Conversation, ConversationSummary, Feedback, Message, Role, UiEvent, UpdateKind,
};
use crate::llm::{CompletionRequest, RequestMessage, RetryableTransport};
use crate::prompts::PromptLibrary;
use crate::session::ConversationStore;
use crate::streaming::StreamAssembler;

/// Longest title kept from a first message or a generated title
const TITLE_MAX_CHARS: usize = 20;

/// Messages from the end of a conversation shown to the title generator
const TITLE_CONTEXT_MESSAGES: usize = 6;

const TITLE_PROMPT: &str = "You generate conversation titles. Given a conversation between a user \
and an assistant, reply with one concise title of at most 20 characters that names its main topic. \
Reply with the title only.";

/// Where a conversation's current or latest submission stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum SubmissionState {
    Idle,
    Sending,
    Streaming,
    Completed,
    Failed,
    Cancelled,
}

impl SubmissionState {
    pub fn is_in_flight(self) -> bool {
        matches!(self, SubmissionState::Sending | SubmissionState::Streaming)
    }
}

/// How a submission ended
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The assistant message that was appended
    Completed(Message),
    Failed(ChatError),
    Cancelled,
}

impl Outcome {
    pub fn state(&self) -> SubmissionState {
        match self {
            Outcome::Completed(_) => SubmissionState::Completed,
            Outcome::Failed(_) => SubmissionState::Failed,
            Outcome::Cancelled => SubmissionState::Cancelled,
        }
    }
}

/// Per-submission overrides of the configured defaults
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    pub template: Option<String>,
    pub stream: Option<bool>,
    pub model: Option<String>,
}

/// Handle to a running submission
#[derive(Debug)]
pub struct Submission {
    conversation_id: String,
    outcome: oneshot::Receiver<Outcome>,
}

impl Submission {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Wait for the submission to finish
    pub async fn wait(self) -> Outcome {
        self.outcome.await.unwrap_or_else(|_| {
            Outcome::Failed(ChatError::transient("response task stopped unexpectedly"))
        })
    }
}

/// Defaults the orchestrator applies to each submission
#[derive(Debug, Clone)]
pub struct ChatSettings {
    pub model: String,
    pub stream: bool,
    pub default_template: String,
    pub auto_title: bool,
    pub throttle: ThrottleConfig,
}

impl ChatSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            model: config.model.clone(),
            stream: config.stream,
            default_template: config.default_template.clone(),
            auto_title: config.auto_title,
            throttle: config.throttle,
        }
    }
}

struct Tracked {
    state: SubmissionState,
    cancel: CancellationToken,
}

/// Submission states by conversation id
#[derive(Clone, Default)]
struct Submissions {
    inner: Arc<Mutex<HashMap<String, Tracked>>>,
}

impl Submissions {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Tracked>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim a conversation for a new submission
    fn begin(&self, id: &str) -> Result<FlightGuard, ChatError> {
        let mut map = self.lock();
        let previous = map.get(id).map(|t| t.state);
        if previous.is_some_and(SubmissionState::is_in_flight) {
            return Err(ChatError::Busy(id.to_string()));
        }
        let cancel = CancellationToken::new();
        map.insert(
            id.to_string(),
            Tracked {
                state: SubmissionState::Sending,
                cancel: cancel.clone(),
            },
        );
        Ok(FlightGuard {
            submissions: self.clone(),
            id: id.to_string(),
            cancel,
            previous,
        })
    }

    fn set(&self, id: &str, state: SubmissionState) {
        if let Some(tracked) = self.lock().get_mut(id) {
            tracked.state = state;
        }
    }

    fn state(&self, id: &str) -> SubmissionState {
        self.lock()
            .get(id)
            .map(|t| t.state)
            .unwrap_or(SubmissionState::Idle)
    }

    fn cancel(&self, id: &str) -> bool {
        match self.lock().get(id) {
            Some(tracked) if tracked.state.is_in_flight() => {
                tracked.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn forget(&self, id: &str) {
        let mut map = self.lock();
        if map.get(id).is_some_and(|t| !t.state.is_in_flight()) {
            map.remove(id);
        }
    }
}

/// What a submission adds to its conversation
struct Turn {
    user_text: String,
    /// Messages from this index on are replaced when the turn is saved;
    /// `None` appends.
    replace_from: Option<usize>,
}

/// Holds a conversation's in-flight slot; a submission that ends without
/// recording an outcome is marked failed on drop.
struct FlightGuard {
    submissions: Submissions,
    id: String,
    cancel: CancellationToken,
    previous: Option<SubmissionState>,
}

impl FlightGuard {
    fn set(&self, state: SubmissionState) {
        self.submissions.set(&self.id, state);
    }

    /// Give the slot back before anything was sent
    fn abandon(self) {
        let mut map = self.submissions.lock();
        match self.previous {
            Some(state) => {
                if let Some(tracked) = map.get_mut(&self.id) {
                    tracked.state = state;
                }
            }
            None => {
                map.remove(&self.id);
            }
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let mut map = self.submissions.lock();
        if let Some(tracked) = map.get_mut(&self.id) {
            if tracked.state.is_in_flight() {
                tracked.state = SubmissionState::Failed;
            }
        }
    }
}

/// Coordinates conversations, the transport and the UI sink.
///
/// Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct ChatOrchestrator {
    store: Arc<ConversationStore>,
    transport: RetryableTransport,
    prompts: Arc<PromptLibrary>,
    settings: Arc<ChatSettings>,
    ui: mpsc::UnboundedSender<UiEvent>,
    active: Arc<Mutex<Option<String>>>,
    submissions: Submissions,
}

impl ChatOrchestrator {
    /// The most recently updated conversation starts out active
    pub fn new(
        store: Arc<ConversationStore>,
        transport: RetryableTransport,
        prompts: PromptLibrary,
        settings: ChatSettings,
        ui: mpsc::UnboundedSender<UiEvent>,
    ) -> Self {
        let active = store.most_recent();
        Self {
            store,
            transport,
            prompts: Arc::new(prompts),
            settings: Arc::new(settings),
            ui,
            active: Arc::new(Mutex::new(active)),
            submissions: Submissions::default(),
        }
    }

    pub fn prompts(&self) -> &PromptLibrary {
        &self.prompts
    }

    pub fn settings(&self) -> &ChatSettings {
        &self.settings
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<String>> {
        self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, event: UiEvent) {
        // A closed sink only means nobody is watching.
        let _ = self.ui.send(event);
    }

    fn publish_list(&self) {
        self.publish(UiEvent::Conversations(self.store.list()));
    }

    fn set_active(&self, id: Option<String>) {
        *self.active_slot() = id.clone();
        self.publish(UiEvent::ActiveChanged(id));
    }

    pub fn active(&self) -> Option<String> {
        self.active_slot().clone()
    }

    pub fn list(&self) -> Vec<ConversationSummary> {
        self.store.list()
    }

    pub fn conversation(&self, id: &str) -> Result<Conversation, ChatError> {
        self.store.get(id)
    }

    /// Messages of a conversation in order
    pub fn history(&self, id: &str) -> Result<Vec<Message>, ChatError> {
        Ok(self.store.get(id)?.messages)
    }

    /// Create a conversation and make it active
    pub fn new_conversation(&self, title: Option<&str>) -> Result<Conversation, ChatError> {
        let conversation = self.store.create(title)?;
        info!(id = %conversation.id, "New conversation");
        self.set_active(Some(conversation.id.clone()));
        self.publish_list();
        Ok(conversation)
    }

    pub fn switch_to(&self, id: &str) -> Result<Conversation, ChatError> {
        let conversation = self.store.get(id)?;
        self.set_active(Some(conversation.id.clone()));
        Ok(conversation)
    }

    pub fn rename(&self, id: &str, title: &str) -> Result<(), ChatError> {
        self.store.rename(id, title)?;
        self.publish_list();
        Ok(())
    }

    /// Delete a conversation. If it was active, the most recently updated
    /// remaining one becomes active, or a fresh one when none is left.
    pub fn delete(&self, id: &str) -> Result<(), ChatError> {
        self.submissions.cancel(id);
        self.store.delete(id)?;
        self.submissions.forget(id);
        info!(id, "Deleted conversation");

        if self.active().as_deref() == Some(id) {
            match self.store.most_recent() {
                Some(next) => self.set_active(Some(next)),
                None => {
                    let fresh = self.store.create(None)?;
                    self.set_active(Some(fresh.id));
                }
            }
        }
        self.publish_list();
        Ok(())
    }

    pub fn rate(&self, id: &str, feedback: Feedback) -> Result<(), ChatError> {
        self.store.rate(id, feedback)?;
        self.publish_list();
        Ok(())
    }

    pub fn state(&self, id: &str) -> SubmissionState {
        self.submissions.state(id)
    }

    /// Stop the in-flight submission of a conversation, if any
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = self.submissions.cancel(id);
        if cancelled {
            info!(id, "Cancelling submission");
        }
        cancelled
    }

    /// Send a user message to the active conversation, creating one first
    /// when none is active.
    pub fn submit(&self, text: &str, options: SubmitOptions) -> Result<Submission, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::BadRequest("message must not be empty".to_string()));
        }
        let system_text = self.system_text(&options)?;

        let id = match self.active() {
            Some(id) if self.store.contains(&id) => id,
            _ => self.new_conversation(None)?.id,
        };
        let user_text = text.to_string();
        self.start_turn(&id, system_text, options, |_| {
            Ok(Turn {
                user_text,
                replace_from: None,
            })
        })
    }

    /// Ask again for the last answer. The last user message and everything
    /// after it are replaced only once the new answer is saved.
    pub fn regenerate(&self, id: &str, options: SubmitOptions) -> Result<Submission, ChatError> {
        self.resubmit(id, None, options)
    }

    /// Replace the last user message with `text` and ask again
    pub fn edit_last(
        &self,
        id: &str,
        text: &str,
        options: SubmitOptions,
    ) -> Result<Submission, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::BadRequest("message must not be empty".to_string()));
        }
        self.resubmit(id, Some(text.to_string()), options)
    }

    fn resubmit(
        &self,
        id: &str,
        replacement: Option<String>,
        options: SubmitOptions,
    ) -> Result<Submission, ChatError> {
        let system_text = self.system_text(&options)?;
        self.start_turn(id, system_text, options, |conversation| {
            let Some(user_index) = conversation.messages.iter().rposition(|m| m.role == Role::User)
            else {
                return Err(ChatError::BadRequest("no user message to ask again".to_string()));
            };
            debug!(id, edited = replacement.is_some(), "Asking again");
            Ok(Turn {
                user_text: replacement
                    .unwrap_or_else(|| conversation.messages[user_index].content.clone()),
                replace_from: Some(user_index),
            })
        })
    }

    /// Remove the newest message of a conversation
    pub fn undo(&self, id: &str) -> Result<Option<Message>, ChatError> {
        if self.submissions.state(id).is_in_flight() {
            return Err(ChatError::Busy(id.to_string()));
        }
        let removed = self.store.remove_last(id)?;
        self.publish_list();
        Ok(removed)
    }

    fn system_text(&self, options: &SubmitOptions) -> Result<String, ChatError> {
        let name = options
            .template
            .as_deref()
            .unwrap_or(&self.settings.default_template);
        Ok(self.prompts.get(name)?.system_text.clone())
    }

    /// Claim the conversation, then build the request from what `prepare`
    /// decides against the conversation as it stands.
    fn start_turn<F>(
        &self,
        id: &str,
        system_text: String,
        options: SubmitOptions,
        prepare: F,
    ) -> Result<Submission, ChatError>
    where
        F: FnOnce(&Conversation) -> Result<Turn, ChatError>,
    {
        let guard = self.submissions.begin(id)?;
        let (turn, request) = match self.build_request(id, system_text, options, prepare) {
            Ok(built) => built,
            Err(e) => {
                guard.abandon();
                return Err(e);
            }
        };
        debug!(id, messages = request.messages.len(), "Submitting");

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let this = self.clone();
        let conversation_id = id.to_string();
        let id = id.to_string();
        tokio::spawn(async move {
            let outcome = this.run_turn(&id, turn, request, &guard).await;
            guard.set(outcome.state());
            let _ = outcome_tx.send(outcome);
        });

        Ok(Submission {
            conversation_id,
            outcome: outcome_rx,
        })
    }

    fn build_request<F>(
        &self,
        id: &str,
        system_text: String,
        options: SubmitOptions,
        prepare: F,
    ) -> Result<(Turn, CompletionRequest), ChatError>
    where
        F: FnOnce(&Conversation) -> Result<Turn, ChatError>,
    {
        let conversation = self.store.get(id)?;
        let turn = prepare(&conversation)?;
        let kept = turn.replace_from.unwrap_or(conversation.messages.len());

        let mut messages = vec![RequestMessage::new(Role::System, system_text)];
        messages.extend(
            conversation.messages[..kept]
                .iter()
                .filter(|m| m.role != Role::System)
                .map(RequestMessage::from),
        );
        messages.push(RequestMessage::new(Role::User, turn.user_text.clone()));

        let request = CompletionRequest::new(
            options.model.unwrap_or_else(|| self.settings.model.clone()),
            messages,
            options.stream.unwrap_or(self.settings.stream),
        );
        Ok((turn, request))
    }

    async fn run_turn(
        &self,
        id: &str,
        turn: Turn,
        request: CompletionRequest,
        guard: &FlightGuard,
    ) -> Outcome {
        let fragments = self.transport.send(request);
        let mut updates = StreamAssembler::new(id, self.settings.throttle).consume(fragments);
        let mut streaming = false;

        let last = loop {
            let update = tokio::select! {
                biased;
                _ = guard.cancel.cancelled() => {
                    info!(id, "Submission cancelled");
                    return Outcome::Cancelled;
                }
                update = updates.recv() => update,
            };
            let Some(update) = update else {
                break None;
            };
            if !streaming {
                streaming = true;
                guard.set(SubmissionState::Streaming);
            }
            let terminal = update.is_terminal();
            self.publish(UiEvent::Display(update.clone()));
            if terminal {
                break Some(update);
            }
        };

        let last = match last {
            Some(last) if last.kind != UpdateKind::Partial => last,
            _ => return self.fail(id, ChatError::transient("response stream ended unexpectedly")),
        };

        let thinking = Some(last.thinking).filter(|t| !t.is_empty());
        match last.kind {
            UpdateKind::Error(error) => {
                // An earlier exchange being asked again stays as it was.
                if !last.text.is_empty() && turn.replace_from.is_none() {
                    let partial = Message::assistant(last.text, thinking).mark_incomplete();
                    if let Err(e) = self.commit_turn(id, &turn, partial) {
                        error!(id, "Failed to save partial response: {}", e);
                    }
                }
                Outcome::Failed(error)
            }
            _ => {
                let reply = Message::assistant(last.text, thinking);
                match self.commit_turn(id, &turn, reply.clone()) {
                    Ok(()) => Outcome::Completed(reply),
                    Err(e) => self.fail(id, e),
                }
            }
        }
    }

    /// Report a failure the display stream did not carry
    fn fail(&self, id: &str, error: ChatError) -> Outcome {
        self.publish(UiEvent::Failed {
            id: id.to_string(),
            error: error.clone(),
        });
        Outcome::Failed(error)
    }

    /// Save the user message and the reply as one write
    fn commit_turn(&self, id: &str, turn: &Turn, reply: Message) -> Result<(), ChatError> {
        let first_turn = self.store.get(id)?.has_default_title();
        let messages = vec![Message::user(turn.user_text.clone()), reply];
        match turn.replace_from {
            Some(from) => self.store.replace_tail(id, from, messages),
            None => self.store.append_all(id, messages),
        }
        .inspect_err(|e| error!(id, "Failed to save turn: {}", e))?;

        if first_turn {
            let title = truncate_title(&turn.user_text);
            if !title.is_empty() && self.store.rename(id, &title).is_ok() {
                self.publish(UiEvent::TitleChanged {
                    id: id.to_string(),
                    title,
                });
            }
            if self.settings.auto_title {
                self.spawn_auto_title(id.to_string());
            }
        }
        self.publish_list();
        Ok(())
    }

    fn spawn_auto_title(&self, id: String) {
        let this = self.clone();
        tokio::spawn(async move {
            match this.generate_title(&id).await {
                Ok(title) => {
                    debug!(id = %id, %title, "Generated title");
                    this.publish(UiEvent::TitleChanged { id, title });
                    this.publish_list();
                }
                Err(e) => warn!(id = %id, "Could not generate a title: {}", e),
            }
        });
    }

    /// Ask the model for a title and store it
    pub async fn generate_title(&self, id: &str) -> Result<String, ChatError> {
        let conversation = self.store.get(id)?;
        let start = conversation.messages.len().saturating_sub(TITLE_CONTEXT_MESSAGES);
        let transcript: String = conversation.messages[start..]
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| format!("{}: {}\n", m.role, m.content))
            .collect();
        if transcript.is_empty() {
            return Err(ChatError::BadRequest("conversation has no messages".to_string()));
        }

        let request = CompletionRequest::new(
            self.settings.model.clone(),
            vec![
                RequestMessage::new(Role::System, TITLE_PROMPT),
                RequestMessage::new(
                    Role::User,
                    format!("Write a title for this conversation:\n\n{}", transcript),
                ),
            ],
            false,
        );
        let completion = self.transport.complete(request).await?;
        let title = truncate_title(completion.text.trim().trim_matches(|c| c == '"' || c == '\''));
        if title.is_empty() {
            return Err(ChatError::transient("model returned an empty title"));
        }
        self.store.rename(id, &title)?;
        Ok(title)
    }
}

/// First line of `text`, cut to the title length
fn truncate_title(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .chars()
        .take(TITLE_MAX_CHARS)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::llm::{RawFragment, RetryPolicy, ScriptedAttempt, ScriptedTransport};
    use crate::storage::MemoryStore;

    struct Harness {
        chat: ChatOrchestrator,
        transport: Arc<ScriptedTransport>,
        ui: mpsc::UnboundedReceiver<UiEvent>,
        backend: Arc<MemoryStore>,
    }

    fn harness(script: Vec<ScriptedAttempt>) -> Harness {
        harness_with(script, false)
    }

    fn harness_with(script: Vec<ScriptedAttempt>, auto_title: bool) -> Harness {
        let backend = Arc::new(MemoryStore::new());
        let store = Arc::new(ConversationStore::open(Box::new(backend.clone())).unwrap());
        let transport = Arc::new(ScriptedTransport::new(script));
        let (ui_tx, ui) = mpsc::unbounded_channel();
        let settings = ChatSettings {
            auto_title,
            ..ChatSettings::from_config(&Config::default())
        };
        let chat = ChatOrchestrator::new(
            store,
            RetryableTransport::new(transport.clone(), RetryPolicy::default()),
            PromptLibrary::default(),
            settings,
            ui_tx,
        );
        Harness {
            chat,
            transport,
            ui,
            backend,
        }
    }

    fn live() -> (mpsc::Sender<Result<RawFragment, ChatError>>, ScriptedAttempt) {
        let (tx, rx) = mpsc::channel(16);
        (tx, ScriptedAttempt::Live(rx))
    }

    #[tokio::test]
    async fn submit_creates_conversation_and_appends_turn() {
        let mut h = harness(vec![ScriptedAttempt::text(&["4", " is the", " answer"])]);

        let submission = h.chat.submit("what is 2+2", SubmitOptions::default()).unwrap();
        let id = submission.conversation_id().to_string();
        let outcome = submission.wait().await;

        let Outcome::Completed(reply) = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert_eq!(reply.content, "4 is the answer");
        assert_eq!(h.chat.active(), Some(id.clone()));
        assert_eq!(h.chat.state(&id), SubmissionState::Completed);

        let messages = h.chat.history(&id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "what is 2+2");
        assert_eq!(messages[1].role, Role::Assistant);

        let request = &h.transport.requests()[0];
        assert_eq!(request.messages[0].role, Role::System);
        assert_eq!(request.messages.last().unwrap().content, "what is 2+2");

        let mut last_display = None;
        while let Ok(event) = h.ui.try_recv() {
            if let UiEvent::Display(update) = event {
                last_display = Some(update);
            }
        }
        let last_display = last_display.unwrap();
        assert_eq!(last_display.kind, UpdateKind::Final);
        assert_eq!(last_display.text, "4 is the answer");
        assert_eq!(h.chat.conversation(&id).unwrap().title, "what is 2+2");
    }

    #[tokio::test]
    async fn history_is_sent_with_each_request() {
        let h = harness(vec![ScriptedAttempt::text(&["hello"]), ScriptedAttempt::text(&["4"])]);
        h.chat.submit("hi", SubmitOptions::default()).unwrap().wait().await;
        h.chat.submit("what is 2+2", SubmitOptions::default()).unwrap().wait().await;

        let roles: Vec<_> = h.transport.requests()[1].messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
    }

    #[tokio::test]
    async fn second_submit_while_streaming_is_busy() {
        let (tx, attempt) = live();
        let h = harness(vec![attempt]);

        let first = h.chat.submit("first", SubmitOptions::default()).unwrap();
        let id = first.conversation_id().to_string();
        tx.send(Ok(RawFragment::TextDelta("partial".into()))).await.unwrap();

        let err = h.chat.submit("second", SubmitOptions::default()).unwrap_err();
        assert_eq!(err, ChatError::Busy(id.clone()));
        assert!(h.chat.state(&id).is_in_flight());

        tx.send(Ok(RawFragment::TextDelta(" answer".into()))).await.unwrap();
        tx.send(Ok(RawFragment::EndOfStream)).await.unwrap();
        assert!(matches!(first.wait().await, Outcome::Completed(m) if m.content == "partial answer"));
        assert_eq!(h.chat.history(&id).unwrap().len(), 2);
        assert_eq!(h.transport.calls(), 1);
    }

    #[tokio::test]
    async fn cancel_leaves_messages_unchanged() {
        let (tx, attempt) = live();
        let h = harness(vec![attempt]);
        let id = h.chat.new_conversation(None).unwrap().id;

        let submission = h.chat.submit("tell me a story", SubmitOptions::default()).unwrap();
        tx.send(Ok(RawFragment::TextDelta("Once upon".into()))).await.unwrap();
        assert!(h.chat.cancel(&id));

        assert_eq!(submission.wait().await, Outcome::Cancelled);
        assert_eq!(h.chat.state(&id), SubmissionState::Cancelled);
        assert!(h.chat.history(&id).unwrap().is_empty());
        assert!(!h.chat.cancel(&id));
    }

    #[tokio::test]
    async fn failure_with_partial_text_is_saved_incomplete() {
        let h = harness(vec![ScriptedAttempt::Respond(vec![
            Ok(RawFragment::TextDelta("4 is".into())),
            Err(ChatError::transient("connection reset")),
        ])]);

        let submission = h.chat.submit("what is 2+2", SubmitOptions::default()).unwrap();
        let id = submission.conversation_id().to_string();
        assert!(matches!(submission.wait().await, Outcome::Failed(ChatError::TransientNetwork { .. })));

        let messages = h.chat.history(&id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "4 is");
        assert!(messages[1].incomplete);
        assert_eq!(h.chat.state(&id), SubmissionState::Failed);
    }

    #[tokio::test]
    async fn failure_without_text_appends_nothing() {
        let h = harness(vec![ScriptedAttempt::Fail(ChatError::from_status(401, "bad key"))]);

        let submission = h.chat.submit("hi", SubmitOptions::default()).unwrap();
        let id = submission.conversation_id().to_string();
        assert!(matches!(submission.wait().await, Outcome::Failed(ChatError::Authentication(_))));
        assert!(h.chat.history(&id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_before_sending() {
        let h = harness(vec![]);
        assert!(matches!(
            h.chat.submit("   ", SubmitOptions::default()),
            Err(ChatError::BadRequest(_))
        ));
        let options = SubmitOptions {
            template: Some("pirate".into()),
            ..SubmitOptions::default()
        };
        assert!(matches!(h.chat.submit("hi", options), Err(ChatError::Configuration(_))));
        assert_eq!(h.transport.calls(), 0);
        assert!(h.chat.list().is_empty());
    }

    #[tokio::test]
    async fn deleting_active_selects_most_recent() {
        let h = harness(vec![]);
        let a = h.chat.new_conversation(Some("a")).unwrap().id;
        let b = h.chat.new_conversation(Some("b")).unwrap().id;
        let c = h.chat.new_conversation(Some("c")).unwrap().id;
        h.chat.rename(&a, "a2").unwrap();
        h.chat.switch_to(&b).unwrap();

        h.chat.delete(&b).unwrap();
        assert_eq!(h.chat.active(), Some(a.clone()));
        let ids: Vec<_> = h.chat.list().into_iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.clone(), c.clone()]);

        h.chat.delete(&a).unwrap();
        h.chat.delete(&c).unwrap();
        let fresh = h.chat.active().unwrap();
        assert_eq!(h.chat.list().len(), 1);
        assert_ne!(fresh, c);
    }

    #[tokio::test]
    async fn regenerate_replaces_last_reply() {
        let h = harness(vec![ScriptedAttempt::text(&["five"]), ScriptedAttempt::text(&["4"])]);
        let submission = h.chat.submit("what is 2+2", SubmitOptions::default()).unwrap();
        let id = submission.conversation_id().to_string();
        submission.wait().await;

        let outcome = h.chat.regenerate(&id, SubmitOptions::default()).unwrap().wait().await;
        assert!(matches!(outcome, Outcome::Completed(m) if m.content == "4"));

        let messages = h.chat.history(&id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "what is 2+2");
        assert_eq!(messages[1].content, "4");
        // The old reply is not part of the new request.
        assert_eq!(h.transport.requests()[1].messages.len(), 2);
    }

    async fn answered(h: &Harness, question: &str) -> String {
        let submission = h.chat.submit(question, SubmitOptions::default()).unwrap();
        let id = submission.conversation_id().to_string();
        submission.wait().await;
        id
    }

    fn contents(h: &Harness, id: &str) -> Vec<String> {
        h.chat.history(id).unwrap().into_iter().map(|m| m.content).collect()
    }

    #[tokio::test]
    async fn cancelled_regenerate_keeps_last_exchange() {
        let (tx, attempt) = live();
        let h = harness(vec![ScriptedAttempt::text(&["five"]), attempt]);
        let id = answered(&h, "what is 2+2").await;

        let submission = h.chat.regenerate(&id, SubmitOptions::default()).unwrap();
        tx.send(Ok(RawFragment::TextDelta("4".into()))).await.unwrap();
        assert!(h.chat.cancel(&id));

        assert_eq!(submission.wait().await, Outcome::Cancelled);
        assert_eq!(contents(&h, &id), vec!["what is 2+2", "five"]);
    }

    #[tokio::test]
    async fn failed_regenerate_keeps_last_exchange() {
        let h = harness(vec![
            ScriptedAttempt::text(&["five"]),
            ScriptedAttempt::Fail(ChatError::from_status(401, "bad key")),
            ScriptedAttempt::Respond(vec![
                Ok(RawFragment::TextDelta("4 is".into())),
                Err(ChatError::from_status(400, "too long")),
            ]),
        ]);
        let id = answered(&h, "what is 2+2").await;

        let outcome = h.chat.regenerate(&id, SubmitOptions::default()).unwrap().wait().await;
        assert!(matches!(outcome, Outcome::Failed(ChatError::Authentication(_))));
        assert_eq!(contents(&h, &id), vec!["what is 2+2", "five"]);
        assert_eq!(h.chat.state(&id), SubmissionState::Failed);

        // Partial text from a second try does not replace a complete answer.
        let outcome = h.chat.regenerate(&id, SubmitOptions::default()).unwrap().wait().await;
        assert!(matches!(outcome, Outcome::Failed(ChatError::BadRequest(_))));
        assert_eq!(contents(&h, &id), vec!["what is 2+2", "five"]);
    }

    #[tokio::test]
    async fn regenerate_while_streaming_is_busy_and_leaves_history() {
        let (tx, attempt) = live();
        let h = harness(vec![ScriptedAttempt::text(&["five"]), attempt]);
        let id = answered(&h, "what is 2+2").await;

        let running = h.chat.submit("and 3+3?", SubmitOptions::default()).unwrap();
        assert_eq!(
            h.chat.regenerate(&id, SubmitOptions::default()).unwrap_err(),
            ChatError::Busy(id.clone())
        );
        assert_eq!(contents(&h, &id), vec!["what is 2+2", "five"]);

        tx.send(Ok(RawFragment::TextDelta("6".into()))).await.unwrap();
        tx.send(Ok(RawFragment::EndOfStream)).await.unwrap();
        assert!(matches!(running.wait().await, Outcome::Completed(_)));
        assert_eq!(contents(&h, &id), vec!["what is 2+2", "five", "and 3+3?", "6"]);
    }

    #[tokio::test]
    async fn regenerate_without_user_message_releases_the_slot() {
        let h = harness(vec![]);
        let id = h.chat.new_conversation(None).unwrap().id;

        assert!(matches!(
            h.chat.regenerate(&id, SubmitOptions::default()),
            Err(ChatError::BadRequest(_))
        ));
        assert_eq!(h.chat.state(&id), SubmissionState::Idle);
        assert_eq!(h.transport.calls(), 0);
    }

    #[tokio::test]
    async fn edit_last_replaces_question_and_answer() {
        let h = harness(vec![ScriptedAttempt::text(&["five"]), ScriptedAttempt::text(&["4"])]);
        let id = answered(&h, "what is 2+3").await;

        assert!(matches!(
            h.chat.edit_last(&id, "  ", SubmitOptions::default()),
            Err(ChatError::BadRequest(_))
        ));
        let outcome = h.chat.edit_last(&id, "what is 2+2", SubmitOptions::default()).unwrap().wait().await;
        assert!(matches!(outcome, Outcome::Completed(m) if m.content == "4"));
        assert_eq!(contents(&h, &id), vec!["what is 2+2", "4"]);

        let request = &h.transport.requests()[1];
        assert_eq!(request.messages.len(), 2);
        assert_eq!(request.messages[1].content, "what is 2+2");
    }

    #[tokio::test]
    async fn unsaved_answer_is_reported_to_the_ui() {
        let mut h = harness(vec![ScriptedAttempt::text(&["hello"])]);
        let id = h.chat.new_conversation(None).unwrap().id;
        h.backend.fail_writes(true);

        let outcome = h.chat.submit("hi", SubmitOptions::default()).unwrap().wait().await;
        assert!(matches!(outcome, Outcome::Failed(ChatError::Storage(_))));
        assert!(h.chat.history(&id).unwrap().is_empty());

        let mut reported = None;
        while let Ok(event) = h.ui.try_recv() {
            if let UiEvent::Failed { id: failed, error } = event {
                reported = Some((failed, error));
            }
        }
        let (failed, error) = reported.unwrap();
        assert_eq!(failed, id);
        assert_eq!(error.kind(), ErrorKind::StorageError);
    }

    #[tokio::test]
    async fn undo_and_rate() {
        let h = harness(vec![ScriptedAttempt::text(&["hello"])]);
        let submission = h.chat.submit("hi", SubmitOptions::default()).unwrap();
        let id = submission.conversation_id().to_string();
        submission.wait().await;

        assert_eq!(h.chat.undo(&id).unwrap().unwrap().content, "hello");
        assert_eq!(h.chat.history(&id).unwrap().len(), 1);

        h.chat.rate(&id, Feedback::Like).unwrap();
        assert_eq!(h.chat.list()[0].likes, 1);
        assert!(matches!(h.chat.rate("missing", Feedback::Like), Err(ChatError::NotFound(_))));
    }

    #[tokio::test]
    async fn first_turn_gets_generated_title() {
        let mut h = harness_with(
            vec![
                ScriptedAttempt::text(&["4"]),
                ScriptedAttempt::text(&["\"Simple arithmetic\""]),
            ],
            true,
        );
        let submission = h.chat.submit("what is 2+2", SubmitOptions::default()).unwrap();
        let id = submission.conversation_id().to_string();
        submission.wait().await;

        let mut titles = Vec::new();
        while titles.len() < 2 {
            match h.ui.recv().await {
                Some(UiEvent::TitleChanged { title, .. }) => titles.push(title),
                Some(_) => {}
                None => break,
            }
        }
        assert_eq!(titles, vec!["what is 2+2", "Simple arithmetic"]);
        assert_eq!(h.chat.conversation(&id).unwrap().title, "Simple arithmetic");
        assert!(!h.transport.requests()[1].stream);
    }

    #[test]
    fn titles_are_cut_to_first_line() {
        assert_eq!(truncate_title("\n  Rust lifetimes explained in depth\nmore"), "Rust lifetimes expla");
        assert_eq!(truncate_title("你好，请介绍一下你自己"), "你好，请介绍一下你自己");
        assert_eq!(truncate_title("   "), "");
    }
}
