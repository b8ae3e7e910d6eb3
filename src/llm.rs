use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tracing::{debug, warn};

use crate::config::{Config, RetryConfig};
use crate::error::ChatError;
use crate::events::{Message, Role};

/// Buffer between the transport task and its consumer
const FRAGMENT_CHANNEL_CAPACITY: usize = 256;

/// One incremental piece of a completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFragment {
    /// Answer text delta
    TextDelta(String),
    /// Reasoning/thinking delta
    ThinkingDelta(String),
    /// The response finished normally
    EndOfStream,
    /// The request failed for good; nothing follows
    Error(ChatError),
}

impl RawFragment {
    /// Deltas that carry no characters
    pub fn is_empty_delta(&self) -> bool {
        match self {
            RawFragment::TextDelta(s) | RawFragment::ThinkingDelta(s) => s.is_empty(),
            _ => false,
        }
    }
}

/// Message in wire form
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub role: Role,
    pub content: String,
}

impl RequestMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

impl From<&Message> for RequestMessage {
    fn from(message: &Message) -> Self {
        Self::new(message.role, message.content.clone())
    }
}

/// Body of a chat-completions request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<RequestMessage>,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>, messages: Vec<RequestMessage>, stream: bool) -> Self {
        Self {
            model: model.into(),
            messages,
            stream,
        }
    }
}

/// Fragments of one attempt. Items after an `Err` are never polled.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<RawFragment, ChatError>> + Send>>;

/// A single attempt at a completion request
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue the request. Errors returned here happened before any content.
    async fn open(&self, request: &CompletionRequest) -> Result<FragmentStream, ChatError>;
}

/// OpenAI-compatible chat-completions endpoint over HTTPS
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| ChatError::Configuration(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Build from config, reading the credential once
    pub fn from_config(config: &Config) -> Result<Self, ChatError> {
        let api_key = config.resolve_api_key()?;
        Self::new(config.base_url.clone(), api_key)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &CompletionRequest) -> Result<FragmentStream, ChatError> {
        let url = format!("{}/chat/completions", self.base_url);
        debug!(%url, model = %request.model, stream = request.stream, "Sending completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| ChatError::from_reqwest(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChatError::from_status(status.as_u16(), &body));
        }

        if request.stream {
            Ok(sse_fragments(Box::pin(response.bytes_stream())))
        } else {
            let body: serde_json::Value = response
                .json()
                .await
                .map_err(|e| ChatError::from_reqwest(&e))?;
            let fragments = completion_fragments(&body)?;
            Ok(Box::pin(stream::iter(fragments.into_iter().map(Ok))))
        }
    }
}

/// Turn an SSE byte stream into fragments
fn sse_fragments<S, B>(bytes: S) -> FragmentStream
where
    S: Stream<Item = reqwest::Result<B>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = (bytes, SseDecoder::default(), VecDeque::new(), false);
    Box::pin(stream::unfold(
        state,
        |(mut bytes, mut decoder, mut pending, mut done)| async move {
            loop {
                if let Some(item) = pending.pop_front() {
                    return Some((item, (bytes, decoder, pending, done)));
                }
                if done {
                    return None;
                }
                match bytes.next().await {
                    Some(Ok(chunk)) => {
                        pending.extend(decoder.push(chunk.as_ref()).into_iter().map(Ok));
                        done = decoder.is_finished();
                    }
                    Some(Err(e)) => {
                        pending.push_back(Err(ChatError::from_reqwest(&e)));
                        done = true;
                    }
                    None => {
                        pending.extend(decoder.finish().into_iter().map(Ok));
                        done = true;
                    }
                }
            }
        },
    ))
}

/// Incremental decoder for `data:` lines of a chat-completions SSE stream.
///
/// Bytes are buffered until a full line arrives, so multi-byte characters
/// split across network chunks decode correctly.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    finished: bool,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<RawFragment> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buffer.extend_from_slice(chunk);
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.decode_line(&line, &mut out);
            if self.finished {
                self.buffer.clear();
                break;
            }
        }
        out
    }

    /// Flush a trailing line without newline
    pub fn finish(&mut self) -> Vec<RawFragment> {
        let mut out = Vec::new();
        if !self.finished && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.decode_line(&line, &mut out);
        }
        out
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn decode_line(&mut self, line: &[u8], out: &mut Vec<RawFragment>) {
        let line = String::from_utf8_lossy(line);
        let Some(data) = line.trim().strip_prefix("data:") else {
            return;
        };
        let data = data.trim_start();

        if data == "[DONE]" {
            self.finished = true;
            out.push(RawFragment::EndOfStream);
            return;
        }

        match serde_json::from_str::<serde_json::Value>(data) {
            Ok(chunk) => {
                if let Some(message) = chunk.pointer("/error/message").and_then(|m| m.as_str()) {
                    self.finished = true;
                    out.push(RawFragment::Error(ChatError::transient(format!(
                        "stream error: {}",
                        message
                    ))));
                    return;
                }
                let Some(delta) = chunk.pointer("/choices/0/delta") else {
                    return;
                };
                if let Some(reasoning) = delta.get("reasoning_content").and_then(|r| r.as_str()) {
                    if !reasoning.is_empty() {
                        out.push(RawFragment::ThinkingDelta(reasoning.to_string()));
                    }
                }
                if let Some(content) = delta.get("content").and_then(|c| c.as_str()) {
                    if !content.is_empty() {
                        out.push(RawFragment::TextDelta(content.to_string()));
                    }
                }
            }
            Err(e) => debug!("Skipping malformed SSE data: {}", e),
        }
    }
}

/// Fragments for a non-streaming response body
fn completion_fragments(body: &serde_json::Value) -> Result<Vec<RawFragment>, ChatError> {
    let message = body
        .pointer("/choices/0/message")
        .ok_or_else(|| ChatError::transient("response has no choices"))?;

    let mut fragments = Vec::new();
    if let Some(reasoning) = message.get("reasoning_content").and_then(|r| r.as_str()) {
        if !reasoning.is_empty() {
            fragments.push(RawFragment::ThinkingDelta(reasoning.to_string()));
        }
    }
    let content = message.get("content").and_then(|c| c.as_str()).unwrap_or_default();
    fragments.push(RawFragment::TextDelta(content.to_string()));
    fragments.push(RawFragment::EndOfStream);
    Ok(fragments)
}

/// Bounded retry with exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each further failure
    pub base_delay: Duration,
    /// Bound on each wait: opening the response and every following read
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(RetryConfig::default(), Duration::from_secs(120))
    }
}

impl RetryPolicy {
    pub fn new(retry: RetryConfig, attempt_timeout: Duration) -> Self {
        Self {
            max_attempts: retry.max_attempts.max(1),
            base_delay: retry.base_delay(),
            attempt_timeout,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.retry, config.request_timeout())
    }

    /// Delay after the given failed attempt (1-based): base, 2*base, 4*base...
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exponent)
    }
}

/// Full text of a collected completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: String,
    pub thinking: Option<String>,
}

enum AttemptOutcome {
    Finished,
    ReceiverGone,
    Failed { error: ChatError, delivered: bool },
}

/// Wraps a [`Transport`] with retry and backoff.
///
/// Transient failures are retried as long as the failing attempt has not yet
/// handed any content to the caller; after that a retry would duplicate text,
/// so the failure is terminal.
#[derive(Clone)]
pub struct RetryableTransport {
    inner: Arc<dyn Transport>,
    policy: RetryPolicy,
}

impl RetryableTransport {
    pub fn new(inner: Arc<dyn Transport>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Start the request; fragments arrive on the returned channel, ending
    /// with `EndOfStream` or a single `Error`. Dropping the receiver stops
    /// the request.
    pub fn send(&self, request: CompletionRequest) -> mpsc::Receiver<RawFragment> {
        let (tx, rx) = mpsc::channel(FRAGMENT_CHANNEL_CAPACITY);
        let inner = self.inner.clone();
        let policy = self.policy;
        tokio::spawn(async move {
            Self::drive(inner, policy, request, tx).await;
        });
        rx
    }

    /// Run a request to completion and collect the text
    pub async fn complete(&self, request: CompletionRequest) -> Result<Completion, ChatError> {
        let mut rx = self.send(request);
        let mut text = String::new();
        let mut thinking = String::new();

        while let Some(fragment) = rx.recv().await {
            match fragment {
                RawFragment::TextDelta(delta) => text.push_str(&delta),
                RawFragment::ThinkingDelta(delta) => thinking.push_str(&delta),
                RawFragment::EndOfStream => {
                    return Ok(Completion {
                        text,
                        thinking: Some(thinking).filter(|t| !t.is_empty()),
                    });
                }
                RawFragment::Error(error) => return Err(error),
            }
        }
        Err(ChatError::transient("response ended unexpectedly"))
    }

    async fn drive(
        inner: Arc<dyn Transport>,
        policy: RetryPolicy,
        request: CompletionRequest,
        tx: mpsc::Sender<RawFragment>,
    ) {
        if request.messages.is_empty() {
            let error = ChatError::BadRequest("request has no messages".to_string());
            let _ = tx.send(RawFragment::Error(error)).await;
            return;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            let (error, delivered) = match Self::attempt(&*inner, &policy, &request, &tx).await {
                AttemptOutcome::Finished | AttemptOutcome::ReceiverGone => return,
                AttemptOutcome::Failed { error, delivered } => (error, delivered),
            };

            if !error.is_retryable() || delivered || attempt >= policy.max_attempts {
                let error = record_attempts(error, attempt);
                warn!(attempt, "Completion request failed: {}", error);
                let _ = tx.send(RawFragment::Error(error)).await;
                return;
            }

            let delay = policy.delay_after(attempt);
            warn!(
                attempt,
                max_attempts = policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Transient failure, retrying: {}",
                error
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = tx.closed() => return,
            }
        }
    }

    async fn attempt(
        inner: &dyn Transport,
        policy: &RetryPolicy,
        request: &CompletionRequest,
        tx: &mpsc::Sender<RawFragment>,
    ) -> AttemptOutcome {
        let opened = tokio::select! {
            opened = timeout(policy.attempt_timeout, inner.open(request)) => opened,
            _ = tx.closed() => return AttemptOutcome::ReceiverGone,
        };
        let mut fragments = match opened {
            Ok(Ok(fragments)) => fragments,
            Ok(Err(error)) => return AttemptOutcome::Failed { error, delivered: false },
            Err(_) => {
                return AttemptOutcome::Failed {
                    error: ChatError::transient("timed out waiting for the response"),
                    delivered: false,
                };
            }
        };

        let mut delivered = false;
        loop {
            let next = tokio::select! {
                next = timeout(policy.attempt_timeout, fragments.next()) => next,
                _ = tx.closed() => return AttemptOutcome::ReceiverGone,
            };
            let next = match next {
                Ok(next) => next,
                Err(_) => {
                    return AttemptOutcome::Failed {
                        error: ChatError::transient("timed out waiting for more output"),
                        delivered,
                    };
                }
            };

            match next {
                None | Some(Ok(RawFragment::EndOfStream)) => {
                    return match tx.send(RawFragment::EndOfStream).await {
                        Ok(()) => AttemptOutcome::Finished,
                        Err(_) => AttemptOutcome::ReceiverGone,
                    };
                }
                Some(Ok(RawFragment::Error(error))) | Some(Err(error)) => {
                    return AttemptOutcome::Failed { error, delivered };
                }
                Some(Ok(fragment)) => {
                    if fragment.is_empty_delta() {
                        continue;
                    }
                    delivered = true;
                    if tx.send(fragment).await.is_err() {
                        return AttemptOutcome::ReceiverGone;
                    }
                }
            }
        }
    }
}

fn record_attempts(error: ChatError, attempts: u32) -> ChatError {
    match error {
        ChatError::TransientNetwork { message, .. } => ChatError::TransientNetwork { message, attempts },
        other => other,
    }
}

/// One canned attempt of a [`ScriptedTransport`]
pub enum ScriptedAttempt {
    /// `open` fails with this error
    Fail(ChatError),
    /// `open` succeeds and the stream yields these items
    Respond(Vec<Result<RawFragment, ChatError>>),
    /// `open` succeeds and the stream yields whatever the sender pushes
    Live(mpsc::Receiver<Result<RawFragment, ChatError>>),
    /// `open` never completes
    Hang,
}

impl ScriptedAttempt {
    /// Text deltas followed by end of stream
    pub fn text(deltas: &[&str]) -> Self {
        let mut items: Vec<_> = deltas
            .iter()
            .map(|d| Ok(RawFragment::TextDelta(d.to_string())))
            .collect();
        items.push(Ok(RawFragment::EndOfStream));
        ScriptedAttempt::Respond(items)
    }
}

/// Transport that replays canned attempts in order and records requests.
/// Used by tests and offline demos.
#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<VecDeque<ScriptedAttempt>>,
    requests: Mutex<Vec<CompletionRequest>>,
    calls: AtomicU32,
}

impl ScriptedTransport {
    pub fn new(script: impl IntoIterator<Item = ScriptedAttempt>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        }
    }

    pub fn push(&self, attempt: ScriptedAttempt) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(attempt);
        }
    }

    /// Number of `open` calls so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open(&self, request: &CompletionRequest) -> Result<FragmentStream, ChatError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self.script.lock().ok().and_then(|mut s| s.pop_front());

        match next {
            Some(ScriptedAttempt::Fail(error)) => Err(error),
            Some(ScriptedAttempt::Respond(items)) => Ok(Box::pin(stream::iter(items))),
            Some(ScriptedAttempt::Live(rx)) => Ok(Box::pin(stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }))),
            Some(ScriptedAttempt::Hang) => futures::future::pending().await,
            None => Err(ChatError::BadRequest("no scripted response left".to_string())),
        }
    }
}
