use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use crate::config::ThrottleConfig;
use crate::error::ChatError;
use crate::events::{DisplayUpdate, UpdateKind};
use crate::llm::RawFragment;

const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Deltas ending in one of these flush right away
const SENTENCE_ENDINGS: [char; 7] = ['\n', '。', '！', '？', '.', '!', '?'];

/// Accumulated output of one response
#[derive(Debug, Clone)]
pub struct StreamState {
    accumulated_text: String,
    accumulated_thinking: String,
    /// When the previous update was emitted (or the stream started)
    last_flush: Instant,
    /// Characters received since the previous update
    pending_chars: usize,
    next_seq: u64,
    finished: bool,
}

impl StreamState {
    pub fn new(now: Instant) -> Self {
        Self {
            accumulated_text: String::new(),
            accumulated_thinking: String::new(),
            last_flush: now,
            pending_chars: 0,
            next_seq: 0,
            finished: false,
        }
    }

    pub fn text(&self) -> &str {
        &self.accumulated_text
    }

    pub fn thinking(&self) -> &str {
        &self.accumulated_thinking
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Turns raw fragments into throttled display updates.
///
/// Every update carries the full text so far, so coalescing deltas never
/// loses characters. The end of the stream always produces a `Final` update
/// and a terminal error always produces an `Error` update.
pub struct StreamAssembler {
    conversation_id: String,
    throttle: ThrottleConfig,
    state: StreamState,
}

impl StreamAssembler {
    pub fn new(conversation_id: impl Into<String>, throttle: ThrottleConfig) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            throttle,
            state: StreamState::new(Instant::now()),
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    /// Feed one fragment; returns the update to show, if any
    pub fn push(&mut self, fragment: RawFragment, now: Instant) -> Option<DisplayUpdate> {
        if self.state.finished || fragment.is_empty_delta() {
            return None;
        }

        match fragment {
            RawFragment::TextDelta(delta) => {
                self.state.accumulated_text.push_str(&delta);
                self.record_delta(&delta, now)
            }
            RawFragment::ThinkingDelta(delta) => {
                self.state.accumulated_thinking.push_str(&delta);
                self.record_delta(&delta, now)
            }
            RawFragment::EndOfStream => {
                self.state.finished = true;
                Some(self.emit(UpdateKind::Final, now))
            }
            RawFragment::Error(error) => {
                self.state.finished = true;
                Some(self.emit(UpdateKind::Error(error), now))
            }
        }
    }

    /// Emit pending characters whose interval has run out
    pub fn poll_flush(&mut self, now: Instant) -> Option<DisplayUpdate> {
        if self.state.finished || self.state.pending_chars == 0 {
            return None;
        }
        if now.duration_since(self.state.last_flush) >= self.throttle.max_interval() {
            Some(self.emit(UpdateKind::Partial, now))
        } else {
            None
        }
    }

    /// When pending characters are due, if any are waiting
    fn flush_deadline(&self) -> Option<Instant> {
        (!self.state.finished && self.state.pending_chars > 0)
            .then(|| self.state.last_flush + self.throttle.max_interval())
    }

    fn record_delta(&mut self, delta: &str, now: Instant) -> Option<DisplayUpdate> {
        self.state.pending_chars += delta.chars().count();

        let enough_chars = self.state.pending_chars >= self.throttle.min_chars;
        let interval_elapsed =
            now.duration_since(self.state.last_flush) >= self.throttle.max_interval();
        let sentence_end =
            self.throttle.flush_on_punctuation && delta.ends_with(SENTENCE_ENDINGS.as_slice());

        if enough_chars || interval_elapsed || sentence_end {
            Some(self.emit(UpdateKind::Partial, now))
        } else {
            None
        }
    }

    fn emit(&mut self, kind: UpdateKind, now: Instant) -> DisplayUpdate {
        let update = DisplayUpdate {
            conversation_id: self.conversation_id.clone(),
            seq: self.state.next_seq,
            text: self.state.accumulated_text.clone(),
            thinking: self.state.accumulated_thinking.clone(),
            kind,
        };
        self.state.next_seq += 1;
        self.state.pending_chars = 0;
        self.state.last_flush = now;
        update
    }

    /// Run the assembler on its own task. The returned channel ends after the
    /// terminal update, or early when its receiver is dropped.
    pub fn consume(mut self, mut fragments: mpsc::Receiver<RawFragment>) -> mpsc::Receiver<DisplayUpdate> {
        let (tx, rx) = mpsc::channel(UPDATE_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                let deadline = self.flush_deadline();
                let update = tokio::select! {
                    biased;
                    fragment = fragments.recv() => {
                        let fragment = fragment.unwrap_or_else(|| {
                            RawFragment::Error(ChatError::transient("response stream closed unexpectedly"))
                        });
                        self.push(fragment, Instant::now())
                    }
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                        self.poll_flush(Instant::now())
                    }
                    _ = tx.closed() => {
                        debug!(conversation_id = %self.conversation_id, "Display receiver dropped");
                        return;
                    }
                };

                let Some(update) = update else {
                    continue;
                };
                let terminal = update.is_terminal();
                if tx.send(update).await.is_err() {
                    debug!(conversation_id = %self.conversation_id, "Display receiver dropped");
                    return;
                }
                if terminal {
                    return;
                }
            }
        });

        rx
    }
}
