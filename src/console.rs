//! Terminal rendering of UI events.

use std::io::{self, Write};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ChatError;
use crate::events::{DisplayUpdate, UiEvent, UpdateKind};

/// Prints streamed answers as they grow.
///
/// Display updates carry the full text so far; the sink remembers how much of
/// the current answer is on screen and prints only the rest.
#[derive(Debug, Default)]
pub struct ConsoleSink {
    conversation_id: Option<String>,
    printed_text: usize,
    printed_thinking: usize,
    last_error: Option<ChatError>,
}

impl ConsoleSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render one event to stdout
    pub fn show(&mut self, event: &UiEvent) {
        let mut stdout = io::stdout().lock();
        if let Err(e) = self.render(event, &mut stdout) {
            debug!("Console write failed: {}", e);
        }
    }

    /// Render everything already queued, without waiting
    pub fn drain(&mut self, events: &mut mpsc::UnboundedReceiver<UiEvent>) {
        while let Ok(event) = events.try_recv() {
            self.show(&event);
        }
    }

    pub fn render(&mut self, event: &UiEvent, out: &mut impl Write) -> io::Result<()> {
        match event {
            UiEvent::Display(update) => self.render_update(update, out),
            UiEvent::TitleChanged { title, .. } => {
                debug!(%title, "Conversation title changed");
                Ok(())
            }
            UiEvent::Failed { error, .. } => {
                writeln!(out, "❌ {}", error)?;
                self.last_error = Some(error.clone());
                out.flush()
            }
            UiEvent::Conversations(_) | UiEvent::ActiveChanged(_) => Ok(()),
        }
    }

    /// The most recent error printed, cleared by reading it
    pub fn take_last_error(&mut self) -> Option<ChatError> {
        self.last_error.take()
    }

    fn render_update(&mut self, update: &DisplayUpdate, out: &mut impl Write) -> io::Result<()> {
        let same_stream = self.conversation_id.as_deref() == Some(update.conversation_id.as_str());
        if update.seq == 0 || !same_stream {
            self.conversation_id = Some(update.conversation_id.clone());
            self.printed_text = 0;
            self.printed_thinking = 0;
        }

        if let Some(new_thinking) = update.thinking.get(self.printed_thinking..) {
            if !new_thinking.is_empty() {
                if self.printed_thinking == 0 {
                    write!(out, "💭 ")?;
                }
                write!(out, "{}", new_thinking)?;
                self.printed_thinking = update.thinking.len();
            }
        }

        if let Some(new_text) = update.text.get(self.printed_text..) {
            if !new_text.is_empty() {
                if self.printed_text == 0 && self.printed_thinking > 0 {
                    writeln!(out, "\n")?;
                }
                write!(out, "{}", new_text)?;
                self.printed_text = update.text.len();
            }
        }

        match &update.kind {
            UpdateKind::Partial => {}
            UpdateKind::Final => {
                writeln!(out)?;
                self.conversation_id = None;
            }
            UpdateKind::Error(error) => {
                if self.printed_text > 0 || self.printed_thinking > 0 {
                    writeln!(out)?;
                }
                writeln!(out, "❌ {}", error)?;
                self.last_error = Some(error.clone());
                self.conversation_id = None;
            }
        }
        out.flush()
    }
}
