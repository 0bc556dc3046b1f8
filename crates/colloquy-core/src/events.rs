//! Typed event bus between the orchestration core and whatever UI hosts it.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::types::{DialogState, Message};

const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToastLevel {
    Info,
    Warning,
    Error,
}

/// Notifications published by the dialog, speech, and listening components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WidgetEvent {
    SessionOpened { session_id: String },
    SessionClosed,
    HistoryCleared,
    DialogStateChanged { state: DialogState },
    MessageAppended { message: Message },
    /// The agent is composing an answer.
    TypingChanged { typing: bool },
    SpeechStarted { job: u64 },
    SpeechEnded { job: u64 },
    ListeningStarted,
    ListeningStopped,
    TranscriptDraft { text: String },
    /// Host input should be disabled while a scripted batch plays.
    InputDisabled { disabled: bool },
    AuthRequired,
    AgeVerificationRequired,
    Toast { level: ToastLevel, message: String },
}

/// Cloneable handle to a broadcast channel of [`WidgetEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WidgetEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn emit(&self, event: WidgetEvent) {
        trace!(?event, "emit");
        let _ = self.tx.send(event);
    }

    pub fn toast(&self, level: ToastLevel, message: impl Into<String>) {
        self.emit(WidgetEvent::Toast {
            level,
            message: message.into(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WidgetEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
