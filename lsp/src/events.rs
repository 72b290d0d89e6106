//! Editor-facing events and the fan-out bus that delivers them.

use std::path::PathBuf;

use serde_json::Value;
use tokio::sync::mpsc;

use crate::progress::{ProgressEvent, ProgressToken};
use crate::semantic_tokens::SemanticToken;
use crate::types::{Diagnostic, SessionState};

/// `MessageType` of `window/showMessage` and `window/logMessage`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Error,
    Warning,
    Info,
    Log,
}

impl MessageKind {
    #[must_use]
    pub fn from_lsp(value: u64) -> Self {
        match value {
            1 => Self::Error,
            2 => Self::Warning,
            3 => Self::Info,
            _ => Self::Log,
        }
    }
}

/// Everything the session reports to the editor.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Handshake finished; static capabilities are installed.
    Initialized {
        capabilities: Value,
        server_info: Option<Value>,
    },
    /// A dynamic registration was added or removed.
    CapabilitiesChanged,
    /// Fresh semantic tokens for a document.
    DocumentUpdated {
        path: PathBuf,
        tokens: Vec<SemanticToken>,
    },
    Diagnostics {
        path: PathBuf,
        items: Vec<Diagnostic>,
    },
    Progress(ProgressEvent),
    /// A progress operation ended.
    WorkDone {
        token: ProgressToken,
    },
    ShowMessage {
        kind: MessageKind,
        message: String,
    },
    /// The handshake failed with a retryable error; answer with
    /// `retry_initialize` or `decline_initialize_retry`.
    InitializeRetryOffered {
        message: String,
    },
    /// A server notification with no built-in handler.
    Notification {
        method: String,
        params: Option<Value>,
    },
    /// The session is over. `error` is set when it ended abnormally.
    Finished {
        error: Option<String>,
    },
}

/// Fan-out to any number of subscribers. Closed receivers are pruned on
/// the next emit.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Vec<mpsc::UnboundedSender<SessionEvent>>,
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn emit(&mut self, event: SessionEvent) {
        match self.subscribers.as_slice() {
            [] => {}
            [only] => {
                if only.send(event).is_err() {
                    self.subscribers.clear();
                }
            }
            _ => self.subscribers.retain(|tx| tx.send(event.clone()).is_ok()),
        }
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_receives_events() {
        let mut bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        bus.emit(SessionEvent::CapabilitiesChanged);
        assert_eq!(a.try_recv().unwrap(), SessionEvent::CapabilitiesChanged);
        assert_eq!(b.try_recv().unwrap(), SessionEvent::CapabilitiesChanged);
    }

    #[test]
    fn closed_subscribers_are_pruned() {
        let mut bus = EventBus::new();
        let a = bus.subscribe();
        let mut b = bus.subscribe();
        drop(a);
        bus.emit(SessionEvent::StateChanged(SessionState::Ready));
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(
            b.try_recv().unwrap(),
            SessionEvent::StateChanged(SessionState::Ready)
        );
        drop(b);
        bus.emit(SessionEvent::CapabilitiesChanged);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn message_kind_from_lsp() {
        assert_eq!(MessageKind::from_lsp(1), MessageKind::Error);
        assert_eq!(MessageKind::from_lsp(4), MessageKind::Log);
        assert_eq!(MessageKind::from_lsp(9), MessageKind::Log);
    }
}
