//! Work-done progress correlation (`$/progress`).

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::{self, Message};

/// Correlator chosen by the server; integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProgressToken {
    Int(i64),
    Str(String),
}

impl fmt::Display for ProgressToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl ProgressToken {
    fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Forwarded to the editor for every accepted progress update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    Begin {
        token: ProgressToken,
        title: String,
        message: Option<String>,
        percentage: Option<u32>,
        cancellable: bool,
    },
    Report {
        token: ProgressToken,
        message: Option<String>,
        percentage: Option<u32>,
    },
    End {
        token: ProgressToken,
        message: Option<String>,
    },
}

impl ProgressEvent {
    #[must_use]
    pub fn token(&self) -> &ProgressToken {
        match self {
            Self::Begin { token, .. } | Self::Report { token, .. } | Self::End { token, .. } => token,
        }
    }
}

/// Last known state of one running operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEntry {
    pub title: String,
    pub message: Option<String>,
    pub percentage: Option<u32>,
    pub cancellable: bool,
}

fn clamp_percentage(value: Option<&Value>) -> Option<u32> {
    let raw = value?.as_f64()?;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some(raw.clamp(0.0, 100.0).round() as u32)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(String::from)
}

#[derive(Debug, Default)]
pub struct ProgressTracker {
    entries: HashMap<ProgressToken, ProgressEntry>,
    /// Tokens announced through `window/workDoneProgress/create`.
    created: HashSet<ProgressToken>,
}

impl ProgressTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a server-created token.
    pub fn create(&mut self, token: ProgressToken) {
        self.created.insert(token);
    }

    pub fn begin(
        &mut self,
        token: ProgressToken,
        title: String,
        message: Option<String>,
        percentage: Option<u32>,
        cancellable: bool,
    ) -> ProgressEvent {
        self.created.remove(&token);
        let percentage = percentage.map(|p| p.min(100));
        let entry = ProgressEntry {
            title: title.clone(),
            message: message.clone(),
            percentage,
            cancellable,
        };
        if self.entries.insert(token.clone(), entry).is_some() {
            tracing::debug!(%token, "Progress token began twice; restarting entry");
        }
        ProgressEvent::Begin {
            token,
            title,
            message,
            percentage,
            cancellable,
        }
    }

    /// Update a running entry. Unknown tokens are ignored.
    pub fn report(
        &mut self,
        token: &ProgressToken,
        percentage: Option<u32>,
        message: Option<String>,
        cancellable: Option<bool>,
    ) -> Option<ProgressEvent> {
        let Some(entry) = self.entries.get_mut(token) else {
            tracing::trace!(%token, "Ignoring report for unknown progress token");
            return None;
        };
        let percentage = percentage.map(|p| p.min(100));
        if let (Some(new), Some(old)) = (percentage, entry.percentage)
            && new < old
        {
            tracing::debug!(%token, old, new, "Progress percentage went backwards");
        }
        if percentage.is_some() {
            entry.percentage = percentage;
        }
        if message.is_some() {
            entry.message.clone_from(&message);
        }
        if let Some(cancellable) = cancellable {
            entry.cancellable = cancellable;
        }
        Some(ProgressEvent::Report {
            token: token.clone(),
            message,
            percentage,
        })
    }

    /// Finish and remove a running entry. Unknown tokens are ignored.
    pub fn end(&mut self, token: &ProgressToken, message: Option<String>) -> Option<ProgressEvent> {
        self.created.remove(token);
        if self.entries.remove(token).is_none() {
            tracing::trace!(%token, "Ignoring end for unknown progress token");
            return None;
        }
        Some(ProgressEvent::End {
            token: token.clone(),
            message,
        })
    }

    /// Route a `$/progress` notification.
    pub fn handle_notification(&mut self, params: &Value) -> Option<ProgressEvent> {
        let token = ProgressToken::from_value(params.get("token")?)?;
        let value = params.get("value")?;
        let percentage = clamp_percentage(value.get("percentage"));
        let message = string_field(value, "message");
        match value.get("kind").and_then(Value::as_str)? {
            "begin" => Some(self.begin(
                token,
                string_field(value, "title").unwrap_or_default(),
                message,
                percentage,
                value.get("cancellable").and_then(Value::as_bool).unwrap_or(false),
            )),
            "report" => self.report(
                &token,
                percentage,
                message,
                value.get("cancellable").and_then(Value::as_bool),
            ),
            "end" => self.end(&token, message),
            other => {
                tracing::debug!(%token, kind = other, "Unknown progress kind");
                None
            }
        }
    }

    /// Build `window/workDoneProgress/cancel` for a cancellable entry.
    #[must_use]
    pub fn cancel(&self, token: &ProgressToken) -> Option<Message> {
        let entry = self.entries.get(token)?;
        if !entry.cancellable {
            tracing::debug!(%token, "Progress entry is not cancellable");
            return None;
        }
        Some(Message::notification(
            "window/workDoneProgress/cancel",
            Some(protocol::work_done_cancel_params(token)),
        ))
    }

    #[must_use]
    pub fn entry(&self, token: &ProgressToken) -> Option<&ProgressEntry> {
        self.entries.get(token)
    }

    #[must_use]
    pub fn is_created(&self, token: &ProgressToken) -> bool {
        self.created.contains(token)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.created.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn progress(token: Value, value: Value) -> Value {
        json!({ "token": token, "value": value })
    }

    #[test]
    fn begin_report_end_lifecycle() {
        let mut tracker = ProgressTracker::new();
        let begin = tracker
            .handle_notification(&progress(json!("idx"), json!({ "kind": "begin", "title": "Indexing" })))
            .unwrap();
        assert!(matches!(begin, ProgressEvent::Begin { ref title, .. } if title == "Indexing"));

        let report = tracker
            .handle_notification(&progress(
                json!("idx"),
                json!({ "kind": "report", "percentage": 40, "message": "4/10" }),
            ))
            .unwrap();
        assert_eq!(
            report,
            ProgressEvent::Report {
                token: ProgressToken::Str("idx".into()),
                message: Some("4/10".into()),
                percentage: Some(40),
            }
        );
        let entry = tracker.entry(&ProgressToken::Str("idx".into())).unwrap();
        assert_eq!(entry.percentage, Some(40));
        assert_eq!(entry.message.as_deref(), Some("4/10"));

        let end = tracker
            .handle_notification(&progress(json!("idx"), json!({ "kind": "end" })))
            .unwrap();
        assert!(matches!(end, ProgressEvent::End { .. }));
        assert!(tracker.is_empty());
    }

    #[test]
    fn integer_and_string_tokens_are_distinct() {
        let mut tracker = ProgressTracker::new();
        tracker.handle_notification(&progress(json!(1), json!({ "kind": "begin", "title": "a" })));
        tracker.handle_notification(&progress(json!("1"), json!({ "kind": "begin", "title": "b" })));
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.entry(&ProgressToken::Int(1)).unwrap().title, "a");
    }

    #[test]
    fn percentage_is_clamped() {
        let mut tracker = ProgressTracker::new();
        tracker.handle_notification(&progress(json!(1), json!({ "kind": "begin", "title": "t" })));
        let high = tracker.handle_notification(&progress(json!(1), json!({ "kind": "report", "percentage": 250 })));
        assert!(matches!(high, Some(ProgressEvent::Report { percentage: Some(100), .. })));
        let low = tracker.handle_notification(&progress(json!(1), json!({ "kind": "report", "percentage": -5 })));
        assert!(matches!(low, Some(ProgressEvent::Report { percentage: Some(0), .. })));
    }

    #[test]
    fn decreasing_percentage_is_forwarded() {
        let mut tracker = ProgressTracker::new();
        let token = ProgressToken::Int(7);
        tracker.begin(token.clone(), "t".into(), None, Some(60), false);
        let event = tracker.report(&token, Some(30), None, None).unwrap();
        assert!(matches!(event, ProgressEvent::Report { percentage: Some(30), .. }));
        assert_eq!(tracker.entry(&token).unwrap().percentage, Some(30));
    }

    #[test]
    fn unknown_tokens_are_ignored() {
        let mut tracker = ProgressTracker::new();
        let token = ProgressToken::Str("ghost".into());
        assert!(tracker.report(&token, Some(10), None, None).is_none());
        assert!(tracker.end(&token, None).is_none());
        assert!(tracker.handle_notification(&json!({ "token": "x" })).is_none());
    }

    #[test]
    fn cancel_only_for_cancellable_entries() {
        let mut tracker = ProgressTracker::new();
        let a = ProgressToken::Int(1);
        let b = ProgressToken::Int(2);
        tracker.begin(a.clone(), "a".into(), None, None, true);
        tracker.begin(b.clone(), "b".into(), None, None, false);

        let msg = tracker.cancel(&a).unwrap();
        assert_eq!(msg.method(), Some("window/workDoneProgress/cancel"));
        assert_eq!(msg.to_value()["params"]["token"], 1);
        assert!(tracker.cancel(&b).is_none());
        assert!(tracker.cancel(&ProgressToken::Int(3)).is_none());
    }

    #[test]
    fn created_tokens_are_tracked_until_begin() {
        let mut tracker = ProgressTracker::new();
        let token = ProgressToken::Str("w".into());
        tracker.create(token.clone());
        assert!(tracker.is_created(&token));
        tracker.begin(token.clone(), "w".into(), None, None, false);
        assert!(!tracker.is_created(&token));
    }
}
