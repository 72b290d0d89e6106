//! Document synchronization: per-file version, mirrored text and queued edits.
//!
//! The manager never talks to the transport. Every operation returns the
//! notifications it wants sent and the session decides whether the
//! connection can carry them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::capabilities::{CapabilityRegistry, DocumentTarget};
use crate::error::ProtocolError;
use crate::protocol::{self, ContentChange, Message, Position, Range};

/// `TextDocumentSyncKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
    None,
    Full,
    Incremental,
}

impl SyncKind {
    #[must_use]
    pub fn from_lsp(value: u64) -> Self {
        match value {
            1 => Self::Full,
            2 => Self::Incremental,
            _ => Self::None,
        }
    }

    #[must_use]
    pub fn as_lsp(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Full => 1,
            Self::Incremental => 2,
        }
    }
}

/// Convert a character offset into an LSP position (UTF-16 columns).
///
/// Offsets past the end clamp to the end of the text.
#[must_use]
pub fn offset_to_position(text: &str, offset: usize) -> Position {
    let mut line = 0u32;
    let mut character = 0u32;
    for ch in text.chars().take(offset) {
        if ch == '\n' {
            line += 1;
            character = 0;
        } else {
            character += ch.len_utf16() as u32;
        }
    }
    Position { line, character }
}

fn byte_index(text: &str, char_offset: usize) -> usize {
    text.char_indices()
        .nth(char_offset)
        .map_or(text.len(), |(i, _)| i)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingEdit {
    /// Character offset of the edit in the text it applies to.
    start: usize,
    inserted_chars: usize,
    range: Range,
    text: String,
}

impl PendingEdit {
    /// Character offset just past the inserted text.
    fn end(&self) -> usize {
        self.start + self.inserted_chars
    }
}

#[derive(Debug)]
struct DocumentState {
    uri: String,
    language_id: String,
    version: i32,
    /// Text as the server will see it once queued edits are flushed.
    text: String,
    /// `didOpen` has been sent on the current connection.
    open_on_server: bool,
    pending: Vec<PendingEdit>,
    /// Full-sync mode: the whole text must be resent.
    full_dirty: bool,
    flush_deadline: Option<Instant>,
}

impl DocumentState {
    fn target<'a>(&'a self, path: &'a Path) -> DocumentTarget<'a> {
        DocumentTarget {
            path,
            language_id: &self.language_id,
        }
    }

    fn has_unsent_changes(&self) -> bool {
        self.full_dirty || !self.pending.is_empty()
    }

    fn clear_unsent(&mut self) {
        self.pending.clear();
        self.full_dirty = false;
        self.flush_deadline = None;
    }
}

/// Tracks every document the editor has opened.
#[derive(Debug)]
pub struct DocumentSyncManager {
    docs: HashMap<PathBuf, DocumentState>,
    debounce: Duration,
}

impl DocumentSyncManager {
    #[must_use]
    pub fn new(debounce: Duration) -> Self {
        Self {
            docs: HashMap::new(),
            debounce,
        }
    }

    /// Start tracking a document at version 0.
    ///
    /// Returns `false` when the document is already open (no-op).
    pub fn open(&mut self, path: &Path, language_id: &str, text: &str) -> Result<bool, ProtocolError> {
        if self.docs.contains_key(path) {
            return Ok(false);
        }
        let uri = protocol::path_to_file_uri(path)
            .map_err(|_| ProtocolError::InvalidPath(path.to_path_buf()))?
            .to_string();
        self.docs.insert(
            path.to_path_buf(),
            DocumentState {
                uri,
                language_id: language_id.to_string(),
                version: 0,
                text: text.to_string(),
                open_on_server: false,
                pending: Vec::new(),
                full_dirty: false,
                flush_deadline: None,
            },
        );
        Ok(true)
    }

    /// Build `didOpen` for a document the server has not seen yet.
    ///
    /// Returns `None` when already announced or when the server does not
    /// want open/close notifications for this document.
    pub fn did_open(&mut self, path: &Path, caps: &CapabilityRegistry) -> Option<Message> {
        let doc = self.docs.get_mut(path)?;
        if doc.open_on_server || !caps.is_enabled_for("textDocument/didOpen", &doc.target(path)) {
            return None;
        }
        doc.open_on_server = true;
        doc.clear_unsent();
        Some(Message::notification(
            "textDocument/didOpen",
            Some(protocol::did_open_params(
                &doc.uri,
                &doc.language_id,
                doc.version,
                &doc.text,
            )),
        ))
    }

    /// Documents tracked locally but not yet announced to the server.
    #[must_use]
    pub fn unannounced(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .docs
            .iter()
            .filter(|(_, d)| !d.open_on_server)
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        paths
    }

    /// Apply an edit: replace `removed` characters at character offset
    /// `offset` with `inserted`.
    ///
    /// Every accepted edit bumps the version by one. What gets queued for
    /// the server depends on the negotiated sync kind; `caps` is `None`
    /// while no server is ready.
    pub fn change(
        &mut self,
        path: &Path,
        offset: usize,
        removed: usize,
        inserted: &str,
        caps: Option<&CapabilityRegistry>,
        now: Instant,
    ) -> Result<i32, ProtocolError> {
        let debounce = self.debounce;
        let doc = self
            .docs
            .get_mut(path)
            .ok_or_else(|| ProtocolError::DocumentNotOpen(path.to_path_buf()))?;

        let len = doc.text.chars().count();
        if offset.saturating_add(removed) > len {
            tracing::warn!(
                path = %path.display(),
                offset,
                len,
                "Edit extends past end of document; clamping"
            );
        }
        let start = offset.min(len);
        let removed = removed.min(len - start);

        let range = Range {
            start: offset_to_position(&doc.text, start),
            end: offset_to_position(&doc.text, start + removed),
        };
        let from = byte_index(&doc.text, start);
        let to = byte_index(&doc.text, start + removed);
        doc.text.replace_range(from..to, inserted);
        doc.version += 1;

        let kind = match caps {
            Some(caps) if doc.open_on_server => caps.sync_kind(&doc.target(path)),
            _ => SyncKind::None,
        };
        match kind {
            SyncKind::None => {}
            SyncKind::Full => doc.full_dirty = true,
            SyncKind::Incremental => {
                let inserted_chars = inserted.chars().count();
                match doc.pending.last_mut() {
                    Some(last) if removed == 0 && last.end() == start => {
                        last.text.push_str(inserted);
                        last.inserted_chars += inserted_chars;
                    }
                    _ => doc.pending.push(PendingEdit {
                        start,
                        inserted_chars,
                        range,
                        text: inserted.to_string(),
                    }),
                }
            }
        }
        if doc.has_unsent_changes() {
            doc.flush_deadline = Some(now + debounce);
        }
        Ok(doc.version)
    }

    /// Build the `didChange` carrying everything queued for `path`.
    pub fn flush(&mut self, path: &Path, caps: &CapabilityRegistry) -> Option<Message> {
        let doc = self.docs.get_mut(path)?;
        if !doc.open_on_server || !doc.has_unsent_changes() {
            return None;
        }
        let changes: Vec<ContentChange> = match caps.sync_kind(&doc.target(path)) {
            SyncKind::None => Vec::new(),
            SyncKind::Full => vec![ContentChange::Full {
                text: doc.text.clone(),
            }],
            SyncKind::Incremental if doc.full_dirty => vec![ContentChange::Full {
                text: doc.text.clone(),
            }],
            SyncKind::Incremental => doc
                .pending
                .iter()
                .map(|e| ContentChange::Incremental {
                    range: e.range,
                    text: e.text.clone(),
                })
                .collect(),
        };
        doc.clear_unsent();
        if changes.is_empty() {
            return None;
        }
        Some(Message::notification(
            "textDocument/didChange",
            Some(protocol::did_change_params(&doc.uri, doc.version, &changes)),
        ))
    }

    /// Flush every document with queued edits, in path order.
    pub fn flush_all(&mut self, caps: &CapabilityRegistry) -> Vec<(PathBuf, Message)> {
        let mut paths: Vec<PathBuf> = self
            .docs
            .iter()
            .filter(|(_, d)| d.has_unsent_changes())
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        paths
            .into_iter()
            .filter_map(|p| self.flush(&p, caps).map(|m| (p, m)))
            .collect()
    }

    /// Flush documents whose debounce window has elapsed.
    pub fn flush_due(&mut self, now: Instant, caps: &CapabilityRegistry) -> Vec<(PathBuf, Message)> {
        let mut due: Vec<PathBuf> = self
            .docs
            .iter()
            .filter(|(_, d)| d.flush_deadline.is_some_and(|t| t <= now))
            .map(|(p, _)| p.clone())
            .collect();
        due.sort();
        due.into_iter()
            .filter_map(|p| self.flush(&p, caps).map(|m| (p, m)))
            .collect()
    }

    /// Earliest pending debounce deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.docs.values().filter_map(|d| d.flush_deadline).min()
    }

    /// Build `willSave` if the server asked for it.
    pub fn will_save(&self, path: &Path, caps: &CapabilityRegistry) -> Result<Option<Message>, ProtocolError> {
        let doc = self.get(path)?;
        if !doc.open_on_server || !caps.is_enabled_for("textDocument/willSave", &doc.target(path)) {
            return Ok(None);
        }
        Ok(Some(Message::notification(
            "textDocument/willSave",
            Some(protocol::will_save_params(&doc.uri)),
        )))
    }

    /// Build `didSave`, with the full text when the server's options ask
    /// for `includeText`.
    pub fn saved(&self, path: &Path, caps: &CapabilityRegistry) -> Result<Option<Message>, ProtocolError> {
        let doc = self.get(path)?;
        let target = doc.target(path);
        if !doc.open_on_server || !caps.is_enabled_for("textDocument/didSave", &target) {
            return Ok(None);
        }
        let include_text = caps
            .option("textDocument/didSave")
            .and_then(|o| o.get("includeText").and_then(Value::as_bool))
            .unwrap_or(false);
        Ok(Some(Message::notification(
            "textDocument/didSave",
            Some(protocol::did_save_params(
                &doc.uri,
                include_text.then_some(doc.text.as_str()),
            )),
        )))
    }

    /// Stop tracking a document; returns `didClose` if the server saw it
    /// open. Queued edits are discarded.
    pub fn close(&mut self, path: &Path, caps: Option<&CapabilityRegistry>) -> Result<Option<Message>, ProtocolError> {
        let doc = self
            .docs
            .remove(path)
            .ok_or_else(|| ProtocolError::DocumentNotOpen(path.to_path_buf()))?;
        let notify = doc.open_on_server
            && caps.is_some_and(|c| c.is_enabled_for("textDocument/didClose", &doc.target(path)));
        Ok(notify.then(|| {
            Message::notification(
                "textDocument/didClose",
                Some(protocol::did_close_params(&doc.uri)),
            )
        }))
    }

    /// Forget server-side state for every document; they will be
    /// re-announced at version 0 on the next connection.
    pub fn reset_for_restart(&mut self) {
        for doc in self.docs.values_mut() {
            doc.open_on_server = false;
            doc.version = 0;
            doc.clear_unsent();
        }
    }

    fn get(&self, path: &Path) -> Result<&DocumentState, ProtocolError> {
        self.docs
            .get(path)
            .ok_or_else(|| ProtocolError::DocumentNotOpen(path.to_path_buf()))
    }

    #[must_use]
    pub fn is_open(&self, path: &Path) -> bool {
        self.docs.contains_key(path)
    }

    #[must_use]
    pub fn is_open_on_server(&self, path: &Path) -> bool {
        self.docs.get(path).is_some_and(|d| d.open_on_server)
    }

    #[must_use]
    pub fn version(&self, path: &Path) -> Option<i32> {
        self.docs.get(path).map(|d| d.version)
    }

    #[must_use]
    pub fn text(&self, path: &Path) -> Option<&str> {
        self.docs.get(path).map(|d| d.text.as_str())
    }

    #[must_use]
    pub fn uri(&self, path: &Path) -> Option<&str> {
        self.docs.get(path).map(|d| d.uri.as_str())
    }

    #[must_use]
    pub fn language_id(&self, path: &Path) -> Option<&str> {
        self.docs.get(path).map(|d| d.language_id.as_str())
    }

    /// Find the tracked document for a server-supplied URI.
    #[must_use]
    pub fn path_for_uri(&self, uri: &str) -> Option<PathBuf> {
        self.docs
            .iter()
            .find(|(_, d)| d.uri == uri)
            .map(|(p, _)| p.clone())
            .or_else(|| protocol::file_uri_to_path(uri))
    }

    /// Paths of documents the server currently has open.
    #[must_use]
    pub fn server_open_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .docs
            .iter()
            .filter(|(_, d)| d.open_on_server)
            .map(|(p, _)| p.clone())
            .collect();
        paths.sort();
        paths
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn caps(sync: Value) -> CapabilityRegistry {
        let mut caps = CapabilityRegistry::new();
        caps.install_static(json!({ "textDocumentSync": sync }));
        caps
    }

    fn path() -> PathBuf {
        #[cfg(windows)]
        return PathBuf::from(r"C:\w\a.txt");
        #[cfg(not(windows))]
        PathBuf::from("/w/a.txt")
    }

    fn params(msg: &Message) -> &Value {
        match msg {
            Message::Notification(n) => n.params.as_ref().unwrap(),
            other => panic!("expected notification, got {other:?}"),
        }
    }

    fn opened(sync: Value, text: &str) -> (DocumentSyncManager, CapabilityRegistry) {
        let caps = caps(sync);
        let mut docs = DocumentSyncManager::new(Duration::from_millis(500));
        assert!(docs.open(&path(), "plaintext", text).unwrap());
        assert!(docs.did_open(&path(), &caps).is_some());
        (docs, caps)
    }

    #[test]
    fn offset_to_position_counts_utf16() {
        let text = "ab\nc😀d\n";
        assert_eq!(offset_to_position(text, 0), Position::new(0, 0));
        assert_eq!(offset_to_position(text, 3), Position::new(1, 0));
        assert_eq!(offset_to_position(text, 5), Position::new(1, 3));
        assert_eq!(offset_to_position(text, 100), Position::new(2, 0));
    }

    #[test]
    fn open_is_idempotent_and_starts_at_zero() {
        let (mut docs, caps) = opened(json!(2), "hello");
        assert!(!docs.open(&path(), "plaintext", "other").unwrap());
        assert_eq!(docs.text(&path()), Some("hello"));
        assert_eq!(docs.version(&path()), Some(0));
        assert!(docs.did_open(&path(), &caps).is_none());
    }

    #[test]
    fn did_open_carries_text_and_version() {
        let caps = caps(json!(2));
        let mut docs = DocumentSyncManager::new(Duration::from_millis(500));
        docs.open(&path(), "rust", "fn main() {}").unwrap();
        let msg = docs.did_open(&path(), &caps).unwrap();
        assert_eq!(msg.method(), Some("textDocument/didOpen"));
        assert_eq!(params(&msg)["textDocument"]["languageId"], "rust");
        assert_eq!(params(&msg)["textDocument"]["version"], 0);
        assert_eq!(params(&msg)["textDocument"]["text"], "fn main() {}");
    }

    #[test]
    fn adjacent_insertions_coalesce_into_one_edit() {
        let (mut docs, caps) = opened(json!(2), "");
        let now = Instant::now();
        docs.change(&path(), 0, 0, "ab", Some(&caps), now).unwrap();
        docs.change(&path(), 2, 0, "cd", Some(&caps), now).unwrap();

        let msg = docs.flush(&path(), &caps).unwrap();
        let changes = params(&msg)["contentChanges"].as_array().unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0]["text"], "abcd");
        assert_eq!(changes[0]["range"]["start"], json!({ "line": 0, "character": 0 }));
        assert_eq!(changes[0]["range"]["end"], json!({ "line": 0, "character": 0 }));
        assert_eq!(params(&msg)["textDocument"]["version"], 2);
        assert!(docs.flush(&path(), &caps).is_none());
    }

    #[test]
    fn non_adjacent_or_deleting_edits_stay_separate() {
        let (mut docs, caps) = opened(json!(2), "hello world");
        let now = Instant::now();
        docs.change(&path(), 5, 0, "!", Some(&caps), now).unwrap();
        docs.change(&path(), 0, 0, ">", Some(&caps), now).unwrap();
        docs.change(&path(), 1, 1, "H", Some(&caps), now).unwrap();
        assert_eq!(docs.text(&path()), Some(">Hello! world"));

        let msg = docs.flush(&path(), &caps).unwrap();
        let changes = params(&msg)["contentChanges"].as_array().unwrap();
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[2]["range"]["start"]["character"], 1);
        assert_eq!(changes[2]["range"]["end"]["character"], 2);
        assert_eq!(changes[2]["text"], "H");
    }

    #[test]
    fn edit_ranges_are_line_based() {
        let (mut docs, caps) = opened(json!(2), "one\ntwo\nthree");
        docs.change(&path(), 4, 3, "TWO", Some(&caps), Instant::now()).unwrap();
        let msg = docs.flush(&path(), &caps).unwrap();
        let change = &params(&msg)["contentChanges"][0];
        assert_eq!(change["range"]["start"], json!({ "line": 1, "character": 0 }));
        assert_eq!(change["range"]["end"], json!({ "line": 1, "character": 3 }));
        assert_eq!(docs.text(&path()), Some("one\nTWO\nthree"));
    }

    #[test]
    fn version_counts_accepted_changes() {
        let (mut docs, caps) = opened(json!(2), "");
        let now = Instant::now();
        for k in 0..7 {
            docs.change(&path(), k, 0, "x", Some(&caps), now).unwrap();
        }
        assert_eq!(docs.version(&path()), Some(7));
    }

    #[test]
    fn full_sync_sends_whole_text() {
        let (mut docs, caps) = opened(json!(1), "abc");
        docs.change(&path(), 3, 0, "d", Some(&caps), Instant::now()).unwrap();
        let msg = docs.flush(&path(), &caps).unwrap();
        assert_eq!(params(&msg)["contentChanges"], json!([{ "text": "abcd" }]));
    }

    #[test]
    fn sync_none_sends_nothing_but_tracks_version() {
        let caps = caps(json!({ "openClose": true, "change": 0 }));
        let mut docs = DocumentSyncManager::new(Duration::from_millis(500));
        docs.open(&path(), "plaintext", "abc").unwrap();
        assert!(docs.did_open(&path(), &caps).is_some());
        docs.change(&path(), 0, 1, "", Some(&caps), Instant::now()).unwrap();
        assert_eq!(docs.version(&path()), Some(1));
        assert!(docs.flush(&path(), &caps).is_none());
        assert!(docs.next_deadline().is_none());
    }

    #[test]
    fn changes_before_announce_are_folded_into_did_open() {
        let caps = caps(json!(2));
        let mut docs = DocumentSyncManager::new(Duration::from_millis(500));
        docs.open(&path(), "plaintext", "a").unwrap();
        docs.change(&path(), 1, 0, "b", None, Instant::now()).unwrap();
        assert!(docs.flush(&path(), &caps).is_none());
        let msg = docs.did_open(&path(), &caps).unwrap();
        assert_eq!(params(&msg)["textDocument"]["text"], "ab");
        assert_eq!(params(&msg)["textDocument"]["version"], 1);
    }

    #[test]
    fn change_requires_open() {
        let mut docs = DocumentSyncManager::new(Duration::from_millis(500));
        let err = docs
            .change(&path(), 0, 0, "x", None, Instant::now())
            .unwrap_err();
        assert_eq!(err, ProtocolError::DocumentNotOpen(path()));
    }

    #[test]
    fn debounce_deadline_drives_flush_due() {
        let (mut docs, caps) = opened(json!(2), "");
        let start = Instant::now();
        docs.change(&path(), 0, 0, "x", Some(&caps), start).unwrap();
        assert_eq!(docs.next_deadline(), Some(start + Duration::from_millis(500)));
        assert!(docs.flush_due(start + Duration::from_millis(100), &caps).is_empty());
        let due = docs.flush_due(start + Duration::from_millis(500), &caps);
        assert_eq!(due.len(), 1);
        assert!(docs.next_deadline().is_none());
    }

    #[test]
    fn save_notifications_follow_capabilities() {
        let (docs, caps) = opened(
            json!({ "openClose": true, "change": 2, "willSave": true, "save": { "includeText": true } }),
            "body",
        );
        let will = docs.will_save(&path(), &caps).unwrap().unwrap();
        assert_eq!(will.method(), Some("textDocument/willSave"));
        let saved = docs.saved(&path(), &caps).unwrap().unwrap();
        assert_eq!(params(&saved)["text"], "body");

        let (docs, caps) = opened(json!(2), "body");
        assert!(docs.will_save(&path(), &caps).unwrap().is_none());
        assert!(docs.saved(&path(), &caps).unwrap().is_none());
    }

    #[test]
    fn close_then_reopen_restarts_versions() {
        let (mut docs, caps) = opened(json!(2), "");
        docs.change(&path(), 0, 0, "x", Some(&caps), Instant::now()).unwrap();
        let close = docs.close(&path(), Some(&caps)).unwrap().unwrap();
        assert_eq!(close.method(), Some("textDocument/didClose"));
        assert!(!docs.is_open(&path()));
        assert!(docs.close(&path(), Some(&caps)).is_err());

        docs.open(&path(), "plaintext", "x").unwrap();
        assert_eq!(docs.version(&path()), Some(0));
    }

    #[test]
    fn reset_for_restart_requeues_announcement() {
        let (mut docs, caps) = opened(json!(2), "");
        docs.change(&path(), 0, 0, "x", Some(&caps), Instant::now()).unwrap();
        docs.reset_for_restart();
        assert_eq!(docs.unannounced(), vec![path()]);
        assert_eq!(docs.version(&path()), Some(0));
        assert!(docs.next_deadline().is_none());
        let msg = docs.did_open(&path(), &caps).unwrap();
        assert_eq!(params(&msg)["textDocument"]["text"], "x");
    }

    #[test]
    fn out_of_range_edit_is_clamped() {
        let (mut docs, caps) = opened(json!(2), "ab");
        docs.change(&path(), 10, 5, "c", Some(&caps), Instant::now()).unwrap();
        assert_eq!(docs.text(&path()), Some("abc"));
    }
}
