//! Public types consumed by editors embedding the engine.
//!
//! The editor constructs a [`ServerConfig`] (usually through [`LspConfig`]),
//! observes [`SessionState`] transitions, and reads [`DiagnosticsSnapshot`]s
//! for display.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::Position;

/// Configuration for the LSP client subsystem.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LspConfig {
    /// Per-language server configurations, keyed by name (e.g. "rust").
    #[serde(default)]
    pub servers: HashMap<String, ServerConfig>,
}

impl LspConfig {
    /// Pick the server responsible for a file extension.
    ///
    /// When several servers claim the extension, the alphabetically first
    /// name wins so the choice does not depend on map iteration order.
    #[must_use]
    pub fn server_for_extension(&self, ext: &str) -> Option<(&str, &ServerConfig)> {
        let mut names: Vec<&String> = self.servers.keys().collect();
        names.sort();
        names.into_iter().find_map(|name| {
            let server = &self.servers[name];
            server
                .file_extensions
                .iter()
                .any(|e| e.eq_ignore_ascii_case(ext))
                .then_some((name.as_str(), server))
        })
    }
}

/// Configuration for a single language server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Executable command (e.g. "rust-analyzer").
    pub command: String,
    /// Arguments to pass to the command.
    #[serde(default)]
    pub args: Vec<String>,
    /// LSP language identifier (e.g. "rust", "python").
    pub language_id: String,
    /// File extensions this server handles (e.g. `["rs"]`).
    #[serde(default)]
    pub file_extensions: Vec<String>,
    /// Files that indicate a workspace root (e.g. `["Cargo.toml"]`).
    #[serde(default)]
    pub root_markers: Vec<String>,
    /// Sent verbatim as `initializationOptions`.
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
    /// Answers `workspace/configuration` lookups by dotted section name.
    #[serde(default)]
    pub settings: Option<serde_json::Value>,
    #[serde(default)]
    pub session: SessionOptions,
}

impl ServerConfig {
    pub fn new(command: impl Into<String>, language_id: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            language_id: language_id.into(),
            file_extensions: Vec::new(),
            root_markers: Vec::new(),
            initialization_options: None,
            settings: None,
            session: SessionOptions::default(),
        }
    }

    /// Resolve a `workspace/configuration` section against [`Self::settings`].
    ///
    /// A missing section yields `null`, which servers treat as "use defaults".
    #[must_use]
    pub fn setting(&self, section: Option<&str>) -> serde_json::Value {
        let Some(settings) = &self.settings else {
            return serde_json::Value::Null;
        };
        let Some(section) = section.filter(|s| !s.is_empty()) else {
            return settings.clone();
        };
        section
            .split('.')
            .try_fold(settings, |value, key| value.get(key))
            .cloned()
            .unwrap_or(serde_json::Value::Null)
    }
}

const fn default_sync_debounce_ms() -> u64 {
    500
}

const fn default_shutdown_timeout_ms() -> u64 {
    3_000
}

const fn default_restart_max_attempts() -> u32 {
    5
}

const fn default_restart_cooldown_secs() -> u64 {
    180
}

const fn default_restart_backoff_ms() -> u64 {
    1_000
}

/// Timing knobs for one session. Every field has a serde default.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionOptions {
    /// Inactivity window after which queued edits are flushed.
    #[serde(default = "default_sync_debounce_ms")]
    pub sync_debounce_ms: u64,
    /// How long to wait for the `shutdown` response before giving up.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Automatic restarts allowed within one cooldown period.
    #[serde(default = "default_restart_max_attempts")]
    pub restart_max_attempts: u32,
    /// Quiet period after which the restart budget is replenished.
    #[serde(default = "default_restart_cooldown_secs")]
    pub restart_cooldown_secs: u64,
    /// Delay between an unexpected exit and the restart.
    #[serde(default = "default_restart_backoff_ms")]
    pub restart_backoff_ms: u64,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            sync_debounce_ms: default_sync_debounce_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            restart_max_attempts: default_restart_max_attempts(),
            restart_cooldown_secs: default_restart_cooldown_secs(),
            restart_backoff_ms: default_restart_backoff_ms(),
        }
    }
}

impl SessionOptions {
    #[must_use]
    pub fn sync_debounce(&self) -> Duration {
        Duration::from_millis(self.sync_debounce_ms)
    }

    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    #[must_use]
    pub fn restart_cooldown(&self) -> Duration {
        Duration::from_secs(self.restart_cooldown_secs)
    }

    #[must_use]
    pub fn restart_backoff(&self) -> Duration {
        Duration::from_millis(self.restart_backoff_ms)
    }
}

/// Lifecycle of one connection. There is exactly one authoritative value
/// per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Disconnected,
    Connecting,
    InitializeRequested,
    Ready,
    ShuttingDown,
    ShutDown,
    /// The handshake failed and no retry was taken.
    FailedToInitialize,
    Errored,
}

impl SessionState {
    /// Whether no further transitions will happen on this connection.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Errored | Self::FailedToInitialize)
    }

    /// Whether messages can still reach the server.
    #[must_use]
    pub fn is_reachable(self) -> bool {
        matches!(self, Self::InitializeRequested | Self::Ready | Self::ShuttingDown)
    }
}

/// A workspace root announced to the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkspaceFolder {
    pub uri: String,
    pub name: String,
}

impl WorkspaceFolder {
    pub fn new(uri: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            name: name.into(),
        }
    }
}

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from LSP numeric severity (1=Error, 2=Warning, 3=Info, 4=Hint).
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// A single diagnostic published by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    position: Position,
    source: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        position: Position,
        source: String,
    ) -> Self {
        Self {
            severity,
            message,
            position,
            source,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Start of the diagnostic range (0-indexed).
    #[must_use]
    pub fn position(&self) -> Position {
        self.position
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Format as `path:line:col: severity: [source] message` (1-indexed).
    #[must_use]
    pub fn display_with_path(&self, path: &std::path::Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.position.line + 1,
            self.position.character + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// Immutable snapshot of all diagnostics, errors first.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    files: Vec<(PathBuf, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(PathBuf, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[(PathBuf, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn count_by_severity(&self, severity: DiagnosticSeverity) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity() == severity)
            .count()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Error)
    }

    #[must_use]
    pub fn warning_count(&self) -> usize {
        self.count_by_severity(DiagnosticSeverity::Warning)
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }

    /// Compact status string like "E:3 W:5", empty when clean.
    #[must_use]
    pub fn status_string(&self) -> String {
        if self.is_empty() {
            return String::new();
        }
        format!("E:{} W:{}", self.error_count(), self.warning_count())
    }
}
