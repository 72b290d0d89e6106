//! Static and dynamic server capabilities.
//!
//! Static entries come from the `initialize` response and stay fixed for the
//! session. Dynamic entries arrive through `client/registerCapability` and
//! shadow the static entry for the same method until unregistered.

use std::collections::HashMap;
use std::path::Path;

use globset::{GlobBuilder, GlobMatcher};
use serde_json::{Value, json};

use crate::sync::SyncKind;

/// Path patterns follow the host file system's case rules.
const CASE_INSENSITIVE_PATHS: bool = cfg!(any(windows, target_os = "macos"));

/// Registration method covering every semantic token request.
pub(crate) const SEMANTIC_TOKENS: &str = "textDocument/semanticTokens";
pub(crate) const SEMANTIC_TOKENS_FULL: &str = "textDocument/semanticTokens/full";
pub(crate) const SEMANTIC_TOKENS_DELTA: &str = "textDocument/semanticTokens/full/delta";
pub(crate) const SEMANTIC_TOKENS_RANGE: &str = "textDocument/semanticTokens/range";

/// Request methods gated by a `*Provider` entry in `ServerCapabilities`.
const PROVIDERS: &[(&str, &str)] = &[
    ("textDocument/hover", "hoverProvider"),
    ("textDocument/completion", "completionProvider"),
    ("textDocument/signatureHelp", "signatureHelpProvider"),
    ("textDocument/declaration", "declarationProvider"),
    ("textDocument/definition", "definitionProvider"),
    ("textDocument/typeDefinition", "typeDefinitionProvider"),
    ("textDocument/implementation", "implementationProvider"),
    ("textDocument/references", "referencesProvider"),
    ("textDocument/documentHighlight", "documentHighlightProvider"),
    ("textDocument/documentSymbol", "documentSymbolProvider"),
    ("textDocument/codeAction", "codeActionProvider"),
    ("textDocument/codeLens", "codeLensProvider"),
    ("textDocument/documentLink", "documentLinkProvider"),
    ("textDocument/documentColor", "colorProvider"),
    ("textDocument/formatting", "documentFormattingProvider"),
    ("textDocument/rangeFormatting", "documentRangeFormattingProvider"),
    ("textDocument/onTypeFormatting", "documentOnTypeFormattingProvider"),
    ("textDocument/rename", "renameProvider"),
    ("textDocument/foldingRange", "foldingRangeProvider"),
    ("textDocument/selectionRange", "selectionRangeProvider"),
    ("textDocument/linkedEditingRange", "linkedEditingRangeProvider"),
    ("textDocument/prepareCallHierarchy", "callHierarchyProvider"),
    ("textDocument/prepareTypeHierarchy", "typeHierarchyProvider"),
    ("textDocument/moniker", "monikerProvider"),
    ("textDocument/inlayHint", "inlayHintProvider"),
    ("textDocument/inlineValue", "inlineValueProvider"),
    ("textDocument/diagnostic", "diagnosticProvider"),
    (SEMANTIC_TOKENS, "semanticTokensProvider"),
    ("workspace/symbol", "workspaceSymbolProvider"),
    ("workspace/executeCommand", "executeCommandProvider"),
];

/// File operation methods gated by `workspace.fileOperations`.
const FILE_OPERATIONS: &[(&str, &str)] = &[
    ("workspace/willCreateFiles", "willCreate"),
    ("workspace/didCreateFiles", "didCreate"),
    ("workspace/willRenameFiles", "willRename"),
    ("workspace/didRenameFiles", "didRename"),
    ("workspace/willDeleteFiles", "willDelete"),
    ("workspace/didDeleteFiles", "didDelete"),
];

/// Methods whose capability lives inside another method's entry:
/// `(method, owner, option path)`. An empty path follows the owner.
const DERIVED: &[(&str, &str, &[&str])] = &[
    (SEMANTIC_TOKENS_FULL, SEMANTIC_TOKENS, &["full"]),
    (SEMANTIC_TOKENS_DELTA, SEMANTIC_TOKENS, &["full", "delta"]),
    (SEMANTIC_TOKENS_RANGE, SEMANTIC_TOKENS, &["range"]),
    ("textDocument/prepareRename", "textDocument/rename", &["prepareProvider"]),
    ("textDocument/colorPresentation", "textDocument/documentColor", &[]),
    ("callHierarchy/incomingCalls", "textDocument/prepareCallHierarchy", &[]),
    ("callHierarchy/outgoingCalls", "textDocument/prepareCallHierarchy", &[]),
    ("typeHierarchy/supertypes", "textDocument/prepareTypeHierarchy", &[]),
    ("typeHierarchy/subtypes", "textDocument/prepareTypeHierarchy", &[]),
    ("workspace/diagnostic", "textDocument/diagnostic", &["workspaceDiagnostics"]),
    ("completionItem/resolve", "textDocument/completion", &["resolveProvider"]),
    ("codeAction/resolve", "textDocument/codeAction", &["resolveProvider"]),
    ("codeLens/resolve", "textDocument/codeLens", &["resolveProvider"]),
    ("documentLink/resolve", "textDocument/documentLink", &["resolveProvider"]),
    ("inlayHint/resolve", "textDocument/inlayHint", &["resolveProvider"]),
    ("workspaceSymbol/resolve", "workspace/symbol", &["resolveProvider"]),
];

/// Answer to "may this method be used?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityState {
    Enabled,
    Disabled,
    /// The server never said anything about this method.
    Unknown,
}

/// The document a capability check is made for.
#[derive(Debug, Clone, Copy)]
pub struct DocumentTarget<'a> {
    pub path: &'a Path,
    pub language_id: &'a str,
}

#[derive(Debug, Clone)]
struct DocumentFilter {
    language: Option<String>,
    scheme: Option<String>,
    pattern: Option<GlobMatcher>,
}

impl DocumentFilter {
    fn parse(value: &Value) -> Option<Self> {
        let pattern = match value.get("pattern").and_then(Value::as_str) {
            Some(p) => match GlobBuilder::new(p)
                .case_insensitive(CASE_INSENSITIVE_PATHS)
                .literal_separator(true)
                .build()
            {
                Ok(glob) => Some(glob.compile_matcher()),
                Err(e) => {
                    tracing::warn!(pattern = p, "Ignoring document filter with bad glob: {e}");
                    return None;
                }
            },
            None => None,
        };
        Some(Self {
            language: value.get("language").and_then(Value::as_str).map(String::from),
            scheme: value.get("scheme").and_then(Value::as_str).map(String::from),
            pattern,
        })
    }

    fn matches(&self, target: &DocumentTarget<'_>) -> bool {
        self.language
            .as_deref()
            .is_none_or(|lang| lang == target.language_id)
            && self.scheme.as_deref().is_none_or(|scheme| scheme == "file")
            && self
                .pattern
                .as_ref()
                .is_none_or(|glob| glob.is_match(target.path))
    }
}

/// Compiled `documentSelector`; `None` on an entry means "every document".
#[derive(Debug, Clone)]
struct DocumentSelector {
    filters: Vec<DocumentFilter>,
}

impl DocumentSelector {
    fn from_options(options: &Value) -> Option<Self> {
        let selector = options.get("documentSelector")?.as_array()?;
        Some(Self {
            filters: selector.iter().filter_map(DocumentFilter::parse).collect(),
        })
    }

    fn matches(&self, target: &DocumentTarget<'_>) -> bool {
        self.filters.iter().any(|f| f.matches(target))
    }
}

/// One method's capability: enabled flag, options and optional filter.
#[derive(Debug, Clone)]
pub struct CapabilityEntry {
    pub method: String,
    pub enabled: bool,
    /// Present for dynamic registrations.
    pub registration_id: Option<String>,
    pub options: Value,
    selector: Option<DocumentSelector>,
}

impl CapabilityEntry {
    fn new(method: &str, enabled: bool, registration_id: Option<String>, options: Value) -> Self {
        let selector = DocumentSelector::from_options(&options);
        Self {
            method: method.to_string(),
            enabled,
            registration_id,
            options,
            selector,
        }
    }

    /// Interpret a `*Provider` value: absent, `null` and `false` disable.
    fn from_provider(method: &str, value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null | Value::Bool(false)) => {
                Self::new(method, false, None, Value::Null)
            }
            Some(Value::Bool(true)) => Self::new(method, true, None, json!({})),
            Some(options) => Self::new(method, true, None, options.clone()),
        }
    }

    fn accepts(&self, target: &DocumentTarget<'_>) -> bool {
        self.enabled && self.selector.as_ref().is_none_or(|s| s.matches(target))
    }

    /// Derive the entry of a sub-capability stored at `path` in this
    /// entry's options. Absent, `null` and `false` disable it.
    fn narrow(&self, method: &str, path: &[&str]) -> Self {
        let option = path
            .iter()
            .try_fold(&self.options, |value, key| value.get(*key));
        let enabled = self.enabled
            && !matches!(option, None | Some(Value::Null | Value::Bool(false)));
        Self {
            method: method.to_string(),
            enabled,
            registration_id: self.registration_id.clone(),
            options: self.options.clone(),
            selector: self.selector.clone(),
        }
    }
}

fn static_entries(caps: &Value) -> HashMap<String, CapabilityEntry> {
    let mut table = HashMap::new();
    for (method, key) in PROVIDERS {
        table.insert(
            (*method).to_string(),
            CapabilityEntry::from_provider(method, caps.get(*key)),
        );
    }

    let sync = caps.get("textDocumentSync");
    let (kind, open_close, will_save, save) = match sync {
        Some(Value::Number(n)) => {
            let kind = SyncKind::from_lsp(n.as_u64().unwrap_or(0));
            (kind, kind != SyncKind::None, false, None)
        }
        Some(Value::Object(obj)) => (
            SyncKind::from_lsp(obj.get("change").and_then(Value::as_u64).unwrap_or(0)),
            obj.get("openClose").and_then(Value::as_bool).unwrap_or(false),
            obj.get("willSave").and_then(Value::as_bool).unwrap_or(false),
            obj.get("save"),
        ),
        _ => (SyncKind::None, false, false, None),
    };
    for method in ["textDocument/didOpen", "textDocument/didClose"] {
        table.insert(
            method.to_string(),
            CapabilityEntry::new(method, open_close, None, json!({})),
        );
    }
    table.insert(
        "textDocument/didChange".to_string(),
        CapabilityEntry::new(
            "textDocument/didChange",
            kind != SyncKind::None,
            None,
            json!({ "syncKind": kind.as_lsp() }),
        ),
    );
    table.insert(
        "textDocument/willSave".to_string(),
        CapabilityEntry::new("textDocument/willSave", will_save, None, json!({})),
    );
    table.insert(
        "textDocument/didSave".to_string(),
        CapabilityEntry::from_provider("textDocument/didSave", save),
    );

    let workspace = caps.get("workspace");
    let file_operations = workspace.and_then(|w| w.get("fileOperations"));
    for (method, key) in FILE_OPERATIONS {
        table.insert(
            (*method).to_string(),
            CapabilityEntry::from_provider(method, file_operations.and_then(|f| f.get(*key))),
        );
    }
    // Only ever enabled by a dynamic registration.
    table.insert(
        "workspace/didChangeWatchedFiles".to_string(),
        CapabilityEntry::new("workspace/didChangeWatchedFiles", false, None, Value::Null),
    );

    let folders = workspace.and_then(|w| w.get("workspaceFolders"));
    let folders_supported = folders
        .and_then(|f| f.get("supported"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let change_notifications = folders.and_then(|f| f.get("changeNotifications"));
    let notify = folders_supported
        && matches!(change_notifications, Some(Value::Bool(true) | Value::String(_)));
    table.insert(
        "workspace/didChangeWorkspaceFolders".to_string(),
        CapabilityEntry::new("workspace/didChangeWorkspaceFolders", notify, None, json!({})),
    );

    table
}

/// Where `method`'s capability is stored: the owning registration method
/// and the option path inside it.
fn registration_key(method: &str) -> (&str, &'static [&'static str]) {
    DERIVED
        .iter()
        .find(|(derived, ..)| *derived == method)
        .map_or((method, &[][..]), |(_, owner, path)| (*owner, *path))
}

/// Capability table consulted by every capability-gated feature.
#[derive(Debug, Default)]
pub struct CapabilityRegistry {
    server_capabilities: Option<Value>,
    static_table: HashMap<String, CapabilityEntry>,
    dynamic: HashMap<String, CapabilityEntry>,
    /// Registration id → method, for unregister by id.
    ids: HashMap<String, String>,
}

impl CapabilityRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `ServerCapabilities` from the initialize response.
    pub fn install_static(&mut self, capabilities: Value) {
        self.static_table = static_entries(&capabilities);
        self.server_capabilities = Some(capabilities);
    }

    /// Forget everything, static and dynamic.
    pub fn clear(&mut self) {
        self.server_capabilities = None;
        self.static_table.clear();
        self.dynamic.clear();
        self.ids.clear();
    }

    #[must_use]
    pub fn server_capabilities(&self) -> Option<&Value> {
        self.server_capabilities.as_ref()
    }

    /// Effective entry for `method`: dynamic first, then static.
    #[must_use]
    pub fn entry(&self, method: &str) -> Option<CapabilityEntry> {
        let (key, path) = registration_key(method);
        let base = self
            .dynamic
            .get(key)
            .or_else(|| self.static_table.get(key))?;
        if key == method {
            Some(base.clone())
        } else {
            Some(base.narrow(method, path))
        }
    }

    /// Whether `method` may be used at all.
    #[must_use]
    pub fn registered(&self, method: &str) -> CapabilityState {
        match self.entry(method) {
            Some(entry) if entry.enabled => CapabilityState::Enabled,
            Some(_) => CapabilityState::Disabled,
            None => CapabilityState::Unknown,
        }
    }

    /// Options payload of the effective entry.
    #[must_use]
    pub fn option(&self, method: &str) -> Option<Value> {
        self.entry(method).map(|e| e.options)
    }

    /// Whether `method` may be used for `target`: enabled and, when the
    /// entry carries a document selector, matched by it.
    #[must_use]
    pub fn is_enabled_for(&self, method: &str, target: &DocumentTarget<'_>) -> bool {
        self.entry(method).is_some_and(|e| e.accepts(target))
    }

    /// Handle one entry of `client/registerCapability`.
    ///
    /// Registering a method that is already dynamically registered is a
    /// server bug: it is logged as an error and the new entry wins. The
    /// superseded id is remembered so unregistering it later removes nothing.
    pub fn register(&mut self, id: &str, method: &str, options: Option<Value>) {
        if let Some(existing) = self.dynamic.get(method) {
            tracing::error!(
                method,
                id,
                previous = ?existing.registration_id,
                "Capability registered twice without unregistering; overwriting"
            );
        }
        let entry = CapabilityEntry::new(
            method,
            true,
            Some(id.to_string()),
            options.unwrap_or_else(|| json!({})),
        );
        self.ids.insert(id.to_string(), method.to_string());
        self.dynamic.insert(method.to_string(), entry);
    }

    /// Remove a dynamic registration by id, falling back to method name
    /// when the id was never seen. Returns whether anything was removed.
    pub fn unregister(&mut self, id_or_method: &str) -> bool {
        if let Some(method) = self.ids.remove(id_or_method) {
            let current = self
                .dynamic
                .get(&method)
                .is_some_and(|e| e.registration_id.as_deref() == Some(id_or_method));
            if !current {
                tracing::debug!(id = id_or_method, %method, "Unregistering superseded registration");
                return false;
            }
            self.remove_dynamic(&method);
            return true;
        }
        self.remove_dynamic(id_or_method)
    }

    /// Handle one entry of `client/unregisterCapability`: by id when the id
    /// is known, else by method.
    pub fn unregister_registration(&mut self, id: &str, method: &str) -> bool {
        if self.ids.contains_key(id) {
            self.unregister(id)
        } else {
            self.unregister(method)
        }
    }

    fn remove_dynamic(&mut self, method: &str) -> bool {
        if self.dynamic.remove(method).is_none() {
            return false;
        }
        self.ids.retain(|_, m| *m != method);
        true
    }

    /// Document sync granularity for `target`.
    #[must_use]
    pub fn sync_kind(&self, target: &DocumentTarget<'_>) -> SyncKind {
        match self.entry("textDocument/didChange") {
            Some(entry) if entry.accepts(target) => entry
                .options
                .get("syncKind")
                .and_then(Value::as_u64)
                .map_or(SyncKind::None, SyncKind::from_lsp),
            _ => SyncKind::None,
        }
    }

    /// Semantic token legend, if the server offers one.
    #[must_use]
    pub fn semantic_tokens_legend(&self) -> Option<Value> {
        self.option(SEMANTIC_TOKENS)?.get("legend").cloned()
    }
}
