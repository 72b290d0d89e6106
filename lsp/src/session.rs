//! One connection to a language server: lifecycle, routing, and the
//! editor-facing contract.
//!
//! A [`Session`] is single-owner and synchronous. Transport events, editor
//! calls, and timer expiries are each processed to completion before the
//! next one. The async driver in [`crate::client`] feeds it; tests drive it
//! directly with explicit instants.

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use serde_json::{Value, json};

use crate::capabilities::{
    CapabilityRegistry, CapabilityState, DocumentTarget, SEMANTIC_TOKENS, SEMANTIC_TOKENS_DELTA,
    SEMANTIC_TOKENS_FULL,
};
use crate::codec::{self, MessageFramer};
use crate::diagnostics::DiagnosticsStore;
use crate::dispatch::{
    ConfigurationParams, DispatchTable, MessageParams, RegistrationParams, UnregistrationParams,
    parse_params,
};
use crate::error::{ProtocolError, RequestError, SessionError};
use crate::events::{EventBus, MessageKind, SessionEvent};
use crate::progress::{ProgressEvent, ProgressToken, ProgressTracker};
use crate::protocol::{
    self, Message, PublishDiagnosticsParams, Request, RequestId, Response, ResponseError,
    error_codes,
};
use crate::requests::{RequestRegistry, Resolution, Responder};
use crate::restart::RestartBudget;
use crate::semantic_tokens::{SemanticTokenLegend, SemanticTokenReconciler, TokenOutcome, TokenRequest};
use crate::sync::DocumentSyncManager;
use crate::transport::{Transport, TransportEvent, TransportEvents};
use crate::types::{DiagnosticsSnapshot, ServerConfig, SessionState, WorkspaceFolder};

/// Requests the session issues on its own behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SessionRequest {
    Initialize,
    Shutdown,
    SemanticTokens { path: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitRetry {
    Available,
    Offered,
    Used,
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = Vec::new();
    for c in path.components() {
        match c {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out.iter().collect()
}

fn folder_for(root: &Path) -> Option<WorkspaceFolder> {
    let uri = protocol::path_to_file_uri(root).ok()?;
    let name = root
        .file_name()
        .map_or_else(|| root.display().to_string(), |n| n.to_string_lossy().into_owned());
    Some(WorkspaceFolder::new(uri.to_string(), name))
}

pub struct Session {
    config: ServerConfig,
    root: PathBuf,
    root_uri: String,
    folders: Vec<WorkspaceFolder>,
    state: SessionState,
    transport: Box<dyn Transport>,
    transport_events: TransportEvents,
    framer: MessageFramer,
    requests: RequestRegistry<SessionRequest>,
    capabilities: CapabilityRegistry,
    documents: DocumentSyncManager,
    tokens: SemanticTokenReconciler,
    progress: ProgressTracker,
    diagnostics: DiagnosticsStore,
    restart: RestartBudget,
    dispatch: DispatchTable,
    events: EventBus,
    init_retry: InitRetry,
    shutdown_deadline: Option<Instant>,
    restart_at: Option<Instant>,
    server_info: Option<Value>,
    last_error: Option<String>,
}

impl Session {
    /// Build a disconnected session for the workspace at `root`.
    ///
    /// `transport_events` is handed to the transport on every start; the
    /// owner of the matching receiver feeds events back through
    /// [`Self::handle_transport_event`].
    pub fn new(
        config: ServerConfig,
        root: &Path,
        transport: Box<dyn Transport>,
        transport_events: TransportEvents,
    ) -> Self {
        let root = normalize_path(root);
        let folders: Vec<WorkspaceFolder> = folder_for(&root).into_iter().collect();
        let root_uri = folders.first().map(|f| f.uri.clone()).unwrap_or_default();
        Self {
            documents: DocumentSyncManager::new(config.session.sync_debounce()),
            restart: RestartBudget::from_options(&config.session),
            config,
            root,
            root_uri,
            folders,
            state: SessionState::Disconnected,
            transport,
            transport_events,
            framer: MessageFramer::new(),
            requests: RequestRegistry::new(),
            capabilities: CapabilityRegistry::new(),
            tokens: SemanticTokenReconciler::new(),
            progress: ProgressTracker::new(),
            diagnostics: DiagnosticsStore::new(),
            dispatch: DispatchTable::standard(),
            events: EventBus::new(),
            init_retry: InitRetry::Available,
            shutdown_deadline: None,
            restart_at: None,
            server_info: None,
            last_error: None,
        }
    }

    pub fn subscribe(&mut self) -> tokio::sync::mpsc::UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state == state {
            return;
        }
        tracing::debug!(from = ?self.state, to = ?state, server = %self.config.command, "LSP session state change");
        self.state = state;
        self.events.emit(SessionEvent::StateChanged(state));
    }

    fn require_ready(&self, operation: &'static str) -> Result<(), SessionError> {
        if self.state == SessionState::Ready {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn send(&mut self, message: &Message) {
        tracing::trace!(method = ?message.method(), "Sending LSP message");
        if let Err(e) = self.transport.send(codec::encode(message)) {
            tracing::warn!(server = %self.config.command, "Failed to send LSP message: {e}");
        }
    }

    // Lifecycle

    /// Connect: `Disconnected → Connecting`, then the handshake runs as
    /// transport events arrive.
    pub fn start(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.state != SessionState::Disconnected {
            return Err(SessionError::InvalidState {
                operation: "start",
                state: self.state,
            });
        }
        self.restart_at = None;
        self.init_retry = InitRetry::Available;
        self.connect(now);
        Ok(())
    }

    fn connect(&mut self, now: Instant) {
        tracing::info!(server = %self.config.command, root = %self.root.display(), "Starting LSP server");
        self.set_state(SessionState::Connecting);
        if let Err(e) = self.transport.start(self.transport_events.clone()) {
            self.on_unexpected_exit(Some(e.to_string()), now);
        }
    }

    fn send_initialize(&mut self) {
        let params = protocol::initialize_params(
            &self.root_uri,
            &self.folders,
            self.config.initialization_options.as_ref(),
        );
        let (_, message) = self
            .requests
            .send("initialize", Some(params), Responder::Internal(SessionRequest::Initialize));
        self.send(&message);
        self.set_state(SessionState::InitializeRequested);
    }

    /// Take the one-shot retry offered after a retryable handshake error.
    pub fn retry_initialize(&mut self) -> Result<(), SessionError> {
        if self.init_retry != InitRetry::Offered {
            return Err(SessionError::InvalidState {
                operation: "retry_initialize",
                state: self.state,
            });
        }
        tracing::info!(server = %self.config.command, "Retrying LSP initialize");
        self.init_retry = InitRetry::Used;
        self.send_initialize();
        Ok(())
    }

    /// Refuse the retry; the session fails to initialize.
    pub fn decline_initialize_retry(&mut self) -> Result<(), SessionError> {
        if self.init_retry != InitRetry::Offered {
            return Err(SessionError::InvalidState {
                operation: "decline_initialize_retry",
                state: self.state,
            });
        }
        self.init_retry = InitRetry::Used;
        let reason = self
            .last_error
            .clone()
            .unwrap_or_else(|| "initialize failed".to_string());
        self.terminate(SessionState::FailedToInitialize, reason);
        Ok(())
    }

    /// Begin a graceful shutdown. Only valid from `Ready`.
    ///
    /// Outstanding caller requests are failed before the `shutdown`
    /// request goes out; a watchdog turns a silent server into `Errored`.
    pub fn shutdown(&mut self, now: Instant) -> Result<(), SessionError> {
        self.require_ready("shutdown")?;
        let failed = self.requests.fail_all("session shutting down");
        if failed > 0 {
            tracing::debug!(failed, "Failed pending requests before shutdown");
        }
        self.set_state(SessionState::ShuttingDown);
        let (_, message) = self
            .requests
            .send("shutdown", None, Responder::Internal(SessionRequest::Shutdown));
        self.send(&message);
        self.shutdown_deadline = Some(now + self.config.session.shutdown_timeout());
        Ok(())
    }

    /// Drop every piece of per-connection state. Documents stay tracked so
    /// they can be announced again on the next connection.
    fn reset_connection(&mut self, reason: &str) {
        let failed = self.requests.fail_all(reason);
        if failed > 0 {
            tracing::debug!(failed, reason, "Failed pending LSP requests");
        }
        self.capabilities.clear();
        self.tokens.clear();
        self.progress.clear();
        self.diagnostics.clear();
        self.framer.reset();
        self.documents.reset_for_restart();
        self.shutdown_deadline = None;
        self.server_info = None;
    }

    /// Enter a terminal state and tell the editor once.
    fn terminate(&mut self, state: SessionState, reason: String) {
        tracing::error!(server = %self.config.command, ?state, %reason, "LSP session failed");
        self.last_error = Some(reason.clone());
        self.reset_connection(&reason);
        self.transport.stop();
        self.restart_at = None;
        self.set_state(state);
        self.events.emit(SessionEvent::Finished { error: Some(reason) });
    }

    /// The server went away after a shutdown was requested.
    fn finish_cleanly(&mut self) {
        self.reset_connection("session shut down");
        self.transport.stop();
        self.set_state(SessionState::Disconnected);
        self.events.emit(SessionEvent::Finished { error: None });
    }

    fn on_unexpected_exit(&mut self, reason: Option<String>, now: Instant) {
        let reason = reason.unwrap_or_else(|| "server exited unexpectedly".to_string());
        tracing::warn!(server = %self.config.command, state = ?self.state, %reason, "LSP server stopped unexpectedly");
        self.last_error = Some(reason.clone());
        self.reset_connection(&reason);
        self.transport.stop();
        match self.restart.on_failure(now) {
            Some(at) => {
                tracing::info!(
                    server = %self.config.command,
                    attempt = self.restart.attempts(),
                    delay_ms = at.saturating_duration_since(now).as_millis(),
                    "Scheduling LSP server restart"
                );
                self.restart_at = Some(at);
                self.set_state(SessionState::Disconnected);
            }
            None => {
                self.terminate(
                    SessionState::Errored,
                    format!("{reason} (restart limit reached)"),
                );
            }
        }
    }

    // Event intake

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        match event {
            TransportEvent::Started => {
                if self.state == SessionState::Connecting {
                    self.send_initialize();
                } else {
                    tracing::debug!(state = ?self.state, "Ignoring transport start");
                }
            }
            TransportEvent::Received(bytes) => {
                if !self.state.is_reachable() && self.state != SessionState::ShutDown {
                    tracing::trace!(len = bytes.len(), state = ?self.state, "Dropping bytes received while disconnected");
                    return;
                }
                for frame in self.framer.feed(&bytes) {
                    match frame {
                        Ok(message) => self.handle_message(message, now),
                        Err(e) => tracing::warn!(server = %self.config.command, "Dropping LSP frame: {e}"),
                    }
                }
            }
            TransportEvent::Finished(reason) => match self.state {
                SessionState::ShuttingDown | SessionState::ShutDown => self.finish_cleanly(),
                SessionState::Connecting | SessionState::InitializeRequested | SessionState::Ready => {
                    self.on_unexpected_exit(reason, now);
                }
                SessionState::Disconnected | SessionState::Errored | SessionState::FailedToInitialize => {
                    tracing::debug!(state = ?self.state, "Ignoring transport finish");
                }
            },
        }
    }

    fn handle_message(&mut self, message: Message, now: Instant) {
        match message {
            Message::Response(Response { id, outcome }) => match self.requests.resolve(&id, outcome) {
                Resolution::Delivered => {}
                Resolution::Unknown => {
                    tracing::debug!("{}", ProtocolError::UnknownResponseId(id));
                }
                Resolution::Internal { tag, outcome, .. } => self.on_internal_response(tag, outcome, now),
            },
            Message::Request(Request { id, method, params }) => self.on_server_request(id, &method, params),
            Message::Notification(notification) => {
                let method = notification.method;
                match self.dispatch.notification(&method) {
                    Some(handler) => handler(self, notification.params),
                    None => {
                        tracing::trace!(%method, "Forwarding unhandled notification");
                        self.events.emit(SessionEvent::Notification {
                            method,
                            params: notification.params,
                        });
                    }
                }
            }
        }
    }

    fn on_server_request(&mut self, id: RequestId, method: &str, params: Option<Value>) {
        let outcome = match self.dispatch.request(method) {
            Some(handler) => handler(self, params),
            None => {
                tracing::debug!(%method, "Server request has no handler; replying method not found");
                Err(ResponseError::method_not_found(method))
            }
        };
        if self.state.is_reachable() {
            self.send(&Message::response(id, outcome));
        }
    }

    fn on_internal_response(&mut self, tag: SessionRequest, outcome: Result<Value, ResponseError>, now: Instant) {
        match tag {
            SessionRequest::Initialize => self.on_initialize_response(outcome),
            SessionRequest::Shutdown => {
                if self.state != SessionState::ShuttingDown {
                    return;
                }
                if let Err(e) = &outcome {
                    tracing::debug!(code = e.code, "Shutdown returned an error; exiting anyway");
                }
                self.send(&Message::notification("exit", None));
                self.set_state(SessionState::ShutDown);
                self.shutdown_deadline = Some(now + self.config.session.shutdown_timeout());
            }
            SessionRequest::SemanticTokens { path } => self.on_tokens_response(&path, outcome),
        }
    }

    fn on_initialize_response(&mut self, outcome: Result<Value, ResponseError>) {
        if self.state != SessionState::InitializeRequested {
            return;
        }
        let result = match outcome {
            Ok(result) => result,
            Err(error) => {
                let reason = format!("initialize failed: {}", error.message);
                if error.retry_requested() && self.init_retry == InitRetry::Available {
                    tracing::warn!(server = %self.config.command, %reason, "Server offers initialize retry");
                    self.init_retry = InitRetry::Offered;
                    self.last_error = Some(reason);
                    self.events.emit(SessionEvent::InitializeRetryOffered {
                        message: error.message,
                    });
                } else {
                    self.terminate(SessionState::FailedToInitialize, reason);
                }
                return;
            }
        };
        let Some(capabilities) = result.get("capabilities").filter(|c| c.is_object()).cloned() else {
            self.terminate(
                SessionState::Errored,
                "malformed initialize response: missing capabilities".to_string(),
            );
            return;
        };

        self.server_info = result.get("serverInfo").cloned();
        self.capabilities.install_static(capabilities.clone());
        self.refresh_legend();
        self.set_state(SessionState::Ready);
        self.send(&Message::notification("initialized", Some(json!({}))));
        tracing::info!(server = %self.config.command, info = ?self.server_info, "LSP server initialized");
        self.events.emit(SessionEvent::Initialized {
            capabilities,
            server_info: self.server_info.clone(),
        });
        self.announce_documents();
    }

    // Timers

    /// Earliest instant at which [`Self::handle_timers`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        let flush = if self.state == SessionState::Ready {
            self.documents.next_deadline()
        } else {
            None
        };
        [flush, self.shutdown_deadline, self.restart_at]
            .into_iter()
            .flatten()
            .min()
    }

    pub fn handle_timers(&mut self, now: Instant) {
        if self.state == SessionState::Ready {
            let flushed = self.documents.flush_due(now, &self.capabilities);
            for (path, message) in flushed {
                self.send(&message);
                self.request_tokens(&path, false);
            }
        }

        if let Some(deadline) = self.shutdown_deadline
            && deadline <= now
        {
            self.shutdown_deadline = None;
            match self.state {
                SessionState::ShuttingDown => {
                    self.terminate(SessionState::Errored, "server did not answer shutdown".to_string());
                }
                SessionState::ShutDown => {
                    tracing::debug!(server = %self.config.command, "Server did not exit after exit notification; stopping");
                    self.finish_cleanly();
                }
                _ => {}
            }
        }

        if let Some(at) = self.restart_at
            && at <= now
        {
            self.restart_at = None;
            if self.state == SessionState::Disconnected {
                self.connect(now);
            }
        }
    }

    // Requests

    /// Send a request; `callback` runs exactly once with the outcome
    /// unless the request is cancelled first.
    pub fn request(
        &mut self,
        method: &str,
        params: Option<Value>,
        callback: impl FnOnce(Result<Value, RequestError>) + Send + 'static,
    ) -> Result<RequestId, SessionError> {
        self.require_ready("request")?;
        self.check_capability(method, params.as_ref())?;
        if method.starts_with("textDocument/") {
            self.flush_all();
        }
        let (id, message) = self.requests.send(method, params, Responder::callback(callback));
        self.send(&message);
        Ok(id)
    }

    /// Send a notification that has no dedicated operation.
    pub fn notify(&mut self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        self.require_ready("notify")?;
        if method.starts_with("textDocument/") {
            self.flush_all();
        }
        self.send(&Message::notification(method, params));
        Ok(())
    }

    fn check_capability(&self, method: &str, params: Option<&Value>) -> Result<(), ProtocolError> {
        match self.capabilities.registered(method) {
            CapabilityState::Disabled => Err(ProtocolError::CapabilityNotSupported {
                method: method.to_string(),
            }),
            CapabilityState::Unknown => Ok(()),
            CapabilityState::Enabled => {
                let Some(path) = protocol::params_document_uri(params).and_then(|uri| self.documents.path_for_uri(uri))
                else {
                    return Ok(());
                };
                let Some(language_id) = self.documents.language_id(&path) else {
                    return Ok(());
                };
                let target = DocumentTarget {
                    path: &path,
                    language_id,
                };
                if self.capabilities.is_enabled_for(method, &target) {
                    Ok(())
                } else {
                    Err(ProtocolError::FilteredOut {
                        method: method.to_string(),
                        path,
                    })
                }
            }
        }
    }

    /// Forget a request locally and tell the server, best effort. Returns
    /// whether it was pending.
    pub fn cancel(&mut self, id: &RequestId) -> bool {
        if !self.requests.cancel(id) {
            return false;
        }
        if self.state.is_reachable() {
            self.send(&Message::notification(
                "$/cancelRequest",
                Some(protocol::cancel_params(id)),
            ));
        }
        true
    }

    /// Cancel a server-reported cancellable operation.
    pub fn cancel_progress(&mut self, token: &ProgressToken) -> bool {
        if !self.state.is_reachable() {
            return false;
        }
        match self.progress.cancel(token) {
            Some(message) => {
                self.send(&message);
                true
            }
            None => false,
        }
    }

    // Documents

    /// Start tracking a document. Before `Ready` the `didOpen` is deferred
    /// until the handshake completes.
    pub fn open(&mut self, path: &Path, language_id: &str, text: &str) -> Result<(), SessionError> {
        if !self.documents.open(path, language_id, text)? {
            tracing::debug!(path = %path.display(), "Document already open");
            return Ok(());
        }
        if self.state == SessionState::Ready {
            self.announce(path);
        }
        Ok(())
    }

    /// Replace `removed` characters at character offset `offset` with
    /// `inserted`. Returns the new document version.
    pub fn change(
        &mut self,
        path: &Path,
        offset: usize,
        removed: usize,
        inserted: &str,
        now: Instant,
    ) -> Result<i32, SessionError> {
        let caps = (self.state == SessionState::Ready).then_some(&self.capabilities);
        Ok(self.documents.change(path, offset, removed, inserted, caps, now)?)
    }

    /// Send `willSave` when the server asked for it.
    pub fn will_save(&mut self, path: &Path) -> Result<(), SessionError> {
        if !self.documents.is_open(path) {
            return Err(ProtocolError::DocumentNotOpen(path.to_path_buf()).into());
        }
        if self.state != SessionState::Ready {
            return Ok(());
        }
        self.flush(path);
        if let Some(message) = self.documents.will_save(path, &self.capabilities)? {
            self.send(&message);
        }
        Ok(())
    }

    /// Send `didSave`, with text when the server's options ask for it.
    pub fn save(&mut self, path: &Path) -> Result<(), SessionError> {
        if !self.documents.is_open(path) {
            return Err(ProtocolError::DocumentNotOpen(path.to_path_buf()).into());
        }
        if self.state != SessionState::Ready {
            return Ok(());
        }
        self.flush(path);
        if let Some(message) = self.documents.saved(path, &self.capabilities)? {
            self.send(&message);
        }
        Ok(())
    }

    /// Stop tracking a document. Queued edits are dropped.
    pub fn close(&mut self, path: &Path) -> Result<(), SessionError> {
        let caps = (self.state == SessionState::Ready).then_some(&self.capabilities);
        let message = self.documents.close(path, caps)?;
        if let Some(message) = message {
            self.send(&message);
        }
        self.tokens.remove(path);
        if self.diagnostics.remove(path) {
            self.events.emit(SessionEvent::Diagnostics {
                path: path.to_path_buf(),
                items: Vec::new(),
            });
        }
        Ok(())
    }

    /// Send queued edits for `path` now.
    pub fn flush(&mut self, path: &Path) {
        if self.state != SessionState::Ready {
            return;
        }
        if let Some(message) = self.documents.flush(path, &self.capabilities) {
            self.send(&message);
            self.request_tokens(path, false);
        }
    }

    fn flush_all(&mut self) {
        let flushed = self.documents.flush_all(&self.capabilities);
        for (path, message) in flushed {
            self.send(&message);
            self.request_tokens(&path, false);
        }
    }

    fn announce(&mut self, path: &Path) {
        if let Some(message) = self.documents.did_open(path, &self.capabilities) {
            self.send(&message);
            self.request_tokens(path, false);
        }
    }

    fn announce_documents(&mut self) {
        for path in self.documents.unannounced() {
            self.announce(&path);
        }
    }

    // Semantic tokens

    /// Ask for fresh tokens for `path` if the cache is stale.
    pub fn request_semantic_tokens(&mut self, path: &Path) -> Result<(), SessionError> {
        self.require_ready("request_semantic_tokens")?;
        if !self.documents.is_open(path) {
            return Err(ProtocolError::DocumentNotOpen(path.to_path_buf()).into());
        }
        self.flush(path);
        self.request_tokens(path, false);
        Ok(())
    }

    fn request_tokens(&mut self, path: &Path, force: bool) {
        if self.state != SessionState::Ready || !self.documents.is_open_on_server(path) {
            return;
        }
        let (Some(version), Some(language_id), Some(uri)) = (
            self.documents.version(path),
            self.documents.language_id(path).map(String::from),
            self.documents.uri(path).map(String::from),
        ) else {
            return;
        };
        let target = DocumentTarget {
            path,
            language_id: &language_id,
        };
        if !self.capabilities.is_enabled_for(SEMANTIC_TOKENS_FULL, &target) {
            return;
        }
        let delta = self.capabilities.is_enabled_for(SEMANTIC_TOKENS_DELTA, &target);
        let planned = if force {
            self.tokens.refresh(path, version, delta)
        } else if delta {
            self.tokens.request_delta(path, version)
        } else {
            self.tokens.request_full(path, version)
        };
        let Some(request) = planned else {
            return;
        };
        let params = match &request {
            TokenRequest::Full => protocol::semantic_tokens_full_params(&uri),
            TokenRequest::Delta { previous_result_id } => {
                protocol::semantic_tokens_delta_params(&uri, previous_result_id)
            }
        };
        let (_, message) = self.requests.send(
            request.method(),
            Some(params),
            Responder::Internal(SessionRequest::SemanticTokens {
                path: path.to_path_buf(),
            }),
        );
        self.send(&message);
    }

    fn on_tokens_response(&mut self, path: &Path, outcome: Result<Value, ResponseError>) {
        match outcome {
            Ok(result) => {
                let result = if result.is_null() { json!({ "data": [] }) } else { result };
                match self.tokens.complete(path, &result) {
                    TokenOutcome::Updated(tokens) => self.events.emit(SessionEvent::DocumentUpdated {
                        path: path.to_path_buf(),
                        tokens,
                    }),
                    TokenOutcome::NeedsFullReload => {}
                    TokenOutcome::Discarded => return,
                }
                let again = self.tokens.take_rerequest(path);
                self.request_tokens(path, again);
            }
            Err(error) => {
                let again = self.tokens.request_failed(path);
                if matches!(error.code, error_codes::REQUEST_CANCELLED | error_codes::CONTENT_MODIFIED) {
                    tracing::debug!(path = %path.display(), code = error.code, "Semantic token request dropped by server");
                } else {
                    tracing::warn!(path = %path.display(), code = error.code, "Semantic token request failed: {}", error.message);
                }
                if again {
                    self.request_tokens(path, true);
                }
            }
        }
    }

    fn refresh_legend(&mut self) {
        let legend = self
            .capabilities
            .semantic_tokens_legend()
            .as_ref()
            .and_then(SemanticTokenLegend::from_value);
        for (path, tokens) in self.tokens.set_legend(legend) {
            self.events.emit(SessionEvent::DocumentUpdated { path, tokens });
        }
    }

    // Workspace folders

    pub fn add_workspace_folder(&mut self, folder: WorkspaceFolder) {
        if self.folders.contains(&folder) {
            return;
        }
        self.folders.push(folder.clone());
        self.notify_folders(&[folder], &[]);
    }

    pub fn remove_workspace_folder(&mut self, uri: &str) {
        let Some(index) = self.folders.iter().position(|f| f.uri == uri) else {
            return;
        };
        let folder = self.folders.remove(index);
        self.notify_folders(&[], &[folder]);
    }

    fn notify_folders(&mut self, added: &[WorkspaceFolder], removed: &[WorkspaceFolder]) {
        if self.state == SessionState::Ready
            && self.capabilities.registered("workspace/didChangeWorkspaceFolders") == CapabilityState::Enabled
        {
            self.send(&Message::notification(
                "workspace/didChangeWorkspaceFolders",
                Some(protocol::did_change_workspace_folders_params(added, removed)),
            ));
        }
    }

    // Server request handlers

    pub(crate) fn on_register_capability(&mut self, params: Option<Value>) -> Result<Value, ResponseError> {
        let params: RegistrationParams = parse_params("client/registerCapability", params)?;
        let mut tokens_changed = false;
        for registration in params.registrations {
            tracing::debug!(id = %registration.id, method = %registration.method, "Registering capability");
            tokens_changed |= registration.method == SEMANTIC_TOKENS;
            self.capabilities
                .register(&registration.id, &registration.method, registration.register_options);
        }
        self.after_capability_change(tokens_changed);
        Ok(Value::Null)
    }

    pub(crate) fn on_unregister_capability(&mut self, params: Option<Value>) -> Result<Value, ResponseError> {
        let params: UnregistrationParams = parse_params("client/unregisterCapability", params)?;
        let mut tokens_changed = false;
        for unregistration in params.unregisterations {
            let removed = self
                .capabilities
                .unregister_registration(&unregistration.id, &unregistration.method);
            if !removed {
                tracing::debug!(id = %unregistration.id, method = %unregistration.method, "Unregistering unknown capability");
            }
            tokens_changed |= unregistration.method == SEMANTIC_TOKENS;
        }
        self.after_capability_change(tokens_changed);
        Ok(Value::Null)
    }

    fn after_capability_change(&mut self, tokens_changed: bool) {
        self.events.emit(SessionEvent::CapabilitiesChanged);
        if tokens_changed {
            self.refresh_legend();
        }
        if self.state == SessionState::Ready {
            self.announce_documents();
            if tokens_changed {
                for path in self.documents.server_open_paths() {
                    self.request_tokens(&path, false);
                }
            }
        }
    }

    pub(crate) fn on_work_done_progress_create(&mut self, params: Option<Value>) -> Result<Value, ResponseError> {
        let token = params
            .as_ref()
            .and_then(|p| p.get("token"))
            .and_then(|t| serde_json::from_value::<ProgressToken>(t.clone()).ok())
            .ok_or_else(|| ResponseError::new(error_codes::INVALID_PARAMS, "missing progress token"))?;
        self.progress.create(token);
        Ok(Value::Null)
    }

    pub(crate) fn on_configuration(&mut self, params: Option<Value>) -> Result<Value, ResponseError> {
        let params: ConfigurationParams = parse_params("workspace/configuration", params)?;
        Ok(Value::Array(
            params
                .items
                .iter()
                .map(|item| self.config.setting(item.section.as_deref()))
                .collect(),
        ))
    }

    pub(crate) fn on_workspace_folders(&mut self, _params: Option<Value>) -> Result<Value, ResponseError> {
        serde_json::to_value(&self.folders)
            .map_err(|e| ResponseError::new(error_codes::INTERNAL_ERROR, e.to_string()))
    }

    pub(crate) fn on_semantic_tokens_refresh(&mut self, _params: Option<Value>) -> Result<Value, ResponseError> {
        for path in self.documents.server_open_paths() {
            self.request_tokens(&path, true);
        }
        Ok(Value::Null)
    }

    pub(crate) fn on_show_message_request(&mut self, params: Option<Value>) -> Result<Value, ResponseError> {
        let params: MessageParams = parse_params("window/showMessageRequest", params)?;
        self.events.emit(SessionEvent::ShowMessage {
            kind: MessageKind::from_lsp(params.kind),
            message: params.message,
        });
        Ok(Value::Null)
    }

    // Server notification handlers

    pub(crate) fn on_publish_diagnostics(&mut self, params: Option<Value>) {
        let Some(params) = params else { return };
        let params = match serde_json::from_value::<PublishDiagnosticsParams>(params) {
            Ok(params) => params,
            Err(e) => {
                tracing::debug!(server = %self.config.command, "Failed to parse publishDiagnostics: {e}");
                return;
            }
        };
        let Some(path) = self.documents.path_for_uri(&params.uri) else {
            tracing::debug!(uri = %params.uri, "Diagnostics for non-file URI");
            return;
        };
        if !self.documents.is_open(&path) && !normalize_path(&path).starts_with(&self.root) {
            tracing::warn!(
                server = %self.config.command,
                path = %path.display(),
                "Ignoring diagnostics for path outside workspace"
            );
            return;
        }
        if let (Some(published), Some(current)) = (params.version, self.documents.version(&path))
            && published < current
        {
            tracing::debug!(path = %path.display(), published, current, "Dropping diagnostics for an older version");
            return;
        }
        let items: Vec<_> = params
            .diagnostics
            .iter()
            .map(protocol::LspDiagnostic::to_diagnostic)
            .collect();
        self.diagnostics.update(path.clone(), items.clone());
        self.events.emit(SessionEvent::Diagnostics { path, items });
    }

    pub(crate) fn on_progress(&mut self, params: Option<Value>) {
        let Some(event) = params.as_ref().and_then(|p| self.progress.handle_notification(p)) else {
            return;
        };
        let done = match &event {
            ProgressEvent::End { token, .. } => Some(token.clone()),
            _ => None,
        };
        self.events.emit(SessionEvent::Progress(event));
        if let Some(token) = done {
            self.events.emit(SessionEvent::WorkDone { token });
        }
    }

    pub(crate) fn on_log_message(&mut self, params: Option<Value>) {
        let Ok(params) = parse_params::<MessageParams>("window/logMessage", params) else {
            return;
        };
        let server = &self.config.command;
        match MessageKind::from_lsp(params.kind) {
            MessageKind::Error => tracing::error!(%server, "{}", params.message),
            MessageKind::Warning => tracing::warn!(%server, "{}", params.message),
            MessageKind::Info => tracing::info!(%server, "{}", params.message),
            MessageKind::Log => tracing::debug!(%server, "{}", params.message),
        }
    }

    pub(crate) fn on_show_message(&mut self, params: Option<Value>) {
        let Ok(params) = parse_params::<MessageParams>("window/showMessage", params) else {
            return;
        };
        self.events.emit(SessionEvent::ShowMessage {
            kind: MessageKind::from_lsp(params.kind),
            message: params.message,
        });
    }

    // Accessors

    /// Nothing further will happen without a new `start`: the session is
    /// terminal, or disconnected with no restart pending.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal() || (self.state == SessionState::Disconnected && self.restart_at.is_none())
    }

    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn capabilities(&self) -> &CapabilityRegistry {
        &self.capabilities
    }

    #[must_use]
    pub fn documents(&self) -> &DocumentSyncManager {
        &self.documents
    }

    #[must_use]
    pub fn semantic_tokens(&self) -> &SemanticTokenReconciler {
        &self.tokens
    }

    #[must_use]
    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    #[must_use]
    pub fn server_info(&self) -> Option<&Value> {
        self.server_info.as_ref()
    }

    #[must_use]
    pub fn workspace_folders(&self) -> &[WorkspaceFolder] {
        &self.folders
    }

    /// Reason for the most recent abnormal end of a connection.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }
}
