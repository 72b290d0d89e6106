//! JSON-RPC message model and the LSP parameter shapes the engine emits.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::types::{Diagnostic, DiagnosticSeverity, WorkspaceFolder};

pub const JSONRPC_VERSION: &str = "2.0";

/// JSON-RPC error codes the engine produces or interprets.
pub mod error_codes {
    pub const INVALID_PARAMS: i64 = -32602;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    pub const REQUEST_CANCELLED: i64 = -32800;
    pub const CONTENT_MODIFIED: i64 = -32801;
}

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub struct PathToUriError {
    path: PathBuf,
}

/// Correlation id of a request. Servers may use integers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Int(i64),
    Str(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(id) => write!(f, "{id}"),
            Self::Str(id) => write!(f, "{id:?}"),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        Self::Str(id.to_string())
    }
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {method}"),
        )
    }

    /// `InitializeError.retry` from the initialize handshake.
    #[must_use]
    pub fn retry_requested(&self) -> bool {
        self.data
            .as_ref()
            .and_then(|d| d.get("retry"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub id: RequestId,
    pub outcome: Result<Value, ResponseError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Option<Value>,
}

/// One JSON-RPC message in either direction.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    Notification(Notification),
}

impl Message {
    pub fn request(id: RequestId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Request(Request {
            id,
            method: method.into(),
            params,
        })
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self::Notification(Notification {
            method: method.into(),
            params,
        })
    }

    pub fn response(id: RequestId, outcome: Result<Value, ResponseError>) -> Self {
        Self::Response(Response { id, outcome })
    }

    /// Classify a decoded JSON body.
    ///
    /// Returns `None` for values that are not JSON-RPC messages, including
    /// responses with a `null` id (they cannot be correlated).
    #[must_use]
    pub fn from_value(mut value: Value) -> Option<Self> {
        let obj = value.as_object_mut()?;
        let id = match obj.remove("id") {
            None | Some(Value::Null) => None,
            Some(raw) => Some(serde_json::from_value::<RequestId>(raw).ok()?),
        };
        let method = match obj.remove("method") {
            Some(Value::String(m)) => Some(m),
            Some(_) => return None,
            None => None,
        };
        let params = obj.remove("params");

        match (id, method) {
            (Some(id), Some(method)) => Some(Self::Request(Request { id, method, params })),
            (None, Some(method)) => Some(Self::Notification(Notification { method, params })),
            (Some(id), None) => {
                // A missing `result` reads as `null`.
                let outcome = match obj.remove("error") {
                    Some(error) if !error.is_null() => {
                        Err(serde_json::from_value::<ResponseError>(error).ok()?)
                    }
                    _ => Ok(obj.remove("result").unwrap_or(Value::Null)),
                };
                Some(Self::Response(Response { id, outcome }))
            }
            (None, None) => None,
        }
    }

    #[must_use]
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("jsonrpc".into(), Value::from(JSONRPC_VERSION));
        match self {
            Self::Request(req) => {
                obj.insert("id".into(), id_value(&req.id));
                obj.insert("method".into(), Value::from(req.method.as_str()));
                if let Some(params) = &req.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Notification(note) => {
                obj.insert("method".into(), Value::from(note.method.as_str()));
                if let Some(params) = &note.params {
                    obj.insert("params".into(), params.clone());
                }
            }
            Self::Response(resp) => {
                obj.insert("id".into(), id_value(&resp.id));
                match &resp.outcome {
                    Ok(result) => {
                        obj.insert("result".into(), result.clone());
                    }
                    Err(error) => {
                        obj.insert("error".into(), json!(error));
                    }
                }
            }
        }
        Value::Object(obj)
    }

    /// Method name for requests and notifications.
    #[must_use]
    pub fn method(&self) -> Option<&str> {
        match self {
            Self::Request(req) => Some(&req.method),
            Self::Notification(note) => Some(&note.method),
            Self::Response(_) => None,
        }
    }
}

fn id_value(id: &RequestId) -> Value {
    match id {
        RequestId::Int(i) => Value::from(*i),
        RequestId::Str(s) => Value::from(s.as_str()),
    }
}

/// Zero-based line / UTF-16 column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

/// One entry of `DidChangeTextDocumentParams.contentChanges`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ContentChange {
    Incremental { range: Range, text: String },
    Full { text: String },
}

pub(crate) fn initialize_params(
    root_uri: &str,
    folders: &[WorkspaceFolder],
    initialization_options: Option<&Value>,
) -> Value {
    let mut params = json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": "relay",
            "version": env!("CARGO_PKG_VERSION")
        },
        "rootUri": root_uri,
        "capabilities": client_capabilities(),
        "workspaceFolders": folders,
        "trace": "off"
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

fn client_capabilities() -> Value {
    json!({
        "workspace": {
            "workspaceFolders": true,
            "configuration": true,
            "semanticTokens": { "refreshSupport": true },
            "didChangeConfiguration": { "dynamicRegistration": true }
        },
        "textDocument": {
            "synchronization": {
                "dynamicRegistration": true,
                "willSave": true,
                "willSaveWaitUntil": false,
                "didSave": true
            },
            "publishDiagnostics": {
                "relatedInformation": false,
                "versionSupport": true
            },
            "hover": { "dynamicRegistration": true },
            "completion": { "dynamicRegistration": true },
            "definition": { "dynamicRegistration": true },
            "formatting": { "dynamicRegistration": true },
            "semanticTokens": {
                "dynamicRegistration": true,
                "requests": { "range": false, "full": { "delta": true } },
                "tokenTypes": [],
                "tokenModifiers": [],
                "formats": ["relative"],
                "overlappingTokenSupport": false,
                "multilineTokenSupport": false
            }
        },
        "window": {
            "workDoneProgress": true,
            "showMessage": {}
        },
        "general": {
            "positionEncodings": ["utf-16"]
        }
    })
}

pub(crate) fn text_document(uri: &str) -> Value {
    json!({ "uri": uri })
}

pub(crate) fn did_open_params(uri: &str, language_id: &str, version: i32, text: &str) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, changes: &[ContentChange]) -> Value {
    json!({
        "textDocument": {
            "uri": uri,
            "version": version
        },
        "contentChanges": changes
    })
}

/// `TextDocumentSaveReason.Manual`.
const SAVE_REASON_MANUAL: u8 = 1;

pub(crate) fn will_save_params(uri: &str) -> Value {
    json!({
        "textDocument": text_document(uri),
        "reason": SAVE_REASON_MANUAL
    })
}

pub(crate) fn did_save_params(uri: &str, text: Option<&str>) -> Value {
    let mut params = json!({ "textDocument": text_document(uri) });
    if let Some(text) = text {
        params["text"] = Value::from(text);
    }
    params
}

pub(crate) fn did_close_params(uri: &str) -> Value {
    json!({ "textDocument": text_document(uri) })
}

pub(crate) fn semantic_tokens_full_params(uri: &str) -> Value {
    json!({ "textDocument": text_document(uri) })
}

pub(crate) fn semantic_tokens_delta_params(uri: &str, previous_result_id: &str) -> Value {
    json!({
        "textDocument": text_document(uri),
        "previousResultId": previous_result_id
    })
}

pub(crate) fn cancel_params(id: &RequestId) -> Value {
    json!({ "id": id })
}

pub(crate) fn work_done_cancel_params(token: &crate::progress::ProgressToken) -> Value {
    json!({ "token": token })
}

pub(crate) fn did_change_workspace_folders_params(
    added: &[WorkspaceFolder],
    removed: &[WorkspaceFolder],
) -> Value {
    json!({
        "event": {
            "added": added,
            "removed": removed
        }
    })
}

/// Pull `textDocument.uri` out of request params, if present.
pub(crate) fn params_document_uri(params: Option<&Value>) -> Option<&str> {
    params?.get("textDocument")?.get("uri")?.as_str()
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    #[serde(default)]
    pub version: Option<i32>,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: Range,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

impl LspDiagnostic {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message.clone(),
            self.range.start,
            self.source
                .clone()
                .unwrap_or_else(|| String::from("unknown")),
        )
    }
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
