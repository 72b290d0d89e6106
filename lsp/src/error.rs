//! Error taxonomy for the client engine.
//!
//! Each variant family maps to one propagation policy:
//!
//! - [`FramingError`]: one frame dropped, stream continues.
//! - [`ProtocolError`]: operation aborted locally, logged.
//! - [`RequestError`]: delivered to the original caller's callback only.
//! - [`TransportError`]: escalates to the session's restart policy.
//! - [`SessionError`]: returned synchronously from session calls made in the
//!   wrong lifecycle state.
//!
//! Token drift is handled inside the reconciler and has no public error type.

use std::path::PathBuf;

use crate::protocol::{RequestId, ResponseError};
use crate::types::SessionState;

/// A single frame could not be turned into a message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("header block exceeds {max} bytes")]
    HeaderTooLarge { max: usize },
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {value:?}")]
    InvalidContentLength { value: String },
    #[error("Content-Length {length} exceeds maximum {max}")]
    FrameTooLarge { length: usize, max: usize },
    #[error("unsupported encoding in Content-Type: {content_type:?}")]
    UnsupportedEncoding { content_type: String },
    #[error("invalid JSON body: {message}")]
    InvalidJson { message: String, raw: Vec<u8> },
    #[error("JSON body is not a JSON-RPC message")]
    NotAMessage { raw: Vec<u8> },
}

/// The server or a caller broke a protocol rule; the operation is aborted.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("response for unknown request id {0}")]
    UnknownResponseId(RequestId),
    #[error("server does not support {method}")]
    CapabilityNotSupported { method: String },
    #[error("{method} is not enabled for {}", path.display())]
    FilteredOut { method: String, path: PathBuf },
    #[error("document is not open: {}", .0.display())]
    DocumentNotOpen(PathBuf),
    #[error("path cannot be expressed as a file URI: {}", .0.display())]
    InvalidPath(PathBuf),
}

/// Outcome delivered to a request callback when no result is available.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RequestError {
    /// The server answered with a JSON-RPC error object.
    #[error("server error {}: {}", .0.code, .0.message)]
    Server(ResponseError),
    /// The session went away before an answer arrived.
    #[error("request failed: server unreachable ({reason})")]
    Unreachable { reason: String },
}

impl RequestError {
    pub(crate) fn unreachable(reason: impl Into<String>) -> Self {
        Self::Unreachable {
            reason: reason.into(),
        }
    }
}

/// Failure of the byte pipe to the server process.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to start server: {0}")]
    Start(String),
    #[error("transport is not running")]
    NotRunning,
    #[error("write failed: {0}")]
    Write(String),
}

/// A session call was made in a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("operation {operation} is invalid in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("session task has stopped")]
    Closed,
}
