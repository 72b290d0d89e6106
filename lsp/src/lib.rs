//! Language Server Protocol client engine.
//!
//! [`Session`] is the synchronous core: framing, request correlation,
//! capability negotiation, document sync, semantic tokens, and progress for
//! one server connection. [`LspClient`] runs a session on a tokio task
//! behind a cloneable [`LspHandle`].

pub mod capabilities;
pub mod client;
pub mod codec;
pub mod error;
pub mod events;
pub mod progress;
pub mod protocol;
pub mod requests;
pub mod restart;
pub mod semantic_tokens;
pub mod session;
pub mod sync;
pub mod transport;
pub mod types;

pub(crate) mod diagnostics;
pub(crate) mod dispatch;

pub use capabilities::{CapabilityEntry, CapabilityRegistry, CapabilityState, DocumentTarget};
pub use client::{LspClient, LspHandle, PendingRequest};
pub use codec::MessageFramer;
pub use error::{FramingError, ProtocolError, RequestError, SessionError, TransportError};
pub use events::{MessageKind, SessionEvent};
pub use progress::{ProgressEvent, ProgressToken, ProgressTracker};
pub use protocol::{Message, Position, RequestId, ResponseError};
pub use semantic_tokens::{SemanticToken, SemanticTokenLegend, SemanticTokenReconciler};
pub use session::Session;
pub use sync::{DocumentSyncManager, SyncKind};
pub use transport::{MemoryPeer, MemoryTransport, ProcessTransport, Transport, TransportEvent};
pub use types::{
    Diagnostic, DiagnosticSeverity, DiagnosticsSnapshot, LspConfig, ServerConfig, SessionOptions,
    SessionState, WorkspaceFolder,
};
