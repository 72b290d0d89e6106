//! Async driver that owns a [`Session`] on a tokio task.
//!
//! The task multiplexes three sources with `select!`: transport events,
//! commands from [`LspHandle`]s, and the session's next timer deadline.
//! The session itself never sees concurrency.

use std::path::{Path, PathBuf};
use std::time::Instant;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{RequestError, SessionError};
use crate::events::SessionEvent;
use crate::progress::ProgressToken;
use crate::protocol::RequestId;
use crate::session::Session;
use crate::transport::{ProcessTransport, Transport};
use crate::types::{ServerConfig, SessionState};

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Request {
        method: String,
        params: Option<Value>,
        response: oneshot::Sender<Result<Value, RequestError>>,
        reply: Reply<RequestId>,
    },
    Notify {
        method: String,
        params: Option<Value>,
        reply: Reply<()>,
    },
    Cancel {
        id: RequestId,
        reply: oneshot::Sender<bool>,
    },
    CancelProgress {
        token: ProgressToken,
        reply: oneshot::Sender<bool>,
    },
    Open {
        path: PathBuf,
        language_id: String,
        text: String,
        reply: Reply<()>,
    },
    Change {
        path: PathBuf,
        offset: usize,
        removed: usize,
        inserted: String,
        reply: Reply<i32>,
    },
    Save {
        path: PathBuf,
        reply: Reply<()>,
    },
    Close {
        path: PathBuf,
        reply: Reply<()>,
    },
    RetryInitialize {
        accept: bool,
        reply: Reply<()>,
    },
    Shutdown {
        reply: Reply<()>,
    },
    State {
        reply: oneshot::Sender<SessionState>,
    },
}

/// A request sent through an [`LspHandle`].
#[derive(Debug)]
pub struct PendingRequest {
    id: RequestId,
    response: oneshot::Receiver<Result<Value, RequestError>>,
}

impl PendingRequest {
    #[must_use]
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    /// Wait for the server's answer. A cancelled request resolves to
    /// [`RequestError::Unreachable`].
    pub async fn response(self) -> Result<Value, RequestError> {
        self.response
            .await
            .unwrap_or_else(|_| Err(RequestError::unreachable("request was cancelled")))
    }
}

/// Cloneable command side of a running client.
#[derive(Debug, Clone)]
pub struct LspHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl LspHandle {
    async fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)?
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<PendingRequest, SessionError> {
        let (response, response_rx) = oneshot::channel();
        let id = self
            .call(|reply| Command::Request {
                method: method.to_string(),
                params,
                response,
                reply,
            })
            .await?;
        Ok(PendingRequest {
            id,
            response: response_rx,
        })
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), SessionError> {
        self.call(|reply| Command::Notify {
            method: method.to_string(),
            params,
            reply,
        })
        .await
    }

    /// Returns whether the request was still pending.
    pub async fn cancel(&self, id: RequestId) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Cancel { id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn cancel_progress(&self, token: ProgressToken) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::CancelProgress { token, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub async fn open(&self, path: &Path, language_id: &str, text: &str) -> Result<(), SessionError> {
        self.call(|reply| Command::Open {
            path: path.to_path_buf(),
            language_id: language_id.to_string(),
            text: text.to_string(),
            reply,
        })
        .await
    }

    pub async fn change(&self, path: &Path, offset: usize, removed: usize, inserted: &str) -> Result<i32, SessionError> {
        self.call(|reply| Command::Change {
            path: path.to_path_buf(),
            offset,
            removed,
            inserted: inserted.to_string(),
            reply,
        })
        .await
    }

    pub async fn save(&self, path: &Path) -> Result<(), SessionError> {
        self.call(|reply| Command::Save {
            path: path.to_path_buf(),
            reply,
        })
        .await
    }

    pub async fn close(&self, path: &Path) -> Result<(), SessionError> {
        self.call(|reply| Command::Close {
            path: path.to_path_buf(),
            reply,
        })
        .await
    }

    /// Answer an [`SessionEvent::InitializeRetryOffered`].
    pub async fn retry_initialize(&self, accept: bool) -> Result<(), SessionError> {
        self.call(|reply| Command::RetryInitialize { accept, reply }).await
    }

    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    pub async fn state(&self) -> Result<SessionState, SessionError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::State { reply })
            .map_err(|_| SessionError::Closed)?;
        rx.await.map_err(|_| SessionError::Closed)
    }
}

/// A session running on its own task.
pub struct LspClient {
    handle: LspHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    task: JoinHandle<()>,
}

impl LspClient {
    /// Spawn the configured server for the workspace at `root`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn start(config: ServerConfig, root: &Path) -> Self {
        let transport = ProcessTransport::new(&config, root);
        Self::start_with_transport(config, root, Box::new(transport))
    }

    /// Like [`Self::start`] with a caller-supplied transport.
    #[must_use]
    pub fn start_with_transport(config: ServerConfig, root: &Path, transport: Box<dyn Transport>) -> Self {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let mut session = Session::new(config, root, transport, transport_tx);
        let events = session.subscribe();
        let task = tokio::spawn(run(session, transport_rx, command_rx));
        Self {
            handle: LspHandle { commands: command_tx },
            events,
            task,
        }
    }

    #[must_use]
    pub fn handle(&self) -> LspHandle {
        self.handle.clone()
    }

    /// Next editor event; `None` once the session task has ended.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        self.events.recv().await
    }

    /// Wait for the session task to end.
    pub async fn join(self) {
        let Self { handle, task, .. } = self;
        drop(handle);
        if let Err(e) = task.await {
            tracing::warn!("LSP session task failed: {e}");
        }
    }

    /// Split into the command handle and the event stream.
    #[must_use]
    pub fn into_parts(self) -> (LspHandle, mpsc::UnboundedReceiver<SessionEvent>, JoinHandle<()>) {
        (self.handle, self.events, self.task)
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

async fn run(
    mut session: Session,
    mut transport_rx: mpsc::UnboundedReceiver<crate::transport::TransportEvent>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    if let Err(e) = session.start(Instant::now()) {
        tracing::error!("LSP session failed to start: {e}");
        return;
    }
    let mut commands_open = true;

    while !session.is_finished() {
        let deadline = session.next_deadline();
        tokio::select! {
            Some(event) = transport_rx.recv() => {
                session.handle_transport_event(event, Instant::now());
            }
            command = commands.recv(), if commands_open => match command {
                Some(command) => apply(&mut session, command),
                None => {
                    commands_open = false;
                    if session.state() == SessionState::Ready {
                        tracing::debug!("Every LSP handle dropped; shutting down");
                        let _ = session.shutdown(Instant::now());
                    } else if session.state() != SessionState::ShuttingDown
                        && session.state() != SessionState::ShutDown
                    {
                        break;
                    }
                }
            },
            () = sleep_until(deadline) => {
                session.handle_timers(Instant::now());
            }
        }
    }
    tracing::debug!(state = ?session.state(), "LSP session task finished");
}

fn apply(session: &mut Session, command: Command) {
    let now = Instant::now();
    match command {
        Command::Request {
            method,
            params,
            response,
            reply,
        } => {
            let result = session.request(&method, params, move |outcome| {
                let _ = response.send(outcome);
            });
            let _ = reply.send(result);
        }
        Command::Notify { method, params, reply } => {
            let _ = reply.send(session.notify(&method, params));
        }
        Command::Cancel { id, reply } => {
            let _ = reply.send(session.cancel(&id));
        }
        Command::CancelProgress { token, reply } => {
            let _ = reply.send(session.cancel_progress(&token));
        }
        Command::Open {
            path,
            language_id,
            text,
            reply,
        } => {
            let _ = reply.send(session.open(&path, &language_id, &text));
        }
        Command::Change {
            path,
            offset,
            removed,
            inserted,
            reply,
        } => {
            let _ = reply.send(session.change(&path, offset, removed, &inserted, now));
        }
        Command::Save { path, reply } => {
            let result = session.will_save(&path).and_then(|()| session.save(&path));
            let _ = reply.send(result);
        }
        Command::Close { path, reply } => {
            let _ = reply.send(session.close(&path));
        }
        Command::RetryInitialize { accept, reply } => {
            let result = if accept {
                session.retry_initialize()
            } else {
                session.decline_initialize_retry()
            };
            let _ = reply.send(result);
        }
        Command::Shutdown { reply } => {
            let _ = reply.send(session.shutdown(now));
        }
        Command::State { reply } => {
            let _ = reply.send(session.state());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::protocol::{Message, Request};
    use crate::transport::{MemoryPeer, MemoryTransport};

    async fn wait_for(client: &mut LspClient, want: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = client.next_event().await.expect("event stream ended");
                if want(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    fn single_request(peer: &MemoryPeer, method: &str) -> Request {
        peer.take_written()
            .into_iter()
            .find_map(|m| match m {
                Message::Request(r) if r.method == method => Some(r),
                _ => None,
            })
            .unwrap_or_else(|| panic!("no {method} request written"))
    }

    async fn ready_client() -> (LspClient, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let mut client = LspClient::start_with_transport(
            ServerConfig::new("test-ls", "rust"),
            Path::new("/work"),
            Box::new(transport),
        );
        wait_for(&mut client, |e| {
            *e == SessionEvent::StateChanged(SessionState::InitializeRequested)
        })
        .await;
        let init = single_request(&peer, "initialize");
        assert!(peer.send(&Message::response(
            init.id,
            Ok(json!({ "capabilities": { "textDocumentSync": 2 } }))
        )));
        wait_for(&mut client, |e| *e == SessionEvent::StateChanged(SessionState::Ready)).await;
        (client, peer)
    }

    #[tokio::test]
    async fn request_round_trip_through_driver() {
        let (client, peer) = ready_client().await;
        let handle = client.handle();
        let pending = handle.request("custom/echo", Some(json!([1]))).await.unwrap();
        let sent = single_request(&peer, "custom/echo");
        assert_eq!(&sent.id, pending.id());
        assert!(peer.send(&Message::response(sent.id, Ok(json!("pong")))));
        assert_eq!(pending.response().await.unwrap(), json!("pong"));
    }

    #[tokio::test]
    async fn cancelled_request_resolves_unreachable() {
        let (client, _peer) = ready_client().await;
        let handle = client.handle();
        let pending = handle.request("custom/slow", None).await.unwrap();
        assert!(handle.cancel(pending.id().clone()).await);
        assert!(matches!(
            pending.response().await,
            Err(RequestError::Unreachable { .. })
        ));
    }

    #[tokio::test]
    async fn shutdown_ends_the_task() {
        let (mut client, peer) = ready_client().await;
        let handle = client.handle();
        handle.shutdown().await.unwrap();
        let shutdown = single_request(&peer, "shutdown");
        assert!(peer.send(&Message::response(shutdown.id, Ok(Value::Null))));
        wait_for(&mut client, |e| *e == SessionEvent::StateChanged(SessionState::ShutDown)).await;
        assert!(peer.finish(None));
        wait_for(&mut client, |e| *e == SessionEvent::Finished { error: None }).await;
        client.join().await;
        assert_eq!(handle.state().await, Err(SessionError::Closed));
    }

    #[tokio::test]
    async fn commands_before_ready_are_rejected_or_deferred() {
        let (transport, peer) = MemoryTransport::pair();
        peer.fail_next_start("boom");
        let client = LspClient::start_with_transport(
            ServerConfig::new("test-ls", "rust"),
            Path::new("/work"),
            Box::new(transport),
        );
        let handle = client.handle();
        assert!(matches!(
            handle.request("custom/x", None).await,
            Err(SessionError::InvalidState { .. })
        ));
        handle.open(Path::new("/work/a.rs"), "rust", "fn main() {}").await.unwrap();
        assert_eq!(handle.state().await.unwrap(), SessionState::Disconnected);
    }
}
