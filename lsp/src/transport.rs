//! Byte pipes between the session and a server.
//!
//! A [`Transport`] is started with an event sender. It reports
//! [`TransportEvent::Started`] once the pipe is usable, forwards every chunk
//! of bytes it reads as [`TransportEvent::Received`], and finishes with
//! exactly one [`TransportEvent::Finished`]. I/O runs on tasks of its own;
//! session state is only touched by whoever drains the event channel.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::{self, MessageFramer};
use crate::error::TransportError;
use crate::protocol::Message;
use crate::types::ServerConfig;

const READ_BUFFER_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Started,
    Received(Vec<u8>),
    /// The pipe closed. `Some` carries the reason when it was not a clean
    /// exit.
    Finished(Option<String>),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

pub trait Transport: Send {
    /// Launch the server. Lifecycle events and bytes arrive on `events`.
    fn start(&mut self, events: TransportEvents) -> Result<(), TransportError>;

    /// Queue bytes for the server, in call order.
    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError>;

    /// Tear the pipe down without waiting for the server.
    fn stop(&mut self);
}

struct RunningProcess {
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    reader_handle: JoinHandle<()>,
    writer_handle: JoinHandle<()>,
}

/// Spawns the configured server and talks to it over stdin/stdout.
pub struct ProcessTransport {
    command: String,
    args: Vec<String>,
    cwd: PathBuf,
    running: Option<RunningProcess>,
}

impl ProcessTransport {
    #[must_use]
    pub fn new(config: &ServerConfig, cwd: &Path) -> Self {
        Self {
            command: config.command.clone(),
            args: config.args.clone(),
            cwd: cwd.to_path_buf(),
            running: None,
        }
    }
}

impl Transport for ProcessTransport {
    fn start(&mut self, events: TransportEvents) -> Result<(), TransportError> {
        self.stop();

        let resolved = which::which(&self.command)
            .map_err(|e| TransportError::Start(format!("{} not found in PATH: {e}", self.command)))?;
        let mut child = Command::new(&resolved)
            .args(&self.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TransportError::Start(format!("spawning {}: {e}", self.command)))?;

        let (Some(mut stdout), Some(mut stdin)) = (child.stdout.take(), child.stdin.take()) else {
            return Err(TransportError::Start(format!(
                "{} has no stdio pipes",
                self.command
            )));
        };

        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let writer_handle = tokio::spawn(async move {
            while let Some(bytes) = writer_rx.recv().await {
                if let Err(e) = stdin.write_all(&bytes).await {
                    tracing::warn!("LSP write error: {e}");
                    break;
                }
                if let Err(e) = stdin.flush().await {
                    tracing::warn!("LSP flush error: {e}");
                    break;
                }
            }
        });

        let name = self.command.clone();
        let reader_events = events.clone();
        let reader_handle = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_BUFFER_BYTES];
            let mut failure = None;
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        if reader_events
                            .send(TransportEvent::Received(buf[..n].to_vec()))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(server = %name, "LSP reader error: {e}");
                        failure = Some(format!("read failed: {e}"));
                        break;
                    }
                }
            }
            let status = child.wait().await;
            let reason = match (failure, status) {
                (Some(reason), _) => Some(reason),
                (None, Ok(status)) if status.success() => None,
                (None, Ok(status)) => Some(format!("server exited with {status}")),
                (None, Err(e)) => Some(format!("waiting for server failed: {e}")),
            };
            tracing::info!(server = %name, ?reason, "LSP server closed stdout");
            let _ = reader_events.send(TransportEvent::Finished(reason));
        });

        self.running = Some(RunningProcess {
            writer_tx,
            reader_handle,
            writer_handle,
        });
        let _ = events.send(TransportEvent::Started);
        Ok(())
    }

    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        let running = self.running.as_ref().ok_or(TransportError::NotRunning)?;
        running
            .writer_tx
            .send(bytes)
            .map_err(|_| TransportError::Write("writer task has stopped".to_string()))
    }

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.writer_handle.abort();
            running.reader_handle.abort();
        }
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Default)]
struct MemoryShared {
    written: Vec<u8>,
    starts: usize,
    stops: usize,
    fail_next_start: Option<String>,
    events: Option<TransportEvents>,
}

/// In-process transport: records what the session writes and lets the
/// other side inject server traffic through a [`MemoryPeer`].
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Arc<Mutex<MemoryShared>>,
    running: bool,
}

/// Server side of a [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryPeer {
    shared: Arc<Mutex<MemoryShared>>,
}

impl MemoryTransport {
    #[must_use]
    pub fn pair() -> (Self, MemoryPeer) {
        let shared = Arc::new(Mutex::new(MemoryShared::default()));
        (
            Self {
                shared: Arc::clone(&shared),
                running: false,
            },
            MemoryPeer { shared },
        )
    }

    fn with<R>(&self, f: impl FnOnce(&mut MemoryShared) -> R) -> R {
        f(&mut self.shared.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Transport for MemoryTransport {
    fn start(&mut self, events: TransportEvents) -> Result<(), TransportError> {
        let failure = self.with(|s| {
            s.starts += 1;
            s.fail_next_start.take()
        });
        if let Some(reason) = failure {
            return Err(TransportError::Start(reason));
        }
        self.running = true;
        let _ = events.send(TransportEvent::Started);
        self.with(|s| s.events = Some(events));
        Ok(())
    }

    fn send(&mut self, bytes: Vec<u8>) -> Result<(), TransportError> {
        if !self.running {
            return Err(TransportError::NotRunning);
        }
        self.with(|s| s.written.extend_from_slice(&bytes));
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
        self.with(|s| {
            s.stops += 1;
            s.events = None;
        });
    }
}

impl MemoryPeer {
    fn with<R>(&self, f: impl FnOnce(&mut MemoryShared) -> R) -> R {
        f(&mut self.shared.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Drain and decode everything the session has written so far.
    #[must_use]
    pub fn take_written(&self) -> Vec<Message> {
        let bytes = self.with(|s| std::mem::take(&mut s.written));
        MessageFramer::new()
            .feed(&bytes)
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    /// Inject a server message. Returns `false` when the transport is not
    /// running.
    pub fn send(&self, message: &Message) -> bool {
        self.send_bytes(codec::encode(message))
    }

    pub fn send_bytes(&self, bytes: Vec<u8>) -> bool {
        self.with(|s| {
            s.events
                .as_ref()
                .is_some_and(|tx| tx.send(TransportEvent::Received(bytes)).is_ok())
        })
    }

    /// Simulate the server process going away.
    pub fn finish(&self, reason: Option<String>) -> bool {
        self.with(|s| {
            s.events
                .take()
                .is_some_and(|tx| tx.send(TransportEvent::Finished(reason)).is_ok())
        })
    }

    /// Make the next `start` fail with `reason`.
    pub fn fail_next_start(&self, reason: impl Into<String>) {
        self.with(|s| s.fail_next_start = Some(reason.into()));
    }

    #[must_use]
    pub fn starts(&self) -> usize {
        self.with(|s| s.starts)
    }

    #[must_use]
    pub fn stops(&self) -> usize {
        self.with(|s| s.stops)
    }
}
