//! End-to-end scenarios against an in-memory server.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use relay_lsp::{
    CapabilityState, MemoryPeer, MemoryTransport, Message, RequestError, RequestId, ResponseError,
    ServerConfig, Session, SessionEvent, SessionState, TransportEvent,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;

struct Fixture {
    session: Session,
    peer: MemoryPeer,
    transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    now: Instant,
}

impl Fixture {
    fn new(config: ServerConfig) -> Self {
        let (transport, peer) = MemoryTransport::pair();
        let (tx, transport_rx) = mpsc::unbounded_channel();
        let mut session = Session::new(config, Path::new("/ws"), Box::new(transport), tx);
        let events = session.subscribe();
        Self {
            session,
            peer,
            transport_rx,
            events,
            now: Instant::now(),
        }
    }

    /// Feed everything the transport queued into the session.
    fn pump(&mut self) {
        while let Ok(event) = self.transport_rx.try_recv() {
            self.session.handle_transport_event(event, self.now);
        }
    }

    fn server_says(&mut self, message: &Message) {
        assert!(self.peer.send(message), "transport not running");
        self.pump();
    }

    fn requests(&self) -> Vec<relay_lsp::protocol::Request> {
        self.peer
            .take_written()
            .into_iter()
            .filter_map(|m| match m {
                Message::Request(r) => Some(r),
                _ => None,
            })
            .collect()
    }

    fn handshake(&mut self, capabilities: Value) {
        self.pump();
        let init = self.requests();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].method, "initialize");
        self.server_says(&Message::response(
            init[0].id.clone(),
            Ok(json!({ "capabilities": capabilities })),
        ));
        assert_eq!(self.session.state(), SessionState::Ready);
    }

    fn ready(capabilities: Value) -> Self {
        let mut fixture = Self::new(ServerConfig::new("mem-ls", "rust"));
        fixture.session.start(fixture.now).unwrap();
        fixture.handshake(capabilities);
        let _ = fixture.peer.take_written();
        fixture
    }

    fn events(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

fn doc() -> PathBuf {
    PathBuf::from("/ws/src/lib.rs")
}

#[test]
fn out_of_order_responses_reach_their_callers() {
    let mut f = Fixture::ready(json!({}));
    let seen: Arc<Mutex<Vec<String>>> = Arc::default();
    let mut ids = Vec::new();
    for name in ["A", "B", "C"] {
        let seen = Arc::clone(&seen);
        let id = f
            .session
            .request("custom/job", Some(json!({ "name": name })), move |outcome| {
                let value = outcome.unwrap();
                seen.lock().unwrap().push(format!("{name}={value}"));
            })
            .unwrap();
        ids.push(id);
    }
    let sent = f.requests();
    assert_eq!(sent.iter().map(|r| r.id.clone()).collect::<Vec<_>>(), ids);

    for index in [2, 0, 1] {
        f.server_says(&Message::response(ids[index].clone(), Ok(json!(index))));
    }
    assert_eq!(*seen.lock().unwrap(), ["C=2", "A=0", "B=1"]);
    assert_eq!(f.session.pending_requests(), 0);
}

#[test]
fn duplicate_and_unknown_responses_are_ignored() {
    let mut f = Fixture::ready(json!({}));
    let count = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&count);
    let id = f
        .session
        .request("custom/once", None, move |_| *counter.lock().unwrap() += 1)
        .unwrap();
    f.server_says(&Message::response(id.clone(), Ok(json!(1))));
    f.server_says(&Message::response(id, Ok(json!(2))));
    f.server_says(&Message::response(RequestId::Int(999), Ok(json!(3))));
    assert_eq!(*count.lock().unwrap(), 1);
    assert_eq!(f.session.state(), SessionState::Ready);
}

#[test]
fn garbage_between_frames_does_not_kill_the_session() {
    let mut f = Fixture::ready(json!({}));
    let got = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&got);
    let id = f
        .session
        .request("custom/x", None, move |r| *slot.lock().unwrap() = Some(r))
        .unwrap();
    let mut bytes = b"Content-Length: 5\r\n\r\n{oops".to_vec();
    bytes.extend(relay_lsp::codec::encode(&Message::response(id, Ok(json!("fine")))));
    assert!(f.peer.send_bytes(bytes));
    f.pump();
    assert_eq!(*got.lock().unwrap(), Some(Ok(json!("fine"))));
}

#[test]
fn cancelled_request_never_calls_back() {
    let mut f = Fixture::ready(json!({}));
    let called = Arc::new(Mutex::new(false));
    let flag = Arc::clone(&called);
    let id = f
        .session
        .request("custom/slow", None, move |_| *flag.lock().unwrap() = true)
        .unwrap();
    assert!(f.session.cancel(&id));
    let written = f.peer.take_written();
    let cancel = written
        .iter()
        .find(|m| m.method() == Some("$/cancelRequest"))
        .expect("cancel notification");
    assert_eq!(cancel.to_value()["params"]["id"], json!(id));

    f.server_says(&Message::response(
        id,
        Err(ResponseError::new(-32800, "cancelled")),
    ));
    assert!(!*called.lock().unwrap());
}

#[test]
fn dynamic_registration_shadows_static_capability() {
    let mut f = Fixture::ready(json!({ "hoverProvider": false }));
    assert_eq!(
        f.session.capabilities().registered("textDocument/hover"),
        CapabilityState::Disabled
    );
    f.server_says(&Message::request(
        RequestId::Int(7),
        "client/registerCapability",
        Some(json!({ "registrations": [{ "id": "hover-1", "method": "textDocument/hover" }] })),
    ));
    assert_eq!(
        f.session.capabilities().registered("textDocument/hover"),
        CapabilityState::Enabled
    );
    assert!(f.session.request("textDocument/hover", None, |_| {}).is_ok());

    f.server_says(&Message::request(
        RequestId::Int(8),
        "client/unregisterCapability",
        Some(json!({ "unregisterations": [{ "id": "hover-1", "method": "textDocument/hover" }] })),
    ));
    assert_eq!(
        f.session.capabilities().registered("textDocument/hover"),
        CapabilityState::Disabled
    );
}

#[test]
fn unknown_server_request_is_answered_with_method_not_found() {
    let mut f = Fixture::ready(json!({}));
    f.server_says(&Message::request(RequestId::Int(41), "experimental/whatever", None));
    let written = f.peer.take_written();
    let reply = written[0].to_value();
    assert_eq!(reply["id"], 41);
    assert_eq!(reply["error"]["code"], -32601);
}

#[test]
fn adjacent_inserts_coalesce_into_one_change() {
    let mut f = Fixture::ready(json!({ "textDocumentSync": 2 }));
    f.session.open(&doc(), "rust", "").unwrap();
    let _ = f.peer.take_written();

    assert_eq!(f.session.change(&doc(), 0, 0, "ab", f.now).unwrap(), 1);
    assert_eq!(f.session.change(&doc(), 2, 0, "cd", f.now).unwrap(), 2);
    f.session.flush(&doc());

    let written = f.peer.take_written();
    let changes: Vec<Value> = written
        .iter()
        .filter(|m| m.method() == Some("textDocument/didChange"))
        .map(|m| m.to_value()["params"].clone())
        .collect();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0]["textDocument"]["version"], 2);
    assert_eq!(
        changes[0]["contentChanges"],
        json!([{
            "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 0, "character": 0 } },
            "text": "abcd"
        }])
    );
    assert_eq!(f.session.documents().text(&doc()), Some("abcd"));
}

#[test]
fn restart_replays_open_documents_at_version_zero() {
    let mut f = Fixture::ready(json!({ "textDocumentSync": 1 }));
    f.session.open(&doc(), "rust", "fn a() {}").unwrap();
    f.session.change(&doc(), 9, 0, "\n", f.now).unwrap();
    let _ = f.peer.take_written();

    assert!(f.peer.finish(Some("segfault".into())));
    f.pump();
    assert_eq!(f.session.state(), SessionState::Disconnected);
    assert_eq!(f.session.last_error(), Some("segfault"));

    let restart_at = f.session.next_deadline().expect("restart scheduled");
    f.now = restart_at;
    f.session.handle_timers(f.now);
    assert_eq!(f.session.state(), SessionState::Connecting);
    f.handshake(json!({ "textDocumentSync": 1 }));

    let written = f.peer.take_written();
    let open = written
        .iter()
        .find(|m| m.method() == Some("textDocument/didOpen"))
        .expect("document replayed");
    let params = &open.to_value()["params"]["textDocument"];
    assert_eq!(params["version"], 0);
    assert_eq!(params["text"], "fn a() {}\n");
    assert_eq!(f.session.documents().version(&doc()), Some(0));
}

#[test]
fn restart_budget_exhaustion_finishes_once() {
    let mut config = ServerConfig::new("mem-ls", "rust");
    config.session.restart_max_attempts = 2;
    let mut f = Fixture::new(config);
    f.session.start(f.now).unwrap();
    f.pump();

    for attempt in 0..3 {
        assert!(f.peer.finish(Some(format!("crash {attempt}"))));
        f.pump();
        if let Some(at) = f.session.next_deadline() {
            f.now = at;
            f.session.handle_timers(f.now);
            f.pump();
        }
    }
    assert_eq!(f.session.state(), SessionState::Errored);
    assert_eq!(f.peer.starts(), 3);

    let finished: Vec<_> = f
        .events()
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::Finished { .. }))
        .collect();
    assert_eq!(finished.len(), 1);
    assert!(f.session.is_finished());
}

#[test]
fn restart_budget_refills_after_cooldown() {
    let mut config = ServerConfig::new("mem-ls", "rust");
    config.session.restart_max_attempts = 1;
    config.session.restart_cooldown_secs = 60;
    let mut f = Fixture::new(config);
    f.session.start(f.now).unwrap();
    f.pump();

    assert!(f.peer.finish(None));
    f.pump();
    f.now = f.session.next_deadline().unwrap();
    f.session.handle_timers(f.now);
    f.pump();

    f.now += Duration::from_secs(120);
    assert!(f.peer.finish(None));
    f.pump();
    assert_eq!(f.session.state(), SessionState::Disconnected);
    assert!(f.session.next_deadline().is_some());
}

#[test]
fn shutdown_fails_pending_and_exits() {
    let mut f = Fixture::ready(json!({}));
    let outcome = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&outcome);
    f.session
        .request("custom/pending", None, move |r| *slot.lock().unwrap() = Some(r))
        .unwrap();
    let _ = f.peer.take_written();

    f.session.shutdown(f.now).unwrap();
    assert!(matches!(
        outcome.lock().unwrap().take(),
        Some(Err(RequestError::Unreachable { .. }))
    ));
    let shutdown = f.requests();
    assert_eq!(shutdown[0].method, "shutdown");
    f.server_says(&Message::response(shutdown[0].id.clone(), Ok(Value::Null)));
    let written = f.peer.take_written();
    assert_eq!(written[0].method(), Some("exit"));
    assert_eq!(f.session.state(), SessionState::ShutDown);

    f.session.handle_timers(f.now + Duration::from_secs(10));
    assert_eq!(f.session.state(), SessionState::Disconnected);
    assert!(f.events().contains(&SessionEvent::Finished { error: None }));
    assert!(f.session.is_finished());
}

#[test]
fn token_delta_drift_falls_back_to_full_request() {
    let mut f = Fixture::ready(json!({
        "textDocumentSync": 2,
        "semanticTokensProvider": {
            "legend": { "tokenTypes": ["function", "variable"], "tokenModifiers": ["declaration"] },
            "full": { "delta": true }
        }
    }));
    f.session.open(&doc(), "rust", "fn a() {}").unwrap();
    let full = f.requests();
    assert_eq!(full[0].method, "textDocument/semanticTokens/full");
    f.server_says(&Message::response(
        full[0].id.clone(),
        Ok(json!({ "resultId": "r1", "data": [0, 3, 1, 0, 1] })),
    ));
    let tokens = f.session.semantic_tokens().tokens(&doc()).unwrap();
    assert_eq!(tokens[0].type_name.as_deref(), Some("function"));
    assert_eq!(tokens[0].modifier_names, ["declaration"]);

    f.session.change(&doc(), 4, 0, "b", f.now).unwrap();
    f.session.flush(&doc());
    let delta = f.requests();
    assert_eq!(delta[0].method, "textDocument/semanticTokens/full/delta");
    f.server_says(&Message::response(
        delta[0].id.clone(),
        Ok(json!({ "resultId": "r2", "edits": [{ "start": 40, "deleteCount": 1, "data": [] }] })),
    ));
    assert!(f.session.semantic_tokens().cache(&doc()).is_none());

    let reload = f.requests();
    assert_eq!(reload.len(), 1);
    assert_eq!(reload[0].method, "textDocument/semanticTokens/full");
}

#[test]
fn server_refresh_rerequests_tokens() {
    let mut f = Fixture::ready(json!({
        "textDocumentSync": 2,
        "semanticTokensProvider": { "legend": { "tokenTypes": ["type"], "tokenModifiers": [] }, "full": true }
    }));
    f.session.open(&doc(), "rust", "struct S;").unwrap();
    let first = f.requests();
    f.server_says(&Message::response(first[0].id.clone(), Ok(json!({ "data": [0, 7, 1, 0, 0] }))));
    assert!(f.requests().is_empty());

    f.server_says(&Message::request(RequestId::Int(3), "workspace/semanticTokens/refresh", None));
    let again = f.requests();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].method, "textDocument/semanticTokens/full");
}

#[test]
fn documents_opened_before_ready_are_announced_after_handshake() {
    let mut f = Fixture::new(ServerConfig::new("mem-ls", "rust"));
    f.session.open(&doc(), "rust", "x").unwrap();
    f.session.change(&doc(), 1, 0, "y", f.now).unwrap();
    f.session.start(f.now).unwrap();
    f.handshake(json!({ "textDocumentSync": 2 }));

    let methods: Vec<String> = f
        .peer
        .take_written()
        .iter()
        .filter_map(|m| m.method().map(String::from))
        .collect();
    assert_eq!(methods, ["initialized", "textDocument/didOpen"]);
    assert_eq!(f.session.documents().text(&doc()), Some("xy"));
}
