//! In-flight outgoing requests keyed by correlation id.
//!
//! The registry owns every pending entry. Dropping interest in a request is
//! an explicit [`RequestRegistry::cancel`], never a side effect of a
//! destructor.

use std::collections::HashMap;

use serde_json::Value;

use crate::error::RequestError;
use crate::protocol::{Message, RequestId, ResponseError};

/// Continuation invoked exactly once with the outcome of a request.
pub type ResponseCallback = Box<dyn FnOnce(Result<Value, RequestError>) + Send>;

/// Who receives the response.
///
/// `Internal` requests are answered by the session itself (handshake,
/// shutdown, semantic tokens); the tag says what the session was asking.
pub enum Responder<T> {
    Callback(ResponseCallback),
    Internal(T),
}

impl<T> Responder<T> {
    pub fn callback(f: impl FnOnce(Result<Value, RequestError>) + Send + 'static) -> Self {
        Self::Callback(Box::new(f))
    }
}

struct PendingRequest<T> {
    method: String,
    responder: Responder<T>,
}

/// What happened to an incoming response.
#[derive(Debug)]
pub enum Resolution<T> {
    /// A caller callback consumed it.
    Delivered,
    /// The session has to handle it.
    Internal {
        tag: T,
        method: String,
        outcome: Result<Value, ResponseError>,
    },
    /// No pending request with that id (duplicate, or late after cancel).
    Unknown,
}

pub struct RequestRegistry<T> {
    next_id: i64,
    pending: HashMap<RequestId, PendingRequest<T>>,
}

impl<T> Default for RequestRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestRegistry<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate an id, remember the responder and build the request message.
    ///
    /// Ids come from a counter that is never rewound, so they stay unique
    /// across session restarts.
    pub fn send(
        &mut self,
        method: &str,
        params: Option<Value>,
        responder: Responder<T>,
    ) -> (RequestId, Message) {
        let id = RequestId::Int(self.next_id);
        self.next_id += 1;
        self.pending.insert(
            id.clone(),
            PendingRequest {
                method: method.to_string(),
                responder,
            },
        );
        let message = Message::request(id.clone(), method, params);
        (id, message)
    }

    /// Remove the pending entry for `id` and hand it the outcome.
    pub fn resolve(
        &mut self,
        id: &RequestId,
        outcome: Result<Value, ResponseError>,
    ) -> Resolution<T> {
        let Some(entry) = self.pending.remove(id) else {
            tracing::debug!(%id, "Discarding response for unknown request id");
            return Resolution::Unknown;
        };
        match entry.responder {
            Responder::Callback(callback) => {
                callback(outcome.map_err(RequestError::Server));
                Resolution::Delivered
            }
            Responder::Internal(tag) => Resolution::Internal {
                tag,
                method: entry.method,
                outcome,
            },
        }
    }

    /// Forget `id` locally. Returns whether it was pending.
    ///
    /// The callback is dropped without being invoked; a late response is
    /// discarded by [`Self::resolve`].
    pub fn cancel(&mut self, id: &RequestId) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Resolve every pending request with [`RequestError::Unreachable`].
    ///
    /// Callbacks run in id order; internal entries are dropped. Returns the
    /// number of entries removed.
    pub fn fail_all(&mut self, reason: &str) -> usize {
        let mut drained: Vec<(RequestId, PendingRequest<T>)> = self.pending.drain().collect();
        drained.sort_by(|a, b| a.0.cmp(&b.0));
        let count = drained.len();
        for (id, entry) in drained {
            if let Responder::Callback(callback) = entry.responder {
                tracing::debug!(%id, method = %entry.method, "Failing pending request: {reason}");
                callback(Err(RequestError::unreachable(reason)));
            }
        }
        count
    }

    #[must_use]
    pub fn contains(&self, id: &RequestId) -> bool {
        self.pending.contains_key(id)
    }

    #[must_use]
    pub fn method_of(&self, id: &RequestId) -> Option<&str> {
        self.pending.get(id).map(|p| p.method.as_str())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;

    type Log = Arc<Mutex<Vec<(String, Result<Value, RequestError>)>>>;

    fn recording(log: &Log, label: &str) -> Responder<()> {
        let log = Arc::clone(log);
        let label = label.to_string();
        Responder::callback(move |outcome| log.lock().unwrap().push((label, outcome)))
    }

    #[test]
    fn send_allocates_unique_ids_and_builds_requests() {
        let mut registry = RequestRegistry::<()>::new();
        let (a, msg) = registry.send("textDocument/hover", Some(json!({})), Responder::Internal(()));
        let (b, _) = registry.send("textDocument/hover", None, Responder::Internal(()));
        assert_ne!(a, b);
        assert_eq!(
            msg,
            Message::request(a.clone(), "textDocument/hover", Some(json!({})))
        );
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.method_of(&a), Some("textDocument/hover"));
    }

    #[test]
    fn responses_resolve_in_delivery_order() {
        let log: Log = Arc::default();
        let mut registry = RequestRegistry::<()>::new();
        let (a, _) = registry.send("a", None, recording(&log, "A"));
        let (b, _) = registry.send("b", None, recording(&log, "B"));
        let (c, _) = registry.send("c", None, recording(&log, "C"));

        for (id, value) in [(&c, 3), (&a, 1), (&b, 2)] {
            assert!(matches!(registry.resolve(id, Ok(json!(value))), Resolution::Delivered));
        }

        let log = log.lock().unwrap();
        let order: Vec<&str> = log.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(order, ["C", "A", "B"]);
        assert_eq!(log[0].1, Ok(json!(3)));
        assert_eq!(log[1].1, Ok(json!(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn every_permutation_resolves_each_callback_once() {
        let perms: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for perm in perms {
            let log: Log = Arc::default();
            let mut registry = RequestRegistry::<()>::new();
            let ids: Vec<RequestId> = (0..3)
                .map(|i| registry.send("m", None, recording(&log, &i.to_string())).0)
                .collect();
            for &i in &perm {
                registry.resolve(&ids[i], Ok(json!(i)));
                registry.resolve(&ids[i], Ok(json!("duplicate")));
            }
            let log = log.lock().unwrap();
            assert_eq!(log.len(), 3);
            for (label, outcome) in log.iter() {
                let i: usize = label.parse().unwrap();
                assert_eq!(outcome, &Ok(json!(i)));
            }
        }
    }

    #[test]
    fn server_error_reaches_callback_as_failure() {
        let log: Log = Arc::default();
        let mut registry = RequestRegistry::<()>::new();
        let (id, _) = registry.send("m", None, recording(&log, "x"));
        let error = ResponseError::new(-32600, "invalid request");
        registry.resolve(&id, Err(error.clone()));
        assert_eq!(log.lock().unwrap()[0].1, Err(RequestError::Server(error)));
    }

    #[test]
    fn cancelled_request_never_invokes_callback() {
        let log: Log = Arc::default();
        let mut registry = RequestRegistry::<()>::new();
        let (id, _) = registry.send("m", None, recording(&log, "x"));
        assert!(registry.cancel(&id));
        assert!(!registry.cancel(&id));
        assert!(matches!(registry.resolve(&id, Ok(json!(1))), Resolution::Unknown));
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn internal_requests_are_returned_to_the_session() {
        let mut registry = RequestRegistry::<&'static str>::new();
        let (id, _) = registry.send("initialize", None, Responder::Internal("init"));
        match registry.resolve(&id, Ok(json!({ "capabilities": {} }))) {
            Resolution::Internal { tag, method, outcome } => {
                assert_eq!(tag, "init");
                assert_eq!(method, "initialize");
                assert!(outcome.unwrap()["capabilities"].is_object());
            }
            other => panic!("expected internal resolution, got {other:?}"),
        }
    }

    #[test]
    fn fail_all_resolves_callbacks_with_unreachable() {
        let log: Log = Arc::default();
        let mut registry = RequestRegistry::<()>::new();
        registry.send("a", None, recording(&log, "A"));
        registry.send("b", None, recording(&log, "B"));
        registry.send("shutdown", None, Responder::Internal(()));

        assert_eq!(registry.fail_all("server exited"), 3);
        assert!(registry.is_empty());
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, "A");
        assert!(matches!(&log[0].1, Err(RequestError::Unreachable { reason }) if reason == "server exited"));
        assert!(log[1].1.as_ref().unwrap_err().to_string().contains("server unreachable"));
    }

    #[test]
    fn ids_keep_increasing_after_fail_all() {
        let mut registry = RequestRegistry::<()>::new();
        let (first, _) = registry.send("a", None, Responder::Internal(()));
        registry.fail_all("restart");
        let (second, _) = registry.send("a", None, Responder::Internal(()));
        assert!(second > first);
    }
}
