//! Remote procedure calls between participants.
//!
//! Two topic namespaces per header:
//! ```text
//! caller ──► "{header}/{calleeId}/{funcName}"  {sender, callId, args}
//! callee ──► "{header}_return/{callerId}"      {callId, result}
//! ```
//! A call that reaches nobody, or whose return is lost, simply never
//! completes — the pending entry stays until a matching return arrives,
//! and there is no timeout. Callers that stop caring ignore the eventual
//! callback.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::router::TopicRouter;

/// An exposed function: positional JSON arguments in, JSON value out.
/// Failures surface to the remote caller as a `null` result.
pub type RpcHandler = Arc<dyn Fn(&[Value]) -> Result<Value, String> + Send + Sync>;

type ResultCallback = Box<dyn FnOnce(Value) + Send>;

/// Wire body of a call message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallRequest {
    pub sender: String,
    #[serde(rename = "callId")]
    pub call_id: Uuid,
    /// Positional arguments; absent encodes as an empty list.
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Wire body of a return message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReturn {
    #[serde(rename = "callId")]
    pub call_id: Uuid,
    #[serde(default)]
    pub result: Value,
}

/// One participant's RPC identity: its exposed functions and its
/// outstanding calls.
pub struct RpcEndpoint {
    header: String,
    user_id: String,
    return_topic: String,
    router: Arc<TopicRouter>,
    functions: RwLock<HashMap<String, RpcHandler>>,
    pending: Mutex<HashMap<Uuid, ResultCallback>>,
}

impl RpcEndpoint {
    /// Create an endpoint with a generated participant id.
    pub fn new(header: impl Into<String>, router: Arc<TopicRouter>) -> Arc<Self> {
        Self::with_user_id(header, router, Uuid::new_v4().to_string())
    }

    /// Create an endpoint with an explicit participant id.
    pub fn with_user_id(
        header: impl Into<String>,
        router: Arc<TopicRouter>,
        user_id: impl Into<String>,
    ) -> Arc<Self> {
        let header = header.into();
        let user_id = user_id.into();
        let return_topic = format!("{header}_return/{user_id}");

        let endpoint = Arc::new(Self {
            return_topic: return_topic.clone(),
            router: router.clone(),
            functions: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            header: header.clone(),
            user_id: user_id.clone(),
        });

        // Returns and incoming calls arrive under different prefixes, so
        // one classifier is registered under both.
        for identifier in [return_topic, format!("{header}/{user_id}")] {
            let weak = Arc::downgrade(&endpoint);
            router.register(&identifier, move |topic, message| {
                if let Some(endpoint) = weak.upgrade() {
                    endpoint.handle_message(topic, message);
                }
            });
        }

        log::debug!("rpc endpoint ready: user {user_id}");
        endpoint
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Expose `handler` under `name`, replacing any prior handler of the
    /// same name, and subscribe its call topic at the relay.
    pub fn expose(
        &self,
        name: impl Into<String>,
        handler: impl Fn(&[Value]) -> Result<Value, String> + Send + Sync + 'static,
    ) {
        let name = name.into();
        let topic = format!("{}/{}/{}", self.header, self.user_id, name);
        self.functions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, Arc::new(handler));
        self.router.subscribe(&topic);
    }

    /// Invoke `name` on `receiver`. Never blocks: `on_result` fires if and
    /// when a matching return arrives — possibly never. Returns the call
    /// id correlating this invocation.
    pub fn call_function(
        &self,
        receiver: &str,
        name: &str,
        args: Vec<Value>,
        on_result: impl FnOnce(Value) + Send + 'static,
    ) -> Uuid {
        let call_id = Uuid::new_v4();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(call_id, Box::new(on_result));

        let request = CallRequest {
            sender: self.user_id.clone(),
            call_id,
            args,
        };
        let topic = format!("{}/{}/{}", self.header, receiver, name);
        match serde_json::to_string(&request) {
            Ok(encoded) => self.router.publish(&topic, &encoded, false),
            Err(e) => log::warn!("failed to encode call {call_id} to {topic}: {e}"),
        }
        call_id
    }

    fn handle_message(&self, topic: &str, message: &str) {
        if topic == self.return_topic {
            self.handle_return(message);
        } else {
            self.handle_call(topic, message);
        }
    }

    fn handle_return(&self, message: &str) {
        let ret: CallReturn = match serde_json::from_str(message) {
            Ok(ret) => ret,
            Err(e) => {
                log::debug!("dropping malformed return: {e}");
                return;
            }
        };
        let callback = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&ret.call_id);
        match callback {
            Some(callback) => callback(ret.result),
            // Duplicate or late return: already answered, nothing to do.
            None => log::trace!("no pending call {}", ret.call_id),
        }
    }

    fn handle_call(&self, topic: &str, message: &str) {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.len() != 3 || segments[0] != self.header || segments[1] != self.user_id {
            return;
        }
        let request: CallRequest = match serde_json::from_str(message) {
            Ok(request) => request,
            Err(e) => {
                log::debug!("dropping malformed call on {topic}: {e}");
                return;
            }
        };
        if request.sender.is_empty() {
            return;
        }

        let name = segments[2];
        let handler = self
            .functions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();

        let result = match handler {
            None => {
                log::debug!("call for unexposed function {name}");
                Value::Null
            }
            Some(handler) => match catch_unwind(AssertUnwindSafe(|| handler(&request.args))) {
                Ok(Ok(value)) => value,
                Ok(Err(e)) => {
                    log::debug!("function {name} failed: {e}");
                    Value::Null
                }
                Err(_) => {
                    log::warn!("function {name} panicked");
                    Value::Null
                }
            },
        };

        self.send_return(&request.sender, request.call_id, result);
    }

    fn send_return(&self, sender: &str, call_id: Uuid, result: Value) {
        let response = CallReturn { call_id, result };
        let topic = format!("{}_return/{}", self.header, sender);
        match serde_json::to_string(&response) {
            Ok(encoded) => self.router.publish(&topic, &encoded, false),
            Err(e) => log::warn!("failed to encode return {call_id} to {topic}: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixture() -> (Arc<TopicRouter>, Arc<RpcEndpoint>) {
        let router = Arc::new(TopicRouter::new());
        let endpoint = RpcEndpoint::with_user_id("calls", router.clone(), "alice");
        (router, endpoint)
    }

    fn return_payload(call_id: Uuid, result: Value) -> String {
        serde_json::to_string(&CallReturn { call_id, result }).unwrap()
    }

    fn call_payload(sender: &str, call_id: Uuid, args: Value) -> String {
        format!(
            "{{\"sender\":{},\"callId\":{},\"args\":{}}}",
            serde_json::to_string(sender).unwrap(),
            serde_json::to_string(&call_id).unwrap(),
            args
        )
    }

    #[test]
    fn test_generated_user_ids_are_unique() {
        let router = Arc::new(TopicRouter::new());
        let a = RpcEndpoint::new("calls", router.clone());
        let b = RpcEndpoint::new("calls", router.clone());
        assert_ne!(a.user_id(), b.user_id());
    }

    #[test]
    fn test_return_resolves_pending_call() {
        let (router, endpoint) = fixture();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let call_id = endpoint.call_function("bob", "greet", vec![json!("world")], move |result| {
            *s.lock().unwrap() = Some(result);
        });

        router.dispatch(
            "calls_return/alice",
            &return_payload(call_id, json!("hi world")),
        );
        assert_eq!(seen.lock().unwrap().clone(), Some(json!("hi world")));
    }

    #[test]
    fn test_duplicate_return_fires_callback_at_most_once() {
        let (router, endpoint) = fixture();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let call_id = endpoint.call_function("bob", "greet", vec![], move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        let payload = return_payload(call_id, json!(1));
        router.dispatch("calls_return/alice", &payload);
        router.dispatch("calls_return/alice", &payload);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_return_is_a_no_op() {
        let (router, _endpoint) = fixture();
        router.dispatch("calls_return/alice", &return_payload(Uuid::new_v4(), json!(1)));
    }

    #[test]
    fn test_malformed_return_is_dropped() {
        let (router, endpoint) = fixture();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let call_id = endpoint.call_function("bob", "greet", vec![], move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        router.dispatch("calls_return/alice", "{broken");
        router.dispatch("calls_return/alice", "{\"result\":1}");
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // The pending entry is untouched; a proper return still resolves.
        router.dispatch("calls_return/alice", &return_payload(call_id, json!(2)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_incoming_call_invokes_handler_with_args() {
        let (router, endpoint) = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        endpoint.expose("greet", move |args| {
            s.lock().unwrap().extend(args.to_vec());
            Ok(json!("done"))
        });

        router.dispatch(
            "calls/alice/greet",
            &call_payload("bob", Uuid::new_v4(), json!(["world", 2])),
        );
        assert_eq!(*seen.lock().unwrap(), vec![json!("world"), json!(2)]);
    }

    #[test]
    fn test_call_with_missing_args_gets_empty_list() {
        let (router, endpoint) = fixture();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        endpoint.expose("greet", move |args| {
            assert!(args.is_empty());
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });

        let payload = format!(
            "{{\"sender\":\"bob\",\"callId\":\"{}\"}}",
            Uuid::new_v4()
        );
        router.dispatch("calls/alice/greet", &payload);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_missing_sender_or_id_is_dropped() {
        let (router, endpoint) = fixture();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        endpoint.expose("greet", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });

        router.dispatch("calls/alice/greet", "{\"args\":[]}");
        router.dispatch(
            "calls/alice/greet",
            &format!("{{\"callId\":\"{}\",\"args\":[]}}", Uuid::new_v4()),
        );
        router.dispatch("calls/alice/greet", "{\"sender\":\"bob\",\"args\":[]}");
        router.dispatch(
            "calls/alice/greet",
            &format!("{{\"sender\":\"\",\"callId\":\"{}\"}}", Uuid::new_v4()),
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_call_for_other_user_is_ignored() {
        let (router, endpoint) = fixture();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        endpoint.expose("greet", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });

        endpoint.handle_message(
            "calls/carol/greet",
            &call_payload("bob", Uuid::new_v4(), json!([])),
        );
        // Wrong shape: four segments.
        router.dispatch(
            "calls/alice/greet/extra",
            &call_payload("bob", Uuid::new_v4(), json!([])),
        );
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_reexpose_replaces_handler() {
        let (router, endpoint) = fixture();
        let old = Arc::new(AtomicUsize::new(0));
        let new = Arc::new(AtomicUsize::new(0));

        let o = old.clone();
        endpoint.expose("greet", move |_| {
            o.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
        let n = new.clone();
        endpoint.expose("greet", move |_| {
            n.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });

        router.dispatch(
            "calls/alice/greet",
            &call_payload("bob", Uuid::new_v4(), json!([])),
        );
        assert_eq!(old.load(Ordering::SeqCst), 0);
        assert_eq!(new.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panicking_handler_is_contained() {
        let (router, endpoint) = fixture();
        endpoint.expose("explode", |_| panic!("boom"));

        router.dispatch(
            "calls/alice/explode",
            &call_payload("bob", Uuid::new_v4(), json!([])),
        );
        // Still alive and serving.
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        endpoint.expose("ok", move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        });
        router.dispatch(
            "calls/alice/ok",
            &call_payload("bob", Uuid::new_v4(), json!([])),
        );
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_request_wire_field_names() {
        let request = CallRequest {
            sender: "alice".to_string(),
            call_id: Uuid::nil(),
            args: vec![json!(1)],
        };
        let encoded = serde_json::to_value(&request).unwrap();
        assert_eq!(
            encoded,
            json!({
                "sender": "alice",
                "callId": "00000000-0000-0000-0000-000000000000",
                "args": [1],
            })
        );
    }
}
