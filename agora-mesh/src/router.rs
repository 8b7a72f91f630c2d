//! Topic-based fan-out of inbound deliveries.
//!
//! Every decoded (topic, message) pair coming off the link is evaluated
//! against every registered filter and handed to each match:
//! ```text
//! BrokerLink ──deliver──► TopicRouter ──┬──► filter "room"        (state)
//!                                       ├──► filter "calls/alice" (rpc)
//!                                       └──► filter "calls_return/alice"
//! ```
//! A filter identifier matches a topic when each of its `/`-segments equals
//! the corresponding leading topic segment — segment equality, not
//! substring: `"ab"` does not match `"abc/x"`. Transport-level filtering
//! (`identifier/#` subscriptions at the relay) and in-process matching are
//! redundant by design so the relay never delivers traffic nothing wants.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use crate::transport::{
    BrokerConfig, BrokerLink, ConnectionState, DeliveryCallback, StateCallback,
};

/// Callback invoked with (topic, message) for each matching delivery.
pub type TopicCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// True when every segment of `identifier` equals the corresponding
/// leading segment of `topic`. The topic may continue past the identifier.
pub fn filter_matches(identifier: &str, topic: &str) -> bool {
    let mut topic_segs = topic.split('/');
    for id_seg in identifier.split('/') {
        match topic_segs.next() {
            Some(seg) if seg == id_seg => {}
            _ => return false,
        }
    }
    true
}

/// Identifier → callback. Registration is a mapping, not a sequence:
/// re-registering replaces, and dispatch order is unspecified.
struct FilterTable {
    inner: RwLock<HashMap<String, TopicCallback>>,
}

impl FilterTable {
    fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    fn insert(&self, identifier: String, callback: TopicCallback) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(identifier, callback);
    }

    fn remove(&self, identifier: &str) -> bool {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(identifier)
            .is_some()
    }

    fn clear(&self) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn identifiers(&self) -> Vec<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Fan a delivery out to every matching callback.
    ///
    /// Matches are snapshotted before any callback runs, so a callback may
    /// re-enter the table (register, unregister) without deadlocking.
    /// Panics are contained per callback.
    fn dispatch(&self, topic: &str, message: &str) {
        let matched: Vec<(String, TopicCallback)> = {
            let table = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            table
                .iter()
                .filter(|(id, _)| filter_matches(id, topic))
                .map(|(id, cb)| (id.clone(), cb.clone()))
                .collect()
        };

        for (identifier, callback) in matched {
            if catch_unwind(AssertUnwindSafe(|| callback(topic, message))).is_err() {
                log::warn!("callback for filter {identifier} panicked on topic {topic}");
            }
        }
    }
}

/// The sole fan-out point between the link and everything above it.
///
/// Owns the [`BrokerLink`]; components publish through the router and
/// receive through registered filters. Registrations survive
/// reconfiguration — their transport subscriptions are replayed on every
/// Connected/Reconnected transition — and are cleared by [`disconnect`].
///
/// [`disconnect`]: TopicRouter::disconnect
pub struct TopicRouter {
    link: Arc<BrokerLink>,
    filters: Arc<FilterTable>,
    observers: Arc<RwLock<Vec<StateCallback>>>,
}

impl Default for TopicRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicRouter {
    pub fn new() -> Self {
        Self {
            link: Arc::new(BrokerLink::new()),
            filters: Arc::new(FilterTable::new()),
            observers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Point the router at a relay. Wires the link's delivery stream into
    /// the dispatch path; see [`BrokerLink::connect`] for teardown and
    /// idempotence behavior. Must be called from within a tokio runtime.
    pub fn configure(&self, config: BrokerConfig) {
        let resub_link = Arc::downgrade(&self.link);
        let resub_filters = self.filters.clone();
        let observers = self.observers.clone();
        let on_state: StateCallback = Arc::new(move |state| {
            if matches!(
                state,
                ConnectionState::Connected | ConnectionState::Reconnected
            ) {
                if let Some(link) = resub_link.upgrade() {
                    for id in resub_filters.identifiers() {
                        link.subscribe(&format!("{id}/#"));
                    }
                }
            }
            let snapshot: Vec<StateCallback> = observers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for observer in snapshot {
                observer(state);
            }
        });

        let dispatch_filters = self.filters.clone();
        let on_delivery: DeliveryCallback =
            Arc::new(move |topic, message| dispatch_filters.dispatch(topic, message));

        self.link.connect(config, on_state, on_delivery);
    }

    /// Register `callback` under `identifier`, replacing any prior
    /// registration (the replaced callback never fires again), and
    /// subscribe `identifier/#` at the relay.
    pub fn register(
        &self,
        identifier: &str,
        callback: impl Fn(&str, &str) + Send + Sync + 'static,
    ) {
        self.filters
            .insert(identifier.to_string(), Arc::new(callback));
        self.link.subscribe(&format!("{identifier}/#"));
    }

    /// Remove a registration and its relay subscription.
    pub fn unregister(&self, identifier: &str) {
        if self.filters.remove(identifier) {
            self.link.unsubscribe(&format!("{identifier}/#"));
        }
    }

    /// Fan a delivery out to all matching filters. The link calls this for
    /// every inbound message; tests may inject deliveries directly.
    pub fn dispatch(&self, topic: &str, message: &str) {
        self.filters.dispatch(topic, message);
    }

    /// Publish through the link (fire-and-forget, see [`BrokerLink::publish`]).
    pub fn publish(&self, topic: &str, payload: &str, retain: bool) {
        self.link.publish(topic, payload, retain);
    }

    /// Add a transport-level subscription without a router filter.
    pub fn subscribe(&self, filter: &str) {
        self.link.subscribe(filter);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.link.state()
    }

    /// Observe connection-state transitions (advisory, fired after any
    /// subscription replay so re-issued publishes see a live link).
    pub fn on_connection_change(&self, observer: impl Fn(ConnectionState) + Send + Sync + 'static) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    /// Disconnect the link and drop every registration.
    pub fn disconnect(&self) {
        self.link.disconnect();
        self.filters.clear();
    }
}
