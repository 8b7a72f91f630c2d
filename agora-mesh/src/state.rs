//! Replicated JSON state, synchronized by path-addressed patches.
//!
//! One [`StateSync`] maintains one document under one topic header:
//! ```text
//! topic "room"          payload {"lights":{"on":true}}   full replace
//! topic "room/lights"   payload {"on":false}             splice at ["lights"]
//! topic "room/lights/on" payload null                    delete the leaf
//! ```
//! Patches apply in arrival order at each participant independently —
//! last-writer-wins per leaf, and racing writers may leave replicas
//! disagreeing. There is no acknowledgement and no merge.
//!
//! The document is copy-on-write: each applied patch installs a freshly
//! assembled tree behind an `Arc`, so a snapshot handed out earlier is
//! never mutated underneath its holder.

use std::sync::{Arc, PoisonError, RwLock};

use serde_json::{Map, Value};

use crate::router::TopicRouter;

/// Observer invoked with each newly installed document snapshot.
pub type ChangeCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// JSON values that request a delete when patched onto a leaf.
fn is_falsy(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

/// Descend `path`, forcing every traversed slot to an object, and set or
/// delete the final key.
fn splice_into(map: &mut Map<String, Value>, path: &[&str], leaf: Value) {
    match path {
        [] => {}
        [last] => {
            if is_falsy(&leaf) {
                map.remove(*last);
            } else {
                map.insert((*last).to_string(), leaf);
            }
        }
        [head, rest @ ..] => {
            let child = map
                .entry((*head).to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                // A non-object in the way of the path is discarded; the
                // path wins over whatever was stored there.
                *child = Value::Object(Map::new());
            }
            if let Value::Object(child_map) = child {
                splice_into(child_map, rest, leaf);
            }
        }
    }
}

/// Build the successor document for one patch. The current document is
/// read, never written; a non-object document is abandoned for `{}` since
/// a patch path implies an object shape.
fn splice(current: &Value, path: &[&str], leaf: Value) -> Value {
    let mut root = match current {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    splice_into(&mut root, path, leaf);
    Value::Object(root)
}

/// One replicated document under one topic header.
pub struct StateSync {
    header: String,
    router: Arc<TopicRouter>,
    doc: RwLock<Arc<Value>>,
    observers: RwLock<Vec<ChangeCallback>>,
}

impl StateSync {
    /// Create a synchronizer for `header` and register it with the router.
    /// The document starts as `{}`. An empty header yields an inert
    /// synchronizer that neither receives nor publishes.
    pub fn new(header: impl Into<String>, router: Arc<TopicRouter>) -> Arc<Self> {
        let header = header.into();
        let sync = Arc::new(Self {
            header: header.clone(),
            router: router.clone(),
            doc: RwLock::new(Arc::new(Value::Object(Map::new()))),
            observers: RwLock::new(Vec::new()),
        });

        if !header.is_empty() {
            let weak = Arc::downgrade(&sync);
            router.register(&header, move |topic, message| {
                if let Some(sync) = weak.upgrade() {
                    sync.handle_message(topic, message);
                }
            });
        }

        sync
    }

    pub fn header(&self) -> &str {
        &self.header
    }

    /// Current snapshot. Later patches never mutate it.
    pub fn document(&self) -> Arc<Value> {
        self.doc
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Observe installed snapshots (fires after each applied patch).
    pub fn on_change(&self, observer: impl Fn(&Value) + Send + Sync + 'static) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    /// Publish a patch for `path` (empty path replaces the whole document).
    ///
    /// Falsy values encode as-is so every receiver — this participant
    /// included, once the relay echoes the patch back — executes a delete.
    /// The local document is not updated here; it changes when the echo
    /// arrives, keeping all replicas on the same arrival-order rule.
    pub fn update(&self, path: &str, value: &Value) {
        if self.header.is_empty() {
            return;
        }
        let trimmed = path.trim_start_matches('/');
        let topic = if trimmed.is_empty() {
            self.header.clone()
        } else {
            format!("{}/{}", self.header, trimmed)
        };
        match serde_json::to_string(value) {
            Ok(encoded) => self.router.publish(&topic, &encoded, false),
            Err(e) => log::warn!("failed to encode state update for {topic}: {e}"),
        }
    }

    fn handle_message(&self, topic: &str, message: &str) {
        let segments: Vec<&str> = topic.split('/').collect();
        if segments.first() != Some(&self.header.as_str()) {
            return;
        }

        if segments.len() == 1 {
            // Full replace. An undecodable document resets to empty.
            let new_doc = serde_json::from_str(message)
                .unwrap_or_else(|_| Value::Object(Map::new()));
            self.install(new_doc);
            return;
        }

        let leaf = match serde_json::from_str::<Value>(message) {
            Ok(value) => value,
            Err(e) => {
                log::debug!("ignoring malformed patch on {topic}: {e}");
                return;
            }
        };
        let new_doc = splice(&self.document(), &segments[1..], leaf);
        self.install(new_doc);
    }

    fn install(&self, new_doc: Value) {
        let snapshot = Arc::new(new_doc);
        {
            let mut doc = self.doc.write().unwrap_or_else(PoisonError::into_inner);
            *doc = snapshot.clone();
        }
        let observers: Vec<ChangeCallback> = self
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(&snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fixture() -> (Arc<TopicRouter>, Arc<StateSync>) {
        let router = Arc::new(TopicRouter::new());
        let sync = StateSync::new("room", router.clone());
        (router, sync)
    }

    #[test]
    fn test_document_starts_empty() {
        let (_router, sync) = fixture();
        assert_eq!(*sync.document(), json!({}));
    }

    #[test]
    fn test_full_replace_discards_prior_keys() {
        let (router, sync) = fixture();
        router.dispatch("room", "{\"a\":1,\"b\":2}");
        router.dispatch("room", "{\"x\":1}");
        assert_eq!(*sync.document(), json!({"x": 1}));
    }

    #[test]
    fn test_full_replace_invalid_json_resets() {
        let (router, sync) = fixture();
        router.dispatch("room", "{\"a\":1}");
        router.dispatch("room", "not json");
        assert_eq!(*sync.document(), json!({}));
    }

    #[test]
    fn test_patch_creates_intermediate_objects() {
        let (router, sync) = fixture();
        router.dispatch("room/a/b/c", "42");
        assert_eq!(*sync.document(), json!({"a": {"b": {"c": 42}}}));
    }

    #[test]
    fn test_patch_last_write_wins_per_leaf() {
        let (router, sync) = fixture();
        router.dispatch("room/a/b", "1");
        router.dispatch("room/a/b", "2");
        assert_eq!(*sync.document(), json!({"a": {"b": 2}}));
    }

    #[test]
    fn test_null_patch_deletes_leaf() {
        let (router, sync) = fixture();
        router.dispatch("room/a/b", "1");
        router.dispatch("room/a/b", "null");
        assert_eq!(*sync.document(), json!({"a": {}}));
    }

    #[test]
    fn test_falsy_patches_delete() {
        let (router, sync) = fixture();
        for falsy in ["false", "0", "\"\""] {
            router.dispatch("room/a", "1");
            router.dispatch("room/a", falsy);
            assert_eq!(*sync.document(), json!({}), "payload {falsy} must delete");
        }
    }

    #[test]
    fn test_truthy_zero_like_values_are_kept() {
        let (router, sync) = fixture();
        router.dispatch("room/a", "[]");
        router.dispatch("room/b", "{}");
        assert_eq!(*sync.document(), json!({"a": [], "b": {}}));
    }

    #[test]
    fn test_malformed_patch_is_a_no_op() {
        let (router, sync) = fixture();
        router.dispatch("room/a", "1");
        router.dispatch("room/a", "{broken");
        assert_eq!(*sync.document(), json!({"a": 1}));
    }

    #[test]
    fn test_patch_over_scalar_document_restarts_from_object() {
        let (router, sync) = fixture();
        router.dispatch("room", "5");
        assert_eq!(*sync.document(), json!(5));
        router.dispatch("room/a", "1");
        assert_eq!(*sync.document(), json!({"a": 1}));
    }

    #[test]
    fn test_path_wins_over_scalar_in_the_way() {
        let (router, sync) = fixture();
        router.dispatch("room/a", "5");
        router.dispatch("room/a/b", "1");
        assert_eq!(*sync.document(), json!({"a": {"b": 1}}));
    }

    #[test]
    fn test_path_wins_over_array_in_the_way() {
        let (router, sync) = fixture();
        router.dispatch("room/a", "[1,2,3]");
        router.dispatch("room/a/b", "true");
        assert_eq!(*sync.document(), json!({"a": {"b": true}}));
    }

    #[test]
    fn test_snapshots_are_stable() {
        let (router, sync) = fixture();
        router.dispatch("room/a", "1");
        let before = sync.document();
        router.dispatch("room/a", "2");
        assert_eq!(*before, json!({"a": 1}));
        assert_eq!(*sync.document(), json!({"a": 2}));
    }

    #[test]
    fn test_observers_see_each_install() {
        let (router, sync) = fixture();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        sync.on_change(move |doc| {
            assert!(doc.is_object());
            c.fetch_add(1, Ordering::SeqCst);
        });

        router.dispatch("room/a", "1");
        router.dispatch("room/b", "2");
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_update_while_disconnected_is_silent() {
        let (_router, sync) = fixture();
        sync.update("a/b", &json!(1));
        sync.update("", &json!({"whole": "doc"}));
        // Nothing echoes back without a relay; the document stays put.
        assert_eq!(*sync.document(), json!({}));
    }

    #[test]
    fn test_unrelated_topic_is_ignored() {
        let (router, sync) = fixture();
        // Defensive check inside the synchronizer, beyond router matching.
        sync.handle_message("hall/a", "1");
        router.dispatch("room/a", "1");
        assert_eq!(*sync.document(), json!({"a": 1}));
    }

    #[test]
    fn test_empty_header_is_inert() {
        let router = Arc::new(TopicRouter::new());
        let sync = StateSync::new("", router.clone());
        sync.update("a", &json!(1));
        assert_eq!(*sync.document(), json!({}));
    }

    #[test]
    fn test_splice_deep_delete_keeps_siblings() {
        let (router, sync) = fixture();
        router.dispatch("room/a/x", "1");
        router.dispatch("room/a/y", "2");
        router.dispatch("room/a/x", "null");
        assert_eq!(*sync.document(), json!({"a": {"y": 2}}));
    }
}
