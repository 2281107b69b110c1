use crate::feed::topic::{InboundRoute, SubscriptionParams, TopicKey};
use crate::feed::types::FeedEvent;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

pub type FeedCallback = Arc<dyn Fn(&FeedEvent) + Send + Sync>;
pub type CallbackId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireOp {
    Subscribe,
    Unsubscribe,
}

impl WireOp {
    pub fn method(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingWire {
    pub op: WireOp,
    pub key: TopicKey,
    pub params: SubscriptionParams,
}

impl PendingWire {
    pub fn to_frame(&self) -> Value {
        json!({
            "method": self.op.method(),
            "subscription": self.params.to_wire_value(),
        })
    }
}

struct SubscriptionEntry {
    params: SubscriptionParams,
    callbacks: Vec<(CallbackId, FeedCallback)>,
}

/// Topic key to callbacks, plus the queue of wire operations not yet sent.
/// Every wire subscribe/unsubscribe goes through here so the reference
/// counts and the server's view never diverge.
pub struct SubscriptionRegistry {
    entries: HashMap<TopicKey, SubscriptionEntry>,
    by_type: HashMap<String, BTreeSet<TopicKey>>,
    pending: VecDeque<PendingWire>,
    max_topics: usize,
    next_callback_id: CallbackId,
}

impl SubscriptionRegistry {
    pub fn new(max_topics: usize) -> Self {
        Self {
            entries: HashMap::new(),
            by_type: HashMap::new(),
            pending: VecDeque::new(),
            max_topics,
            next_callback_id: 1,
        }
    }

    /// Registers `callback` under the key derived from `params`. Returns
    /// `None` when a new topic would exceed the topic ceiling.
    pub fn subscribe(
        &mut self,
        params: SubscriptionParams,
        callback: FeedCallback,
    ) -> Option<(TopicKey, CallbackId)> {
        let key = params.topic_key();
        let id = self.next_callback_id;

        if let Some(entry) = self.entries.get_mut(&key) {
            self.next_callback_id += 1;
            entry.callbacks.push((id, callback));
            debug!(%key, ref_count = entry.callbacks.len(), "joined existing subscription");
            return Some((key, id));
        }

        if self.entries.len() >= self.max_topics {
            warn!(
                %key,
                max_topics = self.max_topics,
                "subscription ceiling reached, ignoring subscribe"
            );
            return None;
        }

        self.next_callback_id += 1;
        self.by_type
            .entry(params.topic_type.clone())
            .or_default()
            .insert(key.clone());
        self.enqueue(WireOp::Subscribe, key.clone(), params.clone());
        self.entries.insert(
            key.clone(),
            SubscriptionEntry {
                params,
                callbacks: vec![(id, callback)],
            },
        );
        debug!(%key, "created subscription");
        Some((key, id))
    }

    /// Removes one callback. Returns true when it was the last one and the
    /// topic was released.
    pub fn unsubscribe(&mut self, key: &TopicKey, id: CallbackId) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let before = entry.callbacks.len();
        entry.callbacks.retain(|(callback_id, _)| *callback_id != id);
        if entry.callbacks.len() == before {
            return false;
        }
        if !entry.callbacks.is_empty() {
            debug!(%key, ref_count = entry.callbacks.len(), "left shared subscription");
            return false;
        }

        let Some(entry) = self.entries.remove(key) else {
            return false;
        };
        if let Some(keys) = self.by_type.get_mut(&entry.params.topic_type) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_type.remove(&entry.params.topic_type);
            }
        }
        self.enqueue(WireOp::Unsubscribe, key.clone(), entry.params);
        debug!(%key, "released subscription");
        true
    }

    fn enqueue(&mut self, op: WireOp, key: TopicKey, params: SubscriptionParams) {
        if let Some(index) = self.pending.iter().position(|pending| pending.key == key) {
            if self.pending[index].op == op {
                debug!(%key, ?op, "wire operation already queued");
                return;
            }
            // The opposite operation has not reached the server yet, so both cancel out.
            self.pending.remove(index);
            debug!(%key, ?op, "cancelled queued opposite wire operation");
            return;
        }
        self.pending.push_back(PendingWire { op, key, params });
    }

    /// Queues a fresh subscribe for every active topic, discarding whatever
    /// was pending for the previous connection.
    pub fn replay(&mut self) -> Vec<TopicKey> {
        self.pending.clear();
        let mut keys = self.entries.keys().cloned().collect::<Vec<_>>();
        keys.sort();
        for key in &keys {
            if let Some(entry) = self.entries.get(key) {
                self.pending.push_back(PendingWire {
                    op: WireOp::Subscribe,
                    key: key.clone(),
                    params: entry.params.clone(),
                });
            }
        }
        keys
    }

    pub fn clear_pending(&mut self) {
        self.pending.clear();
    }

    pub fn peek_pending(&self) -> Option<&PendingWire> {
        self.pending.front()
    }

    pub fn pop_pending(&mut self) -> Option<PendingWire> {
        self.pending.pop_front()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn callbacks_for_route(&self, route: &InboundRoute) -> Vec<FeedCallback> {
        let Some(keys) = self.by_type.get(&route.topic_type) else {
            return Vec::new();
        };
        keys.iter()
            .filter_map(|key| self.entries.get(key))
            .filter(|entry| entry.params.matches_route(route))
            .flat_map(|entry| entry.callbacks.iter().map(|(_, callback)| callback.clone()))
            .collect()
    }

    pub fn callbacks_for_key(&self, key: &TopicKey) -> Vec<FeedCallback> {
        self.entries
            .get(key)
            .map(|entry| {
                entry
                    .callbacks
                    .iter()
                    .map(|(_, callback)| callback.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn ref_count(&self, key: &TopicKey) -> usize {
        self.entries
            .get(key)
            .map_or(0, |entry| entry.callbacks.len())
    }

    pub fn contains(&self, key: &TopicKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Handle returned by `subscribe`. Calling it more than once is a no-op.
pub struct Unsubscribe {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Unsubscribe {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    pub fn noop() -> Self {
        Self {
            action: Mutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.action.lock().is_some()
    }

    pub fn call(&self) {
        let action = self.action.lock().take();
        if let Some(action) = action {
            action();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.is_active())
            .finish()
    }
}
