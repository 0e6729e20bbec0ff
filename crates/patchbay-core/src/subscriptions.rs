//! Local fan-out for server-side monitor subscriptions.
//!
//! Many widgets may observe the same backend value, but the server should
//! see exactly one subscription per distinct key. The wire subscribe goes
//! out for the first local subscriber on a key; the wire unsubscribe goes
//! out once the last one leaves.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use crate::observable::SubscriptionId;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub(crate) struct FanoutTable<K, T> {
    entries: HashMap<K, Vec<(SubscriptionId, Callback<T>)>>,
    index: HashMap<SubscriptionId, K>,
}

impl<K: Eq + Hash + Clone, T> FanoutTable<K, T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            index: HashMap::new(),
        }
    }

    /// Register a local subscriber. Returns the removal token and whether
    /// this key had no subscribers before (meaning the wire subscription
    /// must now be issued).
    pub fn add(&mut self, key: K, callback: Callback<T>) -> (SubscriptionId, bool) {
        let id = SubscriptionId::next();
        self.index.insert(id, key.clone());
        let subscribers = self.entries.entry(key).or_default();
        let first = subscribers.is_empty();
        subscribers.push((id, callback));
        (id, first)
    }

    /// Remove a local subscriber. Returns the key when the removed
    /// subscriber was the last one for it (meaning the wire unsubscribe
    /// must now be issued).
    pub fn remove(&mut self, id: SubscriptionId) -> Option<K> {
        let key = self.index.remove(&id)?;
        let subscribers = self.entries.get_mut(&key)?;
        subscribers.retain(|(subscriber_id, _)| *subscriber_id != id);
        if subscribers.is_empty() {
            self.entries.remove(&key);
            Some(key)
        } else {
            None
        }
    }

    /// Callbacks currently registered on a key. The caller clones them
    /// out, releases the table lock, and only then fires, so a callback
    /// may (un)subscribe reentrantly.
    pub fn snapshot(&self, key: &K) -> Vec<Callback<T>> {
        match self.entries.get(key) {
            Some(subscribers) => subscribers
                .iter()
                .map(|(_, callback)| callback.clone())
                .collect(),
            None => Vec::new(),
        }
    }

    /// Keys with at least one local subscriber; used to re-issue the wire
    /// subscriptions after a reconnect.
    pub fn keys(&self) -> Vec<K> {
        self.entries.keys().cloned().collect()
    }
}
