//! Per-node change subscriptions.
//!
//! Observers are keyed by node id and called synchronously once per
//! committed batch with the events relevant to them. Deep observers also
//! hear about changes anywhere below their node.

use std::collections::HashMap;

use crate::ids::NodeId;

/// A change to one node, delivered after a batch commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEvent {
    pub node: NodeId,
    /// The node itself was removed in this batch.
    pub removed: bool,
}

pub type Callback = Box<dyn FnMut(&[StorageEvent]) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscriber {
    id: SubscriptionId,
    deep: bool,
    callback: Callback,
}

/// Observer list keyed by node id.
#[derive(Default)]
pub struct Observers {
    by_node: HashMap<NodeId, Vec<Subscriber>>,
    next_id: u64,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, node: NodeId, deep: bool, callback: Callback) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.by_node.entry(node).or_default().push(Subscriber { id, deep, callback });
        id
    }

    /// Remove a subscription and hand its callback back to the caller.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<Callback> {
        let mut found = None;
        let mut emptied = None;
        for (node, subs) in self.by_node.iter_mut() {
            if let Some(idx) = subs.iter().position(|s| s.id == id) {
                found = Some(subs.remove(idx).callback);
                if subs.is_empty() {
                    emptied = Some(*node);
                }
                break;
            }
        }
        if let Some(node) = emptied {
            self.by_node.remove(&node);
        }
        found
    }

    pub fn len(&self) -> usize {
        self.by_node.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_node.is_empty()
    }

    /// Deliver `events`. `ancestors(node)` yields the chain of parents of a
    /// node, nearest first, so deep subscribers above it can be found.
    pub fn notify<F>(&mut self, events: &[StorageEvent], ancestors: F)
    where
        F: Fn(NodeId) -> Vec<NodeId>,
    {
        if events.is_empty() || self.by_node.is_empty() {
            return;
        }

        let mut per_sub: HashMap<SubscriptionId, Vec<StorageEvent>> = HashMap::new();
        for event in events {
            if let Some(subs) = self.by_node.get(&event.node) {
                for sub in subs {
                    per_sub.entry(sub.id).or_default().push(*event);
                }
            }
            for ancestor in ancestors(event.node) {
                if let Some(subs) = self.by_node.get(&ancestor) {
                    for sub in subs.iter().filter(|s| s.deep) {
                        per_sub.entry(sub.id).or_default().push(*event);
                    }
                }
            }
        }

        for subs in self.by_node.values_mut() {
            for sub in subs.iter_mut() {
                if let Some(batch) = per_sub.get(&sub.id) {
                    (sub.callback)(batch);
                }
            }
        }
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("subscriptions", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::ClientId;
    use std::sync::{Arc, Mutex};

    fn counter() -> (Arc<Mutex<usize>>, Callback) {
        let hits = Arc::new(Mutex::new(0));
        let h = hits.clone();
        (hits, Box::new(move |events: &[StorageEvent]| {
            *h.lock().unwrap() += events.len();
        }))
    }

    #[test]
    fn test_shallow_subscriber_ignores_descendants() {
        let parent = NodeId::new(ClientId(1), 1);
        let child = NodeId::new(ClientId(1), 2);
        let mut observers = Observers::new();
        let (hits, cb) = counter();
        observers.subscribe(parent, false, cb);

        observers.notify(&[StorageEvent { node: child, removed: false }], |_| vec![parent]);
        assert_eq!(*hits.lock().unwrap(), 0);

        observers.notify(&[StorageEvent { node: parent, removed: false }], |_| vec![]);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_deep_subscriber_hears_descendants() {
        let parent = NodeId::new(ClientId(1), 1);
        let child = NodeId::new(ClientId(1), 2);
        let mut observers = Observers::new();
        let (hits, cb) = counter();
        observers.subscribe(parent, true, cb);

        observers.notify(&[StorageEvent { node: child, removed: true }], |_| vec![parent]);
        assert_eq!(*hits.lock().unwrap(), 1);
    }

    #[test]
    fn test_unsubscribe_returns_callback() {
        let node = NodeId::ROOT;
        let mut observers = Observers::new();
        let (hits, cb) = counter();
        let id = observers.subscribe(node, false, cb);
        assert_eq!(observers.len(), 1);

        let mut callback = observers.unsubscribe(id).expect("callback returned");
        assert!(observers.is_empty());
        assert!(observers.unsubscribe(id).is_none());

        // the returned slot is still usable by its owner
        callback(&[StorageEvent { node, removed: false }]);
        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
