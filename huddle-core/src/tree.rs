//! The CRDT storage tree.
//!
//! Nodes live in an arena keyed by [`NodeId`]; parent/child links are ids.
//! Conflict rules:
//!
//! - Object/Map fields: last writer wins by [`Stamp`] (clock, then client).
//!   Deletions leave a stamped marker so older writes stay dead.
//! - List children: ordered by `(position, id)`, so concurrent inserts at
//!   the same spot order the same way everywhere. Removal always wins; a
//!   move is last-writer-wins on the child's position stamp.
//! - Removed nodes are tombstoned with the removal clock and purged by
//!   [`StorageTree::collect_garbage`] once every client is past that clock.
//!
//! `apply` validates before it mutates, so a rejected op leaves the tree
//! untouched.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::error::{Conflict, ConflictReason, SnapshotError};
use crate::ids::{ClientId, NodeId, Stamp};
use crate::node::{Field, NodeKind, ParentKey, Slot, StorageNode};
use crate::observer::{Callback, Observers, StorageEvent, SubscriptionId};
use crate::op::{NewValue, NodeData, NodeInit, OpDraft, OpKind, Operation};
use crate::position::Position;
use crate::snapshot::{Snapshot, StorageSnapshot};
use crate::value::Value;

/// Outcome of a successfully applied op.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Applied {
    /// Drafts that undo this op, in the order they must be applied.
    pub reverse: Vec<OpDraft>,
    /// Nodes whose visible content changed.
    pub events: Vec<StorageEvent>,
}

impl Applied {
    /// The op was valid but lost a last-writer-wins comparison.
    pub fn is_noop(&self) -> bool {
        self.reverse.is_empty() && self.events.is_empty()
    }
}

pub struct StorageTree {
    nodes: HashMap<NodeId, StorageNode>,
    clock: u64,
    observers: Observers,
}

impl Default for StorageTree {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageTree {
    /// A tree holding only an empty root object.
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(NodeId::ROOT, StorageNode::root());
        Self {
            nodes,
            clock: 0,
            observers: Observers::new(),
        }
    }

    /// Rebuild a tree from a persisted or received dump.
    pub fn from_snapshot(snapshot: StorageSnapshot) -> Result<Self, SnapshotError> {
        let mut nodes = HashMap::with_capacity(snapshot.nodes.len());
        for node in snapshot.nodes {
            let id = node.id;
            if nodes.insert(id, node).is_some() {
                return Err(SnapshotError::DuplicateNode(id));
            }
        }
        match nodes.get(&NodeId::ROOT) {
            Some(root) if matches!(root.kind, NodeKind::Object { .. }) => {}
            _ => return Err(SnapshotError::MissingRoot),
        }
        for node in nodes.values() {
            if let Some(parent) = node.parent {
                if !node.is_tombstoned() && !nodes.contains_key(&parent) {
                    return Err(SnapshotError::DanglingParent(node.id, parent));
                }
            }
        }
        Ok(Self {
            nodes,
            clock: snapshot.clock,
            observers: Observers::new(),
        })
    }

    /// Serializable dump of every node, tombstones included.
    pub fn to_storage_snapshot(&self) -> StorageSnapshot {
        let mut nodes: Vec<StorageNode> = self.nodes.values().cloned().collect();
        nodes.sort_by_key(|n| n.id);
        StorageSnapshot {
            clock: self.clock,
            max_client: self.max_client(),
            nodes,
        }
    }

    /// Copy of the data without subscriptions.
    pub fn fork(&self) -> Self {
        Self {
            nodes: self.nodes.clone(),
            clock: self.clock,
            observers: Observers::new(),
        }
    }

    /// Replace the data with a copy of `other`, keeping our subscriptions.
    pub fn reset_from(&mut self, other: &StorageTree) {
        self.nodes = other.nodes.clone();
        self.clock = other.clock;
    }

    // ─── Queries ─────────────────────────────────────────────────────

    /// Highest clock applied so far.
    pub fn clock(&self) -> u64 {
        self.clock
    }

    pub fn get(&self, id: NodeId) -> Option<&StorageNode> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Live (not tombstoned) node.
    pub fn is_live(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(|n| !n.is_tombstoned())
    }

    pub fn is_tombstoned(&self, id: NodeId) -> bool {
        self.nodes.get(&id).is_some_and(StorageNode::is_tombstoned)
    }

    pub fn kind_of(&self, id: NodeId) -> Option<&'static str> {
        self.nodes.get(&id).map(|n| n.kind.name())
    }

    pub fn parent_of(&self, id: NodeId) -> Option<NodeId> {
        self.nodes.get(&id).and_then(|n| n.parent)
    }

    /// Parents of `id`, nearest first.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        ancestors_in(&self.nodes, id)
    }

    /// Number of nodes in the arena, tombstones included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Highest client id found among node ids.
    pub fn max_client(&self) -> ClientId {
        self.nodes
            .keys()
            .map(|id| id.client)
            .max()
            .unwrap_or(ClientId::SERVER)
    }

    pub fn tombstone_count(&self) -> usize {
        self.nodes.values().filter(|n| n.is_tombstoned()).count()
    }

    /// Current content of an Object/Map field.
    pub fn field(&self, id: NodeId, key: &str) -> Option<&Slot> {
        self.nodes
            .get(&id)
            .and_then(|n| n.kind.fields())
            .and_then(|fields| fields.get(key))
            .and_then(|f| f.slot.as_ref())
    }

    /// Live children of a list, in order.
    pub fn list_children(&self, id: NodeId) -> &[NodeId] {
        match self.nodes.get(&id).map(|n| &n.kind) {
            Some(NodeKind::List { children }) => children,
            _ => &[],
        }
    }

    pub fn list_len(&self, id: NodeId) -> usize {
        self.list_children(id).len()
    }

    pub fn list_child_at(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.list_children(id).get(index).copied()
    }

    /// Position of the child at `index` of a list.
    pub fn list_position_at(&self, id: NodeId, index: usize) -> Option<&Position> {
        self.list_child_at(id, index)
            .and_then(|child| self.nodes.get(&child))
            .and_then(StorageNode::position)
    }

    /// Read-only view of the whole live tree.
    pub fn snapshot(&self) -> Snapshot {
        self.render(NodeId::ROOT)
            .unwrap_or_else(|| Snapshot::Object(BTreeMap::new()))
    }

    /// Read-only view of one live subtree.
    pub fn render(&self, id: NodeId) -> Option<Snapshot> {
        let node = self.nodes.get(&id)?;
        if node.is_tombstoned() {
            return None;
        }
        let render_fields = |fields: &BTreeMap<String, Field>| -> BTreeMap<String, Snapshot> {
            fields
                .iter()
                .filter_map(|(k, f)| {
                    let view = match f.slot.as_ref()? {
                        Slot::Scalar(v) => Snapshot::Scalar(v.clone()),
                        Slot::Node(child) => self.render(*child)?,
                    };
                    Some((k.clone(), view))
                })
                .collect()
        };
        Some(match &node.kind {
            NodeKind::Object { fields } => Snapshot::Object(render_fields(fields)),
            NodeKind::Map { entries } => Snapshot::Map(render_fields(entries)),
            NodeKind::List { children } => {
                Snapshot::List(children.iter().filter_map(|c| self.render(*c)).collect())
            }
            NodeKind::Register { value } => Snapshot::Scalar(value.clone()),
        })
    }

    /// Describe a live subtree as a [`NodeInit`] (same ids).
    pub fn export(&self, id: NodeId) -> Option<NodeInit> {
        let node = self.nodes.get(&id)?;
        let export_fields = |fields: &BTreeMap<String, Field>| -> BTreeMap<String, NewValue> {
            fields
                .iter()
                .filter_map(|(k, f)| {
                    let value = match f.slot.as_ref()? {
                        Slot::Scalar(v) => NewValue::Scalar(v.clone()),
                        Slot::Node(child) => NewValue::Node(self.export(*child)?),
                    };
                    Some((k.clone(), value))
                })
                .collect()
        };
        let data = match &node.kind {
            NodeKind::Object { fields } => NodeData::Object(export_fields(fields)),
            NodeKind::Map { entries } => NodeData::Map(export_fields(entries)),
            NodeKind::List { children } => NodeData::List(
                children
                    .iter()
                    .filter_map(|c| {
                        let pos = self.nodes.get(c)?.position()?.clone();
                        Some((pos, self.export(*c)?))
                    })
                    .collect(),
            ),
            NodeKind::Register { value } => NodeData::Register(value.clone()),
        };
        Some(NodeInit { id, data })
    }

    // ─── Subscriptions ───────────────────────────────────────────────

    /// Call `callback` after every committed batch that changes `node`.
    pub fn subscribe(&mut self, node: NodeId, callback: Callback) -> SubscriptionId {
        self.observers.subscribe(node, false, callback)
    }

    /// Like [`subscribe`](Self::subscribe), but also for changes below `node`.
    pub fn subscribe_deep(&mut self, node: NodeId, callback: Callback) -> SubscriptionId {
        self.observers.subscribe(node, true, callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<Callback> {
        self.observers.unsubscribe(id)
    }

    /// Deliver the events of a committed batch to subscribers.
    pub fn notify(&mut self, events: &[StorageEvent]) {
        let nodes = &self.nodes;
        self.observers.notify(events, |id| ancestors_in(nodes, id));
    }

    // ─── Mutation ────────────────────────────────────────────────────

    /// Apply a batch of ops and notify subscribers once at the end.
    pub fn apply_batch(&mut self, ops: &[Operation]) -> Vec<Result<Applied, Conflict>> {
        let results: Vec<_> = ops.iter().map(|op| self.apply(op)).collect();
        let events: Vec<StorageEvent> = results
            .iter()
            .filter_map(|r| r.as_ref().ok())
            .flat_map(|a| a.events.iter().copied())
            .collect();
        self.notify(&events);
        results
    }

    /// Validate and apply one op. Subscribers are not notified; callers
    /// batch events and call [`notify`](Self::notify).
    pub fn apply(&mut self, op: &Operation) -> Result<Applied, Conflict> {
        self.validate(op).map_err(|reason| Conflict {
            op: op.id,
            target: op.target,
            reason,
        })?;

        self.clock = self.clock.max(op.clock);
        let stamp = op.stamp();
        let applied = match &op.kind {
            OpKind::Set { key, value } => self.apply_set(op.target, key, value, stamp),
            OpKind::Insert { position, node } => self.apply_insert(op.target, position, node, stamp),
            OpKind::Delete { key: Some(key) } => self.apply_delete_key(op.target, key, stamp),
            OpKind::Delete { key: None } => self.apply_delete_node(op.target, stamp),
            OpKind::Move { position } => self.apply_move(op.target, position, stamp),
        };
        Ok(applied)
    }

    fn validate(&self, op: &Operation) -> Result<(), ConflictReason> {
        let target = self.nodes.get(&op.target).ok_or(ConflictReason::UnknownNode)?;
        if target.is_tombstoned() {
            return Err(ConflictReason::Tombstoned);
        }

        match &op.kind {
            OpKind::Set { value, .. } => {
                if target.kind.fields().is_none() {
                    return Err(ConflictReason::TypeMismatch);
                }
                match value {
                    NewValue::Node(init) => self.validate_init(init)?,
                    NewValue::Scalar(v) => check_value(v)?,
                }
            }
            OpKind::Insert { position, node } => {
                if !matches!(target.kind, NodeKind::List { .. }) {
                    return Err(ConflictReason::TypeMismatch);
                }
                check_position(position)?;
                self.validate_init(node)?;
            }
            OpKind::Delete { key: Some(_) } => {
                if target.kind.fields().is_none() {
                    return Err(ConflictReason::TypeMismatch);
                }
            }
            OpKind::Delete { key: None } => {
                if target.id.is_root() {
                    return Err(ConflictReason::RootImmutable);
                }
            }
            OpKind::Move { position } => {
                if target.id.is_root() {
                    return Err(ConflictReason::RootImmutable);
                }
                if !matches!(target.parent_key, ParentKey::Position { .. }) {
                    return Err(ConflictReason::TypeMismatch);
                }
                check_position(position)?;
            }
        }
        Ok(())
    }

    fn validate_init(&self, init: &NodeInit) -> Result<(), ConflictReason> {
        let mut ids = Vec::new();
        init.collect_ids(&mut ids);
        let mut seen = HashSet::with_capacity(ids.len());
        for id in ids {
            if id.is_root() || self.nodes.contains_key(&id) || !seen.insert(id) {
                return Err(ConflictReason::DuplicateNode);
            }
        }
        validate_payload(init)
    }

    fn apply_set(&mut self, target: NodeId, key: &str, value: &NewValue, stamp: Stamp) -> Applied {
        let current = self.raw_field(target, key).cloned();
        if let Some(field) = &current {
            if stamp <= field.stamp {
                // lost LWW: keep the ids known, but dead
                if let NewValue::Node(init) = value {
                    self.materialize(init, target, ParentKey::Key(key.to_string()), stamp, Some(stamp.clock));
                }
                return Applied::default();
            }
        }

        let previous = current.and_then(|f| f.slot);
        let reverse = self.reverse_of_slot(target, key, previous.as_ref());
        if let Some(Slot::Node(old)) = &previous {
            self.tombstone(*old, stamp.clock);
        }

        let slot = match value {
            NewValue::Scalar(v) => Slot::Scalar(v.clone()),
            NewValue::Node(init) => {
                self.materialize(init, target, ParentKey::Key(key.to_string()), stamp, None);
                Slot::Node(init.id)
            }
        };
        if let Some(fields) = self.nodes.get_mut(&target).and_then(|n| n.kind.fields_mut()) {
            fields.insert(key.to_string(), Field { slot: Some(slot), stamp });
        }

        let mut events = vec![StorageEvent { node: target, removed: false }];
        if let Some(Slot::Node(old)) = previous {
            events.push(StorageEvent { node: old, removed: true });
        }
        Applied {
            reverse: vec![reverse],
            events,
        }
    }

    fn apply_insert(&mut self, list: NodeId, position: &Position, node: &NodeInit, stamp: Stamp) -> Applied {
        let index = self.insertion_index(list, position, node.id);
        self.materialize(
            node,
            list,
            ParentKey::Position {
                position: position.clone(),
                stamp,
            },
            stamp,
            None,
        );
        if let Some(NodeKind::List { children }) = self.nodes.get_mut(&list).map(|n| &mut n.kind) {
            children.insert(index, node.id);
        }
        Applied {
            reverse: vec![OpDraft::new(node.id, OpKind::Delete { key: None })],
            events: vec![StorageEvent { node: list, removed: false }],
        }
    }

    fn apply_delete_key(&mut self, target: NodeId, key: &str, stamp: Stamp) -> Applied {
        let current = self.raw_field(target, key).cloned();
        if let Some(field) = &current {
            if stamp <= field.stamp {
                return Applied::default();
            }
        }

        let previous = current.and_then(|f| f.slot);
        if let Some(fields) = self.nodes.get_mut(&target).and_then(|n| n.kind.fields_mut()) {
            fields.insert(key.to_string(), Field { slot: None, stamp });
        }
        let Some(previous) = previous else {
            // marker only; nothing visible changed
            return Applied::default();
        };

        let reverse = self.reverse_of_slot(target, key, Some(&previous));
        let mut events = vec![StorageEvent { node: target, removed: false }];
        if let Slot::Node(old) = previous {
            self.tombstone(old, stamp.clock);
            events.push(StorageEvent { node: old, removed: true });
        }
        Applied {
            reverse: vec![reverse],
            events,
        }
    }

    fn apply_delete_node(&mut self, id: NodeId, stamp: Stamp) -> Applied {
        let Some(node) = self.nodes.get(&id) else {
            return Applied::default();
        };
        let Some(parent) = node.parent else {
            return Applied::default();
        };

        match node.parent_key.clone() {
            ParentKey::Key(key) => {
                if matches!(self.field(parent, &key), Some(Slot::Node(n)) if *n == id) {
                    self.apply_delete_key(parent, &key, stamp)
                } else {
                    Applied::default()
                }
            }
            ParentKey::Position { position, .. } => {
                let reverse = self.export(id).map(|init| {
                    OpDraft::new(parent, OpKind::Insert { position, node: init })
                });
                if let Some(NodeKind::List { children }) = self.nodes.get_mut(&parent).map(|n| &mut n.kind) {
                    children.retain(|c| *c != id);
                }
                self.tombstone(id, stamp.clock);
                Applied {
                    reverse: reverse.into_iter().collect(),
                    events: vec![
                        StorageEvent { node: parent, removed: false },
                        StorageEvent { node: id, removed: true },
                    ],
                }
            }
            ParentKey::Root => Applied::default(),
        }
    }

    fn apply_move(&mut self, id: NodeId, position: &Position, stamp: Stamp) -> Applied {
        let Some(node) = self.nodes.get(&id) else {
            return Applied::default();
        };
        let (Some(parent), ParentKey::Position { position: old, stamp: old_stamp }) =
            (node.parent, node.parent_key.clone())
        else {
            return Applied::default();
        };
        if stamp <= old_stamp {
            return Applied::default();
        }

        if let Some(NodeKind::List { children }) = self.nodes.get_mut(&parent).map(|n| &mut n.kind) {
            children.retain(|c| *c != id);
        }
        if let Some(node) = self.nodes.get_mut(&id) {
            node.parent_key = ParentKey::Position {
                position: position.clone(),
                stamp,
            };
        }
        let index = self.insertion_index(parent, position, id);
        if let Some(NodeKind::List { children }) = self.nodes.get_mut(&parent).map(|n| &mut n.kind) {
            children.insert(index, id);
        }

        Applied {
            reverse: vec![OpDraft::new(id, OpKind::Move { position: old })],
            events: vec![StorageEvent { node: parent, removed: false }],
        }
    }

    /// Purge tombstones removed at or before `acked_clock`, plus deletion
    /// markers that old. Returns the number of nodes dropped.
    pub fn collect_garbage(&mut self, acked_clock: u64) -> usize {
        let dead: Vec<NodeId> = self
            .nodes
            .values()
            .filter(|n| matches!(n.removed_at, Some(c) if c <= acked_clock))
            .map(|n| n.id)
            .collect();
        for id in &dead {
            self.nodes.remove(id);
        }
        for node in self.nodes.values_mut() {
            if let Some(fields) = node.kind.fields_mut() {
                fields.retain(|_, f| f.slot.is_some() || f.stamp.clock > acked_clock);
            }
        }
        dead.len()
    }

    // ─── Internals ───────────────────────────────────────────────────

    fn raw_field(&self, id: NodeId, key: &str) -> Option<&Field> {
        self.nodes
            .get(&id)
            .and_then(|n| n.kind.fields())
            .and_then(|fields| fields.get(key))
    }

    fn reverse_of_slot(&self, target: NodeId, key: &str, previous: Option<&Slot>) -> OpDraft {
        let kind = match previous {
            None => OpKind::Delete {
                key: Some(key.to_string()),
            },
            Some(Slot::Scalar(v)) => OpKind::Set {
                key: key.to_string(),
                value: NewValue::Scalar(v.clone()),
            },
            Some(Slot::Node(child)) => match self.export(*child) {
                Some(init) => OpKind::Set {
                    key: key.to_string(),
                    value: NewValue::Node(init),
                },
                None => OpKind::Delete {
                    key: Some(key.to_string()),
                },
            },
        };
        OpDraft::new(target, kind)
    }

    fn insertion_index(&self, list: NodeId, position: &Position, id: NodeId) -> usize {
        let nodes = &self.nodes;
        self.list_children(list).partition_point(|c| {
            match nodes.get(c).and_then(StorageNode::position) {
                Some(p) => (p, *c) < (position, id),
                None => true,
            }
        })
    }

    fn materialize(
        &mut self,
        init: &NodeInit,
        parent: NodeId,
        parent_key: ParentKey,
        stamp: Stamp,
        removed_at: Option<u64>,
    ) {
        let kind = match &init.data {
            NodeData::Object(fields) => NodeKind::Object {
                fields: self.materialize_fields(init.id, fields, stamp, removed_at),
            },
            NodeData::Map(entries) => NodeKind::Map {
                entries: self.materialize_fields(init.id, entries, stamp, removed_at),
            },
            NodeData::List(items) => {
                let mut order: Vec<(Position, NodeId)> = Vec::with_capacity(items.len());
                for (position, child) in items {
                    self.materialize(
                        child,
                        init.id,
                        ParentKey::Position {
                            position: position.clone(),
                            stamp,
                        },
                        stamp,
                        removed_at,
                    );
                    order.push((position.clone(), child.id));
                }
                order.sort();
                NodeKind::List {
                    children: order.into_iter().map(|(_, id)| id).collect(),
                }
            }
            NodeData::Register(value) => NodeKind::Register { value: value.clone() },
        };
        self.nodes.insert(
            init.id,
            StorageNode {
                id: init.id,
                parent: Some(parent),
                parent_key,
                kind,
                removed_at,
            },
        );
    }

    fn materialize_fields(
        &mut self,
        owner: NodeId,
        fields: &BTreeMap<String, NewValue>,
        stamp: Stamp,
        removed_at: Option<u64>,
    ) -> BTreeMap<String, Field> {
        let mut out = BTreeMap::new();
        for (key, value) in fields {
            let slot = match value {
                NewValue::Scalar(v) => Slot::Scalar(v.clone()),
                NewValue::Node(child) => {
                    self.materialize(child, owner, ParentKey::Key(key.clone()), stamp, removed_at);
                    Slot::Node(child.id)
                }
            };
            out.insert(key.clone(), Field { slot: Some(slot), stamp });
        }
        out
    }

    /// Mark `id` and its whole subtree as removed at `clock`.
    fn tombstone(&mut self, id: NodeId, clock: u64) {
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let Some(node) = self.nodes.get_mut(&current) else {
                continue;
            };
            if node.removed_at.is_none() {
                node.removed_at = Some(clock);
            }
            match &node.kind {
                NodeKind::Object { fields } | NodeKind::Map { entries: fields } => {
                    stack.extend(fields.values().filter_map(|f| match &f.slot {
                        Some(Slot::Node(child)) => Some(*child),
                        _ => None,
                    }));
                }
                NodeKind::List { children } => stack.extend(children.iter().copied()),
                NodeKind::Register { .. } => {}
            }
        }
    }
}

impl std::fmt::Debug for StorageTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageTree")
            .field("clock", &self.clock)
            .field("nodes", &self.nodes.len())
            .field("observers", &self.observers)
            .finish()
    }
}

fn ancestors_in(nodes: &HashMap<NodeId, StorageNode>, id: NodeId) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut current = nodes.get(&id).and_then(|n| n.parent);
    while let Some(parent) = current {
        out.push(parent);
        current = nodes.get(&parent).and_then(|n| n.parent);
    }
    out
}

fn check_position(position: &Position) -> Result<(), ConflictReason> {
    Position::parse(position.as_str())
        .map(|_| ())
        .map_err(|_| ConflictReason::InvalidPosition)
}

fn check_value(value: &Value) -> Result<(), ConflictReason> {
    value.validate().map_err(|_| ConflictReason::InvalidValue)
}

/// Positions and scalars of a subtree about to be created.
fn validate_payload(init: &NodeInit) -> Result<(), ConflictReason> {
    match &init.data {
        NodeData::Object(fields) | NodeData::Map(fields) => {
            for value in fields.values() {
                match value {
                    NewValue::Node(child) => validate_payload(child)?,
                    NewValue::Scalar(v) => check_value(v)?,
                }
            }
        }
        NodeData::List(items) => {
            for (position, child) in items {
                check_position(position)?;
                validate_payload(child)?;
            }
        }
        NodeData::Register(v) => check_value(v)?,
    }
    Ok(())
}

/// Convenience accessors used by tests and the replica.
impl StorageTree {
    /// Scalar stored directly in an Object/Map field.
    pub fn scalar(&self, id: NodeId, key: &str) -> Option<&Value> {
        match self.field(id, key)? {
            Slot::Scalar(v) => Some(v),
            Slot::Node(_) => None,
        }
    }

    /// Child node stored in an Object/Map field.
    pub fn child(&self, id: NodeId, key: &str) -> Option<NodeId> {
        match self.field(id, key)? {
            Slot::Node(child) => Some(*child),
            Slot::Scalar(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{IdAllocator, OpId};
    use crate::op::Init;
    use std::sync::{Arc, Mutex};

    const A: ClientId = ClientId(1);
    const B: ClientId = ClientId(2);

    fn op(client: ClientId, seq: u64, clock: u64, target: NodeId, kind: OpKind) -> Operation {
        Operation {
            id: OpId::new(client, seq),
            target,
            kind,
            clock,
        }
    }

    fn set(key: &str, v: impl Into<Value>) -> OpKind {
        OpKind::Set {
            key: key.into(),
            value: NewValue::Scalar(v.into()),
        }
    }

    fn tree_with_list(list: NodeId) -> StorageTree {
        let mut tree = StorageTree::new();
        let init = NodeInit {
            id: list,
            data: NodeData::List(Vec::new()),
        };
        tree.apply(&op(
            ClientId::SERVER,
            1,
            1,
            NodeId::ROOT,
            OpKind::Set {
                key: "items".into(),
                value: NewValue::Node(init),
            },
        ))
        .unwrap();
        tree
    }

    fn insert(node: NodeId, position: &Position, v: &str) -> OpKind {
        OpKind::Insert {
            position: position.clone(),
            node: NodeInit {
                id: node,
                data: NodeData::Register(Value::from(v)),
            },
        }
    }

    #[test]
    fn test_new_tree_holds_empty_root() {
        let tree = StorageTree::new();
        assert_eq!(tree.node_count(), 1);
        assert!(tree.is_live(NodeId::ROOT));
        assert_eq!(tree.kind_of(NodeId::ROOT), Some("object"));
        assert_eq!(tree.snapshot(), Snapshot::Object(Default::default()));
        assert_eq!(tree.to_storage_snapshot(), StorageSnapshot::empty());
    }

    #[test]
    fn test_set_and_snapshot() {
        let mut tree = StorageTree::new();
        tree.apply(&op(A, 1, 1, NodeId::ROOT, set("value", 1))).unwrap();

        let snap = tree.snapshot();
        assert_eq!(snap.get("value"), Some(&Snapshot::Scalar(Value::Number(1.0))));
        assert_eq!(tree.clock(), 1);
    }

    #[test]
    fn test_lww_newer_wins_regardless_of_order() {
        let first = op(A, 1, 1, NodeId::ROOT, set("k", "a"));
        let second = op(B, 1, 2, NodeId::ROOT, set("k", "b"));

        let mut t1 = StorageTree::new();
        t1.apply(&first).unwrap();
        t1.apply(&second).unwrap();

        let mut t2 = StorageTree::new();
        t2.apply(&second).unwrap();
        let late = t2.apply(&first).unwrap();
        assert!(late.is_noop());

        assert_eq!(t1.snapshot(), t2.snapshot());
        assert_eq!(t1.scalar(NodeId::ROOT, "k"), Some(&Value::from("b")));
    }

    #[test]
    fn test_equal_clock_tie_broken_by_client() {
        let from_a = op(A, 1, 5, NodeId::ROOT, set("k", "a"));
        let from_b = op(B, 1, 5, NodeId::ROOT, set("k", "b"));

        let mut t1 = StorageTree::new();
        t1.apply(&from_a).unwrap();
        t1.apply(&from_b).unwrap();
        let mut t2 = StorageTree::new();
        t2.apply(&from_b).unwrap();
        t2.apply(&from_a).unwrap();

        assert_eq!(t1.snapshot(), t2.snapshot());
        assert_eq!(t1.scalar(NodeId::ROOT, "k"), Some(&Value::from("b")));
    }

    #[test]
    fn test_newer_delete_beats_older_set_in_any_order() {
        let write = op(A, 1, 3, NodeId::ROOT, set("k", 1));
        let delete = op(B, 1, 4, NodeId::ROOT, OpKind::Delete { key: Some("k".into()) });

        let mut t1 = StorageTree::new();
        t1.apply(&write).unwrap();
        t1.apply(&delete).unwrap();
        let mut t2 = StorageTree::new();
        t2.apply(&delete).unwrap();
        t2.apply(&write).unwrap();

        assert_eq!(t1.snapshot(), t2.snapshot());
        assert!(t1.snapshot().get("k").is_none());
    }

    #[test]
    fn test_concurrent_list_inserts_same_position_converge() {
        let list = NodeId::new(ClientId::SERVER, 10);
        let pos = Position::first();
        let ins_a = op(A, 1, 2, list, insert(NodeId::new(A, 1), &pos, "A"));
        let ins_b = op(B, 1, 3, list, insert(NodeId::new(B, 1), &pos, "B"));

        let mut t1 = tree_with_list(list);
        t1.apply(&ins_a).unwrap();
        t1.apply(&ins_b).unwrap();
        let mut t2 = tree_with_list(list);
        t2.apply(&ins_b).unwrap();
        t2.apply(&ins_a).unwrap();

        assert_eq!(t1.snapshot(), t2.snapshot());
        // equal positions: client 1 sorts first
        let items = t1.snapshot().get("items").cloned().unwrap();
        assert_eq!(items.at(0), Some(&Snapshot::Scalar(Value::from("A"))));
        assert_eq!(items.at(1), Some(&Snapshot::Scalar(Value::from("B"))));
    }

    #[test]
    fn test_op_on_tombstoned_node_rejected() {
        let list = NodeId::new(ClientId::SERVER, 10);
        let item = NodeId::new(A, 1);
        let mut tree = tree_with_list(list);
        tree.apply(&op(A, 1, 2, list, insert(item, &Position::first(), "x"))).unwrap();
        tree.apply(&op(B, 1, 3, item, OpKind::Delete { key: None })).unwrap();

        let err = tree
            .apply(&op(A, 2, 4, item, OpKind::Move { position: Position::first().after() }))
            .unwrap_err();
        assert_eq!(err.reason, ConflictReason::Tombstoned);
        assert_eq!(tree.list_len(list), 0);
    }

    #[test]
    fn test_unknown_target_rejected_without_mutation() {
        let mut tree = StorageTree::new();
        let before = tree.to_storage_snapshot();
        let err = tree
            .apply(&op(A, 1, 1, NodeId::new(A, 99), set("k", 1)))
            .unwrap_err();
        assert_eq!(err.reason, ConflictReason::UnknownNode);
        assert_eq!(tree.to_storage_snapshot(), before);
    }

    #[test]
    fn test_non_finite_numbers_rejected() {
        let mut tree = StorageTree::new();
        let err = tree
            .apply(&op(A, 1, 1, NodeId::ROOT, set("k", Value::Number(f64::NAN))))
            .unwrap_err();
        assert_eq!(err.reason, ConflictReason::InvalidValue);

        let list = NodeId::new(A, 1);
        let mut tree = tree_with_list(list);
        let kind = OpKind::Insert {
            position: Position::first(),
            node: NodeInit {
                id: NodeId::new(A, 2),
                data: NodeData::Register(Value::Number(f64::INFINITY)),
            },
        };
        let err = tree.apply(&op(A, 2, 2, list, kind)).unwrap_err();
        assert_eq!(err.reason, ConflictReason::InvalidValue);
    }

    #[test]
    fn test_type_mismatch_and_root_rules() {
        let mut tree = StorageTree::new();
        let err = tree
            .apply(&op(A, 1, 1, NodeId::ROOT, insert(NodeId::new(A, 1), &Position::first(), "x")))
            .unwrap_err();
        assert_eq!(err.reason, ConflictReason::TypeMismatch);

        let err = tree
            .apply(&op(A, 2, 2, NodeId::ROOT, OpKind::Delete { key: None }))
            .unwrap_err();
        assert_eq!(err.reason, ConflictReason::RootImmutable);
    }

    #[test]
    fn test_duplicate_node_rejected() {
        let list = NodeId::new(ClientId::SERVER, 10);
        let mut tree = tree_with_list(list);
        let ins = op(A, 1, 2, list, insert(NodeId::new(A, 1), &Position::first(), "x"));
        tree.apply(&ins).unwrap();
        let err = tree.apply(&ins.clone().with_clock(3)).unwrap_err();
        assert_eq!(err.reason, ConflictReason::DuplicateNode);
        assert_eq!(tree.list_len(list), 1);
    }

    #[test]
    fn test_move_reorders_and_reverses() {
        let list = NodeId::new(ClientId::SERVER, 10);
        let mut tree = tree_with_list(list);
        let p = Position::sequence(2);
        tree.apply(&op(A, 1, 2, list, insert(NodeId::new(A, 1), &p[0], "first"))).unwrap();
        tree.apply(&op(A, 2, 3, list, insert(NodeId::new(A, 2), &p[1], "second"))).unwrap();

        let applied = tree
            .apply(&op(A, 3, 4, NodeId::new(A, 1), OpKind::Move { position: p[1].after() }))
            .unwrap();
        assert_eq!(tree.list_child_at(list, 0), Some(NodeId::new(A, 2)));
        assert_eq!(
            applied.reverse,
            vec![OpDraft::new(NodeId::new(A, 1), OpKind::Move { position: p[0].clone() })]
        );
    }

    #[test]
    fn test_reverse_of_overwritten_child_restores_content() {
        let mut ids = IdAllocator::new(A);
        let mut tree = StorageTree::new();
        let child = Init::object([("n", Init::scalar(1))]).into_node(&mut ids);
        tree.apply(&op(A, 100, 1, NodeId::ROOT, OpKind::Set { key: "c".into(), value: NewValue::Node(child.clone()) }))
            .unwrap();
        let applied = tree.apply(&op(B, 1, 2, NodeId::ROOT, set("c", "flat"))).unwrap();

        assert!(tree.is_tombstoned(child.id));
        match &applied.reverse[0].kind {
            OpKind::Set { value: NewValue::Node(init), .. } => assert_eq!(init, &child),
            other => panic!("Expected node restore, got {other:?}"),
        }
    }

    #[test]
    fn test_garbage_collection_respects_ack_clock() {
        let list = NodeId::new(ClientId::SERVER, 10);
        let item = NodeId::new(A, 1);
        let mut tree = tree_with_list(list);
        tree.apply(&op(A, 1, 2, list, insert(item, &Position::first(), "x"))).unwrap();
        tree.apply(&op(A, 2, 5, item, OpKind::Delete { key: None })).unwrap();

        assert_eq!(tree.collect_garbage(4), 0);
        assert!(tree.contains(item));
        assert_eq!(tree.collect_garbage(5), 1);
        assert!(!tree.contains(item));
    }

    #[test]
    fn test_snapshot_roundtrip_through_dump() {
        let list = NodeId::new(ClientId::SERVER, 10);
        let mut tree = tree_with_list(list);
        tree.apply(&op(A, 1, 2, list, insert(NodeId::new(A, 1), &Position::first(), "x"))).unwrap();

        let restored = StorageTree::from_snapshot(tree.to_storage_snapshot()).unwrap();
        assert_eq!(restored.snapshot(), tree.snapshot());
        assert_eq!(restored.clock(), 2);
    }

    #[test]
    fn test_from_snapshot_requires_root() {
        let err = StorageTree::from_snapshot(StorageSnapshot {
            clock: 0,
            max_client: ClientId::SERVER,
            nodes: vec![],
        })
        .unwrap_err();
        assert_eq!(err, SnapshotError::MissingRoot);
    }

    #[test]
    fn test_subscribers_notified_once_per_batch() {
        let mut tree = StorageTree::new();
        let calls = Arc::new(Mutex::new(Vec::new()));
        let seen = calls.clone();
        tree.subscribe(NodeId::ROOT, Box::new(move |events: &[StorageEvent]| {
            seen.lock().unwrap().push(events.len());
        }));

        tree.apply_batch(&[
            op(A, 1, 1, NodeId::ROOT, set("a", 1)),
            op(A, 2, 2, NodeId::ROOT, set("b", 2)),
        ]);
        assert_eq!(*calls.lock().unwrap(), vec![2]);
    }
}
