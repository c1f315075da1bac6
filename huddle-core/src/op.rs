//! Storage operations.
//!
//! An [`Operation`] is the unit of replication: immutable once issued,
//! identified by its [`OpId`], and ordered by the clock the server stamps
//! on it. New subtrees travel inside the op as [`NodeInit`] values that
//! already carry their node ids, so every replica materializes the same ids.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::ValueError;
use crate::ids::{IdAllocator, NodeId, OpId, Stamp};
use crate::position::Position;
use crate::value::Value;

/// Payload of a node created by an op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeData {
    Object(BTreeMap<String, NewValue>),
    Map(BTreeMap<String, NewValue>),
    List(Vec<(Position, NodeInit)>),
    Register(Value),
}

/// A node to be created, with its id already assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInit {
    pub id: NodeId,
    pub data: NodeData,
}

/// Right-hand side of a field write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NewValue {
    Scalar(Value),
    Node(NodeInit),
}

/// What an op does to its target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Write an Object/Map field.
    Set { key: String, value: NewValue },
    /// Insert a new child into a List.
    Insert { position: Position, node: NodeInit },
    /// With a key: remove that field of an Object/Map.
    /// Without: tombstone the target node.
    Delete { key: Option<String> },
    /// Reposition a List child.
    Move { position: Position },
}

impl OpKind {
    pub fn name(&self) -> &'static str {
        match self {
            OpKind::Set { .. } => "set",
            OpKind::Insert { .. } => "insert",
            OpKind::Delete { .. } => "delete",
            OpKind::Move { .. } => "move",
        }
    }
}

/// An op that has not been given an id yet. Reverse ops computed by the
/// tree and history entries are kept in this form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpDraft {
    pub target: NodeId,
    pub kind: OpKind,
}

/// A replicated storage operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub target: NodeId,
    pub kind: OpKind,
    /// Server-assigned room clock; `0` until sequenced.
    pub clock: u64,
}

impl Operation {
    pub fn new(id: OpId, draft: OpDraft) -> Self {
        Self {
            id,
            target: draft.target,
            kind: draft.kind,
            clock: 0,
        }
    }

    pub fn stamp(&self) -> Stamp {
        Stamp::new(self.clock, self.id.client)
    }

    pub fn with_clock(mut self, clock: u64) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_sequenced(&self) -> bool {
        self.clock > 0
    }

    pub fn to_draft(&self) -> OpDraft {
        OpDraft {
            target: self.target,
            kind: self.kind.clone(),
        }
    }

    /// Ids of every node this op would create.
    pub fn created_nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        match &self.kind {
            OpKind::Set {
                value: NewValue::Node(init),
                ..
            } => init.collect_ids(&mut out),
            OpKind::Insert { node, .. } => node.collect_ids(&mut out),
            _ => {}
        }
        out
    }
}

impl NodeInit {
    pub fn collect_ids(&self, out: &mut Vec<NodeId>) {
        out.push(self.id);
        match &self.data {
            NodeData::Object(fields) | NodeData::Map(fields) => {
                for value in fields.values() {
                    if let NewValue::Node(child) = value {
                        child.collect_ids(out);
                    }
                }
            }
            NodeData::List(items) => {
                for (_, child) in items {
                    child.collect_ids(out);
                }
            }
            NodeData::Register(_) => {}
        }
    }

    /// Give the whole subtree fresh ids, recording `old -> new` in `remap`.
    pub fn reassign(&mut self, ids: &mut IdAllocator, remap: &mut HashMap<NodeId, NodeId>) {
        let fresh = ids.next_node();
        remap.insert(self.id, fresh);
        self.id = fresh;
        match &mut self.data {
            NodeData::Object(fields) | NodeData::Map(fields) => {
                for value in fields.values_mut() {
                    if let NewValue::Node(child) = value {
                        child.reassign(ids, remap);
                    }
                }
            }
            NodeData::List(items) => {
                for (_, child) in items.iter_mut() {
                    child.reassign(ids, remap);
                }
            }
            NodeData::Register(_) => {}
        }
    }
}

impl OpDraft {
    pub fn new(target: NodeId, kind: OpKind) -> Self {
        Self { target, kind }
    }

    /// Recreated subtrees inside this draft get fresh ids.
    pub fn reassign_created(&mut self, ids: &mut IdAllocator, remap: &mut HashMap<NodeId, NodeId>) {
        match &mut self.kind {
            OpKind::Set {
                value: NewValue::Node(init),
                ..
            } => init.reassign(ids, remap),
            OpKind::Insert { node, .. } => node.reassign(ids, remap),
            _ => {}
        }
    }

    /// Rewrite node references through `aliases` (chasing chains).
    pub fn rewrite_targets(&mut self, aliases: &HashMap<NodeId, NodeId>) {
        self.target = resolve_alias(aliases, self.target);
    }
}

pub(crate) fn resolve_alias(aliases: &HashMap<NodeId, NodeId>, mut id: NodeId) -> NodeId {
    // chains are short; bound the walk anyway so a cycle cannot hang us
    for _ in 0..64 {
        match aliases.get(&id) {
            Some(next) if *next != id => id = *next,
            _ => break,
        }
    }
    id
}

/// User-facing initializer for new content, without ids.
///
/// Scalars inside lists are wrapped in register nodes when converted.
#[derive(Debug, Clone, PartialEq)]
pub enum Init {
    Scalar(Value),
    Object(BTreeMap<String, Init>),
    Map(BTreeMap<String, Init>),
    List(Vec<Init>),
}

impl Init {
    pub fn object<K: Into<String>>(fields: impl IntoIterator<Item = (K, Init)>) -> Self {
        Init::Object(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Init)>) -> Self {
        Init::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn list(items: impl IntoIterator<Item = Init>) -> Self {
        Init::List(items.into_iter().collect())
    }

    pub fn scalar(value: impl Into<Value>) -> Self {
        Init::Scalar(value.into())
    }

    /// Materialize as a field value: scalars stay inline.
    pub fn into_new_value(self, ids: &mut IdAllocator) -> NewValue {
        match self {
            Init::Scalar(v) => NewValue::Scalar(v),
            other => NewValue::Node(other.into_node(ids)),
        }
    }

    /// Materialize as a node: scalars become registers.
    pub fn into_node(self, ids: &mut IdAllocator) -> NodeInit {
        let id = ids.next_node();
        let data = match self {
            Init::Scalar(v) => NodeData::Register(v),
            Init::Object(fields) => NodeData::Object(
                fields
                    .into_iter()
                    .map(|(k, v)| (k, v.into_new_value(ids)))
                    .collect(),
            ),
            Init::Map(entries) => NodeData::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, v.into_new_value(ids)))
                    .collect(),
            ),
            Init::List(items) => {
                let positions = Position::sequence(items.len());
                NodeData::List(
                    positions
                        .into_iter()
                        .zip(items)
                        .map(|(pos, item)| (pos, item.into_node(ids)))
                        .collect(),
                )
            }
        };
        NodeInit { id, data }
    }
}

impl Init {
    /// Reject non-finite numbers anywhere in the initializer.
    pub fn validate(&self) -> Result<(), ValueError> {
        match self {
            Init::Scalar(v) => v.validate(),
            Init::Object(fields) | Init::Map(fields) => fields.values().try_for_each(Init::validate),
            Init::List(items) => items.iter().try_for_each(Init::validate),
        }
    }
}

impl From<Value> for Init {
    fn from(v: Value) -> Self {
        Init::Scalar(v)
    }
}

macro_rules! scalar_init {
    ($($t:ty),*) => {
        $(impl From<$t> for Init {
            fn from(v: $t) -> Self {
                Init::Scalar(Value::from(v))
            }
        })*
    };
}

scalar_init!(bool, i32, i64, &str, String);
