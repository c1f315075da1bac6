//! Arena entries of the storage tree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::{NodeId, Stamp};
use crate::position::Position;
use crate::value::Value;

/// Content of an Object/Map field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Slot {
    Scalar(Value),
    Node(NodeId),
}

/// A stamped Object/Map field. `slot == None` records a deletion so a
/// late, older write cannot bring the key back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub slot: Option<Slot>,
    pub stamp: Stamp,
}

/// Where a node hangs off its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ParentKey {
    Root,
    Key(String),
    Position { position: Position, stamp: Stamp },
}

/// Kind-specific state of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    Object { fields: BTreeMap<String, Field> },
    Map { entries: BTreeMap<String, Field> },
    /// Live children only, sorted by `(position, id)`.
    List { children: Vec<NodeId> },
    Register { value: Value },
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Object { .. } => "object",
            NodeKind::Map { .. } => "map",
            NodeKind::List { .. } => "list",
            NodeKind::Register { .. } => "register",
        }
    }

    pub(crate) fn fields(&self) -> Option<&BTreeMap<String, Field>> {
        match self {
            NodeKind::Object { fields } => Some(fields),
            NodeKind::Map { entries } => Some(entries),
            _ => None,
        }
    }

    pub(crate) fn fields_mut(&mut self) -> Option<&mut BTreeMap<String, Field>> {
        match self {
            NodeKind::Object { fields } => Some(fields),
            NodeKind::Map { entries } => Some(entries),
            _ => None,
        }
    }
}

/// One node of the storage tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageNode {
    pub id: NodeId,
    pub parent: Option<NodeId>,
    pub parent_key: ParentKey,
    pub kind: NodeKind,
    /// Clock of the op that removed this node, if tombstoned.
    pub removed_at: Option<u64>,
}

impl StorageNode {
    pub fn root() -> Self {
        Self {
            id: NodeId::ROOT,
            parent: None,
            parent_key: ParentKey::Root,
            kind: NodeKind::Object {
                fields: BTreeMap::new(),
            },
            removed_at: None,
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.removed_at.is_some()
    }

    pub fn position(&self) -> Option<&Position> {
        match &self.parent_key {
            ParentKey::Position { position, .. } => Some(position),
            _ => None,
        }
    }
}
