//! Read-only views and serializable dumps of a storage tree.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ids::ClientId;
use crate::node::StorageNode;
use crate::value::Value;

/// Tombstone-free, JSON-like view of the live tree.
///
/// Two replicas have converged exactly when their snapshots are equal.
#[derive(Debug, Clone, PartialEq)]
pub enum Snapshot {
    Object(BTreeMap<String, Snapshot>),
    Map(BTreeMap<String, Snapshot>),
    List(Vec<Snapshot>),
    Scalar(Value),
}

impl Snapshot {
    /// Field of an object or map view.
    pub fn get(&self, key: &str) -> Option<&Snapshot> {
        match self {
            Snapshot::Object(fields) | Snapshot::Map(fields) => fields.get(key),
            _ => None,
        }
    }

    /// Item of a list view.
    pub fn at(&self, index: usize) -> Option<&Snapshot> {
        match self {
            Snapshot::List(items) => items.get(index),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            Snapshot::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Snapshot::Object(fields) | Snapshot::Map(fields) => fields.len(),
            Snapshot::List(items) => items.len(),
            Snapshot::Scalar(_) => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Plain JSON rendering; objects and maps both become JSON objects.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Snapshot::Object(fields) | Snapshot::Map(fields) => serde_json::Value::Object(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            Snapshot::List(items) => {
                serde_json::Value::Array(items.iter().map(Snapshot::to_json).collect())
            }
            Snapshot::Scalar(v) => v.to_json(),
        }
    }
}

/// Full serializable dump of the arena, used for persistence and
/// `FULL_SNAPSHOT` frames. Nodes are sorted by id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSnapshot {
    pub clock: u64,
    /// Highest client id the room has handed out.
    pub max_client: ClientId,
    pub nodes: Vec<StorageNode>,
}

impl StorageSnapshot {
    /// A snapshot containing only an empty root object.
    pub fn empty() -> Self {
        Self {
            clock: 0,
            max_client: ClientId::SERVER,
            nodes: vec![StorageNode::root()],
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for StorageSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}
