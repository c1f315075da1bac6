//! Error types for the storage core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::{NodeId, OpId};

/// Invalid scalar value at the JSON boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValueError {
    #[error("numbers must be finite")]
    NonFiniteNumber,
}

/// Malformed list position key.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PositionError {
    #[error("position is empty")]
    Empty,
    #[error("position contains byte {0:#04x} outside the digit range")]
    InvalidDigit(u8),
    #[error("position ends with the minimum digit")]
    TrailingMinimum,
}

/// Why an operation could not be applied to a tree.
///
/// Sent back to the originating client in `STORAGE_REJECTED`, hence the
/// serde derives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictReason {
    /// Target (or the parent a new node should go into) does not exist.
    UnknownNode,
    /// Target was removed; late ops must not resurrect it.
    Tombstoned,
    /// Op kind does not fit the target's node kind.
    TypeMismatch,
    /// A node id carried by the op already exists.
    DuplicateNode,
    /// Position key failed validation.
    InvalidPosition,
    /// A scalar in the op is not representable (non-finite number).
    InvalidValue,
    /// The root cannot be deleted or moved.
    RootImmutable,
    /// Session has no write permission.
    NotAllowed,
}

impl std::fmt::Display for ConflictReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConflictReason::UnknownNode => "unknown node",
            ConflictReason::Tombstoned => "node is tombstoned",
            ConflictReason::TypeMismatch => "operation does not fit node kind",
            ConflictReason::DuplicateNode => "node id already exists",
            ConflictReason::InvalidPosition => "invalid list position",
            ConflictReason::InvalidValue => "invalid scalar value",
            ConflictReason::RootImmutable => "root cannot be removed or moved",
            ConflictReason::NotAllowed => "write not allowed",
        };
        f.write_str(s)
    }
}

/// An operation was rejected by a tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} on {target} rejected: {reason}")]
pub struct Conflict {
    pub op: OpId,
    pub target: NodeId,
    pub reason: ConflictReason,
}

/// Misuse of the local mutation API. Nothing is sent when this is returned.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutationError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("node {node} is a {actual}, expected {expected}")]
    WrongKind {
        node: NodeId,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("index {index} out of bounds for list of length {len}")]
    IndexOutOfBounds { index: usize, len: usize },
    #[error("key {0:?} not found")]
    KeyNotFound(String),
    #[error(transparent)]
    Value(#[from] ValueError),
    #[error(transparent)]
    Conflict(#[from] Conflict),
}

/// The replay window no longer covers the requested clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("replay window starts after clock {requested} (oldest retained: {oldest})")]
pub struct ReplayGapExceeded {
    pub requested: u64,
    pub oldest: u64,
}

/// A persisted snapshot could not be turned back into a tree.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    #[error("snapshot has no root object")]
    MissingRoot,
    #[error("node {0} references missing parent {1}")]
    DanglingParent(NodeId, NodeId),
    #[error("node {0} appears twice")]
    DuplicateNode(NodeId),
}
