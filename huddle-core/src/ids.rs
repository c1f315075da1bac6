//! Identifiers for replicas, nodes and operations.
//!
//! Every id is a `(client, seq)` pair: `client` is the room-scoped actor
//! number handed out by the server at join time, `seq` a counter owned by
//! that client. Ids therefore never collide across clients and sort by
//! client first, which is what list tie-breaking relies on.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Room-scoped actor number assigned by the server on admission.
///
/// `ClientId(0)` is reserved for the server itself (the root node and
/// anything created while seeding a room).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u32);

impl ClientId {
    pub const SERVER: ClientId = ClientId(0);
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identity of a storage node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    pub client: ClientId,
    pub seq: u64,
}

impl NodeId {
    /// The root object of every room.
    pub const ROOT: NodeId = NodeId {
        client: ClientId::SERVER,
        seq: 0,
    };

    pub fn new(client: ClientId, seq: u64) -> Self {
        Self { client, seq }
    }

    pub fn is_root(&self) -> bool {
        *self == Self::ROOT
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client, self.seq)
    }
}

/// Identity of an operation: monotonic per-client counter plus client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OpId {
    pub client: ClientId,
    pub seq: u64,
}

impl OpId {
    pub fn new(client: ClientId, seq: u64) -> Self {
        Self { client, seq }
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op:{}:{}", self.client, self.seq)
    }
}

/// Last-writer-wins stamp. Orders by server clock, then by client id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Stamp {
    pub clock: u64,
    pub client: ClientId,
}

impl Default for ClientId {
    fn default() -> Self {
        ClientId::SERVER
    }
}

impl Stamp {
    pub fn new(clock: u64, client: ClientId) -> Self {
        Self { clock, client }
    }
}

/// Hands out node and op ids for one client.
///
/// Node ids and op ids share the same counter so a client never reuses a
/// sequence number, even across reconnects where its `ClientId` changes.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    client: ClientId,
    next: u64,
}

impl IdAllocator {
    pub fn new(client: ClientId) -> Self {
        Self { client, next: 1 }
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    /// Switch to a new actor number (after a reconnect). The counter keeps
    /// running.
    pub fn rebind(&mut self, client: ClientId) {
        self.client = client;
    }

    pub fn next_node(&mut self) -> NodeId {
        let id = NodeId::new(self.client, self.next);
        self.next += 1;
        id
    }

    pub fn next_op(&mut self) -> OpId {
        let id = OpId::new(self.client, self.next);
        self.next += 1;
        id
    }
}
