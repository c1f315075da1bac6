//! # huddle-core — Conflict-resolved room storage
//!
//! The durable half of a room: a tree of objects, maps, lists and registers
//! that converges on every replica, plus the machinery around it.
//!
//! ## Architecture
//!
//! ```text
//!   client                                   server (one per room)
//! ┌──────────────────────┐   Operation    ┌──────────────────────┐
//! │ Replica              │ ─────────────► │ Authority            │
//! │  view  (optimistic)  │                │  StorageTree         │
//! │  confirmed           │ ◄───────────── │  OpLog (replay)      │
//! │  HistoryManager      │  ack / op /    └──────────────────────┘
//! └──────────────────────┘  reject
//! ```
//!
//! ## Modules
//!
//! - [`tree`] — arena-backed CRDT tree with LWW fields and positioned lists
//! - [`position`] — fractional list position keys
//! - [`op`] — operations, drafts and node initializers
//! - [`oplog`] — bounded replay window
//! - [`resolver`] — server-side sequencing and validation
//! - [`replica`] — client-side optimistic application
//! - [`history`] — undo/redo stacks
//! - [`observer`] — per-node change subscriptions

pub mod error;
pub mod history;
pub mod ids;
pub mod node;
pub mod observer;
pub mod op;
pub mod oplog;
pub mod position;
pub mod replica;
pub mod resolver;
pub mod snapshot;
pub mod tree;
pub mod value;

// Re-exports for convenience
pub use error::{
    Conflict, ConflictReason, MutationError, PositionError, ReplayGapExceeded, SnapshotError,
    ValueError,
};
pub use history::{HistoryEntry, HistoryManager, Presence, PresencePatch, DEFAULT_HISTORY_DEPTH};
pub use ids::{ClientId, IdAllocator, NodeId, OpId, Stamp};
pub use node::{Field, NodeKind, ParentKey, Slot, StorageNode};
pub use observer::{Callback, StorageEvent, SubscriptionId};
pub use op::{Init, NewValue, NodeData, NodeInit, OpDraft, OpKind, Operation};
pub use oplog::{OpLog, DEFAULT_REPLAY_WINDOW};
pub use position::Position;
pub use replica::{HistoryStep, Replica};
pub use resolver::{Authority, Receipt};
pub use snapshot::{Snapshot, StorageSnapshot};
pub use tree::{Applied, StorageTree};
pub use value::Value;
