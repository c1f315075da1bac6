//! Server-side conflict resolution.
//!
//! ```text
//!   client op ──▶ Authority::receive
//!                   │ already in replay window? ──▶ Duplicate(original clock)
//!                   │ stamp clock = head + 1
//!                   │ StorageTree::apply ── Err ──▶ Conflict (op dropped, logged)
//!                   ▼
//!                 OpLog::push ──▶ Sequenced (ack originator, fan out to peers)
//! ```
//!
//! The room clock only advances for ops that were applied, so the log holds
//! a contiguous run of clocks.

use crate::error::{Conflict, ReplayGapExceeded, SnapshotError};
use crate::ids::{ClientId, OpId};
use crate::observer::StorageEvent;
use crate::op::Operation;
use crate::oplog::{OpLog, DEFAULT_REPLAY_WINDOW};
use crate::snapshot::StorageSnapshot;
use crate::tree::StorageTree;

/// Result of a successfully received op.
#[derive(Debug, Clone, PartialEq)]
pub enum Receipt {
    /// Newly sequenced. `op.clock` is the assigned room clock.
    Sequenced {
        op: Operation,
        events: Vec<StorageEvent>,
    },
    /// Already applied earlier (a resend after reconnect).
    Duplicate { op_id: OpId, clock: u64 },
}

impl Receipt {
    pub fn op_id(&self) -> OpId {
        match self {
            Receipt::Sequenced { op, .. } => op.id,
            Receipt::Duplicate { op_id, .. } => *op_id,
        }
    }

    pub fn clock(&self) -> u64 {
        match self {
            Receipt::Sequenced { op, .. } => op.clock,
            Receipt::Duplicate { clock, .. } => *clock,
        }
    }
}

/// Owns the authoritative tree and clock of one room.
#[derive(Debug)]
pub struct Authority {
    tree: StorageTree,
    log: OpLog,
    /// Highest client id handed out or seen on an op.
    max_client: ClientId,
}

impl Default for Authority {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW)
    }
}

impl Authority {
    pub fn new(replay_window: usize) -> Self {
        Self {
            tree: StorageTree::new(),
            log: OpLog::new(replay_window),
            max_client: ClientId::SERVER,
        }
    }

    /// Restore a room from a persisted snapshot.
    pub fn from_snapshot(snapshot: StorageSnapshot, replay_window: usize) -> Result<Self, SnapshotError> {
        let max_client = snapshot.max_client;
        let tree = StorageTree::from_snapshot(snapshot)?;
        let log = OpLog::starting_at(replay_window, tree.clock());
        Ok(Self {
            max_client: max_client.max(tree.max_client()),
            tree,
            log,
        })
    }

    /// Current room clock.
    pub fn clock(&self) -> u64 {
        self.log.head_clock()
    }

    pub fn tree(&self) -> &StorageTree {
        &self.tree
    }

    pub fn log(&self) -> &OpLog {
        &self.log
    }

    pub fn snapshot(&self) -> StorageSnapshot {
        let mut snapshot = self.tree.to_storage_snapshot();
        snapshot.max_client = self.max_client();
        snapshot
    }

    /// Sequence and apply an op from a client whose last-seen clock is
    /// `client_clock`.
    pub fn receive(&mut self, op: Operation, client_clock: u64) -> Result<Receipt, Conflict> {
        if let Some(clock) = self.log.lookup(op.id) {
            log::debug!("{} already sequenced at clock {}", op.id, clock);
            return Ok(Receipt::Duplicate { op_id: op.id, clock });
        }

        let head = self.clock();
        if client_clock < head {
            log::trace!("{} issued at clock {} against head {}", op.id, client_clock, head);
        }

        let op = op.with_clock(head + 1);
        match self.tree.apply(&op) {
            Ok(applied) => {
                self.reserve_client(op.id.client);
                self.log.push(op.clone());
                Ok(Receipt::Sequenced {
                    op,
                    events: applied.events,
                })
            }
            Err(conflict) => {
                log::warn!("Dropping {} ({}): {}", op.id, op.kind.name(), conflict.reason);
                Err(conflict)
            }
        }
    }

    /// Ops a client at `clock` has not seen yet.
    pub fn missing_since(&self, clock: u64) -> Result<Vec<Operation>, ReplayGapExceeded> {
        self.log.since(clock)
    }

    /// Purge tombstones every client has seen. Returns the number purged.
    pub fn collect_garbage(&mut self, acked_clock: u64) -> usize {
        let purged = self.tree.collect_garbage(acked_clock.min(self.clock()));
        if purged > 0 {
            log::debug!("Collected {} tombstones up to clock {}", purged, acked_clock);
        }
        purged
    }

    /// Highest client id ever handed out in this room. Survives snapshots,
    /// so a restored room never reissues an id whose ops may still be
    /// pending somewhere.
    pub fn max_client(&self) -> ClientId {
        self.max_client.max(self.tree.max_client())
    }

    /// Record that `client` has been handed out.
    pub fn reserve_client(&mut self, client: ClientId) {
        self.max_client = self.max_client.max(client);
    }
}
