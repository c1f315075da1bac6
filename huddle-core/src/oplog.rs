//! Bounded replay window of sequenced operations.
//!
//! The room keeps the most recent `capacity` ops in clock order. A client
//! that reconnects with a last-known clock inside the window is brought up to
//! date with the ops it missed; anything older needs a full snapshot.

use std::collections::{HashMap, VecDeque};

use crate::error::ReplayGapExceeded;
use crate::ids::OpId;
use crate::op::Operation;

/// Default number of ops retained for replay.
pub const DEFAULT_REPLAY_WINDOW: usize = 1024;

#[derive(Debug, Clone)]
pub struct OpLog {
    entries: VecDeque<Operation>,
    by_id: HashMap<OpId, u64>,
    capacity: usize,
    head: u64,
}

impl Default for OpLog {
    fn default() -> Self {
        Self::new(DEFAULT_REPLAY_WINDOW)
    }
}

impl OpLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity.min(DEFAULT_REPLAY_WINDOW)),
            by_id: HashMap::new(),
            capacity: capacity.max(1),
            head: 0,
        }
    }

    /// Log for a room restored at `clock`; nothing before it can be replayed.
    pub fn starting_at(capacity: usize, clock: u64) -> Self {
        let mut log = Self::new(capacity);
        log.head = clock;
        log
    }

    /// Append a sequenced op. Clocks must be strictly increasing.
    pub fn push(&mut self, op: Operation) {
        debug_assert!(op.clock > self.head, "op log clocks must increase");
        self.head = op.clock;
        self.by_id.insert(op.id, op.clock);
        self.entries.push_back(op);
        while self.entries.len() > self.capacity {
            if let Some(old) = self.entries.pop_front() {
                self.by_id.remove(&old.id);
            }
        }
    }

    /// Clock assigned to `op_id`, if it is still inside the window.
    pub fn lookup(&self, op_id: OpId) -> Option<u64> {
        self.by_id.get(&op_id).copied()
    }

    /// Clock of the oldest retained op.
    pub fn oldest_clock(&self) -> Option<u64> {
        self.entries.front().map(|op| op.clock)
    }

    /// Clock of the newest op ever pushed.
    pub fn head_clock(&self) -> u64 {
        self.head
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Every op with a clock greater than `clock`, oldest first.
    pub fn since(&self, clock: u64) -> Result<Vec<Operation>, ReplayGapExceeded> {
        if clock >= self.head {
            return Ok(Vec::new());
        }
        let oldest = self.oldest_clock().unwrap_or(self.head + 1);
        if clock + 1 < oldest {
            return Err(ReplayGapExceeded {
                requested: clock,
                oldest,
            });
        }
        let start = self.entries.partition_point(|op| op.clock <= clock);
        Ok(self.entries.range(start..).cloned().collect())
    }
}
