//! Undo/redo stacks.
//!
//! Undo is implemented as forward operations: an entry holds the reverse
//! drafts of a batch, and undoing it issues those drafts as brand-new ops
//! that peers merge through the normal resolver. The reverse of what the
//! undo issued becomes the redo entry.
//!
//! Presence lives outside the stacks. Only an update flagged
//! `add_to_history` records an entry (the previous values of the keys it
//! touched); a plain presence update never touches undo or redo.

use std::collections::{BTreeMap, HashMap, VecDeque};

use crate::ids::NodeId;
use crate::op::OpDraft;
use crate::value::Value;

/// Default maximum number of undo entries.
pub const DEFAULT_HISTORY_DEPTH: usize = 100;

/// Presence object: key to JSON-like value.
pub type Presence = BTreeMap<String, Value>;

/// Values to write back into presence. `Value::Null` removes a key.
pub type PresencePatch = BTreeMap<String, Value>;

/// One reversible user gesture.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryEntry {
    /// Drafts to issue, in order, to revert the gesture.
    pub ops: Vec<OpDraft>,
    /// Presence keys to restore, for `add_to_history` updates.
    pub presence: Option<PresencePatch>,
    /// Presence that was current when the entry was recorded.
    pub presence_snapshot: Presence,
}

impl HistoryEntry {
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.presence.as_ref().map_or(true, |p| p.is_empty())
    }

    /// Fold a later change into this entry. Later reverses run first.
    fn absorb(&mut self, later: HistoryEntry) {
        let mut ops = later.ops;
        ops.append(&mut self.ops);
        self.ops = ops;
        if let Some(patch) = later.presence {
            let mine = self.presence.get_or_insert_with(PresencePatch::new);
            for (key, previous) in patch {
                // keep the value from before the first change
                mine.entry(key).or_insert(previous);
            }
        }
    }
}

#[derive(Debug)]
pub struct HistoryManager {
    undo: VecDeque<HistoryEntry>,
    redo: Vec<HistoryEntry>,
    depth: usize,
    paused: Option<HistoryEntry>,
    aliases: HashMap<NodeId, NodeId>,
    presence: Presence,
}

impl Default for HistoryManager {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_DEPTH)
    }
}

impl HistoryManager {
    pub fn new(depth: usize) -> Self {
        Self {
            undo: VecDeque::new(),
            redo: Vec::new(),
            depth: depth.max(1),
            paused: None,
            aliases: HashMap::new(),
            presence: Presence::new(),
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo.is_empty() || self.paused.as_ref().is_some_and(|e| !e.is_empty())
    }

    pub fn can_redo(&self) -> bool {
        !self.redo.is_empty()
    }

    pub fn undo_len(&self) -> usize {
        self.undo.len()
    }

    pub fn redo_len(&self) -> usize {
        self.redo.len()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.is_some()
    }

    pub fn clear(&mut self) {
        self.undo.clear();
        self.redo.clear();
        self.paused = None;
        self.aliases.clear();
    }

    /// Start coalescing every change into one entry until [`resume`](Self::resume).
    pub fn pause(&mut self) {
        if self.paused.is_none() {
            self.paused = Some(HistoryEntry {
                presence_snapshot: self.presence.clone(),
                ..HistoryEntry::default()
            });
        }
    }

    /// Commit the coalesced entry, if it recorded anything.
    pub fn resume(&mut self) {
        if let Some(entry) = self.paused.take() {
            if !entry.is_empty() {
                self.push_undo(entry);
            }
        }
    }

    /// Track the latest local presence. Never touches the stacks.
    pub fn observe_presence(&mut self, presence: &Presence) {
        self.presence.clone_from(presence);
    }

    /// Record the reverse drafts of a committed local storage batch.
    pub fn record(&mut self, reverse: Vec<OpDraft>) {
        if reverse.is_empty() {
            return;
        }
        self.commit(HistoryEntry {
            ops: reverse,
            presence: None,
            presence_snapshot: self.presence.clone(),
        });
    }

    /// Record an `add_to_history` presence update. `previous` maps each
    /// touched key to its value before the update.
    pub fn record_presence(&mut self, previous: PresencePatch) {
        if previous.is_empty() {
            return;
        }
        self.commit(HistoryEntry {
            ops: Vec::new(),
            presence: Some(previous),
            presence_snapshot: self.presence.clone(),
        });
    }

    fn commit(&mut self, entry: HistoryEntry) {
        self.redo.clear();
        match self.paused.as_mut() {
            Some(paused) => paused.absorb(entry),
            None => self.push_undo(entry),
        }
    }

    /// Take the entry to undo, with node ids rewritten to their latest
    /// incarnation.
    pub fn pop_undo(&mut self) -> Option<HistoryEntry> {
        self.resume();
        let mut entry = self.undo.pop_back()?;
        self.rewrite(&mut entry);
        Some(entry)
    }

    pub fn pop_redo(&mut self) -> Option<HistoryEntry> {
        let mut entry = self.redo.pop()?;
        self.rewrite(&mut entry);
        Some(entry)
    }

    /// Push the entry produced by an undo. Keeps the redo stack.
    pub fn push_redo(&mut self, entry: HistoryEntry) {
        if !entry.is_empty() {
            self.redo.push(entry);
        }
    }

    /// Push the entry produced by a redo. Keeps the redo stack.
    pub fn push_undo(&mut self, entry: HistoryEntry) {
        if entry.is_empty() {
            return;
        }
        self.undo.push_back(entry);
        while self.undo.len() > self.depth {
            self.undo.pop_front();
        }
    }

    /// Nodes recreated under fresh ids; later entries follow them.
    pub fn add_aliases(&mut self, remap: HashMap<NodeId, NodeId>) {
        self.aliases.extend(remap);
    }

    /// Patch that reverts applying `patch` to the current presence.
    pub fn invert_presence(&self, patch: &PresencePatch) -> PresencePatch {
        patch
            .keys()
            .map(|key| {
                let current = self.presence.get(key).cloned().unwrap_or(Value::Null);
                (key.clone(), current)
            })
            .collect()
    }

    /// Entry to push on the opposite stack after replaying `entry`.
    pub fn inverse_of(&self, reverse: Vec<OpDraft>, entry: &HistoryEntry) -> HistoryEntry {
        HistoryEntry {
            ops: reverse,
            presence: entry.presence.as_ref().map(|p| self.invert_presence(p)),
            presence_snapshot: self.presence.clone(),
        }
    }

    fn rewrite(&self, entry: &mut HistoryEntry) {
        if self.aliases.is_empty() {
            return;
        }
        for draft in &mut entry.ops {
            draft.rewrite_targets(&self.aliases);
        }
    }
}
