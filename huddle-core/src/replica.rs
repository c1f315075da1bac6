//! Client-side replica with optimistic local mutations.
//!
//! ```text
//!   confirmed tree  = every op the server has sequenced, in clock order
//!   view tree       = confirmed + pending local ops replayed on top
//!
//!   local mutation ──▶ apply to view (provisional clock) ──▶ pending + outbox
//!   STORAGE_ACK    ──▶ move op from pending into confirmed
//!   STORAGE_OP     ──▶ apply to confirmed, rebuild view from confirmed
//!   REJECTED       ──▶ drop pending op, rebuild view
//! ```
//!
//! Pending ops replay with provisional clocks `confirmed + 1 + index`, the
//! clocks the server will assign if nothing else interleaves, so local
//! writes win locally exactly when they will win on the server. A pending
//! op that no longer applies to the rebuilt view stays pending until the
//! server answers for it.

use std::collections::{HashMap, VecDeque};

use crate::error::{ConflictReason, MutationError, SnapshotError};
use crate::history::{HistoryEntry, HistoryManager, Presence, PresencePatch};
use crate::ids::{ClientId, IdAllocator, NodeId, OpId};
use crate::observer::{Callback, StorageEvent, SubscriptionId};
use crate::op::{Init, OpDraft, OpKind, Operation};
use crate::position::Position;
use crate::snapshot::{Snapshot, StorageSnapshot};
use crate::tree::{Applied, StorageTree};

/// What an undo or redo asks the caller to do besides storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryStep {
    /// Presence keys to write back (`Value::Null` removes a key).
    pub presence: Option<PresencePatch>,
}

#[derive(Default)]
struct Batch {
    depth: usize,
    reverse: Vec<OpDraft>,
    events: Vec<StorageEvent>,
}

pub struct Replica {
    confirmed: StorageTree,
    view: StorageTree,
    pending: VecDeque<Operation>,
    by_node: HashMap<NodeId, VecDeque<OpId>>,
    outbox: Vec<Operation>,
    ids: IdAllocator,
    history: HistoryManager,
    batch: Batch,
}

impl Replica {
    pub fn new(client: ClientId) -> Self {
        Self::with_history(client, HistoryManager::default())
    }

    pub fn with_history(client: ClientId, history: HistoryManager) -> Self {
        Self {
            confirmed: StorageTree::new(),
            view: StorageTree::new(),
            pending: VecDeque::new(),
            by_node: HashMap::new(),
            outbox: Vec::new(),
            ids: IdAllocator::new(client),
            history,
            batch: Batch::default(),
        }
    }

    pub fn client(&self) -> ClientId {
        self.ids.client()
    }

    /// Take a new actor number after reconnecting. Pending ops keep their ids.
    pub fn rebind(&mut self, client: ClientId) {
        self.ids.rebind(client);
    }

    // ─── Reading ─────────────────────────────────────────────────────

    /// The tree as the local user sees it.
    pub fn tree(&self) -> &StorageTree {
        &self.view
    }

    /// The tree as the server has confirmed it.
    pub fn confirmed(&self) -> &StorageTree {
        &self.confirmed
    }

    pub fn snapshot(&self) -> Snapshot {
        self.view.snapshot()
    }

    /// Last server clock this replica has seen.
    pub fn clock(&self) -> u64 {
        self.confirmed.clock()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Unacknowledged ops targeting `node`, oldest first.
    pub fn pending_for(&self, node: NodeId) -> Vec<&Operation> {
        let Some(ids) = self.by_node.get(&node) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.pending.iter().find(|op| op.id == *id))
            .collect()
    }

    pub fn subscribe(&mut self, node: NodeId, callback: Callback) -> SubscriptionId {
        self.view.subscribe(node, callback)
    }

    pub fn subscribe_deep(&mut self, node: NodeId, callback: Callback) -> SubscriptionId {
        self.view.subscribe_deep(node, callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<Callback> {
        self.view.unsubscribe(id)
    }

    // ─── Outbound ────────────────────────────────────────────────────

    /// Ops issued since the last call, ready to send.
    pub fn take_outbox(&mut self) -> Vec<Operation> {
        std::mem::take(&mut self.outbox)
    }

    /// Every unacknowledged op, for resending after a reconnect.
    pub fn resend_pending(&mut self) -> Vec<Operation> {
        self.outbox.clear();
        self.pending.iter().cloned().collect()
    }

    // ─── Server messages ─────────────────────────────────────────────

    /// The server sequenced one of our ops at `clock`. Unknown ids are
    /// ignored, so a repeated ack is harmless.
    pub fn apply_ack(&mut self, op_id: OpId, clock: u64) {
        let Some(index) = self.pending.iter().position(|op| op.id == op_id) else {
            log::trace!("Ignoring ack for {} (not pending)", op_id);
            return;
        };
        let Some(op) = self.remove_pending(index) else {
            return;
        };

        if clock <= self.confirmed.clock() {
            // already part of the confirmed state (snapshot or replay)
            self.rebuild(Vec::new());
            return;
        }

        let predicted = index == 0 && clock == self.confirmed.clock() + 1;
        if let Err(conflict) = self.confirmed.apply(&op.with_clock(clock)) {
            log::warn!("Acked op does not apply to confirmed state: {}", conflict);
        }
        if !predicted {
            self.rebuild(Vec::new());
        }
    }

    /// An op sequenced by the server. Ops at or below the confirmed clock
    /// were seen already and are ignored.
    pub fn apply_remote(&mut self, op: Operation) {
        if self.pending.iter().any(|p| p.id == op.id) {
            // our own op replayed back after a reconnect
            self.apply_ack(op.id, op.clock);
            return;
        }
        if op.clock <= self.confirmed.clock() {
            log::trace!("Ignoring {} at clock {} (seen)", op.id, op.clock);
            return;
        }

        let events = match self.confirmed.apply(&op) {
            Ok(applied) => applied.events,
            Err(conflict) => {
                log::warn!("Remote op dropped: {}", conflict);
                Vec::new()
            }
        };
        self.rebuild(events);
    }

    /// The server refused one of our ops; drop it and restore the view.
    pub fn apply_reject(&mut self, op_id: OpId, reason: ConflictReason) {
        let Some(index) = self.pending.iter().position(|op| op.id == op_id) else {
            return;
        };
        if let Some(op) = self.remove_pending(index) {
            log::debug!("Server rejected {}: {}", op.id, reason);
            self.outbox.retain(|o| o.id != op_id);
            self.rebuild(vec![StorageEvent {
                node: op.target,
                removed: false,
            }]);
        }
    }

    /// Replace the confirmed state with a full snapshot from the server.
    /// Pending ops are replayed on top until the server resolves them.
    pub fn load_snapshot(&mut self, snapshot: StorageSnapshot) -> Result<(), SnapshotError> {
        self.confirmed = StorageTree::from_snapshot(snapshot)?;
        self.rebuild(vec![StorageEvent {
            node: NodeId::ROOT,
            removed: false,
        }]);
        Ok(())
    }

    fn rebuild(&mut self, events: Vec<StorageEvent>) {
        self.view.reset_from(&self.confirmed);
        let base = self.confirmed.clock();
        for (i, op) in self.pending.iter().enumerate() {
            let provisional = op.clone().with_clock(base + 1 + i as u64);
            if let Err(conflict) = self.view.apply(&provisional) {
                log::debug!("Pending op waits for the server: {}", conflict);
            }
        }
        self.view.notify(&events);
    }

    fn remove_pending(&mut self, index: usize) -> Option<Operation> {
        let op = self.pending.remove(index)?;
        if let Some(ids) = self.by_node.get_mut(&op.target) {
            ids.retain(|id| *id != op.id);
            if ids.is_empty() {
                self.by_node.remove(&op.target);
            }
        }
        Some(op)
    }

    // ─── Local mutations ─────────────────────────────────────────────

    /// Write an Object/Map field.
    pub fn set(&mut self, node: NodeId, key: &str, value: impl Into<Init>) -> Result<(), MutationError> {
        self.expect_fields(node)?;
        let value = value.into();
        value.validate()?;
        let value = value.into_new_value(&mut self.ids);
        self.commit(OpDraft::new(
            node,
            OpKind::Set {
                key: key.to_string(),
                value,
            },
        ))
    }

    /// Remove an Object/Map field.
    pub fn delete_key(&mut self, node: NodeId, key: &str) -> Result<(), MutationError> {
        self.expect_fields(node)?;
        if self.view.field(node, key).is_none() {
            return Err(MutationError::KeyNotFound(key.to_string()));
        }
        self.commit(OpDraft::new(
            node,
            OpKind::Delete {
                key: Some(key.to_string()),
            },
        ))
    }

    /// Append to a list; returns the new child's id.
    pub fn list_push(&mut self, list: NodeId, value: impl Into<Init>) -> Result<NodeId, MutationError> {
        let len = self.expect_list(list)?;
        self.list_insert(list, len, value)
    }

    /// Insert before the item at `index` (`index == len` appends).
    pub fn list_insert(
        &mut self,
        list: NodeId,
        index: usize,
        value: impl Into<Init>,
    ) -> Result<NodeId, MutationError> {
        let len = self.expect_list(list)?;
        if index > len {
            return Err(MutationError::IndexOutOfBounds { index, len });
        }
        let value = value.into();
        value.validate()?;

        let lo = index
            .checked_sub(1)
            .and_then(|i| self.view.list_position_at(list, i))
            .cloned();
        let hi = self.view.list_position_at(list, index).cloned();
        let position = Position::between(lo.as_ref(), hi.as_ref());

        let node = value.into_node(&mut self.ids);
        let id = node.id;
        self.commit(OpDraft::new(list, OpKind::Insert { position, node }))?;
        Ok(id)
    }

    pub fn list_delete(&mut self, list: NodeId, index: usize) -> Result<(), MutationError> {
        let len = self.expect_list(list)?;
        let child = self
            .view
            .list_child_at(list, index)
            .ok_or(MutationError::IndexOutOfBounds { index, len })?;
        self.commit(OpDraft::new(child, OpKind::Delete { key: None }))
    }

    /// Move the item at `from` so it ends up at index `to`.
    pub fn list_move(&mut self, list: NodeId, from: usize, to: usize) -> Result<(), MutationError> {
        let len = self.expect_list(list)?;
        for index in [from, to] {
            if index >= len {
                return Err(MutationError::IndexOutOfBounds { index, len });
            }
        }
        if from == to {
            return Ok(());
        }

        let children = self.view.list_children(list);
        let child = children[from];
        let others: Vec<&Position> = children
            .iter()
            .filter(|c| **c != child)
            .filter_map(|c| self.view.get(*c).and_then(|n| n.position()))
            .collect();
        let lo = to.checked_sub(1).and_then(|i| others.get(i).copied());
        let hi = others.get(to).copied();
        let position = Position::between(lo, hi);

        self.commit(OpDraft::new(child, OpKind::Move { position }))
    }

    /// Replace the item at `index`. Registers are immutable, so this is a
    /// delete plus an insert recorded as one history entry.
    pub fn list_set(
        &mut self,
        list: NodeId,
        index: usize,
        value: impl Into<Init>,
    ) -> Result<NodeId, MutationError> {
        let value = value.into();
        self.batch(|replica| {
            replica.list_delete(list, index)?;
            replica.list_insert(list, index, value)
        })
    }

    /// Run `f` as one gesture: one history entry, one notification.
    pub fn batch<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.batch.depth += 1;
        let out = f(self);
        self.batch.depth -= 1;
        if self.batch.depth == 0 {
            let reverse = std::mem::take(&mut self.batch.reverse);
            let events = std::mem::take(&mut self.batch.events);
            self.history.record(reverse);
            self.view.notify(&events);
        }
        out
    }

    fn commit(&mut self, draft: OpDraft) -> Result<(), MutationError> {
        let applied = self.issue(draft)?;
        if self.batch.depth > 0 {
            let mut reverse = applied.reverse;
            reverse.append(&mut self.batch.reverse);
            self.batch.reverse = reverse;
            self.batch.events.extend(applied.events);
        } else {
            self.history.record(applied.reverse);
            self.view.notify(&applied.events);
        }
        Ok(())
    }

    /// Give `draft` an id, apply it to the view and queue it for sending.
    fn issue(&mut self, draft: OpDraft) -> Result<Applied, MutationError> {
        let op = Operation::new(self.ids.next_op(), draft);
        let provisional = self.confirmed.clock() + 1 + self.pending.len() as u64;
        let applied = self.view.apply(&op.clone().with_clock(provisional))?;

        self.by_node.entry(op.target).or_default().push_back(op.id);
        self.outbox.push(op.clone());
        self.pending.push_back(op);
        Ok(applied)
    }

    fn expect_live(&self, node: NodeId) -> Result<&'static str, MutationError> {
        match self.view.get(node) {
            Some(n) if !n.is_tombstoned() => Ok(n.kind.name()),
            _ => Err(MutationError::NodeNotFound(node)),
        }
    }

    fn expect_fields(&self, node: NodeId) -> Result<(), MutationError> {
        match self.expect_live(node)? {
            "object" | "map" => Ok(()),
            actual => Err(MutationError::WrongKind {
                node,
                expected: "object or map",
                actual,
            }),
        }
    }

    fn expect_list(&self, node: NodeId) -> Result<usize, MutationError> {
        match self.expect_live(node)? {
            "list" => Ok(self.view.list_len(node)),
            actual => Err(MutationError::WrongKind {
                node,
                expected: "list",
                actual,
            }),
        }
    }

    // ─── History ─────────────────────────────────────────────────────

    pub fn history(&self) -> &HistoryManager {
        &self.history
    }

    pub fn can_undo(&self) -> bool {
        self.history.can_undo()
    }

    pub fn can_redo(&self) -> bool {
        self.history.can_redo()
    }

    pub fn pause_history(&mut self) {
        self.history.pause();
    }

    pub fn resume_history(&mut self) {
        self.history.resume();
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Keep history's view of the local presence current.
    pub fn observe_presence(&mut self, presence: &Presence) {
        self.history.observe_presence(presence);
    }

    /// Record an `add_to_history` presence update.
    pub fn record_presence(&mut self, previous: PresencePatch) {
        self.history.record_presence(previous);
    }

    /// Revert the latest gesture by issuing new ops. Returns `None` when
    /// there is nothing to undo.
    pub fn undo(&mut self) -> Option<HistoryStep> {
        let entry = self.history.pop_undo()?;
        let reverse = self.replay(&entry);
        let inverse = self.history.inverse_of(reverse, &entry);
        self.history.push_redo(inverse);
        Some(HistoryStep {
            presence: entry.presence,
        })
    }

    pub fn redo(&mut self) -> Option<HistoryStep> {
        let entry = self.history.pop_redo()?;
        let reverse = self.replay(&entry);
        let inverse = self.history.inverse_of(reverse, &entry);
        self.history.push_undo(inverse);
        Some(HistoryStep {
            presence: entry.presence,
        })
    }

    /// Issue the drafts of a history entry; returns their combined reverse.
    fn replay(&mut self, entry: &HistoryEntry) -> Vec<OpDraft> {
        let mut remap = HashMap::new();
        let mut reverse: Vec<OpDraft> = Vec::new();
        let mut events = Vec::new();

        for draft in &entry.ops {
            let mut draft = draft.clone();
            draft.reassign_created(&mut self.ids, &mut remap);
            draft.rewrite_targets(&remap);
            match self.issue(draft) {
                Ok(applied) => {
                    let mut r = applied.reverse;
                    r.append(&mut reverse);
                    reverse = r;
                    events.extend(applied.events);
                }
                Err(err) => log::debug!("Skipping history op: {}", err),
            }
        }

        self.history.add_aliases(remap);
        self.view.notify(&events);
        reverse
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("client", &self.ids.client())
            .field("clock", &self.confirmed.clock())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{Authority, Receipt};
    use crate::value::Value;

    fn joined(authority: &Authority, client: u32) -> Replica {
        let mut replica = Replica::new(ClientId(client));
        replica.load_snapshot(authority.snapshot()).unwrap();
        replica
    }

    /// Send everything in the outbox and hand the receipts back.
    fn flush(replica: &mut Replica, authority: &mut Authority) -> Vec<Receipt> {
        let mut receipts = Vec::new();
        for op in replica.take_outbox() {
            match authority.receive(op, replica.clock()) {
                Ok(receipt) => {
                    replica.apply_ack(receipt.op_id(), receipt.clock());
                    receipts.push(receipt);
                }
                Err(conflict) => replica.apply_reject(conflict.op, conflict.reason),
            }
        }
        receipts
    }

    fn deliver(receipts: &[Receipt], to: &mut Replica) {
        for receipt in receipts {
            if let Receipt::Sequenced { op, .. } = receipt {
                to.apply_remote(op.clone());
            }
        }
    }

    #[test]
    fn test_local_write_is_visible_immediately() {
        let mut replica = Replica::new(ClientId(1));
        replica.set(NodeId::ROOT, "value", 1).unwrap();

        assert_eq!(replica.snapshot().get("value"), Some(&Snapshot::Scalar(Value::from(1))));
        assert_eq!(replica.pending_len(), 1);
        assert_eq!(replica.pending_for(NodeId::ROOT).len(), 1);
        assert_eq!(replica.confirmed().snapshot().get("value"), None);
    }

    #[test]
    fn test_ack_moves_op_into_confirmed() {
        let mut authority = Authority::default();
        let mut replica = joined(&authority, 1);
        replica.set(NodeId::ROOT, "value", 1).unwrap();
        flush(&mut replica, &mut authority);

        assert!(!replica.has_pending());
        assert_eq!(replica.clock(), 1);
        assert_eq!(replica.confirmed().snapshot(), authority.tree().snapshot());

        // repeated ack is a no-op
        replica.apply_ack(OpId::new(ClientId(1), 1), 1);
        assert_eq!(replica.snapshot(), authority.tree().snapshot());
    }

    #[test]
    fn test_remote_op_keeps_pending_local_write_on_top() {
        let mut authority = Authority::default();
        let mut a = joined(&authority, 1);
        let mut b = joined(&authority, 2);

        a.set(NodeId::ROOT, "k", "from a").unwrap();
        b.set(NodeId::ROOT, "k", "from b").unwrap();
        let receipts = flush(&mut b, &mut authority);
        deliver(&receipts, &mut a);

        // a's write is still pending and will be sequenced later, so it wins
        assert_eq!(a.snapshot().get("k"), Some(&Snapshot::Scalar(Value::from("from a"))));
        let receipts = flush(&mut a, &mut authority);
        deliver(&receipts, &mut b);
        assert_eq!(a.snapshot(), b.snapshot());
        assert_eq!(a.snapshot(), authority.tree().snapshot());
    }

    #[test]
    fn test_rejected_op_is_rolled_back() {
        let mut authority = Authority::default();
        let mut a = joined(&authority, 1);
        let mut b = joined(&authority, 2);

        b.set(NodeId::ROOT, "obj", Init::object([("n", Init::scalar(1))])).unwrap();
        let receipts = flush(&mut b, &mut authority);
        deliver(&receipts, &mut a);
        let obj = a.tree().child(NodeId::ROOT, "obj").unwrap();

        // a edits the object while b replaces it
        a.set(obj, "n", 2).unwrap();
        b.set(NodeId::ROOT, "obj", "gone").unwrap();
        let receipts = flush(&mut b, &mut authority);
        deliver(&receipts, &mut a);
        assert!(a.has_pending());

        flush(&mut a, &mut authority);
        assert!(!a.has_pending());
        assert_eq!(a.snapshot(), authority.tree().snapshot());
    }

    #[test]
    fn test_list_set_is_one_undo_step() {
        let mut replica = Replica::new(ClientId(1));
        replica.set(NodeId::ROOT, "items", Init::list([Init::scalar("a")])).unwrap();
        let list = replica.tree().child(NodeId::ROOT, "items").unwrap();

        replica.list_set(list, 0, "b").unwrap();
        assert_eq!(
            replica.snapshot().get("items").and_then(|l| l.at(0)).cloned(),
            Some(Snapshot::Scalar(Value::from("b")))
        );

        replica.undo().unwrap();
        assert_eq!(
            replica.snapshot().get("items").and_then(|l| l.at(0)).cloned(),
            Some(Snapshot::Scalar(Value::from("a")))
        );
        assert_eq!(replica.tree().list_len(list), 1);
    }

    #[test]
    fn test_list_move_lands_at_target_index() {
        let mut replica = Replica::new(ClientId(1));
        replica
            .set(NodeId::ROOT, "items", Init::list(["a", "b", "c"].map(Init::scalar)))
            .unwrap();
        let list = replica.tree().child(NodeId::ROOT, "items").unwrap();

        replica.list_move(list, 0, 2).unwrap();
        let items = replica.snapshot().get("items").cloned().unwrap();
        let order: Vec<_> = (0..3)
            .filter_map(|i| items.at(i).and_then(|s| s.as_scalar()).and_then(|v| v.as_str().map(String::from)))
            .collect();
        assert_eq!(order, vec!["b", "c", "a"]);
    }

    #[test]
    fn test_mutation_errors() {
        let mut replica = Replica::new(ClientId(1));
        replica.set(NodeId::ROOT, "items", Init::list([])).unwrap();
        let list = replica.tree().child(NodeId::ROOT, "items").unwrap();

        assert_eq!(
            replica.list_delete(list, 0),
            Err(MutationError::IndexOutOfBounds { index: 0, len: 0 })
        );
        assert!(matches!(
            replica.set(list, "k", 1),
            Err(MutationError::WrongKind { .. })
        ));
        assert_eq!(
            replica.delete_key(NodeId::ROOT, "missing"),
            Err(MutationError::KeyNotFound("missing".into()))
        );
        assert!(matches!(
            replica.set(NodeId::ROOT, "bad", Value::Number(f64::NAN)),
            Err(MutationError::Value(_))
        ));
        assert_eq!(replica.pending_len(), 1);
    }
}
