//! Undo/redo behaviour through the replica, and reconnect handling.

use huddle_core::{
    Authority, ClientId, Init, NodeId, Presence, PresencePatch, Receipt, Replica, Snapshot, Value,
};

fn joined(authority: &Authority, client: u32) -> Replica {
    let mut replica = Replica::new(ClientId(client));
    replica.load_snapshot(authority.snapshot()).unwrap();
    replica
}

/// Send the outbox and apply the answers; returns ops to fan out.
fn flush(replica: &mut Replica, authority: &mut Authority) -> Vec<huddle_core::Operation> {
    let mut fan_out = Vec::new();
    for op in replica.take_outbox() {
        match authority.receive(op, replica.clock()) {
            Ok(receipt) => {
                replica.apply_ack(receipt.op_id(), receipt.clock());
                if let Receipt::Sequenced { op, .. } = receipt {
                    fan_out.push(op);
                }
            }
            Err(conflict) => replica.apply_reject(conflict.op, conflict.reason),
        }
    }
    fan_out
}

fn value_of(snapshot: &Snapshot, key: &str) -> Option<Value> {
    snapshot.get(key).and_then(Snapshot::as_scalar).cloned()
}

// ── Undo / redo ────────────────────────────────────────────

#[test]
fn undo_then_redo_restores_batch_state() {
    let mut replica = Replica::new(ClientId(1));
    replica.set(NodeId::ROOT, "todos", Init::list([])).unwrap();
    let list = replica.tree().child(NodeId::ROOT, "todos").unwrap();

    replica.batch(|r| {
        r.list_push(list, "write tests").unwrap();
        r.list_push(list, "ship").unwrap();
        r.set(NodeId::ROOT, "title", "Sprint").unwrap();
    });
    let after_batch = replica.snapshot();

    replica.undo().unwrap();
    assert_eq!(replica.tree().list_len(list), 0);
    assert_eq!(value_of(&replica.snapshot(), "title"), None);

    replica.redo().unwrap();
    assert_eq!(replica.snapshot(), after_batch);
}

#[test]
fn undo_of_delete_recreates_subtree_and_deeper_undo_follows_it() {
    let mut replica = Replica::new(ClientId(1));
    replica
        .set(NodeId::ROOT, "shape", Init::object([("x", Init::scalar(1))]))
        .unwrap();
    let shape = replica.tree().child(NodeId::ROOT, "shape").unwrap();
    replica.set(shape, "x", 2).unwrap();
    replica.delete_key(NodeId::ROOT, "shape").unwrap();

    // restore the deleted object under a fresh id
    replica.undo().unwrap();
    let restored = replica.tree().child(NodeId::ROOT, "shape").unwrap();
    assert_ne!(restored, shape);

    // the earlier edit of x now targets the restored node
    replica.undo().unwrap();
    let x = replica
        .snapshot()
        .get("shape")
        .and_then(|s| s.get("x"))
        .and_then(Snapshot::as_scalar)
        .cloned();
    assert_eq!(x, Some(Value::from(1)));
}

#[test]
fn presence_update_between_undo_and_redo_keeps_redo() {
    let run = |with_presence: bool| {
        let mut replica = Replica::new(ClientId(1));
        replica.set(NodeId::ROOT, "value", 1).unwrap();
        replica.set(NodeId::ROOT, "value", 2).unwrap();

        replica.undo().unwrap();
        if with_presence {
            let presence = Presence::from([("cursor".to_string(), Value::from(10))]);
            replica.observe_presence(&presence);
        }
        assert!(replica.can_redo());
        replica.redo().unwrap();
        replica.snapshot()
    };

    assert_eq!(run(true), run(false));
    assert_eq!(value_of(&run(true), "value"), Some(Value::from(2)));
}

#[test]
fn presence_added_to_history_is_undone_and_redone() {
    let mut replica = Replica::new(ClientId(1));
    let before = Presence::from([("color".to_string(), Value::from("red"))]);
    replica.observe_presence(&before);

    replica.record_presence(PresencePatch::from([("color".to_string(), Value::from("red"))]));
    replica.observe_presence(&Presence::from([("color".to_string(), Value::from("blue"))]));

    let step = replica.undo().unwrap();
    assert_eq!(step.presence.unwrap()["color"], Value::from("red"));
    replica.observe_presence(&before);

    let step = replica.redo().unwrap();
    assert_eq!(step.presence.unwrap()["color"], Value::from("blue"));
}

#[test]
fn storage_mutation_after_undo_clears_redo() {
    let mut replica = Replica::new(ClientId(1));
    replica.set(NodeId::ROOT, "a", 1).unwrap();
    replica.undo().unwrap();
    assert!(replica.can_redo());

    replica.set(NodeId::ROOT, "b", 1).unwrap();
    assert!(!replica.can_redo());
}

#[test]
fn paused_history_coalesces_drag() {
    let mut replica = Replica::new(ClientId(1));
    replica.set(NodeId::ROOT, "x", 0).unwrap();

    replica.pause_history();
    for x in 1..=10 {
        replica.set(NodeId::ROOT, "x", x).unwrap();
    }
    replica.resume_history();

    replica.undo().unwrap();
    assert_eq!(value_of(&replica.snapshot(), "x"), Some(Value::from(0)));
}

#[test]
fn undo_propagates_to_peers_as_forward_ops() {
    let mut authority = Authority::default();
    let mut a = joined(&authority, 1);
    let mut b = joined(&authority, 2);

    a.set(NodeId::ROOT, "value", 1).unwrap();
    for op in flush(&mut a, &mut authority) {
        b.apply_remote(op);
    }
    a.undo().unwrap();
    for op in flush(&mut a, &mut authority) {
        b.apply_remote(op);
    }

    assert_eq!(value_of(&b.snapshot(), "value"), None);
    assert_eq!(a.snapshot(), b.snapshot());
}

// ── Reconnect ──────────────────────────────────────────────

#[test]
fn write_lost_before_ack_is_applied_once_after_snapshot_reconnect() {
    let mut authority = Authority::default();
    let mut replica = joined(&authority, 1);

    replica.set(NodeId::ROOT, "value", 1).unwrap();
    // the op reaches the server but the connection drops before the ack
    for op in replica.take_outbox() {
        authority.receive(op, 0).unwrap();
    }

    replica.rebind(ClientId(2));
    replica.load_snapshot(authority.snapshot()).unwrap();
    for op in replica.resend_pending() {
        let receipt = authority.receive(op, replica.clock()).unwrap();
        assert!(matches!(receipt, Receipt::Duplicate { .. }));
        replica.apply_ack(receipt.op_id(), receipt.clock());
    }

    assert!(!replica.has_pending());
    assert_eq!(authority.log().len(), 1);
    assert_eq!(value_of(&replica.snapshot(), "value"), Some(Value::from(1)));
    assert_eq!(replica.snapshot(), authority.tree().snapshot());
}

#[test]
fn write_lost_before_ack_is_resolved_by_incremental_replay() {
    let mut authority = Authority::default();
    let mut replica = joined(&authority, 1);

    replica
        .set(NodeId::ROOT, "items", Init::list([Init::scalar("a")]))
        .unwrap();
    for op in replica.take_outbox() {
        authority.receive(op, 0).unwrap();
    }

    replica.rebind(ClientId(2));
    for op in authority.missing_since(replica.clock()).unwrap() {
        replica.apply_remote(op);
    }
    assert!(!replica.has_pending());
    assert!(replica.resend_pending().is_empty());
    assert_eq!(replica.snapshot(), authority.tree().snapshot());
    assert_eq!(
        replica.snapshot().get("items").map(Snapshot::len),
        Some(1)
    );
}

#[test]
fn repeated_ack_is_ignored() {
    let mut authority = Authority::default();
    let mut replica = joined(&authority, 1);
    replica.set(NodeId::ROOT, "value", 1).unwrap();
    let op = replica.take_outbox().remove(0);
    let receipt = authority.receive(op, 0).unwrap();

    replica.apply_ack(receipt.op_id(), receipt.clock());
    let once = replica.snapshot();
    replica.apply_ack(receipt.op_id(), receipt.clock());
    assert_eq!(replica.snapshot(), once);
    assert_eq!(replica.clock(), 1);
}
