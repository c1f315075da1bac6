//! Persistence integration tests.
//!
//! Exercise the full save/load cycle: rooms are written through the
//! registry, evicted or shut down, and loaded again from RocksDB.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use huddle_collab::{
    Disconnect, Frame, Persistence, PersistenceError, RocksPersistence, RoomRegistry, RoomSession, RoomSettings,
    StoreConfig, Ticket,
};
use huddle_core::{ClientId, Init, NodeId, Presence, Replica, Snapshot, StorageSnapshot, Value};
use tempfile::tempdir;

fn settings() -> RoomSettings {
    RoomSettings {
        eviction_grace: Duration::ZERO,
        ..RoomSettings::default()
    }
}

fn ticket(room_id: &str) -> Ticket {
    Ticket {
        room_id: room_id.to_string(),
        user: None,
        can_write: true,
        expires_at: None,
    }
}

/// Join, apply `edit` as one client, then leave. Returns the client id used.
async fn edit_room(room: &RoomSession, edit: impl FnOnce(&mut Replica)) -> ClientId {
    let admission = room.admit(&ticket(room.room_id()), Presence::new()).await.unwrap();
    let mut replica = Replica::new(admission.client_id);
    replica.load_snapshot(room.snapshot().await).unwrap();
    edit(&mut replica);
    for op in replica.take_outbox() {
        room.handle_frame(admission.session_key, Frame::StorageOp { op, clock: 0 })
            .await
            .unwrap();
    }
    room.leave(admission.session_key, Disconnect::Terminal).await;
    admission.client_id
}

fn scalar(snapshot: &Snapshot, key: &str) -> Option<Value> {
    snapshot.get(key).and_then(Snapshot::as_scalar).cloned()
}

/// Loads nothing, fails every save.
struct ReadOnlyDisk;

impl Persistence for ReadOnlyDisk {
    fn load<'a>(&'a self, _room_id: &'a str) -> BoxFuture<'a, Result<Option<StorageSnapshot>, PersistenceError>> {
        Box::pin(async { Ok::<_, PersistenceError>(None) })
    }

    fn save<'a>(&'a self, _room_id: &'a str, _snapshot: StorageSnapshot) -> BoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async { Err::<(), _>(PersistenceError::Backend("disk is read-only".into())) })
    }
}

#[tokio::test]
async fn test_evicted_room_reloads_from_rocks() {
    let dir = tempdir().unwrap();
    let persistence = Arc::new(RocksPersistence::open(StoreConfig::for_testing(dir.path())).unwrap());
    let registry = RoomRegistry::new(settings(), persistence.clone());

    let room = registry.get_or_create("plan").await;
    let first_client = edit_room(&room, |r| {
        r.set(NodeId::ROOT, "title", "Q3 plan").unwrap();
        r.set(NodeId::ROOT, "lanes", Init::list([Init::scalar("todo"), Init::scalar("done")]))
            .unwrap();
    })
    .await;

    assert_eq!(registry.evict_idle(Instant::now()).await, vec!["plan".to_string()]);
    let meta = persistence.store().load_metadata("plan").unwrap().unwrap();
    assert_eq!(meta.clock, 2);

    let reloaded = registry.get_or_create("plan").await;
    assert!(!Arc::ptr_eq(&room, &reloaded));
    let second_client = edit_room(&reloaded, |_| {}).await;
    assert!(second_client > first_client);

    let view = reloaded.view().await;
    assert_eq!(scalar(&view, "title"), Some(Value::from("Q3 plan")));
    assert_eq!(view.get("lanes").map(Snapshot::len), Some(2));
    assert_eq!(reloaded.clock().await, 2);
}

#[tokio::test]
async fn test_rooms_survive_restart() {
    let dir = tempdir().unwrap();

    {
        let persistence = Arc::new(RocksPersistence::open(StoreConfig::for_testing(dir.path())).unwrap());
        let registry = RoomRegistry::new(RoomSettings::default(), persistence);
        for (room_id, value) in [("alpha", 1), ("beta", 2)] {
            let room = registry.get_or_create(room_id).await;
            edit_room(&room, |r| r.set(NodeId::ROOT, "value", value).unwrap()).await;
        }
        registry.shutdown().await;
    }

    let persistence = Arc::new(RocksPersistence::open(StoreConfig::for_testing(dir.path())).unwrap());
    let mut stored = persistence.store().list_rooms().unwrap();
    stored.sort();
    assert_eq!(stored, vec!["alpha".to_string(), "beta".to_string()]);

    let registry = RoomRegistry::new(RoomSettings::default(), persistence);
    for (room_id, value) in [("alpha", 1), ("beta", 2)] {
        let room = registry.get_or_create(room_id).await;
        room.admit(&ticket(room_id), Presence::new()).await.unwrap();
        assert_eq!(scalar(&room.view().await, "value"), Some(Value::from(value)));
    }
}

#[tokio::test]
async fn test_tombstones_collected_before_save() {
    let dir = tempdir().unwrap();
    let persistence = Arc::new(RocksPersistence::open(StoreConfig::for_testing(dir.path())).unwrap());
    let registry = RoomRegistry::new(settings(), persistence.clone());

    let room = registry.get_or_create("scratch").await;
    edit_room(&room, |r| r.set(NodeId::ROOT, "draft", Init::object([("n", Init::scalar(1))])).unwrap()).await;
    edit_room(&room, |r| r.delete_key(NodeId::ROOT, "draft").unwrap()).await;

    registry.evict_idle(Instant::now()).await;
    let stored = persistence.store().load_snapshot("scratch").unwrap().unwrap();
    assert_eq!(stored.clock, 2);
    assert!(stored.node_count() < 3, "tombstoned nodes should not be saved");
}

#[tokio::test]
async fn test_failed_save_still_evicts() {
    let registry = RoomRegistry::new(settings(), Arc::new(ReadOnlyDisk));
    let room = registry.get_or_create("doomed").await;
    edit_room(&room, |r| r.set(NodeId::ROOT, "value", 1).unwrap()).await;

    assert_eq!(registry.evict_idle(Instant::now()).await, vec!["doomed".to_string()]);
    assert_eq!(registry.room_count().await, 0);

    // The edit is lost; the next instance starts empty.
    let fresh = registry.get_or_create("doomed").await;
    fresh.admit(&ticket("doomed"), Presence::new()).await.unwrap();
    assert_eq!(scalar(&fresh.view().await, "value"), None);
    assert_eq!(fresh.clock().await, 0);
}

#[tokio::test]
async fn test_unloaded_room_is_not_saved() {
    let dir = tempdir().unwrap();
    let persistence = Arc::new(RocksPersistence::open(StoreConfig::for_testing(dir.path())).unwrap());
    let registry = RoomRegistry::new(settings(), persistence.clone());

    registry.get_or_create("never-joined").await;
    assert_eq!(registry.evict_idle(Instant::now()).await.len(), 1);
    assert!(persistence.store().load_snapshot("never-joined").unwrap().is_none());
}
