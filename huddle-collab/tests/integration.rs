//! Integration tests for end-to-end WebSocket sync.
//!
//! These tests start a real server and connect real clients, either
//! through [`SyncClient`] or as raw sockets speaking frames directly.

use std::time::{Duration, SystemTime};

use futures_util::{SinkExt, StreamExt};
use huddle_collab::{
    ClientSettings, CloseReason, ConnectionState, Frame, Grant, RoomEvent, ServerConfig, SyncClient, SyncServer,
};
use huddle_core::{ConflictReason, Init, NodeId, Presence, Replica, Snapshot, Value};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const WAIT: Duration = Duration::from_secs(3);

fn test_config() -> ServerConfig {
    ServerConfig {
        bind_addr: "127.0.0.1:0".into(),
        maintenance_interval_ms: 50,
        tickets: vec![
            Grant::new("writer", &["board-*"], true),
            Grant::new("viewer", &["board-*"], false),
            Grant::new("stale", &["board-*"], true).expiring_at(SystemTime::UNIX_EPOCH + Duration::from_secs(60)),
        ],
        ..ServerConfig::default()
    }
}

/// Start a server on an ephemeral port, return it with its ws:// URL.
async fn start_server(config: ServerConfig) -> (SyncServer, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let server = SyncServer::from_config(config).unwrap();
    server.spawn_maintenance();
    let serving = server.clone();
    tokio::spawn(async move {
        serving.serve(listener).await.unwrap();
    });
    (server, url)
}

fn presence(name: &str) -> Presence {
    Presence::from([("name".to_string(), Value::from(name))])
}

fn fast_client_settings() -> ClientSettings {
    ClientSettings {
        presence_throttle: Duration::from_millis(5),
        ping_interval: Duration::from_millis(50),
        backoff_base: Duration::from_millis(20),
        backoff_max: Duration::from_millis(200),
    }
}

async fn connect_client(url: &str, room: &str, ticket: &str, name: &str) -> (SyncClient, tokio::sync::mpsc::Receiver<RoomEvent>) {
    let mut client = SyncClient::new(url, room, ticket, fast_client_settings(), presence(name));
    let mut events = client.take_event_rx().unwrap();
    client.start();
    wait_event(&mut events, |e| matches!(e, RoomEvent::Joined { .. })).await;
    (client, events)
}

async fn wait_event(
    events: &mut tokio::sync::mpsc::Receiver<RoomEvent>,
    mut pred: impl FnMut(&RoomEvent) -> bool,
) -> RoomEvent {
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn wait_snapshot(client: &SyncClient, mut pred: impl FnMut(&Snapshot) -> bool) {
    timeout(WAIT, async {
        while !pred(&client.snapshot().await) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for storage");
}

async fn open_raw(url: &str, room: &str, ticket: &str) -> Socket {
    let (socket, _) = tokio_tungstenite::connect_async(huddle_collab::join_url(url, room, ticket))
        .await
        .unwrap();
    socket
}

async fn send(socket: &mut Socket, frame: Frame) {
    socket.send(Message::Binary(frame.encode().unwrap().into())).await.unwrap();
}

/// Next frame matching `pred`, skipping others.
async fn next_frame(socket: &mut Socket, mut pred: impl FnMut(&Frame) -> bool) -> Frame {
    timeout(WAIT, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Binary(data))) => {
                    let frame = Frame::decode(&data).unwrap();
                    if pred(&frame) {
                        return frame;
                    }
                }
                Some(Ok(Message::Close(frame))) => panic!("closed while waiting: {frame:?}"),
                Some(Ok(_)) => {}
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for frame")
}

/// Close code the server ends the socket with.
async fn close_code(socket: &mut Socket) -> Option<u16> {
    timeout(WAIT, async {
        loop {
            match socket.next().await {
                Some(Ok(Message::Close(frame))) => return frame.map(|f| u16::from(f.code)),
                Some(Ok(_)) => {}
                _ => return None,
            }
        }
    })
    .await
    .expect("timed out waiting for close")
}

/// Join as a raw socket; returns the socket and its `ROOM_STATE`.
async fn join_raw(url: &str, room: &str, ticket: &str) -> (Socket, Frame) {
    let mut socket = open_raw(url, room, ticket).await;
    send(
        &mut socket,
        Frame::PresenceUpdate {
            connection_id: None,
            presence: presence("raw"),
            seq: 1,
        },
    )
    .await;
    let state = next_frame(&mut socket, |f| matches!(f, Frame::RoomState { .. })).await;
    (socket, state)
}

#[tokio::test]
async fn test_two_clients_converge() {
    let (_server, url) = start_server(test_config()).await;
    let (alice, _alice_events) = connect_client(&url, "board-1", "writer", "alice").await;
    let (bob, mut bob_events) = connect_client(&url, "board-1", "writer", "bob").await;

    alice
        .mutate(|r| r.set(NodeId::ROOT, "title", "Roadmap"))
        .await
        .unwrap();
    bob.mutate(|r| r.set(NodeId::ROOT, "items", Init::list([Init::scalar(1)])))
        .await
        .unwrap();

    for client in [&alice, &bob] {
        wait_snapshot(client, |s| {
            s.get("title").and_then(Snapshot::as_scalar) == Some(&Value::from("Roadmap"))
                && s.get("items").map(Snapshot::len) == Some(1)
        })
        .await;
    }
    assert_eq!(alice.snapshot().await, bob.snapshot().await);
    assert!(matches!(
        wait_event(&mut bob_events, |e| matches!(e, RoomEvent::StorageChanged)).await,
        RoomEvent::StorageChanged
    ));
}

#[tokio::test]
async fn test_late_joiner_fetches_storage() {
    let (_server, url) = start_server(test_config()).await;
    let (alice, _events) = connect_client(&url, "board-late", "writer", "alice").await;
    alice.mutate(|r| r.set(NodeId::ROOT, "value", 7)).await.unwrap();
    wait_snapshot(&alice, |s| s.get("value").is_some()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (carol, _carol_events) = connect_client(&url, "board-late", "writer", "carol").await;
    wait_snapshot(&carol, |s| s.get("value").and_then(Snapshot::as_scalar) == Some(&Value::from(7))).await;
}

#[tokio::test]
async fn test_peers_see_join_presence_and_leave() {
    let (_server, url) = start_server(test_config()).await;
    let (mut alice, mut alice_events) = connect_client(&url, "board-peers", "writer", "alice").await;
    let (mut bob, _bob_events) = connect_client(&url, "board-peers", "writer", "bob").await;

    let joined = wait_event(&mut alice_events, |e| matches!(e, RoomEvent::PeerJoined(_))).await;
    let RoomEvent::PeerJoined(bob_id) = joined else { unreachable!() };

    bob.update_presence(presence("robert"), false).await.unwrap();
    wait_event(&mut alice_events, |e| *e == RoomEvent::PresenceChanged(bob_id)).await;
    {
        let room = alice.room().lock().await;
        let peer = room.peers().peer(&bob_id).unwrap();
        assert_eq!(peer.presence, presence("robert"));
    }

    bob.leave().await;
    wait_event(&mut alice_events, |e| *e == RoomEvent::PeerLeft(bob_id)).await;
    alice.leave().await;
}

#[tokio::test]
async fn test_resent_op_is_applied_once() {
    let (server, url) = start_server(test_config()).await;
    let (mut socket, state) = join_raw(&url, "board-dup", "writer").await;
    let Frame::RoomState { client_id, .. } = state else { unreachable!() };

    let mut replica = Replica::new(client_id);
    replica.set(NodeId::ROOT, "items", Init::list([])).unwrap();
    let list = replica.tree().child(NodeId::ROOT, "items").unwrap();
    replica.list_push(list, "card").unwrap();
    let ops = replica.take_outbox();
    assert_eq!(ops.len(), 2);

    for op in &ops {
        send(&mut socket, Frame::StorageOp { op: op.clone(), clock: 0 }).await;
        next_frame(&mut socket, |f| matches!(f, Frame::StorageAck { .. })).await;
    }
    socket.close(None).await.unwrap();

    // Reconnect and resend the push as if its ack had been lost.
    let (mut socket, _) = join_raw(&url, "board-dup", "writer").await;
    send(&mut socket, Frame::StorageOp { op: ops[1].clone(), clock: 0 }).await;
    let ack = next_frame(&mut socket, |f| matches!(f, Frame::StorageAck { .. })).await;
    assert_eq!(
        ack,
        Frame::StorageAck {
            op_id: ops[1].id,
            server_clock: 2
        }
    );

    let room = server.registry().get("board-dup").await.unwrap();
    assert_eq!(room.clock().await, 2);
    assert_eq!(room.view().await.get("items").map(Snapshot::len), Some(1));
}

#[tokio::test]
async fn test_read_only_ops_rejected() {
    let (_server, url) = start_server(test_config()).await;
    let (mut socket, state) = join_raw(&url, "board-ro", "viewer").await;
    let Frame::RoomState { client_id, can_write, .. } = state else { unreachable!() };
    assert!(!can_write);

    let mut replica = Replica::new(client_id);
    replica.set(NodeId::ROOT, "value", 1).unwrap();
    let op = replica.take_outbox().remove(0);
    let op_id = op.id;
    send(&mut socket, Frame::StorageOp { op, clock: 0 }).await;

    let rejected = next_frame(&mut socket, |f| matches!(f, Frame::StorageRejected { .. })).await;
    assert_eq!(
        rejected,
        Frame::StorageRejected {
            op_id,
            reason: ConflictReason::NotAllowed
        }
    );
}

#[tokio::test]
async fn test_admission_refusals_close_with_codes() {
    let (server, url) = start_server(test_config()).await;

    let mut socket = open_raw(&url, "board-x", "nobody").await;
    assert_eq!(close_code(&mut socket).await, Some(CloseReason::NotAllowed.code()));

    let mut socket = open_raw(&url, "board-x", "stale").await;
    assert_eq!(close_code(&mut socket).await, Some(CloseReason::ExpiredTicket.code()));

    let (mut socket, _) = tokio_tungstenite::connect_async(format!("{url}/?ticket=writer")).await.unwrap();
    assert_eq!(close_code(&mut socket).await, Some(CloseReason::RoomNotFound.code()));

    assert_eq!(server.stats().rejected_connections, 3);
    assert_eq!(server.registry().room_count().await, 0);
}

#[tokio::test]
async fn test_missing_initial_presence_times_out() {
    let config = ServerConfig {
        auth_timeout_ms: 100,
        ..test_config()
    };
    let (_server, url) = start_server(config).await;
    let mut socket = open_raw(&url, "board-slow", "writer").await;
    assert_eq!(close_code(&mut socket).await, Some(CloseReason::AuthTimeout.code()));
}

#[tokio::test]
async fn test_full_room_refuses_retryably() {
    let config = ServerConfig {
        max_sessions_per_room: 1,
        ..test_config()
    };
    let (_server, url) = start_server(config).await;
    let (_first, _) = join_raw(&url, "board-full", "writer").await;

    let mut second = open_raw(&url, "board-full", "writer").await;
    send(
        &mut second,
        Frame::PresenceUpdate {
            connection_id: None,
            presence: Presence::new(),
            seq: 1,
        },
    )
    .await;
    let code = close_code(&mut second).await.unwrap();
    assert_eq!(code, CloseReason::RoomUnavailable.code());
    assert!(CloseReason::from_code(code).unwrap().is_retryable());
}

#[tokio::test]
async fn test_silent_session_times_out() {
    let config = ServerConfig {
        heartbeat_timeout_ms: 500,
        ..test_config()
    };
    let (_server, url) = start_server(config).await;
    let (mut silent, state) = join_raw(&url, "board-hb", "writer").await;
    let Frame::RoomState { connection_id, .. } = state else { unreachable!() };

    let (_bob, mut bob_events) = connect_client(&url, "board-hb", "writer", "bob").await;
    wait_event(&mut bob_events, |e| *e == RoomEvent::PeerLeft(connection_id)).await;

    assert_eq!(close_code(&mut silent).await, Some(CloseReason::HeartbeatTimeout.code()));
}

#[tokio::test]
async fn test_client_reconnects_after_server_close() {
    let (server, url) = start_server(test_config()).await;
    let (client, mut events) = connect_client(&url, "board-re", "writer", "alice").await;
    client.mutate(|r| r.set(NodeId::ROOT, "value", 1)).await.unwrap();
    wait_snapshot(&client, |s| s.get("value").is_some()).await;

    assert!(server.registry().close_room("board-re").await);

    let disconnected = wait_event(&mut events, |e| matches!(e, RoomEvent::Disconnected { .. })).await;
    assert_eq!(
        disconnected,
        RoomEvent::Disconnected {
            reason: Some(CloseReason::ServerShutdown),
            will_retry: true
        }
    );
    wait_event(&mut events, |e| matches!(e, RoomEvent::Reconnecting { .. })).await;
    wait_event(&mut events, |e| matches!(e, RoomEvent::Joined { .. })).await;
    assert_eq!(client.connection_state().await, ConnectionState::Joined);
    assert_eq!(
        client.snapshot().await.get("value").and_then(Snapshot::as_scalar),
        Some(&Value::from(1))
    );
}

#[tokio::test]
async fn test_edits_while_disconnected_are_sent_after_rejoin() {
    let (server, url) = start_server(test_config()).await;
    let (writer, mut events) = connect_client(&url, "board-offline", "writer", "w").await;
    let (observer, _observer_events) = connect_client(&url, "board-offline", "writer", "o").await;

    server.registry().close_room("board-offline").await;
    wait_event(&mut events, |e| matches!(e, RoomEvent::Disconnected { .. })).await;

    // The closed room is replaced by a fresh one on reconnect.
    writer.mutate(|r| r.set(NodeId::ROOT, "offline", true)).await.unwrap();
    wait_event(&mut events, |e| matches!(e, RoomEvent::Joined { .. })).await;
    wait_snapshot(&observer, |s| s.get("offline").is_some()).await;
}
