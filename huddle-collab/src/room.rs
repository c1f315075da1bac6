//! One live room: authoritative storage plus the sessions attached to it.
//!
//! ```text
//!   reader task ──handle_frame──▶ ┌──────────────────────────┐
//!   reader task ──handle_frame──▶ │ Mutex<RoomState>         │
//!                                 │  Authority (tree, log)   │
//!   maintenance ──sweep─────────▶ │  sessions ─┬─ outbound ──┼──▶ writer task
//!                                 │            └─ outbound ──┼──▶ writer task
//!                                 └──────────────────────────┘
//! ```
//!
//! Every mutation and every fan-out happens under the room mutex, so all
//! sessions observe frames in the same order. Nothing awaits while holding
//! it except other room-local work; persistence calls run outside.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use huddle_core::{
    Authority, ClientId, ConflictReason, Operation, Presence, Receipt, Snapshot, StorageSnapshot, Value,
};
use tokio::sync::{Mutex, OnceCell};

use crate::auth::{AuthError, Ticket};
use crate::broadcast::{encode_shared, AtomicBroadcastStats, BroadcastStats, OutboundReceiver, SendError};
use crate::config::RoomSettings;
use crate::error::SyncError;
use crate::persistence::{Persistence, PersistenceError};
use crate::protocol::{CloseReason, ConnectionId, Frame, PeerState, ProtocolError};
use crate::session::{ConnectionState, Disconnect, Session, SessionKey};

/// What a successful [`RoomSession::admit`] hands back to the transport.
#[derive(Debug)]
pub struct Admission {
    pub session_key: SessionKey,
    pub connection_id: ConnectionId,
    pub client_id: ClientId,
    pub can_write: bool,
    /// Drained by the connection's writer task.
    pub outbound: OutboundReceiver,
}

/// How a session leaves the room.
#[derive(Debug, Clone, Copy)]
enum Exit {
    /// Tell the writer to close the socket with this code.
    Close(CloseReason),
    /// Drop the queue; the transport is already gone or leaving cleanly.
    Detach(Disconnect),
}

#[derive(Debug)]
struct RoomState {
    authority: Authority,
    sessions: HashMap<SessionKey, Session>,
    next_client: u32,
    /// Set while no session is attached.
    idle_since: Option<Instant>,
    /// Eviction started; admissions are refused.
    closing: bool,
    /// Clock of the last successfully persisted snapshot.
    saved_clock: u64,
    /// Client allocation covered by the last persisted snapshot.
    saved_client: ClientId,
    ops_since_gc: u64,
}

pub struct RoomSession {
    room_id: String,
    settings: RoomSettings,
    persistence: Arc<dyn Persistence>,
    loaded: OnceCell<()>,
    state: Mutex<RoomState>,
    stats: AtomicBroadcastStats,
}

impl std::fmt::Debug for RoomSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomSession")
            .field("room_id", &self.room_id)
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

fn validate_presence(presence: &Presence) -> Result<(), ProtocolError> {
    presence
        .values()
        .try_for_each(Value::validate)
        .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))
}

impl RoomSession {
    pub fn new(room_id: impl Into<String>, settings: RoomSettings, persistence: Arc<dyn Persistence>) -> Self {
        let state = RoomState {
            authority: Authority::new(settings.replay_window),
            sessions: HashMap::new(),
            next_client: 1,
            idle_since: Some(Instant::now()),
            closing: false,
            saved_clock: 0,
            saved_client: ClientId::SERVER,
            ops_since_gc: 0,
        };
        Self {
            room_id: room_id.into(),
            settings,
            persistence,
            loaded: OnceCell::new(),
            state: Mutex::new(state),
            stats: AtomicBroadcastStats::default(),
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    /// Whether the persisted snapshot has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.loaded.initialized()
    }

    pub fn stats(&self) -> BroadcastStats {
        self.stats.snapshot()
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn clock(&self) -> u64 {
        self.state.lock().await.authority.clock()
    }

    pub async fn is_closing(&self) -> bool {
        self.state.lock().await.closing
    }

    /// Persistable dump of the authoritative tree.
    pub async fn snapshot(&self) -> StorageSnapshot {
        self.state.lock().await.authority.snapshot()
    }

    /// Readable view of the authoritative tree.
    pub async fn view(&self) -> Snapshot {
        self.state.lock().await.authority.tree().snapshot()
    }

    pub async fn peers(&self) -> Vec<PeerState> {
        let state = self.state.lock().await;
        let mut peers: Vec<PeerState> = state.sessions.values().map(Session::peer_state).collect();
        peers.sort_by_key(|p| p.client_id);
        peers
    }

    /// Load the persisted snapshot once. Failures are not cached, so the
    /// next admission tries again.
    async fn ensure_loaded(&self) -> Result<(), SyncError> {
        self.loaded.get_or_try_init(|| self.load()).await?;
        Ok(())
    }

    async fn load(&self) -> Result<(), SyncError> {
        let failure = |source| SyncError::PersistenceFailure {
            room_id: self.room_id.clone(),
            source,
        };

        let loaded = tokio::time::timeout(self.settings.persistence_timeout, self.persistence.load(&self.room_id))
            .await
            .unwrap_or(Err(PersistenceError::Timeout))
            .map_err(failure)?;

        let Some(snapshot) = loaded else {
            log::debug!("Room {} starts empty", self.room_id);
            return Ok(());
        };

        let authority = Authority::from_snapshot(snapshot, self.settings.replay_window)
            .map_err(|e| failure(PersistenceError::Encoding(e.to_string())))?;

        let mut state = self.state.lock().await;
        let first_free = authority.max_client().0.saturating_add(1);
        state.next_client = state.next_client.max(first_free);
        state.saved_clock = authority.clock();
        state.saved_client = authority.max_client();
        log::info!(
            "Room {} restored at clock {} ({} nodes)",
            self.room_id,
            authority.clock(),
            authority.tree().node_count()
        );
        state.authority = authority;
        Ok(())
    }

    /// Admit a connection holding `ticket`.
    pub async fn admit(&self, ticket: &Ticket, initial_presence: Presence) -> Result<Admission, SyncError> {
        if ticket.room_id != self.room_id {
            return Err(AuthError::NotAllowed.into());
        }
        if ticket.is_expired(SystemTime::now()) {
            return Err(AuthError::Expired.into());
        }
        validate_presence(&initial_presence)?;

        if let Err(e) = self.ensure_loaded().await {
            log::error!("{e}");
            return Err(e);
        }

        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if state.closing {
            return Err(SyncError::RoomUnavailable(self.room_id.clone()));
        }
        if state.sessions.len() >= self.settings.max_sessions {
            log::warn!("Room {} is full ({} sessions)", self.room_id, state.sessions.len());
            return Err(SyncError::RoomUnavailable(self.room_id.clone()));
        }

        let client_id = ClientId(state.next_client);
        state.next_client = state.next_client.saturating_add(1);
        state.authority.reserve_client(client_id);

        let (tx, outbound) = crate::broadcast::outbound_queue(self.settings.outbound_queue_capacity);
        let mut session = Session::new(client_id, ticket.can_write, initial_presence.clone(), tx, now);
        session.transition(ConnectionState::Joined)?;

        let mut peers: Vec<PeerState> = state.sessions.values().map(Session::peer_state).collect();
        peers.sort_by_key(|p| p.client_id);
        let welcome = Frame::RoomState {
            connection_id: session.connection_id,
            client_id,
            can_write: session.can_write,
            clock: state.authority.clock(),
            peers,
        };
        session
            .send(encode_shared(&welcome)?)
            .map_err(|e| SyncError::Transport(e.to_string()))?;

        let session_key = session.key;
        let connection_id = session.connection_id;
        state.sessions.insert(session_key, session);
        state.idle_since = None;

        let joined = Frame::PeerJoined {
            connection_id,
            client_id,
            initial_presence,
        };
        self.fan_out(state, Some(session_key), &joined, now)?;

        log::info!(
            "Room {}: client {} joined as {} ({} sessions, user {:?})",
            self.room_id,
            client_id,
            connection_id,
            state.sessions.len(),
            ticket.user
        );

        Ok(Admission {
            session_key,
            connection_id,
            client_id,
            can_write: ticket.can_write,
            outbound,
        })
    }

    /// Route one inbound frame from `key`.
    pub async fn handle_frame(&self, key: SessionKey, frame: Frame) -> Result<(), SyncError> {
        let now = Instant::now();
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        let session = state.sessions.get_mut(&key).ok_or(SyncError::UnknownSession(key))?;
        session.touch(now);
        log::trace!("Room {}: {} from {}", self.room_id, frame.kind(), session.client_id);

        match frame {
            Frame::PresenceUpdate { presence, seq, .. } => {
                validate_presence(&presence)?;
                if !session.set_presence(presence.clone(), seq) {
                    log::trace!("Room {}: stale presence seq {} from {}", self.room_id, seq, key);
                    return Ok(());
                }
                let relay = Frame::PresenceUpdate {
                    connection_id: Some(session.connection_id),
                    presence,
                    seq,
                };
                self.fan_out(state, Some(key), &relay, now)
            }
            Frame::StorageOp { op, clock } => self.receive_op(state, key, op, clock, now),
            Frame::FetchStorage { last_clock } => self.fetch(state, key, last_clock, now),
            Frame::Ping => self.send_to(state, key, &Frame::Pong, now),
            Frame::Pong => Ok(()),
            Frame::Leave => {
                self.remove_sessions(state, vec![(key, Exit::Detach(Disconnect::Terminal))], now);
                Ok(())
            }
            other => Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
        }
    }

    fn receive_op(
        &self,
        state: &mut RoomState,
        key: SessionKey,
        op: Operation,
        client_clock: u64,
        now: Instant,
    ) -> Result<(), SyncError> {
        let head = state.authority.clock();
        let session = state.sessions.get_mut(&key).ok_or(SyncError::UnknownSession(key))?;
        session.saw_clock(client_clock.min(head));

        let op_id = op.id;
        if !session.can_write {
            log::debug!("Room {}: read-only client {} sent {}", self.room_id, session.client_id, op_id);
            let reply = Frame::StorageRejected {
                op_id,
                reason: ConflictReason::NotAllowed,
            };
            return self.send_to(state, key, &reply, now);
        }

        match state.authority.receive(op, client_clock) {
            Ok(Receipt::Sequenced { op, .. }) => {
                let clock = op.clock;
                let ack = Frame::StorageAck {
                    op_id,
                    server_clock: clock,
                };
                self.send_to(state, key, &ack, now)?;
                self.fan_out(state, Some(key), &Frame::StorageOp { op, clock }, now)?;
                for session in state.sessions.values_mut() {
                    session.delivered(clock);
                }
                state.ops_since_gc += 1;
                self.maybe_collect_garbage(state);
                Ok(())
            }
            Ok(Receipt::Duplicate { clock, .. }) => {
                let ack = Frame::StorageAck {
                    op_id,
                    server_clock: clock,
                };
                self.send_to(state, key, &ack, now)
            }
            Err(conflict) => {
                let reason = conflict.reason;
                log::debug!("Room {}: {}", self.room_id, SyncError::ConflictRejected(conflict));
                self.send_to(state, key, &Frame::StorageRejected { op_id, reason }, now)
            }
        }
    }

    /// Answer `FETCH_STORAGE` with the missing ops, or with the whole tree
    /// when the log no longer reaches back or the ops would not fit the
    /// session's queue.
    fn fetch(&self, state: &mut RoomState, key: SessionKey, last_clock: u64, now: Instant) -> Result<(), SyncError> {
        let head = state.authority.clock();
        let session = state.sessions.get_mut(&key).ok_or(SyncError::UnknownSession(key))?;
        session.saw_clock(last_clock.min(head));
        let room_left = session.queue_capacity();

        let replay = if last_clock > head {
            log::warn!(
                "Room {}: client {} is ahead of the room ({} > {})",
                self.room_id,
                session.client_id,
                last_clock,
                head
            );
            None
        } else {
            match state.authority.missing_since(last_clock) {
                Ok(ops) if ops.len() < room_left => Some(ops),
                Ok(ops) => {
                    log::debug!("Room {}: {} missing ops exceed the queue", self.room_id, ops.len());
                    None
                }
                Err(gap) => {
                    log::debug!("Room {}: {}", self.room_id, SyncError::ReplayGapExceeded(gap));
                    None
                }
            }
        };

        match replay {
            Some(ops) => {
                for op in ops {
                    let clock = op.clock;
                    self.send_to(state, key, &Frame::StorageOp { op, clock }, now)?;
                }
            }
            None => {
                let frame = Frame::FullSnapshot {
                    tree: state.authority.snapshot(),
                    clock: head,
                };
                self.send_to(state, key, &frame, now)?;
            }
        }
        // Caught up to head once the queue drains.
        if let Some(session) = state.sessions.get_mut(&key) {
            session.saw_clock(head);
        }
        Ok(())
    }

    fn maybe_collect_garbage(&self, state: &mut RoomState) {
        if self.settings.gc_every_ops == 0 || state.ops_since_gc < self.settings.gc_every_ops {
            return;
        }
        state.ops_since_gc = 0;
        if let Some(acked) = state.sessions.values().map(Session::last_seen_clock).min() {
            state.authority.collect_garbage(acked);
        }
    }

    /// Disconnect sessions silent for longer than the heartbeat timeout.
    /// Returns the keys that were dropped.
    pub async fn sweep(&self, now: Instant) -> Vec<SessionKey> {
        let mut guard = self.state.lock().await;
        let silent: Vec<SessionKey> = guard
            .sessions
            .values()
            .filter(|s| s.is_silent(now, self.settings.heartbeat_timeout))
            .map(|s| s.key)
            .collect();
        if !silent.is_empty() {
            let exits = silent
                .iter()
                .map(|key| (*key, Exit::Close(CloseReason::HeartbeatTimeout)))
                .collect();
            self.remove_sessions(&mut guard, exits, now);
        }
        silent
    }

    /// Detach a session whose transport ended. Returns `false` if the room
    /// had already dropped it.
    pub async fn leave(&self, key: SessionKey, kind: Disconnect) -> bool {
        let mut guard = self.state.lock().await;
        if !guard.sessions.contains_key(&key) {
            return false;
        }
        self.remove_sessions(&mut guard, vec![(key, Exit::Detach(kind))], Instant::now());
        true
    }

    /// Drop a session and have its writer close the socket with `reason`.
    pub async fn close_session(&self, key: SessionKey, reason: CloseReason) -> bool {
        let mut guard = self.state.lock().await;
        if !guard.sessions.contains_key(&key) {
            return false;
        }
        self.remove_sessions(&mut guard, vec![(key, Exit::Close(reason))], Instant::now());
        true
    }

    /// Mark the room closing if it has been empty for the eviction grace
    /// period. Once this returns `true` no session is admitted again.
    pub async fn try_begin_eviction(&self, now: Instant) -> bool {
        let mut guard = self.state.lock().await;
        if guard.closing || !guard.sessions.is_empty() {
            return false;
        }
        let idle = guard
            .idle_since
            .is_some_and(|since| now.saturating_duration_since(since) >= self.settings.eviction_grace);
        if idle {
            guard.closing = true;
        }
        idle
    }

    /// Save the snapshot if its clock or client allocation changed since the
    /// last save. Returns whether anything was written.
    pub async fn persist(&self) -> Result<bool, SyncError> {
        if !self.is_loaded() {
            return Ok(false);
        }
        let snapshot = {
            let mut guard = self.state.lock().await;
            let head = guard.authority.clock();
            if head <= guard.saved_clock && guard.authority.max_client() <= guard.saved_client {
                return Ok(false);
            }
            if guard.sessions.is_empty() {
                guard.authority.collect_garbage(head);
            }
            guard.authority.snapshot()
        };
        let clock = snapshot.clock;
        let max_client = snapshot.max_client;

        tokio::time::timeout(
            self.settings.persistence_timeout,
            self.persistence.save(&self.room_id, snapshot),
        )
        .await
        .unwrap_or(Err(PersistenceError::Timeout))
        .map_err(|source| SyncError::PersistenceFailure {
            room_id: self.room_id.clone(),
            source,
        })?;

        let mut guard = self.state.lock().await;
        guard.saved_clock = guard.saved_clock.max(clock);
        guard.saved_client = guard.saved_client.max(max_client);
        log::info!("Room {} persisted at clock {}", self.room_id, clock);
        Ok(true)
    }

    /// Close every session with `server_shutdown` and refuse new ones.
    pub async fn shutdown(&self) {
        let mut guard = self.state.lock().await;
        guard.closing = true;
        let exits = guard
            .sessions
            .keys()
            .map(|key| (*key, Exit::Close(CloseReason::ServerShutdown)))
            .collect();
        self.remove_sessions(&mut guard, exits, Instant::now());
    }

    /// Send to every joined session except `except`. Sessions whose queue is
    /// full are disconnected as slow consumers.
    fn fan_out(
        &self,
        state: &mut RoomState,
        except: Option<SessionKey>,
        frame: &Frame,
        now: Instant,
    ) -> Result<(), SyncError> {
        let bytes = encode_shared(frame)?;
        let slow = self.deliver(state, except, &bytes);
        if !slow.is_empty() {
            let exits = slow
                .into_iter()
                .map(|key| (key, Exit::Close(CloseReason::SlowConsumer)))
                .collect();
            self.remove_sessions(state, exits, now);
        }
        Ok(())
    }

    fn send_to(&self, state: &mut RoomState, key: SessionKey, frame: &Frame, now: Instant) -> Result<(), SyncError> {
        let Some(session) = state.sessions.get(&key) else {
            return Ok(());
        };
        match session.send(encode_shared(frame)?) {
            Ok(()) => self.stats.sent(),
            Err(SendError::Full) => {
                self.remove_sessions(state, vec![(key, Exit::Close(CloseReason::SlowConsumer))], now);
            }
            Err(SendError::Closed) => {}
        }
        Ok(())
    }

    fn deliver(&self, state: &RoomState, except: Option<SessionKey>, bytes: &Arc<Vec<u8>>) -> Vec<SessionKey> {
        let mut slow = Vec::new();
        for (key, session) in &state.sessions {
            if Some(*key) == except || !session.is_joined() {
                continue;
            }
            match session.send(Arc::clone(bytes)) {
                Ok(()) => self.stats.sent(),
                Err(SendError::Full) => slow.push(*key),
                Err(SendError::Closed) => {}
            }
        }
        slow
    }

    /// Drop sessions and tell the rest with `PEER_LEFT`. Anyone who
    /// overflows while being told is dropped too.
    fn remove_sessions(&self, state: &mut RoomState, exits: Vec<(SessionKey, Exit)>, now: Instant) {
        let mut queue: VecDeque<(SessionKey, Exit)> = exits.into();
        while let Some((key, exit)) = queue.pop_front() {
            let Some(mut session) = state.sessions.remove(&key) else {
                continue;
            };
            match exit {
                Exit::Close(reason) => {
                    if reason == CloseReason::SlowConsumer {
                        self.stats.slow_consumer();
                    }
                    log::info!("Room {}: closing client {} ({})", self.room_id, session.client_id, reason);
                    session.disconnect(reason);
                }
                Exit::Detach(kind) => {
                    log::info!("Room {}: client {} left ({:?})", self.room_id, session.client_id, kind);
                    session.detach(kind);
                }
            }

            let left = Frame::PeerLeft {
                connection_id: session.connection_id,
            };
            match encode_shared(&left) {
                Ok(bytes) => {
                    for slow in self.deliver(state, None, &bytes) {
                        queue.push_back((slow, Exit::Close(CloseReason::SlowConsumer)));
                    }
                }
                Err(e) => log::error!("Room {}: cannot encode PEER_LEFT: {}", self.room_id, e),
            }
        }

        if state.sessions.is_empty() && state.idle_since.is_none() {
            state.idle_since = Some(now);
        }
    }
}
