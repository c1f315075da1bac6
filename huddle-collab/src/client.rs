//! WebSocket sync client.
//!
//! Two layers:
//! - [`ClientRoom`]: the protocol state of one followed room (replica,
//!   presence, peers, connection state) with no I/O, fed frames and asked
//!   for frames to send
//! - [`SyncClient`]: a background task that owns the socket, drives a
//!   `ClientRoom`, pings, and reconnects with [`Backoff`]
//!
//! Local edits never wait for the network. Ops made while disconnected stay
//! pending in the replica and are resent after the next `ROOM_STATE`; the
//! room recognizes the ones it already sequenced.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use huddle_core::{ClientId, ConflictReason, MutationError, OpId, Presence, Replica, Snapshot, Value};
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::AuthError;
use crate::config::ClientSettings;
use crate::error::SyncError;
use crate::presence::{PeerPresence, PresenceChannel, PresenceRoom};
use crate::protocol::{CloseReason, ConnectionId, Frame, ProtocolError};
use crate::session::{ConnectionState, Disconnect};

/// Events emitted to the application.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomEvent {
    Joined {
        connection_id: ConnectionId,
        client_id: ClientId,
        can_write: bool,
    },
    /// The visible storage changed because of a remote op or a snapshot.
    StorageChanged,
    /// The room refused one of our ops; its effect has been rolled back.
    OpRejected { op_id: OpId, reason: ConflictReason },
    PeerJoined(ConnectionId),
    PeerLeft(ConnectionId),
    PresenceChanged(ConnectionId),
    Disconnected {
        reason: Option<CloseReason>,
        will_retry: bool,
    },
    Reconnecting { attempt: u32, delay: Duration },
}

/// Exponential reconnect delays: `base * factor^attempt`, capped at `max`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    factor: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            factor: 2,
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self::new(settings.backoff_base, settings.backoff_max)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn next_delay(&mut self) -> Duration {
        let scale = self.factor.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(scale).min(self.max)
    }

    /// Back to `base` after a successful join.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Protocol state of one followed room.
pub struct ClientRoom {
    replica: Replica,
    presence: PresenceChannel,
    peers: PresenceRoom,
    state: ConnectionState,
    connection_id: Option<ConnectionId>,
    can_write: bool,
    joined_once: bool,
    outgoing: VecDeque<Frame>,
}

impl std::fmt::Debug for ClientRoom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRoom")
            .field("state", &self.state)
            .field("connection_id", &self.connection_id)
            .field("clock", &self.replica.clock())
            .field("pending", &self.replica.pending_len())
            .finish_non_exhaustive()
    }
}

impl ClientRoom {
    pub fn new(settings: &ClientSettings, initial_presence: Presence) -> Self {
        let mut replica = Replica::new(ClientId::SERVER);
        replica.observe_presence(&initial_presence);
        Self {
            replica,
            presence: PresenceChannel::with_initial(settings.presence_throttle, initial_presence),
            peers: PresenceRoom::new(),
            state: ConnectionState::Connecting,
            connection_id: None,
            can_write: false,
            joined_once: false,
            outgoing: VecDeque::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn client_id(&self) -> Option<ClientId> {
        self.joined_once.then(|| self.replica.client())
    }

    pub fn can_write(&self) -> bool {
        self.can_write
    }

    pub fn replica(&self) -> &Replica {
        &self.replica
    }

    /// Storage as the local user sees it, pending ops included.
    pub fn snapshot(&self) -> Snapshot {
        self.replica.snapshot()
    }

    pub fn presence(&self) -> &Presence {
        self.presence.presence()
    }

    pub fn peers(&self) -> &PresenceRoom {
        &self.peers
    }

    pub fn others(&self) -> Vec<&PeerPresence> {
        self.peers.others()
    }

    /// The socket is open: move to `Authorizing` and return the first frame,
    /// which carries the initial presence.
    pub fn begin_handshake(&mut self) -> Result<Frame, SyncError> {
        self.state = self.state.transition(ConnectionState::Authorizing)?;
        Ok(self.presence.force_flush())
    }

    /// Process one frame from the room.
    pub fn handle_frame(&mut self, frame: Frame) -> Result<Vec<RoomEvent>, SyncError> {
        let mut events = Vec::new();
        match frame {
            Frame::RoomState {
                connection_id,
                client_id,
                can_write,
                clock,
                peers,
            } => {
                self.state = self.state.transition(ConnectionState::Joined)?;
                self.replica.rebind(client_id);
                self.connection_id = Some(connection_id);
                self.can_write = can_write;
                self.joined_once = true;
                self.peers.set_local(connection_id);
                self.peers.load_peers(peers);

                log::info!(
                    "Joined as client {} (room clock {}, local clock {}, {} pending)",
                    client_id,
                    clock,
                    self.replica.clock(),
                    self.replica.pending_len()
                );
                self.outgoing.push_back(Frame::FetchStorage {
                    last_clock: self.replica.clock(),
                });
                let seen = self.replica.clock();
                for op in self.replica.resend_pending() {
                    self.outgoing.push_back(Frame::StorageOp { op, clock: seen });
                }
                events.push(RoomEvent::Joined {
                    connection_id,
                    client_id,
                    can_write,
                });
            }
            Frame::StorageOp { op, .. } => {
                self.replica.apply_remote(op);
                events.push(RoomEvent::StorageChanged);
            }
            Frame::StorageAck { op_id, server_clock } => {
                self.replica.apply_ack(op_id, server_clock);
            }
            Frame::StorageRejected { op_id, reason } => {
                log::warn!("Room rejected {op_id}: {reason}");
                self.replica.apply_reject(op_id, reason);
                events.push(RoomEvent::OpRejected { op_id, reason });
            }
            Frame::FullSnapshot { tree, clock } => {
                log::debug!("Loading full snapshot at clock {clock}");
                self.replica
                    .load_snapshot(tree)
                    .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
                events.push(RoomEvent::StorageChanged);
            }
            Frame::PeerJoined {
                connection_id,
                client_id,
                initial_presence,
            } => {
                if self.peers.local() != Some(connection_id) {
                    self.peers.peer_joined(connection_id, client_id, initial_presence);
                    events.push(RoomEvent::PeerJoined(connection_id));
                }
            }
            Frame::PeerLeft { connection_id } => {
                if self.peers.peer_left(connection_id) {
                    events.push(RoomEvent::PeerLeft(connection_id));
                }
            }
            Frame::PresenceUpdate {
                connection_id: Some(connection_id),
                presence,
                seq,
            } => {
                if self.peers.apply(connection_id, presence, seq) {
                    events.push(RoomEvent::PresenceChanged(connection_id));
                }
            }
            Frame::Ping => self.outgoing.push_back(Frame::Pong),
            Frame::Pong => {}
            other => return Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
        }
        Ok(events)
    }

    /// Queue a `PING` for the room.
    pub fn ping(&mut self) {
        if self.state.is_joined() {
            self.outgoing.push_back(Frame::Ping);
        }
    }

    /// Frames to send now. Empty until joined.
    pub fn take_frames(&mut self, now: Instant) -> Vec<Frame> {
        if !self.state.is_joined() {
            return Vec::new();
        }
        let mut frames: Vec<Frame> = self.outgoing.drain(..).collect();
        let seen = self.replica.clock();
        frames.extend(
            self.replica
                .take_outbox()
                .into_iter()
                .map(|op| Frame::StorageOp { op, clock: seen }),
        );
        frames.extend(self.presence.poll_flush(now));
        frames
    }

    /// When [`take_frames`](Self::take_frames) will have a throttled
    /// presence frame ready.
    pub fn next_wakeup(&self) -> Option<Instant> {
        if self.state.is_joined() {
            self.presence.next_flush_at()
        } else {
            None
        }
    }

    /// Run local storage edits. Refused until the first join, since ops
    /// need a client id assigned by the room.
    pub fn mutate<R>(&mut self, f: impl FnOnce(&mut Replica) -> Result<R, MutationError>) -> Result<R, SyncError> {
        if !self.joined_once {
            return Err(SyncError::NotJoined);
        }
        if !self.can_write {
            return Err(AuthError::NotAllowed.into());
        }
        Ok(f(&mut self.replica)?)
    }

    /// Merge `partial` into the local presence. With `add_to_history` the
    /// previous values become an undo step.
    pub fn update_presence(&mut self, partial: Presence, add_to_history: bool) -> Result<(), SyncError> {
        partial
            .values()
            .try_for_each(Value::validate)
            .map_err(|e| ProtocolError::InvalidPayload(e.to_string()))?;
        if let Some(previous) = self.presence.update(partial, add_to_history) {
            self.replica.record_presence(previous);
        }
        self.replica.observe_presence(self.presence.presence());
        Ok(())
    }

    pub fn undo(&mut self) -> bool {
        let step = self.replica.undo();
        self.apply_history_step(step)
    }

    pub fn redo(&mut self) -> bool {
        let step = self.replica.redo();
        self.apply_history_step(step)
    }

    fn apply_history_step(&mut self, step: Option<huddle_core::HistoryStep>) -> bool {
        let Some(step) = step else {
            return false;
        };
        if let Some(patch) = step.presence {
            self.presence.update(patch, false);
            self.replica.observe_presence(self.presence.presence());
        }
        true
    }

    /// The socket closed. Returns how the connection ended.
    pub fn disconnected(&mut self, reason: Option<CloseReason>) -> Disconnect {
        let kind = reason.map(Disconnect::from).unwrap_or(Disconnect::Retryable);
        match self.state.transition(ConnectionState::Disconnected(kind)) {
            Ok(state) => self.state = state,
            Err(e) => log::trace!("{e}"),
        }
        self.connection_id = None;
        self.peers.clear();
        self.outgoing.clear();
        kind
    }

    /// Start over after a retryable disconnect.
    pub fn reconnect(&mut self) -> Result<(), SyncError> {
        self.state = self.state.transition(ConnectionState::Connecting)?;
        Ok(())
    }
}

/// Build `<server_url>/?room=<id>&ticket=<token>`. A bare host gets `/` as
/// its path; the HTTP upgrade request line cannot start with `?`.
pub fn join_url(server_url: &str, room_id: &str, ticket: &str) -> String {
    let base = server_url.trim_end_matches('/');
    let authority = base.split_once("://").map_or(base, |(_, rest)| rest);
    let path_end = if authority.contains('/') { "" } else { "/" };
    format!(
        "{}{}?room={}&ticket={}",
        base,
        path_end,
        percent_encode(room_id),
        percent_encode(ticket)
    )
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Handle to a room followed over WebSocket.
///
/// `start` spawns the connection task; edits go through [`mutate`](Self::mutate)
/// and presence through [`update_presence`](Self::update_presence) at any
/// time, connected or not.
pub struct SyncClient {
    url: String,
    settings: ClientSettings,
    room: Arc<Mutex<ClientRoom>>,
    wake: Arc<Notify>,
    stop: watch::Sender<bool>,
    event_tx: mpsc::Sender<RoomEvent>,
    event_rx: Option<mpsc::Receiver<RoomEvent>>,
    driver: Option<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(
        server_url: &str,
        room_id: &str,
        ticket: &str,
        settings: ClientSettings,
        initial_presence: Presence,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        let (stop, _) = watch::channel(false);
        let room = ClientRoom::new(&settings, initial_presence);
        Self {
            url: join_url(server_url, room_id, ticket),
            settings,
            room: Arc::new(Mutex::new(room)),
            wake: Arc::new(Notify::new()),
            stop,
            event_tx,
            event_rx: Some(event_rx),
            driver: None,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<RoomEvent>> {
        self.event_rx.take()
    }

    /// Spawn the connection task. No-op if already started.
    pub fn start(&mut self) {
        if self.driver.is_some() {
            return;
        }
        let driver = Driver {
            url: self.url.clone(),
            settings: self.settings.clone(),
            room: Arc::clone(&self.room),
            wake: Arc::clone(&self.wake),
            stop: self.stop.subscribe(),
            events: self.event_tx.clone(),
        };
        self.driver = Some(tokio::spawn(driver.run()));
    }

    /// Direct access to the protocol state.
    pub fn room(&self) -> &Arc<Mutex<ClientRoom>> {
        &self.room
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.room.lock().await.state()
    }

    pub async fn snapshot(&self) -> Snapshot {
        self.room.lock().await.snapshot()
    }

    pub async fn mutate<R>(&self, f: impl FnOnce(&mut Replica) -> Result<R, MutationError>) -> Result<R, SyncError> {
        let result = self.room.lock().await.mutate(f);
        self.wake.notify_one();
        result
    }

    pub async fn update_presence(&self, partial: Presence, add_to_history: bool) -> Result<(), SyncError> {
        self.room.lock().await.update_presence(partial, add_to_history)?;
        self.wake.notify_one();
        Ok(())
    }

    pub async fn undo(&self) -> bool {
        let done = self.room.lock().await.undo();
        self.wake.notify_one();
        done
    }

    pub async fn redo(&self) -> bool {
        let done = self.room.lock().await.redo();
        self.wake.notify_one();
        done
    }

    /// Send `LEAVE` if connected and stop the connection task.
    pub async fn leave(&mut self) {
        self.stop.send_replace(true);
        if let Some(driver) = self.driver.take() {
            if driver.await.is_err() {
                log::warn!("Connection task panicked");
            }
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }
}

/// How one connection attempt ended.
enum SessionEnd {
    Closed(Option<CloseReason>),
    Stopped,
}

struct Driver {
    url: String,
    settings: ClientSettings,
    room: Arc<Mutex<ClientRoom>>,
    wake: Arc<Notify>,
    stop: watch::Receiver<bool>,
    events: mpsc::Sender<RoomEvent>,
}

impl Driver {
    fn emit(&self, event: RoomEvent) {
        if let Err(e) = self.events.try_send(event) {
            log::warn!("Dropping client event: {e}");
        }
    }

    fn stopping(&self) -> bool {
        *self.stop.borrow()
    }

    async fn run(mut self) {
        let mut backoff = Backoff::from_settings(&self.settings);
        loop {
            let reason = match self.session(&mut backoff).await {
                Ok(SessionEnd::Stopped) => {
                    self.room.lock().await.disconnected(None);
                    return;
                }
                Ok(SessionEnd::Closed(reason)) => reason,
                Err(e) => {
                    log::debug!("Connection to {} failed: {e}", self.url);
                    e.close_reason()
                }
            };

            let kind = self.room.lock().await.disconnected(reason);
            let will_retry = kind == Disconnect::Retryable && !self.stopping();
            self.emit(RoomEvent::Disconnected { reason, will_retry });
            if !will_retry {
                log::info!("Not reconnecting to {} ({reason:?})", self.url);
                return;
            }

            let delay = backoff.next_delay();
            self.emit(RoomEvent::Reconnecting {
                attempt: backoff.attempt(),
                delay,
            });
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.stop.changed() => return,
            }
            if let Err(e) = self.room.lock().await.reconnect() {
                log::warn!("{e}");
                return;
            }
        }
    }

    async fn session(&mut self, backoff: &mut Backoff) -> Result<SessionEnd, SyncError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str()).await?;
        let (mut sink, mut source) = ws_stream.split();

        let hello = self.room.lock().await.begin_handshake()?;
        sink.send(Message::Binary(hello.encode()?.into())).await?;

        let mut ping = tokio::time::interval(self.settings.ping_interval);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            let (frames, wake_at) = {
                let mut room = self.room.lock().await;
                (room.take_frames(Instant::now()), room.next_wakeup())
            };
            for frame in frames {
                sink.send(Message::Binary(frame.encode()?.into())).await?;
            }

            let flush_due = async move {
                match wake_at {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let frame = Frame::decode(&data)?;
                        let events = self.room.lock().await.handle_frame(frame)?;
                        for event in events {
                            if matches!(event, RoomEvent::Joined { .. }) {
                                backoff.reset();
                            }
                            self.emit(event);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame.and_then(|f| CloseReason::from_code(u16::from(f.code)));
                        return Ok(SessionEnd::Closed(reason));
                    }
                    None => return Ok(SessionEnd::Closed(None)),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                _ = ping.tick() => self.room.lock().await.ping(),
                _ = flush_due => {}
                _ = self.wake.notified() => {}
                _ = self.stop.changed() => {
                    if self.room.lock().await.state().is_joined() {
                        sink.send(Message::Binary(Frame::Leave.encode()?.into())).await?;
                    }
                    if let Err(e) = sink.close().await {
                        log::debug!("Closing connection to {} failed: {e}", self.url);
                    }
                    return Ok(SessionEnd::Stopped);
                }
            }
        }
    }
}
