//! WebSocket front end of the room registry.
//!
//! Architecture:
//! ```text
//!  TCP accept ──▶ WS handshake (?room=<id>&ticket=<token>)
//!                   │
//!                   ▼
//!              Authorizer ──▶ first frame: PRESENCE_UPDATE (initial presence)
//!                                   │
//!                                   ▼
//!   RoomRegistry::get_or_create ──▶ RoomSession::admit
//!                                   │
//!           ┌───────────────────────┴────────────────────────┐
//!           ▼                                                ▼
//!   reader: socket ──▶ RoomSession::handle_frame    writer: OutboundReceiver ──▶ socket
//! ```
//!
//! Refusals close the socket with a 40xx code from [`CloseReason`] before
//! any room state is touched.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use huddle_core::Presence;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::auth::{validate_room_id, AuthError, Authorizer, StaticAuthorizer};
use crate::broadcast::Outbound;
use crate::config::ServerConfig;
use crate::error::SyncError;
use crate::persistence::{MemoryPersistence, Persistence};
use crate::protocol::{CloseReason, Frame, ProtocolError};
use crate::registry::RoomRegistry;
use crate::room::{Admission, RoomSession};
use crate::session::Disconnect;
use crate::storage::{RocksPersistence, StoreError};

/// How long a finished reader waits for its writer to flush a close frame.
const WRITER_LINGER: Duration = Duration::from_secs(1);

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub frames_received: u64,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    frames_received: AtomicU64,
}

/// `room` and `ticket` from the handshake query string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JoinRequest {
    pub room_id: Option<String>,
    pub ticket: Option<String>,
}

impl JoinRequest {
    pub fn from_query(query: &str) -> Self {
        let mut request = JoinRequest::default();
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match percent_decode(key).as_str() {
                "room" => request.room_id = Some(percent_decode(value)),
                "ticket" => request.ticket = Some(percent_decode(value)),
                _ => {}
            }
        }
        request
    }
}

fn hex_digit(b: u8) -> Option<u8> {
    (b as char).to_digit(16).map(|d| d as u8)
}

/// Decode `%XX` escapes and `+`. Malformed escapes pass through.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => match (
                bytes.get(i + 1).copied().and_then(hex_digit),
                bytes.get(i + 2).copied().and_then(hex_digit),
            ) {
                (Some(high), Some(low)) => {
                    out.push(high << 4 | low);
                    i += 3;
                }
                _ => {
                    out.push(b'%');
                    i += 1;
                }
            },
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::from(reason.code()),
        reason: reason.as_str().into(),
    }))
}

async fn send_close<S>(sink: &mut S, reason: CloseReason)
where
    S: Sink<Message> + Unpin,
{
    if sink.send(close_message(reason)).await.is_err() {
        log::debug!("Peer went away before close {reason}");
    }
}

/// The sync server.
#[derive(Clone)]
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    authorizer: Arc<dyn Authorizer>,
    counters: Arc<Counters>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, authorizer: Arc<dyn Authorizer>, persistence: Arc<dyn Persistence>) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.room_settings(), persistence));
        Self {
            config,
            registry,
            authorizer,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Static tickets from the config, RocksDB snapshots when `storage` is
    /// set and in-memory ones otherwise.
    pub fn from_config(config: ServerConfig) -> Result<Self, StoreError> {
        let authorizer = Arc::new(StaticAuthorizer::new(config.tickets.clone()));
        let persistence: Arc<dyn Persistence> = match &config.storage {
            Some(store) => {
                log::info!("Persisting rooms to {}", store.path.display());
                Arc::new(RocksPersistence::open(store.clone())?)
            }
            None => {
                log::warn!("No storage configured; rooms are kept in memory only");
                Arc::new(MemoryPersistence::new())
            }
        };
        Ok(Self::new(config, authorizer, persistence))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected_connections.load(Ordering::Relaxed),
            frames_received: self.counters.frames_received.load(Ordering::Relaxed),
        }
    }

    /// Heartbeat sweeps and idle eviction on the configured interval.
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        Arc::clone(&self.registry).spawn_maintenance(self.config.maintenance_interval())
    }

    /// Bind to the configured address and serve forever.
    pub async fn run(&self) -> Result<(), SyncError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), SyncError> {
        log::info!("Sync server listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let server = self.clone();
            tokio::spawn(async move {
                server.counters.total_connections.fetch_add(1, Ordering::Relaxed);
                server.counters.active_connections.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = server.handle_connection(stream, addr).await {
                    log::warn!("Connection error from {addr}: {e}");
                }
                server.counters.active_connections.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }

    /// Close every session and persist every room.
    pub async fn shutdown(&self) {
        self.registry.shutdown().await;
    }

    async fn handle_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), SyncError> {
        let mut query = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(stream, |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            query = request.uri().query().map(str::to_string);
            Ok(response)
        })
        .await?;
        let (mut sink, mut source) = ws_stream.split();
        let request = JoinRequest::from_query(query.as_deref().unwrap_or(""));

        let (room, admission) = match self.admit(&request, &mut source).await {
            Ok(admitted) => admitted,
            Err(e) => {
                self.counters.rejected_connections.fetch_add(1, Ordering::Relaxed);
                let reason = e.close_reason().unwrap_or(CloseReason::ProtocolError);
                log::info!("Refusing {addr} for room {:?}: {e}", request.room_id);
                send_close(&mut sink, reason).await;
                return Ok(());
            }
        };

        let Admission {
            session_key,
            mut outbound,
            ..
        } = admission;

        let mut writer = tokio::spawn(async move {
            while let Some(next) = outbound.recv().await {
                match next {
                    Outbound::Frame(bytes) => {
                        if sink.send(Message::Binary(bytes.to_vec().into())).await.is_err() {
                            return;
                        }
                    }
                    Outbound::Close(reason) => {
                        send_close(&mut sink, reason).await;
                        return;
                    }
                }
            }
            // Dropped by the room without a close code.
            if let Err(e) = sink.close().await {
                log::debug!("Closing socket failed: {e}");
            }
        });
        let mut writer_done = false;
        let mut exit = Disconnect::Retryable;

        loop {
            tokio::select! {
                msg = source.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                        let result = match Frame::decode(&data) {
                            Ok(frame) => {
                                let leaving = matches!(frame, Frame::Leave);
                                room.handle_frame(session_key, frame).await.map(|()| leaving)
                            }
                            Err(e) => Err(e.into()),
                        };
                        match result {
                            Ok(false) => {}
                            Ok(true) => {
                                exit = Disconnect::Terminal;
                                break;
                            }
                            // Already dropped by the room; the writer carries the close.
                            Err(SyncError::UnknownSession(_)) => break,
                            Err(e) => match e.close_reason() {
                                Some(reason) => {
                                    log::warn!("Closing {addr}: {e}");
                                    room.close_session(session_key, reason).await;
                                    break;
                                }
                                None => log::warn!("Frame from {addr} failed: {e}"),
                            },
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Text(_))) => {
                        log::warn!("Closing {addr}: text frames are not part of the protocol");
                        room.close_session(session_key, CloseReason::ProtocolError).await;
                        break;
                    }
                    // Ping/pong at the WebSocket layer is answered by tungstenite.
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        log::debug!("WebSocket error from {addr}: {e}");
                        break;
                    }
                },
                _ = &mut writer => {
                    writer_done = true;
                    break;
                }
            }
        }

        room.leave(session_key, exit).await;
        if !writer_done && tokio::time::timeout(WRITER_LINGER, &mut writer).await.is_err() {
            writer.abort();
        }
        log::debug!("Connection from {addr} finished");
        Ok(())
    }

    /// Authorize, read the initial presence and join the room.
    async fn admit<S>(&self, request: &JoinRequest, source: &mut S) -> Result<(Arc<RoomSession>, Admission), SyncError>
    where
        S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        let room_id = request.room_id.as_deref().ok_or(AuthError::RoomNotFound)?;
        validate_room_id(room_id)?;
        let token = request.ticket.as_deref().ok_or(AuthError::NotAllowed)?;

        let auth_timeout = self.config.auth_timeout();
        let ticket = tokio::time::timeout(auth_timeout, self.authorizer.validate_ticket(token, room_id))
            .await
            .map_err(|_| AuthError::Timeout)??;
        let presence = tokio::time::timeout(auth_timeout, read_initial_presence(source))
            .await
            .map_err(|_| AuthError::Timeout)??;

        let room = self.registry.get_or_create(room_id).await;
        let admission = room.admit(&ticket, presence).await?;
        Ok((room, admission))
    }
}

async fn read_initial_presence<S>(source: &mut S) -> Result<Presence, SyncError>
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match source.next().await {
            Some(Ok(Message::Binary(data))) => {
                return match Frame::decode(&data)? {
                    Frame::PresenceUpdate { presence, .. } => Ok(presence),
                    other => Err(ProtocolError::UnexpectedFrame(other.kind()).into()),
                };
            }
            Some(Ok(Message::Close(_))) | None => return Err(ProtocolError::ConnectionClosed.into()),
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(e.into()),
        }
    }
}
