//! Binary wire protocol between clients and a room.
//!
//! One [`Frame`] per WebSocket binary message, bincode-encoded:
//! ```text
//! ┌───────────┬──────────────────────────────────────────────┐
//! │ variant   │ fields (varint-encoded integers, uuids as    │
//! │ varint    │ 16 raw bytes, strings length-prefixed)       │
//! └───────────┴──────────────────────────────────────────────┘
//! ```
//!
//! Client → room: `PresenceUpdate`, `StorageOp`, `FetchStorage`, `Ping`,
//! `Leave`. Room → client: everything else, plus `PresenceUpdate` and
//! `StorageOp` relayed from peers.
//!
//! Close codes for refused or dropped connections live in [`CloseReason`].

use huddle_core::{ClientId, ConflictReason, OpId, Operation, Presence, StorageSnapshot};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-connection identity inside a room. Unique per session, so a
/// reconnect shows up as a new connection.
pub type ConnectionId = Uuid;

/// A connected peer as described to a joiner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerState {
    pub connection_id: ConnectionId,
    pub client_id: ClientId,
    pub presence: Presence,
    /// Last presence sequence number relayed for this peer.
    pub seq: u64,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// Full presence of one connection. Clients leave `connection_id`
    /// empty; the room fills it in when relaying.
    PresenceUpdate {
        connection_id: Option<ConnectionId>,
        presence: Presence,
        seq: u64,
    },
    /// A storage op. From a client, `clock` is the last room clock it has
    /// seen; from the room, the clock the op was sequenced at.
    StorageOp { op: Operation, clock: u64 },
    /// The sender's op was sequenced at `server_clock`.
    StorageAck { op_id: OpId, server_clock: u64 },
    /// The sender's op was refused and will never be applied.
    StorageRejected { op_id: OpId, reason: ConflictReason },
    /// Whole storage tree, sent when incremental replay is not possible.
    FullSnapshot { tree: StorageSnapshot, clock: u64 },
    PeerJoined {
        connection_id: ConnectionId,
        client_id: ClientId,
        initial_presence: Presence,
    },
    PeerLeft { connection_id: ConnectionId },
    /// First frame after admission: the joiner's own ids and who else is here.
    RoomState {
        connection_id: ConnectionId,
        client_id: ClientId,
        can_write: bool,
        clock: u64,
        peers: Vec<PeerState>,
    },
    /// Ask for every op after `last_clock`.
    FetchStorage { last_clock: u64 },
    Ping,
    Pong,
    /// Clean departure; the room treats it as terminal.
    Leave,
}

impl Frame {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::PresenceUpdate { .. } => "PRESENCE_UPDATE",
            Frame::StorageOp { .. } => "STORAGE_OP",
            Frame::StorageAck { .. } => "STORAGE_ACK",
            Frame::StorageRejected { .. } => "STORAGE_REJECTED",
            Frame::FullSnapshot { .. } => "FULL_SNAPSHOT",
            Frame::PeerJoined { .. } => "PEER_JOINED",
            Frame::PeerLeft { .. } => "PEER_LEFT",
            Frame::RoomState { .. } => "ROOM_STATE",
            Frame::FetchStorage { .. } => "FETCH_STORAGE",
            Frame::Ping => "PING",
            Frame::Pong => "PONG",
            Frame::Leave => "LEAVE",
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format. Trailing bytes are an error.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::DeserializationError(format!(
                "{} trailing bytes",
                bytes.len() - read
            )));
        }
        Ok(frame)
    }
}

/// Why a connection was refused or closed. Carried as the WebSocket close
/// code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// Malformed frame.
    ProtocolError,
    /// Ticket does not grant access to this room.
    NotAllowed,
    /// Ticket expired.
    ExpiredTicket,
    /// No such room (or no room in the request).
    RoomNotFound,
    /// Authorization did not answer in time.
    AuthTimeout,
    /// Outbound queue overflowed.
    SlowConsumer,
    /// No frame within the heartbeat window.
    HeartbeatTimeout,
    /// Server is going away.
    ServerShutdown,
    /// Room is loading, closing or its storage is unreachable.
    RoomUnavailable,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            CloseReason::ProtocolError => 4000,
            CloseReason::NotAllowed => 4001,
            CloseReason::ExpiredTicket => 4003,
            CloseReason::RoomNotFound => 4004,
            CloseReason::AuthTimeout => 4008,
            CloseReason::SlowConsumer => 4009,
            CloseReason::HeartbeatTimeout => 4010,
            CloseReason::ServerShutdown => 4011,
            CloseReason::RoomUnavailable => 4012,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Some(match code {
            4000 => CloseReason::ProtocolError,
            4001 => CloseReason::NotAllowed,
            4003 => CloseReason::ExpiredTicket,
            4004 => CloseReason::RoomNotFound,
            4008 => CloseReason::AuthTimeout,
            4009 => CloseReason::SlowConsumer,
            4010 => CloseReason::HeartbeatTimeout,
            4011 => CloseReason::ServerShutdown,
            4012 => CloseReason::RoomUnavailable,
            _ => return None,
        })
    }

    /// Machine-readable reason string.
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ProtocolError => "protocol_error",
            CloseReason::NotAllowed => "not_allowed",
            CloseReason::ExpiredTicket => "expired_ticket",
            CloseReason::RoomNotFound => "room_not_found",
            CloseReason::AuthTimeout => "auth_timeout",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::ServerShutdown => "server_shutdown",
            CloseReason::RoomUnavailable => "room_unavailable",
        }
    }

    /// Whether a client should try again with backoff.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            CloseReason::AuthTimeout
                | CloseReason::SlowConsumer
                | CloseReason::HeartbeatTimeout
                | CloseReason::ServerShutdown
                | CloseReason::RoomUnavailable
        )
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.code())
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    /// A frame that is valid on the wire but not in this direction or state.
    UnexpectedFrame(&'static str),
    /// Decoded fine but carries values the room refuses (e.g. NaN).
    InvalidPayload(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedFrame(kind) => write!(f, "Unexpected frame: {kind}"),
            Self::InvalidPayload(e) => write!(f, "Invalid payload: {e}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
