//! # huddle-collab — Rooms, sessions and the WebSocket sync protocol
//!
//! Serves [`huddle_core`] storage to many connections at once and keeps a
//! throttled presence channel next to it.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────────────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer                   │
//! │  ClientRoom │   binary frames    │  RoomRegistry                │
//! │   Replica   │                    │   RoomSession (per room)     │
//! │   Presence  │                    │    Authority + Sessions      │
//! └─────────────┘                    └──────────────┬───────────────┘
//!                                                   │ load / save
//!                                            ┌──────┴──────┐
//!                                            │ Persistence │
//!                                            │ (RocksDB)   │
//!                                            └─────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — frames, close codes and their bincode encoding
//! - [`session`] — connection state machine and per-session bookkeeping
//! - [`broadcast`] — bounded per-session outbound queues
//! - [`presence`] — throttled local presence and the peer cache
//! - [`room`] — one room: admission, op sequencing, fan-out, heartbeats
//! - [`registry`] — room lookup and idle eviction
//! - [`server`] / [`client`] — the WebSocket ends
//! - [`auth`], [`persistence`], [`storage`], [`config`]

pub mod auth;
pub mod broadcast;
pub mod client;
pub mod config;
pub mod error;
pub mod persistence;
pub mod presence;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod server;
pub mod session;
pub mod storage;

// Re-exports for convenience
pub use auth::{AuthError, Authorizer, Grant, StaticAuthorizer, Ticket};
pub use broadcast::{outbound_queue, BroadcastStats, OutboundReceiver, OutboundSender, SendError};
pub use client::{join_url, Backoff, ClientRoom, RoomEvent, SyncClient};
pub use config::{ClientSettings, ConfigError, RoomSettings, ServerConfig};
pub use error::SyncError;
pub use persistence::{MemoryPersistence, Persistence, PersistenceError};
pub use presence::{PeerPresence, PresenceChannel, PresenceRoom};
pub use protocol::{CloseReason, ConnectionId, Frame, PeerState, ProtocolError};
pub use registry::RoomRegistry;
pub use room::{Admission, RoomSession};
pub use server::{JoinRequest, ServerStats, SyncServer};
pub use session::{ConnectionState, Disconnect, SessionKey};
pub use storage::{RocksPersistence, SnapshotStore, StoreConfig, StoreError};
