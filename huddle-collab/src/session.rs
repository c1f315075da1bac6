//! Connection lifecycle.
//!
//! ```text
//!  Connecting ──▶ Authorizing ──▶ Joined
//!      │              │             │
//!      └──────────────┴─────────────┴──▶ Disconnected(Retryable | Terminal)
//!                                              │
//!                        (Retryable only) ◀────┘ ──▶ Connecting
//! ```
//!
//! The same machine runs on both ends: the server keeps one per session,
//! the client one per room it follows.

use std::time::Instant;

use huddle_core::{ClientId, Presence};
use thiserror::Error;
use uuid::Uuid;

use crate::broadcast::{OutboundSender, SendError};
use crate::protocol::{CloseReason, ConnectionId, PeerState};

/// Server-side handle of one admitted connection. Never reused.
pub type SessionKey = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disconnect {
    /// Client may reconnect with backoff.
    Retryable,
    /// Client must not reconnect with the same ticket.
    Terminal,
}

impl From<CloseReason> for Disconnect {
    fn from(reason: CloseReason) -> Self {
        if reason.is_retryable() {
            Disconnect::Retryable
        } else {
            Disconnect::Terminal
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Authorizing,
    Joined,
    Disconnected(Disconnect),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal connection transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

impl ConnectionState {
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, to),
            (Connecting, Authorizing)
                | (Authorizing, Joined)
                | (Connecting | Authorizing | Joined, Disconnected(_))
                | (Disconnected(Disconnect::Retryable), Connecting)
        )
    }

    pub fn transition(self, to: ConnectionState) -> Result<ConnectionState, TransitionError> {
        if self.can_transition(to) {
            Ok(to)
        } else {
            Err(TransitionError { from: self, to })
        }
    }

    pub fn is_joined(self) -> bool {
        self == ConnectionState::Joined
    }

    pub fn is_terminal(self) -> bool {
        self == ConnectionState::Disconnected(Disconnect::Terminal)
    }
}

/// One admitted connection as the room sees it.
#[derive(Debug)]
pub struct Session {
    pub key: SessionKey,
    pub connection_id: ConnectionId,
    pub client_id: ClientId,
    pub can_write: bool,
    state: ConnectionState,
    presence: Presence,
    presence_seq: u64,
    last_seen: Instant,
    /// Highest room clock the client has reported seeing.
    last_seen_clock: u64,
    outbound: OutboundSender,
}

impl Session {
    pub fn new(client_id: ClientId, can_write: bool, presence: Presence, outbound: OutboundSender, now: Instant) -> Self {
        Self {
            key: Uuid::new_v4(),
            connection_id: Uuid::new_v4(),
            client_id,
            can_write,
            state: ConnectionState::Authorizing,
            presence,
            presence_seq: 0,
            last_seen: now,
            last_seen_clock: 0,
            outbound,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn transition(&mut self, to: ConnectionState) -> Result<(), TransitionError> {
        self.state = self.state.transition(to)?;
        Ok(())
    }

    pub fn is_joined(&self) -> bool {
        self.state.is_joined()
    }

    /// Any inbound frame counts as a heartbeat.
    pub fn touch(&mut self, now: Instant) {
        self.last_seen = now;
    }

    pub fn last_seen(&self) -> Instant {
        self.last_seen
    }

    pub fn is_silent(&self, now: Instant, timeout: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_seen) > timeout
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    pub fn presence_seq(&self) -> u64 {
        self.presence_seq
    }

    /// Store a full presence update. Returns `false` for stale sequence
    /// numbers, which are dropped.
    pub fn set_presence(&mut self, presence: Presence, seq: u64) -> bool {
        if seq <= self.presence_seq {
            return false;
        }
        self.presence = presence;
        self.presence_seq = seq;
        true
    }

    pub fn last_seen_clock(&self) -> u64 {
        self.last_seen_clock
    }

    pub fn saw_clock(&mut self, clock: u64) {
        self.last_seen_clock = self.last_seen_clock.max(clock);
    }

    /// The op at `clock` was queued to this session. Only advances the
    /// seen clock when nothing is missing before it.
    pub fn delivered(&mut self, clock: u64) {
        if clock <= self.last_seen_clock.saturating_add(1) {
            self.saw_clock(clock);
        }
    }

    pub fn peer_state(&self) -> PeerState {
        PeerState {
            connection_id: self.connection_id,
            client_id: self.client_id,
            presence: self.presence.clone(),
            seq: self.presence_seq,
        }
    }

    pub fn send(&self, bytes: std::sync::Arc<Vec<u8>>) -> Result<(), SendError> {
        self.outbound.send(bytes)
    }

    pub fn queue_capacity(&self) -> usize {
        self.outbound.capacity()
    }

    /// Move to `Disconnected` without a close frame; dropping the session
    /// ends the writer.
    pub fn detach(&mut self, kind: Disconnect) {
        if let Err(e) = self.transition(ConnectionState::Disconnected(kind)) {
            log::trace!("Session {}: {}", self.key, e);
        }
    }

    /// Move to `Disconnected` and tell the writer to close the socket.
    pub fn disconnect(&mut self, reason: CloseReason) {
        let to = ConnectionState::Disconnected(reason.into());
        if let Err(e) = self.transition(to) {
            log::trace!("Session {}: {}", self.key, e);
        }
        self.outbound.close(reason);
    }
}
