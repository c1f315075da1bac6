//! Presence: ephemeral per-connection key/value state.
//!
//! ## Architecture
//!
//! ```text
//! Local update_presence(partial)
//!       │  merge keys (Null removes a key)
//!       ▼
//! PresenceChannel::poll_flush(now)
//!       │  (throttled: one frame per window, default 16ms)
//!       ▼
//! PRESENCE_UPDATE { full presence, seq }
//!       │
//!       ▼   (room relays with connection_id filled in)
//! Remote PresenceRoom::apply()
//!       │  drop if seq <= last seen for that connection
//!       ▼
//! cached presence replaced wholesale
//! ```
//!
//! Every frame carries the whole presence object, so a receiver that missed
//! a frame is corrected by the next one. Sequence numbers are per
//! connection and strictly increasing.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use huddle_core::{ClientId, Presence, PresencePatch, Value};

use crate::protocol::{ConnectionId, Frame, PeerState};

/// Default broadcast window, one frame per 60Hz tick.
pub const DEFAULT_THROTTLE: Duration = Duration::from_millis(16);

/// Merge `partial` into `presence`; `Value::Null` removes a key.
/// Returns the previous value of every touched key (`Null` if absent).
pub fn merge_presence(presence: &mut Presence, partial: Presence) -> PresencePatch {
    let mut previous = PresencePatch::new();
    for (key, value) in partial {
        let old = if value.is_null() {
            presence.remove(&key)
        } else {
            presence.insert(key.clone(), value)
        };
        previous.insert(key, old.unwrap_or(Value::Null));
    }
    previous
}

// ───────────────────────────────────────────────────────────────────
// Sender side
// ───────────────────────────────────────────────────────────────────

/// Local presence with throttled outbound frames.
#[derive(Debug, Clone)]
pub struct PresenceChannel {
    presence: Presence,
    throttle: Duration,
    last_flush: Option<Instant>,
    dirty: bool,
    seq: u64,
}

impl Default for PresenceChannel {
    fn default() -> Self {
        Self::new(DEFAULT_THROTTLE)
    }
}

impl PresenceChannel {
    pub fn new(throttle: Duration) -> Self {
        Self {
            presence: Presence::new(),
            throttle,
            last_flush: None,
            dirty: false,
            seq: 0,
        }
    }

    /// Start from an initial presence (sent as part of joining).
    pub fn with_initial(throttle: Duration, presence: Presence) -> Self {
        Self {
            presence,
            ..Self::new(throttle)
        }
    }

    pub fn presence(&self) -> &Presence {
        &self.presence
    }

    /// Last sequence number handed out.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Merge `partial` into the local presence and schedule a broadcast.
    ///
    /// With `add_to_history`, returns the previous values of the touched
    /// keys so the caller can record an undo entry.
    pub fn update(&mut self, partial: Presence, add_to_history: bool) -> Option<PresencePatch> {
        if partial.is_empty() {
            return None;
        }
        let previous = merge_presence(&mut self.presence, partial);
        self.dirty = true;
        add_to_history.then_some(previous)
    }

    /// When the pending update may go out, if one is pending.
    pub fn next_flush_at(&self) -> Option<Instant> {
        if !self.dirty {
            return None;
        }
        Some(match self.last_flush {
            Some(at) => at + self.throttle,
            None => Instant::now(),
        })
    }

    /// Frame to send now, if an update is pending and the throttle window
    /// has passed. Updates inside the window coalesce into the next frame.
    pub fn poll_flush(&mut self, now: Instant) -> Option<Frame> {
        if !self.dirty {
            return None;
        }
        if let Some(at) = self.last_flush {
            if now.saturating_duration_since(at) < self.throttle {
                return None;
            }
        }
        Some(self.flush_at(now))
    }

    /// Frame with the current presence regardless of throttling.
    pub fn force_flush(&mut self) -> Frame {
        self.flush_at(Instant::now())
    }

    fn flush_at(&mut self, now: Instant) -> Frame {
        self.seq += 1;
        self.dirty = false;
        self.last_flush = Some(now);
        Frame::PresenceUpdate {
            connection_id: None,
            presence: self.presence.clone(),
            seq: self.seq,
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Receiver side
// ───────────────────────────────────────────────────────────────────

/// Cached presence of one remote connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PeerPresence {
    pub connection_id: ConnectionId,
    pub client_id: ClientId,
    pub presence: Presence,
    last_seq: u64,
}

impl PeerPresence {
    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }
}

/// Presence of every other connection in the room.
#[derive(Debug, Default)]
pub struct PresenceRoom {
    local: Option<ConnectionId>,
    peers: HashMap<ConnectionId, PeerPresence>,
}

impl PresenceRoom {
    pub fn new() -> Self {
        Self::default()
    }

    /// Our own connection id; frames about it are ignored.
    pub fn set_local(&mut self, connection_id: ConnectionId) {
        self.local = Some(connection_id);
        self.peers.remove(&connection_id);
    }

    pub fn local(&self) -> Option<ConnectionId> {
        self.local
    }

    /// Replace everything with the peer list from `ROOM_STATE`.
    pub fn load_peers(&mut self, peers: Vec<PeerState>) {
        self.peers.clear();
        for peer in peers {
            if Some(peer.connection_id) == self.local {
                continue;
            }
            self.peers.insert(
                peer.connection_id,
                PeerPresence {
                    connection_id: peer.connection_id,
                    client_id: peer.client_id,
                    presence: peer.presence,
                    last_seq: peer.seq,
                },
            );
        }
    }

    pub fn peer_joined(&mut self, connection_id: ConnectionId, client_id: ClientId, presence: Presence) {
        if Some(connection_id) == self.local {
            return;
        }
        self.peers.insert(
            connection_id,
            PeerPresence {
                connection_id,
                client_id,
                presence,
                last_seq: 0,
            },
        );
    }

    /// Returns whether the peer was known.
    pub fn peer_left(&mut self, connection_id: ConnectionId) -> bool {
        self.peers.remove(&connection_id).is_some()
    }

    /// Replace a peer's presence. Returns `false` for stale or unknown
    /// updates, which are dropped.
    pub fn apply(&mut self, connection_id: ConnectionId, presence: Presence, seq: u64) -> bool {
        if Some(connection_id) == self.local {
            return false;
        }
        let Some(peer) = self.peers.get_mut(&connection_id) else {
            log::trace!("Presence from unknown connection {connection_id}");
            return false;
        };
        if seq <= peer.last_seq {
            log::trace!("Dropping stale presence seq {} <= {} from {}", seq, peer.last_seq, connection_id);
            return false;
        }
        peer.presence = presence;
        peer.last_seq = seq;
        true
    }

    /// Feed a presence-related frame. Returns whether anything changed.
    pub fn handle_frame(&mut self, frame: &Frame) -> bool {
        match frame {
            Frame::PresenceUpdate {
                connection_id: Some(id),
                presence,
                seq,
            } => self.apply(*id, presence.clone(), *seq),
            Frame::PeerJoined {
                connection_id,
                client_id,
                initial_presence,
            } => {
                self.peer_joined(*connection_id, *client_id, initial_presence.clone());
                true
            }
            Frame::PeerLeft { connection_id } => self.peer_left(*connection_id),
            _ => false,
        }
    }

    pub fn peer(&self, connection_id: &ConnectionId) -> Option<&PeerPresence> {
        self.peers.get(connection_id)
    }

    /// Every other connection, ordered by client id.
    pub fn others(&self) -> Vec<&PeerPresence> {
        let mut out: Vec<_> = self.peers.values().collect();
        out.sort_by_key(|p| (p.client_id, p.connection_id));
        out
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn clear(&mut self) {
        self.peers.clear();
    }
}
