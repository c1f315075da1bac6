//! Error taxonomy of the sync layer.

use huddle_core::{Conflict, MutationError, ReplayGapExceeded};
use thiserror::Error;

use crate::auth::AuthError;
use crate::persistence::PersistenceError;
use crate::protocol::{CloseReason, ProtocolError};
use crate::session::TransitionError;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Malformed or misplaced frame. The connection is dropped.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// An op referenced a tombstoned or unknown node. The op is dropped and
    /// the sender told so it can resync.
    #[error(transparent)]
    ConflictRejected(#[from] Conflict),

    /// Ticket invalid or expired; refused before join.
    #[error("admission refused: {0}")]
    AuthDenied(#[from] AuthError),

    /// Client is behind the replay window; answered with a full snapshot.
    #[error(transparent)]
    ReplayGapExceeded(#[from] ReplayGapExceeded),

    /// Loading or saving a room snapshot failed or timed out.
    #[error("persistence failure for room {room_id}: {source}")]
    PersistenceFailure {
        room_id: String,
        #[source]
        source: PersistenceError,
    },

    /// Room is closing or could not be loaded; try again later.
    #[error("room {0} is unavailable")]
    RoomUnavailable(String),

    #[error("no session {0} in this room")]
    UnknownSession(uuid::Uuid),

    /// Storage was touched before the first successful join.
    #[error("not joined to the room yet")]
    NotJoined,

    #[error(transparent)]
    Mutation(#[from] MutationError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("transport error: {0}")]
    Transport(String),
}

impl SyncError {
    /// Close code to send when this error ends a connection.
    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            SyncError::Protocol(_) | SyncError::UnknownSession(_) => Some(CloseReason::ProtocolError),
            SyncError::AuthDenied(e) => Some(e.close_reason()),
            SyncError::PersistenceFailure { .. } | SyncError::RoomUnavailable(_) => {
                Some(CloseReason::RoomUnavailable)
            }
            _ => None,
        }
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}
