//! Ticket validation at admission.
//!
//! A ticket is an opaque token handed to the client by some external
//! identity service. The room only asks an [`Authorizer`] whether the token
//! grants access to a given room, and with which permissions.

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::BoxFuture;
use serde::Deserialize;
use thiserror::Error;

use crate::protocol::CloseReason;

/// Longest room id accepted at admission.
pub const MAX_ROOM_ID_LEN: usize = 128;

/// What a validated ticket allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub room_id: String,
    /// Opaque user identity, for logs only.
    pub user: Option<String>,
    pub can_write: bool,
    pub expires_at: Option<SystemTime>,
}

impl Ticket {
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("ticket does not grant access to this room")]
    NotAllowed,
    #[error("room not found")]
    RoomNotFound,
    #[error("ticket expired")]
    Expired,
    /// The authorizer did not answer within the admission window.
    #[error("authorization timed out")]
    Timeout,
}

impl AuthError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            AuthError::NotAllowed => CloseReason::NotAllowed,
            AuthError::RoomNotFound => CloseReason::RoomNotFound,
            AuthError::Expired => CloseReason::ExpiredTicket,
            AuthError::Timeout => CloseReason::AuthTimeout,
        }
    }
}

/// External ticket validation.
pub trait Authorizer: Send + Sync + 'static {
    fn validate_ticket<'a>(&'a self, token: &'a str, room_id: &'a str) -> BoxFuture<'a, Result<Ticket, AuthError>>;
}

/// Room ids must be non-empty, bounded and free of control characters.
pub fn validate_room_id(room_id: &str) -> Result<(), AuthError> {
    if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN || room_id.chars().any(char::is_control) {
        return Err(AuthError::RoomNotFound);
    }
    Ok(())
}

/// Does `pattern` cover `room_id`? A trailing `*` matches any suffix.
pub fn room_matches(pattern: &str, room_id: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => room_id.starts_with(prefix),
        None => pattern == room_id,
    }
}

/// One entry of a static token table.
#[derive(Debug, Clone, Deserialize)]
pub struct Grant {
    pub token: String,
    /// Room ids or prefixes ending in `*`.
    pub rooms: Vec<String>,
    #[serde(default = "default_can_write")]
    pub can_write: bool,
    #[serde(default)]
    pub user: Option<String>,
    /// Seconds since the Unix epoch.
    #[serde(default)]
    pub expires_at: Option<u64>,
}

fn default_can_write() -> bool {
    true
}

impl Grant {
    pub fn new(token: impl Into<String>, rooms: &[&str], can_write: bool) -> Self {
        Self {
            token: token.into(),
            rooms: rooms.iter().map(|r| r.to_string()).collect(),
            can_write,
            user: None,
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, at: SystemTime) -> Self {
        self.expires_at = Some(at.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs());
        self
    }

    fn expiry(&self) -> Option<SystemTime> {
        self.expires_at.map(|secs| UNIX_EPOCH + Duration::from_secs(secs))
    }
}

/// Token table loaded from configuration.
#[derive(Debug, Default, Clone)]
pub struct StaticAuthorizer {
    grants: HashMap<String, Grant>,
}

impl StaticAuthorizer {
    pub fn new(grants: impl IntoIterator<Item = Grant>) -> Self {
        Self {
            grants: grants.into_iter().map(|g| (g.token.clone(), g)).collect(),
        }
    }

    pub fn insert(&mut self, grant: Grant) {
        self.grants.insert(grant.token.clone(), grant);
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Synchronous core of [`Authorizer::validate_ticket`].
    pub fn check(&self, token: &str, room_id: &str, now: SystemTime) -> Result<Ticket, AuthError> {
        validate_room_id(room_id)?;
        let grant = self.grants.get(token).ok_or(AuthError::NotAllowed)?;
        if !grant.rooms.iter().any(|pattern| room_matches(pattern, room_id)) {
            return Err(AuthError::NotAllowed);
        }
        let ticket = Ticket {
            room_id: room_id.to_string(),
            user: grant.user.clone(),
            can_write: grant.can_write,
            expires_at: grant.expiry(),
        };
        if ticket.is_expired(now) {
            return Err(AuthError::Expired);
        }
        Ok(ticket)
    }
}

impl Authorizer for StaticAuthorizer {
    fn validate_ticket<'a>(&'a self, token: &'a str, room_id: &'a str) -> BoxFuture<'a, Result<Ticket, AuthError>> {
        Box::pin(async move { self.check(token, room_id, SystemTime::now()) })
    }
}
