//! Pluggable snapshot persistence.
//!
//! A room loads its snapshot once when first used and saves it when evicted.
//! Nothing else touches persistence, so adapters only need whole-snapshot
//! reads and writes keyed by room id.

use std::collections::HashMap;

use futures_util::future::BoxFuture;
use huddle_core::StorageSnapshot;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("snapshot encoding error: {0}")]
    Encoding(String),
    #[error("persistence call timed out")]
    Timeout,
}

pub trait Persistence: Send + Sync + 'static {
    fn load<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Option<StorageSnapshot>, PersistenceError>>;

    fn save<'a>(&'a self, room_id: &'a str, snapshot: StorageSnapshot) -> BoxFuture<'a, Result<(), PersistenceError>>;
}

/// Bincode form used by byte-oriented adapters.
pub fn encode_snapshot(snapshot: &StorageSnapshot) -> Result<Vec<u8>, PersistenceError> {
    bincode::serde::encode_to_vec(snapshot, bincode::config::standard())
        .map_err(|e| PersistenceError::Encoding(e.to_string()))
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<StorageSnapshot, PersistenceError> {
    let (snapshot, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| PersistenceError::Encoding(e.to_string()))?;
    Ok(snapshot)
}

/// In-process snapshots; lost on restart.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    rooms: RwLock<HashMap<String, StorageSnapshot>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stored(&self, room_id: &str) -> Option<StorageSnapshot> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rooms.read().await.is_empty()
    }
}

impl Persistence for MemoryPersistence {
    fn load<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Option<StorageSnapshot>, PersistenceError>> {
        Box::pin(async move { Ok(self.rooms.read().await.get(room_id).cloned()) })
    }

    fn save<'a>(&'a self, room_id: &'a str, snapshot: StorageSnapshot) -> BoxFuture<'a, Result<(), PersistenceError>> {
        Box::pin(async move {
            self.rooms.write().await.insert(room_id.to_string(), snapshot);
            Ok(())
        })
    }
}
