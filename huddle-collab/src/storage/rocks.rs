//! RocksDB-backed room snapshots.
//!
//! Column families:
//! - `snapshots` — bincode `StorageSnapshot`, LZ4 compressed, keyed by room id
//! - `metadata`  — bincode [`RoomMetadata`] (clock, sizes, timestamps)
//!
//! Both are written in one batch so a crash never leaves metadata that
//! describes a different snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use futures_util::future::BoxFuture;
use huddle_core::StorageSnapshot;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode, IteratorMode,
    Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::persistence::{decode_snapshot, encode_snapshot, Persistence, PersistenceError};

const CF_SNAPSHOTS: &str = "snapshots";
const CF_METADATA: &str = "metadata";

const COLUMN_FAMILIES: &[&str] = &[CF_SNAPSHOTS, CF_METADATA];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: PathBuf,
    /// Block cache size in bytes.
    pub block_cache_size: usize,
    /// Bloom filter bits per key.
    pub bloom_filter_bits: i32,
    /// fsync every snapshot write.
    pub sync_writes: bool,
    pub max_open_files: i32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("huddle_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: true,
            max_open_files: 256,
        }
    }
}

impl StoreConfig {
    /// Small caches, no fsync.
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
        }
    }
}

/// Bookkeeping stored next to each snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomMetadata {
    pub room_id: String,
    pub clock: u64,
    pub node_count: u64,
    pub snapshot_size: u64,
    pub compressed_size: u64,
    /// Seconds since epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl RoomMetadata {
    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (meta, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(meta)
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    DatabaseError(String),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Compression error: {0}")]
    CompressionError(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<PersistenceError> for StoreError {
    fn from(e: PersistenceError) -> Self {
        StoreError::SerializationError(e.to_string())
    }
}

impl From<StoreError> for PersistenceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::SerializationError(msg) | StoreError::DeserializationError(msg) => {
                PersistenceError::Encoding(msg)
            }
            other => PersistenceError::Backend(other.to_string()),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Blocking snapshot store.
pub struct SnapshotStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

impl SnapshotStore {
    /// Open (or create) the database and its column families.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cache = Cache::new_lru_cache(config.block_cache_size);
        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config, &cache)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(&db_opts, &config.path, cf_descriptors)?;
        log::info!("Opened snapshot store at {}", config.path.display());
        Ok(Self { db, config })
    }

    fn cf_options(name: &str, config: &StoreConfig, cache: &Cache) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_cache(cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        match name {
            CF_SNAPSHOTS => {
                // values are LZ4 blocks already
                opts.set_compression_type(DBCompressionType::None);
                opts.set_max_write_buffer_number(2);
            }
            CF_METADATA => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            _ => {}
        }
        opts
    }

    /// Write a snapshot and its metadata atomically.
    pub fn save_snapshot(&self, room_id: &str, snapshot: &StorageSnapshot) -> Result<RoomMetadata, StoreError> {
        let cf_snapshots = self.cf(CF_SNAPSHOTS)?;
        let cf_meta = self.cf(CF_METADATA)?;

        let encoded = encode_snapshot(snapshot)?;
        let compressed = lz4_flex::compress_prepend_size(&encoded);

        let now = unix_now();
        let created_at = self.load_metadata(room_id)?.map_or(now, |m| m.created_at);
        let meta = RoomMetadata {
            room_id: room_id.to_string(),
            clock: snapshot.clock,
            node_count: snapshot.node_count() as u64,
            snapshot_size: encoded.len() as u64,
            compressed_size: compressed.len() as u64,
            created_at,
            updated_at: now,
        };

        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_snapshots, room_id.as_bytes(), &compressed);
        batch.put_cf(&cf_meta, room_id.as_bytes(), meta.encode()?);

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        self.db.write_opt(batch, &write_opts)?;

        log::debug!(
            "Saved room {} at clock {} ({} -> {} bytes)",
            room_id,
            meta.clock,
            meta.snapshot_size,
            meta.compressed_size
        );
        Ok(meta)
    }

    pub fn load_snapshot(&self, room_id: &str) -> Result<Option<StorageSnapshot>, StoreError> {
        let cf = self.cf(CF_SNAPSHOTS)?;
        let Some(compressed) = self.db.get_cf(&cf, room_id.as_bytes())? else {
            return Ok(None);
        };
        let encoded = lz4_flex::decompress_size_prepended(&compressed)
            .map_err(|e| StoreError::CompressionError(e.to_string()))?;
        let snapshot = decode_snapshot(&encoded).map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        Ok(Some(snapshot))
    }

    pub fn load_metadata(&self, room_id: &str) -> Result<Option<RoomMetadata>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        match self.db.get_cf(&cf, room_id.as_bytes())? {
            Some(bytes) => RoomMetadata::decode(&bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Every stored room id, in key order.
    pub fn list_rooms(&self) -> Result<Vec<String>, StoreError> {
        let cf = self.cf(CF_METADATA)?;
        let mut rooms = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            match String::from_utf8(key.to_vec()) {
                Ok(id) => rooms.push(id),
                Err(_) => log::warn!("Skipping non-UTF-8 room key"),
            }
        }
        Ok(rooms)
    }

    pub fn delete_room(&self, room_id: &str) -> Result<(), StoreError> {
        let mut batch = WriteBatch::default();
        batch.delete_cf(&self.cf(CF_SNAPSHOTS)?, room_id.as_bytes());
        batch.delete_cf(&self.cf(CF_METADATA)?, room_id.as_bytes());
        self.db.write(batch)?;
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::DatabaseError(format!("Column family '{name}' not found")))
    }
}

/// [`Persistence`] over a [`SnapshotStore`]; blocking calls run on the
/// tokio blocking pool.
#[derive(Clone)]
pub struct RocksPersistence {
    store: Arc<SnapshotStore>,
}

impl RocksPersistence {
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        Ok(Self {
            store: Arc::new(SnapshotStore::open(config)?),
        })
    }

    pub fn store(&self) -> &SnapshotStore {
        &self.store
    }
}

async fn blocking<T, F>(store: &Arc<SnapshotStore>, f: F) -> Result<T, PersistenceError>
where
    T: Send + 'static,
    F: FnOnce(&SnapshotStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || f(store.as_ref()))
        .await
        .map_err(|e| PersistenceError::Backend(e.to_string()))?
        .map_err(PersistenceError::from)
}

impl Persistence for RocksPersistence {
    fn load<'a>(&'a self, room_id: &'a str) -> BoxFuture<'a, Result<Option<StorageSnapshot>, PersistenceError>> {
        let room_id = room_id.to_string();
        Box::pin(async move { blocking(&self.store, move |s| s.load_snapshot(&room_id)).await })
    }

    fn save<'a>(&'a self, room_id: &'a str, snapshot: StorageSnapshot) -> BoxFuture<'a, Result<(), PersistenceError>> {
        let room_id = room_id.to_string();
        Box::pin(async move {
            blocking(&self.store, move |s| s.save_snapshot(&room_id, &snapshot).map(|_| ())).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use huddle_core::{Authority, ClientId, Init, NodeId, Replica};

    fn populated_snapshot(items: usize) -> StorageSnapshot {
        let mut authority = Authority::default();
        let mut replica = Replica::new(ClientId(1));
        replica
            .set(
                NodeId::ROOT,
                "items",
                Init::list((0..items).map(|i| Init::scalar(format!("item number {i}")))),
            )
            .unwrap();
        for op in replica.take_outbox() {
            authority.receive(op, 0).unwrap();
        }
        authority.snapshot()
    }

    #[test]
    fn test_store_open() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(StoreConfig::for_testing(dir.path().join("db"))).unwrap();
        assert!(store.path().exists());
        assert!(store.list_rooms().unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let snapshot = populated_snapshot(10);

        let meta = store.save_snapshot("board", &snapshot).unwrap();
        assert_eq!(meta.clock, snapshot.clock);
        assert_eq!(meta.node_count, snapshot.node_count() as u64);

        assert_eq!(store.load_snapshot("board").unwrap(), Some(snapshot));
        assert_eq!(store.load_snapshot("missing").unwrap(), None);
    }

    #[test]
    fn test_metadata_keeps_created_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let first = store.save_snapshot("board", &StorageSnapshot::empty()).unwrap();
        let second = store.save_snapshot("board", &populated_snapshot(3)).unwrap();
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(store.load_metadata("board").unwrap(), Some(second));
    }

    #[test]
    fn test_store_error_messages() {
        let err = StoreError::DeserializationError("truncated".into());
        assert_eq!(err.to_string(), "Deserialization error: truncated");
        assert!(matches!(PersistenceError::from(err), PersistenceError::Encoding(msg) if msg == "truncated"));

        let err: Box<dyn std::error::Error> = Box::new(StoreError::DatabaseError("locked".into()));
        assert_eq!(err.to_string(), "Database error: locked");
        assert!(matches!(
            PersistenceError::from(StoreError::CompressionError("bad block".into())),
            PersistenceError::Backend(msg) if msg == "Compression error: bad block"
        ));
    }

    #[test]
    fn test_compression_shrinks_repetitive_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let meta = store.save_snapshot("big", &populated_snapshot(500)).unwrap();
        assert!(meta.compressed_size < meta.snapshot_size);
    }

    #[test]
    fn test_list_and_delete_rooms() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        store.save_snapshot("a", &StorageSnapshot::empty()).unwrap();
        store.save_snapshot("b", &StorageSnapshot::empty()).unwrap();
        assert_eq!(store.list_rooms().unwrap(), vec!["a".to_string(), "b".to_string()]);

        store.delete_room("a").unwrap();
        assert_eq!(store.list_rooms().unwrap(), vec!["b".to_string()]);
        assert!(store.load_snapshot("a").unwrap().is_none());
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let snapshot = populated_snapshot(5);
        {
            let store = SnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            store.save_snapshot("board", &snapshot).unwrap();
            store.flush().unwrap();
        }
        let store = SnapshotStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        assert_eq!(store.load_snapshot("board").unwrap(), Some(snapshot));
    }

    #[tokio::test]
    async fn test_async_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let persistence = RocksPersistence::open(StoreConfig::for_testing(dir.path())).unwrap();
        let snapshot = populated_snapshot(2);

        persistence.save("room", snapshot.clone()).await.unwrap();
        assert_eq!(persistence.load("room").await.unwrap(), Some(snapshot));
        assert_eq!(persistence.load("other").await.unwrap(), None);
    }

    #[test]
    fn test_store_error_display() {
        let err = StoreError::CompressionError("bad block".into());
        assert_eq!(err.to_string(), "Compression error: bad block");
        let err: PersistenceError = StoreError::DeserializationError("x".into()).into();
        assert!(matches!(err, PersistenceError::Encoding(_)));
    }
}
