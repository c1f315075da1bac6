//! Server and room configuration.
//!
//! Every field has a default, so a TOML file only lists what it changes:
//!
//! ```toml
//! bind_addr = "0.0.0.0:9090"
//! heartbeat_timeout_ms = 20000
//!
//! [storage]
//! path = "/var/lib/huddle"
//!
//! [[tickets]]
//! token = "dev-token"
//! rooms = ["demo-*"]
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use huddle_core::DEFAULT_REPLAY_WINDOW;
use serde::Deserialize;
use thiserror::Error;

use crate::auth::Grant;
use crate::presence::DEFAULT_THROTTLE;
use crate::storage::StoreConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// Frames buffered per connection before it counts as a slow consumer.
    pub outbound_queue_capacity: usize,
    pub max_sessions_per_room: usize,
    pub heartbeat_timeout_ms: u64,
    pub auth_timeout_ms: u64,
    pub persistence_timeout_ms: u64,
    /// How long an empty room stays loaded.
    pub eviction_grace_ms: u64,
    /// Period of heartbeat sweeps and idle eviction.
    pub maintenance_interval_ms: u64,
    /// Ops kept per room for incremental catch-up.
    pub replay_window: usize,
    /// Sequenced ops between tombstone collections.
    pub gc_every_ops: u64,
    /// RocksDB snapshots; in-memory when absent.
    pub storage: Option<StoreConfig>,
    pub tickets: Vec<Grant>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            outbound_queue_capacity: 256,
            max_sessions_per_room: 100,
            heartbeat_timeout_ms: 30_000,
            auth_timeout_ms: 5_000,
            persistence_timeout_ms: 5_000,
            eviction_grace_ms: 60_000,
            maintenance_interval_ms: 1_000,
            replay_window: DEFAULT_REPLAY_WINDOW,
            gc_every_ops: 256,
            storage: None,
            tickets: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_millis(self.maintenance_interval_ms.max(1))
    }

    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            outbound_queue_capacity: self.outbound_queue_capacity,
            max_sessions: self.max_sessions_per_room,
            heartbeat_timeout: Duration::from_millis(self.heartbeat_timeout_ms),
            persistence_timeout: Duration::from_millis(self.persistence_timeout_ms),
            eviction_grace: Duration::from_millis(self.eviction_grace_ms),
            replay_window: self.replay_window,
            gc_every_ops: self.gc_every_ops,
        }
    }
}

/// Per-room limits, derived from [`ServerConfig`].
#[derive(Debug, Clone, PartialEq)]
pub struct RoomSettings {
    pub outbound_queue_capacity: usize,
    pub max_sessions: usize,
    pub heartbeat_timeout: Duration,
    pub persistence_timeout: Duration,
    pub eviction_grace: Duration,
    pub replay_window: usize,
    pub gc_every_ops: u64,
}

impl Default for RoomSettings {
    fn default() -> Self {
        ServerConfig::default().room_settings()
    }
}

/// Client-side timing.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub presence_throttle: Duration,
    /// Interval between `PING`s; keep well under the server's heartbeat
    /// timeout.
    pub ping_interval: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            presence_throttle: DEFAULT_THROTTLE,
            ping_interval: Duration::from_secs(10),
            backoff_base: Duration::from_millis(250),
            backoff_max: Duration::from_secs(10),
        }
    }
}
