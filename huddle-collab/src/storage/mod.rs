//! Durable storage adapters.
//!
//! ```text
//! ┌─────────────┐  load / save   ┌──────────────────┐
//! │ RoomSession │ ─────────────► │ RocksPersistence │
//! └─────────────┘  (Persistence) │  spawn_blocking  │
//!                                └────────┬─────────┘
//!                                         ▼
//!                     ┌───────────────────────────────────┐
//!                     │ CF "snapshots" — LZ4 bincode trees │
//!                     │ CF "metadata"  — clock, sizes      │
//!                     └───────────────────────────────────┘
//! ```

pub mod rocks;

pub use rocks::{RocksPersistence, RoomMetadata, SnapshotStore, StoreConfig, StoreError};
