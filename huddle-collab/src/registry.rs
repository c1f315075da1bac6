//! Room registry: one [`RoomSession`] per room id, created on first use and
//! evicted once idle.
//!
//! The map lock is only held for lookup, insert and remove. Persistence
//! runs on cloned `Arc`s with the map unlocked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::RoomSettings;
use crate::persistence::Persistence;
use crate::room::RoomSession;

pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<RoomSession>>>,
    persistence: Arc<dyn Persistence>,
    settings: RoomSettings,
}

impl std::fmt::Debug for RoomRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomRegistry")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RoomRegistry {
    pub fn new(settings: RoomSettings, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            persistence,
            settings,
        }
    }

    pub fn settings(&self) -> &RoomSettings {
        &self.settings
    }

    /// The room for `room_id`, created if absent. Concurrent callers get the
    /// same instance.
    pub async fn get_or_create(&self, room_id: &str) -> Arc<RoomSession> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(room_id) {
                return Arc::clone(room);
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check: another task may have created it in between
        if let Some(room) = rooms.get(room_id) {
            return Arc::clone(room);
        }
        let room = Arc::new(RoomSession::new(
            room_id,
            self.settings.clone(),
            Arc::clone(&self.persistence),
        ));
        rooms.insert(room_id.to_string(), Arc::clone(&room));
        log::debug!("Created room {room_id} ({} rooms)", rooms.len());
        room
    }

    pub async fn get(&self, room_id: &str) -> Option<Arc<RoomSession>> {
        self.rooms.read().await.get(room_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of loaded rooms, sorted.
    pub async fn active_rooms(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn all_rooms(&self) -> Vec<Arc<RoomSession>> {
        self.rooms.read().await.values().cloned().collect()
    }

    /// Persist and drop rooms that have been empty for the eviction grace
    /// period. A failed save is logged and the room is dropped anyway.
    /// Returns the evicted ids.
    pub async fn evict_idle(&self, now: Instant) -> Vec<String> {
        let mut evicted = Vec::new();
        for room in self.all_rooms().await {
            if !room.try_begin_eviction(now).await {
                continue;
            }
            if let Err(e) = room.persist().await {
                log::error!("{e}; evicting room {} without saving", room.room_id());
            }

            let mut rooms = self.rooms.write().await;
            if rooms.get(room.room_id()).is_some_and(|current| Arc::ptr_eq(current, &room)) {
                rooms.remove(room.room_id());
                evicted.push(room.room_id().to_string());
                log::info!("Evicted idle room {} ({} rooms left)", room.room_id(), rooms.len());
            }
        }
        evicted
    }

    /// Heartbeat sweep of every room, then idle eviction.
    pub async fn sweep(&self, now: Instant) -> Vec<String> {
        for room in self.all_rooms().await {
            let dropped = room.sweep(now).await;
            if !dropped.is_empty() {
                log::debug!("Room {}: {} sessions timed out", room.room_id(), dropped.len());
            }
        }
        self.evict_idle(now).await
    }

    /// Run [`sweep`](Self::sweep) every `period` until the handle is aborted.
    pub fn spawn_maintenance(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sweep(Instant::now()).await;
            }
        })
    }

    /// Close one room's sessions, save it and forget it. Clients reconnect
    /// into a fresh instance loaded from persistence.
    pub async fn close_room(&self, room_id: &str) -> bool {
        let Some(room) = self.rooms.write().await.remove(room_id) else {
            return false;
        };
        room.shutdown().await;
        if let Err(e) = room.persist().await {
            log::error!("{e}");
        }
        log::info!("Closed room {room_id}");
        true
    }

    /// Close every session and persist every room.
    pub async fn shutdown(&self) {
        let rooms: Vec<Arc<RoomSession>> = self.rooms.write().await.drain().map(|(_, room)| room).collect();
        for room in rooms {
            room.shutdown().await;
            if let Err(e) = room.persist().await {
                log::error!("{e}");
            }
        }
        log::info!("Room registry shut down");
    }
}
