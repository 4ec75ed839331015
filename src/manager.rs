//! Room creation, routing policy and empty-room reaping.
//!
//! The manager owns every room on this node. Rooms are created on demand
//! when the first connection for a map arrives and destroyed by the reaper
//! once they have sat empty for [`EMPTY_ROOM_TTL`]. The served-map policy is
//! read on every routing decision and atomically replaced by the map
//! selector in auto mode.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::config::ServedMapsSetting;
use crate::grid::{self, MapId};
use crate::metrics::NodeMetrics;
use crate::room::{GameEvents, Room, RoomConnection};

/// How long a room may sit empty before the reaper destroys it.
pub const EMPTY_ROOM_TTL: Duration = Duration::from_secs(300);

/// Reaper tick period.
pub const ROOM_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Which maps this node routes connections into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServedPolicy {
    /// Every valid map.
    All,
    /// Selector-driven set, rewritten every re-evaluation.
    Auto(HashSet<MapId>),
    /// Operator-pinned set.
    Explicit(HashSet<MapId>),
}

impl ServedPolicy {
    pub fn from_setting(setting: &ServedMapsSetting) -> Self {
        match setting {
            ServedMapsSetting::All => Self::All,
            // Nothing is served until the selector's first pass lands.
            ServedMapsSetting::Auto => Self::Auto(HashSet::new()),
            ServedMapsSetting::Explicit(maps) => Self::Explicit(maps.iter().copied().collect()),
        }
    }

    fn allows(&self, map_id: MapId) -> bool {
        match self {
            Self::All => true,
            Self::Auto(maps) | Self::Explicit(maps) => maps.contains(&map_id),
        }
    }
}

/// The served-map ids as advertised in heartbeats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServedMapIds {
    All,
    List(Vec<MapId>),
}

pub struct RoomManager {
    rooms: DashMap<MapId, Arc<Room>>,
    policy: RwLock<ServedPolicy>,
    hook: RwLock<Option<Arc<dyn GameEvents>>>,
    metrics: Arc<NodeMetrics>,
    shutdown: CancellationToken,
}

impl RoomManager {
    pub fn new(policy: ServedPolicy, metrics: Arc<NodeMetrics>) -> Self {
        Self {
            rooms: DashMap::new(),
            policy: RwLock::new(policy),
            hook: RwLock::new(None),
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// True iff `map_id` is on the grid and the current policy covers it.
    pub fn is_map_served(&self, map_id: u16) -> bool {
        grid::is_valid_map(map_id) && self.read_policy().allows(map_id)
    }

    /// Routes a connection into the room for `map_id`, creating the room on
    /// first use. Returns the room so the front door can replay the opening
    /// `auth` message into it; `None` means the map is not served here.
    pub fn add_connection(&self, conn: RoomConnection, map_id: MapId) -> Option<Arc<Room>> {
        if !self.is_map_served(map_id) {
            return None;
        }
        let room = self
            .rooms
            .entry(map_id)
            .or_insert_with(|| {
                self.metrics.increment_rooms_created();
                tracing::info!(map_id, "Creating room");
                let room = Arc::new(Room::new(map_id, self.metrics.clone()));
                if let Some(hook) = self.read_hook() {
                    room.set_hook(hook);
                }
                room
            })
            .clone();
        // A new arrival resets the empty clock immediately, without waiting
        // for the next reaper pass.
        room.set_empty_since_millis(0);
        room.add_connection(conn);
        Some(room)
    }

    /// Player counts per map, omitting empty rooms.
    pub fn get_player_counts(&self) -> HashMap<MapId, usize> {
        self.rooms
            .iter()
            .map(|entry| (*entry.key(), entry.value().player_count()))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    pub fn total_player_count(&self) -> usize {
        self.rooms
            .iter()
            .map(|entry| entry.value().player_count())
            .sum()
    }

    /// Maps that currently have a room instantiated.
    pub fn get_active_map_ids(&self) -> Vec<MapId> {
        self.rooms.iter().map(|entry| *entry.key()).collect()
    }

    pub fn active_room_count(&self) -> usize {
        self.rooms.len()
    }

    /// The served set as advertised in heartbeats.
    pub fn get_served_map_ids(&self) -> ServedMapIds {
        match &*self.read_policy() {
            ServedPolicy::All => ServedMapIds::All,
            ServedPolicy::Auto(maps) | ServedPolicy::Explicit(maps) => {
                let mut list: Vec<MapId> = maps.iter().copied().collect();
                list.sort_unstable();
                ServedMapIds::List(list)
            }
        }
    }

    /// Atomic replacement of the served set. Rooms that fall out of the set
    /// are left alone; the empty-room reaper retires them organically.
    pub fn update_served_maps(&self, maps: HashSet<MapId>) {
        let mut policy = self
            .policy
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let is_auto = matches!(&*policy, ServedPolicy::Auto(_));
        *policy = if is_auto {
            ServedPolicy::Auto(maps)
        } else {
            ServedPolicy::Explicit(maps)
        };
    }

    /// Installs the presence observer on existing and future rooms.
    pub fn set_game_hook(&self, hook: Arc<dyn GameEvents>) {
        *self
            .hook
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(hook.clone());
        for room in &self.rooms {
            room.value().set_hook(hook.clone());
        }
    }

    /// Sends a game event to one map's room, if it exists.
    pub fn broadcast_game_event(&self, map_id: MapId, event: &str, data: serde_json::Value) {
        if let Some(room) = self.rooms.get(&map_id) {
            room.broadcast_game_event(event, data);
        }
    }

    /// Fans the idle sweep out to every room, then starts the empty clock on
    /// any room the sweep drained, so the reaper's TTL runs from the sweep
    /// rather than its own next pass.
    pub fn cleanup_inactive(&self, max_idle: Duration) {
        let rooms: Vec<Arc<Room>> = self.rooms.iter().map(|e| e.value().clone()).collect();
        for room in rooms {
            room.cleanup_inactive(max_idle);
        }
        let now_millis = epoch_millis();
        for entry in &self.rooms {
            let room = entry.value();
            if room.player_count() == 0 && room.empty_since_millis() == 0 {
                room.set_empty_since_millis(now_millis);
            }
        }
    }

    /// One reaper pass. Two-phase: a room must first be observed empty, then
    /// still be empty `ttl` later, before it is destroyed. Brief dips to
    /// zero players do not churn rooms.
    pub fn reap_empty_rooms(&self, now_millis: u64, ttl: Duration) {
        let mut doomed = Vec::new();
        for entry in &self.rooms {
            let room = entry.value();
            if room.player_count() > 0 {
                room.set_empty_since_millis(0);
            } else {
                let since = room.empty_since_millis();
                if since == 0 {
                    room.set_empty_since_millis(now_millis);
                } else if now_millis.saturating_sub(since) > ttl.as_millis() as u64 {
                    doomed.push(*entry.key());
                }
            }
        }
        for map_id in doomed {
            if let Some((_, room)) = self.rooms.remove(&map_id) {
                tracing::info!(map_id, "Reaping empty room");
                self.metrics.increment_rooms_reaped();
                room.destroy();
            }
        }
    }

    /// Starts the periodic reaper. Stops when the manager is destroyed.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(ROOM_REAP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        manager.reap_empty_rooms(epoch_millis(), EMPTY_ROOM_TTL);
                    }
                }
            }
        });
    }

    /// Stops the reaper and destroys every room.
    pub fn destroy(&self) {
        self.shutdown.cancel();
        let rooms: Vec<(MapId, Arc<Room>)> = self
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        self.rooms.clear();
        for (map_id, room) in rooms {
            tracing::debug!(map_id, "Destroying room on shutdown");
            room.destroy();
        }
    }

    fn read_policy(&self) -> std::sync::RwLockReadGuard<'_, ServedPolicy> {
        self.policy
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn read_hook(&self) -> Option<Arc<dyn GameEvents>> {
        self.hook
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

fn epoch_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
