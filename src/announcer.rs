//! Node-state heartbeat publishing.
//!
//! Builds a signed heartbeat record every minute from the room manager's
//! live counts and broadcasts it over the relay pool. Delivery is
//! best-effort: a relay rejecting or timing out is logged and ignored.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::discovery::{DISCOVERY_TOPIC, HEARTBEAT_KIND};
use crate::manager::{RoomManager, ServedMapIds};
use crate::metrics::NodeMetrics;
use crate::relay::RelayPool;
use crate::signer::{Event, EventDraft, Keys};

/// Heartbeat publish period.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Grace period after opening sessions before the first publish.
const STABILIZE_DELAY: Duration = Duration::from_secs(2);

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_OFFLINE: &str = "offline";

pub struct Announcer {
    pool: RelayPool,
    manager: Arc<RoomManager>,
    keys: Keys,
    sync_url: String,
    region: Option<String>,
    capacity: usize,
    started_at: StdMutex<Option<Instant>>,
    cancel: CancellationToken,
    task: StdMutex<Option<JoinHandle<()>>>,
    metrics: Arc<NodeMetrics>,
}

impl Announcer {
    pub fn new(
        pool: RelayPool,
        manager: Arc<RoomManager>,
        keys: Keys,
        sync_url: String,
        region: Option<String>,
        capacity: usize,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            pool,
            manager,
            keys,
            sync_url,
            region,
            capacity,
            started_at: StdMutex::new(None),
            cancel: CancellationToken::new(),
            task: StdMutex::new(None),
            metrics,
        }
    }

    /// Opens all relay sessions and starts the periodic publish task. The
    /// first heartbeat goes out after a short settling delay.
    pub fn start(self: &Arc<Self>) {
        *self.lock_started_at() = Some(Instant::now());
        self.pool.connect_all();
        tracing::info!(
            relays = self.pool.len(),
            sync_url = %self.sync_url,
            "Starting heartbeat announcer"
        );

        let announcer = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(STABILIZE_DELAY) => {}
            }
            let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                announcer.publish_heartbeat(STATUS_ACTIVE).await;
                tokio::select! {
                    () = cancel.cancelled() => return,
                    _ = interval.tick() => {}
                }
            }
        });
        *self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(handle);
    }

    /// Stops the periodic task, publishes one final `offline` heartbeat and
    /// tears down the sessions. Publish failures never block shutdown.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self
            .task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.publish_heartbeat(STATUS_OFFLINE).await;
        self.pool.disconnect_all();
        tracing::info!("Heartbeat announcer stopped");
    }

    /// Signs and broadcasts one heartbeat. Returns how many relays
    /// acknowledged it.
    pub async fn publish_heartbeat(&self, status: &str) -> usize {
        let event = self.build_heartbeat(status);
        let accepted = self.pool.publish_all(&event).await;
        self.metrics.increment_heartbeats_published();
        if accepted == 0 && !self.pool.is_empty() {
            self.metrics.increment_heartbeat_publish_failures();
            tracing::warn!(status, "No relay acknowledged the heartbeat");
        } else {
            tracing::debug!(status, accepted, relays = self.pool.len(), "Heartbeat published");
        }
        accepted
    }

    /// Assembles the signed heartbeat record from live node state.
    ///
    /// Under an `all` policy the record carries a `serves=all` marker and a
    /// `map` tag only for maps with players, never one per map of the grid.
    /// An explicit served list gets a `map` tag per served map, counts
    /// included even when zero.
    pub fn build_heartbeat(&self, status: &str) -> Event {
        let uptime_secs = self
            .lock_started_at()
            .map(|started| started.elapsed().as_secs())
            .unwrap_or(0);
        let load = self.manager.total_player_count();
        let rooms = self.manager.active_room_count();
        let player_counts = self.manager.get_player_counts();

        let mut tags = vec![
            vec!["t".to_string(), DISCOVERY_TOPIC.to_string()],
            vec!["sync".to_string(), self.sync_url.clone()],
            vec!["status".to_string(), status.to_string()],
            vec!["load".to_string(), load.to_string()],
            vec!["capacity".to_string(), self.capacity.to_string()],
            vec!["rooms".to_string(), rooms.to_string()],
            vec!["uptime".to_string(), uptime_secs.to_string()],
        ];
        if let Some(region) = &self.region {
            tags.push(vec!["region".to_string(), region.clone()]);
        }

        match self.manager.get_served_map_ids() {
            ServedMapIds::All => {
                tags.push(vec!["serves".to_string(), "all".to_string()]);
                let mut occupied: Vec<_> = player_counts.into_iter().collect();
                occupied.sort_unstable();
                for (map_id, players) in occupied {
                    tags.push(vec![
                        "map".to_string(),
                        map_id.to_string(),
                        players.to_string(),
                    ]);
                }
            }
            ServedMapIds::List(served) => {
                for map_id in served {
                    let players = player_counts.get(&map_id).copied().unwrap_or(0);
                    tags.push(vec![
                        "map".to_string(),
                        map_id.to_string(),
                        players.to_string(),
                    ]);
                }
            }
        }

        self.keys.sign_event(EventDraft {
            kind: HEARTBEAT_KIND,
            tags,
            content: String::new(),
            created_at: chrono::Utc::now().timestamp(),
        })
    }

    fn lock_started_at(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.started_at
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::ServedPolicy;

    fn test_announcer(policy: ServedPolicy) -> Announcer {
        let metrics = Arc::new(NodeMetrics::new());
        Announcer::new(
            RelayPool::new(Vec::new()),
            Arc::new(RoomManager::new(policy, metrics.clone())),
            Keys::generate(),
            "wss://node.example.com/ws".to_string(),
            Some("eu-west".to_string()),
            100,
            metrics,
        )
    }

    fn tag<'a>(event: &'a Event, key: &str) -> Option<&'a str> {
        event.tag_value(key)
    }

    #[test]
    fn heartbeat_carries_the_discovery_tags() {
        let announcer = test_announcer(ServedPolicy::All);
        let event = announcer.build_heartbeat(STATUS_ACTIVE);

        assert_eq!(event.kind, HEARTBEAT_KIND);
        assert!(event.verify());
        assert_eq!(tag(&event, "t"), Some(DISCOVERY_TOPIC));
        assert_eq!(tag(&event, "sync"), Some("wss://node.example.com/ws"));
        assert_eq!(tag(&event, "status"), Some("active"));
        assert_eq!(tag(&event, "load"), Some("0"));
        assert_eq!(tag(&event, "capacity"), Some("100"));
        assert_eq!(tag(&event, "rooms"), Some("0"));
        assert_eq!(tag(&event, "region"), Some("eu-west"));
        assert!(tag(&event, "uptime").is_some());
    }

    #[test]
    fn all_policy_emits_marker_and_no_empty_map_tags() {
        let announcer = test_announcer(ServedPolicy::All);
        let event = announcer.build_heartbeat(STATUS_ACTIVE);

        assert_eq!(tag(&event, "serves"), Some("all"));
        assert_eq!(
            event.tag_values("map").count(),
            0,
            "no players means no map tags under the all policy"
        );
    }

    #[test]
    fn explicit_policy_emits_map_tags_with_zero_counts() {
        let announcer =
            test_announcer(ServedPolicy::Explicit([12, 7].into_iter().collect()));
        let event = announcer.build_heartbeat(STATUS_ACTIVE);

        assert!(tag(&event, "serves").is_none());
        let maps: Vec<_> = event.tag_values("map").collect();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0], ["7".to_string(), "0".to_string()]);
        assert_eq!(maps[1], ["12".to_string(), "0".to_string()]);
    }

    #[test]
    fn offline_status_is_carried_verbatim() {
        let announcer = test_announcer(ServedPolicy::All);
        let event = announcer.build_heartbeat(STATUS_OFFLINE);
        assert_eq!(tag(&event, "status"), Some("offline"));
    }
}
