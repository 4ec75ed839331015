//! Heartbeat ingestion and network-state projection.
//!
//! Queries the fabric for peer nodes' heartbeat records, deduplicates stale
//! replicas, filters out nodes that are offline or too old, and projects the
//! survivors into a [`NetworkState`] snapshot for the map selector.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde_json::json;

use crate::grid::{self, MapId};
use crate::relay::RelaySession;
use crate::signer::Event;

/// Replaceable heartbeat event kind, used consistently on both the publish
/// and the read side.
pub const HEARTBEAT_KIND: u32 = 10311;

/// Discovery topic tag shared by every sync node.
pub const DISCOVERY_TOPIC: &str = "3d-scene-sync";

/// Heartbeats older than this are ignored as stale.
pub const HEARTBEAT_STALE_AFTER_SECS: i64 = 180;

/// Hard cap on one relay query.
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(15);

/// Result cap requested from relays.
const QUERY_LIMIT: u32 = 200;

/// Aggregate view of which maps the network currently guards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkState {
    pub guarded_maps: HashSet<MapId>,
    pub guardian_counts: HashMap<MapId, u32>,
    pub player_counts: HashMap<MapId, u32>,
}

/// Opens a session to `url`, collects heartbeat events until `EOSE` or the
/// 15-second hard timeout, and closes the subscription.
pub async fn query_relay(url: &str) -> Vec<Event> {
    let session = RelaySession::new(url);
    session.connect();
    let filter = json!({
        "kinds": [HEARTBEAT_KIND],
        "#t": [DISCOVERY_TOPIC],
        "limit": QUERY_LIMIT,
    });
    let mut stream = session.query(filter);

    let mut events = Vec::new();
    let deadline = tokio::time::sleep(QUERY_TIMEOUT);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => {
                tracing::debug!(relay = %url, "Heartbeat query hit hard timeout");
                break;
            }
            event = stream.recv() => {
                match event {
                    Some(event) => events.push(event),
                    None => break,
                }
            }
        }
    }
    session.disconnect();
    tracing::debug!(relay = %url, count = events.len(), "Collected heartbeat events");
    events
}

/// Projects raw heartbeat events into a [`NetworkState`].
///
/// Events are grouped by their `sync` endpoint tag keeping only the newest
/// per node, then filtered: records older than
/// [`HEARTBEAT_STALE_AFTER_SECS`] and nodes reporting `offline` or `standby`
/// do not count. A `serves=all` marker guards every seed map.
pub fn analyze_heartbeats(events: &[Event], now: i64) -> NetworkState {
    let mut newest_per_node: HashMap<&str, &Event> = HashMap::new();
    for event in events {
        // Records without a sync endpoint cannot be attributed; skip them.
        let Some(sync_url) = event.tag_value("sync") else {
            continue;
        };
        newest_per_node
            .entry(sync_url)
            .and_modify(|existing| {
                // Ties go to the later-seen record so a rapid status change
                // within one second still supersedes.
                if event.created_at >= existing.created_at {
                    *existing = event;
                }
            })
            .or_insert(event);
    }

    let mut state = NetworkState::default();
    for event in newest_per_node.into_values() {
        if event.created_at < now - HEARTBEAT_STALE_AFTER_SECS {
            continue;
        }
        if matches!(event.tag_value("status"), Some("offline" | "standby")) {
            continue;
        }

        for values in event.tag_values("map") {
            let Some(map_id) = values.first().and_then(|raw| raw.parse::<u16>().ok()) else {
                continue;
            };
            if !grid::is_valid_map(map_id) {
                continue;
            }
            let players = values
                .get(1)
                .and_then(|raw| raw.parse::<u32>().ok())
                .unwrap_or(0);
            state.guarded_maps.insert(map_id);
            *state.guardian_counts.entry(map_id).or_default() += 1;
            *state.player_counts.entry(map_id).or_default() += players;
        }

        if event.tag_value("serves") == Some("all") {
            state.guarded_maps.extend(grid::SEED_MAPS);
        }
    }
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{EventDraft, Keys};

    const NOW: i64 = 1_700_000_000;

    fn heartbeat(
        keys: &Keys,
        sync_url: &str,
        created_at: i64,
        status: &str,
        maps: &[(u16, u32)],
        serves_all: bool,
    ) -> Event {
        let mut tags = vec![
            vec!["t".to_string(), DISCOVERY_TOPIC.to_string()],
            vec!["sync".to_string(), sync_url.to_string()],
            vec!["status".to_string(), status.to_string()],
        ];
        for (map_id, players) in maps {
            tags.push(vec![
                "map".to_string(),
                map_id.to_string(),
                players.to_string(),
            ]);
        }
        if serves_all {
            tags.push(vec!["serves".to_string(), "all".to_string()]);
        }
        keys.sign_event(EventDraft {
            kind: HEARTBEAT_KIND,
            tags,
            content: String::new(),
            created_at,
        })
    }

    #[test]
    fn guarded_maps_accumulate_across_nodes() {
        let keys = Keys::generate();
        let events = vec![
            heartbeat(&keys, "wss://a", NOW - 10, "active", &[(42, 3), (43, 0)], false),
            heartbeat(&keys, "wss://b", NOW - 20, "active", &[(42, 2)], false),
        ];
        let state = analyze_heartbeats(&events, NOW);

        assert!(state.guarded_maps.contains(&42));
        assert!(state.guarded_maps.contains(&43));
        assert_eq!(state.guardian_counts[&42], 2);
        assert_eq!(state.guardian_counts[&43], 1);
        assert_eq!(state.player_counts[&42], 5);
        assert_eq!(state.player_counts[&43], 0);
    }

    #[test]
    fn only_the_newest_record_per_node_counts() {
        let keys = Keys::generate();
        let events = vec![
            heartbeat(&keys, "wss://a", NOW - 60, "active", &[(10, 9)], false),
            heartbeat(&keys, "wss://a", NOW - 5, "active", &[(11, 1)], false),
        ];
        let state = analyze_heartbeats(&events, NOW);

        assert!(!state.guarded_maps.contains(&10), "old replica superseded");
        assert!(state.guarded_maps.contains(&11));
        assert_eq!(state.guardian_counts.get(&10), None);
    }

    #[test]
    fn stale_records_are_excluded() {
        let keys = Keys::generate();
        let events = vec![heartbeat(
            &keys,
            "wss://a",
            NOW - HEARTBEAT_STALE_AFTER_SECS - 1,
            "active",
            &[(7, 2)],
            false,
        )];
        let state = analyze_heartbeats(&events, NOW);
        assert!(state.guarded_maps.is_empty());
    }

    #[test]
    fn offline_and_standby_nodes_are_excluded() {
        let keys = Keys::generate();
        let events = vec![
            heartbeat(&keys, "wss://a", NOW, "offline", &[(1, 1)], false),
            heartbeat(&keys, "wss://b", NOW, "standby", &[(2, 1)], false),
            heartbeat(&keys, "wss://c", NOW, "active", &[(3, 1)], false),
        ];
        let state = analyze_heartbeats(&events, NOW);
        assert_eq!(
            state.guarded_maps,
            [3].into_iter().collect::<HashSet<MapId>>()
        );
    }

    #[test]
    fn a_node_going_offline_supersedes_its_active_record() {
        let keys = Keys::generate();
        let events = vec![
            heartbeat(&keys, "wss://a", NOW - 30, "active", &[(5, 4)], false),
            heartbeat(&keys, "wss://a", NOW - 1, "offline", &[], false),
        ];
        let state = analyze_heartbeats(&events, NOW);
        assert!(state.guarded_maps.is_empty());
    }

    #[test]
    fn serves_all_marks_the_seed_maps_guarded() {
        let keys = Keys::generate();
        let events = vec![heartbeat(&keys, "wss://a", NOW, "active", &[], true)];
        let state = analyze_heartbeats(&events, NOW);

        for seed in grid::SEED_MAPS {
            assert!(state.guarded_maps.contains(&seed));
        }
        // Guarded only; no guardian increments for the marker.
        assert!(state.guardian_counts.is_empty());
    }

    #[test]
    fn malformed_map_tags_are_skipped() {
        let keys = Keys::generate();
        let mut event = heartbeat(&keys, "wss://a", NOW, "active", &[(9, 1)], false);
        event
            .tags
            .push(vec!["map".to_string(), "not-a-map".to_string()]);
        event
            .tags
            .push(vec!["map".to_string(), "99999".to_string(), "4".to_string()]);
        let state = analyze_heartbeats(&[event], NOW);
        assert_eq!(
            state.guarded_maps,
            [9].into_iter().collect::<HashSet<MapId>>()
        );
    }

    #[test]
    fn records_without_sync_tag_are_skipped() {
        let keys = Keys::generate();
        let event = keys.sign_event(EventDraft {
            kind: HEARTBEAT_KIND,
            tags: vec![vec!["map".to_string(), "4".to_string(), "1".to_string()]],
            content: String::new(),
            created_at: NOW,
        });
        let state = analyze_heartbeats(&[event], NOW);
        assert!(state.guarded_maps.is_empty());
    }
}
