//! Served-map selection via frontier expansion.
//!
//! Active only under the `auto` policy. Each pass queries the fabric for
//! peer heartbeats, anchors on the least-guarded seed map, scores the
//! unguarded maps adjacent to the guarded set, and rewrites the room
//! manager's served set with the winners. Rooms that fall out of the set are
//! not destroyed; the empty-room reaper retires them once their clients
//! drift away.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::discovery::{self, NetworkState};
use crate::grid::{self, MapId};
use crate::manager::RoomManager;

/// How often the served set is re-evaluated.
pub const REEVALUATE_INTERVAL: Duration = Duration::from_secs(30 * 60);

/// Score bonus for a frontier map no node guards at all.
const ORPHAN_BONUS: i64 = 500;

pub struct MapSelector {
    relays: Vec<String>,
    manager: Arc<RoomManager>,
    target_maps: usize,
    cancel: CancellationToken,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl MapSelector {
    pub fn new(relays: Vec<String>, manager: Arc<RoomManager>, target_maps: usize) -> Self {
        Self {
            relays,
            manager,
            target_maps,
            cancel: CancellationToken::new(),
            task: std::sync::Mutex::new(None),
        }
    }

    /// Runs the first pass immediately, then re-evaluates periodically.
    pub fn start(self: &Arc<Self>) {
        let selector = Arc::clone(self);
        let cancel = self.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(REEVALUATE_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            interval.tick().await;
            loop {
                selector.tick().await;
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
    }

    /// One selection pass: snapshot the network, expand the frontier, and
    /// hand the chosen set to the room manager.
    pub async fn tick(&self) {
        // First relay that returns anything wins; later relays are fallback.
        let mut events = Vec::new();
        for url in &self.relays {
            events = discovery::query_relay(url).await;
            if !events.is_empty() {
                break;
            }
        }
        let now = chrono::Utc::now().timestamp();
        let state = discovery::analyze_heartbeats(&events, now);
        let served = select_served_maps(&state, self.target_maps);
        tracing::info!(
            guarded = state.guarded_maps.len(),
            chosen = served.len(),
            "Re-evaluated served maps via frontier expansion"
        );
        self.manager.update_served_maps(served);
    }
}

/// Picks the anchor seed: the one with the fewest guardians, ties broken
/// uniformly at random.
pub fn choose_birth_seed(state: &NetworkState) -> MapId {
    let count_of = |seed: MapId| state.guardian_counts.get(&seed).copied().unwrap_or(0);
    let min = grid::SEED_MAPS
        .iter()
        .map(|&seed| count_of(seed))
        .min()
        .unwrap_or(0);
    let candidates: Vec<MapId> = grid::SEED_MAPS
        .iter()
        .copied()
        .filter(|&seed| count_of(seed) == min)
        .collect();
    candidates[fastrand::usize(..candidates.len())]
}

/// The unguarded valid maps reachable from the guarded set's 8-neighborhood.
pub fn frontier_of(guarded: &HashSet<MapId>) -> HashSet<MapId> {
    let mut frontier = HashSet::new();
    for &map_id in guarded {
        for neighbor in grid::neighbors8(map_id) {
            if !guarded.contains(&neighbor) {
                frontier.insert(neighbor);
            }
        }
    }
    frontier
}

/// Frontier score: orphan bonus + scarcity + demand + proximity to the
/// birth seed.
pub fn score_map(state: &NetworkState, birth_seed: MapId, map_id: MapId) -> i64 {
    let guardians = i64::from(state.guardian_counts.get(&map_id).copied().unwrap_or(0));
    let players = i64::from(state.player_counts.get(&map_id).copied().unwrap_or(0));

    let orphan_bonus = if guardians == 0 { ORPHAN_BONUS } else { 0 };
    let scarcity = (100 - 50 * guardians).max(0);
    let demand = (20 * players).min(100);
    let proximity = (50 - i64::from(grid::manhattan_distance(birth_seed, map_id))).max(0);
    orphan_bonus + scarcity + demand + proximity
}

/// Full selection pass against a network snapshot.
pub fn select_served_maps(state: &NetworkState, target_maps: usize) -> HashSet<MapId> {
    let birth_seed = choose_birth_seed(state);
    select_from_birth_seed(state, birth_seed, target_maps)
}

/// Deterministic remainder of the pass once the (possibly random) birth
/// seed is fixed: equal scores are ordered by map id.
pub fn select_from_birth_seed(
    state: &NetworkState,
    birth_seed: MapId,
    target_maps: usize,
) -> HashSet<MapId> {
    let mut guarded = state.guarded_maps.clone();
    // Seeds are always implicitly guarded by the grid.
    guarded.extend(grid::SEED_MAPS);

    let frontier = frontier_of(&guarded);
    let mut scored: Vec<(i64, MapId)> = frontier
        .into_iter()
        .map(|map_id| (score_map(state, birth_seed, map_id), map_id))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let mut served: HashSet<MapId> = scored
        .into_iter()
        .take(target_maps)
        .map(|(_, map_id)| map_id)
        .collect();
    served.insert(birth_seed);
    served
}
