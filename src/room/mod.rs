//! Per-map room state and message fan-out.
//!
//! A room owns every connection routed to its map: the auth handshake state
//! machine, the presence set, the pubkey index and the per-connection AOI
//! subscription. All mutations of a room's state go through one mutex, so
//! transport events, the idle sweeper and the reaper observe a single total
//! order (and outbound `msgId`s are strictly increasing per room).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth;
use crate::grid::{self, MapId};
use crate::metrics::NodeMetrics;
use crate::protocol::{ClientMessage, ErrorCode, PeerSnapshot, Position, ServerMessage};

/// Handle for one connection, installed by the front door.
#[derive(Debug, Clone)]
pub struct RoomConnection {
    pub id: Uuid,
    /// Bounded outbound queue; a full queue drops the connection.
    pub sender: mpsc::Sender<Arc<ServerMessage>>,
    /// Tripped by the room to force the transport closed.
    pub cancel: CancellationToken,
}

/// Observer for presence changes, pluggable by the supervisor.
pub trait GameEvents: Send + Sync {
    fn peer_joined(&self, map_id: MapId, pubkey: &str) {
        let _ = (map_id, pubkey);
    }
    fn peer_left(&self, map_id: MapId, pubkey: &str) {
        let _ = (map_id, pubkey);
    }
}

/// Maximum chat text length, in characters.
const MAX_CHAT_CHARS: usize = 500;

/// Maximum emote length, in characters.
const MAX_EMOJI_CHARS: usize = 16;

enum AuthState {
    /// Waiting for the initial `auth` claim.
    AwaitAuth,
    /// Challenge issued, waiting for the signed response.
    AwaitResponse { pubkey: String, challenge: String },
    /// Installed in the pubkey index.
    Authenticated { pubkey: String },
}

struct RoomClient {
    conn: RoomConnection,
    auth: AuthState,
    position: Position,
    cell: String,
    subscribed_cells: HashSet<String>,
    avatar: Option<Value>,
    last_activity: Instant,
}

impl RoomClient {
    fn new(conn: RoomConnection) -> Self {
        Self {
            conn,
            auth: AuthState::AwaitAuth,
            position: Position::default(),
            cell: grid::cell_from_position(0.0, 0.0),
            subscribed_cells: HashSet::new(),
            avatar: None,
            last_activity: Instant::now(),
        }
    }

    fn is_authenticated(&self) -> bool {
        matches!(self.auth, AuthState::Authenticated { .. })
    }

    fn pubkey(&self) -> Option<&str> {
        match &self.auth {
            AuthState::Authenticated { pubkey } => Some(pubkey),
            _ => None,
        }
    }
}

#[derive(Default)]
struct RoomState {
    clients: HashMap<Uuid, RoomClient>,
    /// Single-writer index: pubkey of each authenticated client -> its
    /// current connection.
    pubkey_index: HashMap<String, Uuid>,
}

/// Presence change collected under the lock, delivered to the hook after it
/// is released (the hook may call back into the room).
enum HookEvent {
    Joined(String),
    Left(String),
}

pub struct Room {
    map_id: MapId,
    state: Mutex<RoomState>,
    next_msg_id: AtomicU64,
    /// Epoch millis of the moment the room was last seen empty; 0 while it
    /// has players. Written by the manager's reaper.
    empty_since: AtomicU64,
    hook: RwLock<Option<Arc<dyn GameEvents>>>,
    metrics: Arc<NodeMetrics>,
}

impl Room {
    pub fn new(map_id: MapId, metrics: Arc<NodeMetrics>) -> Self {
        Self {
            map_id,
            state: Mutex::new(RoomState::default()),
            next_msg_id: AtomicU64::new(1),
            empty_since: AtomicU64::new(0),
            hook: RwLock::new(None),
            metrics,
        }
    }

    pub fn map_id(&self) -> MapId {
        self.map_id
    }

    pub fn set_hook(&self, hook: Arc<dyn GameEvents>) {
        *self.hook.write().unwrap_or_else(std::sync::PoisonError::into_inner) = Some(hook);
    }

    /// Installs a connection fresh out of the front door. The client starts
    /// unauthenticated and must complete the challenge handshake.
    pub fn add_connection(&self, conn: RoomConnection) {
        let mut state = self.lock_state();
        state.clients.insert(conn.id, RoomClient::new(conn));
    }

    /// Number of authenticated clients.
    pub fn player_count(&self) -> usize {
        self.lock_state()
            .clients
            .values()
            .filter(|c| c.is_authenticated())
            .count()
    }

    pub(crate) fn empty_since_millis(&self) -> u64 {
        self.empty_since.load(Ordering::Relaxed)
    }

    pub(crate) fn set_empty_since_millis(&self, value: u64) {
        self.empty_since.store(value, Ordering::Relaxed);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, RoomState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn next_msg_id(&self) -> u64 {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Dispatches one inbound client message. Unknown connections and
    /// malformed inputs are ignored.
    pub fn handle_message(&self, conn_id: Uuid, message: ClientMessage) {
        let mut hook_events = Vec::new();
        {
            let mut state = self.lock_state();
            let authenticated = {
                let Some(client) = state.clients.get_mut(&conn_id) else {
                    return;
                };
                client.last_activity = Instant::now();
                client.is_authenticated()
            };

            if authenticated {
                self.handle_authenticated(&mut state, conn_id, message);
            } else {
                self.handle_pre_auth(&mut state, conn_id, message, &mut hook_events);
            }
        }
        self.fire_hooks(hook_events);
    }

    fn handle_pre_auth(
        &self,
        state: &mut RoomState,
        conn_id: Uuid,
        message: ClientMessage,
        hook_events: &mut Vec<HookEvent>,
    ) {
        match message {
            ClientMessage::Ping => {
                if let Some(client) = state.clients.get(&conn_id) {
                    self.deliver(client, Arc::new(ServerMessage::Pong));
                }
            }
            // A repeated auth claim re-issues the challenge.
            ClientMessage::Auth { pubkey, .. } => {
                let challenge = auth::generate_challenge();
                if let Some(client) = state.clients.get_mut(&conn_id) {
                    client.auth = AuthState::AwaitResponse {
                        pubkey,
                        challenge: challenge.clone(),
                    };
                    self.deliver(client, Arc::new(ServerMessage::AuthChallenge { challenge }));
                }
            }
            ClientMessage::AuthResponse { signature } => {
                self.handle_auth_response(state, conn_id, &signature, hook_events);
            }
            _ => {
                if let Some(client) = state.clients.get(&conn_id) {
                    self.deliver(client, error_message(ErrorCode::AuthRequired));
                }
            }
        }
    }

    fn handle_auth_response(
        &self,
        state: &mut RoomState,
        conn_id: Uuid,
        signature: &str,
        hook_events: &mut Vec<HookEvent>,
    ) {
        let Some(client) = state.clients.get(&conn_id) else {
            return;
        };
        let AuthState::AwaitResponse { pubkey, challenge } = &client.auth else {
            // auth_response without a pending challenge
            self.deliver(client, error_message(ErrorCode::AuthRequired));
            return;
        };
        let pubkey = pubkey.clone();
        let challenge = challenge.clone();

        let now = chrono::Utc::now().timestamp();
        if !auth::verify_auth_response(&pubkey, &challenge, signature, now) {
            self.metrics.increment_auth_failures();
            tracing::info!(map_id = self.map_id, %conn_id, "Authentication failed");
            self.deliver(client, error_message(ErrorCode::AuthFailed));
            let removed = state.clients.remove(&conn_id);
            if let Some(removed) = removed {
                removed.conn.cancel.cancel();
            }
            return;
        }

        // Reconnect displacement: a prior connection holding this pubkey is
        // told it was replaced, removed (its peer_leave goes out first), and
        // force-closed before the new connection is installed.
        if let Some(&old_id) = state.pubkey_index.get(&pubkey) {
            if old_id != conn_id {
                if let Some(old) = state.clients.remove(&old_id) {
                    self.metrics.increment_clients_displaced();
                    tracing::info!(
                        map_id = self.map_id,
                        pubkey = %pubkey,
                        old_conn = %old_id,
                        new_conn = %conn_id,
                        "Displacing previous connection for reconnecting identity"
                    );
                    self.deliver(&old, error_message(ErrorCode::Replaced));
                    state.pubkey_index.remove(&pubkey);
                    let leave = Arc::new(ServerMessage::PeerLeave {
                        msg_id: self.next_msg_id(),
                        pubkey: pubkey.clone(),
                    });
                    self.broadcast(state, leave, None, None);
                    hook_events.push(HookEvent::Left(pubkey.clone()));
                    old.conn.cancel.cancel();
                }
            }
        }

        let peers: Vec<PeerSnapshot> = state
            .clients
            .values()
            .filter(|c| c.conn.id != conn_id)
            .filter_map(|c| {
                c.pubkey().map(|pk| PeerSnapshot {
                    pubkey: pk.to_string(),
                    position: c.position,
                    avatar: c.avatar.clone(),
                })
            })
            .collect();

        let Some(client) = state.clients.get_mut(&conn_id) else {
            return;
        };
        client.auth = AuthState::Authenticated {
            pubkey: pubkey.clone(),
        };
        state.pubkey_index.insert(pubkey.clone(), conn_id);
        self.metrics.increment_auth_successes();
        tracing::info!(map_id = self.map_id, pubkey = %pubkey, %conn_id, "Client authenticated");

        if let Some(client) = state.clients.get(&conn_id) {
            self.deliver(
                client,
                Arc::new(ServerMessage::Welcome {
                    peers,
                    map_id: u32::from(self.map_id),
                }),
            );
        }
        let avatar = state.clients.get(&conn_id).and_then(|c| c.avatar.clone());
        let join = Arc::new(ServerMessage::PeerJoin {
            msg_id: self.next_msg_id(),
            pubkey: pubkey.clone(),
            avatar,
        });
        self.broadcast(state, join, Some(conn_id), None);
        hook_events.push(HookEvent::Joined(pubkey));
    }

    fn handle_authenticated(&self, state: &mut RoomState, conn_id: Uuid, message: ClientMessage) {
        match message {
            ClientMessage::Ping => {
                if let Some(client) = state.clients.get(&conn_id) {
                    self.deliver(client, Arc::new(ServerMessage::Pong));
                }
            }
            // Duplicate auth traffic after authentication is ignored.
            ClientMessage::Auth { .. } | ClientMessage::AuthResponse { .. } => {}
            ClientMessage::Position {
                x,
                y,
                z,
                ry,
                animation,
                expression,
            } => {
                let Some(client) = state.clients.get_mut(&conn_id) else {
                    return;
                };
                client.position = Position { x, y, z, ry };
                client.cell = grid::cell_from_position(x, z);
                let cell = client.cell.clone();
                let pubkey = client.pubkey().unwrap_or_default().to_string();
                let update = Arc::new(ServerMessage::PeerPosition {
                    msg_id: self.next_msg_id(),
                    pubkey,
                    x,
                    y,
                    z,
                    ry,
                    animation,
                    expression,
                });
                self.broadcast(state, update, Some(conn_id), Some(&cell));
            }
            ClientMessage::SubscribeCells { cells } => {
                if let Some(client) = state.clients.get_mut(&conn_id) {
                    client.subscribed_cells = grid::validate_cells(&cells).into_iter().collect();
                }
            }
            ClientMessage::Chat { text } => {
                let Some(client) = state.clients.get(&conn_id) else {
                    return;
                };
                let pubkey = client.pubkey().unwrap_or_default().to_string();
                let chat = Arc::new(ServerMessage::PeerChat {
                    msg_id: self.next_msg_id(),
                    pubkey,
                    text: truncate_chars(text, MAX_CHAT_CHARS),
                });
                self.broadcast(state, chat, Some(conn_id), None);
            }
            ClientMessage::Dm { to, text } => {
                let Some(client) = state.clients.get(&conn_id) else {
                    return;
                };
                let sender_pubkey = client.pubkey().unwrap_or_default().to_string();
                // Unknown targets are dropped without a bounce.
                let Some(&target_id) = state.pubkey_index.get(&to) else {
                    return;
                };
                let Some(target) = state.clients.get(&target_id) else {
                    return;
                };
                let dm = Arc::new(ServerMessage::PeerDm {
                    msg_id: self.next_msg_id(),
                    pubkey: sender_pubkey,
                    text: truncate_chars(text, MAX_CHAT_CHARS),
                });
                self.deliver(target, dm);
                self.metrics.increment_dms_delivered();
            }
            ClientMessage::Emoji { emoji } => {
                let Some(client) = state.clients.get(&conn_id) else {
                    return;
                };
                let pubkey = client.pubkey().unwrap_or_default().to_string();
                let emote = Arc::new(ServerMessage::PeerEmoji {
                    msg_id: self.next_msg_id(),
                    pubkey,
                    emoji: truncate_chars(emoji, MAX_EMOJI_CHARS),
                });
                self.broadcast(state, emote, Some(conn_id), None);
            }
            ClientMessage::Join { avatar } => {
                let Some(client) = state.clients.get_mut(&conn_id) else {
                    return;
                };
                client.avatar = avatar.clone();
                let pubkey = client.pubkey().unwrap_or_default().to_string();
                let join = Arc::new(ServerMessage::PeerJoin {
                    msg_id: self.next_msg_id(),
                    pubkey,
                    avatar,
                });
                self.broadcast(state, join, Some(conn_id), None);
            }
        }
    }

    /// Removes a connection after its transport closed (or was replaced).
    /// Broadcasts `peer_leave` only if the connection was authenticated and
    /// is still the current entry in the pubkey index, so a displaced
    /// connection's late close cannot tear down its successor.
    pub fn handle_disconnect(&self, conn_id: Uuid) {
        let mut hook_events = Vec::new();
        {
            let mut state = self.lock_state();
            let Some(client) = state.clients.remove(&conn_id) else {
                return;
            };
            client.conn.cancel.cancel();
            if let Some(pubkey) = client.pubkey() {
                if state.pubkey_index.get(pubkey) == Some(&conn_id) {
                    let pubkey = pubkey.to_string();
                    state.pubkey_index.remove(&pubkey);
                    let leave = Arc::new(ServerMessage::PeerLeave {
                        msg_id: self.next_msg_id(),
                        pubkey: pubkey.clone(),
                    });
                    self.broadcast(&state, leave, None, None);
                    hook_events.push(HookEvent::Left(pubkey));
                }
            }
        }
        self.fire_hooks(hook_events);
    }

    /// Closes and removes every client idle for longer than `max_idle`.
    pub fn cleanup_inactive(&self, max_idle: Duration) {
        let now = Instant::now();
        let stale: Vec<Uuid> = {
            let state = self.lock_state();
            state
                .clients
                .iter()
                .filter(|(_, c)| now.duration_since(c.last_activity) > max_idle)
                .map(|(id, _)| *id)
                .collect()
        };
        for conn_id in stale {
            tracing::debug!(map_id = self.map_id, %conn_id, "Evicting idle connection");
            self.metrics.increment_idle_evictions();
            self.handle_disconnect(conn_id);
        }
    }

    /// Sends a server-injected game event to every authenticated client.
    pub fn broadcast_game_event(&self, event: impl Into<String>, data: Value) {
        let state = self.lock_state();
        let message = Arc::new(ServerMessage::GameEvent {
            msg_id: self.next_msg_id(),
            event: event.into(),
            data,
        });
        self.broadcast(&state, message, None, None);
    }

    /// Closes all transports and clears both indices.
    pub fn destroy(&self) {
        let mut state = self.lock_state();
        for client in state.clients.values() {
            client.conn.cancel.cancel();
        }
        state.clients.clear();
        state.pubkey_index.clear();
    }

    /// Fan-out to authenticated clients. `cell_filter` applies the AOI rule:
    /// deliver iff the receiver's subscription is empty or contains the cell.
    fn broadcast(
        &self,
        state: &RoomState,
        message: Arc<ServerMessage>,
        except: Option<Uuid>,
        cell_filter: Option<&str>,
    ) {
        let mut delivered = 0u64;
        for (id, client) in &state.clients {
            if Some(*id) == except || !client.is_authenticated() {
                continue;
            }
            if let Some(cell) = cell_filter {
                if !client.subscribed_cells.is_empty() && !client.subscribed_cells.contains(cell) {
                    continue;
                }
            }
            self.deliver(client, message.clone());
            delivered += 1;
        }
        self.metrics.add_messages_fanned_out(delivered);
    }

    /// Queues one message. A full queue means the client has fallen too far
    /// behind: the connection is dropped and its close path cleans up.
    fn deliver(&self, client: &RoomClient, message: Arc<ServerMessage>) {
        match client.conn.sender.try_send(message) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.increment_messages_dropped();
                tracing::warn!(
                    map_id = self.map_id,
                    conn_id = %client.conn.id,
                    "Outbound queue full, dropping connection"
                );
                client.conn.cancel.cancel();
            }
            Err(TrySendError::Closed(_)) => {
                // Transport already went away; its close event cleans up.
            }
        }
    }

    fn fire_hooks(&self, events: Vec<HookEvent>) {
        if events.is_empty() {
            return;
        }
        let hook = self
            .hook
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        let Some(hook) = hook else { return };
        for event in events {
            match event {
                HookEvent::Joined(pubkey) => hook.peer_joined(self.map_id, &pubkey),
                HookEvent::Left(pubkey) => hook.peer_left(self.map_id, &pubkey),
            }
        }
    }

    /// Test and invariant-check accessor: (clients, authenticated, index size).
    #[doc(hidden)]
    pub fn debug_counts(&self) -> (usize, usize, usize) {
        let state = self.lock_state();
        let authed = state
            .clients
            .values()
            .filter(|c| c.is_authenticated())
            .count();
        (state.clients.len(), authed, state.pubkey_index.len())
    }
}

fn error_message(code: ErrorCode) -> Arc<ServerMessage> {
    Arc::new(ServerMessage::Error {
        message: code.description().to_string(),
        code,
    })
}

fn truncate_chars(text: String, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests;
