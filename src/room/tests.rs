use std::sync::Mutex as StdMutex;

use super::*;
use crate::signer::{EventDraft, Keys};

const SECRET_A: &str = "0000000000000000000000000000000000000000000000000000000000000001";
const SECRET_B: &str = "0000000000000000000000000000000000000000000000000000000000000002";
const SECRET_C: &str = "0000000000000000000000000000000000000000000000000000000000000003";

struct TestClient {
    conn_id: Uuid,
    rx: mpsc::Receiver<Arc<ServerMessage>>,
    cancel: CancellationToken,
    keys: Keys,
}

fn test_room() -> Room {
    Room::new(42, Arc::new(NodeMetrics::new()))
}

fn connect(room: &Room, secret: &str) -> TestClient {
    let (tx, rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let conn_id = Uuid::new_v4();
    room.add_connection(RoomConnection {
        id: conn_id,
        sender: tx,
        cancel: cancel.clone(),
    });
    TestClient {
        conn_id,
        rx,
        cancel,
        keys: Keys::parse(secret).expect("test secret"),
    }
}

fn recv(client: &mut TestClient) -> Arc<ServerMessage> {
    client.rx.try_recv().expect("expected a queued message")
}

fn drain(client: &mut TestClient) -> Vec<Arc<ServerMessage>> {
    let mut out = Vec::new();
    while let Ok(msg) = client.rx.try_recv() {
        out.push(msg);
    }
    out
}

fn signed_response(keys: &Keys, challenge: &str) -> String {
    let event = keys.sign_event(EventDraft {
        kind: auth::AUTH_EVENT_KIND,
        tags: Vec::new(),
        content: challenge.to_string(),
        created_at: chrono::Utc::now().timestamp(),
    });
    serde_json::to_string(&event).expect("serializable event")
}

fn authenticate(room: &Room, client: &mut TestClient) {
    room.handle_message(
        client.conn_id,
        ClientMessage::Auth {
            pubkey: client.keys.public_key().to_string(),
            map_id: u32::from(room.map_id()),
        },
    );
    let challenge = match &*recv(client) {
        ServerMessage::AuthChallenge { challenge } => challenge.clone(),
        other => panic!("expected auth_challenge, got {other:?}"),
    };
    room.handle_message(
        client.conn_id,
        ClientMessage::AuthResponse {
            signature: signed_response(&client.keys, &challenge),
        },
    );
    match &*recv(client) {
        ServerMessage::Welcome { .. } => {}
        other => panic!("expected welcome, got {other:?}"),
    }
}

fn msg_id(message: &ServerMessage) -> Option<u64> {
    match message {
        ServerMessage::PeerJoin { msg_id, .. }
        | ServerMessage::PeerLeave { msg_id, .. }
        | ServerMessage::PeerPosition { msg_id, .. }
        | ServerMessage::PeerChat { msg_id, .. }
        | ServerMessage::PeerDm { msg_id, .. }
        | ServerMessage::PeerEmoji { msg_id, .. }
        | ServerMessage::GameEvent { msg_id, .. } => Some(*msg_id),
        _ => None,
    }
}

#[test]
fn ping_before_auth_gets_pong() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    room.handle_message(a.conn_id, ClientMessage::Ping);
    assert!(matches!(&*recv(&mut a), ServerMessage::Pong));
}

#[test]
fn non_auth_message_before_auth_is_rejected() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    room.handle_message(
        a.conn_id,
        ClientMessage::Chat {
            text: "hello".to_string(),
        },
    );
    match &*recv(&mut a) {
        ServerMessage::Error { code, .. } => assert_eq!(*code, ErrorCode::AuthRequired),
        other => panic!("expected error, got {other:?}"),
    }
    // Still connected; a later auth works.
    authenticate(&room, &mut a);
}

#[test]
fn auth_flow_installs_client_in_index() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    authenticate(&room, &mut a);

    let (clients, authed, indexed) = room.debug_counts();
    assert_eq!(clients, 1);
    assert_eq!(authed, 1);
    assert_eq!(indexed, 1);
    assert_eq!(room.player_count(), 1);
}

#[test]
fn bad_signature_fails_auth_and_closes() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    room.handle_message(
        a.conn_id,
        ClientMessage::Auth {
            pubkey: a.keys.public_key().to_string(),
            map_id: 42,
        },
    );
    let _challenge = recv(&mut a);

    room.handle_message(
        a.conn_id,
        ClientMessage::AuthResponse {
            signature: "not an event".to_string(),
        },
    );
    match &*recv(&mut a) {
        ServerMessage::Error { code, .. } => assert_eq!(*code, ErrorCode::AuthFailed),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(a.cancel.is_cancelled());
    assert_eq!(room.debug_counts(), (0, 0, 0));
}

#[test]
fn signing_someone_elses_challenge_fails() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let b_keys = Keys::parse(SECRET_B).unwrap();
    room.handle_message(
        a.conn_id,
        ClientMessage::Auth {
            pubkey: a.keys.public_key().to_string(),
            map_id: 42,
        },
    );
    let challenge = match &*recv(&mut a) {
        ServerMessage::AuthChallenge { challenge } => challenge.clone(),
        other => panic!("expected auth_challenge, got {other:?}"),
    };
    // Signed by B but claiming A's pubkey.
    room.handle_message(
        a.conn_id,
        ClientMessage::AuthResponse {
            signature: signed_response(&b_keys, &challenge),
        },
    );
    match &*recv(&mut a) {
        ServerMessage::Error { code, .. } => assert_eq!(*code, ErrorCode::AuthFailed),
        other => panic!("expected error, got {other:?}"),
    }
}

#[test]
fn welcome_lists_existing_peers() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    authenticate(&room, &mut a);
    room.handle_message(
        a.conn_id,
        ClientMessage::Position {
            x: 3.0,
            y: 0.0,
            z: -7.0,
            ry: 1.5,
            animation: None,
            expression: None,
        },
    );

    let mut b = connect(&room, SECRET_B);
    room.handle_message(
        b.conn_id,
        ClientMessage::Auth {
            pubkey: b.keys.public_key().to_string(),
            map_id: 42,
        },
    );
    let challenge = match &*recv(&mut b) {
        ServerMessage::AuthChallenge { challenge } => challenge.clone(),
        other => panic!("expected auth_challenge, got {other:?}"),
    };
    room.handle_message(
        b.conn_id,
        ClientMessage::AuthResponse {
            signature: signed_response(&b.keys, &challenge),
        },
    );
    match &*recv(&mut b) {
        ServerMessage::Welcome { peers, map_id } => {
            assert_eq!(*map_id, 42);
            assert_eq!(peers.len(), 1);
            assert_eq!(peers[0].pubkey, a.keys.public_key());
            assert_eq!(peers[0].position.x, 3.0);
            assert_eq!(peers[0].position.ry, 1.5);
        }
        other => panic!("expected welcome, got {other:?}"),
    }

    // A saw B's join.
    let joins = drain(&mut a);
    assert!(joins
        .iter()
        .any(|m| matches!(&**m, ServerMessage::PeerJoin { pubkey, .. } if pubkey == b.keys.public_key())));
}

#[test]
fn chat_broadcasts_to_others_only() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let mut b = connect(&room, SECRET_B);
    authenticate(&room, &mut a);
    authenticate(&room, &mut b);
    drain(&mut a);
    drain(&mut b);

    room.handle_message(
        a.conn_id,
        ClientMessage::Chat {
            text: "hi".to_string(),
        },
    );

    match &*recv(&mut b) {
        ServerMessage::PeerChat { pubkey, text, .. } => {
            assert_eq!(pubkey, a.keys.public_key());
            assert_eq!(text, "hi");
        }
        other => panic!("expected peer_chat, got {other:?}"),
    }
    assert!(drain(&mut a).is_empty(), "sender must not hear its own chat");
}

#[test]
fn chat_and_emoji_are_truncated() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let mut b = connect(&room, SECRET_B);
    authenticate(&room, &mut a);
    authenticate(&room, &mut b);
    drain(&mut a);
    drain(&mut b);

    room.handle_message(
        a.conn_id,
        ClientMessage::Chat {
            text: "x".repeat(600),
        },
    );
    match &*recv(&mut b) {
        ServerMessage::PeerChat { text, .. } => assert_eq!(text.chars().count(), 500),
        other => panic!("expected peer_chat, got {other:?}"),
    }

    room.handle_message(
        a.conn_id,
        ClientMessage::Emoji {
            emoji: "y".repeat(40),
        },
    );
    match &*recv(&mut b) {
        ServerMessage::PeerEmoji { emoji, .. } => assert_eq!(emoji.chars().count(), 16),
        other => panic!("expected peer_emoji, got {other:?}"),
    }
}

#[test]
fn dm_routes_to_target_only() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let mut b = connect(&room, SECRET_B);
    let mut c = connect(&room, SECRET_C);
    authenticate(&room, &mut a);
    authenticate(&room, &mut b);
    authenticate(&room, &mut c);
    drain(&mut a);
    drain(&mut b);
    drain(&mut c);

    room.handle_message(
        a.conn_id,
        ClientMessage::Dm {
            to: b.keys.public_key().to_string(),
            text: "secret".to_string(),
        },
    );

    match &*recv(&mut b) {
        ServerMessage::PeerDm { pubkey, text, .. } => {
            assert_eq!(pubkey, a.keys.public_key());
            assert_eq!(text, "secret");
        }
        other => panic!("expected peer_dm, got {other:?}"),
    }
    assert!(drain(&mut a).is_empty());
    assert!(drain(&mut c).is_empty());
}

#[test]
fn dm_to_unknown_target_is_dropped() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    authenticate(&room, &mut a);
    room.handle_message(
        a.conn_id,
        ClientMessage::Dm {
            to: "f".repeat(64),
            text: "anyone there".to_string(),
        },
    );
    assert!(drain(&mut a).is_empty(), "no bounce and no error");
}

#[test]
fn position_respects_aoi_subscriptions() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let mut b = connect(&room, SECRET_B);
    let mut c = connect(&room, SECRET_C);
    authenticate(&room, &mut a);
    authenticate(&room, &mut b);
    authenticate(&room, &mut c);

    // B only watches cell "0,0".
    room.handle_message(
        b.conn_id,
        ClientMessage::SubscribeCells {
            cells: vec!["0,0".to_string()],
        },
    );
    drain(&mut a);
    drain(&mut b);
    drain(&mut c);

    // A moves inside cell "0,0"; C moves inside cell "1,1".
    room.handle_message(
        a.conn_id,
        ClientMessage::Position {
            x: 5.0,
            y: 0.0,
            z: 5.0,
            ry: 0.0,
            animation: None,
            expression: None,
        },
    );
    room.handle_message(
        c.conn_id,
        ClientMessage::Position {
            x: 15.0,
            y: 0.0,
            z: 15.0,
            ry: 0.0,
            animation: None,
            expression: None,
        },
    );

    let b_updates = drain(&mut b);
    assert_eq!(b_updates.len(), 1, "B only sees A's cell");
    match &*b_updates[0] {
        ServerMessage::PeerPosition { pubkey, .. } => assert_eq!(pubkey, a.keys.public_key()),
        other => panic!("expected peer_position, got {other:?}"),
    }

    // A never subscribed, so it receives every position broadcast.
    let a_updates = drain(&mut a);
    assert_eq!(a_updates.len(), 1);
    match &*a_updates[0] {
        ServerMessage::PeerPosition { pubkey, .. } => assert_eq!(pubkey, c.keys.public_key()),
        other => panic!("expected peer_position, got {other:?}"),
    }
}

#[test]
fn invalid_subscription_cells_fall_back_to_receive_all() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let mut b = connect(&room, SECRET_B);
    authenticate(&room, &mut a);
    authenticate(&room, &mut b);
    room.handle_message(
        b.conn_id,
        ClientMessage::SubscribeCells {
            cells: vec!["not-a-cell".to_string()],
        },
    );
    drain(&mut a);
    drain(&mut b);

    room.handle_message(
        a.conn_id,
        ClientMessage::Position {
            x: 95.0,
            y: 0.0,
            z: 95.0,
            ry: 0.0,
            animation: None,
            expression: None,
        },
    );
    assert_eq!(drain(&mut b).len(), 1, "empty validated set means no filter");
}

#[test]
fn chat_ignores_aoi_subscriptions() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let mut b = connect(&room, SECRET_B);
    authenticate(&room, &mut a);
    authenticate(&room, &mut b);
    room.handle_message(
        b.conn_id,
        ClientMessage::SubscribeCells {
            cells: vec!["50,50".to_string()],
        },
    );
    drain(&mut a);
    drain(&mut b);

    room.handle_message(
        a.conn_id,
        ClientMessage::Chat {
            text: "broadcast".to_string(),
        },
    );
    assert_eq!(drain(&mut b).len(), 1, "chat is not AOI-filtered");
}

#[test]
fn displacement_orders_leave_before_join() {
    let room = test_room();
    let mut observer = connect(&room, SECRET_B);
    authenticate(&room, &mut observer);

    let mut x = connect(&room, SECRET_A);
    authenticate(&room, &mut x);
    drain(&mut observer);

    // Same identity reconnects on a new transport.
    let mut y = connect(&room, SECRET_A);
    authenticate(&room, &mut y);

    // The old connection learns it was replaced and is force-closed.
    let x_messages = drain(&mut x);
    assert!(x_messages.iter().any(|m| matches!(
        &**m,
        ServerMessage::Error {
            code: ErrorCode::Replaced,
            ..
        }
    )));
    assert!(x.cancel.is_cancelled());

    // Observers see leave strictly before join for the same identity.
    let seen = drain(&mut observer);
    let leave_id = seen
        .iter()
        .find_map(|m| match &**m {
            ServerMessage::PeerLeave { msg_id, pubkey } if pubkey == x.keys.public_key() => {
                Some(*msg_id)
            }
            _ => None,
        })
        .expect("observer saw peer_leave");
    let join_id = seen
        .iter()
        .find_map(|m| match &**m {
            ServerMessage::PeerJoin { msg_id, pubkey, .. } if pubkey == y.keys.public_key() => {
                Some(*msg_id)
            }
            _ => None,
        })
        .expect("observer saw peer_join");
    assert!(leave_id < join_id, "leave must precede join");

    // The index now points at the new connection.
    let (clients, authed, indexed) = room.debug_counts();
    assert_eq!((clients, authed, indexed), (2, 2, 2));

    // A late close of the displaced transport must not tear down the
    // successor.
    room.handle_disconnect(x.conn_id);
    assert_eq!(room.debug_counts(), (2, 2, 2));
    assert!(drain(&mut observer).is_empty());
    let _ = drain(&mut y);
}

#[test]
fn disconnect_broadcasts_leave_exactly_once() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let mut b = connect(&room, SECRET_B);
    authenticate(&room, &mut a);
    authenticate(&room, &mut b);
    drain(&mut b);

    room.handle_disconnect(a.conn_id);
    room.handle_disconnect(a.conn_id);

    let leaves: Vec<_> = drain(&mut b)
        .into_iter()
        .filter(|m| matches!(&**m, ServerMessage::PeerLeave { .. }))
        .collect();
    assert_eq!(leaves.len(), 1);
    assert!(a.cancel.is_cancelled());
    let _ = drain(&mut a);
}

#[test]
fn unauthenticated_disconnect_is_silent() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let mut b = connect(&room, SECRET_B);
    authenticate(&room, &mut b);
    drain(&mut b);

    room.handle_disconnect(a.conn_id);
    assert!(drain(&mut b).is_empty());
    let _ = drain(&mut a);
}

#[test]
fn msg_ids_strictly_increase_per_room() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let mut b = connect(&room, SECRET_B);
    authenticate(&room, &mut a);
    authenticate(&room, &mut b);
    drain(&mut b);

    for i in 0..5 {
        room.handle_message(
            a.conn_id,
            ClientMessage::Chat {
                text: format!("message {i}"),
            },
        );
        room.handle_message(
            a.conn_id,
            ClientMessage::Emoji {
                emoji: "wave".to_string(),
            },
        );
    }

    let ids: Vec<u64> = drain(&mut b)
        .iter()
        .filter_map(|m| msg_id(m))
        .collect();
    assert_eq!(ids.len(), 10);
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn cleanup_inactive_evicts_idle_clients() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let mut b = connect(&room, SECRET_B);
    authenticate(&room, &mut a);
    authenticate(&room, &mut b);
    drain(&mut a);
    drain(&mut b);

    std::thread::sleep(Duration::from_millis(30));
    // B stays active; A goes idle.
    room.handle_message(b.conn_id, ClientMessage::Ping);
    let _ = drain(&mut b);

    room.cleanup_inactive(Duration::from_millis(20));

    assert!(a.cancel.is_cancelled());
    assert!(!b.cancel.is_cancelled());
    assert_eq!(room.player_count(), 1);
    assert!(drain(&mut b)
        .iter()
        .any(|m| matches!(&**m, ServerMessage::PeerLeave { .. })));
}

#[test]
fn destroy_closes_everything() {
    let room = test_room();
    let a = connect(&room, SECRET_A);
    let b = connect(&room, SECRET_B);

    room.destroy();

    assert!(a.cancel.is_cancelled());
    assert!(b.cancel.is_cancelled());
    assert_eq!(room.debug_counts(), (0, 0, 0));
}

#[test]
fn slow_consumer_is_dropped_when_queue_overflows() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    authenticate(&room, &mut a);

    // A tiny queue that is never drained.
    let (tx, _rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();
    let conn_id = Uuid::new_v4();
    room.add_connection(RoomConnection {
        id: conn_id,
        sender: tx,
        cancel: cancel.clone(),
    });
    let mut slow = TestClient {
        conn_id,
        rx: _rx,
        cancel: cancel.clone(),
        keys: Keys::parse(SECRET_B).unwrap(),
    };
    authenticate(&room, &mut slow);
    drain(&mut a);

    // Stop draining the slow client entirely; two broadcasts overflow it.
    room.handle_message(
        a.conn_id,
        ClientMessage::Chat {
            text: "one".to_string(),
        },
    );
    room.handle_message(
        a.conn_id,
        ClientMessage::Chat {
            text: "two".to_string(),
        },
    );

    assert!(cancel.is_cancelled(), "overloaded connection is dropped");
}

#[derive(Default)]
struct RecordingHook {
    joins: StdMutex<Vec<String>>,
    leaves: StdMutex<Vec<String>>,
}

impl GameEvents for RecordingHook {
    fn peer_joined(&self, _map_id: MapId, pubkey: &str) {
        self.joins.lock().unwrap().push(pubkey.to_string());
    }
    fn peer_left(&self, _map_id: MapId, pubkey: &str) {
        self.leaves.lock().unwrap().push(pubkey.to_string());
    }
}

#[test]
fn game_event_hook_observes_presence_changes() {
    let room = test_room();
    let hook = Arc::new(RecordingHook::default());
    room.set_hook(hook.clone());

    let mut a = connect(&room, SECRET_A);
    authenticate(&room, &mut a);
    room.handle_disconnect(a.conn_id);

    assert_eq!(hook.joins.lock().unwrap().as_slice(), [a.keys.public_key()]);
    assert_eq!(
        hook.leaves.lock().unwrap().as_slice(),
        [a.keys.public_key()]
    );
}

#[test]
fn broadcast_game_event_reaches_authenticated_clients() {
    let room = test_room();
    let mut a = connect(&room, SECRET_A);
    let mut pending = connect(&room, SECRET_B);
    authenticate(&room, &mut a);

    room.broadcast_game_event("round_start", serde_json::json!({"round": 1}));

    match &*recv(&mut a) {
        ServerMessage::GameEvent { event, data, .. } => {
            assert_eq!(event, "round_start");
            assert_eq!(data["round"], 1);
        }
        other => panic!("expected game_event, got {other:?}"),
    }
    assert!(drain(&mut pending).is_empty(), "pre-auth clients hear nothing");
}
