use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::error_codes::ErrorCode;

/// A world position plus facing angle about the vertical axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub ry: f32,
}

/// Presence snapshot of one peer, carried in `welcome`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub pubkey: String,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<Value>,
}

/// Message types sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Claim an identity and pick a target map (MUST be the first message)
    Auth {
        pubkey: String,
        /// Defaults to map 0 for old clients that predate map routing.
        #[serde(default)]
        map_id: u32,
    },
    /// Answer the server's challenge with a serialized signed event
    AuthResponse { signature: String },
    /// Movement update; also re-buckets the sender's AOI cell
    Position {
        x: f32,
        y: f32,
        z: f32,
        ry: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        animation: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
    },
    /// Replace the sender's area-of-interest cell subscription
    SubscribeCells { cells: Vec<String> },
    /// Room-wide text chat
    Chat { text: String },
    /// Direct message to one peer by pubkey
    Dm { to: String, text: String },
    /// Room-wide emote
    Emoji { emoji: String },
    /// Announce or update the sender's avatar descriptor
    Join {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<Value>,
    },
    /// Keepalive
    Ping,
}

/// Message types sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Challenge the client must sign to finish authentication
    AuthChallenge { challenge: String },
    /// Authentication succeeded; snapshot of everyone already present
    Welcome {
        peers: Vec<PeerSnapshot>,
        map_id: u32,
    },
    /// A peer joined (or re-announced its avatar)
    PeerJoin {
        msg_id: u64,
        pubkey: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        avatar: Option<Value>,
    },
    /// A peer left the room
    PeerLeave { msg_id: u64, pubkey: String },
    /// A peer moved
    PeerPosition {
        msg_id: u64,
        pubkey: String,
        x: f32,
        y: f32,
        z: f32,
        ry: f32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        animation: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expression: Option<String>,
    },
    /// Room-wide chat from a peer
    PeerChat {
        msg_id: u64,
        pubkey: String,
        text: String,
    },
    /// Direct message from a peer; delivered only to the addressee
    PeerDm {
        msg_id: u64,
        pubkey: String,
        text: String,
    },
    /// Room-wide emote from a peer
    PeerEmoji {
        msg_id: u64,
        pubkey: String,
        emoji: String,
    },
    /// Server-injected game event
    GameEvent {
        msg_id: u64,
        event: String,
        data: Value,
    },
    /// Error message
    Error { message: String, code: ErrorCode },
    /// Keepalive response
    Pong,
}
