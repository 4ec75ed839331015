use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for structured error handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Total active clients at the node-wide cap at accept time
    Capacity,
    /// No auth message arrived within the pending window
    Timeout,
    /// Requested map id is outside the world grid
    InvalidMap,
    /// The served-map policy excludes the requested map
    MapNotServed,
    /// A non-auth message arrived before authentication
    AuthRequired,
    /// Signature, pubkey, challenge, kind or timestamp check failed
    AuthFailed,
    /// A newer connection with the same pubkey displaced this one
    Replaced,
    /// Routing into the room could not complete
    JoinFailed,
}

impl ErrorCode {
    /// Human-readable description to pair with the code on the wire.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Capacity => "Server is at capacity. Retry later.",
            Self::Timeout => "No auth message received in time.",
            Self::InvalidMap => "Map id must be between 0 and 9999.",
            Self::MapNotServed => "This node does not serve the requested map.",
            Self::AuthRequired => "Authenticate before sending other messages.",
            Self::AuthFailed => "Challenge response verification failed.",
            Self::Replaced => "A newer connection for this identity took over.",
            Self::JoinFailed => "Could not route the connection into a room.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Self::Capacity => "CAPACITY",
            Self::Timeout => "TIMEOUT",
            Self::InvalidMap => "INVALID_MAP",
            Self::MapNotServed => "MAP_NOT_SERVED",
            Self::AuthRequired => "AUTH_REQUIRED",
            Self::AuthFailed => "AUTH_FAILED",
            Self::Replaced => "REPLACED",
            Self::JoinFailed => "JOIN_FAILED",
        };
        f.write_str(code)
    }
}
