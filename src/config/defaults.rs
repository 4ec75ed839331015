//! Default value functions for configuration fields.
//!
//! Used both by serde `#[serde(default = ...)]` attributes and by the
//! environment loader when a variable is unset.

pub const fn default_port() -> u16 {
    18080
}

pub fn default_host() -> String {
    "0.0.0.0".to_string()
}

/// How many maps the auto-selector targets per re-evaluation.
pub const fn default_target_maps() -> usize {
    50
}

/// Hard cap on concurrent clients across all rooms.
pub const fn default_max_players() -> usize {
    200
}

/// Discovery relays used for heartbeat publishing and peer queries.
pub fn default_relays() -> Vec<String> {
    vec![
        "wss://relay.damus.io".to_string(),
        "wss://nos.lol".to_string(),
        "wss://relay.nostr.band".to_string(),
    ]
}
