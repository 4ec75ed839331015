use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::grid::{self, MapId};

use super::defaults;
use super::logging::LoggingConfig;

/// Which maps this node is willing to host rooms for.
///
/// Parsed from the `SERVED_MAPS` variable: `all`, `auto`, or a comma list
/// with range syntax (`0-99,2211,4455`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServedMapsSetting {
    /// Serve every map on the grid.
    All,
    /// Let the map selector pick the served set.
    Auto,
    /// Serve exactly these maps.
    Explicit(Vec<MapId>),
}

impl Default for ServedMapsSetting {
    fn default() -> Self {
        Self::All
    }
}

impl FromStr for ServedMapsSetting {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_ascii_lowercase().as_str() {
            "" | "all" => return Ok(Self::All),
            "auto" => return Ok(Self::Auto),
            _ => {}
        }

        let mut maps = BTreeSet::new();
        for token in input.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            if let Some((lo, hi)) = token.split_once('-') {
                let lo = parse_map_id(lo)?;
                let hi = parse_map_id(hi)?;
                if lo > hi {
                    return Err(format!("descending range {token:?}"));
                }
                maps.extend(lo..=hi);
            } else {
                maps.insert(parse_map_id(token)?);
            }
        }
        if maps.is_empty() {
            return Err("no map ids given".to_string());
        }
        Ok(Self::Explicit(maps.into_iter().collect()))
    }
}

fn parse_map_id(token: &str) -> Result<MapId, String> {
    let id: u16 = token
        .trim()
        .parse()
        .map_err(|_| format!("{token:?} is not a map id"))?;
    if !grid::is_valid_map(id) {
        return Err(format!("map id {id} is outside 0..{}", grid::MAP_COUNT));
    }
    Ok(id)
}

impl fmt::Display for ServedMapsSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Auto => f.write_str("auto"),
            Self::Explicit(maps) => {
                let list: Vec<String> = maps.iter().map(ToString::to_string).collect();
                f.write_str(&list.join(","))
            }
        }
    }
}

impl Serialize for ServedMapsSetting {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ServedMapsSetting {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Root configuration, assembled by [`super::loader::load`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Local listener port.
    #[serde(default = "defaults::default_port")]
    pub port: u16,
    /// Bind address.
    #[serde(default = "defaults::default_host")]
    pub host: String,
    /// Public endpoint URL advertised in heartbeats.
    #[serde(default)]
    pub sync_url: Option<String>,
    /// Served-map policy.
    #[serde(default)]
    pub served_maps: ServedMapsSetting,
    /// Served-set size target for `auto` mode.
    #[serde(default = "defaults::default_target_maps")]
    pub target_maps: usize,
    /// Node signing identity (hex or bech32 nsec). Never serialized.
    #[serde(default, skip_serializing)]
    pub node_secret_key: Option<String>,
    /// Region tag carried in heartbeats.
    #[serde(default)]
    pub node_region: Option<String>,
    /// Hard cap on concurrent clients across all rooms.
    #[serde(default = "defaults::default_max_players")]
    pub max_players: usize,
    /// Discovery relay endpoints.
    #[serde(default = "defaults::default_relays")]
    pub relays: Vec<String>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: defaults::default_port(),
            host: defaults::default_host(),
            sync_url: None,
            served_maps: ServedMapsSetting::default(),
            target_maps: defaults::default_target_maps(),
            node_secret_key: None,
            node_region: None,
            max_players: defaults::default_max_players(),
            relays: defaults::default_relays(),
            logging: LoggingConfig::default(),
        }
    }
}
