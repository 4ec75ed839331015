//! Environment-first configuration loading.
//!
//! Every knob is an environment variable with a code default; there is no
//! config file. Empty variables are treated as unset.

use std::str::FromStr;

use thiserror::Error;

use super::logging::{LogFormat, LogLevel};
use super::types::{Config, ServedMapsSetting};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {reason}")]
    Invalid { var: &'static str, reason: String },
}

fn invalid(var: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.to_string(),
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T::Err: ToString,
{
    env_var(name)
        .map(|raw| raw.parse::<T>().map_err(|e| invalid(name, e.to_string())))
        .transpose()
}

/// Loads configuration from the environment, falling back to code defaults.
pub fn load() -> Result<Config, ConfigError> {
    let mut cfg = Config::default();

    if let Some(port) = env_parse::<u16>("PORT")? {
        cfg.port = port;
    }
    if let Some(host) = env_var("HOST") {
        cfg.host = host;
    }
    cfg.sync_url = env_var("SYNC_URL");
    if let Some(raw) = env_var("SERVED_MAPS") {
        cfg.served_maps = raw
            .parse::<ServedMapsSetting>()
            .map_err(|e| invalid("SERVED_MAPS", e))?;
    }
    if let Some(target) = env_parse::<usize>("TARGET_MAPS")? {
        cfg.target_maps = target;
    }
    cfg.node_secret_key = env_var("NODE_SECRET_KEY");
    cfg.node_region = env_var("NODE_REGION");
    if let Some(max) = env_parse::<usize>("MAX_PLAYERS")? {
        cfg.max_players = max;
    }
    if let Some(raw) = env_var("RELAYS") {
        cfg.relays = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
    }
    if let Some(raw) = env_var("LOG_LEVEL") {
        let level = LogLevel::parse(&raw).ok_or_else(|| invalid("LOG_LEVEL", &raw))?;
        cfg.logging.level = Some(level);
    }
    if let Some(raw) = env_var("LOG_FORMAT") {
        cfg.logging.format = match raw.to_ascii_lowercase().as_str() {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => return Err(invalid("LOG_FORMAT", other)),
        };
    }

    Ok(cfg)
}
