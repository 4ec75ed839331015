//! Configuration validation, run at startup and by `--validate-config`.

use url::Url;

use crate::signer::Keys;

use super::loader::ConfigError;
use super::types::{Config, ServedMapsSetting};

fn invalid(var: &'static str, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        reason: reason.to_string(),
    }
}

/// Checks cross-field consistency the loader cannot see.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.port == 0 {
        return Err(invalid("PORT", "must be nonzero"));
    }
    if cfg.max_players == 0 {
        return Err(invalid("MAX_PLAYERS", "must be at least 1"));
    }
    if cfg.target_maps == 0 {
        return Err(invalid("TARGET_MAPS", "must be at least 1"));
    }

    if let Some(sync_url) = &cfg.sync_url {
        let parsed = Url::parse(sync_url).map_err(|e| invalid("SYNC_URL", e))?;
        if !matches!(parsed.scheme(), "ws" | "wss" | "http" | "https") {
            return Err(invalid("SYNC_URL", "scheme must be ws, wss, http or https"));
        }
    }

    for relay in &cfg.relays {
        let parsed = Url::parse(relay).map_err(|e| invalid("RELAYS", format!("{relay}: {e}")))?;
        if !matches!(parsed.scheme(), "ws" | "wss") {
            return Err(invalid("RELAYS", format!("{relay}: scheme must be ws or wss")));
        }
    }

    if let Some(secret) = &cfg.node_secret_key {
        Keys::parse(secret).map_err(|e| invalid("NODE_SECRET_KEY", e))?;
    }

    if cfg.served_maps == ServedMapsSetting::Auto && cfg.relays.is_empty() {
        return Err(invalid(
            "SERVED_MAPS",
            "auto mode needs at least one relay in RELAYS",
        ));
    }

    Ok(())
}
