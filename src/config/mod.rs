//! Configuration module.
//!
//! Environment variables with code defaults, validated at startup:
//! `PORT`, `HOST`, `SYNC_URL`, `SERVED_MAPS`, `TARGET_MAPS`,
//! `NODE_SECRET_KEY`, `NODE_REGION`, `MAX_PLAYERS`, `RELAYS`,
//! `LOG_LEVEL`, `LOG_FORMAT`.

pub mod defaults;
pub mod loader;
pub mod logging;
pub mod types;
pub mod validation;

pub use loader::{load, ConfigError};

pub use logging::{LogFormat, LogLevel, LoggingConfig};

pub use types::{Config, ServedMapsSetting};

pub use validation::validate;
