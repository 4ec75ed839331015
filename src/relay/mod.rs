//! Outbound relay sessions and the session pool.
//!
//! The client side of the discovery fabric: persistent self-healing
//! WebSocket sessions speaking the five verbs `EVENT`, `REQ`, `EOSE`, `OK`
//! and `NOTICE`. Publishing awaits the relay's `OK` acknowledgment with a
//! timeout; queries stream events until `EOSE`.

mod pool;
mod session;

pub use pool::RelayPool;
pub use session::{RelaySession, SessionState, PUBLISH_TIMEOUT, RECONNECT_DELAY};
