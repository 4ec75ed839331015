//! WebSocket message protocol definitions.
//!
//! Framed JSON text messages with a `type` discriminator, camelCase field
//! names on the wire. Servers-to-client `peer_*` messages carry a node-local
//! monotonically increasing `msgId` so clients can detect dropped or
//! reordered deliveries.

mod error_codes;
mod messages;

pub use error_codes::ErrorCode;
pub use messages::{ClientMessage, PeerSnapshot, Position, ServerMessage};
