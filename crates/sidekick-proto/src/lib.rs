//! Wire protocol for the Sidekick realtime socket.
//!
//! JSON messages tagged by a `type` field. Outbound messages are scoped to a
//! meeting session; a missing session id is encoded as a literal sentinel so
//! the backend can distinguish "no session" from a malformed request.

pub mod error;
pub mod inbound;
pub mod outbound;

pub use error::ProtoError;
pub use inbound::{InboundMessage, parse_inbound};
pub use outbound::OutboundMessage;

/// Sentinel session id sent when no meeting session is active.
pub const NO_SESSION_SENTINEL: &str = "none";

/// Session id query value for a connection target.
pub fn session_id_or_sentinel(session_id: Option<&str>) -> &str {
    match session_id {
        Some(id) if !id.is_empty() => id,
        _ => NO_SESSION_SENTINEL,
    }
}
