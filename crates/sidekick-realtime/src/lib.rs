//! Meeting-gated realtime connection layer.
//!
//! The activity detector turns a polled presence probe into start/end
//! session edges; the connection controller opens and closes the realtime
//! socket in lockstep with those edges, queueing outbound messages across
//! reconnects and never dialing without an active session and a usable
//! access token.

pub mod config;
pub mod connection;
pub mod detector;
pub mod error;
pub mod transport;

pub use config::RealtimeConfig;
pub use connection::{ConnectionController, ConnectionState, ControllerEvent, reconnect_delay};
pub use detector::{
    MeetingActivityDetector, MeetingEvent, MeetingSession, PresenceProbe, ProbeReading,
};
pub use error::RealtimeError;
pub use transport::{RealtimeSocket, RealtimeTransport, SocketEvent, TungsteniteTransport};
