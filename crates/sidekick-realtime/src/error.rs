//! Realtime error types.

use thiserror::Error;

/// Realtime layer error type.
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("connect not permitted: {0}")]
    ConnectNotPermitted(&'static str),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("protocol error: {0}")]
    Protocol(#[from] sidekick_proto::ProtoError),

    #[error("timeout error: {0}")]
    Timeout(String),

    #[error("not connected")]
    NotConnected,
}

/// Realtime result type.
pub type Result<T> = std::result::Result<T, RealtimeError>;
