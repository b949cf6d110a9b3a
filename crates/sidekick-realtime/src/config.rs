use std::time::Duration;

/// Realtime connection configuration.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Cap on a single WebSocket dial.
    pub connect_timeout: Duration,
    /// Cadence of the meeting presence probe.
    pub poll_interval: Duration,
    /// First reconnect delay; attempt `n` waits `base * 2^(n-1)`.
    pub backoff_base: Duration,
    /// Reconnect attempts before giving up until the next session edge.
    pub max_reconnect_attempts: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(2),
            backoff_base: Duration::from_secs(1),
            max_reconnect_attempts: 8,
        }
    }
}
