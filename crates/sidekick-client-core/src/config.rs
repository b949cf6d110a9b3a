use chrono::{DateTime, Utc};
use std::time::Duration;

/// What to do after a refresh exchange fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshRetryPolicy {
    /// Wait for a manual sync or a fresh login. Refresh tokens are
    /// single-use; retrying a consumed token can only fail again.
    Manual,
    /// Retry once per interval until a refresh succeeds.
    RetryAfter(Duration),
}

/// Credential lifecycle configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthConfig {
    /// Fixed access-token lifetime.
    pub credential_lifetime: Duration,
    /// Time before actual expiry at which a proactive refresh triggers.
    pub grace_window: Duration,
    /// Cadence of the per-context health audit.
    pub health_check_interval: Duration,
    pub refresh_retry: RefreshRetryPolicy,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            credential_lifetime: Duration::from_secs(24 * 60 * 60),
            grace_window: Duration::from_secs(8 * 60 * 60),
            health_check_interval: Duration::from_secs(60),
            refresh_retry: RefreshRetryPolicy::Manual,
        }
    }
}

impl AuthConfig {
    /// Elapsed time since issuance at which a bundle counts as expiring soon.
    pub fn refresh_threshold(&self) -> Duration {
        self.credential_lifetime.saturating_sub(self.grace_window)
    }

    /// Delay until `issued_at` crosses the refresh threshold; zero when
    /// already past it.
    pub fn time_until_refresh(&self, issued_at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
        let elapsed_ms = now.signed_duration_since(issued_at).num_milliseconds().max(0);
        let threshold_ms = self.refresh_threshold().as_millis() as i64;
        Duration::from_millis(threshold_ms.saturating_sub(elapsed_ms).max(0) as u64)
    }
}
