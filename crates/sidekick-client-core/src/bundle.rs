use crate::config::AuthConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The current credential bundle.
///
/// Replaced wholesale on every refresh; a bundle missing `refresh_token` or
/// `subject_id` cannot self-refresh and can only be replaced by a new login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBundle {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    pub issued_at: DateTime<Utc>,
}

impl CredentialBundle {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        subject_id: Option<String>,
        issued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            subject_id,
            issued_at,
        }
    }

    pub fn has_access_token(&self) -> bool {
        !self.access_token.is_empty()
    }

    /// Whether the bundle carries everything a refresh exchange needs.
    pub fn can_refresh(&self) -> bool {
        self.refresh_token.is_some() && self.subject_id.is_some()
    }

    /// The access token is usable iff issuance is within the lifetime.
    pub fn is_expired_at(&self, now: DateTime<Utc>, config: &AuthConfig) -> bool {
        self.elapsed_ms(now) >= config.credential_lifetime.as_millis() as i64
    }

    /// True once elapsed time reaches `lifetime - grace_window`; false just
    /// below the threshold, true exactly at and above it.
    pub fn is_expiring_soon_at(&self, now: DateTime<Utc>, config: &AuthConfig) -> bool {
        self.elapsed_ms(now) >= config.refresh_threshold().as_millis() as i64
    }

    fn elapsed_ms(&self, now: DateTime<Utc>) -> i64 {
        now.signed_duration_since(self.issued_at).num_milliseconds()
    }
}
