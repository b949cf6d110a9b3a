//! Credential error types.

use reqwest::StatusCode;
use thiserror::Error;

/// Credential lifecycle error type.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credential available")]
    CredentialUnavailable,

    #[error("refresh failed: {0}")]
    RefreshFailed(String),

    #[error("refresh endpoint base url missing")]
    BaseUrlMissing,

    #[error("http {status}: {body}")]
    Http { status: StatusCode, body: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("timed out after {waited:?} waiting for credential")]
    Timeout { waited: std::time::Duration },
}

/// Credential result type.
pub type Result<T> = std::result::Result<T, AuthError>;
