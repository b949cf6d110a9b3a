//! HTTP implementation of the refresh exchange.

use crate::error::{AuthError, Result};
use crate::refresh::{RefreshResponse, RefreshTransport};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_REQUEST_ATTEMPTS: usize = 2;

const REFRESH_PATH: &str = "/api/v1/auth/refresh";
const LOGOUT_PATH: &str = "/api/v1/auth/logout";

#[derive(Debug, Clone)]
pub struct HttpRefreshConfig {
    pub base_url: String,
    pub timeout_ms: u64,
    pub request_attempts: usize,
}

impl HttpRefreshConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            request_attempts: DEFAULT_REQUEST_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpRefreshTransport {
    base_url: String,
    timeout: Duration,
    request_attempts: usize,
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
    subject_id: &'a str,
    refresh_token: &'a str,
}

impl HttpRefreshTransport {
    pub fn new(config: HttpRefreshConfig) -> Result<Self> {
        let base_url = normalize_base_url(&config.base_url)?;
        Ok(Self {
            base_url,
            timeout: Duration::from_millis(config.timeout_ms.max(250)),
            request_attempts: config.request_attempts.max(1),
            http: reqwest::Client::new(),
        })
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_json<Req>(
        &self,
        path: &str,
        payload: &Req,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response>
    where
        Req: Serialize + ?Sized,
    {
        let url = self.endpoint(path);
        let mut last_error: Option<String> = None;

        for attempt in 0..self.request_attempts {
            let mut request = self
                .http
                .post(url.as_str())
                .header("x-request-id", format!("req_{}", Uuid::new_v4().simple()))
                .timeout(self.timeout)
                .json(payload);
            if let Some(token) = bearer {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) => return Ok(response),
                Err(error) => {
                    last_error = Some(error.to_string());
                    if attempt + 1 >= self.request_attempts {
                        break;
                    }
                }
            }
        }

        Err(AuthError::RefreshFailed(
            last_error.unwrap_or_else(|| "unknown".to_string()),
        ))
    }
}

#[async_trait]
impl RefreshTransport for HttpRefreshTransport {
    async fn refresh_session(
        &self,
        subject_id: &str,
        refresh_token: &str,
    ) -> Result<RefreshResponse> {
        let response = self
            .post_json(
                REFRESH_PATH,
                &RefreshRequest {
                    subject_id,
                    refresh_token,
                },
                None,
            )
            .await?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|error| AuthError::RefreshFailed(error.to_string()))?;
        if !status.is_success() {
            return Err(format_http_error(status, &bytes));
        }

        serde_json::from_slice(&bytes)
            .map_err(|error| AuthError::RefreshFailed(format!("invalid refresh response: {error}")))
    }

    async fn logout(&self, access_token: &str) -> Result<()> {
        let response = self
            .post_json(LOGOUT_PATH, &serde_json::json!({}), Some(access_token))
            .await?;

        let status = response.status();
        if !status.is_success() {
            let bytes = response.bytes().await.unwrap_or_default();
            return Err(format_http_error(status, &bytes));
        }
        Ok(())
    }
}

pub fn format_http_error(status: StatusCode, body: &[u8]) -> AuthError {
    let body = String::from_utf8_lossy(body).trim().to_string();
    let body = if body.is_empty() {
        "<empty>".to_string()
    } else {
        body
    };
    AuthError::Http { status, body }
}

fn normalize_base_url(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AuthError::BaseUrlMissing);
    }
    Ok(trimmed.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_builder_normalizes_trailing_slash() {
        let transport =
            HttpRefreshTransport::new(HttpRefreshConfig::new("https://auth.example.com/"))
                .expect("transport");
        assert_eq!(
            transport.endpoint(REFRESH_PATH),
            "https://auth.example.com/api/v1/auth/refresh"
        );
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let result = HttpRefreshTransport::new(HttpRefreshConfig::new("   "));
        assert!(matches!(result, Err(AuthError::BaseUrlMissing)));
    }

    #[test]
    fn http_error_mapping_preserves_status_and_body() {
        let error = format_http_error(StatusCode::UNAUTHORIZED, b" token consumed ");
        assert_eq!(error.to_string(), "http 401 Unauthorized: token consumed");

        let empty = format_http_error(StatusCode::BAD_GATEWAY, b"  ");
        assert_eq!(empty.to_string(), "http 502 Bad Gateway: <empty>");
    }

    #[test]
    fn refresh_request_serializes_camel_case() {
        let request = RefreshRequest {
            subject_id: "subject-1",
            refresh_token: "refresh-1",
        };
        let encoded = serde_json::to_value(&request).expect("json");
        assert_eq!(
            encoded,
            serde_json::json!({"subjectId": "subject-1", "refreshToken": "refresh-1"})
        );
    }
}
