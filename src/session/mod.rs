//! Session verification against the external identity provider
//!
//! The gate only answers "who is this?" for a request. Redirect decisions
//! live in the admission router.

use async_trait::async_trait;
use axum::http::{header::COOKIE, HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Authenticated caller, as reported by the identity provider
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// Session verification errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Identity provider unreachable: {0}")]
    Transport(String),

    #[error("Identity provider returned status {0}")]
    Provider(u16),

    #[error("Invalid identity provider response: {0}")]
    InvalidResponse(String),
}

/// Verifies the session carried by a request
#[async_trait]
pub trait SessionGate: Send + Sync {
    /// `Ok(None)` when the request carries no valid session
    async fn verify(&self, headers: &HeaderMap) -> Result<Option<SessionUser>, SessionError>;
}

/// Session gate backed by the identity provider's session endpoint
///
/// The caller's `Cookie` header is forwarded to `verify_url`; `200` with a
/// user document means signed in, `401`/`403` means anonymous.
#[derive(Clone)]
pub struct RemoteSessionGate {
    client: reqwest::Client,
    verify_url: String,
    cookie_name: String,
}

impl RemoteSessionGate {
    pub fn new(
        verify_url: impl Into<String>,
        cookie_name: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SessionError::Transport(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            verify_url: verify_url.into(),
            cookie_name: cookie_name.into(),
        })
    }

    /// Whether the request carries a session cookie at all. Prefix match so
    /// chunked cookies (`name.0`, `name.1`) count.
    fn has_session_cookie(&self, headers: &HeaderMap) -> bool {
        headers
            .get_all(COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(|value| value.split(';'))
            .filter_map(|pair| pair.split_once('='))
            .any(|(name, _)| name.trim().starts_with(self.cookie_name.as_str()))
    }
}

#[async_trait]
impl SessionGate for RemoteSessionGate {
    async fn verify(&self, headers: &HeaderMap) -> Result<Option<SessionUser>, SessionError> {
        if !self.has_session_cookie(headers) {
            return Ok(None);
        }

        let mut request = self.client.get(&self.verify_url);
        for value in headers.get_all(COOKIE) {
            request = request.header(COOKIE, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                SessionError::Transport(format!("Session check timed out: {}", e))
            } else {
                SessionError::Transport(e.to_string())
            }
        })?;

        match response.status() {
            StatusCode::OK => {
                let user = response
                    .json::<SessionUser>()
                    .await
                    .map_err(|e| SessionError::InvalidResponse(e.to_string()))?;
                debug!(user_id = %user.id, "Session verified");
                Ok(Some(user))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Ok(None),
            status => Err(SessionError::Provider(status.as_u16())),
        }
    }
}
