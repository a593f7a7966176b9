use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for admission-layer operations
pub type Result<T> = std::result::Result<T, AdmissionError>;

/// Admission-layer error types
///
/// Rate-limit store failures and session-provider failures never surface
/// here during request handling: the limiter applies its failure policy and
/// the session gate treats errors as "no session". These variants cover
/// startup, configuration and upstream forwarding.
#[derive(Error, Debug)]
pub enum AdmissionError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid route policy: {0}")]
    InvalidPolicy(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Rate-limit store error: {0}")]
    Store(#[from] crate::rate_limit::StoreError),

    #[error("Session error: {0}")]
    Session(#[from] crate::session::SessionError),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdmissionError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::InvalidPolicy(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::Upstream(_) => StatusCode::BAD_GATEWAY,
            AdmissionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AdmissionError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            AdmissionError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            AdmissionError::Session(_) => StatusCode::BAD_GATEWAY,
            AdmissionError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AdmissionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
