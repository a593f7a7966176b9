use super::dual::{DualWindowOutcome, WindowKind};
use super::types::RateLimitDecision;
use axum::{
    http::{header::RETRY_AFTER, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

pub const LIMIT_SHORT: HeaderName = HeaderName::from_static("x-ratelimit-limit-short");
pub const REMAINING_SHORT: HeaderName = HeaderName::from_static("x-ratelimit-remaining-short");
pub const RESET_SHORT: HeaderName = HeaderName::from_static("x-ratelimit-reset-short");
pub const LIMIT_LONG: HeaderName = HeaderName::from_static("x-ratelimit-limit-long");
pub const REMAINING_LONG: HeaderName = HeaderName::from_static("x-ratelimit-remaining-long");
pub const RESET_LONG: HeaderName = HeaderName::from_static("x-ratelimit-reset-long");

/// Body of a 429 response
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitExceededBody {
    pub error: String,
    pub message: String,
    pub retry_after: u64,
}

/// Client-facing explanation of which quota was hit
pub fn exceeded_message(kind: WindowKind, decision: &RateLimitDecision) -> String {
    match kind {
        WindowKind::Short => {
            "Too many requests. Please wait a few seconds before submitting again.".to_string()
        }
        WindowKind::Long => format!(
            "Too many requests. You have exceeded the limit of {} submissions per {}.",
            decision.limit,
            window_period(decision.window_secs)
        ),
    }
}

/// "minute", "hour", "day", "5 minutes", "90 seconds"
fn window_period(window_secs: u64) -> String {
    match window_secs {
        1 => "second".to_string(),
        60 => "minute".to_string(),
        3600 => "hour".to_string(),
        86_400 => "day".to_string(),
        s if s % 3600 == 0 => format!("{} hours", s / 3600),
        s if s % 60 == 0 => format!("{} minutes", s / 60),
        s => format!("{} seconds", s),
    }
}

/// Write the six `X-RateLimit-*` headers for both windows
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, outcome: &DualWindowOutcome) {
    write_window(headers, &outcome.short, [LIMIT_SHORT, REMAINING_SHORT, RESET_SHORT]);
    write_window(headers, &outcome.long, [LIMIT_LONG, REMAINING_LONG, RESET_LONG]);
}

fn write_window(headers: &mut HeaderMap, decision: &RateLimitDecision, names: [HeaderName; 3]) {
    let [limit, remaining, reset] = names;
    headers.insert(limit, HeaderValue::from(decision.limit));
    headers.insert(remaining, HeaderValue::from(decision.remaining));
    headers.insert(reset, HeaderValue::from(decision.reset_unix_secs()));
}

/// Create a 429 Too Many Requests response with rate limit headers
pub fn rate_limit_exceeded_response(outcome: &DualWindowOutcome) -> Response {
    let kind = outcome.limiting_window().unwrap_or(WindowKind::Long);
    let decision = outcome.decision(kind);
    let retry_after = decision.retry_after_secs(outcome.checked_at_ms);

    let mut headers = HeaderMap::new();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    apply_rate_limit_headers(&mut headers, outcome);

    let body = RateLimitExceededBody {
        error: "Rate limit exceeded".to_string(),
        message: exceeded_message(kind, decision),
        retry_after,
    };

    (StatusCode::TOO_MANY_REQUESTS, headers, Json(body)).into_response()
}
