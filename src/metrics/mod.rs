use crate::error::{AdmissionError, Result};
use axum::{
    body::Body,
    extract::State,
    http::{header::CONTENT_TYPE, Response, StatusCode},
    response::IntoResponse,
};
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl MetricsService {
    /// Install the global Prometheus recorder
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            AdmissionError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    fn register_metrics() {
        describe_counter!(
            "formgate_requests_total",
            "Requests seen by the admission layer, by policy and outcome"
        );
        describe_histogram!(
            "formgate_admission_duration_seconds",
            "Time spent in the admission layer before forwarding or rejecting"
        );
        describe_counter!(
            "formgate_rate_limit_exceeded_total",
            "Submissions rejected by the rate limiter, by limiting window"
        );
        describe_counter!(
            "formgate_rate_limit_store_errors_total",
            "Rate-limit store failures handled by the failure policy"
        );
        describe_counter!(
            "formgate_session_redirects_total",
            "Redirects issued by the session gate"
        );
        describe_counter!(
            "formgate_session_errors_total",
            "Identity provider failures treated as anonymous"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

/// Metrics endpoint handler
pub async fn metrics_handler(State(service): State<MetricsService>) -> impl IntoResponse {
    let body = service.render();
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(body))
        .map_err(|e| AdmissionError::Internal(format!("Failed to build metrics response: {}", e)))
}

/// Record the admission outcome of one request
pub fn record_request(policy: &str, outcome: &str) {
    let labels = [
        ("policy", policy.to_string()),
        ("outcome", outcome.to_string()),
    ];
    counter!("formgate_requests_total", &labels).increment(1);
}

/// Record a rate-limit rejection
pub fn record_rate_limit_exceeded(window: &str) {
    let labels = [("window", window.to_string())];
    counter!("formgate_rate_limit_exceeded_total", &labels).increment(1);
}

/// Record a store failure (operation: pipeline, zrem, script)
pub fn record_store_error(operation: &str) {
    let labels = [("operation", operation.to_string())];
    counter!("formgate_rate_limit_store_errors_total", &labels).increment(1);
}

/// Record a session redirect (reason: login_required, already_signed_in)
pub fn record_session_redirect(reason: &str) {
    let labels = [("reason", reason.to_string())];
    counter!("formgate_session_redirects_total", &labels).increment(1);
}

/// Record an identity provider failure
pub fn record_session_error() {
    counter!("formgate_session_errors_total").increment(1);
}

/// Timer for measuring time spent in the admission layer
pub struct Timer {
    start: Instant,
    policy: &'static str,
}

impl Timer {
    pub fn new(policy: &'static str) -> Self {
        Self {
            start: Instant::now(),
            policy,
        }
    }

    /// Record the elapsed time along with the outcome
    pub fn record(self, outcome: &str) {
        let labels = [("policy", self.policy.to_string())];
        histogram!("formgate_admission_duration_seconds", &labels)
            .record(self.start.elapsed().as_secs_f64());
        record_request(self.policy, outcome);
    }

    /// Get the elapsed time in seconds
    pub fn elapsed(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
