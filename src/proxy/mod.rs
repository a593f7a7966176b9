use crate::error::{AdmissionError, Result};
use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Method, Request, Response},
    response::IntoResponse,
};
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Default cap on buffered request bodies (1 MiB)
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Forwarding state for the upstream application
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub upstream: Arc<str>,
    pub max_body_bytes: usize,
}

impl ProxyState {
    pub fn new(upstream: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            // Redirects from the application belong to the browser
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| AdmissionError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            upstream: Arc::from(upstream.trim_end_matches('/')),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        })
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    fn upstream_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.upstream, path_and_query)
    }
}

/// Forward an admitted request to the upstream application
pub async fn proxy_handler(
    State(state): State<ProxyState>,
    req: Request<Body>,
) -> Result<impl IntoResponse> {
    let started = Instant::now();
    let method = req.method().clone();
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let upstream_url = state.upstream_url(&path_and_query);

    debug!(method = %method, upstream_url = %upstream_url, "Forwarding to upstream");

    let headers = req.headers().clone();
    let body_bytes = Limited::new(req.into_body(), state.max_body_bytes)
        .collect()
        .await
        .map_err(|e| {
            if e.downcast_ref::<LengthLimitError>().is_some() {
                warn!(
                    method = %method,
                    path = %path_and_query,
                    limit = state.max_body_bytes,
                    "Request body too large"
                );
                AdmissionError::PayloadTooLarge(format!(
                    "Request body exceeds {} bytes",
                    state.max_body_bytes
                ))
            } else {
                AdmissionError::Upstream(format!("Failed to read request body: {}", e))
            }
        })?
        .to_bytes();

    let response = send_request(&state.client, method.clone(), &headers, body_bytes, &upstream_url).await;

    match &response {
        Ok(resp) => info!(
            method = %method,
            path = %path_and_query,
            status = %resp.status(),
            latency_ms = started.elapsed().as_secs_f64() * 1000.0,
            "Request completed"
        ),
        Err(e) => warn!(
            method = %method,
            path = %path_and_query,
            error = %e,
            latency_ms = started.elapsed().as_secs_f64() * 1000.0,
            "Request failed"
        ),
    }

    response
}

/// Send request to the upstream application
async fn send_request(
    client: &reqwest::Client,
    method: Method,
    headers: &HeaderMap,
    body_bytes: Bytes,
    upstream_url: &str,
) -> Result<Response<Body>> {
    let mut upstream_req = client.request(method, upstream_url).body(body_bytes);

    // Forward headers (excluding hop-by-hop headers and Host)
    for (name, value) in headers.iter() {
        if !is_hop_by_hop_header(name.as_str()) && name.as_str() != "host" {
            upstream_req = upstream_req.header(name, value);
        }
    }

    let upstream_response = upstream_req.send().await.map_err(|e| {
        if e.is_timeout() {
            AdmissionError::Timeout(format!("Upstream request timed out: {}", e))
        } else if e.is_connect() {
            AdmissionError::Upstream(format!("Failed to connect to upstream: {}", e))
        } else {
            AdmissionError::Upstream(format!("Upstream request failed: {}", e))
        }
    })?;

    let status = upstream_response.status();
    let mut response_builder = Response::builder().status(status);

    for (name, value) in upstream_response.headers().iter() {
        if !is_hop_by_hop_header(name.as_str()) {
            response_builder = response_builder.header(name, value);
        }
    }

    let body_bytes = upstream_response
        .bytes()
        .await
        .map_err(|e| AdmissionError::Upstream(format!("Failed to read upstream response: {}", e)))?;

    response_builder
        .body(Body::from(body_bytes))
        .map_err(|e| AdmissionError::Internal(format!("Failed to build response: {}", e)))
}

/// Check if a header is a hop-by-hop header that should not be forwarded
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}
