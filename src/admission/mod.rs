//! Request admission
//!
//! Every request is classified by the route policy table and then either
//! rate limited (public submissions) or passed through the session gate
//! (everything else). Submissions never see session checks.

use crate::error::AdmissionError;
use crate::identifier::IdentifierResolver;
use crate::metrics::{self, Timer};
use crate::policy::{PolicyTable, RoutePolicy};
use crate::rate_limit::{apply_rate_limit_headers, rate_limit_exceeded_response, DualWindowLimiter};
use crate::session::{SessionGate, SessionUser};
use axum::{
    extract::{Request, State},
    http::{header::LOCATION, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::form_urlencoded;

/// Header carrying the verified user id to the upstream application
pub const USER_ID_HEADER: HeaderName = HeaderName::from_static("x-user-id");

/// Query parameter holding the post-login destination
pub const REDIRECT_PARAM: &str = "redirectTo";

/// Where the session gate sends callers
#[derive(Debug, Clone)]
pub struct RedirectSettings {
    /// Login page for anonymous callers on gated paths
    pub login_path: String,
    /// Landing page for signed-in callers on auth-flow paths
    pub default_redirect: String,
}

impl Default for RedirectSettings {
    fn default() -> Self {
        Self {
            login_path: "/auth/login".to_string(),
            default_redirect: "/dashboard".to_string(),
        }
    }
}

impl RedirectSettings {
    /// `<login_path>?redirectTo=<original>`
    pub fn login_location(&self, original: &str) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair(REDIRECT_PARAM, original)
            .finish();
        format!("{}?{}", self.login_path, query)
    }

    /// The requested `redirectTo` if it stays on this site, else the default
    pub fn destination(&self, query: Option<&str>) -> String {
        query
            .and_then(|q| {
                form_urlencoded::parse(q.as_bytes())
                    .find(|(key, _)| key == REDIRECT_PARAM)
                    .map(|(_, value)| value.into_owned())
            })
            .filter(|target| is_site_relative(target))
            .unwrap_or_else(|| self.default_redirect.clone())
    }
}

/// Relative to this site: no scheme, no protocol-relative `//host`
fn is_site_relative(target: &str) -> bool {
    target.starts_with('/')
        && !target.starts_with("//")
        && !target.starts_with("/\\")
        && !target.contains(['\r', '\n'])
}

/// Shared admission state
#[derive(Clone)]
pub struct AdmissionState {
    policies: Arc<PolicyTable>,
    resolver: Arc<IdentifierResolver>,
    limiter: Arc<DualWindowLimiter>,
    session: Arc<dyn SessionGate>,
    redirects: Arc<RedirectSettings>,
}

impl AdmissionState {
    pub fn new(
        policies: PolicyTable,
        resolver: IdentifierResolver,
        limiter: DualWindowLimiter,
        session: Arc<dyn SessionGate>,
        redirects: RedirectSettings,
    ) -> Self {
        Self {
            policies: Arc::new(policies),
            resolver: Arc::new(resolver),
            limiter: Arc::new(limiter),
            session,
            redirects: Arc::new(redirects),
        }
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }
}

/// Axum middleware applying the admission policy chain
pub async fn admission_middleware(
    State(state): State<AdmissionState>,
    mut request: Request,
    next: Next,
) -> Response {
    // Only the gate may assert an identity upstream
    request.headers_mut().remove(USER_ID_HEADER);

    let policy = state.policies.classify(request.uri().path());
    let timer = Timer::new(policy.as_str());

    debug!(
        method = %request.method(),
        path = %request.uri().path(),
        policy = %policy,
        "Classified request"
    );

    match policy {
        RoutePolicy::RateLimited => admit_submission(&state, request, next, timer).await,
        RoutePolicy::Public | RoutePolicy::AuthFlow | RoutePolicy::Gated => {
            gate_session(&state, policy, request, next, timer).await
        }
    }
}

/// Public ingestion: both windows must admit
async fn admit_submission(
    state: &AdmissionState,
    mut request: Request,
    next: Next,
    timer: Timer,
) -> Response {
    let identifier = state
        .resolver
        .resolve(request.uri().path(), request.headers());
    let outcome = state.limiter.check(&identifier).await;

    if let Some(window) = outcome.limiting_window() {
        warn!(
            identifier = %identifier,
            window = %window,
            retry_after = outcome.retry_after_secs().unwrap_or_default(),
            "Rate limit exceeded"
        );
        metrics::record_rate_limit_exceeded(window.as_str());
        timer.record("rejected");
        return rate_limit_exceeded_response(&outcome);
    }

    apply_rate_limit_headers(request.headers_mut(), &outcome);
    timer.record("forwarded");

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &outcome);
    response
}

/// Everything else: verify the session, redirect where required
async fn gate_session(
    state: &AdmissionState,
    policy: RoutePolicy,
    mut request: Request,
    next: Next,
    timer: Timer,
) -> Response {
    let session = match state.session.verify(request.headers()).await {
        Ok(session) => session,
        Err(e) => {
            warn!(error = %e, "Session verification failed, treating as anonymous");
            metrics::record_session_error();
            None
        }
    };

    match (session, policy) {
        (None, RoutePolicy::Gated) => {
            let original = request
                .uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/");
            let location = state.redirects.login_location(original);

            info!(path = %request.uri().path(), "Anonymous access to gated path, redirecting to login");
            metrics::record_session_redirect("login_required");
            timer.record("redirected");
            found(&location)
        }
        (Some(user), RoutePolicy::AuthFlow) => {
            let location = state.redirects.destination(request.uri().query());

            debug!(user_id = %user.id, location = %location, "Signed-in user on auth page, redirecting");
            metrics::record_session_redirect("already_signed_in");
            timer.record("redirected");
            found(&location)
        }
        (Some(user), _) => {
            attach_user(&mut request, user);
            timer.record("forwarded");
            next.run(request).await
        }
        (None, _) => {
            timer.record("forwarded");
            next.run(request).await
        }
    }
}

fn attach_user(request: &mut Request, user: SessionUser) {
    match HeaderValue::from_str(&user.id) {
        Ok(value) => {
            request.headers_mut().insert(USER_ID_HEADER, value);
        }
        Err(_) => warn!(user_id = %user.id, "User id is not a valid header value"),
    }
    request.extensions_mut().insert(user);
}

/// 302 Found
fn found(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(LOCATION, value)]).into_response(),
        Err(e) => {
            AdmissionError::Internal(format!("Invalid redirect location: {}", e)).into_response()
        }
    }
}
