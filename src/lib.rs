pub mod admission;
pub mod config;
pub mod error;
pub mod identifier;
pub mod metrics;
pub mod policy;
pub mod proxy;
pub mod rate_limit;
pub mod session;

use crate::admission::{admission_middleware, AdmissionState, RedirectSettings};
use crate::config::{AdmissionConfig, LoggingConfig, StoreBackend, StoreConfig};
use crate::error::{AdmissionError, Result};
use crate::identifier::IdentifierResolver;
use crate::metrics::{metrics_handler, MetricsService};
use crate::policy::PolicyTable;
use crate::proxy::{proxy_handler, ProxyState};
use crate::rate_limit::{
    Clock, DualWindowLimiter, MemoryStore, RateLimitStore, RedisStore, SlidingWindowLimiter,
    SystemClock,
};
use crate::session::{RemoteSessionGate, SessionGate};
use axum::{middleware, response::IntoResponse, routing::get, Json, Router as AxumRouter};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Default log filter when `RUST_LOG` and `logging.filter` are unset
pub const DEFAULT_LOG_FILTER: &str = "formgate=debug,tower_http=debug";

/// Initialize the admission server
pub async fn init_admission(config: AdmissionConfig) -> Result<()> {
    config.validate()?;

    info!("Starting formgate admission layer");
    info!(
        "Server listening on {}:{}",
        config.server.host, config.server.port
    );

    // Install the recorder before anything records
    let metrics = if config.metrics.enabled {
        Some(MetricsService::new()?)
    } else {
        None
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = build_store(&config.store, clock.clone()).await?;

    let session: Arc<dyn SessionGate> = Arc::new(RemoteSessionGate::new(
        config.session.verify_url.clone(),
        config.session.cookie_name.clone(),
        Duration::from_millis(config.session.timeout_ms),
    )?);

    let admission = build_admission_state(&config, store, clock, session)?;
    info!("Loaded {} route policies", admission.policies().len());

    let proxy = ProxyState::new(
        &config.upstream.url,
        Duration::from_secs(config.upstream.timeout_secs),
    )?
    .with_max_body_bytes(config.upstream.max_body_bytes);
    info!(upstream = %config.upstream.url, "Forwarding admitted requests");

    let app = build_app(admission, proxy, metrics);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(AdmissionError::Io)?;

    info!("Admission layer ready to accept connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| AdmissionError::Internal(format!("Server error: {}", e)))?;

    info!("Server shutdown complete");
    Ok(())
}

/// Construct the rate-limit store for the configured backend
///
/// An unreachable store is not fatal: the limiter's failure policy covers it
/// until the store comes back.
pub async fn build_store(
    config: &StoreConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn RateLimitStore>> {
    let store: Arc<dyn RateLimitStore> = match config.backend {
        StoreBackend::Redis => Arc::new(RedisStore::new(&config.url)?),
        StoreBackend::Memory => {
            warn!("Using in-process rate-limit store, limits are not shared between instances");
            Arc::new(MemoryStore::new(clock))
        }
    };

    let timeout = Duration::from_millis(config.timeout_ms);
    match tokio::time::timeout(timeout, store.ping()).await {
        Ok(Ok(())) => info!(backend = ?config.backend, "Rate-limit store reachable"),
        Ok(Err(e)) => warn!(error = %e, "Rate-limit store unreachable at startup"),
        Err(_) => warn!(timeout_ms = config.timeout_ms, "Rate-limit store ping timed out at startup"),
    }

    Ok(store)
}

/// Wire the admission components from configuration
pub fn build_admission_state(
    config: &AdmissionConfig,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    session: Arc<dyn SessionGate>,
) -> Result<AdmissionState> {
    let policies = PolicyTable::new(config.policies.clone())?;

    let settings = &config.rate_limit;
    let limiter = SlidingWindowLimiter::new(
        store,
        clock,
        settings.failure_policy,
        Duration::from_millis(config.store.timeout_ms),
    )
    .with_key_prefix(settings.key_prefix.clone());

    let dual = DualWindowLimiter::new(
        Arc::new(limiter),
        settings.short,
        settings.long,
        settings.mode,
    );

    let redirects = RedirectSettings {
        login_path: config.session.login_path.clone(),
        default_redirect: config.session.default_redirect.clone(),
    };

    Ok(AdmissionState::new(
        policies,
        IdentifierResolver::new(settings.submit_prefix.clone()),
        dual,
        session,
        redirects,
    ))
}

/// Build the HTTP application
///
/// `/healthz` and `/metrics` are served directly; every other request goes
/// through the admission layer and, if admitted, to the upstream.
pub fn build_app(
    admission: AdmissionState,
    proxy: ProxyState,
    metrics: Option<MetricsService>,
) -> AxumRouter {
    let admitted = AxumRouter::new()
        .fallback(proxy_handler)
        .with_state(proxy)
        .layer(middleware::from_fn_with_state(admission, admission_middleware));

    let mut app = AxumRouter::new().route("/healthz", get(healthz));

    if let Some(service) = metrics {
        app = app.merge(
            AxumRouter::new()
                .route("/metrics", get(metrics_handler))
                .with_state(service),
        );
    }

    app.merge(admitted).layer(TraceLayer::new_for_http())
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

/// Initialize tracing/logging
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(
            logging.filter.as_deref().unwrap_or(DEFAULT_LOG_FILTER),
        )
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    if logging.json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
