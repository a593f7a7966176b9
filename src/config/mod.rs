use crate::error::{AdmissionError, Result};
use crate::policy::{default_policies, RoutePolicyConfig};
use crate::rate_limit::{
    FailurePolicy, WindowConfig, WindowMode, DEFAULT_LONG_WINDOW, DEFAULT_SHORT_WINDOW,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable overriding `store.url`
pub const REDIS_URL_ENV: &str = "FORMGATE_REDIS_URL";

/// Longest accepted rate-limit window (one day)
pub const MAX_WINDOW_SECS: u64 = 86_400;

/// Main admission-layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Application that admitted requests are forwarded to
    pub upstream: UpstreamConfig,
    /// Rate-limit store
    #[serde(default)]
    pub store: StoreConfig,
    /// Submission rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Session gate
    pub session: SessionConfig,
    /// Route policy table
    #[serde(default = "default_policies")]
    pub policies: Vec<RoutePolicyConfig>,
    /// Prometheus endpoint
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Upstream application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the upstream application
    pub url: String,
    /// Upstream request timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
    /// Largest request body forwarded, in bytes
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

/// Rate-limit store backend
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    Memory,
}

/// Rate-limit store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Per-operation timeout in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

/// Submission rate-limit configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// Store key prefix
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Path prefix of form-submission endpoints
    #[serde(default = "default_submit_prefix")]
    pub submit_prefix: String,
    /// Burst window
    #[serde(default = "default_short_window")]
    pub short: WindowConfig,
    /// Sustained window
    #[serde(default = "default_long_window")]
    pub long: WindowConfig,
    /// Behaviour when the store fails
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// How the two windows are evaluated
    #[serde(default)]
    pub mode: WindowMode,
}

/// Session gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Identity provider session endpoint
    pub verify_url: String,
    /// Session cookie name (prefix)
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
    /// Session check timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub timeout_ms: u64,
    /// Login page anonymous callers are sent to
    #[serde(default = "default_login_path")]
    pub login_path: String,
    /// Where signed-in users land when no `redirectTo` is given
    #[serde(default = "default_redirect")]
    pub default_redirect: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of the compact format
    #[serde(default)]
    pub json: bool,
    /// Filter directive used when `RUST_LOG` is unset
    #[serde(default)]
    pub filter: Option<String>,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_max_body_bytes() -> usize {
    crate::proxy::DEFAULT_MAX_BODY_BYTES
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

fn default_key_prefix() -> String {
    crate::rate_limit::limiter::DEFAULT_KEY_PREFIX.to_string()
}

fn default_submit_prefix() -> String {
    crate::identifier::SUBMIT_PREFIX.to_string()
}

fn default_short_window() -> WindowConfig {
    DEFAULT_SHORT_WINDOW
}

fn default_long_window() -> WindowConfig {
    DEFAULT_LONG_WINDOW
}

fn default_cookie_name() -> String {
    "fg-session".to_string()
}

fn default_session_timeout_ms() -> u64 {
    2000
}

fn default_login_path() -> String {
    "/auth/login".to_string()
}

fn default_redirect() -> String {
    "/dashboard".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            url: default_redis_url(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            submit_prefix: default_submit_prefix(),
            short: default_short_window(),
            long: default_long_window(),
            failure_policy: FailurePolicy::default(),
            mode: WindowMode::default(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl AdmissionConfig {
    /// Load configuration from a YAML file, then apply environment overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AdmissionError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config = Self::from_yaml(&content)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| AdmissionError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Apply `FORMGATE_REDIS_URL`
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var(REDIS_URL_ENV) {
            if !url.is_empty() {
                self.store.url = url;
            }
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_http_url("upstream.url", &self.upstream.url)?;
        validate_http_url("session.verify_url", &self.session.verify_url)?;

        if self.upstream.timeout_secs == 0 {
            return Err(AdmissionError::Config(
                "upstream.timeout_secs must be > 0".to_string(),
            ));
        }

        if self.upstream.max_body_bytes == 0 {
            return Err(AdmissionError::Config(
                "upstream.max_body_bytes must be > 0".to_string(),
            ));
        }

        if self.store.backend == StoreBackend::Redis
            && !self.store.url.starts_with("redis://")
            && !self.store.url.starts_with("rediss://")
        {
            return Err(AdmissionError::Config(format!(
                "store.url must start with redis:// or rediss://: {}",
                self.store.url
            )));
        }

        if self.store.timeout_ms == 0 {
            return Err(AdmissionError::Config(
                "store.timeout_ms must be > 0".to_string(),
            ));
        }

        for (name, window) in [
            ("rate_limit.short", &self.rate_limit.short),
            ("rate_limit.long", &self.rate_limit.long),
        ] {
            if window.max_requests == 0 {
                return Err(AdmissionError::Config(format!(
                    "{}.max_requests must be > 0",
                    name
                )));
            }
            if window.window_secs == 0 || window.window_secs > MAX_WINDOW_SECS {
                return Err(AdmissionError::Config(format!(
                    "{}.window_secs must be between 1 and {}",
                    name, MAX_WINDOW_SECS
                )));
            }
        }

        if self.rate_limit.short.window_secs == self.rate_limit.long.window_secs {
            // Both windows would share one store key
            return Err(AdmissionError::Config(
                "rate_limit.short and rate_limit.long must use different window_secs".to_string(),
            ));
        }

        if self.rate_limit.key_prefix.is_empty() {
            return Err(AdmissionError::Config(
                "rate_limit.key_prefix cannot be empty".to_string(),
            ));
        }

        let submit_prefix = self.rate_limit.submit_prefix.trim_end_matches('/');
        if !submit_prefix.starts_with('/') {
            return Err(AdmissionError::Config(format!(
                "rate_limit.submit_prefix must be a non-root absolute path: {}",
                self.rate_limit.submit_prefix
            )));
        }

        for (name, path) in [
            ("session.login_path", &self.session.login_path),
            ("session.default_redirect", &self.session.default_redirect),
        ] {
            if !path.starts_with('/') || path.starts_with("//") {
                return Err(AdmissionError::Config(format!(
                    "{} must be a site-relative path: {}",
                    name, path
                )));
            }
        }

        if self.session.cookie_name.is_empty() {
            return Err(AdmissionError::Config(
                "session.cookie_name cannot be empty".to_string(),
            ));
        }

        // Table conflicts are reported by the policy table itself
        crate::policy::PolicyTable::new(self.policies.clone())?;

        Ok(())
    }
}

fn validate_http_url(name: &str, value: &str) -> Result<()> {
    let parsed = url::Url::parse(value)
        .map_err(|e| AdmissionError::Config(format!("{} is not a valid URL: {}", name, e)))?;

    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(AdmissionError::Config(format!(
            "{} must start with http:// or https://: {}",
            name, value
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::RoutePolicy;
    use std::io::Write;

    const MINIMAL: &str = r#"
upstream:
  url: "http://127.0.0.1:3000"
session:
  verify_url: "http://127.0.0.1:3000/api/auth/session"
"#;

    #[test]
    fn test_default_values() {
        let config = AdmissionConfig::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.upstream.timeout_secs, 30);
        assert_eq!(config.upstream.max_body_bytes, 1024 * 1024);
        assert_eq!(config.store.backend, StoreBackend::Redis);
        assert_eq!(config.store.timeout_ms, 250);
        assert_eq!(config.rate_limit.key_prefix, "rate_limit");
        assert_eq!(config.rate_limit.submit_prefix, "/api/submit");
        assert_eq!(config.rate_limit.short, WindowConfig::new(5, 10));
        assert_eq!(config.rate_limit.long, WindowConfig::new(100, 60));
        assert_eq!(config.rate_limit.failure_policy, FailurePolicy::FailOpen);
        assert_eq!(config.rate_limit.mode, WindowMode::Independent);
        assert_eq!(config.session.login_path, "/auth/login");
        assert_eq!(config.session.default_redirect, "/dashboard");
        assert!(config.metrics.enabled);
        assert!(!config.logging.json);
        assert_eq!(config.policies, default_policies());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  host: "127.0.0.1"
  port: 9090
upstream:
  url: "http://app:3000"
  timeout_secs: 10
  max_body_bytes: 65536
store:
  backend: memory
  timeout_ms: 100
rate_limit:
  key_prefix: "forms:rl"
  submit_prefix: "/f"
  short: { max_requests: 3, window_secs: 5 }
  long: { max_requests: 50, window_secs: 300 }
  failure_policy: fail_closed
  mode: coordinated
session:
  verify_url: "https://id.example.com/session"
  cookie_name: "sb-auth-token"
  default_redirect: "/projects"
policies:
  - path: "/f/*rest"
    policy: rate_limited
  - path: "/"
    policy: public
metrics:
  enabled: false
logging:
  json: true
  filter: "formgate=info"
"#;

        let config = AdmissionConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.upstream.max_body_bytes, 65536);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.rate_limit.submit_prefix, "/f");
        assert_eq!(config.rate_limit.short, WindowConfig::new(3, 5));
        assert_eq!(config.rate_limit.failure_policy, FailurePolicy::FailClosed);
        assert_eq!(config.rate_limit.mode, WindowMode::Coordinated);
        assert_eq!(config.session.cookie_name, "sb-auth-token");
        assert_eq!(config.policies.len(), 2);
        assert_eq!(config.policies[0].policy, RoutePolicy::RateLimited);
        assert!(!config.metrics.enabled);
        assert_eq!(config.logging.filter.as_deref(), Some("formgate=info"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_upstream_rejected() {
        let yaml = r#"
session:
  verify_url: "http://127.0.0.1:3000/session"
"#;
        assert!(AdmissionConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_validate_invalid_upstream() {
        let mut config = AdmissionConfig::from_yaml(MINIMAL).unwrap();
        config.upstream.url = "ftp://app".to_string();
        assert!(config.validate().is_err());

        config.upstream.url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_quota() {
        let mut config = AdmissionConfig::from_yaml(MINIMAL).unwrap();
        config.rate_limit.short.max_requests = 0;
        assert!(config.validate().is_err());

        let mut config = AdmissionConfig::from_yaml(MINIMAL).unwrap();
        config.rate_limit.long.window_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_window_upper_bound() {
        let mut config = AdmissionConfig::from_yaml(MINIMAL).unwrap();
        config.rate_limit.long.window_secs = MAX_WINDOW_SECS;
        assert!(config.validate().is_ok());

        config.rate_limit.long.window_secs = MAX_WINDOW_SECS + 1;
        assert!(config.validate().is_err());

        // Would overflow the millisecond arithmetic in the limiter
        config.rate_limit.long.window_secs = u64::MAX;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_zero_body_limit() {
        let mut config = AdmissionConfig::from_yaml(MINIMAL).unwrap();
        config.upstream.max_body_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_submit_prefix() {
        let mut config = AdmissionConfig::from_yaml(MINIMAL).unwrap();
        config.rate_limit.submit_prefix = "/forms/".to_string();
        assert!(config.validate().is_ok());

        config.rate_limit.submit_prefix = "api/submit".to_string();
        assert!(config.validate().is_err());

        config.rate_limit.submit_prefix = "/".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_shared_window_length() {
        let mut config = AdmissionConfig::from_yaml(MINIMAL).unwrap();
        config.rate_limit.long.window_secs = config.rate_limit.short.window_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_redis_url() {
        let mut config = AdmissionConfig::from_yaml(MINIMAL).unwrap();
        config.store.url = "http://redis:6379".to_string();
        assert!(config.validate().is_err());

        // The URL is irrelevant for the memory backend
        config.store.backend = StoreBackend::Memory;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_absolute_redirect_rejected() {
        let mut config = AdmissionConfig::from_yaml(MINIMAL).unwrap();
        config.session.default_redirect = "//evil.example".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_policy_conflict() {
        let mut config = AdmissionConfig::from_yaml(MINIMAL).unwrap();
        config.policies = vec![
            RoutePolicyConfig::new("/blog/:slug", RoutePolicy::Public),
            RoutePolicyConfig::new("/blog/:id", RoutePolicy::Gated),
        ];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(MINIMAL.as_bytes()).unwrap();

        let config = AdmissionConfig::from_file(file.path()).unwrap();
        assert_eq!(config.upstream.url, "http://127.0.0.1:3000");

        assert!(AdmissionConfig::from_file("/nonexistent/formgate.yaml").is_err());
    }
}
