use crate::error::{AdmissionError, Result};
use matchit::Router as MatchitRouter;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Admission policy applied to a path
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RoutePolicy {
    /// Public ingestion: dual-window rate limit, no session checks
    RateLimited,
    /// Anonymous access allowed
    Public,
    /// Login/signup entry pages: anonymous access allowed, signed-in users
    /// are sent on to their destination
    AuthFlow,
    /// Session required
    Gated,
}

impl RoutePolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutePolicy::RateLimited => "rate_limited",
            RoutePolicy::Public => "public",
            RoutePolicy::AuthFlow => "auth_flow",
            RoutePolicy::Gated => "gated",
        }
    }
}

impl fmt::Display for RoutePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of the route policy table
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RoutePolicyConfig {
    /// Path pattern (e.g., "/blog/:slug", "/api/submit/*rest")
    pub path: String,
    /// Policy for matching requests
    pub policy: RoutePolicy,
}

impl RoutePolicyConfig {
    pub fn new(path: impl Into<String>, policy: RoutePolicy) -> Self {
        Self {
            path: path.into(),
            policy,
        }
    }
}

/// Default policy table for the form backend
pub fn default_policies() -> Vec<RoutePolicyConfig> {
    use RoutePolicy::*;

    let mut table = vec![
        RoutePolicyConfig::new("/api/submit", RateLimited),
        RoutePolicyConfig::new("/api/submit/*rest", RateLimited),
        RoutePolicyConfig::new("/auth", AuthFlow),
        RoutePolicyConfig::new("/auth/login", AuthFlow),
        RoutePolicyConfig::new("/auth/signup", AuthFlow),
        // Callback, sign-out and password reset must stay reachable when signed in
        RoutePolicyConfig::new("/auth/*rest", Public),
    ];

    let public_pages = [
        "/",
        "/pricing",
        "/features",
        "/about",
        "/contact",
        "/docs",
        "/docs/*rest",
        "/privacy",
        "/terms",
        "/blog",
        "/blog/:slug",
        "/status",
    ];

    let public_api = [
        "/api/zapier/auth",
        "/api/zapier/subscribe",
        "/api/zapier/unsubscribe",
        "/api/zapier/perform",
        "/api/zapier/endpoints",
        "/api/n8n/auth",
        "/api/n8n/subscribe",
        "/api/n8n/unsubscribe",
        "/api/n8n/perform",
        "/api/n8n/endpoints",
        "/api/webhooks/stripe",
        "/api/forms/:projectId/schema",
    ];

    table.extend(
        public_pages
            .iter()
            .chain(public_api.iter())
            .map(|path| RoutePolicyConfig::new(*path, Public)),
    );
    table
}

/// Declarative path → policy table
#[derive(Clone)]
pub struct PolicyTable {
    matcher: MatchitRouter<RoutePolicy>,
    patterns: Vec<String>,
    fallback: RoutePolicy,
}

impl fmt::Debug for PolicyTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PolicyTable")
            .field("patterns", &self.patterns)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl PolicyTable {
    /// Build a table; unmatched paths are session-gated
    pub fn new(entries: Vec<RoutePolicyConfig>) -> Result<Self> {
        let mut matcher = MatchitRouter::new();
        let mut patterns = Vec::with_capacity(entries.len());

        for entry in entries {
            if !entry.path.starts_with('/') {
                return Err(AdmissionError::InvalidPolicy(format!(
                    "Policy path must start with '/': {}",
                    entry.path
                )));
            }

            // Convert path syntax from :param to {param} and *path to {*path}
            let matchit_path = convert_path_syntax(&entry.path);

            matcher.insert(&matchit_path, entry.policy).map_err(|e| {
                AdmissionError::InvalidPolicy(format!(
                    "Failed to insert policy for {}: {}",
                    entry.path, e
                ))
            })?;
            patterns.push(entry.path);
        }

        Ok(Self {
            matcher,
            patterns,
            fallback: RoutePolicy::Gated,
        })
    }

    /// Policy for `path`
    pub fn classify(&self, path: &str) -> RoutePolicy {
        let normalized = normalize_path(path);
        self.matcher
            .at(normalized)
            .map(|matched| *matched.value)
            .unwrap_or(self.fallback)
    }

    /// Configured patterns, in insertion order
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Strip a trailing slash so "/blog/" matches "/blog"
fn normalize_path(path: &str) -> &str {
    if path.len() > 1 {
        let trimmed = path.trim_end_matches('/');
        if trimmed.is_empty() {
            "/"
        } else {
            trimmed
        }
    } else if path.is_empty() {
        "/"
    } else {
        path
    }
}

/// Convert path syntax from Express-style (:param, *path) to matchit syntax ({param}, {*path})
fn convert_path_syntax(path: &str) -> String {
    let mut result = String::with_capacity(path.len() + 4);
    let mut chars = path.chars().peekable();

    while let Some(ch) = chars.next() {
        let opener = match ch {
            ':' => "{",
            '*' => "{*",
            _ => {
                result.push(ch);
                continue;
            }
        };

        result.push_str(opener);
        while let Some(next_ch) = chars.next_if(|c| c.is_alphanumeric() || *c == '_') {
            result.push(next_ch);
        }
        result.push('}');
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> PolicyTable {
        PolicyTable::new(default_policies()).unwrap()
    }

    #[test]
    fn test_convert_path_syntax() {
        assert_eq!(convert_path_syntax("/blog/:slug"), "/blog/{slug}");
        assert_eq!(
            convert_path_syntax("/api/forms/:projectId/schema"),
            "/api/forms/{projectId}/schema"
        );
        assert_eq!(convert_path_syntax("/docs/*rest"), "/docs/{*rest}");
        assert_eq!(convert_path_syntax("/pricing"), "/pricing");
    }

    #[test]
    fn test_submission_paths_are_rate_limited() {
        let table = table();
        assert_eq!(table.classify("/api/submit/p1/contact"), RoutePolicy::RateLimited);
        assert_eq!(table.classify("/api/submit/p1"), RoutePolicy::RateLimited);
        assert_eq!(table.classify("/api/submit"), RoutePolicy::RateLimited);
    }

    #[test]
    fn test_public_paths() {
        let table = table();
        for path in [
            "/",
            "/pricing",
            "/blog",
            "/blog/launch-week",
            "/blog/",
            "/docs/webhooks/retries",
            "/status",
            "/api/zapier/subscribe",
            "/api/n8n/perform",
            "/api/webhooks/stripe",
            "/api/forms/proj_1/schema",
            "/auth/callback",
        ] {
            assert_eq!(table.classify(path), RoutePolicy::Public, "{}", path);
        }
    }

    #[test]
    fn test_auth_flow_paths() {
        let table = table();
        assert_eq!(table.classify("/auth/login"), RoutePolicy::AuthFlow);
        assert_eq!(table.classify("/auth/signup"), RoutePolicy::AuthFlow);
        assert_eq!(table.classify("/auth"), RoutePolicy::AuthFlow);
    }

    #[test]
    fn test_unmatched_paths_are_gated() {
        let table = table();
        assert_eq!(table.classify("/dashboard"), RoutePolicy::Gated);
        assert_eq!(table.classify("/dashboard/forms/1"), RoutePolicy::Gated);
        assert_eq!(table.classify("/api/projects"), RoutePolicy::Gated);
        assert_eq!(table.classify("/api/forms/proj_1/submissions"), RoutePolicy::Gated);
        assert_eq!(table.classify("/blog/a/b"), RoutePolicy::Gated);
    }

    #[test]
    fn test_table_is_data_driven() {
        let table = PolicyTable::new(vec![
            RoutePolicyConfig::new("/f/*rest", RoutePolicy::RateLimited),
            RoutePolicyConfig::new("/landing", RoutePolicy::Public),
        ])
        .unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.classify("/f/p1/e1"), RoutePolicy::RateLimited);
        assert_eq!(table.classify("/landing"), RoutePolicy::Public);
        assert_eq!(table.classify("/api/submit/p1/e1"), RoutePolicy::Gated);
    }

    #[test]
    fn test_conflicting_patterns_rejected() {
        let result = PolicyTable::new(vec![
            RoutePolicyConfig::new("/blog/:slug", RoutePolicy::Public),
            RoutePolicyConfig::new("/blog/:id", RoutePolicy::Gated),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_relative_pattern_rejected() {
        let result = PolicyTable::new(vec![RoutePolicyConfig::new("blog", RoutePolicy::Public)]);
        assert!(matches!(result, Err(AdmissionError::InvalidPolicy(_))));
    }

    #[test]
    fn test_policy_serde() {
        let entry: RoutePolicyConfig =
            serde_yaml::from_str("path: /api/submit/*rest\npolicy: rate_limited").unwrap();
        assert_eq!(entry.policy, RoutePolicy::RateLimited);
    }
}
