use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A single sliding window: at most `max_requests` within `window_secs`
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WindowConfig {
    /// Maximum number of requests allowed inside the window
    pub max_requests: u32,
    /// Trailing window length (in seconds)
    pub window_secs: u64,
}

impl WindowConfig {
    pub const fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    /// Get the window as a Duration
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Window length in milliseconds, saturating at `i64::MAX`
    pub fn window_ms(&self) -> i64 {
        i64::try_from(self.window_secs)
            .unwrap_or(i64::MAX)
            .saturating_mul(1000)
    }

    /// Oldest score still inside the window at `now_ms`
    pub fn window_start(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.window_ms())
    }
}

/// What the limiter does when the store cannot answer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Admit the request and report a locally computed decision
    #[default]
    FailOpen,
    /// Reject the request
    FailClosed,
}

/// How several windows for one identifier are evaluated
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// One atomic batch per window, each with its own compensating delete
    #[default]
    Independent,
    /// All windows in one server-side script; a deny inserts nothing
    Coordinated,
}

/// Outcome of one window check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Remaining requests in the current window
    pub remaining: u32,
    /// Window quota
    pub limit: u32,
    /// Window length (seconds)
    pub window_secs: u64,
    /// Absolute reset time (epoch milliseconds)
    pub reset_time_ms: i64,
}

impl RateLimitDecision {
    /// Build a decision from the number of requests already in the window,
    /// not counting the current one.
    pub fn from_count(window: &WindowConfig, prior_count: u64, now_ms: i64) -> Self {
        let current = prior_count.saturating_add(1);
        let limit = u64::from(window.max_requests);

        Self {
            allowed: current <= limit,
            remaining: limit.saturating_sub(current) as u32,
            limit: window.max_requests,
            window_secs: window.window_secs,
            reset_time_ms: now_ms.saturating_add(window.window_ms()),
        }
    }

    /// Decision used when the store is unavailable and the policy is fail-open
    pub fn fail_open(window: &WindowConfig, now_ms: i64) -> Self {
        Self {
            allowed: true,
            remaining: window.max_requests.saturating_sub(1),
            limit: window.max_requests,
            window_secs: window.window_secs,
            reset_time_ms: now_ms.saturating_add(window.window_ms()),
        }
    }

    /// Decision used when the store is unavailable and the policy is fail-closed
    pub fn fail_closed(window: &WindowConfig, now_ms: i64) -> Self {
        Self {
            allowed: false,
            remaining: 0,
            limit: window.max_requests,
            window_secs: window.window_secs,
            reset_time_ms: now_ms.saturating_add(window.window_ms()),
        }
    }

    /// Seconds until reset, rounded up, as sent in `Retry-After`
    pub fn retry_after_secs(&self, now_ms: i64) -> u64 {
        let millis = self.reset_time_ms.saturating_sub(now_ms).max(0) as u64;
        millis.div_ceil(1000)
    }

    /// Reset time as unix seconds, rounded up so it never precedes the reset
    pub fn reset_unix_secs(&self) -> i64 {
        let secs = self.reset_time_ms / 1000;
        if self.reset_time_ms % 1000 > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

/// Rate limit key components
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    /// Client identifier (address plus resource)
    pub identifier: String,
    /// Window length the key counts
    pub window_secs: u64,
}

impl RateLimitKey {
    pub fn new(identifier: impl Into<String>, window_secs: u64) -> Self {
        Self {
            identifier: identifier.into(),
            window_secs,
        }
    }

    /// Convert to a store key: `<prefix>:<identifier>:<windowSeconds>`
    pub fn to_store_key(&self, prefix: &str) -> String {
        format!("{}:{}:{}", prefix, self.identifier, self.window_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_huge_window_saturates() {
        let window = WindowConfig::new(1, u64::MAX);
        assert_eq!(window.window_ms(), i64::MAX);
        assert_eq!(window.window_start(1_700_000_000_000), 1_700_000_000_000 - i64::MAX);

        let decision = RateLimitDecision::from_count(&window, 0, 1_700_000_000_000);
        assert_eq!(decision.reset_time_ms, i64::MAX);
    }

    #[test]
    fn test_rate_limit_key_to_store_key() {
        let key = RateLimitKey::new("203.0.113.7:proj_1:contact", 10);
        assert_eq!(
            key.to_store_key("rate_limit"),
            "rate_limit:203.0.113.7:proj_1:contact:10"
        );
    }

    #[test]
    fn test_window_start() {
        let window = WindowConfig::new(5, 10);
        assert_eq!(window.window_start(60_000), 50_000);
        assert_eq!(window.window(), Duration::from_secs(10));
    }

    #[test]
    fn test_decision_from_count() {
        let window = WindowConfig::new(5, 10);

        let first = RateLimitDecision::from_count(&window, 0, 1_000);
        assert!(first.allowed);
        assert_eq!(first.remaining, 4);
        assert_eq!(first.reset_time_ms, 11_000);

        let last = RateLimitDecision::from_count(&window, 4, 1_000);
        assert!(last.allowed);
        assert_eq!(last.remaining, 0);

        let over = RateLimitDecision::from_count(&window, 5, 1_000);
        assert!(!over.allowed);
        assert_eq!(over.remaining, 0);
    }

    #[test]
    fn test_failure_decisions() {
        let window = WindowConfig::new(100, 60);

        let open = RateLimitDecision::fail_open(&window, 0);
        assert!(open.allowed);
        assert_eq!(open.remaining, 99);

        let closed = RateLimitDecision::fail_closed(&window, 0);
        assert!(!closed.allowed);
        assert_eq!(closed.remaining, 0);
        assert_eq!(closed.reset_time_ms, 60_000);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        let window = WindowConfig::new(5, 10);
        let decision = RateLimitDecision::from_count(&window, 5, 1_000);

        assert_eq!(decision.retry_after_secs(1_000), 10);
        assert_eq!(decision.retry_after_secs(1_001), 10);
        assert_eq!(decision.retry_after_secs(2_000), 9);
        assert_eq!(decision.retry_after_secs(20_000), 0);
    }

    #[test]
    fn test_reset_unix_secs() {
        let window = WindowConfig::new(5, 10);
        assert_eq!(
            RateLimitDecision::from_count(&window, 0, 1_000).reset_unix_secs(),
            11
        );
        assert_eq!(
            RateLimitDecision::from_count(&window, 0, 1_500).reset_unix_secs(),
            12
        );
    }

    #[test]
    fn test_policy_serde_names() {
        let policy: FailurePolicy = serde_yaml::from_str("fail_closed").unwrap();
        assert_eq!(policy, FailurePolicy::FailClosed);

        let mode: WindowMode = serde_yaml::from_str("coordinated").unwrap();
        assert_eq!(mode, WindowMode::Coordinated);
    }
}
