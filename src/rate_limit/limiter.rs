use super::clock::Clock;
use super::store::{RateLimitStore, StoreError, StoreOp, WindowSlot};
use super::types::{FailurePolicy, RateLimitDecision, RateLimitKey, WindowConfig};
use crate::metrics;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Default key prefix for rate-limit records
pub const DEFAULT_KEY_PREFIX: &str = "rate_limit";

/// Distributed sliding-window log rate limiter
///
/// Each check prunes, counts, inserts and refreshes the TTL of one window in
/// a single atomic batch. Store failures never reach the caller: they are
/// logged and converted according to the configured [`FailurePolicy`].
pub struct SlidingWindowLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
    timeout: Duration,
    key_prefix: String,
}

impl SlidingWindowLimiter {
    pub fn new(
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        failure_policy: FailurePolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            failure_policy,
            timeout,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn store_key(&self, identifier: &str, window_secs: u64) -> String {
        RateLimitKey::new(identifier, window_secs).to_store_key(&self.key_prefix)
    }

    /// Check one window for `identifier`
    pub async fn check_rate_limit(
        &self,
        identifier: &str,
        window: &WindowConfig,
    ) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let key = self.store_key(identifier, window.window_secs);
        let member = member_token(now);

        let ops = vec![
            StoreOp::ZRemRangeByScore {
                key: key.clone(),
                max_exclusive: window.window_start(now),
            },
            StoreOp::ZCard { key: key.clone() },
            StoreOp::ZAdd {
                key: key.clone(),
                score: now,
                member: member.clone(),
            },
            StoreOp::Expire {
                key: key.clone(),
                seconds: window.window_secs,
            },
        ];

        let replies = match self.bounded(self.store.pipeline(ops)).await {
            Ok(replies) => replies,
            Err(e) => return self.on_store_error("pipeline", &key, window, now, &e),
        };

        let prior_count = match replies.get(1) {
            Some(count) if *count >= 0 => *count as u64,
            other => {
                let e = StoreError::UnexpectedReply(format!("ZCARD reply {:?}", other));
                return self.on_store_error("pipeline", &key, window, now, &e);
            }
        };

        let decision = RateLimitDecision::from_count(window, prior_count, now);

        debug!(
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Sliding window check"
        );

        if !decision.allowed {
            // Undo the speculative insert; a failure leaves one extra member
            // that ages out with the window.
            if let Err(e) = self.bounded(self.store.zrem(&key, &member)).await {
                warn!(key = %key, error = %e, "Failed to remove denied request from window");
                metrics::record_store_error("zrem");
            }
        }

        decision
    }

    /// Check several windows for `identifier` in one atomic script.
    /// The request is inserted into no window unless all of them admit it.
    pub async fn check_windows(
        &self,
        identifier: &str,
        windows: &[WindowConfig],
    ) -> Vec<RateLimitDecision> {
        let now = self.clock.now_ms();
        let slots: Vec<WindowSlot> = windows
            .iter()
            .map(|window| WindowSlot {
                key: self.store_key(identifier, window.window_secs),
                window_secs: window.window_secs,
                max_requests: window.max_requests,
                member: member_token(now),
            })
            .collect();

        let counts = match self.bounded(self.store.check_windows_atomic(&slots, now)).await {
            Ok(counts) if counts.len() == windows.len() => counts,
            Ok(counts) => {
                let e = StoreError::UnexpectedReply(format!(
                    "expected {} counts, got {}",
                    windows.len(),
                    counts.len()
                ));
                return self.on_store_errors(identifier, windows, now, &e);
            }
            Err(e) => return self.on_store_errors(identifier, windows, now, &e),
        };

        let decisions: Vec<RateLimitDecision> = windows
            .iter()
            .zip(counts)
            .map(|(window, count)| RateLimitDecision::from_count(window, count, now))
            .collect();

        debug!(
            identifier = %identifier,
            allowed = decisions.iter().all(|d| d.allowed),
            "Coordinated window check"
        );

        decisions
    }

    async fn bounded<T, F>(&self, operation: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::time::timeout(self.timeout, operation)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }

    fn fallback_decision(&self, window: &WindowConfig, now: i64) -> RateLimitDecision {
        match self.failure_policy {
            FailurePolicy::FailOpen => RateLimitDecision::fail_open(window, now),
            FailurePolicy::FailClosed => RateLimitDecision::fail_closed(window, now),
        }
    }

    fn on_store_error(
        &self,
        operation: &str,
        key: &str,
        window: &WindowConfig,
        now: i64,
        e: &StoreError,
    ) -> RateLimitDecision {
        error!(
            key = %key,
            error = %e,
            policy = ?self.failure_policy,
            "Rate-limit store error"
        );
        metrics::record_store_error(operation);
        self.fallback_decision(window, now)
    }

    fn on_store_errors(
        &self,
        identifier: &str,
        windows: &[WindowConfig],
        now: i64,
        e: &StoreError,
    ) -> Vec<RateLimitDecision> {
        error!(
            identifier = %identifier,
            error = %e,
            policy = ?self.failure_policy,
            "Rate-limit store error"
        );
        metrics::record_store_error("script");
        windows
            .iter()
            .map(|window| self.fallback_decision(window, now))
            .collect()
    }
}

/// Unique sorted-set member: `<epoch millis>-<uuid>`
fn member_token(now_ms: i64) -> String {
    format!("{}-{}", now_ms, Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::clock::ManualClock;
    use crate::rate_limit::memory::MemoryStore;
    use async_trait::async_trait;

    const WINDOW: WindowConfig = WindowConfig::new(5, 10);

    fn limiter(policy: FailurePolicy) -> (SlidingWindowLimiter, Arc<MemoryStore>, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(MemoryStore::new(Arc::new(clock.clone())));
        let limiter = SlidingWindowLimiter::new(
            store.clone(),
            Arc::new(clock.clone()),
            policy,
            Duration::from_millis(250),
        );
        (limiter, store, clock)
    }

    /// Store whose calls never complete
    struct HangingStore;

    #[async_trait]
    impl RateLimitStore for HangingStore {
        async fn pipeline(&self, _ops: Vec<StoreOp>) -> Result<Vec<i64>, StoreError> {
            std::future::pending().await
        }

        async fn zrem(&self, _key: &str, _member: &str) -> Result<(), StoreError> {
            std::future::pending().await
        }

        async fn check_windows_atomic(
            &self,
            _windows: &[WindowSlot],
            _now_ms: i64,
        ) -> Result<Vec<u64>, StoreError> {
            std::future::pending().await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            std::future::pending().await
        }
    }

    /// Memory store whose `ZREM` always fails
    struct FailingZremStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl RateLimitStore for FailingZremStore {
        async fn pipeline(&self, ops: Vec<StoreOp>) -> Result<Vec<i64>, StoreError> {
            self.inner.pipeline(ops).await
        }

        async fn zrem(&self, _key: &str, _member: &str) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("zrem rejected".into()))
        }

        async fn check_windows_atomic(
            &self,
            windows: &[WindowSlot],
            now_ms: i64,
        ) -> Result<Vec<u64>, StoreError> {
            self.inner.check_windows_atomic(windows, now_ms).await
        }

        async fn ping(&self) -> Result<(), StoreError> {
            self.inner.ping().await
        }
    }

    #[test]
    fn test_member_token_is_unique() {
        let a = member_token(1_000);
        let b = member_token(1_000);
        assert!(a.starts_with("1000-"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_admits_under_quota_with_decreasing_remaining() {
        let (limiter, _store, _clock) = limiter(FailurePolicy::FailOpen);

        let mut remaining = Vec::new();
        for _ in 0..5 {
            let decision = limiter.check_rate_limit("A", &WINDOW).await;
            assert!(decision.allowed);
            remaining.push(decision.remaining);
        }

        assert_eq!(remaining, vec![4, 3, 2, 1, 0]);
    }

    #[tokio::test]
    async fn test_denies_over_quota_and_compensates() {
        let (limiter, store, clock) = limiter(FailurePolicy::FailOpen);

        for _ in 0..5 {
            assert!(limiter.check_rate_limit("A", &WINDOW).await.allowed);
        }

        let denied = limiter.check_rate_limit("A", &WINDOW).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.retry_after_secs(clock.now_ms()), 10);

        // The denied member was removed again
        assert_eq!(store.cardinality("rate_limit:A:10"), 5);
    }

    #[tokio::test]
    async fn test_failed_compensation_still_denies() {
        let clock = ManualClock::new(1_700_000_000_000);
        let store = Arc::new(FailingZremStore {
            inner: MemoryStore::new(Arc::new(clock.clone())),
        });
        let limiter = SlidingWindowLimiter::new(
            store.clone(),
            Arc::new(clock.clone()),
            FailurePolicy::FailOpen,
            Duration::from_millis(250),
        );

        for _ in 0..5 {
            assert!(limiter.check_rate_limit("A", &WINDOW).await.allowed);
        }

        let denied = limiter.check_rate_limit("A", &WINDOW).await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);

        // The speculative member stays behind: one extra over-count
        assert_eq!(store.inner.cardinality("rate_limit:A:10"), 6);

        // and ages out with the window
        clock.advance(Duration::from_millis(10_001));
        let decision = limiter.check_rate_limit("A", &WINDOW).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
        assert_eq!(store.inner.cardinality("rate_limit:A:10"), 1);
    }

    #[tokio::test]
    async fn test_window_expiry_readmits() {
        let (limiter, _store, clock) = limiter(FailurePolicy::FailOpen);

        for _ in 0..5 {
            limiter.check_rate_limit("A", &WINDOW).await;
        }
        assert!(!limiter.check_rate_limit("A", &WINDOW).await.allowed);

        clock.advance(Duration::from_secs(11));

        let decision = limiter.check_rate_limit("A", &WINDOW).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 4);
    }

    #[tokio::test]
    async fn test_window_slides_rather_than_resets() {
        let (limiter, _store, clock) = limiter(FailurePolicy::FailOpen);

        for _ in 0..3 {
            limiter.check_rate_limit("A", &WINDOW).await;
        }
        clock.advance(Duration::from_secs(6));
        for _ in 0..2 {
            assert!(limiter.check_rate_limit("A", &WINDOW).await.allowed);
        }
        assert!(!limiter.check_rate_limit("A", &WINDOW).await.allowed);

        // Only the first three age out
        clock.advance(Duration::from_secs(5));
        let decision = limiter.check_rate_limit("A", &WINDOW).await;
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 2);
    }

    #[tokio::test]
    async fn test_identifiers_are_isolated() {
        let (limiter, _store, _clock) = limiter(FailurePolicy::FailOpen);

        for _ in 0..5 {
            limiter.check_rate_limit("1.1.1.1:p:e", &WINDOW).await;
        }
        assert!(!limiter.check_rate_limit("1.1.1.1:p:e", &WINDOW).await.allowed);

        assert!(limiter.check_rate_limit("2.2.2.2:p:e", &WINDOW).await.allowed);
        assert!(limiter.check_rate_limit("1.1.1.1:p:other", &WINDOW).await.allowed);
    }

    #[tokio::test]
    async fn test_fail_open_after_prior_exhaustion() {
        let (limiter, store, _clock) = limiter(FailurePolicy::FailOpen);

        for _ in 0..6 {
            limiter.check_rate_limit("A", &WINDOW).await;
        }
        store.set_available(false);

        for _ in 0..3 {
            let decision = limiter.check_rate_limit("A", &WINDOW).await;
            assert!(decision.allowed);
            assert_eq!(decision.remaining, 4);
        }
    }

    #[tokio::test]
    async fn test_fail_closed_rejects() {
        let (limiter, store, _clock) = limiter(FailurePolicy::FailClosed);
        store.set_available(false);

        let decision = limiter.check_rate_limit("A", &WINDOW).await;
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[tokio::test]
    async fn test_timeout_applies_failure_policy() {
        let clock = ManualClock::new(0);
        let limiter = SlidingWindowLimiter::new(
            Arc::new(HangingStore),
            Arc::new(clock),
            FailurePolicy::FailOpen,
            Duration::from_millis(20),
        );

        let decision = limiter.check_rate_limit("A", &WINDOW).await;
        assert!(decision.allowed);

        let decisions = limiter.check_windows("A", &[WINDOW]).await;
        assert!(decisions[0].allowed);
    }

    #[tokio::test]
    async fn test_custom_key_prefix() {
        let (limiter, store, _clock) = limiter(FailurePolicy::FailOpen);
        let limiter = limiter.with_key_prefix("forms:rl");

        limiter.check_rate_limit("A", &WINDOW).await;
        assert_eq!(store.cardinality("forms:rl:A:10"), 1);
        assert_eq!(store.cardinality("rate_limit:A:10"), 0);
    }

    #[tokio::test]
    async fn test_coordinated_windows_roll_back_everything() {
        let (limiter, store, _clock) = limiter(FailurePolicy::FailOpen);
        let windows = [WindowConfig::new(2, 10), WindowConfig::new(100, 60)];

        for _ in 0..2 {
            let decisions = limiter.check_windows("B", &windows).await;
            assert!(decisions.iter().all(|d| d.allowed));
        }

        let denied = limiter.check_windows("B", &windows).await;
        assert!(!denied[0].allowed);
        assert!(denied[1].allowed);

        assert_eq!(store.cardinality("rate_limit:B:10"), 2);
        assert_eq!(store.cardinality("rate_limit:B:60"), 2);
    }
}
