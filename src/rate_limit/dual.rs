use super::limiter::SlidingWindowLimiter;
use super::types::{RateLimitDecision, WindowConfig, WindowMode};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Burst window: 5 requests per 10 seconds
pub const DEFAULT_SHORT_WINDOW: WindowConfig = WindowConfig::new(5, 10);
/// Sustained window: 100 requests per 60 seconds
pub const DEFAULT_LONG_WINDOW: WindowConfig = WindowConfig::new(100, 60);

/// Which of the two windows a decision belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Short,
    Long,
}

impl WindowKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowKind::Short => "short",
            WindowKind::Long => "long",
        }
    }
}

impl fmt::Display for WindowKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of evaluating both windows for one identifier
#[derive(Debug, Clone, Copy)]
pub struct DualWindowOutcome {
    pub short: RateLimitDecision,
    pub long: RateLimitDecision,
    /// Clock reading once both checks completed
    pub checked_at_ms: i64,
}

impl DualWindowOutcome {
    /// Admitted only if both windows admit
    pub fn allowed(&self) -> bool {
        self.short.allowed && self.long.allowed
    }

    /// The window reported to the client: short if it denied, else long
    pub fn limiting_window(&self) -> Option<WindowKind> {
        if !self.short.allowed {
            Some(WindowKind::Short)
        } else if !self.long.allowed {
            Some(WindowKind::Long)
        } else {
            None
        }
    }

    pub fn decision(&self, kind: WindowKind) -> &RateLimitDecision {
        match kind {
            WindowKind::Short => &self.short,
            WindowKind::Long => &self.long,
        }
    }

    /// `Retry-After` seconds for the limiting window
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.limiting_window()
            .map(|kind| self.decision(kind).retry_after_secs(self.checked_at_ms))
    }
}

/// Short (burst) plus long (sustained) window limiter
pub struct DualWindowLimiter {
    limiter: Arc<SlidingWindowLimiter>,
    short: WindowConfig,
    long: WindowConfig,
    mode: WindowMode,
}

impl DualWindowLimiter {
    pub fn new(
        limiter: Arc<SlidingWindowLimiter>,
        short: WindowConfig,
        long: WindowConfig,
        mode: WindowMode,
    ) -> Self {
        Self {
            limiter,
            short,
            long,
            mode,
        }
    }

    pub fn short_window(&self) -> &WindowConfig {
        &self.short
    }

    pub fn long_window(&self) -> &WindowConfig {
        &self.long
    }

    /// Evaluate both windows concurrently
    pub async fn check(&self, identifier: &str) -> DualWindowOutcome {
        let (short, long) = match self.mode {
            WindowMode::Independent => {
                tokio::join!(
                    self.limiter.check_rate_limit(identifier, &self.short),
                    self.limiter.check_rate_limit(identifier, &self.long),
                )
            }
            WindowMode::Coordinated => {
                let decisions = self
                    .limiter
                    .check_windows(identifier, &[self.short, self.long])
                    .await;
                (decisions[0], decisions[1])
            }
        };

        let outcome = DualWindowOutcome {
            short,
            long,
            checked_at_ms: self.limiter.clock().now_ms(),
        };

        debug!(
            identifier = %identifier,
            allowed = outcome.allowed(),
            short_remaining = short.remaining,
            long_remaining = long.remaining,
            "Dual window check"
        );

        outcome
    }
}
