use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// A single sorted-set command issued inside an atomic pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// Remove every member scored strictly below `max_exclusive`.
    /// Reply: number of removed members.
    ZRemRangeByScore { key: String, max_exclusive: i64 },
    /// Reply: cardinality of the set.
    ZCard { key: String },
    /// Reply: 1 if the member was new, 0 if its score was updated.
    ZAdd {
        key: String,
        score: i64,
        member: String,
    },
    /// Reply: 1 if the timeout was set, 0 if the key does not exist.
    Expire { key: String, seconds: u64 },
}

/// One window evaluated by [`RateLimitStore::check_windows_atomic`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSlot {
    pub key: String,
    pub window_secs: u64,
    pub max_requests: u32,
    pub member: String,
}

/// Rate-limit store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Unexpected store reply: {0}")]
    UnexpectedReply(String),
}

/// Atomic sorted-set store backing the sliding-window log
///
/// Implementations must execute a whole pipeline atomically with respect to
/// the keys it touches, and must be safe for concurrent use.
#[async_trait]
pub trait RateLimitStore: Send + Sync {
    /// Execute `ops` as one atomic batch, returning one integer reply per op
    async fn pipeline(&self, ops: Vec<StoreOp>) -> Result<Vec<i64>, StoreError>;

    /// Remove a single member
    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Prune and count every window, then insert into all of them only if
    /// every window has room. Returns the pre-insert count per window, in
    /// input order.
    async fn check_windows_atomic(
        &self,
        windows: &[WindowSlot],
        now_ms: i64,
    ) -> Result<Vec<u64>, StoreError>;

    /// Connectivity check
    async fn ping(&self) -> Result<(), StoreError>;
}
