//! Distributed sliding-window rate limiting
//!
//! Each window for an identifier is a sorted set in the store, keyed
//! `rate_limit:<identifier>:<windowSeconds>`, whose members are request
//! tokens scored by arrival time in epoch milliseconds. A check prunes
//! members older than the window, counts what is left, inserts the current
//! request and refreshes the key TTL in one atomic batch.
//!
//! - **Store**: Redis in production, an in-process store for tests and
//!   single-node development
//! - **Failure policy**: fail-open by default, fail-closed on request
//! - **Dual windows**: a burst and a sustained window evaluated concurrently
//!
//! # Example
//!
//! ```rust,no_run
//! use formgate::rate_limit::{
//!     DualWindowLimiter, FailurePolicy, RedisStore, SlidingWindowLimiter, SystemClock,
//!     WindowMode, DEFAULT_LONG_WINDOW, DEFAULT_SHORT_WINDOW,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let store = Arc::new(RedisStore::new("redis://localhost:6379").unwrap());
//!     let limiter = Arc::new(SlidingWindowLimiter::new(
//!         store,
//!         Arc::new(SystemClock),
//!         FailurePolicy::FailOpen,
//!         Duration::from_millis(250),
//!     ));
//!     let dual = DualWindowLimiter::new(
//!         limiter,
//!         DEFAULT_SHORT_WINDOW,
//!         DEFAULT_LONG_WINDOW,
//!         WindowMode::Independent,
//!     );
//!
//!     let outcome = dual.check("203.0.113.7:proj_1:contact").await;
//!     println!("allowed: {}", outcome.allowed());
//! }
//! ```

pub mod clock;
pub mod dual;
pub mod headers;
pub mod limiter;
pub mod lua_scripts;
pub mod memory;
pub mod redis;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, SystemClock};
pub use dual::{
    DualWindowLimiter, DualWindowOutcome, WindowKind, DEFAULT_LONG_WINDOW, DEFAULT_SHORT_WINDOW,
};
pub use headers::{apply_rate_limit_headers, rate_limit_exceeded_response};
pub use limiter::SlidingWindowLimiter;
pub use memory::MemoryStore;
pub use self::redis::RedisStore;
pub use store::{RateLimitStore, StoreError, StoreOp, WindowSlot};
pub use types::{FailurePolicy, RateLimitDecision, RateLimitKey, WindowConfig, WindowMode};
