use super::lua_scripts::MULTI_WINDOW_LOG_SCRIPT;
use super::store::{RateLimitStore, StoreError, StoreOp, WindowSlot};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Redis-backed distributed rate-limit store
///
/// The connection is established on first use and reused afterwards; a
/// failed attempt is retried on the next call, so the store may be built
/// while Redis is still down.
pub struct RedisStore {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    multi_window: Script,
}

impl RedisStore {
    /// Create a new Redis store without connecting
    pub fn new(redis_url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;

        Ok(Self {
            client,
            connection: OnceCell::new(),
            multi_window: Script::new(MULTI_WINDOW_LOG_SCRIPT),
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to Redis rate-limit store");
                Ok::<_, StoreError>(manager)
            })
            .await?;

        // ConnectionManager is a cheap handle over one multiplexed connection
        Ok(connection.clone())
    }
}

#[async_trait]
impl RateLimitStore for RedisStore {
    async fn pipeline(&self, ops: Vec<StoreOp>) -> Result<Vec<i64>, StoreError> {
        let mut pipe = redis::pipe();
        pipe.atomic();

        for op in &ops {
            match op {
                StoreOp::ZRemRangeByScore { key, max_exclusive } => {
                    pipe.zrembyscore(key, "-inf", format!("({}", max_exclusive));
                }
                StoreOp::ZCard { key } => {
                    pipe.zcard(key);
                }
                StoreOp::ZAdd { key, score, member } => {
                    pipe.zadd(key, member, *score);
                }
                StoreOp::Expire { key, seconds } => {
                    pipe.expire(key, *seconds as i64);
                }
            }
        }

        let mut connection = self.connection().await?;
        let replies: Vec<i64> = pipe.query_async(&mut connection).await?;

        if replies.len() != ops.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "expected {} replies, got {}",
                ops.len(),
                replies.len()
            )));
        }

        debug!(ops = ops.len(), "Executed Redis pipeline");
        Ok(replies)
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut connection = self.connection().await?;
        let _: i64 = connection.zrem(key, member).await?;
        Ok(())
    }

    async fn check_windows_atomic(
        &self,
        windows: &[WindowSlot],
        now_ms: i64,
    ) -> Result<Vec<u64>, StoreError> {
        let mut invocation = self.multi_window.prepare_invoke();
        for slot in windows {
            invocation.key(&slot.key);
        }
        invocation.arg(now_ms);
        for slot in windows {
            invocation
                .arg(slot.window_secs)
                .arg(slot.max_requests)
                .arg(&slot.member);
        }

        let mut connection = self.connection().await?;
        let counts: Vec<u64> = invocation.invoke_async(&mut connection).await?;

        if counts.len() != windows.len() {
            return Err(StoreError::UnexpectedReply(format!(
                "expected {} counts, got {}",
                windows.len(),
                counts.len()
            )));
        }

        Ok(counts)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut connection = self.connection().await?;
        redis::cmd("PING")
            .query_async::<_, ()>(&mut connection)
            .await?;
        Ok(())
    }
}
