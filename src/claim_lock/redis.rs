//! Redis-backed claim lock for distributed workers.
//!
//! Acquire is `SET key owner NX PX ttl`; release runs a compare-and-delete
//! script so a worker never drops a claim it no longer owns.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use super::{lock_key, ClaimLock, LockError, LockResult};

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

/// Redis claim lock.
pub struct RedisClaimLock {
    conn: ConnectionManager,
}

impl RedisClaimLock {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn new(redis_url: &str) -> LockResult<Self> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| LockError::Unavailable(format!("Redis connection error: {}", e)))?;

        let conn = ConnectionManager::new(client).await.map_err(|e| {
            LockError::Unavailable(format!("Redis connection manager error: {}", e))
        })?;

        Ok(Self { conn })
    }
}

#[async_trait]
impl ClaimLock for RedisClaimLock {
    async fn try_acquire(
        &self,
        context_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> LockResult<bool> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        let result: Option<String> = redis::cmd("SET")
            .arg(lock_key(context_id))
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Database(e.to_string()))?;

        Ok(result.is_some())
    }

    async fn release(&self, context_id: &str, owner: &str) -> LockResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = Script::new(RELEASE_SCRIPT)
            .key(lock_key(context_id))
            .arg(owner)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Database(e.to_string()))?;
        Ok(())
    }

    async fn is_held(&self, context_id: &str) -> LockResult<bool> {
        let mut conn = self.conn.clone();
        conn.exists(lock_key(context_id))
            .await
            .map_err(|e| LockError::Database(e.to_string()))
    }
}
