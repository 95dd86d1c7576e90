//! Claim locks: exclusive, TTL-bounded ownership of a context by one worker.
//!
//! Pluggable backends:
//! - In-memory (single process)
//! - Database table (processes sharing one SQLite/PostgreSQL store)
//! - Redis (distributed)

mod database;
mod memory;

#[cfg(feature = "redis-backend")]
mod redis;

pub use database::DieselClaimLock;
pub use memory::InMemoryClaimLock;

#[cfg(feature = "redis-backend")]
pub use self::redis::RedisClaimLock;

use std::time::Duration;

use async_trait::async_trait;

/// Result type for claim lock operations.
pub type LockResult<T> = Result<T, LockError>;

/// Errors from claim lock backends. Contention is not an error.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<diesel::result::Error> for LockError {
    fn from(e: diesel::result::Error) -> Self {
        LockError::Database(e.to_string())
    }
}

/// Key prefix shared by all backends.
pub const KEY_PREFIX: &str = "ctxflow:claim:";

/// Lock key for a context id.
pub fn lock_key(context_id: &str) -> String {
    format!("{}{}", KEY_PREFIX, context_id)
}

/// Atomic set-if-absent with TTL, plus owner-checked release.
#[async_trait]
pub trait ClaimLock: Send + Sync {
    /// Try to take the claim for `context_id`.
    ///
    /// Returns `true` if `owner` now holds it. An expired claim held by
    /// someone else may be taken over.
    async fn try_acquire(&self, context_id: &str, owner: &str, ttl: Duration)
        -> LockResult<bool>;

    /// Drop the claim if `owner` holds it. Idempotent.
    async fn release(&self, context_id: &str, owner: &str) -> LockResult<()>;

    /// Whether anyone currently holds an unexpired claim.
    async fn is_held(&self, context_id: &str) -> LockResult<bool>;
}
