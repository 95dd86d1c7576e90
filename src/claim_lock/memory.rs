//! In-memory claim lock for single-process operation.
//!
//! State is not persisted across restarts and is invisible to other
//! processes; share one instance between stores in the same process.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{lock_key, ClaimLock, LockResult};

#[derive(Debug)]
struct LockEntry {
    owner: String,
    expires_at: Instant,
}

/// Mutex-guarded map of claims.
#[derive(Clone, Default)]
pub struct InMemoryClaimLock {
    locks: Arc<RwLock<HashMap<String, LockEntry>>>,
}

impl InMemoryClaimLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClaimLock for InMemoryClaimLock {
    async fn try_acquire(
        &self,
        context_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> LockResult<bool> {
        let key = lock_key(context_id);
        let now = Instant::now();
        let mut locks = self.locks.write().await;

        if let Some(entry) = locks.get(&key) {
            if entry.expires_at > now {
                return Ok(false);
            }
        }

        locks.insert(
            key,
            LockEntry {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    async fn release(&self, context_id: &str, owner: &str) -> LockResult<()> {
        let key = lock_key(context_id);
        let mut locks = self.locks.write().await;
        if locks.get(&key).is_some_and(|e| e.owner == owner) {
            locks.remove(&key);
        }
        Ok(())
    }

    async fn is_held(&self, context_id: &str) -> LockResult<bool> {
        let locks = self.locks.read().await;
        Ok(locks
            .get(&lock_key(context_id))
            .is_some_and(|e| e.expires_at > Instant::now()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_exclusive_acquire() {
        let lock = InMemoryClaimLock::new();
        let ttl = Duration::from_secs(30);

        assert!(lock.try_acquire("c1", "a", ttl).await.unwrap());
        assert!(!lock.try_acquire("c1", "b", ttl).await.unwrap());
        assert!(lock.try_acquire("c2", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_release_checks_owner() {
        let lock = InMemoryClaimLock::new();
        let ttl = Duration::from_secs(30);

        lock.try_acquire("c1", "a", ttl).await.unwrap();
        lock.release("c1", "b").await.unwrap();
        assert!(lock.is_held("c1").await.unwrap());

        lock.release("c1", "a").await.unwrap();
        assert!(!lock.is_held("c1").await.unwrap());
        // Idempotent
        lock.release("c1", "a").await.unwrap();
        assert!(lock.try_acquire("c1", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_taken() {
        let lock = InMemoryClaimLock::new();

        lock.try_acquire("c1", "a", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert!(!lock.is_held("c1").await.unwrap());
        assert!(lock
            .try_acquire("c1", "b", Duration::from_secs(30))
            .await
            .unwrap());
    }
}
