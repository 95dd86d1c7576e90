//! Database-backed claim lock for processes sharing one store.
//!
//! Set-if-absent is `INSERT ... ON CONFLICT DO NOTHING` on the keyed
//! `claim_locks` table; expired rows are cleared first so a crashed owner's
//! claim can be taken over.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use tracing::debug;

use super::{lock_key, ClaimLock, LockResult};
use crate::repository::models::ClaimLockRecord;
use crate::repository::pool::DbPool;
use crate::repository::util::{db_now, db_timestamp};
use crate::schema::claim_locks;
use crate::with_conn;

/// Claim lock stored in the `claim_locks` table.
#[derive(Clone)]
pub struct DieselClaimLock {
    pool: DbPool,
}

impl DieselClaimLock {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Create from a SQLite file path.
    pub fn from_sqlite_path(path: &std::path::Path) -> Self {
        Self::new(DbPool::sqlite_from_path(path))
    }
}

#[async_trait]
impl ClaimLock for DieselClaimLock {
    async fn try_acquire(
        &self,
        context_id: &str,
        owner: &str,
        ttl: Duration,
    ) -> LockResult<bool> {
        let key = lock_key(context_id);
        let now = db_now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::zero());
        let record = ClaimLockRecord {
            lock_key: key.clone(),
            owner: owner.to_string(),
            expires_at: db_timestamp(Utc::now() + ttl),
        };

        let inserted = with_conn!(self.pool, conn => {
            diesel::delete(
                claim_locks::table
                    .filter(claim_locks::lock_key.eq(&key))
                    .filter(claim_locks::expires_at.le(&now)),
            )
            .execute(&mut conn)
            .await?;

            diesel::insert_into(claim_locks::table)
                .values(&record)
                .on_conflict_do_nothing()
                .execute(&mut conn)
                .await?
        });

        debug!("Claim {} by {}: {}", key, owner, inserted == 1);
        Ok(inserted == 1)
    }

    async fn release(&self, context_id: &str, owner: &str) -> LockResult<()> {
        let key = lock_key(context_id);
        with_conn!(self.pool, conn => {
            diesel::delete(
                claim_locks::table
                    .filter(claim_locks::lock_key.eq(&key))
                    .filter(claim_locks::owner.eq(owner)),
            )
            .execute(&mut conn)
            .await?
        });
        Ok(())
    }

    async fn is_held(&self, context_id: &str) -> LockResult<bool> {
        use diesel::dsl::count_star;

        let key = lock_key(context_id);
        let now = db_now();
        let count: i64 = with_conn!(self.pool, conn => {
            claim_locks::table
                .filter(claim_locks::lock_key.eq(&key))
                .filter(claim_locks::expires_at.gt(&now))
                .select(count_star())
                .first(&mut conn)
                .await?
        });
        Ok(count > 0)
    }
}
