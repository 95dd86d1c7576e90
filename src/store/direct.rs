//! SQL-backed work item store.
//!
//! Claims take a [`ClaimLock`] first and then move the row with a
//! conditional update, so a racing claimant that already moved the row is
//! detected and skipped.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{ClaimFilter, StoreError, WorkItemStore};
use crate::claim_lock::ClaimLock;
use crate::models::{Context, ContextError, ContextStatus, NewContext, RetryMeta};
use crate::repository::{DbPool, DieselContextRepository, Outcome};

/// Candidates read per claim attempt, relative to the number wanted.
const CANDIDATE_FACTOR: usize = 4;
/// Minimum candidates read per claim attempt.
const MIN_CANDIDATES: usize = 16;

/// Database store plus claim lock.
#[derive(Clone)]
pub struct DirectStore {
    repo: DieselContextRepository,
    lock: Arc<dyn ClaimLock>,
    worker_id: String,
    lock_ttl: Duration,
}

impl DirectStore {
    pub fn new(
        pool: DbPool,
        lock: Arc<dyn ClaimLock>,
        worker_id: &str,
        lock_ttl: Duration,
    ) -> Self {
        Self {
            repo: DieselContextRepository::new(pool),
            lock,
            worker_id: worker_id.to_string(),
            lock_ttl,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    fn candidate_limit(wanted: usize) -> i64 {
        (wanted * CANDIDATE_FACTOR).max(MIN_CANDIDATES) as i64
    }

    /// Try to claim one candidate. `None` means another worker got it.
    async fn try_claim(
        &self,
        candidate: &Context,
        max_attempts: i32,
    ) -> Result<Option<Context>, StoreError> {
        if !self
            .lock
            .try_acquire(&candidate.id, &self.worker_id, self.lock_ttl)
            .await?
        {
            debug!("Context {} is claimed elsewhere, skipping", candidate.id);
            return Ok(None);
        }

        let moved = match self
            .repo
            .mark_claimed(&candidate.id, &self.worker_id, max_attempts)
            .await
        {
            Ok(moved) => moved,
            Err(e) => {
                self.lock.release(&candidate.id, &self.worker_id).await?;
                return Err(e.into());
            }
        };

        if !moved {
            debug!("Context {} changed before claim, releasing", candidate.id);
            self.lock.release(&candidate.id, &self.worker_id).await?;
            return Ok(None);
        }

        Ok(self.repo.get(&candidate.id).await?)
    }

    async fn release_lock(&self, id: &str) {
        if let Err(e) = self.lock.release(id, &self.worker_id).await {
            warn!("Failed to release claim on {}: {}", id, e);
        }
    }
}

#[async_trait]
impl WorkItemStore for DirectStore {
    async fn create_context(&self, data: NewContext) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        let ctx = Context::from_new(id.clone(), data);
        self.repo.insert(&ctx).await?;
        debug!("Created context {}", id);
        Ok(id)
    }

    async fn get_context(&self, id: &str) -> Result<Option<Context>, StoreError> {
        Ok(self.repo.get(id).await?)
    }

    async fn claim_next_pending(
        &self,
        filter: &ClaimFilter,
    ) -> Result<Option<Context>, StoreError> {
        let candidates = self
            .repo
            .find_candidates(filter, Self::candidate_limit(1))
            .await?;

        for candidate in &candidates {
            if let Some(ctx) = self.try_claim(candidate, filter.max_attempts).await? {
                debug!("Claimed context {} (priority {})", ctx.id, ctx.priority);
                return Ok(Some(ctx));
            }
        }
        Ok(None)
    }

    async fn claim_batch(
        &self,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<Context>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let mut candidates = self
            .repo
            .find_candidates(filter, Self::candidate_limit(limit))
            .await?;

        if filter.template_id.is_none() {
            let Some(first) = candidates.first() else {
                return Ok(Vec::new());
            };
            match first.template_id.clone() {
                Some(template_id) => {
                    let affinity = filter.clone().with_template(&template_id);
                    candidates = self
                        .repo
                        .find_candidates(&affinity, Self::candidate_limit(limit))
                        .await?;
                }
                // Without a template there is nothing to group by
                None => candidates.truncate(1),
            }
        }

        let mut claimed = Vec::with_capacity(limit);
        for candidate in &candidates {
            if claimed.len() >= limit {
                break;
            }
            if let Some(ctx) = self.try_claim(candidate, filter.max_attempts).await? {
                claimed.push(ctx);
            }
        }

        debug!("Claimed {} of {} candidates", claimed.len(), candidates.len());
        Ok(claimed)
    }

    async fn update_status(
        &self,
        id: &str,
        status: ContextStatus,
        errors: &[ContextError],
        retry: Option<RetryMeta>,
    ) -> Result<bool, StoreError> {
        let updated = self
            .repo
            .record_outcome(
                id,
                Outcome {
                    status,
                    errors,
                    results: None,
                    retry,
                },
            )
            .await;
        // The claim goes even when the write fails; stall recovery owns the row
        self.release_lock(id).await;
        Ok(updated?)
    }

    async fn update_result(
        &self,
        id: &str,
        status: ContextStatus,
        result: Option<&serde_json::Value>,
        errors: &[ContextError],
    ) -> Result<bool, StoreError> {
        let updated = self
            .repo
            .record_outcome(
                id,
                Outcome {
                    status,
                    errors,
                    results: Some(result),
                    retry: None,
                },
            )
            .await;
        // The claim goes even when the write fails; stall recovery owns the row
        self.release_lock(id).await;
        Ok(updated?)
    }

    async fn release_claim(&self, id: &str) -> Result<(), StoreError> {
        let released = self.repo.release_claimed(id, &self.worker_id).await;
        self.lock.release(id, &self.worker_id).await?;
        if released? {
            debug!("Returned context {} to pending", id);
        }
        Ok(())
    }

    async fn recover_stalled(&self, older_than: Duration) -> Result<u64, StoreError> {
        let older_than = chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let cutoff = Utc::now() - older_than;
        let stalled = self.repo.find_stalled(cutoff).await?;

        let mut recovered = 0;
        for id in &stalled {
            // Holding the claim ourselves proves nobody else does
            if !self
                .lock
                .try_acquire(id, &self.worker_id, self.lock_ttl)
                .await?
            {
                continue;
            }
            let reset = self.repo.reset_stalled(id, cutoff).await;
            self.release_lock(id).await;
            if reset? {
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!("Recovered {} stalled context(s)", recovered);
        }
        Ok(recovered)
    }

    async fn count_pending(&self, filter: &ClaimFilter) -> Result<u64, StoreError> {
        Ok(self.repo.count_eligible(filter).await?.max(0) as u64)
    }
}
