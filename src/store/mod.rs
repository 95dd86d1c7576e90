//! Work item store abstraction for the claim/process/persist lifecycle.
//!
//! Two backends implement [`WorkItemStore`]:
//! - [`DirectStore`]: SQL database plus a [`ClaimLock`](crate::claim_lock::ClaimLock)
//!   service that makes claims exclusive across processes.
//! - [`RemoteTaskStore`]: proxies every call to an external task service
//!   whose server claims atomically, so no local lock is needed.

mod direct;
mod error;
mod remote;
pub mod translate;

pub use direct::DirectStore;
pub use error::StoreError;
pub use remote::{RemoteStoreConfig, RemoteTaskStore};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::claim_lock::{ClaimLock, DieselClaimLock, InMemoryClaimLock};
use crate::config::{StoreBackend, StoreConfig, WorkerSettings};
use crate::models::{Context, ContextError, ContextStatus, NewContext, RetryMeta};
use crate::repository::DbPool;

/// Filter parameters for discovering eligible work.
#[derive(Debug, Clone)]
pub struct ClaimFilter {
    /// Items with `attempts >= max_attempts` are never proposed.
    pub max_attempts: i32,
    /// Restrict to one template (used for affinity batching).
    pub template_id: Option<String>,
    /// Restrict to one producer-declared service type.
    pub service_type: Option<String>,
    /// Restrict to one organization.
    pub organization_id: Option<String>,
    /// Items whose last attempt is newer than this are not proposed.
    pub last_attempt_before: Option<DateTime<Utc>>,
}

impl ClaimFilter {
    pub fn new(max_attempts: i32) -> Self {
        Self {
            max_attempts,
            template_id: None,
            service_type: None,
            organization_id: None,
            last_attempt_before: None,
        }
    }

    pub fn with_template(mut self, template_id: &str) -> Self {
        self.template_id = Some(template_id.to_string());
        self
    }

    /// Apply the retry-delay cutoff relative to now.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(retry_delay).unwrap_or(chrono::Duration::zero());
        self.last_attempt_before = Some(Utc::now() - delay);
        self
    }

    /// Whether a context satisfies this filter at `now`.
    ///
    /// Mirrors the SQL eligibility predicate; used by backends that filter
    /// client-side.
    pub fn matches(&self, ctx: &Context, now: DateTime<Utc>) -> bool {
        ctx.status == ContextStatus::Pending
            && ctx.attempts < self.max_attempts
            && ctx.next_retry_at.is_none_or(|t| t <= now)
            && match (self.last_attempt_before, ctx.last_attempt) {
                (Some(cutoff), Some(last)) => last <= cutoff,
                _ => true,
            }
            && self
                .template_id
                .as_ref()
                .is_none_or(|t| ctx.template_id.as_ref() == Some(t))
            && self
                .service_type
                .as_ref()
                .is_none_or(|s| ctx.service_type.as_ref() == Some(s))
            && self
                .organization_id
                .as_ref()
                .is_none_or(|o| ctx.organization_id.as_ref() == Some(o))
    }
}

/// Order contexts by priority (descending) then age (oldest first).
pub fn sort_by_poll_order(contexts: &mut [Context]) {
    contexts.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

/// Durable store for contexts with exclusive claiming.
///
/// Lock contention is never an error: claim methods return `None` or a
/// shorter list and the caller moves on.
#[async_trait]
pub trait WorkItemStore: Send + Sync {
    /// Insert a new pending context and return its id.
    async fn create_context(&self, data: NewContext) -> Result<String, StoreError>;

    /// Fetch a context by id.
    async fn get_context(&self, id: &str) -> Result<Option<Context>, StoreError>;

    /// Claim the highest-priority eligible context.
    async fn claim_next_pending(&self, filter: &ClaimFilter)
        -> Result<Option<Context>, StoreError>;

    /// Claim up to `limit` eligible contexts sharing one template.
    ///
    /// The template is the filter's, or else that of the first eligible item.
    async fn claim_batch(
        &self,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<Context>, StoreError>;

    /// Set a new status, append errors, and release the claim.
    ///
    /// With `retry`, the item is reset to pending with the given attempts
    /// and eligibility time.
    async fn update_status(
        &self,
        id: &str,
        status: ContextStatus,
        errors: &[ContextError],
        retry: Option<RetryMeta>,
    ) -> Result<bool, StoreError>;

    /// Persist the pipeline output and final status, and release the claim.
    async fn update_result(
        &self,
        id: &str,
        status: ContextStatus,
        result: Option<&serde_json::Value>,
        errors: &[ContextError],
    ) -> Result<bool, StoreError>;

    /// Reset a context to pending, eligible again at `next_retry_at`.
    async fn schedule_retry(
        &self,
        id: &str,
        attempts: i32,
        next_retry_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.update_status(
            id,
            ContextStatus::Pending,
            &[],
            Some(RetryMeta {
                attempts,
                next_retry_at,
            }),
        )
        .await
    }

    /// Give back a claim this worker did not process.
    ///
    /// Where the store can, the item returns to pending without the claim
    /// counting as an attempt.
    async fn release_claim(&self, id: &str) -> Result<(), StoreError>;

    /// Return abandoned `processing` items to pending. Returns how many moved.
    async fn recover_stalled(&self, older_than: Duration) -> Result<u64, StoreError>;

    /// Count items currently eligible for claiming.
    async fn count_pending(&self, filter: &ClaimFilter) -> Result<u64, StoreError>;
}

/// Build the configured store backend.
pub async fn open_store(
    config: &StoreConfig,
    worker: &WorkerSettings,
) -> Result<Arc<dyn WorkItemStore>, StoreError> {
    match config.backend {
        StoreBackend::Database => {
            let database_url = config.database_url();
            let pool = crate::repository::migrations::run_migrations_for_url(&database_url).await?;
            let lock = open_claim_lock(config.lock_backend.as_deref(), &pool).await?;
            Ok(Arc::new(DirectStore::new(
                pool,
                lock,
                &worker.worker_id,
                worker.lock_expiry(),
            )))
        }
        StoreBackend::Remote => {
            let remote = RemoteStoreConfig::from_store_config(config, &worker.worker_id)?;
            Ok(Arc::new(RemoteTaskStore::new(remote)?))
        }
    }
}

/// Select the claim lock backend.
///
/// `None`/"memory" = in-process, "database" = lock table in the store's
/// database, "redis://..." = Redis.
async fn open_claim_lock(
    backend: Option<&str>,
    pool: &DbPool,
) -> Result<Arc<dyn ClaimLock>, StoreError> {
    match backend {
        None | Some("memory") => Ok(Arc::new(InMemoryClaimLock::new())),
        Some("database") | Some("sqlite") => Ok(Arc::new(DieselClaimLock::new(pool.clone()))),
        Some(url) if url.starts_with("redis://") || url.starts_with("rediss://") => {
            #[cfg(feature = "redis-backend")]
            {
                let lock = crate::claim_lock::RedisClaimLock::new(url).await?;
                Ok(Arc::new(lock))
            }
            #[cfg(not(feature = "redis-backend"))]
            {
                Err(StoreError::Config(
                    "Redis lock backend not compiled. Use --features redis-backend".into(),
                ))
            }
        }
        Some(other) => Err(StoreError::Config(format!(
            "Unknown lock backend: {}",
            other
        ))),
    }
}
