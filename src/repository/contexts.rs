//! Diesel-based context repository.
//!
//! Row-level operations only; claim exclusivity is layered on top by
//! `store::DirectStore`.

use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};

use super::models::{ContextRecord, NewContextRecord};
use super::pool::{DbPool, DieselError};
use super::util::{db_now, db_timestamp};
use crate::models::{Context, ContextError, ContextStatus, RetryMeta};
use crate::schema::contexts;
use crate::store::ClaimFilter;
use crate::with_conn;

/// Build a boxed query selecting eligible pending contexts.
macro_rules! eligible {
    ($filter:expr, $now:expr) => {{
        let filter: &ClaimFilter = $filter;
        let mut query = contexts::table
            .filter(contexts::status.eq(ContextStatus::Pending.as_str()))
            .filter(contexts::attempts.lt(filter.max_attempts))
            .filter(
                contexts::next_retry_at
                    .is_null()
                    .or(contexts::next_retry_at.le($now)),
            )
            .into_boxed();

        if let Some(cutoff) = filter.last_attempt_before {
            let cutoff = db_timestamp(cutoff);
            query = query.filter(
                contexts::last_attempt
                    .is_null()
                    .or(contexts::last_attempt.le(cutoff)),
            );
        }
        if let Some(ref template_id) = filter.template_id {
            query = query.filter(contexts::template_id.eq(template_id.clone()));
        }
        if let Some(ref service_type) = filter.service_type {
            query = query.filter(contexts::service_type.eq(service_type.clone()));
        }
        if let Some(ref organization_id) = filter.organization_id {
            query = query.filter(contexts::organization_id.eq(organization_id.clone()));
        }
        query
    }};
}

/// How a processed context is written back.
#[derive(Debug)]
pub struct Outcome<'a> {
    pub status: ContextStatus,
    pub errors: &'a [ContextError],
    /// `Some` writes the results column; `None` leaves it untouched.
    pub results: Option<Option<&'a serde_json::Value>>,
    pub retry: Option<RetryMeta>,
}

/// Diesel-based context repository.
#[derive(Clone)]
pub struct DieselContextRepository {
    pool: DbPool,
}

impl DieselContextRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Insert a new context.
    pub async fn insert(&self, ctx: &Context) -> Result<(), DieselError> {
        let record = NewContextRecord::from_context(ctx);
        with_conn!(self.pool, conn => {
            diesel::insert_into(contexts::table)
                .values(&record)
                .execute(&mut conn)
                .await?;
            Ok(())
        })
    }

    /// Get a context by ID.
    pub async fn get(&self, id: &str) -> Result<Option<Context>, DieselError> {
        let record = with_conn!(self.pool, conn => {
            contexts::table
                .find(id)
                .first::<ContextRecord>(&mut conn)
                .await
                .optional()?
        });
        record.map(Context::try_from).transpose()
    }

    /// Eligible contexts in poll order: priority descending, oldest first.
    pub async fn find_candidates(
        &self,
        filter: &ClaimFilter,
        limit: i64,
    ) -> Result<Vec<Context>, DieselError> {
        let now = db_now();
        let records = with_conn!(self.pool, conn => {
            eligible!(filter, &now)
                .order((contexts::priority.desc(), contexts::created_at.asc()))
                .limit(limit)
                .load::<ContextRecord>(&mut conn)
                .await?
        });
        records.into_iter().map(Context::try_from).collect()
    }

    /// Count eligible contexts.
    pub async fn count_eligible(&self, filter: &ClaimFilter) -> Result<i64, DieselError> {
        let now = db_now();
        with_conn!(self.pool, conn => {
            eligible!(filter, &now)
                .count()
                .get_result::<i64>(&mut conn)
                .await
        })
    }

    /// Move a pending context to processing for `worker_id`.
    ///
    /// Conditional on the row still being pending and under the attempt
    /// limit; returns `false` if another claimant already moved it.
    pub async fn mark_claimed(
        &self,
        id: &str,
        worker_id: &str,
        max_attempts: i32,
    ) -> Result<bool, DieselError> {
        let now = db_now();
        let rows = with_conn!(self.pool, conn => {
            diesel::update(
                contexts::table
                    .filter(contexts::id.eq(id))
                    .filter(contexts::status.eq(ContextStatus::Pending.as_str()))
                    .filter(contexts::attempts.lt(max_attempts)),
            )
            .set((
                contexts::status.eq(ContextStatus::Processing.as_str()),
                contexts::attempts.eq(contexts::attempts + 1),
                contexts::last_attempt.eq(Some(&now)),
                contexts::processing_start.eq(Some(&now)),
                contexts::processing_end.eq(None::<String>),
                contexts::worker_id.eq(Some(worker_id)),
                contexts::updated_at.eq(&now),
            ))
            .execute(&mut conn)
            .await?
        });
        Ok(rows == 1)
    }

    /// Persist an outcome, appending `errors` to the stored list.
    ///
    /// The read of the stored errors and the write run in one transaction so
    /// concurrent outcomes cannot drop each other's errors. Returns `false`
    /// if the context does not exist.
    pub async fn record_outcome(&self, id: &str, outcome: Outcome<'_>) -> Result<bool, DieselError> {
        let now = db_now();
        let results = outcome.results.map(|r| {
            r.map(|v| serde_json::to_string(v).unwrap_or_else(|_| "null".to_string()))
        });
        let status = outcome.status.as_str();
        let new_errors = outcome.errors;
        let retry = outcome.retry;

        with_conn!(self.pool, conn => {
            let now = &now;
            conn.transaction(|conn| {
                Box::pin(async move {
                    let current: Option<(String, i32)> = contexts::table
                        .find(id)
                        .select((contexts::errors, contexts::attempts))
                        .first(conn)
                        .await
                        .optional()?;

                    let Some((stored_errors, stored_attempts)) = current else {
                        return Ok(false);
                    };

                    let mut errors: Vec<ContextError> =
                        serde_json::from_str(&stored_errors).unwrap_or_default();
                    errors.extend_from_slice(new_errors);
                    let errors_json =
                        serde_json::to_string(&errors).unwrap_or_else(|_| "[]".to_string());

                    let target = contexts::table.filter(contexts::id.eq(id));
                    let rows = match (retry, results) {
                        (Some(retry), _) => {
                            diesel::update(target)
                                .set((
                                    contexts::status.eq(status),
                                    contexts::errors.eq(&errors_json),
                                    contexts::attempts.eq(retry.attempts.max(stored_attempts)),
                                    contexts::next_retry_at
                                        .eq(Some(db_timestamp(retry.next_retry_at))),
                                    contexts::processing_end.eq(Some(now)),
                                    contexts::updated_at.eq(now),
                                ))
                                .execute(conn)
                                .await?
                        }
                        (None, Some(results)) => {
                            diesel::update(target)
                                .set((
                                    contexts::status.eq(status),
                                    contexts::errors.eq(&errors_json),
                                    contexts::results.eq(results),
                                    contexts::processing_end.eq(Some(now)),
                                    contexts::updated_at.eq(now),
                                ))
                                .execute(conn)
                                .await?
                        }
                        (None, None) => {
                            diesel::update(target)
                                .set((
                                    contexts::status.eq(status),
                                    contexts::errors.eq(&errors_json),
                                    contexts::processing_end.eq(Some(now)),
                                    contexts::updated_at.eq(now),
                                ))
                                .execute(conn)
                                .await?
                        }
                    };
                    Ok(rows > 0)
                })
            })
            .await
        })
    }

    /// Hand a claimed context back to pending without counting the attempt.
    ///
    /// Conditional on the row still being in processing for `worker_id`.
    /// `last_attempt` is cleared so the retry delay does not hold the item
    /// back; any `next_retry_at` from an earlier failure still applies.
    pub async fn release_claimed(&self, id: &str, worker_id: &str) -> Result<bool, DieselError> {
        let now = db_now();
        let rows = with_conn!(self.pool, conn => {
            diesel::update(
                contexts::table
                    .filter(contexts::id.eq(id))
                    .filter(contexts::status.eq(ContextStatus::Processing.as_str()))
                    .filter(contexts::worker_id.eq(worker_id)),
            )
            .set((
                contexts::status.eq(ContextStatus::Pending.as_str()),
                contexts::attempts.eq(contexts::attempts - 1),
                contexts::last_attempt.eq(None::<String>),
                contexts::processing_start.eq(None::<String>),
                contexts::worker_id.eq(None::<String>),
                contexts::updated_at.eq(&now),
            ))
            .execute(&mut conn)
            .await?
        });
        Ok(rows == 1)
    }

    /// IDs of contexts stuck in processing since before `cutoff`.
    pub async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<String>, DieselError> {
        let cutoff = db_timestamp(cutoff);
        with_conn!(self.pool, conn => {
            contexts::table
                .filter(contexts::status.eq(ContextStatus::Processing.as_str()))
                .filter(contexts::processing_start.le(&cutoff))
                .select(contexts::id)
                .load::<String>(&mut conn)
                .await
        })
    }

    /// Return a stalled context to pending.
    ///
    /// Conditional on it still being in processing since before `cutoff`.
    pub async fn reset_stalled(&self, id: &str, cutoff: DateTime<Utc>) -> Result<bool, DieselError> {
        let cutoff = db_timestamp(cutoff);
        let now = db_now();
        let rows = with_conn!(self.pool, conn => {
            diesel::update(
                contexts::table
                    .filter(contexts::id.eq(id))
                    .filter(contexts::status.eq(ContextStatus::Processing.as_str()))
                    .filter(contexts::processing_start.le(&cutoff)),
            )
            .set((
                contexts::status.eq(ContextStatus::Pending.as_str()),
                contexts::processing_end.eq(Some(&now)),
                contexts::updated_at.eq(&now),
            ))
            .execute(&mut conn)
            .await?
        });
        Ok(rows == 1)
    }
}
