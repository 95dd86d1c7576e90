//! Diesel record types mirroring `crate::schema`.

use diesel::prelude::*;

use crate::models::{Context, ContextError, ContextStatus};
use crate::schema::{claim_locks, contexts};

use super::util::{db_timestamp, parse_datetime, parse_datetime_opt};

/// Row of the `contexts` table.
#[derive(Debug, Clone, Queryable)]
#[diesel(table_name = contexts)]
pub struct ContextRecord {
    pub id: String,
    pub status: String,
    pub template_id: Option<String>,
    pub organization_id: Option<String>,
    pub service_type: Option<String>,
    pub priority: i32,
    pub attempts: i32,
    pub last_attempt: Option<String>,
    pub next_retry_at: Option<String>,
    pub batch_id: Option<String>,
    pub tags: String,
    pub metadata: String,
    pub results: Option<String>,
    pub errors: String,
    pub worker_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub processing_start: Option<String>,
    pub processing_end: Option<String>,
}

/// Insertable row for the `contexts` table.
#[derive(Debug, Insertable)]
#[diesel(table_name = contexts)]
pub struct NewContextRecord<'a> {
    pub id: &'a str,
    pub status: &'a str,
    pub template_id: Option<&'a str>,
    pub organization_id: Option<&'a str>,
    pub service_type: Option<&'a str>,
    pub priority: i32,
    pub attempts: i32,
    pub next_retry_at: Option<String>,
    pub batch_id: Option<&'a str>,
    pub tags: String,
    pub metadata: String,
    pub errors: String,
    pub created_at: String,
    pub updated_at: String,
}

impl<'a> NewContextRecord<'a> {
    pub fn from_context(ctx: &'a Context) -> Self {
        Self {
            id: &ctx.id,
            status: ctx.status.as_str(),
            template_id: ctx.template_id.as_deref(),
            organization_id: ctx.organization_id.as_deref(),
            service_type: ctx.service_type.as_deref(),
            priority: ctx.priority,
            attempts: ctx.attempts,
            next_retry_at: ctx.next_retry_at.map(db_timestamp),
            batch_id: ctx.batch_id.as_deref(),
            tags: serde_json::to_string(&ctx.tags).unwrap_or_else(|_| "[]".to_string()),
            metadata: serde_json::to_string(&ctx.metadata).unwrap_or_else(|_| "{}".to_string()),
            errors: serde_json::to_string(&ctx.errors).unwrap_or_else(|_| "[]".to_string()),
            created_at: db_timestamp(ctx.created_at),
            updated_at: db_timestamp(ctx.updated_at),
        }
    }
}

/// Row of the `claim_locks` table.
#[derive(Debug, Clone, Queryable, Insertable)]
#[diesel(table_name = claim_locks)]
pub struct ClaimLockRecord {
    pub lock_key: String,
    pub owner: String,
    pub expires_at: String,
}

fn deserialization_error(field: &str, e: impl std::fmt::Display) -> diesel::result::Error {
    diesel::result::Error::DeserializationError(format!("Invalid {}: {}", field, e).into())
}

/// Convert a database record to a domain model.
impl TryFrom<ContextRecord> for Context {
    type Error = diesel::result::Error;

    fn try_from(record: ContextRecord) -> Result<Self, Self::Error> {
        let status = ContextStatus::from_str(&record.status)
            .ok_or_else(|| deserialization_error("status", &record.status))?;
        let tags: Vec<String> =
            serde_json::from_str(&record.tags).map_err(|e| deserialization_error("tags", e))?;
        let metadata: serde_json::Value = serde_json::from_str(&record.metadata)
            .map_err(|e| deserialization_error("metadata", e))?;
        let results = record
            .results
            .as_deref()
            .map(serde_json::from_str::<serde_json::Value>)
            .transpose()
            .map_err(|e| deserialization_error("results", e))?;
        let errors: Vec<ContextError> = serde_json::from_str(&record.errors)
            .map_err(|e| deserialization_error("errors", e))?;

        Ok(Context {
            id: record.id,
            status,
            template_id: record.template_id,
            organization_id: record.organization_id,
            service_type: record.service_type,
            priority: record.priority,
            attempts: record.attempts,
            last_attempt: parse_datetime_opt(record.last_attempt),
            next_retry_at: parse_datetime_opt(record.next_retry_at),
            batch_id: record.batch_id,
            tags,
            metadata,
            results,
            errors,
            worker_id: record.worker_id,
            created_at: parse_datetime(&record.created_at),
            updated_at: parse_datetime(&record.updated_at),
            processing_start: parse_datetime_opt(record.processing_start),
            processing_end: parse_datetime_opt(record.processing_end),
            intermediate: Default::default(),
        })
    }
}
