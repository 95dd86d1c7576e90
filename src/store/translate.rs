//! Translation between [`Context`] and the remote task service's wire shape.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Context, ContextError, ContextStatus};

/// Task status as named by the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl From<ContextStatus> for TaskStatus {
    fn from(status: ContextStatus) -> Self {
        match status {
            ContextStatus::Pending => TaskStatus::Queued,
            ContextStatus::Processing => TaskStatus::Running,
            ContextStatus::Completed => TaskStatus::Succeeded,
            ContextStatus::Failed => TaskStatus::Failed,
            ContextStatus::Canceled => TaskStatus::Cancelled,
        }
    }
}

impl From<TaskStatus> for ContextStatus {
    fn from(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Queued => ContextStatus::Pending,
            TaskStatus::Running => ContextStatus::Processing,
            TaskStatus::Succeeded => ContextStatus::Completed,
            TaskStatus::Failed => ContextStatus::Failed,
            TaskStatus::Cancelled => ContextStatus::Canceled,
        }
    }
}

/// Producer input carried by a task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// One entry of a task's error log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskErrorEntry {
    pub step: String,
    pub message: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub retryable: bool,
}

impl From<&ContextError> for TaskErrorEntry {
    fn from(e: &ContextError) -> Self {
        Self {
            step: e.stage.clone(),
            message: e.message.clone(),
            at: e.timestamp,
            retryable: e.retry_recommended,
        }
    }
}

impl From<TaskErrorEntry> for ContextError {
    fn from(e: TaskErrorEntry) -> Self {
        Self {
            stage: e.step,
            message: e.message,
            timestamp: e.at,
            retry_recommended: e.retryable,
        }
    }
}

/// A task as exchanged with the remote service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteTask {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub processor_type: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub retry_count: i32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub payload: TaskPayload,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error_log: Vec<TaskErrorEntry>,
    #[serde(default)]
    pub claimed_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<&Context> for RemoteTask {
    fn from(ctx: &Context) -> Self {
        Self {
            task_id: ctx.id.clone(),
            status: ctx.status.into(),
            processor_type: ctx.service_type.clone(),
            priority: ctx.priority,
            retry_count: ctx.attempts,
            last_attempt_at: ctx.last_attempt,
            scheduled_for: ctx.next_retry_at,
            group_id: ctx.batch_id.clone(),
            tenant_id: ctx.organization_id.clone(),
            labels: ctx.tags.clone(),
            payload: TaskPayload {
                template_id: ctx.template_id.clone(),
                data: ctx.metadata.clone(),
            },
            result: ctx.results.clone(),
            error_log: ctx.errors.iter().map(TaskErrorEntry::from).collect(),
            claimed_by: ctx.worker_id.clone(),
            created_at: ctx.created_at,
            updated_at: ctx.updated_at,
            started_at: ctx.processing_start,
            finished_at: ctx.processing_end,
        }
    }
}

impl From<RemoteTask> for Context {
    fn from(task: RemoteTask) -> Self {
        Self {
            id: task.task_id,
            status: task.status.into(),
            template_id: task.payload.template_id,
            organization_id: task.tenant_id,
            service_type: task.processor_type,
            priority: task.priority,
            attempts: task.retry_count,
            last_attempt: task.last_attempt_at,
            next_retry_at: task.scheduled_for,
            batch_id: task.group_id,
            tags: task.labels,
            metadata: task.payload.data,
            results: task.result,
            errors: task.error_log.into_iter().map(ContextError::from).collect(),
            worker_id: task.claimed_by,
            created_at: task.created_at,
            updated_at: task.updated_at,
            processing_start: task.started_at,
            processing_end: task.finished_at,
            intermediate: BTreeMap::new(),
        }
    }
}
