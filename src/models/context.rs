//! Context (work item) models.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Whether no further processing will happen for this state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Canceled)
    }
}

impl std::fmt::Display for ContextStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded stage failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextError {
    /// Name of the stage (or pseudo-stage such as `validation`) that failed.
    pub stage: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Whether the failure is transient and the item may be retried.
    #[serde(default)]
    pub retry_recommended: bool,
}

impl ContextError {
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
            timestamp: Utc::now(),
            retry_recommended: false,
        }
    }

    pub fn retryable(mut self, retry_recommended: bool) -> Self {
        self.retry_recommended = retry_recommended;
        self
    }
}

/// A unit of work pulled from the store and run through a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub status: ContextStatus,
    pub template_id: Option<String>,
    pub organization_id: Option<String>,
    pub service_type: Option<String>,
    pub priority: i32,
    pub attempts: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub batch_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub results: Option<serde_json::Value>,
    #[serde(default)]
    pub errors: Vec<ContextError>,
    pub worker_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processing_start: Option<DateTime<Utc>>,
    pub processing_end: Option<DateTime<Utc>>,
    /// Stage outputs accumulated during one pipeline run. Never persisted.
    #[serde(skip)]
    pub intermediate: BTreeMap<String, serde_json::Value>,
}

impl Context {
    /// Build an unsaved pending context from submission data.
    pub fn from_new(id: String, data: NewContext) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: ContextStatus::Pending,
            template_id: data.template_id,
            organization_id: data.organization_id,
            service_type: data.service_type,
            priority: data.priority,
            attempts: 0,
            last_attempt: None,
            next_retry_at: data.next_retry_at,
            batch_id: data.batch_id,
            tags: data.tags,
            metadata: data.metadata,
            results: None,
            errors: Vec::new(),
            worker_id: None,
            created_at: now,
            updated_at: now,
            processing_start: None,
            processing_end: None,
            intermediate: BTreeMap::new(),
        }
    }

    /// Output of a previously run stage in the current pipeline pass.
    pub fn stage_output(&self, stage: &str) -> Option<&serde_json::Value> {
        self.intermediate.get(stage)
    }

    /// Look up a metadata field by key.
    pub fn metadata_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_object().and_then(|m| m.get(key))
    }

    /// Whether a claimed copy of this context may be rescheduled.
    pub fn can_retry(&self, max_attempts: i32) -> bool {
        self.attempts < max_attempts
    }
}

/// Submission payload for creating a context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewContext {
    pub template_id: Option<String>,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Delay first eligibility until this time.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl NewContext {
    pub fn for_template(template_id: &str) -> Self {
        Self {
            template_id: Some(template_id.to_string()),
            metadata: serde_json::json!({}),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_batch_id(mut self, batch_id: &str) -> Self {
        self.batch_id = Some(batch_id.to_string());
        self
    }
}

/// Retry bookkeeping written alongside a reset to `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryMeta {
    pub attempts: i32,
    pub next_retry_at: DateTime<Utc>,
}
