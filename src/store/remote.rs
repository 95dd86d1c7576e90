//! Work item store backed by a remote task service.
//!
//! The server claims atomically, so no local lock is taken. Request failures
//! are logged and reported as an absent or negative result; only
//! construction (and submission, which has no absent form) return errors.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::translate::{RemoteTask, TaskErrorEntry, TaskStatus};
use super::{sort_by_poll_order, ClaimFilter, StoreError, WorkItemStore};
use crate::config::StoreConfig;
use crate::models::{Context, ContextError, ContextStatus, NewContext, RetryMeta};

/// Upper bound on tasks fetched by one pending query.
const MAX_FETCH_LIMIT: usize = 1000;
/// Initial pending tasks fetched per claim, relative to the number wanted.
const FETCH_FACTOR: usize = 4;

/// Connection settings for the remote task service.
#[derive(Debug, Clone)]
pub struct RemoteStoreConfig {
    pub base_url: String,
    /// Identity sent with every claim and update.
    pub processor_id: String,
    /// Default `processor_type` filter for pending-task queries.
    pub processor_type: Option<String>,
    pub timeout: Duration,
}

impl RemoteStoreConfig {
    pub fn new(base_url: &str, processor_id: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            processor_id: processor_id.to_string(),
            processor_type: None,
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_processor_type(mut self, processor_type: &str) -> Self {
        self.processor_type = Some(processor_type.to_string());
        self
    }

    pub fn from_store_config(config: &StoreConfig, worker_id: &str) -> Result<Self, StoreError> {
        let base_url = config.remote_url.as_deref().ok_or_else(|| {
            StoreError::Config("store.remote_url is required for the remote backend".into())
        })?;
        Ok(Self {
            base_url: base_url.to_string(),
            processor_id: worker_id.to_string(),
            processor_type: config.processor_type.clone(),
            timeout: Duration::from_secs(config.request_timeout),
        })
    }
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    processor_id: &'a str,
}

#[derive(Debug, Serialize)]
struct CompleteRequest<'a> {
    processor_id: &'a str,
    result: Option<&'a serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct FailRequest<'a> {
    processor_id: &'a str,
    error: String,
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    processor_id: &'a str,
    status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled_for: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    errors: Vec<TaskErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    task_id: String,
}

/// Summarize errors into the single message the `/fail` call carries.
fn failure_message(errors: &[ContextError]) -> String {
    errors
        .last()
        .map(|e| format!("{}: {}", e.stage, e.message))
        .unwrap_or_else(|| "processing failed".to_string())
}

/// Template a batch groups by: the filter's, else the first candidate's.
fn batch_template(filter: &ClaimFilter, candidates: &[Context]) -> Option<String> {
    match &filter.template_id {
        Some(t) => Some(t.clone()),
        None => candidates.first().and_then(|c| c.template_id.clone()),
    }
}

/// Remote task service adapter.
pub struct RemoteTaskStore {
    client: Client,
    base_url: Url,
    config: RemoteStoreConfig,
}

impl RemoteTaskStore {
    pub fn new(config: RemoteStoreConfig) -> Result<Self, StoreError> {
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base_url = Url::parse(&base)
            .map_err(|e| StoreError::Config(format!("Invalid remote URL {}: {}", base, e)))?;

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("ctxflow/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base_url,
            config,
        })
    }

    fn url(&self, path: &str) -> Option<Url> {
        match self.base_url.join(path) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Invalid task service path {}: {}", path, e);
                None
            }
        }
    }

    /// Send a request; the response only if it is 2xx.
    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Option<Response> {
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!("Task service {} failed: {}", what, e);
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            if status == StatusCode::NOT_FOUND || status == StatusCode::CONFLICT {
                debug!("Task service {} returned {}", what, status);
            } else {
                warn!("Task service {} returned {}", what, status);
            }
            return None;
        }
        Some(response)
    }

    /// Send a request and decode a 2xx JSON body.
    async fn send_json<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Option<T> {
        let response = self.send(request, what).await?;
        match response.json::<T>().await {
            Ok(body) => Some(body),
            Err(e) => {
                warn!("Task service {} returned an invalid body: {}", what, e);
                None
            }
        }
    }

    /// POST a JSON body; `true` on 2xx.
    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> bool {
        let Some(url) = self.url(path) else {
            return false;
        };
        match self.client.post(url).json(body).send().await {
            Ok(r) if r.status().is_success() => true,
            Ok(r) => {
                warn!("Task service POST {} returned {}", path, r.status());
                false
            }
            Err(e) => {
                warn!("Task service POST {} failed: {}", path, e);
                false
            }
        }
    }

    /// Eligible pending tasks in poll order, plus how many tasks the server
    /// returned before filtering.
    async fn fetch_pending(&self, filter: &ClaimFilter, limit: usize) -> (Vec<Context>, usize) {
        let Some(url) = self.url("tasks/pending") else {
            return (Vec::new(), 0);
        };

        let mut query: Vec<(&str, String)> = vec![("limit", limit.to_string())];
        if let Some(processor_type) = filter
            .service_type
            .as_ref()
            .or(self.config.processor_type.as_ref())
        {
            query.push(("processor_type", processor_type.clone()));
        }

        let tasks: Vec<RemoteTask> = self
            .send_json(self.client.get(url).query(&query), "pending query")
            .await
            .unwrap_or_default();
        let fetched = tasks.len();

        let now = Utc::now();
        let mut contexts: Vec<Context> = tasks
            .into_iter()
            .map(Context::from)
            .filter(|ctx| filter.matches(ctx, now))
            .collect();
        sort_by_poll_order(&mut contexts);
        (contexts, fetched)
    }

    /// Eligible pending tasks, widening the query until `enough` holds or
    /// the server has no further tasks.
    ///
    /// The server orders its own queue, so the head of a small window can be
    /// all ineligible (scheduled for later, or out of attempts) while ready
    /// tasks sit behind it.
    async fn fetch_eligible<F>(&self, filter: &ClaimFilter, wanted: usize, enough: F) -> Vec<Context>
    where
        F: Fn(&[Context]) -> bool,
    {
        let mut window = (wanted.max(1) * FETCH_FACTOR).min(MAX_FETCH_LIMIT);
        loop {
            let (eligible, fetched) = self.fetch_pending(filter, window).await;
            if enough(&eligible) || fetched < window || window >= MAX_FETCH_LIMIT {
                return eligible;
            }
            debug!(
                "{} of {} pending tasks eligible, widening query",
                eligible.len(),
                fetched
            );
            window = (window * 2).min(MAX_FETCH_LIMIT);
        }
    }

    /// Ask the server to claim one task. `None` means someone else has it.
    async fn claim(&self, id: &str) -> Option<Context> {
        let url = self.url(&format!("tasks/{}/claim", id))?;
        let request = self.client.post(url).json(&ClaimRequest {
            processor_id: &self.config.processor_id,
        });

        let response = self.send(request, "claim").await?;
        match response.json::<RemoteTask>().await {
            Ok(task) => {
                debug!("Claimed remote task {}", task.task_id);
                Some(task.into())
            }
            // The claim was granted; read the task back
            Err(e) => {
                warn!("Claim of {} returned an unreadable body ({}), re-reading task", id, e);
                self.claimed_task(id).await
            }
        }
    }

    /// Re-read a task this processor was just granted.
    async fn claimed_task(&self, id: &str) -> Option<Context> {
        let url = self.url(&format!("tasks/{}", id))?;
        let task: RemoteTask = self.send_json(self.client.get(url), "get").await?;
        let ctx = Context::from(task);
        if ctx.status == ContextStatus::Processing
            && ctx.worker_id.as_deref() == Some(self.config.processor_id.as_str())
        {
            Some(ctx)
        } else {
            warn!("Task {} is not held by this processor after claim", id);
            None
        }
    }

    async fn post_status(
        &self,
        id: &str,
        status: ContextStatus,
        errors: &[ContextError],
        retry: Option<RetryMeta>,
    ) -> bool {
        let body = StatusRequest {
            processor_id: &self.config.processor_id,
            status: status.into(),
            retry_count: retry.map(|r| r.attempts),
            scheduled_for: retry.map(|r| r.next_retry_at),
            errors: errors.iter().map(TaskErrorEntry::from).collect(),
        };
        self.post(&format!("tasks/{}/status", id), &body).await
    }

    async fn post_failure(&self, id: &str, errors: &[ContextError]) -> bool {
        let body = FailRequest {
            processor_id: &self.config.processor_id,
            error: failure_message(errors),
        };
        self.post(&format!("tasks/{}/fail", id), &body).await
    }
}

#[async_trait]
impl WorkItemStore for RemoteTaskStore {
    async fn create_context(&self, data: NewContext) -> Result<String, StoreError> {
        let mut task = RemoteTask::from(&Context::from_new(String::new(), data));
        if task.processor_type.is_none() {
            task.processor_type = self.config.processor_type.clone();
        }

        let url = self
            .url("tasks")
            .ok_or_else(|| StoreError::Config("Invalid task service URL".into()))?;
        let created: CreateResponse = self
            .send_json(self.client.post(url).json(&task), "create")
            .await
            .ok_or_else(|| StoreError::Rejected("task service did not accept the task".into()))?;
        Ok(created.task_id)
    }

    async fn get_context(&self, id: &str) -> Result<Option<Context>, StoreError> {
        let Some(url) = self.url(&format!("tasks/{}", id)) else {
            return Ok(None);
        };
        let task: Option<RemoteTask> = self.send_json(self.client.get(url), "get").await;
        Ok(task.map(Context::from))
    }

    async fn claim_next_pending(
        &self,
        filter: &ClaimFilter,
    ) -> Result<Option<Context>, StoreError> {
        let candidates = self
            .fetch_eligible(filter, 1, |eligible| !eligible.is_empty())
            .await;
        for candidate in candidates {
            if let Some(ctx) = self.claim(&candidate.id).await {
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
            .fetch_eligible(filter, limit, |eligible| {
                let template_id = batch_template(filter, eligible);
                eligible
                    .iter()
                    .filter(|c| c.template_id == template_id)
                    .count()
                    >= limit
            })
            .await;
        let template_id = batch_template(filter, &candidates);
        candidates.retain(|c| c.template_id == template_id);

        let mut claimed = Vec::with_capacity(limit);
        for candidate in &candidates {
            if claimed.len() >= limit {
                break;
            }
            if let Some(ctx) = self.claim(&candidate.id).await {
                claimed.push(ctx);
            }
        }
        Ok(claimed)
    }

    async fn update_status(
        &self,
        id: &str,
        status: ContextStatus,
        errors: &[ContextError],
        retry: Option<RetryMeta>,
    ) -> Result<bool, StoreError> {
        let ok = match (status, retry) {
            (ContextStatus::Failed, None) => self.post_failure(id, errors).await,
            _ => self.post_status(id, status, errors, retry).await,
        };
        Ok(ok)
    }

    async fn update_result(
        &self,
        id: &str,
        status: ContextStatus,
        result: Option<&serde_json::Value>,
        errors: &[ContextError],
    ) -> Result<bool, StoreError> {
        let ok = match status {
            ContextStatus::Completed => {
                let body = CompleteRequest {
                    processor_id: &self.config.processor_id,
                    result,
                };
                self.post(&format!("tasks/{}/complete", id), &body).await
            }
            ContextStatus::Failed => self.post_failure(id, errors).await,
            other => self.post_status(id, other, errors, None).await,
        };
        Ok(ok)
    }

    /// The server owns leases; an unreleased claim lapses there.
    async fn release_claim(&self, id: &str) -> Result<(), StoreError> {
        debug!("Leaving remote claim on {} to lease expiry", id);
        Ok(())
    }

    async fn recover_stalled(&self, _older_than: Duration) -> Result<u64, StoreError> {
        Ok(0)
    }

    async fn count_pending(&self, filter: &ClaimFilter) -> Result<u64, StoreError> {
        Ok(self.fetch_pending(filter, MAX_FETCH_LIMIT).await.0.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn task_json(id: &str, template: &str, priority: i32, created_at: &str) -> serde_json::Value {
        json!({
            "task_id": id,
            "status": "queued",
            "processor_type": "email",
            "priority": priority,
            "retry_count": 0,
            "group_id": "batch-1",
            "tenant_id": "org-1",
            "labels": ["a"],
            "payload": {"template_id": template, "data": {"name": "Ada"}},
            "created_at": created_at,
            "updated_at": created_at
        })
    }

    fn store(server: &MockServer) -> RemoteTaskStore {
        let config = RemoteStoreConfig::new(&server.base_url(), "worker-1");
        RemoteTaskStore::new(config).unwrap()
    }

    #[test]
    fn test_invalid_url_is_config_error() {
        let result = RemoteTaskStore::new(RemoteStoreConfig::new("not a url", "w"));
        assert!(matches!(result, Err(StoreError::Config(_))));
    }

    #[tokio::test]
    async fn test_get_context_translates() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/t1");
                then.status(200)
                    .json_body(task_json("t1", "welcome", 0, "2026-01-01T00:00:00Z"));
            })
            .await;

        let ctx = store(&server).get_context("t1").await.unwrap().unwrap();
        assert_eq!(ctx.id, "t1");
        assert_eq!(ctx.status, ContextStatus::Pending);
        assert_eq!(ctx.template_id.as_deref(), Some("welcome"));
        assert_eq!(ctx.organization_id.as_deref(), Some("org-1"));
        assert_eq!(ctx.batch_id.as_deref(), Some("batch-1"));
        assert_eq!(ctx.metadata["name"], "Ada");
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/nope");
                then.status(404);
            })
            .await;

        assert!(store(&server).get_context("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_picks_highest_priority_and_skips_conflicts() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/pending");
                then.status(200).json_body(json!([
                    task_json("low", "welcome", 1, "2026-01-01T00:00:00Z"),
                    task_json("high", "welcome", 5, "2026-01-01T00:00:05Z"),
                ]));
            })
            .await;
        let taken = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/tasks/high/claim")
                    .json_body(json!({"processor_id": "worker-1"}));
                then.status(409);
            })
            .await;
        let mut claimed = task_json("low", "welcome", 1, "2026-01-01T00:00:00Z");
        claimed["status"] = json!("running");
        claimed["claimed_by"] = json!("worker-1");
        let granted = server
            .mock_async(|when, then| {
                when.method(POST).path("/tasks/low/claim");
                then.status(200).json_body(claimed);
            })
            .await;

        let ctx = store(&server)
            .claim_next_pending(&ClaimFilter::new(3))
            .await
            .unwrap()
            .unwrap();

        taken.assert_async().await;
        granted.assert_async().await;
        assert_eq!(ctx.id, "low");
        assert_eq!(ctx.status, ContextStatus::Processing);
        assert_eq!(ctx.worker_id.as_deref(), Some("worker-1"));
    }

    #[tokio::test]
    async fn test_pending_query_sends_processor_type() {
        let server = MockServer::start_async().await;
        let pending = server
            .mock_async(|when, then| {
                when.method(GET)
                    .path("/tasks/pending")
                    .query_param("processor_type", "email")
                    .query_param("limit", "1000");
                then.status(200).json_body(json!([
                    task_json("a", "welcome", 0, "2026-01-01T00:00:00Z"),
                ]));
            })
            .await;

        let config = RemoteStoreConfig::new(&server.base_url(), "w").with_processor_type("email");
        let remote = RemoteTaskStore::new(config).unwrap();
        assert_eq!(remote.count_pending(&ClaimFilter::new(3)).await.unwrap(), 1);
        pending.assert_async().await;
    }

    #[tokio::test]
    async fn test_server_error_is_absent() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/pending");
                then.status(500);
            })
            .await;

        let remote = store(&server);
        assert!(remote
            .claim_next_pending(&ClaimFilter::new(3))
            .await
            .unwrap()
            .is_none());
        assert!(remote
            .claim_batch(&ClaimFilter::new(3), 5)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_claim_widens_past_scheduled_head() {
        let server = MockServer::start_async().await;
        let later = (Utc::now() + chrono::Duration::hours(1)).to_rfc3339();
        let mut head = Vec::new();
        for i in 0..4 {
            let mut task = task_json(&format!("later-{}", i), "welcome", 9, "2026-01-01T00:00:00Z");
            task["scheduled_for"] = json!(later);
            head.push(task);
        }
        let mut widened = head.clone();
        widened.push(task_json("ready", "welcome", 1, "2026-01-01T00:00:10Z"));

        let narrow = server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/pending").query_param("limit", "4");
                then.status(200).json_body(json!(head));
            })
            .await;
        let wide = server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/pending").query_param("limit", "8");
                then.status(200).json_body(json!(widened));
            })
            .await;
        let mut claimed = task_json("ready", "welcome", 1, "2026-01-01T00:00:10Z");
        claimed["status"] = json!("running");
        claimed["claimed_by"] = json!("worker-1");
        server
            .mock_async(|when, then| {
                when.method(POST).path("/tasks/ready/claim");
                then.status(200).json_body(claimed);
            })
            .await;

        let ctx = store(&server)
            .claim_next_pending(&ClaimFilter::new(3))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ctx.id, "ready");
        narrow.assert_async().await;
        wide.assert_async().await;
    }

    #[tokio::test]
    async fn test_claim_with_unreadable_body_rereads_task() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/pending");
                then.status(200).json_body(json!([
                    task_json("t1", "welcome", 0, "2026-01-01T00:00:00Z"),
                ]));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/tasks/t1/claim");
                then.status(200).body("");
            })
            .await;
        let mut held = task_json("t1", "welcome", 0, "2026-01-01T00:00:00Z");
        held["status"] = json!("running");
        held["claimed_by"] = json!("worker-1");
        let reread = server
            .mock_async(|when, then| {
                when.method(GET).path("/tasks/t1");
                then.status(200).json_body(held);
            })
            .await;

        let ctx = store(&server)
            .claim_next_pending(&ClaimFilter::new(3))
            .await
            .unwrap()
            .unwrap();
        reread.assert_async().await;
        assert_eq!(ctx.id, "t1");
        assert_eq!(ctx.status, ContextStatus::Processing);
    }

    #[tokio::test]
    async fn test_complete_and_fail_calls() {
        let server = MockServer::start_async().await;
        let complete = server
            .mock_async(|when, then| {
                when.method(POST).path("/tasks/t1/complete").json_body(json!({
                    "processor_id": "worker-1",
                    "result": {"text": "hi"}
                }));
                then.status(200);
            })
            .await;
        let fail = server
            .mock_async(|when, then| {
                when.method(POST).path("/tasks/t2/fail").json_body(json!({
                    "processor_id": "worker-1",
                    "error": "render: boom"
                }));
                then.status(200);
            })
            .await;

        let remote = store(&server);
        let output = json!({"text": "hi"});
        assert!(remote
            .update_result("t1", ContextStatus::Completed, Some(&output), &[])
            .await
            .unwrap());
        assert!(remote
            .update_status(
                "t2",
                ContextStatus::Failed,
                &[ContextError::new("render", "boom")],
                None
            )
            .await
            .unwrap());

        complete.assert_async().await;
        fail.assert_async().await;
    }

    #[tokio::test]
    async fn test_retry_posts_status_with_schedule() {
        let server = MockServer::start_async().await;
        let status = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/tasks/t1/status")
                    .json_body_partial(r#"{"processor_id": "worker-1", "status": "queued", "retry_count": 2}"#);
                then.status(200);
            })
            .await;

        let next = Utc::now() + chrono::Duration::seconds(30);
        let ok = store(&server)
            .schedule_retry("t1", 2, next)
            .await
            .unwrap();

        assert!(ok);
        status.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_returns_task_id() {
        let server = MockServer::start_async().await;
        let create = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/tasks")
                    .json_body_partial(r#"{"status": "queued", "payload": {"template_id": "welcome"}}"#);
                then.status(201).json_body(json!({"task_id": "new-1"}));
            })
            .await;

        let id = store(&server)
            .create_context(NewContext::for_template("welcome"))
            .await
            .unwrap();
        assert_eq!(id, "new-1");
        create.assert_async().await;
    }

    #[tokio::test]
    async fn test_recover_stalled_is_server_side() {
        let server = MockServer::start_async().await;
        assert_eq!(
            store(&server)
                .recover_stalled(Duration::from_secs(1))
                .await
                .unwrap(),
            0
        );
    }
}
