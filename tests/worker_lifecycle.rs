//! Worker lifecycle tests
//!
//! Runs the worker service end to end against a SQLite store in a temporary
//! directory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use httpmock::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use ctxflow::config::Config;
use ctxflow::models::{Context, ContextError, ContextStatus, NewContext, RetryMeta};
use ctxflow::poller::ContextPoller;
use ctxflow::store::{open_store, ClaimFilter, StoreError, WorkItemStore};
use ctxflow::worker::{WorkerService, PIPELINE_BUILD_STAGE, VALIDATION_STAGE};

fn config(dir: &TempDir, extra: &str) -> Config {
    let db = dir.path().join("worker.db");
    let toml = format!(
        r#"
[worker]
worker_id = "it-worker"
poll_interval = 0.05
batch_wait_time = 0.2
retry_delay = 60
max_retry_delay = 600
stall_check_interval = 0

[store]
database_url = "sqlite:{db}"
lock_backend = "database"

[modules.greet]
stage = "template"
config = {{ output_key = "greeting" }}
prompts = {{ template = "Hello {{{{name}}}}" }}

[[flows]]
id = "greeting"
modules = [{{ id = "passthrough" }}, {{ id = "greet" }}]

[templates]
"welcome*" = "greeting"
{extra}
"#,
        db = db.display(),
        extra = extra
    );
    Config::parse(&toml, "toml").unwrap()
}

async fn setup(dir: &TempDir, extra: &str) -> (Config, Arc<dyn WorkItemStore>) {
    let config = config(dir, extra);
    let store = open_store(&config.store, &config.worker).await.unwrap();
    (config, store)
}

fn service(config: &Config, store: Arc<dyn WorkItemStore>) -> WorkerService {
    WorkerService::new(
        store,
        Arc::new(config.flow_catalog()),
        Arc::new(config.stage_registry()),
        config.worker.clone(),
    )
}

/// Poll until every id reaches a terminal status or the deadline passes.
async fn wait_terminal(store: &Arc<dyn WorkItemStore>, ids: &[String]) -> Vec<Context> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let mut contexts = Vec::new();
        for id in ids {
            contexts.push(store.get_context(id).await.unwrap().unwrap());
        }
        if contexts.iter().all(|c| c.status.is_terminal()) {
            return contexts;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "contexts did not finish: {:?}",
            contexts.iter().map(|c| c.status).collect::<Vec<_>>()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[tokio::test]
async fn test_worker_completes_pending_contexts() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store) = setup(&dir, "").await;

    let mut ids = Vec::new();
    for name in ["Ada", "Grace"] {
        let id = store
            .create_context(NewContext::for_template("welcome_email").with_metadata(json!({"name": name})))
            .await
            .unwrap();
        ids.push(id);
    }

    let worker = service(&config, store.clone());
    worker.start().await;
    assert!(worker.is_active());
    let contexts = wait_terminal(&store, &ids).await;
    worker.stop().await;
    assert!(!worker.is_active());
    assert_eq!(worker.active_workers(), 0);

    assert_eq!(contexts[0].status, ContextStatus::Completed);
    assert_eq!(contexts[0].results.as_ref().unwrap()["greeting"], "Hello Ada");
    assert_eq!(contexts[1].results.as_ref().unwrap()["greeting"], "Hello Grace");
    assert!(contexts.iter().all(|c| c.errors.is_empty() && c.attempts == 1));
    assert!(contexts
        .iter()
        .all(|c| c.worker_id.as_deref() == Some("it-worker") && c.processing_end.is_some()));

    let metrics = worker.metrics().await;
    assert_eq!(metrics.totals.processed_count, 2);
    assert_eq!(metrics.totals.success_count, 2);
    assert_eq!(metrics.by_template["welcome_email"].processed_count, 2);
    assert_eq!(metrics.cached_pipelines, 1);
}

#[tokio::test]
async fn test_batch_mode_processes_template_batch() {
    let dir = tempfile::tempdir().unwrap();
    let (mut config, store) = setup(&dir, "").await;
    config.worker.batch_processing_enabled = true;
    config.worker.batch_size = 5;

    let mut ids = Vec::new();
    for i in 0..3 {
        let id = store
            .create_context(
                NewContext::for_template("welcome").with_metadata(json!({"name": format!("n{}", i)})),
            )
            .await
            .unwrap();
        ids.push(id);
    }

    let worker = service(&config, store.clone());
    worker.start().await;
    let contexts = wait_terminal(&store, &ids).await;
    worker.stop().await;

    assert!(contexts.iter().all(|c| c.status == ContextStatus::Completed));
    assert_eq!(contexts[2].results.as_ref().unwrap()["greeting"], "Hello n2");
}

#[tokio::test]
async fn test_stop_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store) = setup(&dir, "").await;
    let worker = service(&config, store);

    worker.stop().await;
    worker.start().await;
    worker.start().await;
    worker.stop().await;
    worker.stop().await;
    assert!(!worker.is_active());
}

#[tokio::test]
async fn test_transient_failure_is_rescheduled() {
    let server = MockServer::start_async().await;
    let hook = server
        .mock_async(|when, then| {
            when.method(POST).path("/hook");
            then.status(503);
        })
        .await;

    let dir = tempfile::tempdir().unwrap();
    let extra = format!(
        r#"
[modules.notify]
stage = "http"
config = {{ url = "{}" }}

[[flows]]
id = "notify"
modules = [{{ id = "notify" }}]
"#,
        server.url("/hook")
    );
    // Table headers above end the [templates] table, so map the template here
    let (mut config, store) = setup(&dir, &extra).await;
    config
        .templates
        .insert("alert".to_string(), "notify".to_string());

    let id = store
        .create_context(NewContext::for_template("alert"))
        .await
        .unwrap();

    let worker = service(&config, store.clone());
    let mut poller = ContextPoller::new(
        store.clone(),
        Arc::new(config.flow_catalog()),
        config.poller_settings(),
    );
    let work = poller.next_with_flow().await.unwrap().unwrap();
    assert_eq!(work.flow_id.as_deref(), Some("notify"));
    let before = Utc::now();
    worker.process(work).await;
    hook.assert_async().await;

    let ctx = store.get_context(&id).await.unwrap().unwrap();
    assert_eq!(ctx.status, ContextStatus::Pending);
    assert_eq!(ctx.attempts, 1);
    assert_eq!(ctx.errors.len(), 1);
    assert!(ctx.errors[0].retry_recommended);
    assert_eq!(ctx.errors[0].stage, "notify");
    let next = ctx.next_retry_at.unwrap();
    assert!(next >= before + chrono::Duration::seconds(59));
    assert!(ctx.results.is_none());

    // Not claimable before its retry time
    assert!(poller.next_with_flow().await.unwrap().is_none());
    assert_eq!(worker.metrics().await.retried_count, 1);
}

#[tokio::test]
async fn test_unmapped_template_fails_validation() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store) = setup(&dir, "").await;
    let id = store
        .create_context(NewContext::for_template("unknown"))
        .await
        .unwrap();

    let worker = service(&config, store.clone());
    let mut poller = ContextPoller::new(
        store.clone(),
        Arc::new(config.flow_catalog()),
        config.poller_settings(),
    );
    let work = poller.next_with_flow().await.unwrap().unwrap();
    assert!(work.flow_id.is_none());
    worker.process(work).await;

    let ctx = store.get_context(&id).await.unwrap().unwrap();
    assert_eq!(ctx.status, ContextStatus::Failed);
    assert_eq!(ctx.errors.len(), 1);
    assert_eq!(ctx.errors[0].stage, VALIDATION_STAGE);
    assert!(!ctx.errors[0].retry_recommended);
}

#[tokio::test]
async fn test_broken_flow_fails_items() {
    let dir = tempfile::tempdir().unwrap();
    let extra = r#"
[[flows]]
id = "broken"
modules = [{ id = "does_not_exist" }]
"#;
    let (mut config, store) = setup(&dir, extra).await;
    config.worker.poll_interval = 0.01;
    config
        .templates
        .insert("report".to_string(), "broken".to_string());

    let id = store
        .create_context(NewContext::for_template("report"))
        .await
        .unwrap();

    let worker = service(&config, store.clone());
    let mut poller = ContextPoller::new(
        store.clone(),
        Arc::new(config.flow_catalog()),
        config.poller_settings(),
    );
    let work = poller.next_with_flow().await.unwrap().unwrap();
    worker.process(work).await;

    let ctx = store.get_context(&id).await.unwrap().unwrap();
    assert_eq!(ctx.status, ContextStatus::Failed);
    assert_eq!(ctx.errors[0].stage, PIPELINE_BUILD_STAGE);
    assert!(ctx.errors[0].message.contains("does_not_exist"));
}

/// Store whose claims take a while to come back.
struct SlowClaims {
    inner: Arc<dyn WorkItemStore>,
    delay: Duration,
}

#[async_trait]
impl WorkItemStore for SlowClaims {
    async fn create_context(&self, data: NewContext) -> Result<String, StoreError> {
        self.inner.create_context(data).await
    }

    async fn get_context(&self, id: &str) -> Result<Option<Context>, StoreError> {
        self.inner.get_context(id).await
    }

    async fn claim_next_pending(
        &self,
        filter: &ClaimFilter,
    ) -> Result<Option<Context>, StoreError> {
        let claimed = self.inner.claim_next_pending(filter).await;
        tokio::time::sleep(self.delay).await;
        claimed
    }

    async fn claim_batch(
        &self,
        filter: &ClaimFilter,
        limit: usize,
    ) -> Result<Vec<Context>, StoreError> {
        let claimed = self.inner.claim_batch(filter, limit).await;
        tokio::time::sleep(self.delay).await;
        claimed
    }

    async fn update_status(
        &self,
        id: &str,
        status: ContextStatus,
        errors: &[ContextError],
        retry: Option<RetryMeta>,
    ) -> Result<bool, StoreError> {
        self.inner.update_status(id, status, errors, retry).await
    }

    async fn update_result(
        &self,
        id: &str,
        status: ContextStatus,
        result: Option<&serde_json::Value>,
        errors: &[ContextError],
    ) -> Result<bool, StoreError> {
        self.inner.update_result(id, status, result, errors).await
    }

    async fn release_claim(&self, id: &str) -> Result<(), StoreError> {
        self.inner.release_claim(id).await
    }

    async fn recover_stalled(&self, older_than: Duration) -> Result<u64, StoreError> {
        self.inner.recover_stalled(older_than).await
    }

    async fn count_pending(&self, filter: &ClaimFilter) -> Result<u64, StoreError> {
        self.inner.count_pending(filter).await
    }
}

#[tokio::test]
async fn test_stop_during_claim_processes_claimed_item() {
    let dir = tempfile::tempdir().unwrap();
    let (config, store) = setup(&dir, "").await;
    let id = store
        .create_context(NewContext::for_template("welcome").with_metadata(json!({"name": "Ada"})))
        .await
        .unwrap();

    let slow: Arc<dyn WorkItemStore> = Arc::new(SlowClaims {
        inner: store.clone(),
        delay: Duration::from_millis(500),
    });
    let worker = service(&config, slow);
    worker.start().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    worker.stop().await;

    let ctx = store.get_context(&id).await.unwrap().unwrap();
    assert_eq!(ctx.status, ContextStatus::Completed);
    assert_eq!(ctx.results.as_ref().unwrap()["greeting"], "Hello Ada");
    assert_eq!(worker.metrics().await.totals.processed_count, 1);
}

#[tokio::test]
async fn test_stop_wakes_every_pause() {
    let dir = tempfile::tempdir().unwrap();
    let extra = r#"
[[flows]]
id = "broken"
modules = [{ id = "does_not_exist" }]
"#;
    let (mut config, store) = setup(&dir, extra).await;
    config.worker.poll_interval = 30.0;
    config.worker.max_concurrent = 2;
    config
        .templates
        .insert("report".to_string(), "broken".to_string());
    let id = store
        .create_context(NewContext::for_template("report"))
        .await
        .unwrap();

    // The failed build pauses its unit while the loop idles in its own pause
    let worker = service(&config, store.clone());
    worker.start().await;
    wait_terminal(&store, &[id]).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    tokio::time::timeout(Duration::from_secs(5), worker.stop())
        .await
        .expect("stop should interrupt both pauses");
    assert!(!worker.is_active());
    assert_eq!(worker.active_workers(), 0);
}

