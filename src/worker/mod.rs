//! Worker service: the poll, process, persist loop.
//!
//! One loop task polls while the service is active. Each polled unit (a
//! single context or a template-affine batch) is processed on its own task;
//! a semaphore bounds how many run at once. Stopping drains in-flight units
//! rather than cancelling them; a claim already under way completes and its
//! work is processed as part of the drain.

mod metrics;

pub use metrics::{Disposition, WorkerMetricsSnapshot};

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, RwLock, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::WorkerSettings;
use crate::models::{Context, ContextError, ContextStatus, RetryMeta};
use crate::pipeline::{BuildError, FlowCatalog, Pipeline, PipelineBuilder};
use crate::poller::{ContextPoller, PolledWork};
use crate::stage::StageRegistry;
use crate::store::{StoreError, WorkItemStore};
use metrics::WorkerMetrics;

/// Stage name recorded for items rejected before any pipeline runs.
pub const VALIDATION_STAGE: &str = "validation";
/// Stage name recorded for items whose pipeline could not be built.
pub const PIPELINE_BUILD_STAGE: &str = "pipeline_build";

struct Inner {
    store: Arc<dyn WorkItemStore>,
    poller: Mutex<ContextPoller>,
    builder: PipelineBuilder,
    catalog: Arc<FlowCatalog>,
    settings: WorkerSettings,
    active: AtomicBool,
    active_workers: AtomicUsize,
    /// Template id -> built pipeline.
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
    metrics: Mutex<WorkerMetrics>,
    permits: Arc<Semaphore>,
    /// Signalled to every waiter when the service stops.
    stopped: Notify,
}

/// Drives contexts from the store through their flow's pipeline.
pub struct WorkerService {
    inner: Arc<Inner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerService {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        catalog: Arc<FlowCatalog>,
        registry: Arc<StageRegistry>,
        settings: WorkerSettings,
    ) -> Self {
        let poller = ContextPoller::new(store.clone(), catalog.clone(), settings.poller_settings());
        let permits = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                store,
                poller: Mutex::new(poller),
                builder: PipelineBuilder::new(registry),
                catalog,
                settings,
                active: AtomicBool::new(false),
                active_workers: AtomicUsize::new(0),
                pipelines: RwLock::new(HashMap::new()),
                metrics: Mutex::new(WorkerMetrics::default()),
                permits,
                stopped: Notify::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.settings.worker_id
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Number of work units currently being processed.
    pub fn active_workers(&self) -> usize {
        self.inner.active_workers.load(Ordering::SeqCst)
    }

    /// Start the loop. Does nothing if already running.
    pub async fn start(&self) {
        let mut handle = self.handle.lock().await;
        if self.inner.active.swap(true, Ordering::SeqCst) {
            debug!("Worker {} already active", self.worker_id());
            return;
        }
        info!(
            "Starting worker {} (batch mode: {}, max concurrent: {})",
            self.worker_id(),
            self.inner.batch_mode(),
            self.inner.settings.max_concurrent
        );
        let inner = self.inner.clone();
        *handle = Some(tokio::spawn(async move { inner.run().await }));
    }

    /// Stop polling and wait for in-flight work to finish.
    pub async fn stop(&self) {
        let mut handle = self.handle.lock().await;
        if !self.inner.active.swap(false, Ordering::SeqCst) && handle.is_none() {
            return;
        }
        self.inner.stopped.notify_waiters();

        if let Some(task) = handle.take() {
            if let Err(e) = task.await {
                error!("Worker loop ended abnormally: {}", e);
            }
        }
        info!("Worker {} stopped", self.worker_id());
    }

    pub async fn metrics(&self) -> WorkerMetricsSnapshot {
        let cached = self.inner.pipelines.read().await.len();
        self.inner
            .metrics
            .lock()
            .await
            .snapshot(self.is_active(), self.active_workers(), cached)
    }

    /// Process one polled unit on the caller's task.
    pub async fn process(&self, work: PolledWork) {
        self.inner.process_unit(work).await;
    }
}

impl Inner {
    fn batch_mode(&self) -> bool {
        self.settings.batch_processing_enabled && self.settings.batch_size > 1
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run `fut` unless the service stops first; `None` if it did.
    async fn unless_stopped<F: Future>(&self, fut: F) -> Option<F::Output> {
        let stopped = self.stopped.notified();
        tokio::pin!(stopped);
        // Registered before the flag check, so a concurrent stop is not missed
        stopped.as_mut().enable();
        if !self.is_active() {
            return None;
        }
        tokio::select! {
            output = fut => Some(output),
            _ = stopped => None,
        }
    }

    /// Sleep for `duration` unless the service stops.
    async fn pause(&self, duration: Duration) {
        self.unless_stopped(tokio::time::sleep(duration)).await;
    }

    async fn poll(&self, poller: &mut ContextPoller) -> Result<Option<PolledWork>, StoreError> {
        if self.batch_mode() {
            poller
                .next_batch_with_flow(self.settings.batch_size, self.settings.batch_wait_time())
                .await
        } else {
            poller.next_with_flow().await
        }
    }

    async fn run(self: Arc<Self>) {
        let mut tasks = JoinSet::new();
        let mut last_stall_check: Option<Instant> = None;

        while self.is_active() {
            while tasks.try_join_next().is_some() {}

            if let Some(interval) = self.settings.stall_check_interval() {
                if last_stall_check.is_none_or(|t| t.elapsed() >= interval) {
                    last_stall_check = Some(Instant::now());
                    self.recover_stalled().await;
                }
            }

            let permit = match self
                .unless_stopped(self.permits.clone().acquire_owned())
                .await
            {
                Some(Ok(permit)) => permit,
                Some(Err(_)) | None => break,
            };

            // Not raced against stop: a claim in flight must finish and be
            // processed, or the claimed items would sit in processing
            let polled = {
                let mut poller = self.poller.lock().await;
                self.poll(&mut poller).await
            };

            match polled {
                Ok(Some(work)) => {
                    self.active_workers.fetch_add(1, Ordering::SeqCst);
                    let inner = self.clone();
                    tasks.spawn(async move {
                        inner.process_unit(work).await;
                        inner.active_workers.fetch_sub(1, Ordering::SeqCst);
                        drop(permit);
                    });
                }
                Ok(None) => {
                    drop(permit);
                    self.pause(self.settings.poll_interval()).await;
                }
                Err(e) => {
                    drop(permit);
                    warn!("Polling failed, backing off: {}", e);
                    self.pause(self.settings.poll_interval()).await;
                }
            }
        }

        if !tasks.is_empty() {
            info!("Draining {} in-flight work unit(s)", tasks.len());
        }
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!("Work unit task failed: {}", e);
            }
        }

        match self.poller.lock().await.reset_batch().await {
            Ok(0) => {}
            Ok(n) => info!("Released {} claimed context(s) from an unfinished batch", n),
            Err(e) => warn!("Failed to release unfinished batch: {}", e),
        }
    }

    async fn recover_stalled(&self) {
        match self.store.recover_stalled(self.settings.lock_expiry()).await {
            Ok(0) => {}
            Ok(n) => info!("Recovered {} stalled context(s)", n),
            Err(e) => warn!("Stalled context recovery failed: {}", e),
        }
    }

    /// Pipeline for `template_id`, built from `flow_id` on first use.
    async fn pipeline_for(
        &self,
        template_id: &str,
        flow_id: &str,
    ) -> Result<Arc<Pipeline>, BuildError> {
        if let Some(pipeline) = self.pipelines.read().await.get(template_id) {
            if pipeline.flow_id() == flow_id {
                return Ok(pipeline.clone());
            }
        }

        let flow = self
            .catalog
            .flow(flow_id)
            .ok_or_else(|| BuildError::UnknownFlow(flow_id.to_string()))?;
        let pipeline = Arc::new(self.builder.build(flow, Some(template_id))?);
        self.pipelines
            .write()
            .await
            .insert(template_id.to_string(), pipeline.clone());
        info!(
            "Built pipeline for template {} from flow {}",
            template_id, flow_id
        );
        Ok(pipeline)
    }

    async fn process_unit(&self, work: PolledWork) {
        let started = Instant::now();
        let PolledWork { contexts, flow_id } = work;
        if contexts.is_empty() {
            return;
        }
        let template_id = contexts[0].template_id.clone();

        let (template_id, flow_id) = match (template_id, flow_id) {
            (Some(t), Some(f)) => (t, f),
            (None, _) => {
                self.reject(contexts, VALIDATION_STAGE, "Context has no template_id", started)
                    .await;
                return;
            }
            (Some(t), None) => {
                let message = format!("No flow configured for template {}", t);
                self.reject(contexts, VALIDATION_STAGE, &message, started).await;
                return;
            }
        };

        let pipeline = match self.pipeline_for(&template_id, &flow_id).await {
            Ok(p) => p,
            Err(e) => {
                error!("Failed to build pipeline for {}: {}", template_id, e);
                self.reject(contexts, PIPELINE_BUILD_STAGE, &e.to_string(), started)
                    .await;
                self.pause(self.settings.poll_interval()).await;
                return;
            }
        };

        let prior_errors: Vec<usize> = contexts.iter().map(|c| c.errors.len()).collect();
        let count = contexts.len();
        let processed = if count > 1 {
            pipeline.execute_batch(contexts).await
        } else {
            let mut contexts = contexts;
            match contexts.pop() {
                Some(ctx) => vec![pipeline.execute(ctx).await],
                None => return,
            }
        };
        let per_item = started.elapsed() / count as u32;

        for (ctx, prior) in processed.into_iter().zip(prior_errors) {
            let outcome = self.persist(&ctx, prior).await;
            self.metrics
                .lock()
                .await
                .record(&template_id, per_item, outcome);
        }
    }

    /// Fail every context with one non-retryable error.
    async fn reject(&self, contexts: Vec<Context>, stage: &str, message: &str, started: Instant) {
        let per_item = started.elapsed() / contexts.len().max(1) as u32;
        for ctx in contexts {
            warn!("Rejecting context {}: {}", ctx.id, message);
            let errors = [ContextError::new(stage, message).retryable(false)];
            if let Err(e) = self
                .store
                .update_status(&ctx.id, ContextStatus::Failed, &errors, None)
                .await
            {
                error!("Failed to persist failure of {}: {}", ctx.id, e);
            }
            let template = ctx.template_id.as_deref().unwrap_or("");
            self.metrics
                .lock()
                .await
                .record(template, per_item, Disposition::Failed);
        }
    }

    /// Write a processed context back. Only errors appended during this run
    /// are sent; the store appends them to what it already holds.
    async fn persist(&self, ctx: &Context, prior_errors: usize) -> Disposition {
        let new_errors = ctx.errors.get(prior_errors..).unwrap_or_default();
        let disposition = disposition_for(ctx, new_errors, self.settings.max_processing_attempts);

        let result = match disposition {
            Disposition::Completed => {
                self.store
                    .update_result(
                        &ctx.id,
                        ContextStatus::Completed,
                        ctx.results.as_ref(),
                        new_errors,
                    )
                    .await
            }
            Disposition::Retried => {
                let backoff = self.settings.retry_backoff(ctx.attempts);
                let retry = RetryMeta {
                    attempts: ctx.attempts,
                    next_retry_at: retry_at(Utc::now(), backoff),
                };
                info!(
                    "Context {} failed on attempt {}, retrying in {:?}",
                    ctx.id, ctx.attempts, backoff
                );
                self.store
                    .update_status(&ctx.id, ContextStatus::Pending, new_errors, Some(retry))
                    .await
            }
            Disposition::Failed => {
                self.store
                    .update_status(&ctx.id, ContextStatus::Failed, new_errors, None)
                    .await
            }
        };

        match result {
            Ok(true) => debug!("Persisted context {} as {:?}", ctx.id, disposition),
            Ok(false) => warn!("Store did not accept the outcome for {}", ctx.id),
            Err(e) => error!("Failed to persist context {}: {}", ctx.id, e),
        }
        disposition
    }
}

/// When a retry scheduled `backoff` after `now` becomes eligible.
pub fn retry_at(now: DateTime<Utc>, backoff: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(backoff)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Decide how a processed context is persisted.
///
/// A failure is retried when the error that ended the run recommends it and
/// attempts remain.
pub fn disposition_for(ctx: &Context, new_errors: &[ContextError], max_attempts: i32) -> Disposition {
    match ctx.status {
        ContextStatus::Completed => Disposition::Completed,
        _ => {
            let retryable = new_errors.last().is_some_and(|e| e.retry_recommended);
            if retryable && ctx.can_retry(max_attempts) {
                Disposition::Retried
            } else {
                Disposition::Failed
            }
        }
    }
}
