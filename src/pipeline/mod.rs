//! Pipeline execution.
//!
//! A pipeline runs an ordered list of stages against one context or a
//! batch. Stage outputs accumulate in `Context::intermediate` during the run
//! and the last successful output becomes the context's results.

mod builder;

pub use builder::{BuildError, FlowCatalog, FlowDefinition, FlowModule, PipelineBuilder};

use std::time::{Duration, Instant};

use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::models::{Context, ContextError, ContextStatus};
use crate::stage::{Stage, StageError};

/// Running totals for one pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineMetrics {
    pub processed_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    /// Mean processing time per context in milliseconds.
    pub avg_processing_time_ms: f64,
}

impl PipelineMetrics {
    /// Record one processed context.
    pub fn record(&mut self, duration: Duration, success: bool) {
        self.processed_count += 1;
        if success {
            self.success_count += 1;
        } else {
            self.error_count += 1;
        }
        let n = self.processed_count as f64;
        let ms = duration.as_secs_f64() * 1000.0;
        self.avg_processing_time_ms = (self.avg_processing_time_ms * (n - 1.0) + ms) / n;
    }
}

/// Per-item state while a batch moves through the stages.
struct BatchItem {
    ctx: Context,
    halted: bool,
    last_output: Option<Value>,
}

impl BatchItem {
    fn new(mut ctx: Context) -> Self {
        ctx.intermediate.clear();
        Self {
            ctx,
            halted: false,
            last_output: None,
        }
    }

    /// Apply one stage result to this item.
    fn apply(&mut self, stage: &dyn Stage, result: Result<Value, StageError>) {
        match result {
            Ok(output) => {
                debug!("Stage {} succeeded for {}", stage.name(), self.ctx.id);
                self.ctx
                    .intermediate
                    .insert(stage.name().to_string(), output.clone());
                self.last_output = Some(output);
            }
            Err(e) => {
                warn!("Stage {} failed for {}: {}", stage.name(), self.ctx.id, e);
                self.ctx.errors.push(
                    ContextError::new(stage.name(), e.message).retryable(e.retry_recommended),
                );
                if !stage.continue_on_error() {
                    self.halted = true;
                }
            }
        }
    }

    /// Settle final status and results, and drop scratch state.
    fn finish(mut self) -> Context {
        match (self.halted, self.last_output) {
            (false, Some(output)) => {
                self.ctx.status = ContextStatus::Completed;
                self.ctx.results = Some(output);
            }
            _ => {
                self.ctx.status = ContextStatus::Failed;
                self.ctx.results = None;
            }
        }
        self.ctx.intermediate.clear();
        self.ctx
    }
}

/// An ordered, immutable stage sequence with running metrics.
pub struct Pipeline {
    flow_id: String,
    stages: Vec<Box<dyn Stage>>,
    metrics: Mutex<PipelineMetrics>,
}

impl Pipeline {
    pub fn new(flow_id: &str, stages: Vec<Box<dyn Stage>>) -> Self {
        Self {
            flow_id: flow_id.to_string(),
            stages,
            metrics: Mutex::new(PipelineMetrics::default()),
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Snapshot of the running metrics.
    pub async fn metrics(&self) -> PipelineMetrics {
        self.metrics.lock().await.clone()
    }

    pub(crate) async fn record_run(&self, duration: Duration, success: bool) {
        self.metrics.lock().await.record(duration, success);
    }

    /// Run all stages against one context.
    ///
    /// The returned context is `completed` with results, or `failed` with
    /// the stage errors appended.
    pub async fn execute(&self, ctx: Context) -> Context {
        let started = Instant::now();
        let mut item = BatchItem::new(ctx);

        for stage in &self.stages {
            let result = stage.process(&item.ctx).await;
            item.apply(stage.as_ref(), result);
            if item.halted {
                break;
            }
        }

        let ctx = item.finish();
        self.record_run(started.elapsed(), ctx.status == ContextStatus::Completed)
            .await;
        ctx
    }

    /// Run all stages against a batch.
    ///
    /// Stages with native batch support see every still-active item at
    /// once; other stages process the active items concurrently. Returned
    /// contexts keep input order.
    pub async fn execute_batch(&self, contexts: Vec<Context>) -> Vec<Context> {
        if contexts.is_empty() {
            return contexts;
        }

        let started = Instant::now();
        let mut items: Vec<BatchItem> = contexts.into_iter().map(BatchItem::new).collect();

        for stage in &self.stages {
            let active: Vec<usize> = (0..items.len()).filter(|&i| !items[i].halted).collect();
            if active.is_empty() {
                break;
            }

            if stage.supports_batch() {
                let batch: Vec<Context> = active.iter().map(|&i| items[i].ctx.clone()).collect();
                match stage.process_batch(&batch).await {
                    Ok(results) => {
                        let mut results = results.into_iter();
                        for &i in &active {
                            let result = results.next().unwrap_or_else(|| {
                                Err(StageError::new("Batch returned too few results"))
                            });
                            items[i].apply(stage.as_ref(), result);
                        }
                    }
                    Err(e) => {
                        warn!("Stage {} failed for whole batch: {}", stage.name(), e);
                        for &i in &active {
                            items[i].apply(stage.as_ref(), Err(e.clone()));
                        }
                    }
                }
            } else {
                let results = join_all(active.iter().map(|&i| stage.process(&items[i].ctx))).await;
                for (&i, result) in active.iter().zip(results) {
                    items[i].apply(stage.as_ref(), result);
                }
            }
        }

        let count = items.len();
        let per_item = started.elapsed() / count as u32;
        let mut finished = Vec::with_capacity(count);
        for item in items {
            let ctx = item.finish();
            self.record_run(per_item, ctx.status == ContextStatus::Completed)
                .await;
            finished.push(ctx);
        }
        finished
    }
}
