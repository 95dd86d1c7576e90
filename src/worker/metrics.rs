//! Worker-level processing metrics.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::Serialize;

use crate::pipeline::PipelineMetrics;

/// How a processed context was persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Retried,
    Failed,
}

/// Cumulative and per-template counters for one worker instance.
#[derive(Debug, Default)]
pub(crate) struct WorkerMetrics {
    totals: PipelineMetrics,
    retried: u64,
    by_template: HashMap<String, PipelineMetrics>,
}

impl WorkerMetrics {
    pub(crate) fn record(&mut self, template_id: &str, duration: Duration, outcome: Disposition) {
        let success = outcome == Disposition::Completed;
        self.totals.record(duration, success);
        self.by_template
            .entry(template_id.to_string())
            .or_default()
            .record(duration, success);
        if outcome == Disposition::Retried {
            self.retried += 1;
        }
    }

    pub(crate) fn snapshot(
        &self,
        active: bool,
        active_workers: usize,
        cached_pipelines: usize,
    ) -> WorkerMetricsSnapshot {
        WorkerMetricsSnapshot {
            active,
            active_workers,
            cached_pipelines,
            totals: self.totals.clone(),
            retried_count: self.retried,
            by_template: self
                .by_template
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        }
    }
}

/// Point-in-time view of a worker's state and counters.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerMetricsSnapshot {
    pub active: bool,
    pub active_workers: usize,
    pub cached_pipelines: usize,
    pub totals: PipelineMetrics,
    /// Failures rescheduled for another attempt. Also counted as errors.
    pub retried_count: u64,
    pub by_template: BTreeMap<String, PipelineMetrics>,
}
