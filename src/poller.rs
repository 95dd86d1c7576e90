//! Context poller: claims eligible work from the store, singly or in
//! template-affine batches, and resolves the flow for what it claimed.
//!
//! The poller is single-consumer; batch accumulation state lives in the
//! poller between calls, so a `next_batch` future dropped mid-wait loses no
//! claimed items.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::models::Context;
use crate::pipeline::FlowCatalog;
use crate::store::{ClaimFilter, StoreError, WorkItemStore};

/// Poll parameters.
#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub max_processing_attempts: i32,
    /// Items attempted more recently than this are not proposed.
    pub retry_delay: Duration,
    /// Pause between store queries while accumulating a batch.
    pub poll_interval: Duration,
    pub service_type: Option<String>,
    pub organization_id: Option<String>,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            max_processing_attempts: 3,
            retry_delay: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            service_type: None,
            organization_id: None,
        }
    }
}

/// Claimed contexts plus the flow resolved for their template.
#[derive(Debug)]
pub struct PolledWork {
    pub contexts: Vec<Context>,
    /// `None` when the template is missing or maps to no flow.
    pub flow_id: Option<String>,
}

impl PolledWork {
    pub fn template_id(&self) -> Option<&str> {
        self.contexts.first().and_then(|c| c.template_id.as_deref())
    }
}

/// Partially accumulated batch.
#[derive(Debug, Default)]
struct BatchAccumulator {
    contexts: Vec<Context>,
    started: Option<Instant>,
    template_id: Option<String>,
}

impl BatchAccumulator {
    fn take(&mut self) -> Vec<Context> {
        self.started = None;
        self.template_id = None;
        std::mem::take(&mut self.contexts)
    }
}

pub struct ContextPoller {
    store: Arc<dyn WorkItemStore>,
    catalog: Arc<FlowCatalog>,
    settings: PollerSettings,
    batch: BatchAccumulator,
}

impl ContextPoller {
    pub fn new(
        store: Arc<dyn WorkItemStore>,
        catalog: Arc<FlowCatalog>,
        settings: PollerSettings,
    ) -> Self {
        Self {
            store,
            catalog,
            settings,
            batch: BatchAccumulator::default(),
        }
    }

    pub fn settings(&self) -> &PollerSettings {
        &self.settings
    }

    /// Number of claimed contexts waiting in the current batch.
    pub fn pending_batch_len(&self) -> usize {
        self.batch.contexts.len()
    }

    /// Eligibility filter for a query issued now.
    pub fn filter(&self) -> ClaimFilter {
        let mut filter = ClaimFilter::new(self.settings.max_processing_attempts)
            .with_retry_delay(self.settings.retry_delay);
        filter.service_type = self.settings.service_type.clone();
        filter.organization_id = self.settings.organization_id.clone();
        filter
    }

    /// Claim the single highest-priority eligible context.
    pub async fn next_single(&mut self) -> Result<Option<Context>, StoreError> {
        let filter = self.filter();
        self.store.claim_next_pending(&filter).await
    }

    /// Accumulate up to `batch_size` contexts sharing one template.
    ///
    /// Returns when the batch is full or `max_wait` has passed since
    /// accumulation began; empty if nothing was claimed in that window.
    pub async fn next_batch(
        &mut self,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<Vec<Context>, StoreError> {
        let batch_size = batch_size.max(1);
        let started = *self.batch.started.get_or_insert_with(Instant::now);

        loop {
            let wanted = batch_size.saturating_sub(self.batch.contexts.len());
            if wanted == 0 {
                break;
            }

            let mut filter = self.filter();
            if let Some(template_id) = &self.batch.template_id {
                filter.template_id = Some(template_id.clone());
            }

            let claimed = self.store.claim_batch(&filter, wanted).await?;
            if !claimed.is_empty() {
                debug!("Batch accumulated {} more context(s)", claimed.len());
                let untemplated = self.batch.contexts.is_empty()
                    && claimed.first().is_some_and(|c| c.template_id.is_none());
                if self.batch.template_id.is_none() {
                    self.batch.template_id =
                        claimed.first().and_then(|c| c.template_id.clone());
                }
                self.batch.contexts.extend(claimed);
                // Nothing to group an untemplated item with
                if untemplated {
                    break;
                }
            }

            let elapsed = started.elapsed();
            if self.batch.contexts.len() >= batch_size || elapsed >= max_wait {
                break;
            }
            tokio::time::sleep(self.settings.poll_interval.min(max_wait - elapsed)).await;
        }

        Ok(self.batch.take())
    }

    /// [`Self::next_single`] plus flow resolution.
    pub async fn next_with_flow(&mut self) -> Result<Option<PolledWork>, StoreError> {
        Ok(self
            .next_single()
            .await?
            .map(|ctx| self.with_flow(vec![ctx])))
    }

    /// [`Self::next_batch`] plus flow resolution for the batch's template.
    pub async fn next_batch_with_flow(
        &mut self,
        batch_size: usize,
        max_wait: Duration,
    ) -> Result<Option<PolledWork>, StoreError> {
        let contexts = self.next_batch(batch_size, max_wait).await?;
        if contexts.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.with_flow(contexts)))
    }

    fn with_flow(&self, contexts: Vec<Context>) -> PolledWork {
        let template_id = contexts.first().and_then(|c| c.template_id.as_deref());
        let flow_id = template_id.and_then(|t| {
            let flow = self.catalog.resolve_flow_id(t);
            if flow.is_none() {
                warn!("No flow for template {} and no default flow", t);
            }
            flow.map(str::to_string)
        });
        PolledWork { contexts, flow_id }
    }

    /// Drop a partially accumulated batch, releasing its claims.
    ///
    /// Every claim is released even if some releases fail; the first failure
    /// is returned afterwards.
    pub async fn reset_batch(&mut self) -> Result<usize, StoreError> {
        let contexts = self.batch.take();
        let mut first_error = None;
        for ctx in &contexts {
            if let Err(e) = self.store.release_claim(&ctx.id).await {
                warn!("Failed to release context {}: {}", ctx.id, e);
                first_error.get_or_insert(e);
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        if !contexts.is_empty() {
            debug!("Released {} accumulated context(s)", contexts.len());
        }
        Ok(contexts.len())
    }
}
