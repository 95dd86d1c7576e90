//! CLI command implementations.

use std::sync::Arc;

use anyhow::{bail, Context as _};

use crate::config::{Config, StoreBackend};
use crate::models::NewContext;
use crate::repository::migrations::run_migrations_for_url;
use crate::repository::util::redact_url_password;
use crate::store::{open_store, ClaimFilter, WorkItemStore};
use crate::worker::WorkerService;

/// Arguments of `ctxflow submit`.
pub struct Submission {
    pub template: String,
    pub priority: i32,
    pub metadata: Option<String>,
    pub batch_id: Option<String>,
    pub organization: Option<String>,
    pub service_type: Option<String>,
    pub tags: Vec<String>,
}

impl Submission {
    fn into_new_context(self) -> anyhow::Result<NewContext> {
        let metadata = match self.metadata {
            Some(raw) => {
                let value: serde_json::Value =
                    serde_json::from_str(&raw).context("--metadata is not valid JSON")?;
                if !value.is_object() {
                    bail!("--metadata must be a JSON object");
                }
                value
            }
            None => serde_json::json!({}),
        };

        let mut new = NewContext::for_template(&self.template)
            .with_priority(self.priority)
            .with_metadata(metadata);
        new.batch_id = self.batch_id;
        new.organization_id = self.organization;
        new.service_type = self.service_type;
        new.tags = self.tags;
        Ok(new)
    }
}

async fn store(config: &Config) -> anyhow::Result<Arc<dyn WorkItemStore>> {
    config
        .store
        .ensure_directories()
        .context("Failed to create data directory")?;
    Ok(open_store(&config.store, &config.worker).await?)
}

/// Run the worker until Ctrl-C, then drain.
pub async fn cmd_run(config: &Config) -> anyhow::Result<()> {
    let store = store(config).await?;
    let catalog = Arc::new(config.flow_catalog());
    if catalog.flow_ids().is_empty() {
        tracing::warn!("No flows configured; every claimed context will fail validation");
    }

    let worker = WorkerService::new(
        store,
        catalog,
        Arc::new(config.stage_registry()),
        config.worker.clone(),
    );
    println!("→ Worker {} running (Ctrl-C to stop)", worker.worker_id());
    worker.start().await;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    println!("→ Stopping, waiting for in-flight work...");
    worker.stop().await;

    let metrics = worker.metrics().await;
    println!("{}", serde_json::to_string_pretty(&metrics)?);
    Ok(())
}

/// Create one pending context and print its id.
pub async fn cmd_submit(config: &Config, submission: Submission) -> anyhow::Result<()> {
    let new = submission.into_new_context()?;
    let store = store(config).await?;
    let id = store.create_context(new).await?;
    println!("{}", id);
    Ok(())
}

pub async fn cmd_show(config: &Config, id: &str) -> anyhow::Result<()> {
    let store = store(config).await?;
    match store.get_context(id).await? {
        Some(ctx) => {
            println!("{}", serde_json::to_string_pretty(&ctx)?);
            Ok(())
        }
        None => bail!("Context not found: {}", id),
    }
}

pub async fn cmd_status(config: &Config) -> anyhow::Result<()> {
    let store = store(config).await?;
    let mut filter = ClaimFilter::new(config.worker.max_processing_attempts);
    filter.service_type = config.worker.service_type.clone();
    filter.organization_id = config.worker.organization_id.clone();
    let pending = store.count_pending(&filter).await?;

    match config.store.backend {
        StoreBackend::Database => println!(
            "Store:    database {}",
            redact_url_password(&config.store.database_url())
        ),
        StoreBackend::Remote => println!(
            "Store:    remote {}",
            config.store.remote_url.as_deref().unwrap_or("(unset)")
        ),
    }
    println!("Pending:  {}", pending);

    let catalog = config.flow_catalog();
    println!("Flows:");
    for flow_id in catalog.flow_ids() {
        let modules = catalog
            .flow(flow_id)
            .map(|f| {
                f.modules
                    .iter()
                    .filter_map(|m| m.id.as_deref())
                    .collect::<Vec<_>>()
                    .join(" → ")
            })
            .unwrap_or_default();
        let marker = if catalog.default_flow() == Some(flow_id) {
            " (default)"
        } else {
            ""
        };
        println!("  {}{}: {}", flow_id, marker, modules);
    }

    let mut templates: Vec<_> = config.templates.iter().collect();
    templates.sort();
    if !templates.is_empty() {
        println!("Templates:");
        for (pattern, flow) in templates {
            println!("  {} → {}", pattern, flow);
        }
    }
    Ok(())
}

pub async fn cmd_migrate(config: &Config) -> anyhow::Result<()> {
    if config.store.backend != StoreBackend::Database {
        bail!("migrate applies to the database backend only");
    }
    config
        .store
        .ensure_directories()
        .context("Failed to create data directory")?;
    let url = config.store.database_url();
    println!("→ Migrating {}", redact_url_password(&url));
    run_migrations_for_url(&url).await?;
    println!("✓ Schema is up to date");
    Ok(())
}
