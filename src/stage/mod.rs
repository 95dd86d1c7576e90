//! Processing stages and their registry.
//!
//! A stage is one configurable unit of a pipeline. Stages are constructed by
//! factories registered under a string key, from configuration merged per
//! template (see [`StageRegistry::create_from_config`]).

pub mod builtin;
mod merge;
mod registry;

pub use merge::deep_merge;
pub use registry::{ModuleConfig, RegistryError, StageFactory, StageRegistry};

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::models::Context;

/// Failure of a stage on one item (or on a whole batch).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StageError {
    pub message: String,
    /// Whether the failure is transient and the item may be retried.
    pub retry_recommended: bool,
}

impl StageError {
    /// A permanent failure.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_recommended: false,
        }
    }

    /// A transient failure worth retrying.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_recommended: true,
        }
    }
}

/// Everything a factory needs to build one stage instance.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// Stage name, used as the key for its output and errors.
    pub name: String,
    /// Fully merged configuration.
    pub config: Value,
    pub continue_on_error: bool,
}

impl StageSpec {
    pub fn new(name: &str, config: Value) -> Self {
        let continue_on_error = config
            .get("continue_on_error")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        Self {
            name: name.to_string(),
            config,
            continue_on_error,
        }
    }

    /// Deserialize the configuration into a stage-specific struct.
    pub fn parse_config<T: serde::de::DeserializeOwned>(&self) -> Result<T, RegistryError> {
        let config = match &self.config {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(config).map_err(|e| RegistryError::InvalidConfig {
            module: self.name.clone(),
            message: e.to_string(),
        })
    }
}

/// A unit of pipeline work.
#[async_trait]
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    /// Whether a failure here lets the pipeline continue with the next stage.
    fn continue_on_error(&self) -> bool {
        false
    }

    /// Process one context. Prior stage outputs are in `ctx.intermediate`.
    async fn process(&self, ctx: &Context) -> Result<Value, StageError>;

    /// Whether [`Stage::process_batch`] is a native batch implementation.
    fn supports_batch(&self) -> bool {
        false
    }

    /// Process several contexts at once, returning one result per input in
    /// order. An `Err` fails the whole batch.
    async fn process_batch(
        &self,
        contexts: &[Context],
    ) -> Result<Vec<Result<Value, StageError>>, StageError> {
        let mut results = Vec::with_capacity(contexts.len());
        for ctx in contexts {
            results.push(self.process(ctx).await);
        }
        Ok(results)
    }

    /// Whether the stage takes prompt templates from configuration.
    fn accepts_prompts(&self) -> bool {
        false
    }

    fn set_prompts(&mut self, _prompts: HashMap<String, String>) {}
}
