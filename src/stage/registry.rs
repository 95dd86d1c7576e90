//! Stage registry: factories by key plus per-module configuration.
//!
//! Factories are registered in code at startup. Modules come from
//! configuration and name the factory they use, a base config, per-template
//! overrides, and prompt templates.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use super::builtin;
use super::{deep_merge, Stage, StageSpec};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Unknown module: {0}")]
    UnknownModule(String),
    #[error("Module {module} uses unregistered stage '{stage}'")]
    UnknownStage { module: String, stage: String },
    #[error("Invalid configuration for {module}: {message}")]
    InvalidConfig { module: String, message: String },
}

/// Builds a stage from its merged spec.
pub type StageFactory =
    Arc<dyn Fn(&StageSpec) -> Result<Box<dyn Stage>, RegistryError> + Send + Sync>;

/// Configuration of one module (a configured use of a stage factory).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Factory key. Defaults to the module id.
    #[serde(default)]
    pub stage: Option<String>,
    /// Base configuration.
    #[serde(default)]
    pub config: Value,
    /// Template id -> override merged over `config`.
    #[serde(default)]
    pub template_overrides: HashMap<String, Value>,
    /// Prompt name -> template text.
    #[serde(default)]
    pub prompts: HashMap<String, String>,
    /// Template id -> prompts replacing entries of `prompts`.
    #[serde(default)]
    pub template_prompts: HashMap<String, HashMap<String, String>>,
}

impl ModuleConfig {
    pub fn for_stage(stage: &str) -> Self {
        Self {
            stage: Some(stage.to_string()),
            ..Default::default()
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    pub fn with_template_override(mut self, template_id: &str, config: Value) -> Self {
        self.template_overrides
            .insert(template_id.to_string(), config);
        self
    }

    pub fn with_prompt(mut self, name: &str, text: &str) -> Self {
        self.prompts.insert(name.to_string(), text.to_string());
        self
    }
}

/// Registry of stage factories and module configurations.
#[derive(Clone, Default)]
pub struct StageRegistry {
    factories: HashMap<String, StageFactory>,
    modules: HashMap<String, ModuleConfig>,
}

impl StageRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the built-in stages registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        builtin::register_builtins(&mut registry);
        registry
    }

    /// Register a stage factory under `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&StageSpec) -> Result<Box<dyn Stage>, RegistryError> + Send + Sync + 'static,
    {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    /// Add or replace a module configuration.
    pub fn add_module(&mut self, module_id: &str, module: ModuleConfig) {
        self.modules.insert(module_id.to_string(), module);
    }

    /// Add all module configurations from a map.
    pub fn add_modules(&mut self, modules: &HashMap<String, ModuleConfig>) {
        for (id, module) in modules {
            self.add_module(id, module.clone());
        }
    }

    pub fn has_stage(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered factory keys, sorted.
    pub fn stage_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build a stage for `module_id`.
    ///
    /// The configuration is the module's base config, deep-merged with the
    /// override for `template_id`, then with `overrides`. A module id with no
    /// configuration entry but a matching factory key uses an empty config.
    pub fn create_from_config(
        &self,
        module_id: &str,
        template_id: Option<&str>,
        overrides: Option<&Value>,
    ) -> Result<Box<dyn Stage>, RegistryError> {
        let fallback;
        let module = match self.modules.get(module_id) {
            Some(m) => m,
            None if self.factories.contains_key(module_id) => {
                fallback = ModuleConfig::default();
                &fallback
            }
            None => return Err(RegistryError::UnknownModule(module_id.to_string())),
        };

        let stage_key = module.stage.as_deref().unwrap_or(module_id);
        let factory =
            self.factories
                .get(stage_key)
                .ok_or_else(|| RegistryError::UnknownStage {
                    module: module_id.to_string(),
                    stage: stage_key.to_string(),
                })?;

        let mut config = match &module.config {
            Value::Null => Value::Object(Default::default()),
            base => base.clone(),
        };
        if let Some(template_override) = template_id.and_then(|t| module.template_overrides.get(t))
        {
            deep_merge(&mut config, template_override);
        }
        if let Some(overrides) = overrides {
            deep_merge(&mut config, overrides);
        }

        let spec = StageSpec::new(module_id, config);
        let mut stage = factory(&spec)?;

        if stage.accepts_prompts() {
            let mut prompts = module.prompts.clone();
            if let Some(template_prompts) =
                template_id.and_then(|t| module.template_prompts.get(t))
            {
                prompts.extend(template_prompts.clone());
            }
            if !prompts.is_empty() {
                stage.set_prompts(prompts);
            }
        }

        debug!(
            "Created stage {} ({}) for template {:?}",
            module_id, stage_key, template_id
        );
        Ok(stage)
    }
}
