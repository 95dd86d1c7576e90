//! Flow definitions and pipeline construction.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use super::Pipeline;
use crate::stage::{RegistryError, StageRegistry};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("Unknown flow: {0}")]
    UnknownFlow(String),
    #[error("Flow {0} has no modules")]
    EmptyFlow(String),
    #[error("Flow {flow} lists module {module} more than once")]
    DuplicateModule { flow: String, module: String },
    #[error("Flow {flow}: failed to build module {module}: {source}")]
    Module {
        flow: String,
        module: String,
        #[source]
        source: RegistryError,
    },
}

/// One entry of a flow's module list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowModule {
    /// Module id. Entries without one are skipped.
    #[serde(default)]
    pub id: Option<String>,
    /// Merged over the module's template-specific configuration.
    #[serde(default)]
    pub config_override: Option<Value>,
}

impl FlowModule {
    pub fn new(id: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            config_override: None,
        }
    }

    pub fn with_override(mut self, config: Value) -> Self {
        self.config_override = Some(config);
        self
    }
}

/// A named, ordered list of modules.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    #[serde(default)]
    pub modules: Vec<FlowModule>,
}

impl FlowDefinition {
    pub fn new(id: &str, modules: Vec<FlowModule>) -> Self {
        Self {
            id: id.to_string(),
            modules,
        }
    }
}

/// Flows plus the template -> flow mapping.
#[derive(Debug, Clone, Default)]
pub struct FlowCatalog {
    flows: HashMap<String, FlowDefinition>,
    /// Template id or `prefix*` pattern -> flow id.
    templates: HashMap<String, String>,
    default_flow: Option<String>,
}

impl FlowCatalog {
    pub fn new(
        flows: impl IntoIterator<Item = FlowDefinition>,
        templates: HashMap<String, String>,
        default_flow: Option<String>,
    ) -> Self {
        Self {
            flows: flows.into_iter().map(|f| (f.id.clone(), f)).collect(),
            templates,
            default_flow,
        }
    }

    pub fn flow(&self, flow_id: &str) -> Option<&FlowDefinition> {
        self.flows.get(flow_id)
    }

    /// Flow ids, sorted.
    pub fn flow_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.flows.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn default_flow(&self) -> Option<&str> {
        self.default_flow.as_deref()
    }

    /// Flow id for a template: exact match, else the longest matching
    /// `prefix*` pattern, else the default flow.
    pub fn resolve_flow_id(&self, template_id: &str) -> Option<&str> {
        if let Some(flow) = self.templates.get(template_id) {
            return Some(flow.as_str());
        }

        let wildcard = self
            .templates
            .iter()
            .filter_map(|(pattern, flow)| {
                let prefix = pattern.strip_suffix('*')?;
                template_id.starts_with(prefix).then_some((prefix.len(), flow))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, flow)| flow.as_str());
        if wildcard.is_some() {
            return wildcard;
        }

        debug!("No flow mapped for template {}", template_id);
        self.default_flow.as_deref()
    }
}

/// Builds pipelines from flow definitions.
#[derive(Clone)]
pub struct PipelineBuilder {
    registry: Arc<StageRegistry>,
}

impl PipelineBuilder {
    pub fn new(registry: Arc<StageRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// Instantiate every module of `flow` in order.
    ///
    /// Any module that fails to build fails the whole build. Stage outputs
    /// are keyed by module id, so a flow may list each module only once.
    pub fn build(
        &self,
        flow: &FlowDefinition,
        template_id: Option<&str>,
    ) -> Result<Pipeline, BuildError> {
        let mut stages = Vec::with_capacity(flow.modules.len());
        let mut seen = HashSet::new();

        for (position, module) in flow.modules.iter().enumerate() {
            let Some(module_id) = module.id.as_deref() else {
                warn!("Flow {}: skipping module #{} without an id", flow.id, position);
                continue;
            };
            if !seen.insert(module_id) {
                return Err(BuildError::DuplicateModule {
                    flow: flow.id.clone(),
                    module: module_id.to_string(),
                });
            }

            let stage = self
                .registry
                .create_from_config(module_id, template_id, module.config_override.as_ref())
                .map_err(|source| BuildError::Module {
                    flow: flow.id.clone(),
                    module: module_id.to_string(),
                    source,
                })?;
            stages.push(stage);
        }

        if stages.is_empty() {
            return Err(BuildError::EmptyFlow(flow.id.clone()));
        }

        debug!(
            "Built flow {} with {} stage(s) for template {:?}",
            flow.id,
            stages.len(),
            template_id
        );
        Ok(Pipeline::new(&flow.id, stages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Context, ContextStatus, NewContext};
    use crate::stage::ModuleConfig;
    use serde_json::json;

    fn catalog() -> FlowCatalog {
        FlowCatalog::new(
            vec![
                FlowDefinition::new("exact", vec![]),
                FlowDefinition::new("support", vec![]),
                FlowDefinition::new("support_vip", vec![]),
                FlowDefinition::new("fallback", vec![]),
            ],
            HashMap::from([
                ("welcome".to_string(), "exact".to_string()),
                ("support_*".to_string(), "support".to_string()),
                ("support_vip_*".to_string(), "support_vip".to_string()),
            ]),
            Some("fallback".to_string()),
        )
    }

    #[test]
    fn test_resolve_exact_prefix_default() {
        let catalog = catalog();
        assert_eq!(catalog.resolve_flow_id("welcome"), Some("exact"));
        assert_eq!(catalog.resolve_flow_id("support_billing"), Some("support"));
        assert_eq!(catalog.resolve_flow_id("support_vip_eu"), Some("support_vip"));
        assert_eq!(catalog.resolve_flow_id("other"), Some("fallback"));
    }

    #[test]
    fn test_resolve_without_default() {
        let catalog = FlowCatalog::new(vec![], HashMap::new(), None);
        assert_eq!(catalog.resolve_flow_id("anything"), None);
    }

    fn builder() -> PipelineBuilder {
        let mut registry = StageRegistry::with_builtins();
        registry.add_module(
            "greet",
            ModuleConfig::for_stage("template")
                .with_config(json!({"template": "Hi {{name}}"}))
                .with_template_override("formal", json!({"template": "Dear {{name}}"})),
        );
        PipelineBuilder::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_build_applies_template_overrides() {
        let flow = FlowDefinition::new(
            "greeting",
            vec![FlowModule::new("passthrough"), FlowModule::new("greet")],
        );
        let pipeline = builder().build(&flow, Some("formal")).unwrap();
        assert_eq!(pipeline.stage_names(), vec!["passthrough", "greet"]);

        let ctx = Context::from_new(
            "c1".into(),
            NewContext::for_template("formal").with_metadata(json!({"name": "Ada"})),
        );
        let ctx = pipeline.execute(ctx).await;
        assert_eq!(ctx.status, ContextStatus::Completed);
        assert_eq!(ctx.results.unwrap()["text"], "Dear Ada");
    }

    #[test]
    fn test_build_skips_modules_without_id() {
        let flow = FlowDefinition::new(
            "f",
            vec![FlowModule::default(), FlowModule::new("passthrough")],
        );
        let pipeline = builder().build(&flow, None).unwrap();
        assert_eq!(pipeline.len(), 1);
    }

    #[test]
    fn test_build_fails_whole_flow() {
        let flow = FlowDefinition::new(
            "f",
            vec![FlowModule::new("passthrough"), FlowModule::new("missing")],
        );
        let err = builder().build(&flow, None).err().unwrap();
        assert!(matches!(err, BuildError::Module { ref module, .. } if module == "missing"));
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_build_rejects_repeated_module() {
        let flow = FlowDefinition::new(
            "f",
            vec![
                FlowModule::new("greet"),
                FlowModule::new("passthrough"),
                FlowModule::new("greet").with_override(json!({"template": "Bye {{name}}"})),
            ],
        );
        let err = builder().build(&flow, None).err().unwrap();
        assert!(matches!(err, BuildError::DuplicateModule { ref module, .. } if module == "greet"));
    }

    #[test]
    fn test_build_empty_flow() {
        let flow = FlowDefinition::new("f", vec![FlowModule::default()]);
        assert!(matches!(
            builder().build(&flow, None),
            Err(BuildError::EmptyFlow(_))
        ));
    }

    #[test]
    fn test_flow_deserializes() {
        let flow: FlowDefinition = serde_json::from_value(json!({
            "id": "f",
            "modules": [{"id": "a", "config_override": {"x": 1}}, {}]
        }))
        .unwrap();
        assert_eq!(flow.modules.len(), 2);
        assert_eq!(flow.modules[0].config_override, Some(json!({"x": 1})));
        assert!(flow.modules[1].id.is_none());
    }
}
