//! Configuration loading.
//!
//! A config file is either given explicitly or discovered with `prefer`,
//! then parsed with serde according to its extension. Environment variables
//! override file values.

mod settings;

pub use settings::{
    default_worker_id, StoreBackend, StoreConfig, WorkerSettings, DEFAULT_DATABASE_FILENAME,
};

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::pipeline::{FlowCatalog, FlowDefinition};
use crate::poller::PollerSettings;
use crate::stage::{ModuleConfig, StageRegistry};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {format} config: {message}")]
    Parse { format: &'static str, message: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Complete worker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub store: StoreConfig,
    /// Module id -> module configuration.
    #[serde(default)]
    pub modules: HashMap<String, ModuleConfig>,
    #[serde(default)]
    pub flows: Vec<FlowDefinition>,
    /// Template id or `prefix*` pattern -> flow id.
    #[serde(default)]
    pub templates: HashMap<String, String>,
    #[serde(default)]
    pub default_flow: Option<String>,

    /// File this configuration was loaded from.
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

impl Config {
    /// Load from `path`, or discover a `ctxflow` config file with `prefer`.
    ///
    /// With no explicit path and nothing discovered, defaults plus
    /// environment overrides are used.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        if let Some(path) = path {
            return Self::load_from_path(path).await;
        }

        match prefer::load("ctxflow").await {
            Ok(discovered) => match discovered.source_path() {
                Some(path) => Self::load_from_path(path).await,
                None => Self::default_with_env(),
            },
            Err(e) => {
                debug!("No config file discovered: {}", e);
                Self::default_with_env()
            }
        }
    }

    /// Defaults with environment overrides applied.
    pub fn default_with_env() -> Result<Self, ConfigError> {
        let config = Self::default().with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file. JSON, TOML, and YAML are recognized by
    /// extension; anything else is parsed as JSON.
    pub async fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;

        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json");
        let mut config = Self::parse(&contents, ext)?;
        config.source_path = Some(path.to_path_buf());
        debug!("Loaded configuration from {}", path.display());

        // Overrides can make a valid file invalid
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse config text in the format named by `ext`.
    pub fn parse(contents: &str, ext: &str) -> Result<Self, ConfigError> {
        let config: Config = match ext {
            "toml" => toml::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "TOML",
                message: e.to_string(),
            })?,
            "yaml" | "yml" => serde_yaml::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "YAML",
                message: e.to_string(),
            })?,
            _ => serde_json::from_str(contents).map_err(|e| ConfigError::Parse {
                format: "JSON",
                message: e.to_string(),
            })?,
        };
        config.validate()?;
        Ok(config)
    }

    fn with_env_overrides(mut self) -> Self {
        self.worker = self.worker.with_env_overrides();
        self.store = self.store.with_env_overrides();
        self
    }

    /// Check cross-references between sections.
    ///
    /// Dangling template mappings are only warned about; a missing default
    /// flow or an unusable worker setting is an error.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker.max_processing_attempts < 1 {
            return Err(ConfigError::Invalid(
                "worker.max_processing_attempts must be at least 1".into(),
            ));
        }
        if self.worker.max_concurrent == 0 {
            return Err(ConfigError::Invalid(
                "worker.max_concurrent must be at least 1".into(),
            ));
        }
        for (name, seconds) in self.worker.durations() {
            if !seconds.is_finite() || seconds < 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "worker.{} must be a finite, non-negative number of seconds (got {})",
                    name, seconds
                )));
            }
        }

        let known = |id: &str| self.flows.iter().any(|f| f.id == id);
        if let Some(default_flow) = &self.default_flow {
            if !known(default_flow) {
                return Err(ConfigError::Invalid(format!(
                    "default_flow '{}' is not a configured flow",
                    default_flow
                )));
            }
        }
        for (template, flow) in &self.templates {
            if !known(flow) {
                warn!("Template {} maps to unknown flow {}", template, flow);
            }
        }
        Ok(())
    }

    /// Directory of the config file, if loaded from one.
    pub fn base_dir(&self) -> Option<&Path> {
        self.source_path.as_deref().and_then(Path::parent)
    }

    pub fn flow_catalog(&self) -> FlowCatalog {
        FlowCatalog::new(
            self.flows.iter().cloned(),
            self.templates.clone(),
            self.default_flow.clone(),
        )
    }

    /// Built-in stages plus the configured modules.
    pub fn stage_registry(&self) -> StageRegistry {
        let mut registry = StageRegistry::with_builtins();
        registry.add_modules(&self.modules);
        registry
    }

    pub fn poller_settings(&self) -> PollerSettings {
        self.worker.poller_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const TOML: &str = r#"
default_flow = "general"

[worker]
worker_id = "w-1"
batch_processing_enabled = true
batch_size = 4

[store]
backend = "database"
database_url = "sqlite::memory:"
lock_backend = "database"

[modules.greet]
stage = "template"
config = { output_key = "greeting" }
prompts = { template = "Hello {{name}}" }

[[flows]]
id = "general"
modules = [{ id = "greet" }]

[templates]
"support_*" = "general"
"#;

    #[test]
    fn test_parse_toml() {
        let config = Config::parse(TOML, "toml").unwrap();
        assert_eq!(config.worker.worker_id, "w-1");
        assert!(config.worker.batch_processing_enabled);
        assert_eq!(config.worker.batch_size, 4);
        assert_eq!(config.store.lock_backend.as_deref(), Some("database"));
        assert_eq!(config.flows[0].modules[0].id.as_deref(), Some("greet"));
        assert_eq!(
            config.flow_catalog().resolve_flow_id("support_billing"),
            Some("general")
        );
        assert!(config.stage_registry().create_from_config("greet", None, None).is_ok());
    }

    #[test]
    fn test_parse_yaml_and_json() {
        let yaml = "flows:\n  - id: f\n    modules:\n      - id: passthrough\ntemplates:\n  t: f\n";
        let config = Config::parse(yaml, "yml").unwrap();
        assert_eq!(config.templates["t"], "f");

        let json = r#"{"store": {"backend": "remote", "remote_url": "http://tasks"}}"#;
        let config = Config::parse(json, "json").unwrap();
        assert_eq!(config.store.backend, StoreBackend::Remote);
        assert_eq!(config.worker.max_processing_attempts, 3);
    }

    #[test]
    fn test_unknown_default_flow_rejected() {
        let err = Config::parse(r#"{"default_flow": "missing"}"#, "json").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_non_finite_durations_rejected() {
        for worker in ["poll_interval = inf", "batch_wait_time = nan", "retry_delay = -1.0"] {
            let err = Config::parse(&format!("[worker]\n{}\n", worker), "toml").unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{}", worker);
        }

        // Values set after parsing, as environment overrides are
        let mut config = Config::parse("", "toml").unwrap();
        config.worker.max_retry_delay = f64::INFINITY;
        assert!(config.validate().is_err());
        config.worker.max_retry_delay = 0.5;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_error_names_format() {
        let err = Config::parse("not = [valid", "toml").unwrap_err();
        assert!(err.to_string().contains("TOML"));
    }

    #[tokio::test]
    async fn test_load_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ctxflow.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(TOML.as_bytes())
            .unwrap();

        let config = Config::load(Some(&path)).await.unwrap();
        assert_eq!(config.source_path.as_deref(), Some(path.as_path()));
        assert_eq!(config.base_dir(), Some(dir.path()));
    }

    #[tokio::test]
    async fn test_missing_file_is_read_error() {
        let err = Config::load(Some(Path::new("/nonexistent/ctxflow.toml")))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
