//! Stages compiled into every registry.
//!
//! - `passthrough`: emits a configured output, or the context metadata.
//! - `template`: renders a prompt template against metadata and earlier
//!   stage outputs. Batches natively.
//! - `http`: POSTs the context to an endpoint and emits the JSON response.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::registry::{RegistryError, StageRegistry};
use super::{Stage, StageError, StageSpec};
use crate::models::Context;

/// Register all built-in stages.
pub fn register_builtins(registry: &mut StageRegistry) {
    registry.register("passthrough", |spec| {
        Ok(Box::new(PassthroughStage::from_spec(spec)?) as Box<dyn Stage>)
    });
    registry.register("template", |spec| {
        Ok(Box::new(TemplateStage::from_spec(spec)?) as Box<dyn Stage>)
    });
    registry.register("http", |spec| {
        Ok(Box::new(HttpStage::from_spec(spec)?) as Box<dyn Stage>)
    });
}

#[derive(Debug, Default, Deserialize)]
struct PassthroughConfig {
    #[serde(default)]
    output: Option<Value>,
}

/// Emits `config.output`, or the context metadata when unset.
pub struct PassthroughStage {
    name: String,
    output: Option<Value>,
    continue_on_error: bool,
}

impl PassthroughStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Self, RegistryError> {
        let config: PassthroughConfig = spec.parse_config()?;
        Ok(Self {
            name: spec.name.clone(),
            output: config.output,
            continue_on_error: spec.continue_on_error,
        })
    }
}

#[async_trait]
impl Stage for PassthroughStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn continue_on_error(&self) -> bool {
        self.continue_on_error
    }

    async fn process(&self, ctx: &Context) -> Result<Value, StageError> {
        Ok(self.output.clone().unwrap_or_else(|| ctx.metadata.clone()))
    }
}

/// Prompt name the template stage renders.
pub const TEMPLATE_PROMPT: &str = "template";

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("placeholder pattern is valid")
    })
}

/// Resolve a placeholder path.
///
/// `name` reads a metadata field; `stage.field.sub` reads from a prior
/// stage's output when `stage` ran in this pass.
fn resolve<'a>(ctx: &'a Context, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let head = parts.next()?;

    let mut value = match ctx.stage_output(head) {
        Some(output) => output,
        None => return lookup(ctx.metadata_field(head)?, parts),
    };
    for part in parts {
        value = value.get(part)?;
    }
    Some(value)
}

fn lookup<'a, 'p>(mut value: &'a Value, parts: impl Iterator<Item = &'p str>) -> Option<&'a Value> {
    for part in parts {
        value = value.get(part)?;
    }
    Some(value)
}

fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render `template` against a context. Unknown placeholders are an error.
pub fn render(template: &str, ctx: &Context) -> Result<String, StageError> {
    let mut missing = Vec::new();
    let rendered = placeholder_regex().replace_all(template, |caps: &regex::Captures| {
        let path = &caps[1];
        match resolve(ctx, path) {
            Some(value) => render_value(value),
            None => {
                missing.push(path.to_string());
                String::new()
            }
        }
    });

    if !missing.is_empty() {
        return Err(StageError::new(format!(
            "No value for placeholder(s): {}",
            missing.join(", ")
        )));
    }
    Ok(rendered.into_owned())
}

#[derive(Debug, Default, Deserialize)]
struct TemplateConfig {
    #[serde(default)]
    template: Option<String>,
    /// Key of the rendered text in the output object.
    #[serde(default = "default_output_key")]
    output_key: String,
}

fn default_output_key() -> String {
    "text".to_string()
}

/// Renders a prompt template.
///
/// The template comes from the injected `template` prompt, falling back to
/// `config.template`.
pub struct TemplateStage {
    name: String,
    template: Option<String>,
    output_key: String,
    continue_on_error: bool,
}

impl TemplateStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Self, RegistryError> {
        let config: TemplateConfig = spec.parse_config()?;
        Ok(Self {
            name: spec.name.clone(),
            template: config.template,
            output_key: config.output_key,
            continue_on_error: spec.continue_on_error,
        })
    }

    fn render_one(&self, ctx: &Context) -> Result<Value, StageError> {
        let template = self
            .template
            .as_deref()
            .ok_or_else(|| StageError::new("No template configured"))?;
        let text = render(template, ctx)?;
        let mut output = serde_json::Map::new();
        output.insert(self.output_key.clone(), Value::String(text));
        Ok(Value::Object(output))
    }
}

#[async_trait]
impl Stage for TemplateStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn continue_on_error(&self) -> bool {
        self.continue_on_error
    }

    async fn process(&self, ctx: &Context) -> Result<Value, StageError> {
        self.render_one(ctx)
    }

    fn supports_batch(&self) -> bool {
        true
    }

    async fn process_batch(
        &self,
        contexts: &[Context],
    ) -> Result<Vec<Result<Value, StageError>>, StageError> {
        if self.template.is_none() {
            return Err(StageError::new("No template configured"));
        }
        Ok(contexts.iter().map(|ctx| self.render_one(ctx)).collect())
    }

    fn accepts_prompts(&self) -> bool {
        true
    }

    fn set_prompts(&mut self, mut prompts: HashMap<String, String>) {
        if let Some(template) = prompts.remove(TEMPLATE_PROMPT) {
            self.template = Some(template);
        }
    }
}

#[derive(Debug, Deserialize)]
struct HttpConfig {
    url: String,
    #[serde(default = "default_http_timeout")]
    timeout_secs: u64,
    #[serde(default)]
    headers: HashMap<String, String>,
}

fn default_http_timeout() -> u64 {
    60
}

#[derive(Debug, Serialize)]
struct HttpStageRequest<'a> {
    context_id: &'a str,
    template_id: Option<&'a str>,
    organization_id: Option<&'a str>,
    metadata: &'a Value,
    stages: &'a std::collections::BTreeMap<String, Value>,
}

/// POSTs the context to `config.url`.
///
/// Server errors, 429 and network failures are retry-recommended; other
/// non-2xx responses are permanent.
pub struct HttpStage {
    name: String,
    client: Client,
    url: String,
    headers: HashMap<String, String>,
    continue_on_error: bool,
}

impl HttpStage {
    pub fn from_spec(spec: &StageSpec) -> Result<Self, RegistryError> {
        let config: HttpConfig = spec.parse_config()?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RegistryError::InvalidConfig {
                module: spec.name.clone(),
                message: e.to_string(),
            })?;
        Ok(Self {
            name: spec.name.clone(),
            client,
            url: config.url,
            headers: config.headers,
            continue_on_error: spec.continue_on_error,
        })
    }
}

#[async_trait]
impl Stage for HttpStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn continue_on_error(&self) -> bool {
        self.continue_on_error
    }

    async fn process(&self, ctx: &Context) -> Result<Value, StageError> {
        let body = HttpStageRequest {
            context_id: &ctx.id,
            template_id: ctx.template_id.as_deref(),
            organization_id: ctx.organization_id.as_deref(),
            metadata: &ctx.metadata,
            stages: &ctx.intermediate,
        };

        let mut request = self.client.post(&self.url).json(&body);
        for (key, value) in &self.headers {
            request = request.header(key, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StageError::transient(format!("Request to {} failed: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            let message = format!("{} returned {}", self.url, status);
            return Err(
                if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                    StageError::transient(message)
                } else {
                    StageError::new(message)
                },
            );
        }

        let text = response
            .text()
            .await
            .map_err(|e| StageError::transient(format!("Failed to read response: {}", e)))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text)
            .map_err(|e| StageError::new(format!("Invalid JSON from {}: {}", self.url, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewContext;
    use httpmock::prelude::*;
    use serde_json::json;

    fn context() -> Context {
        Context::from_new(
            "c1".into(),
            NewContext::for_template("welcome").with_metadata(json!({
                "name": "Ada",
                "account": {"plan": "pro"},
                "count": 3
            })),
        )
    }

    fn registry() -> StageRegistry {
        StageRegistry::with_builtins()
    }

    #[tokio::test]
    async fn test_passthrough_defaults_to_metadata() {
        let stage = registry().create_from_config("passthrough", None, None).unwrap();
        let ctx = context();
        assert_eq!(stage.process(&ctx).await.unwrap(), ctx.metadata);

        let fixed = registry()
            .create_from_config("passthrough", None, Some(&json!({"output": {"ok": true}})))
            .unwrap();
        assert_eq!(fixed.process(&ctx).await.unwrap(), json!({"ok": true}));
    }

    #[test]
    fn test_render_metadata_and_stage_outputs() {
        let mut ctx = context();
        ctx.intermediate
            .insert("lookup".into(), json!({"city": "London"}));

        let text = render(
            "Hi {{ name }} ({{account.plan}}, {{count}}) from {{lookup.city}}",
            &ctx,
        )
        .unwrap();
        assert_eq!(text, "Hi Ada (pro, 3) from London");
    }

    #[test]
    fn test_render_missing_placeholder() {
        let err = render("Hi {{nickname}}", &context()).unwrap_err();
        assert!(err.message.contains("nickname"));
        assert!(!err.retry_recommended);
    }

    #[tokio::test]
    async fn test_template_prompt_injection() {
        let mut registry = registry();
        registry.add_module(
            "greeting",
            crate::stage::ModuleConfig::for_stage("template")
                .with_prompt(TEMPLATE_PROMPT, "Hello {{name}}"),
        );
        let stage = registry.create_from_config("greeting", None, None).unwrap();
        assert!(stage.supports_batch());

        let out = stage.process_batch(&[context(), context()]).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().unwrap(), &json!({"text": "Hello Ada"}));
    }

    #[tokio::test]
    async fn test_template_without_prompt_fails_batch() {
        let stage = registry().create_from_config("template", None, None).unwrap();
        assert!(stage.process_batch(&[context()]).await.is_err());
    }

    #[test]
    fn test_http_requires_url() {
        let result = registry().create_from_config("http", None, None);
        assert!(matches!(result, Err(RegistryError::InvalidConfig { .. })));
    }

    #[tokio::test]
    async fn test_http_stage_posts_context() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/render")
                    .header("x-api-key", "secret")
                    .json_body_partial(r#"{"context_id": "c1", "template_id": "welcome"}"#);
                then.status(200).json_body(json!({"rendered": true}));
            })
            .await;

        let stage = registry()
            .create_from_config(
                "http",
                None,
                Some(&json!({"url": server.url("/render"), "headers": {"x-api-key": "secret"}})),
            )
            .unwrap();
        let out = stage.process(&context()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(out, json!({"rendered": true}));
    }

    #[tokio::test]
    async fn test_http_error_classification() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/busy");
                then.status(503);
            })
            .await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/bad");
                then.status(400);
            })
            .await;

        let stage_for = |path: &str| {
            registry()
                .create_from_config("http", None, Some(&json!({"url": server.url(path)})))
                .unwrap()
        };

        let busy = stage_for("/busy").process(&context()).await.unwrap_err();
        assert!(busy.retry_recommended);
        let bad = stage_for("/bad").process(&context()).await.unwrap_err();
        assert!(!bad.retry_recommended);
    }
}
