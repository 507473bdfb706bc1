use crate::conversation::prompt::PersonaSet;
use crate::errors::ConfigError;
use crate::providers::llm::openai::OpenAiCompatClient;
use crate::providers::llm::ModelRegistry;
use crate::retry::RetryPolicy;
use crate::stats::ScoringMode;
use crate::store::codec::OutputFormat;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalConfig {
    pub version: u32,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub models: BTreeMap<String, ModelConfig>,
    pub judge: JudgeConfig,
    /// Prompt templates by persona name. Empty means the built-in set.
    #[serde(default)]
    pub personas: BTreeMap<String, String>,
    #[serde(default)]
    pub settings: Settings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Environment variable holding the key, read at load time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: String,
    /// Upstream model name. Defaults to the config key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Merged into every request body.
    #[serde(default)]
    pub extra_body: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Key of a `models` entry.
    pub model: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingMediaPolicy {
    /// Fail the whole item before any model call.
    #[default]
    SkipItem,
    /// Drop the missing references and evaluate without them.
    DropReference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: f64,
    /// Overrides every per-model timeout when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub output_format: OutputFormat,
    #[serde(default)]
    pub scoring: ScoringMode,
    #[serde(default)]
    pub missing_media: MissingMediaPolicy,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay_secs(),
            timeout_secs: None,
            workers: default_workers(),
            batch_size: default_batch_size(),
            output_format: OutputFormat::default(),
            scoring: ScoringMode::default(),
            missing_media: MissingMediaPolicy::default(),
            output_dir: default_output_dir(),
        }
    }
}

fn default_max_tokens() -> u32 {
    8192
}
fn default_timeout_secs() -> u64 {
    600
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_secs() -> f64 {
    1.0
}
fn default_workers() -> usize {
    1
}
fn default_batch_size() -> usize {
    10
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

pub fn load_config(path: &Path) -> Result<EvalConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let mut cfg: EvalConfig = serde_yaml::from_str(&raw)?;
    if cfg.version != SUPPORTED_CONFIG_VERSION {
        return Err(ConfigError::Version {
            found: cfg.version,
            supported: SUPPORTED_CONFIG_VERSION,
        });
    }
    cfg.resolve_api_keys();
    cfg.validate()?;
    Ok(cfg)
}

impl EvalConfig {
    fn resolve_api_keys(&mut self) {
        for (name, provider) in &mut self.providers {
            if provider.api_key.is_some() {
                continue;
            }
            let Some(var) = provider.api_key_env.as_deref() else {
                continue;
            };
            match std::env::var(var) {
                Ok(key) => provider.api_key = Some(key),
                Err(_) => warn!(provider = %name, env = var, "API key variable is not set"),
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (id, model) in &self.models {
            if !self.providers.contains_key(&model.provider) {
                return Err(ConfigError::Invalid(format!(
                    "model '{}' references unknown provider '{}'",
                    id, model.provider
                )));
            }
        }
        if !self.models.contains_key(&self.judge.model) {
            return Err(ConfigError::Invalid(format!(
                "judge model '{}' is not defined under models",
                self.judge.model
            )));
        }
        if self.settings.batch_size == 0 {
            return Err(ConfigError::Invalid("settings.batch_size must be at least 1".into()));
        }
        for (name, template) in &self.personas {
            if !template.contains(crate::conversation::prompt::QUESTION_SLOT) {
                return Err(ConfigError::Invalid(format!(
                    "persona '{}' has no {{question}} placeholder",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn persona_set(&self) -> PersonaSet {
        if self.personas.is_empty() {
            PersonaSet::default()
        } else {
            PersonaSet::new(self.personas.clone())
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.settings.max_retries,
            secs(self.settings.retry_delay_secs),
        )
    }

    pub fn judge_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.judge.max_retries, secs(self.judge.retry_delay_secs))
    }

    /// Answer models every combination can use; the judge model is excluded unless listed.
    pub fn answer_models(&self) -> Vec<String> {
        self.models
            .keys()
            .filter(|id| **id != self.judge.model)
            .cloned()
            .collect()
    }

    pub fn client_for(&self, model_id: &str) -> Result<OpenAiCompatClient, ConfigError> {
        let model = self
            .models
            .get(model_id)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown model '{}'", model_id)))?;
        let provider = self.providers.get(&model.provider).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown provider '{}'", model.provider))
        })?;
        let timeout = Duration::from_secs(self.settings.timeout_secs.unwrap_or(model.timeout_secs));

        let client = OpenAiCompatClient::new(
            &provider.base_url,
            provider.api_key.clone().unwrap_or_default(),
            model.model.clone().unwrap_or_else(|| model_id.to_string()),
            model.max_tokens,
            timeout,
        )
        .map_err(|e| ConfigError::Invalid(format!("model '{}': {}", model_id, e)))?;
        Ok(client
            .with_temperature(model.temperature)
            .with_extra_body(model.extra_body.clone()))
    }

    /// Client for the judge, with the judge's token and temperature overrides applied.
    pub fn judge_client(&self) -> Result<OpenAiCompatClient, ConfigError> {
        let mut client = self.client_for(&self.judge.model)?;
        if let Some(max_tokens) = self.judge.max_tokens {
            client.max_tokens = max_tokens;
        }
        if self.judge.temperature.is_some() {
            client.temperature = self.judge.temperature;
        }
        Ok(client)
    }

    pub fn build_registry(&self, model_ids: &[String]) -> Result<ModelRegistry, ConfigError> {
        let mut registry = ModelRegistry::new();
        for id in model_ids {
            registry.register(id.clone(), Arc::new(self.client_for(id)?));
        }
        Ok(registry)
    }
}

fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::ZERO)
}
