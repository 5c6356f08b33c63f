//! Configuration models for distillery.
//!
//! Every tunable of the engine is parameterized here and resolved at runtime
//! from a TOML file.

use super::function::ModelConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Top-level configuration for distillery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Dataset and config storage
    #[serde(default)]
    pub storage: StorageConfig,

    /// Distillation policy
    #[serde(default)]
    pub distillation: DistillationConfig,

    /// Fine-tuning providers by name
    #[serde(default = "default_providers")]
    pub providers: HashMap<String, ProviderConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            distillation: DistillationConfig::default(),
            providers: default_providers(),
        }
    }
}

/// Where datasets, function configs and the membership filter live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Log root directory
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,

    /// Expected number of distinct examples (membership filter sizing)
    #[serde(default = "default_bloom_expected_items")]
    pub bloom_expected_items: usize,

    /// Target false positive rate of the membership filter
    #[serde(default = "default_bloom_false_positive_rate")]
    pub bloom_false_positive_rate: f64,
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from(".distillery")
}

fn default_bloom_expected_items() -> usize {
    10_000
}

fn default_bloom_false_positive_rate() -> f64 {
    0.01
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
            bloom_expected_items: default_bloom_expected_items(),
            bloom_false_positive_rate: default_bloom_false_positive_rate(),
        }
    }
}

/// When and how functions are distilled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistillationConfig {
    /// Environment id encoded into fine-tuned model names
    #[serde(default)]
    pub environment_id: u32,

    /// Datapoints required for the first fine-tune; doubles after each run
    #[serde(default = "default_base_threshold")]
    pub base_threshold: usize,

    /// Minimum minutes between two status polls of a running job
    #[serde(default = "default_poll_interval_mins")]
    pub poll_interval_mins: i64,

    /// Token budget for examples placed in a prompt
    #[serde(default = "default_prompt_token_budget")]
    pub prompt_token_budget: usize,

    /// Bytes of recent alignments kept per function for prompting
    #[serde(default = "default_example_buffer_bytes")]
    pub example_buffer_bytes: usize,

    /// Base model fine-tuned into distilled models
    #[serde(default = "default_student")]
    pub student: ModelConfig,

    /// Teacher models, by increasing context length
    #[serde(default = "default_teachers")]
    pub teachers: Vec<ModelConfig>,
}

fn default_base_threshold() -> usize {
    200
}

fn default_poll_interval_mins() -> i64 {
    30
}

fn default_prompt_token_budget() -> usize {
    1000
}

fn default_example_buffer_bytes() -> usize {
    4096
}

fn default_student() -> ModelConfig {
    ModelConfig::new("gpt-3.5-turbo-1106", "openai", 14_000)
}

fn default_teachers() -> Vec<ModelConfig> {
    vec![
        ModelConfig::new("gpt-4", "openai", 8_192),
        ModelConfig::new("gpt-4-32k", "openai", 32_768),
    ]
}

impl Default for DistillationConfig {
    fn default() -> Self {
        Self {
            environment_id: 0,
            base_threshold: default_base_threshold(),
            poll_interval_mins: default_poll_interval_mins(),
            prompt_token_budget: default_prompt_token_budget(),
            example_buffer_bytes: default_example_buffer_bytes(),
            student: default_student(),
            teachers: default_teachers(),
        }
    }
}

impl DistillationConfig {
    /// Look up a configured teacher model by name.
    pub fn teacher(&self, model_name: &str) -> Option<&ModelConfig> {
        self.teachers.iter().find(|m| m.model_name == model_name)
    }
}

/// Configuration for an OpenAI-compatible fine-tuning endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API key (can also be set via the `api_key_env` variable)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Environment variable name for API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Base URL for the API
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries on failure
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_timeout() -> u64 {
    180
}

fn default_max_retries() -> u32 {
    3
}

fn default_providers() -> HashMap<String, ProviderConfig> {
    let mut providers = HashMap::new();
    providers.insert("openai".to_string(), ProviderConfig::default());
    providers
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

impl ProviderConfig {
    /// Resolve the API key from config or environment.
    pub fn resolve_api_key(&self, provider: &str) -> Result<String, ConfigError> {
        if let Some(key) = &self.api_key {
            return Ok(expand_env_vars(key));
        }

        std::env::var(&self.api_key_env).map_err(|_| ConfigError::MissingApiKey {
            provider: provider.to_string(),
            env_var: self.api_key_env.clone(),
        })
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_owned(),
                source,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            source: e,
        })?;
        config.distillation.student = config.distillation.student.clone().with_token_counts();
        config.distillation.teachers = config
            .distillation
            .teachers
            .drain(..)
            .map(ModelConfig::with_token_counts)
            .collect();
        Ok(config)
    }

    /// Check that the model setup is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let student = &self.distillation.student;
        if student.model_name.is_empty() {
            return Err(ConfigError::Invalid(
                "distillation.student.model_name must name a base model".to_string(),
            ));
        }
        if self.distillation.teachers.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one teacher model is required".to_string(),
            ));
        }

        let models = std::iter::once(student).chain(self.distillation.teachers.iter());
        for model in models {
            if !self.providers.contains_key(&model.provider) {
                return Err(ConfigError::ProviderNotFound {
                    model: model.model_name.clone(),
                    provider: model.provider.clone(),
                });
            }
        }

        let ordered = self
            .distillation
            .teachers
            .windows(2)
            .all(|pair| pair[0].context_length <= pair[1].context_length);
        if !ordered {
            return Err(ConfigError::Invalid(
                "teachers must be ordered by increasing context_length".to_string(),
            ));
        }

        // Encoded as one character of [0-9a-z] in model names.
        if self.distillation.environment_id > 35 {
            return Err(ConfigError::Invalid(
                "distillation.environment_id must be between 0 and 35".to_string(),
            ));
        }

        let p = self.storage.bloom_false_positive_rate;
        if !(p > 0.0 && p < 1.0) {
            return Err(ConfigError::Invalid(
                "storage.bloom_false_positive_rate must be in (0, 1)".to_string(),
            ));
        }

        Ok(())
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let re = match regex::Regex::new(r"\$\{([^}]+)\}") {
        Ok(re) => re,
        Err(_) => return s.to_string(),
    };

    let mut result = s.to_string();
    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(
        "Missing API key for provider '{provider}': set {env_var} env var or api_key in config"
    )]
    MissingApiKey { provider: String, env_var: String },

    #[error("Model '{model}' references provider '{provider}' which is not configured in [providers.*]")]
    ProviderNotFound { model: String, provider: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
