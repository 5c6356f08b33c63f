//! Provider registry: fine-tuning backends by name.

use super::finetune::Finetunable;
use super::openai::OpenAiClient;
use crate::models::{Config, ConfigError, DistilleryError, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Fine-tuning providers keyed by the name models refer to in `ModelConfig::provider`.
///
/// # Example
///
/// ```ignore
/// use distillery::{Config, ProviderRegistry};
///
/// let config = Config::from_file("distillery.toml".as_ref())?;
/// let providers = ProviderRegistry::from_config(&config)?;
/// let openai = providers.get("openai")?;
/// let jobs = openai.list_finetuned(10).await?;
/// ```
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Finetunable>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build OpenAI-compatible clients for every `[providers.*]` entry.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingApiKey` if a provider has no resolvable key.
    pub fn from_config(config: &Config) -> std::result::Result<Self, ConfigError> {
        let mut registry = Self::new();

        for (name, provider) in &config.providers {
            let api_key = provider.resolve_api_key(name)?;
            let client = OpenAiClient::new(
                name.clone(),
                Some(api_key),
                provider.base_url.clone(),
                provider.timeout_secs,
                provider.max_retries,
            )
            .map_err(|e| ConfigError::Invalid(format!("Failed to create '{name}' client: {e}")))?;

            info!(provider = %name, base_url = %client.base_url(), "Registered fine-tuning provider");
            registry.insert(name.clone(), Arc::new(client));
        }

        Ok(registry)
    }

    /// Register or replace a provider.
    pub fn insert(&mut self, name: impl Into<String>, provider: Arc<dyn Finetunable>) {
        self.providers.insert(name.into(), provider);
    }

    /// Get a provider by name.
    pub fn get(&self, name: &str) -> Result<Arc<dyn Finetunable>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| DistilleryError::MissingProvider(name.to_string()))
    }

    /// Registered provider names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
