//! Provider registry: resolves `provider/model` references to model handles.
//!
//! Providers come from configuration. Explicit overrides registered with
//! [`ConfigRegistry::with_model`] take precedence, which is how scripted and
//! test runs inject models.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use corvid_config::{AppConfig, ModelConfig, ProviderConfig};
use corvid_core::error::ProviderError;
use corvid_core::provider::{LanguageModel, ModelRef, ProviderRegistry, ResolvedModel};
use tracing::{debug, warn};

use crate::openai_compat::OpenAiCompatModel;

pub struct ConfigRegistry {
    providers: HashMap<String, ProviderConfig>,
    default_model: Option<ModelRef>,
    small_model: Option<ModelRef>,
    overrides: HashMap<ModelRef, ResolvedModel>,
}

impl ConfigRegistry {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            providers: config.providers.clone().into_iter().collect(),
            default_model: config.default_model(),
            small_model: config.small_model.as_deref().and_then(ModelRef::parse),
            overrides: HashMap::new(),
        }
    }

    /// Serve `model` for its `provider/model` reference, bypassing configuration.
    pub fn with_model(mut self, model: ResolvedModel) -> Self {
        self.overrides.insert(model.info.model_ref(), model);
        self
    }

    /// Replace the default model.
    pub fn with_default(mut self, model: ModelRef) -> Self {
        self.default_model = Some(model);
        self
    }

    /// Provider ids known to the registry.
    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .providers
            .keys()
            .cloned()
            .chain(self.overrides.keys().map(|m| m.provider_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn build(&self, model: &ModelRef) -> Result<ResolvedModel, ProviderError> {
        let provider = self
            .providers
            .get(&model.provider_id)
            .ok_or_else(|| ProviderError::NotConfigured(model.provider_id.clone()))?;

        let settings = if provider.models.is_empty() {
            ModelConfig::default()
        } else {
            provider
                .models
                .get(&model.model_id)
                .cloned()
                .ok_or_else(|| ProviderError::ModelNotFound {
                    provider_id: model.provider_id.clone(),
                    model_id: model.model_id.clone(),
                })?
        };

        let base_url = provider
            .api_url
            .clone()
            .or_else(|| OpenAiCompatModel::default_base_url(&model.provider_id).map(String::from))
            .ok_or_else(|| ProviderError::NotConfigured(format!("{}: no api_url", model.provider_id)))?;

        let api_key = provider.resolve_api_key();
        if api_key.is_none() {
            warn!(provider = %model.provider_id, "No API key configured");
        }

        let language: Arc<dyn LanguageModel> = Arc::new(OpenAiCompatModel::new(
            &model.provider_id,
            &model.model_id,
            base_url,
            api_key,
        )?);
        debug!(model = %model, "Resolved model");
        Ok(ResolvedModel {
            info: settings.to_info(&model.provider_id, &model.model_id),
            language,
        })
    }
}

#[async_trait]
impl ProviderRegistry for ConfigRegistry {
    async fn model(&self, model: &ModelRef) -> Result<ResolvedModel, ProviderError> {
        if let Some(found) = self.overrides.get(model) {
            return Ok(found.clone());
        }
        self.build(model)
    }

    async fn small_model(&self, provider_id: &str) -> Option<ResolvedModel> {
        let per_provider = self
            .providers
            .get(provider_id)
            .and_then(|p| p.small_model.as_deref())
            .map(|m| ModelRef::new(provider_id, m));
        let candidate = per_provider.or_else(|| self.small_model.clone())?;
        match self.model(&candidate).await {
            Ok(model) => Some(model),
            Err(e) => {
                debug!(model = %candidate, error = %e, "Small model unavailable");
                None
            }
        }
    }

    fn default_model(&self) -> Option<ModelRef> {
        self.default_model.clone()
    }
}
