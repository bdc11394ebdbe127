//! ============================================================================
//! Provider Module - AI Backends for Arbitration
//! ============================================================================
//! Contains the backend interface and the closed set of backend families:
//! - OpenAiBackend: direct-key chat completions (OpenAI, OpenRouter gateway)
//! - AnthropicBackend: messages API with optional web-search context
//! - ProviderRouter: fuzzy provider selection + verdict normalization
//! ============================================================================

mod anthropic;
mod openai;
mod router;
mod search;

pub use anthropic::AnthropicBackend;
pub use openai::OpenAiBackend;
pub use router::{
    normalize_verdict, render_prompt, ProviderRouter, DEFAULT_PROMPT_TEMPLATE, SYSTEM_INSTRUCTION,
};
pub use search::SearchTool;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::types::OracleError;

/// A registered AI backend: system instruction + prompt + model in, free text out
#[async_trait]
pub trait Backend: Send + Sync {
    async fn complete(&self, system: &str, prompt: &str, model: &str) -> anyhow::Result<String>;
}

/// Operator-supplied provider registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    pub name: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default, rename = "baseURL", alias = "baseUrl")]
    pub base_url: Option<String>,
    /// Enables the family's auxiliary tool (search for Anthropic)
    #[serde(default)]
    pub auxiliary_key: Option<String>,
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            api_key: None,
            base_url: None,
            auxiliary_key: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_auxiliary_key(mut self, key: impl Into<String>) -> Self {
        self.auxiliary_key = Some(key.into());
        self
    }
}

/// Backend family, resolved strictly from the registered provider name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAi,
    OpenRouter,
    Anthropic,
}

impl ProviderKind {
    pub fn from_name(name: &str) -> Result<Self, OracleError> {
        match name.trim().to_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            "anthropic" => Ok(ProviderKind::Anthropic),
            _ => Err(OracleError::UnrecognizedProvider(name.to_string())),
        }
    }

    /// Build the HTTP backend for this family. Every client carries `timeout`.
    pub fn build_backend(
        &self,
        descriptor: &ProviderDescriptor,
        timeout: Duration,
    ) -> Result<Arc<dyn Backend>, OracleError> {
        let api_key = descriptor
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                OracleError::InvalidProvider(format!("{} requires an API key", descriptor.name))
            })?;

        let backend: Arc<dyn Backend> = match self {
            ProviderKind::OpenAi => Arc::new(OpenAiBackend::openai(
                api_key,
                descriptor.base_url.clone(),
                timeout,
            )?),
            ProviderKind::OpenRouter => Arc::new(OpenAiBackend::openrouter(
                api_key,
                descriptor.base_url.clone(),
                timeout,
            )?),
            ProviderKind::Anthropic => {
                let search = descriptor
                    .auxiliary_key
                    .clone()
                    .filter(|k| !k.trim().is_empty())
                    .map(|key| SearchTool::new(key, timeout))
                    .transpose()?;
                Arc::new(AnthropicBackend::new(
                    api_key,
                    descriptor.base_url.clone(),
                    search,
                    timeout,
                )?)
            }
        };
        Ok(backend)
    }
}

pub(crate) fn http_client(timeout: Duration) -> Result<reqwest::Client, OracleError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| OracleError::InvalidProvider(format!("Failed to build HTTP client: {}", e)))
}
