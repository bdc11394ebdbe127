//! ============================================================================
//! Anthropic Backend - Messages API
//! ============================================================================
//! Calls the Messages API directly. When a search key is registered, web
//! results for the prompt are prepended as grounding context before the call.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{http_client, Backend, SearchTool};
use crate::types::OracleError;

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_VERDICT_TOKENS: u32 = 16;

pub struct AnthropicBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    search: Option<SearchTool>,
}

impl AnthropicBackend {
    pub fn new(
        api_key: String,
        base_url: Option<String>,
        search: Option<SearchTool>,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        let base_url = base_url.unwrap_or_else(|| ANTHROPIC_BASE_URL.into());
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            search,
        })
    }

    pub fn has_search(&self) -> bool {
        self.search.is_some()
    }

    async fn grounded_prompt(&self, prompt: &str) -> Result<String> {
        let Some(search) = &self.search else {
            return Ok(prompt.to_string());
        };
        let context = search.context_for(prompt).await?;
        if context.is_empty() {
            return Ok(prompt.to_string());
        }
        Ok(format!("{}\n{}", context, prompt))
    }
}

#[async_trait]
impl Backend for AnthropicBackend {
    async fn complete(&self, system: &str, prompt: &str, model: &str) -> Result<String> {
        let prompt = self.grounded_prompt(prompt).await?;
        debug!("Calling Anthropic ({}) with {} chars", model, prompt.len());

        let request = MessagesRequest {
            model: model.to_string(),
            max_tokens: MAX_VERDICT_TOKENS,
            system: system.to_string(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call Anthropic API: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Anthropic API error {}: {}", status, body));
        }

        let parsed: MessagesResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse Anthropic response: {}", e))?;

        let text: String = parsed
            .content
            .into_iter()
            .filter_map(|block| block.text)
            .collect();
        if text.is_empty() {
            return Err(anyhow!("No text in Anthropic response"));
        }
        Ok(text)
    }
}

#[derive(Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    system: String,
    messages: Vec<Message>,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    /// Absent on non-text blocks (tool_use etc.)
    #[serde(default)]
    text: Option<String>,
}
