//! ============================================================================
//! OpenAI-Compatible Backend - Chat Completions
//! ============================================================================
//! Serves two provider families with one wire format:
//! - OpenAI: direct API key against api.openai.com
//! - OpenRouter: OpenAI-compatible gateway, base URL overridable
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{http_client, Backend};
use crate::types::OracleError;

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const OPENROUTER_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Reasoning models spend completion tokens before answering, so the cap
/// stays generous even though a verdict is one word
const MAX_COMPLETION_TOKENS: u32 = 4096;

/// Model families that reject a non-default temperature
const REASONING_MODEL_PREFIXES: [&str; 4] = ["o1", "o3", "o4", "gpt-5"];

pub struct OpenAiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    label: &'static str,
}

impl OpenAiBackend {
    pub fn openai(api_key: String, base_url: Option<String>, timeout: Duration) -> Result<Self, OracleError> {
        Self::build("OpenAI", api_key, base_url.unwrap_or_else(|| OPENAI_BASE_URL.into()), timeout)
    }

    pub fn openrouter(
        api_key: String,
        base_url: Option<String>,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        Self::build(
            "OpenRouter",
            api_key,
            base_url.unwrap_or_else(|| OPENROUTER_BASE_URL.into()),
            timeout,
        )
    }

    fn build(
        label: &'static str,
        api_key: String,
        base_url: String,
        timeout: Duration,
    ) -> Result<Self, OracleError> {
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            label,
        })
    }

    /// OpenAI takes `max_completion_tokens` on every chat model; the
    /// OpenRouter gateway only understands `max_tokens`
    fn chat_request(&self, system: &str, prompt: &str, model: &str) -> ChatRequest {
        let (max_tokens, max_completion_tokens) = if self.label == "OpenRouter" {
            (Some(MAX_COMPLETION_TOKENS), None)
        } else {
            (None, Some(MAX_COMPLETION_TOKENS))
        };

        ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            temperature: if is_reasoning_model(model) { None } else { Some(0.0) },
            max_tokens,
            max_completion_tokens,
        }
    }
}

/// "o3-mini", "gpt-5", and gateway names such as "openai/o1"
fn is_reasoning_model(model: &str) -> bool {
    let name = model.rsplit('/').next().unwrap_or(model).to_lowercase();
    REASONING_MODEL_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
}

#[async_trait]
impl Backend for OpenAiBackend {
    async fn complete(&self, system: &str, prompt: &str, model: &str) -> Result<String> {
        debug!("Calling {} ({}) with {} chars", self.label, model, prompt.len());

        let request = self.chat_request(system, prompt, model);

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call {} API: {}", self.label, e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("{} API error {}: {}", self.label, status, body));
        }

        let chat_response: ChatResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse {} response: {}", self.label, e))?;

        chat_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("No response from {}", self.label))
    }
}

// ============================================================================
// API Types
// ============================================================================

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_completion_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    /// Null when the model refuses or only emits tool calls
    content: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_urls() {
        let timeout = Duration::from_secs(1);
        let openai = OpenAiBackend::openai("k".into(), None, timeout).unwrap();
        assert_eq!(openai.base_url, OPENAI_BASE_URL);

        let gateway =
            OpenAiBackend::openrouter("k".into(), Some("https://gw.example/v1/".into()), timeout).unwrap();
        assert_eq!(gateway.base_url, "https://gw.example/v1");
        assert_eq!(gateway.label, "OpenRouter");
    }

    #[test]
    fn test_request_shape() {
        let timeout = Duration::from_secs(1);
        let openai = OpenAiBackend::openai("k".into(), None, timeout).unwrap();

        let json = serde_json::to_value(openai.chat_request("sys", "hi", "gpt-4o-mini")).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["temperature"], 0.0);
        assert_eq!(json["max_completion_tokens"], MAX_COMPLETION_TOKENS);
        assert!(json.get("max_tokens").is_none());
        assert_eq!(json["messages"][0]["role"], "system");

        let json = serde_json::to_value(openai.chat_request("sys", "hi", "o3-mini")).unwrap();
        assert!(json.get("temperature").is_none());
        assert!(json.get("max_tokens").is_none());

        let gateway = OpenAiBackend::openrouter("k".into(), None, timeout).unwrap();
        let json = serde_json::to_value(gateway.chat_request("sys", "hi", "openai/gpt-5")).unwrap();
        assert!(json.get("temperature").is_none());
        assert_eq!(json["max_tokens"], MAX_COMPLETION_TOKENS);
        assert!(json.get("max_completion_tokens").is_none());
    }

    #[test]
    fn test_reasoning_model_detection() {
        assert!(is_reasoning_model("o1"));
        assert!(is_reasoning_model("o3-mini"));
        assert!(is_reasoning_model("GPT-5-mini"));
        assert!(is_reasoning_model("openai/o4-mini"));
        assert!(!is_reasoning_model("gpt-4o-mini"));
        assert!(!is_reasoning_model("anthropic/claude-3.5-sonnet"));
    }

    #[test]
    fn test_parse_null_content() {
        let body = r#"{"choices":[{"message":{"role":"assistant","content":null}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(body).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}
