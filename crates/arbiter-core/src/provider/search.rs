//! Auxiliary web search used to ground arbitration on current facts.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::http_client;
use crate::types::OracleError;

const SEARCH_API_URL: &str = "https://api.tavily.com/search";

const MAX_RESULTS: u32 = 5;

/// Longest query sent to the search API
const MAX_QUERY_CHARS: usize = 400;

pub struct SearchTool {
    client: reqwest::Client,
    api_key: String,
}

impl SearchTool {
    pub fn new(api_key: String, timeout: Duration) -> Result<Self, OracleError> {
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
        })
    }

    /// Search and render the hits as a context block
    pub async fn context_for(&self, query: &str) -> Result<String> {
        let query: String = query.chars().take(MAX_QUERY_CHARS).collect();
        debug!("Searching for arbitration context: {} chars", query.len());

        let request = SearchRequest {
            api_key: self.api_key.clone(),
            query,
            max_results: MAX_RESULTS,
        };

        let response = self
            .client
            .post(SEARCH_API_URL)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to call search API: {}", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Search API error {}: {}", status, body));
        }

        let parsed: SearchResponse = response
            .json()
            .await
            .map_err(|e| anyhow!("Failed to parse search response: {}", e))?;

        Ok(render_results(&parsed.results))
    }
}

fn render_results(results: &[SearchResult]) -> String {
    if results.is_empty() {
        return String::new();
    }
    let mut out = String::from("Search results:\n");
    for r in results {
        out.push_str(&format!("- {} ({}): {}\n", r.title, r.url, r.content.trim()));
    }
    out
}

#[derive(Serialize)]
struct SearchRequest {
    api_key: String,
    query: String,
    max_results: u32,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_results() {
        let body = r#"{"results":[{"title":"Sky","url":"https://a.example","content":" Rayleigh scattering "}]}"#;
        let parsed: SearchResponse = serde_json::from_str(body).unwrap();
        assert_eq!(
            render_results(&parsed.results),
            "Search results:\n- Sky (https://a.example): Rayleigh scattering\n"
        );
        assert_eq!(render_results(&[]), "");
    }
}
