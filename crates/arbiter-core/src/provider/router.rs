//! ============================================================================
//! Provider Router - Selection, Prompting, Verdict Normalization
//! ============================================================================
//! Providers are kept in registration order. Selection is fuzzy: a demand's
//! provider matches a registered name when either contains the other
//! (case-insensitive); the first match wins, and with no match the first
//! registered provider is used.
//! ============================================================================

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{Backend, ProviderDescriptor, ProviderKind};
use crate::types::{Demand, OracleError};

/// Fixed system instruction sent with every arbitration request
pub const SYSTEM_INSTRUCTION: &str = "You are an impartial arbiter deciding whether an obligation \
satisfies a demand. Reply with exactly one word: true or false. Do not explain.";

/// Used when a demand carries a blank template
pub const DEFAULT_PROMPT_TEMPLATE: &str = "Demand: {{demand}}\n\
Obligation: {{obligation}}\n\
Does the obligation satisfy the demand? Answer true or false.";

const DEMAND_PLACEHOLDER: &str = "{{demand}}";
const OBLIGATION_PLACEHOLDER: &str = "{{obligation}}";

struct RegisteredProvider {
    descriptor: ProviderDescriptor,
    backend: Arc<dyn Backend>,
}

pub struct ProviderRouter {
    providers: Vec<RegisteredProvider>,
    /// Upper bound on a single backend call
    timeout: Duration,
}

impl ProviderRouter {
    pub fn new(timeout: Duration) -> Self {
        Self {
            providers: Vec::new(),
            timeout,
        }
    }

    /// Register a built-in backend family resolved from the descriptor's name
    pub fn add_provider(&mut self, descriptor: ProviderDescriptor) -> Result<(), OracleError> {
        let kind = ProviderKind::from_name(&descriptor.name)?;
        let backend = kind.build_backend(&descriptor, self.timeout)?;
        info!("Registered provider {} ({:?})", descriptor.name, kind);
        self.providers.push(RegisteredProvider { descriptor, backend });
        Ok(())
    }

    /// Register a caller-supplied backend under the descriptor's name
    pub fn add_backend(
        &mut self,
        descriptor: ProviderDescriptor,
        backend: Arc<dyn Backend>,
    ) -> Result<(), OracleError> {
        if descriptor.name.trim().is_empty() {
            return Err(OracleError::InvalidProvider("provider name is empty".into()));
        }
        info!("Registered custom provider {}", descriptor.name);
        self.providers.push(RegisteredProvider { descriptor, backend });
        Ok(())
    }

    /// Exact, case-insensitive lookup
    pub fn get_provider(&self, name: &str) -> Option<&ProviderDescriptor> {
        let wanted = name.trim().to_lowercase();
        self.providers
            .iter()
            .find(|p| p.descriptor.name.to_lowercase() == wanted)
            .map(|p| &p.descriptor)
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.providers
            .iter()
            .map(|p| p.descriptor.name.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Provider that would serve a demand naming `requested`
    pub fn select(&self, requested: &str) -> Result<&ProviderDescriptor, OracleError> {
        self.select_registered(requested).map(|p| &p.descriptor)
    }

    fn select_registered(&self, requested: &str) -> Result<&RegisteredProvider, OracleError> {
        let first = self
            .providers
            .first()
            .ok_or(OracleError::NoProviderAvailable)?;

        let wanted = requested.trim().to_lowercase();
        if wanted.is_empty() {
            return Ok(first);
        }

        let matched = self.providers.iter().find(|p| {
            let name = p.descriptor.name.to_lowercase();
            name.contains(&wanted) || wanted.contains(&name)
        });
        match matched {
            Some(p) => Ok(p),
            None => {
                debug!(
                    "No provider matches '{}', falling back to {}",
                    requested, first.descriptor.name
                );
                Ok(first)
            }
        }
    }

    /// Ask the selected backend whether `obligation` satisfies the demand.
    ///
    /// Unclear replies are `false`. Backend failures and timeouts are errors,
    /// never verdicts.
    pub async fn arbitrate(&self, demand: &Demand, obligation: &str) -> Result<bool, OracleError> {
        let provider = self.select_registered(&demand.provider)?;
        let name = provider.descriptor.name.clone();
        let prompt = render_prompt(&demand.prompt_template, &demand.demand_text, obligation);

        debug!("Arbitrating via {} ({})", name, demand.model);

        let call = provider
            .backend
            .complete(SYSTEM_INSTRUCTION, &prompt, &demand.model);
        let raw = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                return Err(OracleError::ArbitrationFailed {
                    provider: name,
                    source: e.into(),
                })
            }
            Err(_) => {
                return Err(OracleError::ArbitrationFailed {
                    provider: name,
                    source: format!("no reply within {:?}", self.timeout).into(),
                })
            }
        };

        let verdict = normalize_verdict(&raw);
        debug!("{} replied {:?} -> {}", name, raw, verdict);
        Ok(verdict)
    }
}

/// Substitute both placeholders in one pass; substituted text is never
/// re-scanned for placeholders.
pub fn render_prompt(template: &str, demand_text: &str, obligation: &str) -> String {
    let template = if template.trim().is_empty() {
        DEFAULT_PROMPT_TEMPLATE
    } else {
        template
    };

    let mut out = String::with_capacity(template.len() + demand_text.len() + obligation.len());
    let mut rest = template;
    while let Some(pos) = rest.find("{{") {
        out.push_str(&rest[..pos]);
        let tail = &rest[pos..];
        if let Some(after) = tail.strip_prefix(DEMAND_PLACEHOLDER) {
            out.push_str(demand_text);
            rest = after;
        } else if let Some(after) = tail.strip_prefix(OBLIGATION_PLACEHOLDER) {
            out.push_str(obligation);
            rest = after;
        } else {
            out.push_str("{{");
            rest = &tail[2..];
        }
    }
    out.push_str(rest);
    out
}

/// Strict boolean reading of a free-text reply
pub fn normalize_verdict(raw: &str) -> bool {
    let lowered = raw.trim().to_lowercase();

    let unfenced = strip_fences(&lowered).replace('`', "");

    let text = strip_tags(&unfenced);
    let mut text = text.trim();
    for prefix in ["result:", "answer:"] {
        if let Some(rest) = text.strip_prefix(prefix) {
            text = rest.trim();
            break;
        }
    }
    text == "true"
}

/// Drop code fence markers and a leading language tag, keeping the fenced
/// content. "```true```" and "```true\n```" both yield "true".
fn strip_fences(text: &str) -> String {
    const FENCE: &str = "```";

    // (content, opened a fence without closing it on the same line)
    let lines: Vec<(&str, bool)> = text
        .lines()
        .map(str::trim)
        .map(|line| match line.strip_prefix(FENCE) {
            Some(rest) => match rest.strip_suffix(FENCE) {
                Some(inner) => (inner.trim(), false),
                None => (rest.trim(), true),
            },
            None => (line.strip_suffix(FENCE).unwrap_or(line).trim(), false),
        })
        .filter(|(content, _)| !content.is_empty())
        .collect();

    let skip = match lines.first() {
        // language tag, only when something else is fenced after it
        Some((_, true)) if lines.len() > 1 => 1,
        _ => 0,
    };
    lines[skip..]
        .iter()
        .map(|(content, _)| *content)
        .collect::<Vec<_>>()
        .join("\n")
}

fn strip_tags(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find('<') {
        match rest[start..].find('>') {
            Some(len) => {
                out.push_str(&rest[..start]);
                rest = &rest[start + len + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubBackend {
        reply: String,
        seen: Mutex<Vec<(String, String)>>,
    }

    impl StubBackend {
        fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Backend for StubBackend {
        async fn complete(&self, _system: &str, prompt: &str, model: &str) -> anyhow::Result<String> {
            self.seen
                .lock()
                .unwrap()
                .push((prompt.to_string(), model.to_string()));
            Ok(self.reply.clone())
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl Backend for FailingBackend {
        async fn complete(&self, _: &str, _: &str, _: &str) -> anyhow::Result<String> {
            Err(anyhow!("connection refused"))
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl Backend for SlowBackend {
        async fn complete(&self, _: &str, _: &str, _: &str) -> anyhow::Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("true".into())
        }
    }

    fn demand(provider: &str) -> Demand {
        Demand {
            provider: provider.into(),
            model: "gpt-4o-mini".into(),
            prompt_template: "Demand: {{demand}}\nObligation: {{obligation}}".into(),
            demand_text: "The sky is blue".into(),
        }
    }

    #[test]
    fn test_normalize_verdict() {
        let cases = [
            ("true", true),
            ("TRUE", true),
            ("  true\n", true),
            ("<answer>true</answer>", true),
            ("Result: true", true),
            ("answer:TRUE", true),
            ("```\ntrue\n```", true),
            ("```text\nTrue\n```", true),
            ("`true`", true),
            ("```true```", true),
            ("```true\n```", true),
            ("```json\ntrue\n```", true),
            ("```text\nfalse\n```", false),
            ("```json\n```", false),
            ("false", false),
            ("I think so", false),
            ("true, because the sky is blue", false),
            ("false, because...", false),
            ("yes", false),
            ("", false),
            ("<think>maybe</think>", false),
        ];
        for (raw, expected) in cases {
            assert_eq!(normalize_verdict(raw), expected, "{:?}", raw);
        }
    }

    #[test]
    fn test_render_prompt() {
        assert_eq!(
            render_prompt("D={{demand}} O={{obligation}} {{other}}", "a", "b"),
            "D=a O=b {{other}}"
        );
        // substituted text is not expanded again
        assert_eq!(
            render_prompt("{{demand}}|{{obligation}}", "{{obligation}}", "x"),
            "{{obligation}}|x"
        );
        assert!(render_prompt("  ", "sky", "blue").contains("Demand: sky"));
    }

    #[test]
    fn test_fuzzy_selection() {
        let mut router = ProviderRouter::new(Duration::from_secs(1));
        assert!(matches!(
            router.select("openai"),
            Err(OracleError::NoProviderAvailable)
        ));

        router
            .add_backend(ProviderDescriptor::new("OpenAI"), StubBackend::new("true"))
            .unwrap();
        router
            .add_backend(ProviderDescriptor::new("Anthropic"), StubBackend::new("false"))
            .unwrap();

        assert_eq!(router.select("openai").unwrap().name, "OpenAI");
        assert_eq!(router.select("anthropic-claude").unwrap().name, "Anthropic");
        assert_eq!(router.select("Anthrop").unwrap().name, "Anthropic");
        // no match falls back to the first registered
        assert_eq!(router.select("mistral").unwrap().name, "OpenAI");
        assert_eq!(router.select("").unwrap().name, "OpenAI");

        assert!(router.get_provider("ANTHROPIC").is_some());
        assert!(router.get_provider("anthrop").is_none());
        assert_eq!(router.provider_names(), vec!["OpenAI", "Anthropic"]);
    }

    #[test]
    fn test_add_provider_rejects_unknown_family() {
        let mut router = ProviderRouter::new(Duration::from_secs(1));
        let err = router
            .add_provider(ProviderDescriptor::new("Mistral").with_api_key("k"))
            .unwrap_err();
        assert_eq!(err.kind(), "unrecognized_provider");
        assert!(router.is_empty());

        router
            .add_provider(ProviderDescriptor::new("OpenRouter").with_api_key("k"))
            .unwrap();
        assert_eq!(router.len(), 1);
    }

    #[tokio::test]
    async fn test_arbitrate_renders_and_normalizes() {
        let stub = StubBackend::new("<answer>TRUE</answer>");
        let mut router = ProviderRouter::new(Duration::from_secs(1));
        router
            .add_backend(ProviderDescriptor::new("OpenAI"), stub.clone())
            .unwrap();

        let verdict = router
            .arbitrate(&demand("openai"), "The sky appears blue today")
            .await
            .unwrap();
        assert!(verdict);

        let seen = stub.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].0,
            "Demand: The sky is blue\nObligation: The sky appears blue today"
        );
        assert_eq!(seen[0].1, "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_backend_error_is_not_false() {
        let mut router = ProviderRouter::new(Duration::from_secs(1));
        router
            .add_backend(ProviderDescriptor::new("OpenAI"), Arc::new(FailingBackend))
            .unwrap();

        let err = router.arbitrate(&demand("openai"), "x").await.unwrap_err();
        match err {
            OracleError::ArbitrationFailed { provider, source } => {
                assert_eq!(provider, "OpenAI");
                assert!(source.to_string().contains("connection refused"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backend_timeout() {
        let mut router = ProviderRouter::new(Duration::from_millis(20));
        router
            .add_backend(ProviderDescriptor::new("OpenAI"), Arc::new(SlowBackend))
            .unwrap();

        let err = router.arbitrate(&demand("openai"), "x").await.unwrap_err();
        assert_eq!(err.kind(), "arbitration_failed");
    }
}
