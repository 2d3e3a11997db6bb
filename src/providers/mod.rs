//! Provider adapters — one uniform capability set per LLM provider.
//!
//! Every provider implements `ProviderAdapter`. The decrypted key is passed
//! in per call and must never be stored, logged or cached by an adapter.
//! Adding a provider means implementing the trait in a new file and
//! registering it in the adapter map at startup.

pub mod anthropic;
pub mod client;
pub mod gemini;
pub mod openai;
pub mod registry;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use crate::error::{AiError, AiResult};

pub const PROVIDER_GEMINI: &str = "gemini";
pub const PROVIDER_OPENAI: &str = "openai";
pub const PROVIDER_ANTHROPIC: &str = "anthropic";

/// Token accounting reported by a provider (estimated when the provider
/// omits it).
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A successful generation. `parsed` is the JSON-decoded response body when
/// the model returned JSON, otherwise `{"raw_text": …}` — a non-JSON reply
/// is never an error.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub success: bool,
    pub provider: String,
    pub model: String,
    pub parsed: Value,
    pub raw_response: String,
    pub usage: TokenUsage,
}

impl GenerationOutcome {
    pub fn from_text(provider: &str, model: &str, text: String, usage: TokenUsage) -> Self {
        let parsed = parse_model_output(&text);
        Self {
            success: true,
            provider: provider.to_string(),
            model: model.to_string(),
            parsed,
            raw_response: text,
            usage,
        }
    }
}

/// Decode model output as JSON when possible, stripping a markdown code
/// fence if present; otherwise wrap the raw text.
pub fn parse_model_output(text: &str) -> Value {
    if let Ok(v) = serde_json::from_str::<Value>(text) {
        return v;
    }
    let trimmed = text.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|s| s.strip_suffix("```"))
        .map(str::trim);
    if let Some(inner) = unfenced {
        if let Ok(v) = serde_json::from_str::<Value>(inner) {
            return v;
        }
    }
    json!({ "raw_text": text })
}

/// Result of an admin-initiated liveness probe against one credential.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeOutcome {
    pub success: bool,
    pub provider: String,
    pub message: String,
    pub latency_ms: u64,
    pub model_available: Option<bool>,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider identifier (e.g. "gemini").
    fn name(&self) -> &'static str;

    /// One generation call. Bounded by the provider's timeout; failures map
    /// to the subsystem's provider-scoped error kinds.
    async fn generate(
        &self,
        key: &str,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> AiResult<GenerationOutcome>;

    /// Cheap liveness check used by the credential `test` operation.
    async fn probe(&self, key: &str) -> ProbeOutcome;
}

/// Map an HTTP failure from a provider into the fallback-aware error kinds.
pub fn classify_http_failure(provider: &str, status: u16, body: &str) -> AiError {
    let lower = body.to_lowercase();
    if status == 429 || lower.contains("resource_exhausted") || lower.contains("rate limit") {
        AiError::RateLimited {
            message: format!("{provider} returned {status}: {}", truncate(body, 200)),
        }
    } else if status == 401 || status == 403 {
        AiError::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("auth failure ({status})"),
        }
    } else {
        AiError::ProviderUnavailable {
            provider: provider.to_string(),
            message: format!("HTTP {status}: {}", truncate(body, 200)),
        }
    }
}

pub(crate) fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Rough token estimate for providers that do not report usage.
pub(crate) fn estimate_tokens(text: &str) -> i64 {
    (text.split_whitespace().count() as f64 * 1.3) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_output_json() {
        let parsed = parse_model_output("{\"x\":1}");
        assert_eq!(parsed, json!({"x": 1}));
    }

    #[test]
    fn test_parse_model_output_fenced() {
        let parsed = parse_model_output("```json\n{\"a\": true}\n```");
        assert_eq!(parsed, json!({"a": true}));
    }

    #[test]
    fn test_parse_model_output_raw_text() {
        let parsed = parse_model_output("Sure, here you go");
        assert_eq!(parsed, json!({"raw_text": "Sure, here you go"}));
    }

    #[test]
    fn test_classify_http_failure() {
        assert!(matches!(
            classify_http_failure("gemini", 429, "quota"),
            AiError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_http_failure("gemini", 500, "RESOURCE_EXHAUSTED"),
            AiError::RateLimited { .. }
        ));
        assert!(matches!(
            classify_http_failure("openai", 401, "bad key"),
            AiError::ProviderUnavailable { .. }
        ));
        assert!(matches!(
            classify_http_failure("openai", 503, "down"),
            AiError::ProviderUnavailable { .. }
        ));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo wörld", 5), "héllo");
        assert_eq!(truncate("ab", 5), "ab");
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens("one two three four"), 5);
        assert_eq!(estimate_tokens(""), 0);
    }
}
