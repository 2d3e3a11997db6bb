//! The fronting AI client — ordered try-each-provider-then-fail.
//!
//! Holds the adapter map and the credential registry. A single generate
//! call walks the provider order sequentially (primary first, so the
//! fallback only spends when the primary cannot); provider-scoped failures
//! fall through to the next provider, and only when every provider has
//! failed does the caller see one `AllProvidersFailed`. Fallback is the
//! retry — there are no retry loops inside an attempt.

use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroize;

use crate::config::AiConfig;
use crate::error::{AiError, AiResult};

use super::registry::CredentialRegistry;
use super::{GenerationOutcome, ProviderAdapter, PROVIDER_GEMINI, PROVIDER_OPENAI};

/// Parameters for one generation request. Unset fields fall back to the
/// configured defaults.
#[derive(Debug, Clone, Default)]
pub struct GenerateRequest {
    pub system_prompt: String,
    pub user_prompt: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Invert the provider order when set to "openai".
    pub prefer: Option<String>,
}

pub struct AiClient {
    adapters: HashMap<&'static str, Box<dyn ProviderAdapter>>,
    registry: Arc<CredentialRegistry>,
    default_temperature: f32,
    default_max_tokens: u32,
}

impl AiClient {
    pub fn new(
        adapters: HashMap<&'static str, Box<dyn ProviderAdapter>>,
        registry: Arc<CredentialRegistry>,
        cfg: &AiConfig,
    ) -> Self {
        Self {
            adapters,
            registry,
            default_temperature: cfg.gemini_temperature,
            default_max_tokens: cfg.gemini_max_tokens,
        }
    }

    fn provider_order(&self, prefer: Option<&str>) -> [&'static str; 2] {
        if prefer == Some(PROVIDER_OPENAI) {
            [PROVIDER_OPENAI, PROVIDER_GEMINI]
        } else {
            [PROVIDER_GEMINI, PROVIDER_OPENAI]
        }
    }

    /// Any provider with both an adapter and an active credential.
    pub fn any_available(&self) -> bool {
        self.provider_order(None)
            .iter()
            .any(|p| self.adapters.contains_key(p) && self.registry.is_available(p))
    }

    pub fn availability(&self) -> HashMap<&'static str, bool> {
        self.provider_order(None)
            .iter()
            .map(|p| (*p, self.adapters.contains_key(p) && self.registry.is_available(p)))
            .collect()
    }

    /// Run a provider's liveness probe with a decrypted key.
    pub async fn probe(&self, provider: &str, key: &str) -> Option<super::ProbeOutcome> {
        match self.adapters.get(provider) {
            Some(adapter) => Some(adapter.probe(key).await),
            None => None,
        }
    }

    pub async fn generate(&self, req: &GenerateRequest) -> AiResult<GenerationOutcome> {
        let temperature = req.temperature.unwrap_or(self.default_temperature);
        let max_tokens = req.max_tokens.unwrap_or(self.default_max_tokens);
        let order = self.provider_order(req.prefer.as_deref());

        let mut errors: Vec<String> = Vec::new();
        for provider in order {
            let adapter = match self.adapters.get(provider) {
                Some(a) => a,
                None => continue,
            };

            let mut key = match self.registry.active_key_for(provider) {
                Ok(Some(key)) => key,
                Ok(None) => {
                    errors.push(format!("{provider}: no active credential"));
                    continue;
                }
                Err(e) => {
                    errors.push(format!("{provider}: {e}"));
                    continue;
                }
            };

            tracing::info!(provider, "Attempting AI generation");
            let result = adapter
                .generate(&key, &req.system_prompt, &req.user_prompt, temperature, max_tokens)
                .await;
            key.zeroize();

            match result {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.triggers_fallback() => {
                    tracing::warn!(provider, error = %e, "Provider failed, trying next");
                    errors.push(format!("{provider}: {e}"));
                }
                Err(e) => return Err(e),
            }
        }

        Err(AiError::AllProvidersFailed {
            errors: errors.join("; "),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::mock::{MockAdapter, Script};
    use super::*;
    use crate::store::Store;
    use crate::vault::Vault;
    use serde_json::json;

    fn registry_with_keys(providers: &[&str]) -> Arc<CredentialRegistry> {
        let store = Arc::new(Store::open_in_memory().unwrap());
        let vault = Arc::new(Vault::new(&"A".repeat(32)).unwrap());
        let registry = CredentialRegistry::new(store, vault);
        for p in providers {
            let key = match *p {
                "openai" => "sk-test-0123456789".to_string(),
                _ => "AIzaSyTest0123456789xyz".to_string(),
            };
            registry.create(p, key, None, None, None).unwrap();
        }
        Arc::new(registry)
    }

    fn client(
        gemini: Script,
        openai: Script,
        registry: Arc<CredentialRegistry>,
    ) -> AiClient {
        let mut adapters: HashMap<&'static str, Box<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("gemini", Box::new(MockAdapter::new("gemini", gemini)));
        adapters.insert("openai", Box::new(MockAdapter::new("openai", openai)));
        AiClient::new(adapters, registry, &AiConfig::for_tests())
    }

    #[tokio::test]
    async fn test_primary_wins_when_healthy() {
        let registry = registry_with_keys(&["gemini", "openai"]);
        let client = client(
            Script::Succeed("from gemini".into()),
            Script::Succeed("from openai".into()),
            registry,
        );
        let outcome = client.generate(&GenerateRequest::default()).await.unwrap();
        assert_eq!(outcome.provider, "gemini");
        assert_eq!(outcome.parsed, json!({"raw_text": "from gemini"}));
    }

    #[tokio::test]
    async fn test_rate_limited_primary_falls_back() {
        let registry = registry_with_keys(&["gemini", "openai"]);
        let client = client(
            Script::RateLimit,
            Script::Succeed("{\"x\":1}".into()),
            registry,
        );
        let outcome = client.generate(&GenerateRequest::default()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.provider, "openai");
        assert_eq!(outcome.parsed, json!({"x": 1}));
    }

    #[tokio::test]
    async fn test_all_providers_failed_concatenates_errors() {
        let registry = registry_with_keys(&["gemini", "openai"]);
        let client = client(Script::RateLimit, Script::TimeOut, registry);
        let err = client.generate(&GenerateRequest::default()).await.unwrap_err();
        match err {
            AiError::AllProvidersFailed { errors } => {
                assert!(errors.contains("gemini"));
                assert!(errors.contains("openai"));
            }
            other => panic!("expected AllProvidersFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_prefer_openai_inverts_order() {
        let registry = registry_with_keys(&["gemini", "openai"]);
        let client = client(
            Script::Succeed("gemini text".into()),
            Script::Succeed("openai text".into()),
            registry,
        );
        let outcome = client
            .generate(&GenerateRequest {
                prefer: Some("openai".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.provider, "openai");
    }

    #[tokio::test]
    async fn test_missing_credentials_reported() {
        let registry = registry_with_keys(&[]);
        let client = client(
            Script::Succeed("a".into()),
            Script::Succeed("b".into()),
            registry.clone(),
        );
        assert!(!client.any_available());
        let err = client.generate(&GenerateRequest::default()).await.unwrap_err();
        match err {
            AiError::AllProvidersFailed { errors } => {
                assert!(errors.contains("no active credential"));
            }
            other => panic!("expected AllProvidersFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn test_availability_tracks_credentials() {
        let registry = registry_with_keys(&["gemini"]);
        let client = client(
            Script::Succeed("a".into()),
            Script::Succeed("b".into()),
            registry,
        );
        let avail = client.availability();
        assert_eq!(avail["gemini"], true);
        assert_eq!(avail["openai"], false);
        assert!(client.any_available());
    }
}
