//! The orchestrator — owns every layer and exposes the operations the
//! request handlers invoke. Constructed once at startup and passed into
//! each handler scope; no ambient globals.

use std::collections::HashMap;
use std::sync::Arc;
use zeroize::Zeroize;

use serde_json::{json, Value};

use crate::anomaly::AnomalyDetector;
use crate::cache::AiCache;
use crate::config::AiConfig;
use crate::error::{AiError, AiResult};
use crate::features::FeatureGate;
use crate::forecast::Forecaster;
use crate::nlp::NlParser;
use crate::providers::anthropic::AnthropicAdapter;
use crate::providers::client::AiClient;
use crate::providers::gemini::GeminiAdapter;
use crate::providers::openai::OpenAiAdapter;
use crate::providers::registry::CredentialRegistry;
use crate::providers::{ProbeOutcome, ProviderAdapter};
use crate::report::ReportSummarizer;
use crate::store::Store;
use crate::suggest::SuggestionEngine;
use crate::vault::Vault;

pub struct Orchestrator {
    pub cfg: Arc<AiConfig>,
    pub store: Arc<Store>,
    pub cache: Arc<AiCache>,
    pub gate: Arc<FeatureGate>,
    pub registry: Arc<CredentialRegistry>,
    pub client: Arc<AiClient>,
    pub suggestions: SuggestionEngine,
    pub anomalies: AnomalyDetector,
    pub forecaster: Forecaster,
    pub nlp: NlParser,
    pub reports: ReportSummarizer,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish()
    }
}

impl Orchestrator {
    /// Standard construction: open the configured database and register
    /// the real provider adapters.
    pub fn open(cfg: AiConfig) -> anyhow::Result<Self> {
        let store = Arc::new(Store::open(&cfg.db_path)?);
        let mut adapters: HashMap<&'static str, Box<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert("gemini", Box::new(GeminiAdapter::new(&cfg.gemini_model)));
        adapters.insert(
            "openai",
            Box::new(OpenAiAdapter::new(&cfg.openai_model, cfg.openai_timeout_secs)),
        );
        adapters.insert("anthropic", Box::new(AnthropicAdapter::new()));
        Ok(Self::with_parts(Arc::new(cfg), store, adapters)?)
    }

    /// Assembly from parts; tests inject in-memory stores and scripted
    /// adapters through here.
    pub fn with_parts(
        cfg: Arc<AiConfig>,
        store: Arc<Store>,
        adapters: HashMap<&'static str, Box<dyn ProviderAdapter>>,
    ) -> AiResult<Self> {
        let vault = Arc::new(Vault::new(&cfg.master_encryption_key)?);
        let cache = Arc::new(AiCache::in_memory(&cfg));
        let gate = Arc::new(FeatureGate::new(store.clone()));
        let registry = Arc::new(CredentialRegistry::new(store.clone(), vault));
        let client = Arc::new(AiClient::new(adapters, registry.clone(), &cfg));

        let suggestions = SuggestionEngine::new(
            store.clone(),
            cache.clone(),
            gate.clone(),
            client.clone(),
            cfg.clone(),
        );
        let anomalies =
            AnomalyDetector::new(store.clone(), cache.clone(), gate.clone(), cfg.clone());
        let forecaster = Forecaster::new(store.clone(), cache.clone(), gate.clone());
        let nlp = NlParser::new(store.clone(), gate.clone(), client.clone(), cfg.clone());
        let reports = ReportSummarizer::new(store.clone(), gate.clone(), client.clone());

        Ok(Self {
            cfg,
            store,
            cache,
            gate,
            registry,
            client,
            suggestions,
            anomalies,
            forecaster,
            nlp,
            reports,
        })
    }

    /// Subsystem status: provider availability plus feature toggles.
    pub fn status(&self) -> AiResult<Value> {
        let availability = self.client.availability();
        Ok(json!({
            "providers": availability,
            "any_provider_available": self.client.any_available(),
            "features": self.gate.admin_features_summary()?,
        }))
    }

    // ── Credential administration ───────────────────────────────────

    pub fn credentials_list(&self, provider: Option<&str>, active_only: bool) -> AiResult<Value> {
        let records = self.registry.list(provider, active_only)?;
        let total = records.len();
        Ok(json!({ "items": records, "total": total }))
    }

    pub fn credentials_create(
        &self,
        provider: &str,
        api_key: String,
        label: Option<&str>,
        notes: Option<&str>,
        created_by: Option<i64>,
    ) -> AiResult<Value> {
        let record = self.registry.create(provider, api_key, label, notes, created_by)?;
        Ok(serde_json::to_value(record).unwrap_or_default())
    }

    pub fn credentials_get(&self, id: i64) -> AiResult<Value> {
        Ok(serde_json::to_value(self.registry.get(id)?).unwrap_or_default())
    }

    pub fn credentials_update(
        &self,
        id: i64,
        label: Option<&str>,
        notes: Option<&str>,
        is_active: Option<bool>,
    ) -> AiResult<Value> {
        let record = self.registry.update(id, label, notes, is_active)?;
        Ok(serde_json::to_value(record).unwrap_or_default())
    }

    pub fn credentials_delete(&self, id: i64) -> AiResult<Value> {
        let deleted = self.registry.delete(id)?;
        if !deleted {
            return Err(AiError::NotFound(format!("credential {id}")));
        }
        Ok(json!({ "deleted": true }))
    }

    /// Provider-specific liveness check against a stored credential.
    pub async fn credentials_test(&self, id: i64) -> AiResult<ProbeOutcome> {
        let record = self.registry.get(id)?;
        let mut key = self.registry.decrypted_key(id)?;
        let outcome = self.client.probe(&record.provider, &key).await;
        key.zeroize();
        outcome.ok_or_else(|| AiError::ProviderUnavailable {
            provider: record.provider,
            message: "no adapter registered".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::client::mock::{MockAdapter, Script};

    fn orchestrator() -> Orchestrator {
        let cfg = Arc::new(AiConfig::for_tests());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let mut adapters: HashMap<&'static str, Box<dyn ProviderAdapter>> = HashMap::new();
        adapters.insert(
            "gemini",
            Box::new(MockAdapter::new("gemini", Script::Succeed("ok".into()))),
        );
        adapters.insert("anthropic", Box::new(AnthropicAdapter::new()));
        Orchestrator::with_parts(cfg, store, adapters).unwrap()
    }

    #[test]
    fn test_credential_lifecycle() {
        let orch = orchestrator();
        let created = orch
            .credentials_create("gemini", "AIzaSyTest0123456789xyz".into(), Some("prod"), None, Some(1))
            .unwrap();
        let id = created["id"].as_i64().unwrap();
        assert_eq!(created["key_preview"], "...9xyz");
        assert!(created.get("encrypted_key").is_none());

        let listed = orch.credentials_list(Some("gemini"), true).unwrap();
        assert_eq!(listed["total"], 1);

        let updated = orch
            .credentials_update(id, Some("staging"), None, Some(false))
            .unwrap();
        assert_eq!(updated["label"], "staging");
        assert_eq!(updated["is_active"], false);

        orch.credentials_delete(id).unwrap();
        assert!(matches!(
            orch.credentials_get(id).unwrap_err(),
            AiError::NotFound(_)
        ));
        assert!(matches!(
            orch.credentials_delete(id).unwrap_err(),
            AiError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_credential_probe_roundtrip() {
        let orch = orchestrator();
        let created = orch
            .credentials_create("anthropic", "sk-ant-test123456".into(), None, None, None)
            .unwrap();
        let id = created["id"].as_i64().unwrap();
        let probe = orch.credentials_test(id).await.unwrap();
        assert!(probe.success);
        assert_eq!(probe.provider, "anthropic");
    }

    #[test]
    fn test_status_reports_availability() {
        let orch = orchestrator();
        let status = orch.status().unwrap();
        assert_eq!(status["any_provider_available"], false);
        orch.credentials_create("gemini", "AIzaSyTest0123456789xyz".into(), None, None, None)
            .unwrap();
        let status = orch.status().unwrap();
        assert_eq!(status["any_provider_available"], true);
        assert_eq!(status["providers"]["gemini"], true);
        assert_eq!(status["features"].as_array().unwrap().len(), 6);
    }

    #[test]
    fn test_short_master_key_refused() {
        let mut cfg = AiConfig::for_tests();
        cfg.master_encryption_key = "short".into();
        let store = Arc::new(Store::open_in_memory().unwrap());
        let result = Orchestrator::with_parts(Arc::new(cfg), store, HashMap::new());
        assert!(matches!(result.unwrap_err(), AiError::CryptoFailure(_)));
    }
}
