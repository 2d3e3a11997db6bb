//! Anthropic adapter — registered for credential management; generation is
//! not wired for it, so calls report the provider unavailable and the probe
//! validates at key-format level only.

use async_trait::async_trait;
use std::time::Instant;

use crate::error::{AiError, AiResult};
use crate::vault;

use super::{GenerationOutcome, ProbeOutcome, ProviderAdapter, PROVIDER_ANTHROPIC};

pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AnthropicAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_ANTHROPIC
    }

    async fn generate(
        &self,
        _key: &str,
        _system_prompt: &str,
        _user_prompt: &str,
        _temperature: f32,
        _max_tokens: u32,
    ) -> AiResult<GenerationOutcome> {
        Err(AiError::ProviderUnavailable {
            provider: PROVIDER_ANTHROPIC.into(),
            message: "generation is not enabled for this provider".into(),
        })
    }

    async fn probe(&self, key: &str) -> ProbeOutcome {
        let start = Instant::now();
        let (ok, reason) = vault::validate_format(PROVIDER_ANTHROPIC, key);
        ProbeOutcome {
            success: ok,
            provider: PROVIDER_ANTHROPIC.into(),
            message: if ok {
                "Anthropic key format is valid".into()
            } else {
                reason.unwrap_or_else(|| "invalid key format".into())
            },
            latency_ms: start.elapsed().as_millis() as u64,
            model_available: None,
        }
    }
}
