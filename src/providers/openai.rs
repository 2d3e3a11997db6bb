//! OpenAI adapter — chat completions with separate system and user
//! messages. The only provider path with an explicit per-call deadline.

use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::error::{AiError, AiResult};

use super::{
    classify_http_failure, GenerationOutcome, ProbeOutcome, ProviderAdapter, TokenUsage,
    PROVIDER_OPENAI,
};

const API_BASE: &str = "https://api.openai.com/v1";

pub struct OpenAiAdapter {
    client: reqwest::Client,
    model: String,
    timeout: Duration,
}

impl OpenAiAdapter {
    pub fn new(model: &str, timeout_secs: u64) -> Self {
        Self {
            client: reqwest::Client::new(),
            model: model.to_string(),
            timeout: Duration::from_secs(timeout_secs),
        }
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_OPENAI
    }

    async fn generate(
        &self,
        key: &str,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> AiResult<GenerationOutcome> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system_prompt},
                {"role": "user", "content": user_prompt},
            ],
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let request = self
            .client
            .post(format!("{API_BASE}/chat/completions"))
            .bearer_auth(key)
            .json(&body)
            .send();

        let resp = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| AiError::Timeout {
                provider: PROVIDER_OPENAI.into(),
            })?
            .map_err(|e| AiError::ProviderUnavailable {
                provider: PROVIDER_OPENAI.into(),
                message: e.to_string(),
            })?;

        let status = resp.status().as_u16();
        if status != 200 {
            let err_body = resp.text().await.unwrap_or_default();
            return Err(classify_http_failure(PROVIDER_OPENAI, status, &err_body));
        }

        let resp_body: Value = resp.json().await.map_err(|e| AiError::InvalidResponse {
            provider: PROVIDER_OPENAI.into(),
            message: e.to_string(),
        })?;

        let text = resp_body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(AiError::InvalidResponse {
                provider: PROVIDER_OPENAI.into(),
                message: "empty response".into(),
            });
        }

        let usage = TokenUsage {
            prompt_tokens: resp_body["usage"]["prompt_tokens"].as_i64().unwrap_or(0),
            completion_tokens: resp_body["usage"]["completion_tokens"].as_i64().unwrap_or(0),
        };

        Ok(GenerationOutcome::from_text(
            PROVIDER_OPENAI,
            &self.model,
            text,
            usage,
        ))
    }

    async fn probe(&self, key: &str) -> ProbeOutcome {
        let start = Instant::now();
        let result = tokio::time::timeout(
            self.timeout,
            self.client.get(format!("{API_BASE}/models")).bearer_auth(key).send(),
        )
        .await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(resp)) if resp.status().is_success() => {
                let model_listed = resp.json::<Value>().await.ok().and_then(|body| {
                    body["data"].as_array().map(|models| {
                        models
                            .iter()
                            .any(|m| m["id"].as_str() == Some(self.model.as_str()))
                    })
                });
                ProbeOutcome {
                    success: true,
                    provider: PROVIDER_OPENAI.into(),
                    message: "OpenAI key is valid".into(),
                    latency_ms,
                    model_available: model_listed,
                }
            }
            Ok(Ok(resp)) => ProbeOutcome {
                success: false,
                provider: PROVIDER_OPENAI.into(),
                message: format!("OpenAI rejected the key (HTTP {})", resp.status().as_u16()),
                latency_ms,
                model_available: None,
            },
            Ok(Err(e)) => ProbeOutcome {
                success: false,
                provider: PROVIDER_OPENAI.into(),
                message: format!("connection failed: {e}"),
                latency_ms,
                model_available: None,
            },
            Err(_) => ProbeOutcome {
                success: false,
                provider: PROVIDER_OPENAI.into(),
                message: "probe timed out".into(),
                latency_ms,
                model_available: None,
            },
        }
    }
}
