//! Google Gemini adapter — generateContent over the generativelanguage
//! REST API. Text-completion style: system and user prompts are sent as a
//! single concatenated prompt.

use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};

use crate::error::{AiError, AiResult};

use super::{
    classify_http_failure, estimate_tokens, GenerationOutcome, ProbeOutcome, ProviderAdapter,
    TokenUsage, PROVIDER_GEMINI,
};

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct GeminiAdapter {
    client: reqwest::Client,
    model: String,
}

impl GeminiAdapter {
    pub fn new(model: &str) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
                .build()
                .unwrap_or_default(),
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        PROVIDER_GEMINI
    }

    async fn generate(
        &self,
        key: &str,
        system_prompt: &str,
        user_prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> AiResult<GenerationOutcome> {
        let url = format!("{API_BASE}/models/{}:generateContent?key={key}", self.model);
        let full_prompt = format!("{system_prompt}\n\n{user_prompt}");

        let body = serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": full_prompt}]}],
            "generationConfig": {
                "temperature": temperature,
                "maxOutputTokens": max_tokens,
            }
        });

        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| map_transport_error(e))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let err_body = resp.text().await.unwrap_or_default();
            return Err(classify_http_failure(PROVIDER_GEMINI, status, &err_body));
        }

        let resp_body: Value = resp.json().await.map_err(|e| AiError::InvalidResponse {
            provider: PROVIDER_GEMINI.into(),
            message: e.to_string(),
        })?;

        let text = resp_body["candidates"][0]["content"]["parts"][0]["text"]
            .as_str()
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(AiError::InvalidResponse {
                provider: PROVIDER_GEMINI.into(),
                message: "empty response".into(),
            });
        }

        let usage_meta = &resp_body["usageMetadata"];
        let usage = TokenUsage {
            prompt_tokens: usage_meta["promptTokenCount"]
                .as_i64()
                .unwrap_or_else(|| estimate_tokens(&full_prompt)),
            completion_tokens: usage_meta["candidatesTokenCount"]
                .as_i64()
                .unwrap_or_else(|| estimate_tokens(&text)),
        };

        Ok(GenerationOutcome::from_text(
            PROVIDER_GEMINI,
            &self.model,
            text,
            usage,
        ))
    }

    async fn probe(&self, key: &str) -> ProbeOutcome {
        // Listing models is free and validates the key without spending tokens.
        let start = Instant::now();
        let url = format!("{API_BASE}/models?key={key}");
        let result = self.client.get(&url).send().await;
        let latency_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(resp) if resp.status().is_success() => {
                let model_listed = resp
                    .json::<Value>()
                    .await
                    .ok()
                    .and_then(|body| {
                        body["models"].as_array().map(|models| {
                            models.iter().any(|m| {
                                m["name"]
                                    .as_str()
                                    .map(|n| n.ends_with(self.model.as_str()))
                                    .unwrap_or(false)
                            })
                        })
                    });
                ProbeOutcome {
                    success: true,
                    provider: PROVIDER_GEMINI.into(),
                    message: "Gemini key is valid".into(),
                    latency_ms,
                    model_available: model_listed,
                }
            }
            Ok(resp) => ProbeOutcome {
                success: false,
                provider: PROVIDER_GEMINI.into(),
                message: format!("Gemini rejected the key (HTTP {})", resp.status().as_u16()),
                latency_ms,
                model_available: None,
            },
            Err(e) => ProbeOutcome {
                success: false,
                provider: PROVIDER_GEMINI.into(),
                message: format!("connection failed: {e}"),
                latency_ms,
                model_available: None,
            },
        }
    }
}

fn map_transport_error(e: reqwest::Error) -> AiError {
    if e.is_timeout() {
        AiError::Timeout {
            provider: PROVIDER_GEMINI.into(),
        }
    } else {
        AiError::ProviderUnavailable {
            provider: PROVIDER_GEMINI.into(),
            message: e.to_string(),
        }
    }
}
