//! OpenAI-compatible chat-completions provider.
//!
//! Also serves OpenRouter and other gateways that speak the same API; point
//! `base_url` at them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::{
    call_with_retries, sha256_hex, LlmCompletion, LlmProvider, LlmProviderConfig, LlmProviderInfo,
    RetryMetrics, RetryMetricsSummary,
};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Default, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

pub struct OpenAiLlmProvider {
    config: LlmProviderConfig,
    client: reqwest::Client,
    metrics: RetryMetrics,
}

impl OpenAiLlmProvider {
    pub fn new(config: LlmProviderConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(
                config.timeout_seconds.unwrap_or(60),
            ))
            .build()
            .map_err(|e| EngineError::Provider(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self {
            config,
            client,
            metrics: RetryMetrics::new(),
        })
    }

    async fn make_request(&self, prompt: &str) -> EngineResult<LlmCompletion> {
        let api_key = self
            .config
            .api_key
            .as_ref()
            .ok_or_else(|| EngineError::Provider("API key required for openai provider".into()))?;

        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        let url = format!("{}/chat/completions", base_url);

        let request_body = ChatRequest {
            model: self.config.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };
        let payload_bytes = serde_json::to_vec(&request_body)
            .map_err(|e| EngineError::Provider(format!("failed to serialize request: {}", e)))?;
        let prompt_hash = sha256_hex(&payload_bytes);

        let mut request_builder = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json");

        // OpenRouter wants attribution headers; harmless elsewhere but only
        // sent when actually talking to it.
        if base_url.contains("openrouter.ai") {
            let referer = std::env::var("OPENROUTER_HTTP_REFERER")
                .unwrap_or_else(|_| "https://github.com/capforge/capforge".to_string());
            request_builder = request_builder
                .header("HTTP-Referer", referer)
                .header("X-Title", "capforge");
        }

        let start = Instant::now();
        let response = request_builder
            .body(payload_bytes)
            .send()
            .await
            .map_err(|e| EngineError::Provider(format!("HTTP request failed: {}", e)))?;
        let status = response.status();
        let raw_body = response
            .text()
            .await
            .map_err(|e| EngineError::Provider(format!("failed to read response body: {}", e)))?;

        if !status.is_success() {
            let preview: String = raw_body.chars().take(1000).collect();
            return Err(EngineError::Provider(format!(
                "chat completions request failed with status {}: {}",
                status.as_u16(),
                preview
            )));
        }

        let response_hash = sha256_hex(raw_body.as_bytes());
        let parsed: ChatResponse = serde_json::from_str(&raw_body)
            .map_err(|e| EngineError::Provider(format!("failed to parse response: {}", e)))?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| EngineError::Provider("response contained no choices".into()))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(LlmCompletion {
            content,
            prompt_hash,
            response_hash,
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            latency_ms: start.elapsed().as_millis().min(u64::MAX as u128) as u64,
        })
    }
}

#[async_trait]
impl LlmProvider for OpenAiLlmProvider {
    async fn generate(&self, prompt: &str) -> EngineResult<LlmCompletion> {
        call_with_retries(&self.config.retry, &self.metrics, || {
            self.make_request(prompt)
        })
        .await
    }

    fn get_info(&self) -> LlmProviderInfo {
        LlmProviderInfo {
            name: "openai".to_string(),
            model: self.config.model.clone(),
        }
    }

    fn retry_metrics(&self) -> Option<RetryMetricsSummary> {
        Some(self.metrics.summary())
    }
}
