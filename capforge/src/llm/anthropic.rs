//! Anthropic messages API provider.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::{
    call_with_retries, sha256_hex, LlmCompletion, LlmProvider, LlmProviderConfig, LlmProviderInfo,
    RetryMetrics, RetryMetricsSummary,
};
use crate::error::{EngineError, EngineResult};

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    messages: Vec<Message>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

pub struct AnthropicLlmProvider {
    config: LlmProviderConfig,
    client: reqwest::Client,
    metrics: RetryMetrics,
}

impl AnthropicLlmProvider {
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
        let api_key = self.config.api_key.as_ref().ok_or_else(|| {
            EngineError::Provider("API key required for anthropic provider".into())
        })?;

        let base_url = self
            .config
            .base_url
            .as_deref()
            .unwrap_or("https://api.anthropic.com/v1");
        let url = format!("{}/messages", base_url);

        let request_body = MessagesRequest {
            model: self.config.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            max_tokens: self.config.max_tokens.unwrap_or(4096),
            temperature: self.config.temperature,
        };
        let payload_bytes = serde_json::to_vec(&request_body)
            .map_err(|e| EngineError::Provider(format!("failed to serialize request: {}", e)))?;
        let prompt_hash = sha256_hex(&payload_bytes);

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("x-api-key", api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
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
                "messages request failed with status {}: {}",
                status.as_u16(),
                preview
            )));
        }

        let response_hash = sha256_hex(raw_body.as_bytes());
        let parsed: MessagesResponse = serde_json::from_str(&raw_body)
            .map_err(|e| EngineError::Provider(format!("failed to parse response: {}", e)))?;
        let content = parsed
            .content
            .first()
            .map(|block| block.text.clone())
            .ok_or_else(|| EngineError::Provider("response contained no content".into()))?;
        let usage = parsed.usage.unwrap_or_default();

        Ok(LlmCompletion {
            content,
            prompt_hash,
            response_hash,
            prompt_tokens: usage.input_tokens,
            completion_tokens: usage.output_tokens,
            latency_ms: start.elapsed().as_millis().min(u64::MAX as u128) as u64,
        })
    }
}

#[async_trait]
impl LlmProvider for AnthropicLlmProvider {
    async fn generate(&self, prompt: &str) -> EngineResult<LlmCompletion> {
        call_with_retries(&self.config.retry, &self.metrics, || {
            self.make_request(prompt)
        })
        .await
    }

    fn get_info(&self) -> LlmProviderInfo {
        LlmProviderInfo {
            name: "anthropic".to_string(),
            model: self.config.model.clone(),
        }
    }

    fn retry_metrics(&self) -> Option<RetryMetricsSummary> {
        Some(self.metrics.summary())
    }
}
