//! Reasoning-service abstraction.
//!
//! The engine's only contract with a reasoning service is "submit text,
//! receive text"; everything else (auth, transport, retries) lives behind
//! [`LlmProvider`]. Completions carry hashes and latency so iteration
//! records can reference exactly what was said without storing transcripts.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{LlmConfig, RetryConfig};
use crate::error::{EngineError, EngineResult};

mod anthropic;
mod openai;
mod stub;

pub use anthropic::AnthropicLlmProvider;
pub use openai::OpenAiLlmProvider;
pub use stub::{ScriptedLlmProvider, StubLlmProvider};

/// Supported provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderType {
    /// Deterministic canned responses, for tests and offline runs.
    Stub,
    /// OpenAI-compatible chat completions (also OpenRouter and friends via
    /// `base_url`).
    Openai,
    /// Anthropic messages API.
    Anthropic,
}

impl Default for LlmProviderType {
    fn default() -> Self {
        LlmProviderType::Stub
    }
}

/// Resolved provider configuration. Unlike [`LlmConfig`] this holds the
/// actual API key, so it is constructed late and never serialized.
#[derive(Debug, Clone)]
pub struct LlmProviderConfig {
    pub provider_type: LlmProviderType,
    pub model: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f64>,
    pub timeout_seconds: Option<u64>,
    pub retry: RetryConfig,
}

impl LlmProviderConfig {
    /// Resolve an [`LlmConfig`] into a provider config, reading the API key
    /// from the configured environment variable.
    pub fn resolve(config: &LlmConfig) -> Self {
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        Self {
            provider_type: config.provider_type,
            model: config.model.clone(),
            api_key,
            base_url: config.base_url.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout_seconds: config.timeout_seconds,
            retry: config.retry.clone(),
        }
    }
}

/// One completed provider call.
#[derive(Debug, Clone)]
pub struct LlmCompletion {
    pub content: String,
    /// sha-256 of the request payload, hex-encoded.
    pub prompt_hash: String,
    /// sha-256 of the raw response body, hex-encoded.
    pub response_hash: String,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub latency_ms: u64,
}

/// Abstract interface for reasoning services.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Submit a prompt and receive the completion with call bookkeeping.
    async fn generate(&self, prompt: &str) -> EngineResult<LlmCompletion>;

    /// Submit text, receive text.
    async fn generate_text(&self, prompt: &str) -> EngineResult<String> {
        Ok(self.generate(prompt).await?.content)
    }

    fn get_info(&self) -> LlmProviderInfo;

    /// Retry counters, when the provider tracks them.
    fn retry_metrics(&self) -> Option<RetryMetricsSummary> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct LlmProviderInfo {
    pub name: String,
    pub model: String,
}

/// Counters for provider call retry behavior.
#[derive(Debug, Default)]
pub struct RetryMetrics {
    /// All attempts, including first tries.
    total_attempts: AtomicU64,
    /// Attempts beyond the first that succeeded.
    successful_retries: AtomicU64,
    /// Attempts beyond the first that failed.
    failed_retries: AtomicU64,
    first_attempt_successes: AtomicU64,
    first_attempt_failures: AtomicU64,
}

impl RetryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, attempt: u32) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt == 1 {
            self.first_attempt_successes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.successful_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_failure(&self, attempt: u32) {
        self.total_attempts.fetch_add(1, Ordering::Relaxed);
        if attempt == 1 {
            self.first_attempt_failures.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_retries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn summary(&self) -> RetryMetricsSummary {
        RetryMetricsSummary {
            total_attempts: self.total_attempts.load(Ordering::Relaxed),
            successful_retries: self.successful_retries.load(Ordering::Relaxed),
            failed_retries: self.failed_retries.load(Ordering::Relaxed),
            first_attempt_successes: self.first_attempt_successes.load(Ordering::Relaxed),
            first_attempt_failures: self.first_attempt_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryMetricsSummary {
    pub total_attempts: u64,
    pub successful_retries: u64,
    pub failed_retries: u64,
    pub first_attempt_successes: u64,
    pub first_attempt_failures: u64,
}

impl RetryMetricsSummary {
    pub fn overall_success_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            (self.first_attempt_successes + self.successful_retries) as f64
                / self.total_attempts as f64
        }
    }

    pub fn retry_success_rate(&self) -> f64 {
        let retries = self.successful_retries + self.failed_retries;
        if retries == 0 {
            0.0
        } else {
            self.successful_retries as f64 / retries as f64
        }
    }
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Run `call` with the configured retry budget, doubling the backoff after
/// each failed attempt.
pub(crate) async fn call_with_retries<F, Fut>(
    retry: &RetryConfig,
    metrics: &RetryMetrics,
    mut call: F,
) -> EngineResult<LlmCompletion>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<LlmCompletion>>,
{
    let max_attempts = retry.max_retries.saturating_add(1);
    let mut backoff_ms = retry.backoff_ms;
    let mut last_error = None;
    for attempt in 1..=max_attempts {
        match call().await {
            Ok(completion) => {
                metrics.record_success(attempt);
                return Ok(completion);
            }
            Err(e) => {
                metrics.record_failure(attempt);
                tracing::warn!(attempt, max_attempts, error = %e, "provider call failed");
                last_error = Some(e);
                if attempt < max_attempts && backoff_ms > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(backoff_ms)).await;
                    backoff_ms = backoff_ms.saturating_mul(2);
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| EngineError::Provider("no attempts were made".to_string())))
}

pub struct LlmProviderFactory;

impl LlmProviderFactory {
    /// Create a provider from resolved configuration.
    pub fn create(config: LlmProviderConfig) -> EngineResult<Box<dyn LlmProvider>> {
        match config.provider_type {
            LlmProviderType::Stub => Ok(Box::new(StubLlmProvider::new(config))),
            LlmProviderType::Openai => Ok(Box::new(OpenAiLlmProvider::new(config)?)),
            LlmProviderType::Anthropic => Ok(Box::new(AnthropicLlmProvider::new(config)?)),
        }
    }

    /// Probe the environment for a usable provider: `OPENAI_API_KEY` first,
    /// then `ANTHROPIC_API_KEY`, falling back to the stub.
    pub fn default_from_env() -> EngineResult<Box<dyn LlmProvider>> {
        if let Ok(api_key) = std::env::var("OPENAI_API_KEY") {
            let config = LlmProviderConfig {
                provider_type: LlmProviderType::Openai,
                model: std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string()),
                api_key: Some(api_key),
                base_url: std::env::var("OPENAI_BASE_URL").ok(),
                max_tokens: Some(4096),
                temperature: Some(0.2),
                timeout_seconds: Some(60),
                retry: RetryConfig::default(),
            };
            return Self::create(config);
        }
        if let Ok(api_key) = std::env::var("ANTHROPIC_API_KEY") {
            let config = LlmProviderConfig {
                provider_type: LlmProviderType::Anthropic,
                model: std::env::var("ANTHROPIC_MODEL")
                    .unwrap_or_else(|_| "claude-3-5-haiku-latest".to_string()),
                api_key: Some(api_key),
                base_url: None,
                max_tokens: Some(4096),
                temperature: Some(0.2),
                timeout_seconds: Some(60),
                retry: RetryConfig::default(),
            };
            return Self::create(config);
        }
        tracing::warn!("no provider API key in environment, using stub provider");
        let config = LlmProviderConfig {
            provider_type: LlmProviderType::Stub,
            model: "stub-model".to_string(),
            api_key: None,
            base_url: None,
            max_tokens: None,
            temperature: None,
            timeout_seconds: None,
            retry: RetryConfig::default(),
        };
        Self::create(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_retries_then_succeeds() {
        let retry = RetryConfig {
            max_retries: 2,
            backoff_ms: 0,
        };
        let metrics = RetryMetrics::new();
        let calls = AtomicU32::new(0);
        let completion = call_with_retries(&retry, &metrics, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 1 {
                    Err(EngineError::Provider("transient".to_string()))
                } else {
                    Ok(LlmCompletion {
                        content: "ok".to_string(),
                        prompt_hash: String::new(),
                        response_hash: String::new(),
                        prompt_tokens: None,
                        completion_tokens: None,
                        latency_ms: 0,
                    })
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(completion.content, "ok");
        let summary = metrics.summary();
        assert_eq!(summary.total_attempts, 2);
        assert_eq!(summary.successful_retries, 1);
        assert_eq!(summary.first_attempt_failures, 1);
    }

    #[tokio::test]
    async fn test_retry_budget_exhausted() {
        let retry = RetryConfig {
            max_retries: 1,
            backoff_ms: 0,
        };
        let metrics = RetryMetrics::new();
        let result = call_with_retries(&retry, &metrics, || async {
            Err::<LlmCompletion, _>(EngineError::Provider("down".to_string()))
        })
        .await;
        assert!(result.is_err());
        assert_eq!(metrics.summary().total_attempts, 2);
    }

    #[test]
    fn test_sha256_hex_stable() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
