// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Model provider trait and implementations
//!
//! The router depends only on this trait; OpenAI-style and Anthropic-style
//! services are interchangeable behind it, one registered provider per tier.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Provider/model tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Cheap,
    Medium,
    Premium,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelTier::Cheap => write!(f, "cheap"),
            ModelTier::Medium => write!(f, "medium"),
            ModelTier::Premium => write!(f, "premium"),
        }
    }
}

/// A tool the model may call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    pub arguments: serde_json::Value,
}

/// A completed generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelResponse {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub model: String,
    pub tier: ModelTier,
    /// Estimated call cost, fed into the rolling budget counter.
    pub cost_microdollars: u64,
}

/// One chunk of a streaming generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub delta: String,
    pub is_final: bool,
}

/// Errors from a model provider call.
#[derive(Debug, Clone, Error)]
pub enum ModelError {
    #[error("Model call timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Model provider rate limited")]
    RateLimited {
        /// Provider-supplied wait; honored before any computed backoff.
        retry_after: Option<Duration>,
    },

    #[error("Model provider unavailable: {reason}")]
    Unavailable { reason: String },

    /// Malformed request; never retried, never falls back
    #[error("Invalid model request: {reason}")]
    InvalidRequest { reason: String },

    /// Authorization failure; never retried, never falls back
    #[error("Model provider authorization failed: {reason}")]
    Unauthorized { reason: String },

    #[error("Malformed provider response: {reason}")]
    MalformedResponse { reason: String },
}

impl ModelError {
    /// Transient errors are retried and may fall back; terminal ones
    /// propagate immediately.
    pub fn is_retryable(&self) -> bool {
        match self {
            ModelError::Timeout { .. }
            | ModelError::RateLimited { .. }
            | ModelError::Unavailable { .. }
            | ModelError::MalformedResponse { .. } => true,
            ModelError::InvalidRequest { .. } | ModelError::Unauthorized { .. } => false,
        }
    }

    /// Provider-supplied retry-after, when one exists.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ModelError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Trait for LLM providers.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Tier this provider serves.
    fn tier(&self) -> ModelTier;

    /// Model identifier for logging and telemetry.
    fn model_id(&self) -> &str;

    /// Run one generation to completion.
    async fn generate(
        &self,
        prompt: &str,
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, ModelError>;

    /// Start a streaming generation: a lazy, finite sequence of chunks.
    ///
    /// The default implementation runs `generate` to completion and re-plays
    /// the text as word chunks; providers with native streaming override it.
    /// Dropping the stream cancels delivery; the producer detects the
    /// closed channel and stops.
    async fn generate_stream(
        &self,
        prompt: &str,
        tools: &[ToolSpec],
    ) -> Result<BoxStream<'static, Result<StreamChunk, ModelError>>, ModelError> {
        let response = self.generate(prompt, tools).await?;
        let (tx, rx) = mpsc::channel(16);

        tokio::spawn(async move {
            let mut words: Vec<String> = response
                .text
                .split_inclusive(' ')
                .map(|w| w.to_string())
                .collect();
            if words.is_empty() {
                words.push(String::new());
            }
            let last = words.len() - 1;
            for (i, word) in words.into_iter().enumerate() {
                let chunk = StreamChunk {
                    delta: word,
                    is_final: i == last,
                };
                if tx.send(Ok(chunk)).await.is_err() {
                    // Consumer went away; stop producing.
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    tools: &'a [ToolSpec],
}

#[derive(Deserialize)]
struct GenerateResponse {
    text: String,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

/// HTTP-backed model provider.
pub struct HttpModelProvider {
    http_client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model_id: String,
    tier: ModelTier,
    timeout_ms: u64,
    cost_per_call_microdollars: u64,
}

impl HttpModelProvider {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model_id: String,
        tier: ModelTier,
        timeout_ms: u64,
        cost_per_call_microdollars: u64,
    ) -> Result<Self, ModelError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| ModelError::Unavailable {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            api_url,
            api_key,
            model_id,
            tier,
            timeout_ms,
            cost_per_call_microdollars,
        })
    }
}

#[async_trait]
impl ModelProvider for HttpModelProvider {
    fn tier(&self) -> ModelTier {
        self.tier
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        prompt: &str,
        tools: &[ToolSpec],
    ) -> Result<ModelResponse, ModelError> {
        let url = format!("{}/generate", self.api_url);
        let mut request = self.http_client.post(&url).json(&GenerateRequest {
            model: &self.model_id,
            prompt,
            tools,
        });

        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Timeout {
                    timeout_ms: self.timeout_ms,
                }
            } else {
                ModelError::Unavailable {
                    reason: e.to_string(),
                }
            }
        })?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.parse::<u64>().ok())
                    .map(Duration::from_secs);
                return Err(ModelError::RateLimited { retry_after });
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                return Err(ModelError::Unauthorized {
                    reason: format!("provider returned HTTP {}", response.status()),
                });
            }
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                return Err(ModelError::InvalidRequest {
                    reason: format!("provider returned HTTP {}", response.status()),
                });
            }
            status if !status.is_success() => {
                return Err(ModelError::Unavailable {
                    reason: format!("provider returned HTTP {}", status),
                });
            }
            _ => {}
        }

        let body: GenerateResponse =
            response
                .json()
                .await
                .map_err(|e| ModelError::MalformedResponse {
                    reason: e.to_string(),
                })?;

        Ok(ModelResponse {
            text: body.text,
            tool_calls: body.tool_calls,
            model: self.model_id.clone(),
            tier: self.tier,
            cost_microdollars: self.cost_per_call_microdollars,
        })
    }
}

/// Scriptable in-memory provider for tests.
///
/// Outcomes queued with `push_failure`/`push_success` are consumed in order;
/// once the script is drained every call succeeds with the default text.
pub struct MockModelProvider {
    tier: ModelTier,
    model_id: String,
    default_text: String,
    cost_microdollars: u64,
    latency: Duration,
    script: Mutex<VecDeque<Result<String, ModelError>>>,
    calls: AtomicU64,
}

impl MockModelProvider {
    pub fn new(tier: ModelTier) -> Self {
        Self {
            tier,
            model_id: format!("mock-{}", tier),
            default_text: format!("response from {}", tier),
            cost_microdollars: match tier {
                ModelTier::Cheap => 100,
                ModelTier::Medium => 1_000,
                ModelTier::Premium => 10_000,
            },
            latency: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            calls: AtomicU64::new(0),
        }
    }

    /// Simulate a slow provider.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_default_text(mut self, text: &str) -> Self {
        self.default_text = text.to_string();
        self
    }

    pub fn with_cost(mut self, cost_microdollars: u64) -> Self {
        self.cost_microdollars = cost_microdollars;
        self
    }

    /// Queue one failing call.
    pub fn push_failure(&self, error: ModelError) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Err(error));
        }
    }

    /// Queue `n` failing calls.
    pub fn push_failures(&self, n: usize, error: ModelError) {
        for _ in 0..n {
            self.push_failure(error.clone());
        }
    }

    /// Queue one successful call with a specific text.
    pub fn push_success(&self, text: &str) {
        if let Ok(mut script) = self.script.lock() {
            script.push_back(Ok(text.to_string()));
        }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for MockModelProvider {
    fn tier(&self) -> ModelTier {
        self.tier
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    async fn generate(
        &self,
        _prompt: &str,
        _tools: &[ToolSpec],
    ) -> Result<ModelResponse, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.latency > Duration::ZERO {
            tokio::time::sleep(self.latency).await;
        }

        let scripted = self
            .script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front());

        match scripted {
            Some(Err(error)) => Err(error),
            Some(Ok(text)) => Ok(ModelResponse {
                text,
                tool_calls: Vec::new(),
                model: self.model_id.clone(),
                tier: self.tier,
                cost_microdollars: self.cost_microdollars,
            }),
            None => Ok(ModelResponse {
                text: self.default_text.clone(),
                tool_calls: Vec::new(),
                model: self.model_id.clone(),
                tier: self.tier,
                cost_microdollars: self.cost_microdollars,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ModelError::Timeout { timeout_ms: 1 }.is_retryable());
        assert!(ModelError::RateLimited { retry_after: None }.is_retryable());
        assert!(ModelError::Unavailable {
            reason: "down".to_string()
        }
        .is_retryable());
        assert!(!ModelError::InvalidRequest {
            reason: "bad".to_string()
        }
        .is_retryable());
        assert!(!ModelError::Unauthorized {
            reason: "key".to_string()
        }
        .is_retryable());
    }

    #[tokio::test]
    async fn test_mock_script_then_default() {
        let provider = MockModelProvider::new(ModelTier::Cheap);
        provider.push_failure(ModelError::Timeout { timeout_ms: 10 });
        provider.push_success("scripted");

        assert!(provider.generate("p", &[]).await.is_err());
        assert_eq!(provider.generate("p", &[]).await.unwrap().text, "scripted");
        assert_eq!(
            provider.generate("p", &[]).await.unwrap().text,
            "response from cheap"
        );
        assert_eq!(provider.call_count(), 3);
    }

    #[tokio::test]
    async fn test_default_stream_replays_full_text() {
        let provider = MockModelProvider::new(ModelTier::Cheap).with_default_text("one two three");
        let mut stream = provider.generate_stream("p", &[]).await.unwrap();

        let mut collected = String::new();
        let mut saw_final = false;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.unwrap();
            collected.push_str(&chunk.delta);
            saw_final = chunk.is_final;
        }
        assert_eq!(collected, "one two three");
        assert!(saw_final);
    }
}
