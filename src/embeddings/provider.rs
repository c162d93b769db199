// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Embedding provider trait and implementations

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::types::{Embedding, EmbeddingError};

/// Trait for embedding providers.
///
/// Providers turn text into fixed-dimension vectors. The client only ever
/// talks to this trait, so the remote service can be swapped without touching
/// the retrieval path.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError>;

    /// Vector dimension this provider produces.
    fn dimension(&self) -> usize;

    /// Model identifier, used in cache keys and logging.
    fn model_id(&self) -> &str;
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

/// HTTP-backed embedding provider.
pub struct HttpEmbeddingProvider {
    http_client: reqwest::Client,
    api_url: String,
    api_key: Option<String>,
    model_id: String,
    dimension: usize,
    timeout_ms: u64,
}

impl HttpEmbeddingProvider {
    pub fn new(
        api_url: String,
        api_key: Option<String>,
        model_id: String,
        dimension: usize,
        timeout_ms: u64,
    ) -> Result<Self, EmbeddingError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|e| EmbeddingError::ProviderUnavailable {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            api_url,
            api_key,
            model_id,
            dimension,
            timeout_ms,
        })
    }

    fn retry_after_secs(response: &reqwest::Response) -> u64 {
        response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(60)
    }
}

#[async_trait]
impl EmbeddingProvider for HttpEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let url = format!("{}/embeddings", self.api_url);
        let mut request = self.http_client.post(&url).json(&EmbedRequest {
            model: &self.model_id,
            input: texts,
        });

        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EmbeddingError::Timeout {
                    timeout_ms: self.timeout_ms,
                }
            } else {
                EmbeddingError::ProviderUnavailable {
                    reason: e.to_string(),
                }
            }
        })?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => {
                return Err(EmbeddingError::ProviderRateLimited {
                    retry_after_secs: Self::retry_after_secs(&response),
                });
            }
            status if !status.is_success() => {
                return Err(EmbeddingError::ProviderUnavailable {
                    reason: format!("provider returned HTTP {}", status),
                });
            }
            _ => {}
        }

        let body: EmbedResponse =
            response
                .json()
                .await
                .map_err(|e| EmbeddingError::ProviderUnavailable {
                    reason: format!("malformed provider response: {}", e),
                })?;

        if body.embeddings.len() != texts.len() {
            return Err(EmbeddingError::InvalidEmbedding {
                reason: format!(
                    "provider returned {} vectors for {} inputs",
                    body.embeddings.len(),
                    texts.len()
                ),
            });
        }

        Ok(body.embeddings.into_iter().map(Embedding::new).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Deterministic offline embedding provider.
///
/// Derives a pseudo-random unit vector per token from a SHA-256 digest and
/// sums them, so texts sharing tokens get similar vectors. Used for local
/// development and tests; counts its calls so tests can assert memoization.
pub struct MockEmbeddingProvider {
    dimension: usize,
    calls: AtomicU64,
}

impl MockEmbeddingProvider {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            calls: AtomicU64::new(0),
        }
    }

    /// Number of embed_batch calls issued against this provider.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn token_vector(&self, token: &str) -> Vec<f32> {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        let seed = hasher.finalize();

        // Expand the 32-byte digest to the full dimension by re-hashing with
        // a block counter.
        let mut values = Vec::with_capacity(self.dimension);
        let mut block: u32 = 0;
        while values.len() < self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(seed);
            hasher.update(block.to_le_bytes());
            let bytes = hasher.finalize();
            for chunk in bytes.chunks(2) {
                if values.len() == self.dimension {
                    break;
                }
                let raw = u16::from_le_bytes([chunk[0], chunk[1]]);
                values.push((raw as f32 / u16::MAX as f32) * 2.0 - 1.0);
            }
            block += 1;
        }
        values
    }

    fn embed_one(&self, text: &str) -> Embedding {
        let mut sum = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            let tv = self.token_vector(token);
            for (s, v) in sum.iter_mut().zip(tv.iter()) {
                *s += v;
            }
        }
        let mut embedding = Embedding::new(sum);
        embedding.normalize();
        embedding
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_id(&self) -> &str {
        "mock-bag-of-tokens"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_provider_deterministic() {
        let provider = MockEmbeddingProvider::new(64);
        let a = provider
            .embed_batch(&["fix auth bug".to_string()])
            .await
            .unwrap();
        let b = provider
            .embed_batch(&["fix auth bug".to_string()])
            .await
            .unwrap();
        assert_eq!(a[0].data(), b[0].data());
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_mock_provider_shared_tokens_are_similar() {
        let provider = MockEmbeddingProvider::new(128);
        let out = provider
            .embed_batch(&[
                "auth bug status".to_string(),
                "fix auth bug".to_string(),
                "grocery shopping list".to_string(),
            ])
            .await
            .unwrap();

        let related = out[0].cosine_similarity(&out[1]);
        let unrelated = out[0].cosine_similarity(&out[2]);
        assert!(related > unrelated);
        assert!(related > 0.4);
    }

    #[tokio::test]
    async fn test_mock_provider_unit_vectors() {
        let provider = MockEmbeddingProvider::new(64);
        let out = provider
            .embed_batch(&["hello world".to_string()])
            .await
            .unwrap();
        assert!((out[0].magnitude() - 1.0).abs() < 1e-5);
        assert_eq!(out[0].dimension(), 64);
    }
}
