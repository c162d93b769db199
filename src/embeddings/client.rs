// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Memoizing embedding client
//!
//! Front door for everything in the engine that needs a vector. Checks the
//! content-addressed cache before paying for a provider call, batches misses,
//! and validates every vector the provider returns before it can reach the
//! index or be cached.

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::cache::EmbeddingCache;
use super::provider::EmbeddingProvider;
use super::types::{Embedding, EmbeddingConfig, EmbeddingError};

/// Hit/miss counters for the embedding cache.
#[derive(Debug, Clone, Default)]
pub struct EmbedStats {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub provider_calls: u64,
}

pub struct EmbeddingClient {
    config: EmbeddingConfig,
    provider: Arc<dyn EmbeddingProvider>,
    cache: EmbeddingCache,
    limiter: Option<GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    provider_calls: AtomicU64,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig, provider: Arc<dyn EmbeddingProvider>) -> Self {
        let cache = EmbeddingCache::new(
            config.cache_capacity,
            Duration::from_secs(config.cache_ttl_secs),
        );

        let limiter = config.rate_limit_per_minute.and_then(|rpm| {
            NonZeroU32::new(rpm).map(|rpm| GovRateLimiter::direct(Quota::per_minute(rpm)))
        });

        Self {
            config,
            provider,
            cache,
            limiter,
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            provider_calls: AtomicU64::new(0),
        }
    }

    /// Embed a single text, serving from cache when possible.
    pub async fn embed(&self, text: &str) -> Result<Embedding, EmbeddingError> {
        let mut embeddings = self.embed_batch(std::slice::from_ref(&text.to_string())).await?;
        embeddings
            .pop()
            .ok_or_else(|| EmbeddingError::InvalidEmbedding {
                reason: "provider returned no vector".to_string(),
            })
    }

    /// Embed a batch of texts, one vector per input, in input order.
    ///
    /// Inputs are partitioned into cache hits and provider-bound misses;
    /// misses go out in batches of at most `max_batch_size`. Duplicate texts
    /// within the batch cost a single provider slot.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbeddingError> {
        let mut results: Vec<Option<Embedding>> = vec![None; texts.len()];
        // hash -> positions in the input that want this text
        let mut pending_positions: HashMap<String, Vec<usize>> = HashMap::new();
        let mut pending: Vec<(String, String)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let normalized = normalize_text(text)?;
            let hash = self.content_hash(&normalized);

            if let Some(hit) = self.cache.get(&hash) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                results[i] = Some(hit);
                continue;
            }

            self.cache_misses.fetch_add(1, Ordering::Relaxed);
            if !pending_positions.contains_key(&hash) {
                pending.push((hash.clone(), normalized));
            }
            pending_positions.entry(hash).or_default().push(i);
        }

        if !pending.is_empty() {
            debug!(
                misses = pending.len(),
                hits = texts.len() - pending_positions.values().map(Vec::len).sum::<usize>(),
                "embedding cache partition"
            );
        }

        for chunk in pending.chunks(self.config.max_batch_size.max(1)) {
            self.check_rate_limit()?;

            let chunk_texts: Vec<String> = chunk.iter().map(|(_, t)| t.clone()).collect();
            self.provider_calls.fetch_add(1, Ordering::SeqCst);
            let embeddings = self.provider.embed_batch(&chunk_texts).await?;

            if embeddings.len() != chunk.len() {
                return Err(EmbeddingError::InvalidEmbedding {
                    reason: format!(
                        "provider returned {} vectors for {} inputs",
                        embeddings.len(),
                        chunk.len()
                    ),
                });
            }

            for ((hash, _), embedding) in chunk.iter().zip(embeddings.into_iter()) {
                let embedding = self.validate(embedding)?;
                self.cache.put(hash.clone(), embedding.clone());
                if let Some(positions) = pending_positions.get(hash) {
                    for &i in positions {
                        results[i] = Some(embedding.clone());
                    }
                }
            }
        }

        results
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| EmbeddingError::InvalidEmbedding {
                    reason: "provider response missing a vector".to_string(),
                })
            })
            .collect()
    }

    /// Validate a provider vector; bad vectors are never cached.
    fn validate(&self, mut embedding: Embedding) -> Result<Embedding, EmbeddingError> {
        if !embedding.is_finite() {
            return Err(EmbeddingError::InvalidEmbedding {
                reason: "vector contains NaN or Infinity".to_string(),
            });
        }
        if embedding.dimension() != self.config.dimension {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.config.dimension,
                got: embedding.dimension(),
            });
        }
        if self.config.normalize {
            embedding.normalize();
        }
        Ok(embedding)
    }

    fn check_rate_limit(&self) -> Result<(), EmbeddingError> {
        if let Some(limiter) = &self.limiter {
            if limiter.check().is_err() {
                return Err(EmbeddingError::ProviderRateLimited {
                    retry_after_secs: 60,
                });
            }
        }
        Ok(())
    }

    /// Deterministic content hash of normalized text, keyed to the model.
    fn content_hash(&self, normalized: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.provider.model_id().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn dimension(&self) -> usize {
        self.config.dimension
    }

    pub fn stats(&self) -> EmbedStats {
        EmbedStats {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            provider_calls: self.provider_calls.load(Ordering::SeqCst),
        }
    }

    /// Number of provider calls issued so far.
    pub fn provider_call_count(&self) -> u64 {
        self.provider_calls.load(Ordering::SeqCst)
    }
}

/// Trim and collapse internal whitespace. Case is preserved: embedding
/// providers are case-sensitive.
fn normalize_text(text: &str) -> Result<String, EmbeddingError> {
    let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if normalized.is_empty() {
        return Err(EmbeddingError::InvalidInput {
            reason: "text is empty after normalization".to_string(),
        });
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::super::provider::MockEmbeddingProvider;
    use super::*;

    fn client_with_mock(dimension: usize) -> (EmbeddingClient, Arc<MockEmbeddingProvider>) {
        let provider = Arc::new(MockEmbeddingProvider::new(dimension));
        let config = EmbeddingConfig {
            dimension,
            ..Default::default()
        };
        (EmbeddingClient::new(config, provider.clone()), provider)
    }

    #[tokio::test]
    async fn test_second_embed_is_a_cache_hit() {
        let (client, provider) = client_with_mock(64);

        let a = client.embed("fix the auth bug").await.unwrap();
        let b = client.embed("fix the auth bug").await.unwrap();

        assert_eq!(a.data(), b.data());
        assert_eq!(provider.call_count(), 1);
        assert_eq!(client.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_whitespace_normalization_shares_cache_entry() {
        let (client, provider) = client_with_mock(64);

        client.embed("fix  the   auth bug").await.unwrap();
        client.embed("  fix the auth bug  ").await.unwrap();

        assert_eq!(provider.call_count(), 1);
    }

    #[tokio::test]
    async fn test_batch_partitions_hits_and_misses() {
        let (client, provider) = client_with_mock(64);

        client.embed("alpha").await.unwrap();
        let out = client
            .embed_batch(&["alpha".to_string(), "beta".to_string(), "alpha".to_string()])
            .await
            .unwrap();

        assert_eq!(out.len(), 3);
        assert_eq!(out[0].data(), out[2].data());
        // One warm-up call plus one batched call for the single miss
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let (client, provider) = client_with_mock(64);
        let err = client.embed("   ").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::InvalidInput { .. }));
        assert_eq!(provider.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_surfaces_as_rate_limited() {
        let provider = Arc::new(MockEmbeddingProvider::new(16));
        let config = EmbeddingConfig {
            dimension: 16,
            rate_limit_per_minute: Some(1),
            ..Default::default()
        };
        let client = EmbeddingClient::new(config, provider);

        client.embed("first").await.unwrap();
        let err = client.embed("second").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::ProviderRateLimited { .. }));
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        // Provider emits 32-dim vectors but the client expects 16
        let provider = Arc::new(MockEmbeddingProvider::new(32));
        let config = EmbeddingConfig {
            dimension: 16,
            ..Default::default()
        };
        let client = EmbeddingClient::new(config, provider);

        let err = client.embed("hello").await.unwrap_err();
        assert!(matches!(err, EmbeddingError::DimensionMismatch { .. }));
    }
}
