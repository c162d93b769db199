// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A fixed-dimension embedding vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    data: Vec<f32>,
    dimension: usize,
}

impl Embedding {
    pub fn new(data: Vec<f32>) -> Self {
        let dimension = data.len();
        Self { data, dimension }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn magnitude(&self) -> f32 {
        self.data.iter().map(|x| x * x).sum::<f32>().sqrt()
    }

    /// Check that every component is a finite number.
    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|v| v.is_finite())
    }

    /// Cosine similarity in [-1, 1]; 0.0 for mismatched dimensions or zero vectors.
    pub fn cosine_similarity(&self, other: &Embedding) -> f32 {
        if self.dimension != other.dimension {
            return 0.0;
        }

        let dot_product: f32 = self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| a * b)
            .sum();

        let magnitude_self = self.magnitude();
        let magnitude_other = other.magnitude();

        if magnitude_self == 0.0 || magnitude_other == 0.0 {
            0.0
        } else {
            dot_product / (magnitude_self * magnitude_other)
        }
    }

    pub(crate) fn normalize(&mut self) {
        let magnitude = self.magnitude();
        if magnitude > 0.0 {
            for value in &mut self.data {
                *value /= magnitude;
            }
        }
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }
}

/// Configuration for the embedding client.
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    /// Provider model identifier, mixed into cache keys so a model upgrade
    /// never serves vectors from the previous model.
    pub model_id: String,
    /// Expected vector dimension.
    pub dimension: usize,
    /// Maximum texts per provider batch call.
    pub max_batch_size: usize,
    /// Maximum cached embeddings before LRU eviction.
    pub cache_capacity: usize,
    /// Cache TTL in seconds. Weeks, not minutes: text→vector is stable for
    /// a fixed provider/model version.
    pub cache_ttl_secs: u64,
    /// Outbound provider requests per minute; None disables the limiter.
    pub rate_limit_per_minute: Option<u32>,
    /// Provider request timeout in milliseconds.
    pub provider_timeout_ms: u64,
    /// Normalize vectors to unit length after generation.
    pub normalize: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model_id: "all-MiniLM-L6-v2".to_string(),
            dimension: 384,
            max_batch_size: 100,
            cache_capacity: 100_000,
            cache_ttl_secs: 30 * 24 * 3600,
            rate_limit_per_minute: None,
            provider_timeout_ms: 5000,
            normalize: true,
        }
    }
}

/// Errors from embedding generation.
#[derive(Debug, Error)]
pub enum EmbeddingError {
    /// The provider could not be reached or returned a server error
    #[error("Embedding provider unavailable: {reason}")]
    ProviderUnavailable {
        /// What the provider reported, or the transport failure
        reason: String,
    },

    /// The provider rejected the request due to rate limiting
    #[error("Embedding provider rate limited, retry after {retry_after_secs}s")]
    ProviderRateLimited {
        /// Seconds to wait before retrying
        retry_after_secs: u64,
    },

    /// The provider returned a vector containing NaN or Infinity
    #[error("Invalid embedding from provider: {reason}")]
    InvalidEmbedding {
        /// Why the vector was rejected
        reason: String,
    },

    /// The provider returned a vector of the wrong dimension
    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// The provider request timed out
    #[error("Embedding request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The input text is unusable (e.g. empty after normalization)
    #[error("Invalid embedding input: {reason}")]
    InvalidInput { reason: String },
}
