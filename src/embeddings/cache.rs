// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Content-addressed embedding cache
//!
//! Keyed by a hash of the normalized input text plus model id, so identical
//! text always maps to the same entry. Entries are shared across tenants and
//! live for a long TTL; LRU eviction bounds memory.

use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::types::Embedding;

struct CachedEmbedding {
    embedding: Embedding,
    inserted_at: Instant,
}

/// LRU + TTL cache mapping content hashes to embeddings.
pub struct EmbeddingCache {
    inner: Mutex<LruCache<String, CachedEmbedding>>,
    ttl: Duration,
}

impl EmbeddingCache {
    /// # Arguments
    /// * `capacity` - Maximum number of cached embeddings
    /// * `ttl` - Time-to-live for entries (weeks, not minutes)
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1024).unwrap());
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            ttl,
        }
    }

    /// Get a cached embedding, refreshing its recency.
    ///
    /// Expired entries are dropped on access and reported as misses.
    pub fn get(&self, content_hash: &str) -> Option<Embedding> {
        let mut cache = self.inner.lock().ok()?;
        match cache.get(content_hash) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                Some(entry.embedding.clone())
            }
            Some(_) => {
                cache.pop(content_hash);
                None
            }
            None => None,
        }
    }

    pub fn put(&self, content_hash: String, embedding: Embedding) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.put(
                content_hash,
                CachedEmbedding {
                    embedding,
                    inserted_at: Instant::now(),
                },
            );
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.clear();
        }
    }
}
