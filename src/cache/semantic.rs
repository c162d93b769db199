// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::embeddings::Embedding;
use crate::router::ModelResponse;

/// Caller-supplied query classification. Write-intent queries (create/
/// update/delete) must execute; their responses are never cached. The
/// classification is an input, not inferred here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryIntent {
    Read,
    Write,
}

/// Time-sensitive queries get the shorter TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuerySensitivity {
    Normal,
    TimeSensitive,
}

#[derive(Debug, Clone)]
pub struct SemanticCacheConfig {
    /// Minimum cosine similarity to serve a cached response (default 0.95).
    pub similarity_threshold: f32,
    /// Looser threshold the orchestrator uses when all providers are down.
    pub relaxed_threshold: f32,
    pub ttl_secs: u64,
    pub time_sensitive_ttl_secs: u64,
    /// Total entry ceiling across all owners; LRU eviction beyond it.
    pub max_entries: usize,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.95,
            relaxed_threshold: 0.80,
            ttl_secs: 3600,
            time_sensitive_ttl_secs: 300,
            max_entries: 10_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum SemanticCacheError {
    /// Cache access without a tenant scope. Fails closed, same as the index.
    #[error("Cache access without an owner is not permitted")]
    MissingOwner,
}

/// A served cache entry.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: ModelResponse,
    pub similarity: f32,
    pub created_at: DateTime<Utc>,
    /// Hash of the question that produced the cached answer, for log
    /// correlation without storing user text in logs.
    pub query_text_hash: String,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    pub stored: u64,
    pub write_intent_skipped: u64,
    pub evictions: u64,
    pub current_size: usize,
}

struct CacheSlot {
    id: String,
    query_text_hash: String,
    embedding: Embedding,
    response: ModelResponse,
    created_at: DateTime<Utc>,
    inserted_at: Instant,
    ttl: Duration,
    /// Logical clock value of the last access, for LRU eviction.
    last_accessed: u64,
    seq: u64,
}

impl CacheSlot {
    fn is_expired(&self) -> bool {
        self.inserted_at.elapsed() > self.ttl
    }
}

struct CacheInner {
    entries: HashMap<String, Vec<CacheSlot>>,
    total: usize,
    clock: u64,
    stats: CacheStats,
}

/// Per-owner semantic response cache.
///
/// Keys are `(owner_id, query_embedding)` only; conversation history is
/// deliberately not part of the key (multi-turn-aware caching is a
/// non-goal pending product clarification).
pub struct SemanticResponseCache {
    config: SemanticCacheConfig,
    inner: RwLock<CacheInner>,
}

impl SemanticResponseCache {
    pub fn new(config: SemanticCacheConfig) -> Self {
        Self {
            config,
            inner: RwLock::new(CacheInner {
                entries: HashMap::new(),
                total: 0,
                clock: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    pub fn config(&self) -> &SemanticCacheConfig {
        &self.config
    }

    /// Find the best-scoring entry for this owner at or above the threshold.
    ///
    /// Only this owner's entries are scanned. Expired entries are dropped on
    /// the way through. Ties on similarity go to the most recent entry.
    pub async fn lookup(
        &self,
        owner_id: &str,
        query_embedding: &Embedding,
        threshold_override: Option<f32>,
    ) -> Result<Option<CacheHit>, SemanticCacheError> {
        if owner_id.trim().is_empty() {
            return Err(SemanticCacheError::MissingOwner);
        }
        let threshold = threshold_override.unwrap_or(self.config.similarity_threshold);

        let mut inner = self.inner.write().await;
        inner.stats.lookups += 1;

        let Some(slots) = inner.entries.get_mut(owner_id) else {
            inner.stats.misses += 1;
            return Ok(None);
        };

        let before = slots.len();
        slots.retain(|slot| !slot.is_expired());
        let dropped = before - slots.len();

        let mut best: Option<(usize, f32)> = None;
        for (i, slot) in slots.iter().enumerate() {
            let similarity = slot.embedding.cosine_similarity(query_embedding);
            let better = match best {
                None => true,
                Some((best_i, best_sim)) => {
                    similarity > best_sim
                        || (similarity == best_sim
                            && (slot.created_at, slot.seq)
                                > (slots[best_i].created_at, slots[best_i].seq))
                }
            };
            if better {
                best = Some((i, similarity));
            }
        }

        let hit = match best {
            Some((i, similarity)) if similarity >= threshold => {
                let slot = &mut slots[i];
                let hit = CacheHit {
                    response: slot.response.clone(),
                    similarity,
                    created_at: slot.created_at,
                    query_text_hash: slot.query_text_hash.clone(),
                };
                Some((hit, i))
            }
            _ => None,
        };

        inner.total -= dropped;
        match hit {
            Some((hit, i)) => {
                inner.clock += 1;
                let clock = inner.clock;
                if let Some(slot) = inner
                    .entries
                    .get_mut(owner_id)
                    .and_then(|slots| slots.get_mut(i))
                {
                    slot.last_accessed = clock;
                }
                inner.stats.hits += 1;
                inner.stats.current_size = inner.total;
                debug!(owner_id, similarity = hit.similarity, "semantic cache hit");
                Ok(Some(hit))
            }
            None => {
                inner.stats.misses += 1;
                inner.stats.current_size = inner.total;
                Ok(None)
            }
        }
    }

    /// Store a generated response for future lookups.
    ///
    /// Write-intent queries are never stored; returns `Ok(None)` for them.
    pub async fn store(
        &self,
        owner_id: &str,
        query_text: &str,
        query_embedding: Embedding,
        response: ModelResponse,
        sensitivity: QuerySensitivity,
        intent: QueryIntent,
    ) -> Result<Option<String>, SemanticCacheError> {
        if owner_id.trim().is_empty() {
            return Err(SemanticCacheError::MissingOwner);
        }

        let mut inner = self.inner.write().await;

        if intent == QueryIntent::Write {
            inner.stats.write_intent_skipped += 1;
            debug!(owner_id, "write-intent query not cached");
            return Ok(None);
        }

        let ttl_secs = match sensitivity {
            QuerySensitivity::Normal => self.config.ttl_secs,
            QuerySensitivity::TimeSensitive => self.config.time_sensitive_ttl_secs,
        };

        while inner.total >= self.config.max_entries.max(1) {
            Self::evict_lru(&mut inner);
        }

        inner.clock += 1;
        let clock = inner.clock;
        let id = format!("sc_{}", Uuid::new_v4());
        let slot = CacheSlot {
            id: id.clone(),
            query_text_hash: hash_query_text(query_text),
            embedding: query_embedding,
            response,
            created_at: Utc::now(),
            inserted_at: Instant::now(),
            ttl: Duration::from_secs(ttl_secs),
            last_accessed: clock,
            seq: clock,
        };

        inner
            .entries
            .entry(owner_id.to_string())
            .or_default()
            .push(slot);
        inner.total += 1;
        inner.stats.stored += 1;
        inner.stats.current_size = inner.total;

        Ok(Some(id))
    }

    /// Drop every expired entry now instead of lazily on lookup.
    pub async fn purge_expired(&self) {
        let mut inner = self.inner.write().await;
        let mut total = 0;
        for slots in inner.entries.values_mut() {
            slots.retain(|slot| !slot.is_expired());
            total += slots.len();
        }
        inner.entries.retain(|_, slots| !slots.is_empty());
        inner.total = total;
        inner.stats.current_size = total;
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.read().await;
        let mut stats = inner.stats.clone();
        stats.current_size = inner.total;
        stats
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.total
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Evict the least-recently-used slot across all owners.
    fn evict_lru(inner: &mut CacheInner) {
        let victim = inner
            .entries
            .iter()
            .flat_map(|(owner, slots)| {
                slots
                    .iter()
                    .map(move |slot| (owner.clone(), slot.id.clone(), slot.last_accessed))
            })
            .min_by_key(|(_, _, last_accessed)| *last_accessed);

        if let Some((owner, slot_id, _)) = victim {
            if let Some(slots) = inner.entries.get_mut(&owner) {
                slots.retain(|slot| slot.id != slot_id);
                if slots.is_empty() {
                    inner.entries.remove(&owner);
                }
            }
            inner.total = inner.total.saturating_sub(1);
            inner.stats.evictions += 1;
        } else {
            // Nothing to evict; avoid spinning.
            inner.total = 0;
        }
    }
}

fn hash_query_text(query_text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query_text.as_bytes());
    format!("{:x}", hasher.finalize())
}
