// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Document store and owner-scoped search
//!
//! One current vector per `document_id`, versioned on re-embed. The owner
//! filter on search is the primary data-isolation invariant of the engine:
//! a search without a tenant scope fails closed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::hnsw::AnnGraph;

/// Kind of indexed content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    Task,
    Event,
    Note,
}

/// A document ready for indexing (already embedded).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: String,
    pub owner_id: String,
    pub kind: DocumentKind,
    pub content: String,
    /// Open key-value payload (title, timestamps, status, ...).
    pub metadata: Value,
    pub vector: Vec<f32>,
}

/// Outcome of an upsert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub document_id: String,
    /// Monotonic embed version; unchanged content keeps the version.
    pub version: u64,
    /// False when the upsert was an idempotent no-op.
    pub updated: bool,
}

/// Search result with payload copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredDocument {
    pub document_id: String,
    /// Cosine similarity in [-1, 1], higher = more similar.
    pub score: f32,
    pub kind: DocumentKind,
    pub content: String,
    pub metadata: Value,
    pub version: u64,
}

/// Optional search narrowing on top of the mandatory owner scope.
#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub kind: Option<DocumentKind>,
    pub min_score: Option<f32>,
}

#[derive(Debug, Clone)]
pub struct IndexConfig {
    pub dimension: usize,
    /// Bounded node degree (HNSW `M`).
    pub max_connections: usize,
    /// Construction-time search breadth.
    pub ef_construction: usize,
    /// Query-time search breadth floor.
    pub ef_search: usize,
    /// Expected corpus size, used for graph layer sizing.
    pub capacity: usize,
    /// Candidate over-fetch multiplier to survive owner filtering.
    pub over_fetch: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dimension: 384,
            max_connections: 12,
            ef_construction: 48,
            ef_search: 50,
            capacity: 16_384,
            over_fetch: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_documents: usize,
    pub distinct_owners: usize,
    /// Graph nodes tombstoned by deletes/re-embeds, reclaimed on rebuild.
    pub stale_nodes: usize,
    pub bulk_loading: bool,
    pub dimension: usize,
}

#[derive(Debug, Error)]
pub enum IndexError {
    /// A search was issued without a tenant scope. Fails closed.
    #[error("Search without an owner filter is not permitted")]
    MissingOwnerFilter,

    #[error("Vector dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Invalid vector: {reason}")]
    InvalidVector { reason: String },

    /// `owner_id` is immutable after creation
    #[error("Document {document_id} already belongs to another owner")]
    OwnerImmutable { document_id: String },
}

struct IndexedEntry {
    owner_id: String,
    kind: DocumentKind,
    content: String,
    content_hash: String,
    metadata: Value,
    vector: Vec<f32>,
    version: u64,
    graph_id: usize,
}

struct IndexInner {
    entries: HashMap<String, IndexedEntry>,
    /// Live graph node → document id. Absent nodes are tombstones.
    graph_ids: HashMap<usize, String>,
    graph: AnnGraph,
    next_graph_id: usize,
    stale_nodes: usize,
    /// Vectors awaiting graph linking while a bulk load is active.
    bulk_pending: Option<Vec<(usize, Vec<f32>)>>,
}

/// Owner-scoped vector index over an HNSW graph.
///
/// Upserts are idempotent by `document_id`; deletes are hard deletes. All
/// mutation goes through a single write lock, which serializes racing
/// upserts on the same document id.
pub struct VectorIndex {
    config: IndexConfig,
    inner: RwLock<IndexInner>,
}

impl VectorIndex {
    pub fn new(config: IndexConfig) -> Self {
        let graph = AnnGraph::new(
            config.dimension,
            config.max_connections,
            config.ef_construction,
            config.capacity,
        );

        Self {
            config,
            inner: RwLock::new(IndexInner {
                entries: HashMap::new(),
                graph_ids: HashMap::new(),
                graph,
                next_graph_id: 0,
                stale_nodes: 0,
                bulk_pending: None,
            }),
        }
    }

    /// Insert or replace a document by `document_id`.
    ///
    /// Identical content is a no-op returning the existing version; changed
    /// content replaces the vector and bumps the version. Metadata-only
    /// changes are applied without a version bump. Re-upserting under a
    /// different owner fails.
    pub async fn upsert(&self, document: Document) -> Result<UpsertOutcome, IndexError> {
        self.validate_vector(&document.vector)?;
        let content_hash = hash_content(&document.content);

        let mut inner = self.inner.write().await;

        if let Some(existing) = inner.entries.get_mut(&document.document_id) {
            if existing.owner_id != document.owner_id {
                return Err(IndexError::OwnerImmutable {
                    document_id: document.document_id,
                });
            }

            if existing.content_hash == content_hash {
                existing.metadata = document.metadata;
                let version = existing.version;
                debug!(document_id = %document.document_id, version, "idempotent upsert");
                return Ok(UpsertOutcome {
                    document_id: document.document_id,
                    version,
                    updated: false,
                });
            }

            // Content changed: tombstone the old graph node and relink.
            let old_graph_id = existing.graph_id;
            let version = existing.version + 1;
            existing.content = document.content;
            existing.content_hash = content_hash;
            existing.metadata = document.metadata;
            existing.vector = document.vector.clone();
            existing.version = version;

            let graph_id = inner.next_graph_id;
            inner.next_graph_id += 1;
            if let Some(entry) = inner.entries.get_mut(&document.document_id) {
                entry.graph_id = graph_id;
            }
            inner.graph_ids.remove(&old_graph_id);
            inner.stale_nodes += 1;
            inner
                .graph_ids
                .insert(graph_id, document.document_id.clone());
            Self::link(&mut inner, graph_id, &document.vector);

            debug!(document_id = %document.document_id, version, "re-embedded document");
            return Ok(UpsertOutcome {
                document_id: document.document_id,
                version,
                updated: true,
            });
        }

        let graph_id = inner.next_graph_id;
        inner.next_graph_id += 1;
        inner.entries.insert(
            document.document_id.clone(),
            IndexedEntry {
                owner_id: document.owner_id,
                kind: document.kind,
                content: document.content,
                content_hash,
                metadata: document.metadata,
                vector: document.vector.clone(),
                version: 1,
                graph_id,
            },
        );
        inner
            .graph_ids
            .insert(graph_id, document.document_id.clone());
        Self::link(&mut inner, graph_id, &document.vector);

        Ok(UpsertOutcome {
            document_id: document.document_id,
            version: 1,
            updated: true,
        })
    }

    fn link(inner: &mut IndexInner, graph_id: usize, vector: &[f32]) {
        if let Some(pending) = inner.bulk_pending.as_mut() {
            pending.push((graph_id, vector.to_vec()));
        } else {
            inner.graph.insert(graph_id, vector);
        }
    }

    /// Hard-delete a document. Returns false when the id was not indexed.
    pub async fn delete(&self, document_id: &str) -> bool {
        let mut inner = self.inner.write().await;
        if let Some(entry) = inner.entries.remove(document_id) {
            inner.graph_ids.remove(&entry.graph_id);
            inner.stale_nodes += 1;
            debug!(document_id, "deleted document from index");
            true
        } else {
            false
        }
    }

    /// Approximate top-k cosine search scoped to one owner.
    ///
    /// # Errors
    /// `MissingOwnerFilter` when `owner_id` is empty; tenant isolation is
    /// enforced here, not left to callers.
    pub async fn search(
        &self,
        owner_id: &str,
        query_vector: &[f32],
        k: usize,
        filter: &SearchFilter,
    ) -> Result<Vec<ScoredDocument>, IndexError> {
        if owner_id.trim().is_empty() {
            return Err(IndexError::MissingOwnerFilter);
        }
        self.validate_vector(query_vector)?;

        let inner = self.inner.read().await;
        if inner.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        // Over-fetch to survive owner filtering and tombstones.
        let live = inner.entries.len();
        let fetch_k = (k.saturating_mul(self.config.over_fetch.max(1)) + inner.stale_nodes)
            .min(live + inner.stale_nodes);
        let ef = self.config.ef_search.max(fetch_k * 2);

        let candidates = inner.graph.search(query_vector, fetch_k, ef);

        let mut results: Vec<ScoredDocument> = candidates
            .into_iter()
            .filter_map(|(graph_id, score)| {
                let document_id = inner.graph_ids.get(&graph_id)?;
                let entry = inner.entries.get(document_id)?;
                if entry.owner_id != owner_id {
                    return None;
                }
                if let Some(kind) = filter.kind {
                    if entry.kind != kind {
                        return None;
                    }
                }
                if let Some(min_score) = filter.min_score {
                    if score < min_score {
                        return None;
                    }
                }
                Some(ScoredDocument {
                    document_id: document_id.clone(),
                    score,
                    kind: entry.kind,
                    content: entry.content.clone(),
                    metadata: entry.metadata.clone(),
                    version: entry.version,
                })
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        results.truncate(k);

        Ok(results)
    }

    /// Defer graph linking for a large backfill.
    pub async fn begin_bulk_load(&self) {
        let mut inner = self.inner.write().await;
        if inner.bulk_pending.is_none() {
            inner.bulk_pending = Some(Vec::new());
            info!("bulk load started, graph linking deferred");
        }
    }

    /// Link everything deferred since `begin_bulk_load` in one pass.
    pub async fn finalize_bulk_load(&self) {
        let mut inner = self.inner.write().await;
        if let Some(pending) = inner.bulk_pending.take() {
            info!(count = pending.len(), "bulk load finalizing");
            inner.graph.insert_batch(&pending);
        }
    }

    /// Rebuild the graph from live entries, dropping tombstones.
    pub async fn rebuild(&self) {
        let mut inner = self.inner.write().await;
        let mut graph = AnnGraph::new(
            self.config.dimension,
            self.config.max_connections,
            self.config.ef_construction,
            self.config.capacity.max(inner.entries.len()),
        );

        let mut graph_ids = HashMap::with_capacity(inner.entries.len());
        let mut batch = Vec::with_capacity(inner.entries.len());
        for (next_id, (document_id, entry)) in inner.entries.iter_mut().enumerate() {
            entry.graph_id = next_id;
            graph_ids.insert(next_id, document_id.clone());
            batch.push((next_id, entry.vector.clone()));
        }
        graph.insert_batch(&batch);

        let stale = inner.stale_nodes;
        inner.graph = graph;
        inner.graph_ids = graph_ids;
        inner.next_graph_id = inner.entries.len();
        inner.stale_nodes = 0;
        info!(reclaimed = stale, live = inner.entries.len(), "index rebuilt");
    }

    /// Indexed document ids, optionally narrowed to one owner.
    pub async fn indexed_ids(&self, owner_id: Option<&str>) -> HashSet<String> {
        let inner = self.inner.read().await;
        inner
            .entries
            .iter()
            .filter(|(_, entry)| owner_id.map_or(true, |o| entry.owner_id == o))
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub async fn contains(&self, document_id: &str) -> bool {
        self.inner.read().await.entries.contains_key(document_id)
    }

    /// Current embed version of a document, if indexed.
    pub async fn version_of(&self, document_id: &str) -> Option<u64> {
        self.inner
            .read()
            .await
            .entries
            .get(document_id)
            .map(|e| e.version)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn stats(&self) -> IndexStats {
        let inner = self.inner.read().await;
        let distinct_owners = inner
            .entries
            .values()
            .map(|e| e.owner_id.as_str())
            .collect::<HashSet<_>>()
            .len();

        IndexStats {
            total_documents: inner.entries.len(),
            distinct_owners,
            stale_nodes: inner.stale_nodes,
            bulk_loading: inner.bulk_pending.is_some(),
            dimension: self.config.dimension,
        }
    }

    fn validate_vector(&self, vector: &[f32]) -> Result<(), IndexError> {
        if vector.len() != self.config.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.config.dimension,
                got: vector.len(),
            });
        }
        if vector.iter().any(|v| !v.is_finite()) {
            warn!("rejected vector containing NaN or Infinity");
            return Err(IndexError::InvalidVector {
                reason: "vector contains NaN or Infinity".to_string(),
            });
        }
        Ok(())
    }
}

fn hash_content(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
