// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Ingestion pipeline and consistency engine
//!
//! The vector index is a derived, eventually-consistent projection of the
//! authoritative document store. This module owns both directions of that
//! relationship: the forward path (embed + upsert on create/update, delete
//! propagation) and the corrective path (scheduled reconciliation of orphans
//! and missing documents). A newly created document may not be searchable
//! for a few seconds; callers tolerate retrieval misses for very recent
//! documents.

pub mod reconciler;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::embeddings::{EmbeddingClient, EmbeddingError};
use crate::index::{Document, DocumentKind, IndexError, UpsertOutcome, VectorIndex};

pub use reconciler::{
    ReconcileScope, ReconciliationRecord, ReconciliationReport, Reconciler, ReconcilerConfig,
};

/// A document as pushed (or polled) from the authoritative store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDocument {
    pub owner_id: String,
    pub document_id: String,
    pub kind: DocumentKind,
    pub content: String,
    pub metadata: Value,
    /// The source store's revision counter, carried into indexed metadata
    /// as `source_version`. The index keeps its own embed-version counter.
    pub version: u64,
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Document store unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Document not found: {document_id}")]
    NotFound { document_id: String },
}

/// Boundary to the authoritative document store.
///
/// The store owns canonical content and is the single source of truth for
/// existence and deletion; the engine only ever reads through this trait.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Ids that currently exist, optionally scoped to one owner.
    async fn authoritative_ids(
        &self,
        owner_id: Option<&str>,
    ) -> Result<HashSet<String>, SourceError>;

    /// Fetch one document; `Ok(None)` when it no longer exists.
    async fn fetch(&self, document_id: &str) -> Result<Option<SourceDocument>, SourceError>;
}

/// In-memory document source for tests and local runs.
#[derive(Default)]
pub struct InMemoryDocumentSource {
    documents: RwLock<HashMap<String, SourceDocument>>,
}

impl InMemoryDocumentSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, document: SourceDocument) {
        self.documents
            .write()
            .await
            .insert(document.document_id.clone(), document);
    }

    pub async fn remove(&self, document_id: &str) -> bool {
        self.documents.write().await.remove(document_id).is_some()
    }
}

#[async_trait]
impl DocumentSource for InMemoryDocumentSource {
    async fn authoritative_ids(
        &self,
        owner_id: Option<&str>,
    ) -> Result<HashSet<String>, SourceError> {
        let documents = self.documents.read().await;
        Ok(documents
            .values()
            .filter(|d| owner_id.map_or(true, |o| d.owner_id == o))
            .map(|d| d.document_id.clone())
            .collect())
    }

    async fn fetch(&self, document_id: &str) -> Result<Option<SourceDocument>, SourceError> {
        Ok(self.documents.read().await.get(document_id).cloned())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Index rejected document: {0}")]
    Index(#[from] IndexError),
}

/// Outcome of a batch ingestion; one failure never aborts the batch.
#[derive(Debug, Default)]
pub struct BatchIngestReport {
    pub succeeded: usize,
    pub failed: usize,
    pub errors: Vec<(String, String)>,
}

/// The normal write path: embed content, upsert into the index.
pub struct IngestionPipeline {
    embedder: Arc<EmbeddingClient>,
    index: Arc<VectorIndex>,
}

impl IngestionPipeline {
    pub fn new(embedder: Arc<EmbeddingClient>, index: Arc<VectorIndex>) -> Self {
        Self { embedder, index }
    }

    /// Ingest one document: embed its content and upsert.
    pub async fn ingest(&self, document: SourceDocument) -> Result<UpsertOutcome, IngestError> {
        let embedding = self.embedder.embed(&document.content).await?;
        let outcome = self
            .index
            .upsert(to_index_document(document, embedding.into_data()))
            .await?;
        debug!(
            document_id = %outcome.document_id,
            version = outcome.version,
            updated = outcome.updated,
            "document ingested"
        );
        Ok(outcome)
    }

    /// Ingest a batch with per-document failure isolation.
    ///
    /// Content is embedded in one batched call; a document whose upsert
    /// fails is logged and skipped, the rest of the batch proceeds.
    pub async fn ingest_batch(&self, documents: Vec<SourceDocument>) -> BatchIngestReport {
        let mut report = BatchIngestReport::default();
        if documents.is_empty() {
            return report;
        }

        let texts: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = match self.embedder.embed_batch(&texts).await {
            Ok(embeddings) => embeddings,
            Err(e) => {
                // Batched embedding failed wholesale; fall back to one-by-one
                // so a single bad input cannot poison the batch.
                warn!(error = %e, "batched embedding failed, ingesting individually");
                for document in documents {
                    let document_id = document.document_id.clone();
                    match self.ingest(document).await {
                        Ok(_) => report.succeeded += 1,
                        Err(e) => {
                            warn!(document_id = %document_id, error = %e, "ingestion failed");
                            report.failed += 1;
                            report.errors.push((document_id, e.to_string()));
                        }
                    }
                }
                return report;
            }
        };

        for (document, embedding) in documents.into_iter().zip(embeddings.into_iter()) {
            let document_id = document.document_id.clone();
            match self
                .index
                .upsert(to_index_document(document, embedding.into_data()))
                .await
            {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    warn!(document_id = %document_id, error = %e, "upsert failed");
                    report.failed += 1;
                    report.errors.push((document_id, e.to_string()));
                }
            }
        }

        report
    }

    /// Propagate a source-side deletion to the index.
    pub async fn remove(&self, document_id: &str) -> bool {
        self.index.delete(document_id).await
    }

    pub fn index(&self) -> &Arc<VectorIndex> {
        &self.index
    }
}

fn to_index_document(document: SourceDocument, vector: Vec<f32>) -> Document {
    let mut metadata = document.metadata;
    if let Some(map) = metadata.as_object_mut() {
        map.insert("source_version".to_string(), document.version.into());
    }
    Document {
        document_id: document.document_id,
        owner_id: document.owner_id,
        kind: document.kind,
        content: document.content,
        metadata,
        vector,
    }
}
