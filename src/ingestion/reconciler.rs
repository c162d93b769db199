// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Scheduled reconciliation between the authoritative store and the index
//!
//! Computes the set difference between authoritative and indexed ids and
//! applies corrections: orphans (indexed but no longer authoritative) are
//! deleted, missing documents (authoritative but not indexed) are re-fetched
//! and re-ingested through the normal upsert path. Runs out-of-band on a
//! schedule; it reads snapshots and never holds a lock that blocks query
//! traffic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::{DocumentSource, IngestionPipeline, SourceError};

/// What a reconciliation pass covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileScope {
    All,
    Owner(String),
}

impl ReconcileScope {
    fn owner(&self) -> Option<&str> {
        match self {
            ReconcileScope::All => None,
            ReconcileScope::Owner(owner_id) => Some(owner_id),
        }
    }

    fn label(&self) -> String {
        match self {
            ReconcileScope::All => "all".to_string(),
            ReconcileScope::Owner(owner_id) => owner_id.clone(),
        }
    }
}

/// Ephemeral diff produced by one reconciliation pass. Not persisted; only
/// used to drive the corrective actions of the same run.
#[derive(Debug, Clone)]
pub struct ReconciliationRecord {
    pub scope: ReconcileScope,
    /// Present in the index, absent from the source of truth.
    pub orphaned_ids: HashSet<String>,
    /// Present in the source of truth, absent from the index.
    pub missing_ids: HashSet<String>,
}

impl ReconciliationRecord {
    pub fn is_clean(&self) -> bool {
        self.orphaned_ids.is_empty() && self.missing_ids.is_empty()
    }
}

/// Report handed to the monitoring collaborator after a repair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub scope: String,
    pub orphan_count: usize,
    pub missing_count: usize,
    pub repaired_count: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Seconds between scheduled passes (default: daily).
    pub interval_secs: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 86_400,
        }
    }
}

/// Keeps the index synchronized with the authoritative document store.
pub struct Reconciler {
    source: Arc<dyn DocumentSource>,
    pipeline: Arc<IngestionPipeline>,
}

impl Reconciler {
    pub fn new(source: Arc<dyn DocumentSource>, pipeline: Arc<IngestionPipeline>) -> Self {
        Self { source, pipeline }
    }

    /// Compute the diff between authoritative and indexed id sets.
    pub async fn reconcile(
        &self,
        scope: ReconcileScope,
    ) -> Result<ReconciliationRecord, SourceError> {
        let authoritative = self.source.authoritative_ids(scope.owner()).await?;
        let indexed = self.pipeline.index().indexed_ids(scope.owner()).await;

        let orphaned_ids: HashSet<String> = indexed.difference(&authoritative).cloned().collect();
        let missing_ids: HashSet<String> = authoritative.difference(&indexed).cloned().collect();

        info!(
            scope = %scope.label(),
            orphans = orphaned_ids.len(),
            missing = missing_ids.len(),
            "reconciliation pass computed"
        );

        Ok(ReconciliationRecord {
            scope,
            orphaned_ids,
            missing_ids,
        })
    }

    /// Apply corrections for a reconciliation record.
    ///
    /// A failure on one document never aborts the batch: it is logged and
    /// the pass moves on.
    pub async fn repair(&self, record: &ReconciliationRecord) -> ReconciliationReport {
        let mut repaired = 0usize;

        for document_id in &record.orphaned_ids {
            if self.pipeline.remove(document_id).await {
                repaired += 1;
            } else {
                warn!(%document_id, "orphan vanished before repair");
            }
        }

        for document_id in &record.missing_ids {
            match self.source.fetch(document_id).await {
                Ok(Some(document)) => match self.pipeline.ingest(document).await {
                    Ok(_) => repaired += 1,
                    Err(e) => {
                        warn!(%document_id, error = %e, "re-ingestion failed, continuing");
                    }
                },
                Ok(None) => {
                    // Deleted between the diff and the repair; nothing to do.
                    repaired += 1;
                }
                Err(e) => {
                    warn!(%document_id, error = %e, "fetch failed, continuing");
                }
            }
        }

        ReconciliationReport {
            scope: record.scope.label(),
            orphan_count: record.orphaned_ids.len(),
            missing_count: record.missing_ids.len(),
            repaired_count: repaired,
            timestamp: Utc::now(),
        }
    }

    /// One full pass: diff, then repair.
    pub async fn run_once(
        &self,
        scope: ReconcileScope,
    ) -> Result<ReconciliationReport, SourceError> {
        let record = self.reconcile(scope).await?;
        Ok(self.repair(&record).await)
    }

    /// Run full passes forever on a fixed schedule.
    ///
    /// A failed run alerts via error-level logging and waits for the next
    /// tick; it never blocks new ingestion.
    pub fn spawn_schedule(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match self.run_once(ReconcileScope::All).await {
                    Ok(report) => {
                        info!(
                            orphans = report.orphan_count,
                            missing = report.missing_count,
                            repaired = report.repaired_count,
                            "scheduled reconciliation complete"
                        );
                    }
                    Err(e) => {
                        error!(error = %e, "scheduled reconciliation failed");
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::{InMemoryDocumentSource, SourceDocument};
    use super::*;
    use crate::embeddings::{EmbeddingClient, EmbeddingConfig, MockEmbeddingProvider};
    use crate::index::{DocumentKind, IndexConfig, VectorIndex};
    use serde_json::json;

    fn make_engine() -> (Arc<InMemoryDocumentSource>, Arc<IngestionPipeline>, Reconciler) {
        let provider = Arc::new(MockEmbeddingProvider::new(32));
        let embedder = Arc::new(EmbeddingClient::new(
            EmbeddingConfig {
                dimension: 32,
                ..Default::default()
            },
            provider,
        ));
        let index = Arc::new(VectorIndex::new(IndexConfig {
            dimension: 32,
            ..Default::default()
        }));
        let pipeline = Arc::new(IngestionPipeline::new(embedder, index));
        let source = Arc::new(InMemoryDocumentSource::new());
        let reconciler = Reconciler::new(source.clone(), pipeline.clone());
        (source, pipeline, reconciler)
    }

    fn source_doc(id: &str, owner: &str) -> SourceDocument {
        SourceDocument {
            owner_id: owner.to_string(),
            document_id: id.to_string(),
            kind: DocumentKind::Note,
            content: format!("content of {}", id),
            metadata: json!({"title": id}),
            version: 1,
        }
    }

    #[tokio::test]
    async fn test_reconcile_reports_exact_set_difference() {
        let (source, pipeline, reconciler) = make_engine();

        // d1 in both, d2 only authoritative (missing), d3 only indexed (orphan)
        source.put(source_doc("d1", "u1")).await;
        source.put(source_doc("d2", "u1")).await;
        pipeline.ingest(source_doc("d1", "u1")).await.unwrap();
        pipeline.ingest(source_doc("d3", "u1")).await.unwrap();

        let record = reconciler.reconcile(ReconcileScope::All).await.unwrap();
        assert_eq!(record.orphaned_ids, HashSet::from(["d3".to_string()]));
        assert_eq!(record.missing_ids, HashSet::from(["d2".to_string()]));
    }

    #[tokio::test]
    async fn test_repair_converges_to_clean() {
        let (source, pipeline, reconciler) = make_engine();

        source.put(source_doc("d1", "u1")).await;
        source.put(source_doc("d2", "u2")).await;
        pipeline.ingest(source_doc("stale", "u1")).await.unwrap();

        let record = reconciler.reconcile(ReconcileScope::All).await.unwrap();
        let report = reconciler.repair(&record).await;
        assert_eq!(report.orphan_count, 1);
        assert_eq!(report.missing_count, 2);
        assert_eq!(report.repaired_count, 3);

        let next = reconciler.reconcile(ReconcileScope::All).await.unwrap();
        assert!(next.is_clean());
    }

    #[tokio::test]
    async fn test_owner_scoped_reconcile_ignores_other_owners() {
        let (source, pipeline, reconciler) = make_engine();

        source.put(source_doc("d1", "u1")).await;
        pipeline.ingest(source_doc("d2", "u2")).await.unwrap();

        let record = reconciler
            .reconcile(ReconcileScope::Owner("u1".to_string()))
            .await
            .unwrap();
        assert_eq!(record.missing_ids, HashSet::from(["d1".to_string()]));
        // u2's orphan is out of scope for this pass
        assert!(record.orphaned_ids.is_empty());
    }

    #[tokio::test]
    async fn test_repair_continues_past_vanished_documents() {
        let (source, pipeline, reconciler) = make_engine();

        source.put(source_doc("d1", "u1")).await;
        source.put(source_doc("d2", "u1")).await;

        let record = reconciler.reconcile(ReconcileScope::All).await.unwrap();
        // d2 deleted between diff and repair
        source.remove("d2").await;

        let report = reconciler.repair(&record).await;
        assert_eq!(report.repaired_count, 2);
        assert!(pipeline.index().contains("d1").await);
        assert!(!pipeline.index().contains("d2").await);
    }
}
