// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! HNSW graph wrapper
//!
//! Hierarchical Navigable Small World graph for approximate nearest neighbor
//! search, specialized to cosine distance. Node degree and construction-time
//! search breadth are bounded by configuration; exact recall is explicitly
//! not a goal, and the accuracy/speed trade-off is tuned via `ef_search`.

use hnsw_rs::hnsw::Hnsw;
use hnsw_rs::prelude::*;

/// Thin wrapper over the HNSW structure, keyed by internal graph ids.
///
/// The graph only ever sees normalized vectors and opaque `usize` ids; the
/// document store above it owns the id ↔ document mapping.
pub struct AnnGraph {
    hnsw: Hnsw<'static, f32, DistCosine>,
    dimension: usize,
    linked: usize,
}

impl AnnGraph {
    /// # Arguments
    /// * `dimension` - Vector dimension
    /// * `max_connections` - Bounded node degree (HNSW `M`)
    /// * `ef_construction` - Construction-time search breadth
    /// * `capacity` - Expected element count, used for layer sizing
    pub fn new(
        dimension: usize,
        max_connections: usize,
        ef_construction: usize,
        capacity: usize,
    ) -> Self {
        // Layer count scales with the expected corpus size, clamped to the
        // range hnsw_rs supports well.
        let nb_layer = ((capacity.max(2) as f32).log2().ceil() as usize).clamp(4, 16);

        let hnsw = Hnsw::new(
            max_connections,
            capacity.max(16),
            nb_layer,
            ef_construction,
            DistCosine,
        );

        Self {
            hnsw,
            dimension,
            linked: 0,
        }
    }

    /// Link a single vector into the graph.
    pub fn insert(&mut self, graph_id: usize, vector: &[f32]) {
        let normalized = normalize(vector);
        self.hnsw.insert((&normalized, graph_id));
        self.linked += 1;
    }

    /// Link a whole batch at once.
    ///
    /// Used by bulk-load finalization: deferring the per-element linking and
    /// doing it here in one parallel pass avoids the incremental O(n·log n)
    /// cost during large backfills.
    pub fn insert_batch(&mut self, batch: &[(usize, Vec<f32>)]) {
        let normalized: Vec<(Vec<f32>, usize)> = batch
            .iter()
            .map(|(id, v)| (normalize(v), *id))
            .collect();
        let refs: Vec<(&Vec<f32>, usize)> = normalized.iter().map(|(v, id)| (v, *id)).collect();
        self.hnsw.parallel_insert(&refs);
        self.hnsw.set_searching_mode(true);
        self.linked += batch.len();
    }

    /// k-NN search returning `(graph_id, cosine_similarity)` pairs.
    ///
    /// `ef` is the search breadth; results come back ordered by similarity
    /// descending. Scores are in [-1, 1].
    pub fn search(&self, query: &[f32], k: usize, ef: usize) -> Vec<(usize, f32)> {
        if k == 0 || self.linked == 0 {
            return Vec::new();
        }
        let normalized = normalize(query);
        let ef = ef.max(k);
        let neighbours = self.hnsw.search(&normalized, k, ef);

        neighbours
            .into_iter()
            .map(|n| (n.d_id, 1.0 - n.distance))
            .collect()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of nodes linked into the graph, tombstones included.
    pub fn linked(&self) -> usize {
        self.linked
    }
}

/// Unit-length copy of a vector; zero vectors pass through unchanged.
fn normalize(vector: &[f32]) -> Vec<f32> {
    let magnitude: f32 = vector.iter().map(|&x| x * x).sum::<f32>().sqrt();
    if magnitude == 0.0 || !magnitude.is_finite() {
        return vector.to_vec();
    }
    vector.iter().map(|&x| x / magnitude).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize() {
        let v = normalize(&[3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_zero_vector() {
        assert_eq!(normalize(&[0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_insert_and_search_nearest() {
        let mut graph = AnnGraph::new(4, 12, 48, 64);
        graph.insert(0, &[1.0, 0.0, 0.0, 0.0]);
        graph.insert(1, &[0.0, 1.0, 0.0, 0.0]);
        graph.insert(2, &[0.9, 0.1, 0.0, 0.0]);

        let results = graph.search(&[1.0, 0.0, 0.0, 0.0], 2, 50);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 0);
        assert!(results[0].1 > 0.99);
        assert_eq!(results[1].0, 2);
    }

    #[test]
    fn test_batch_insert_links_everything() {
        let mut graph = AnnGraph::new(3, 12, 48, 64);
        let batch: Vec<(usize, Vec<f32>)> = (0..10)
            .map(|i| (i, vec![i as f32 + 1.0, 1.0, 0.5]))
            .collect();
        graph.insert_batch(&batch);

        let results = graph.search(&[10.0, 1.0, 0.5], 10, 50);
        assert_eq!(results.len(), 10);
    }

    #[test]
    fn test_search_zero_k() {
        let mut graph = AnnGraph::new(2, 12, 48, 16);
        graph.insert(0, &[1.0, 0.0]);
        assert_eq!(graph.linked(), 1);
        assert!(graph.search(&[1.0, 0.0], 0, 50).is_empty());
    }

    #[test]
    fn test_search_empty_graph() {
        let graph = AnnGraph::new(2, 12, 48, 16);
        assert!(graph.search(&[1.0, 0.0], 5, 50).is_empty());
    }
}
