// Copyright (c) 2025 Fabstir
// SPDX-License-Identifier: BUSL-1.1
//! Engine configuration
//!
//! Aggregates per-module config with environment-variable overrides. Every
//! tunable named in the engine design (similarity thresholds, TTLs, retry
//! budgets, complexity thresholds, token budget, deadlines) lives on one of
//! these structs rather than as a constant in code.

use std::env;
use std::time::Duration;

use crate::cache::SemanticCacheConfig;
use crate::context::AssemblerConfig;
use crate::embeddings::EmbeddingConfig;
use crate::index::IndexConfig;
use crate::ingestion::ReconcilerConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::router::RouterConfig;

/// Full engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub embedding: EmbeddingConfig,
    pub index: IndexConfig,
    pub semantic_cache: SemanticCacheConfig,
    pub assembler: AssemblerConfig,
    pub router: RouterConfig,
    pub orchestrator: OrchestratorConfig,
    pub reconciler: ReconcilerConfig,
    /// Rolling cost ceiling for the router's budget tracker.
    pub cost_ceiling_microdollars: u64,
    /// Length of the rolling cost window.
    pub cost_window_secs: u64,
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults. A `.env` file is honored when present.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let mut config = Self::default();

        if let Some(dimension) = read_env("PIXIE_EMBEDDING_DIMENSION") {
            config.embedding.dimension = dimension;
            config.index.dimension = dimension;
        }
        if let Ok(model_id) = env::var("PIXIE_EMBEDDING_MODEL") {
            config.embedding.model_id = model_id;
        }
        if let Some(rpm) = read_env("PIXIE_EMBEDDING_RATE_LIMIT_PER_MINUTE") {
            config.embedding.rate_limit_per_minute = Some(rpm);
        }

        if let Some(threshold) = read_env("PIXIE_CACHE_SIMILARITY_THRESHOLD") {
            config.semantic_cache.similarity_threshold = threshold;
        }
        if let Some(threshold) = read_env("PIXIE_CACHE_RELAXED_THRESHOLD") {
            config.semantic_cache.relaxed_threshold = threshold;
        }
        if let Some(ttl) = read_env("PIXIE_CACHE_TTL_SECS") {
            config.semantic_cache.ttl_secs = ttl;
        }
        if let Some(max_entries) = read_env("PIXIE_CACHE_MAX_ENTRIES") {
            config.semantic_cache.max_entries = max_entries;
        }

        if let Some(budget) = read_env("PIXIE_TOKEN_BUDGET") {
            config.assembler.default_token_budget = budget;
            config.orchestrator.token_budget = budget;
        }
        if let Some(max_items) = read_env("PIXIE_CONTEXT_MAX_ITEMS") {
            config.assembler.max_items = max_items;
        }

        if let Some(k) = read_env("PIXIE_SEARCH_K") {
            config.orchestrator.search_k = k;
        }
        if let Some(deadline) = read_env("PIXIE_QUERY_DEADLINE_MS") {
            config.orchestrator.query_deadline_ms = deadline;
        }

        if let Some(retries) = read_env("PIXIE_ROUTER_MAX_RETRIES") {
            config.router.max_retries_per_tier = retries;
        }
        if let Some(timeout) = read_env("PIXIE_ROUTER_CALL_TIMEOUT_MS") {
            config.router.call_timeout_ms = timeout;
        }

        if let Some(ceiling) = read_env("PIXIE_COST_CEILING_MICRODOLLARS") {
            config.cost_ceiling_microdollars = ceiling;
        }
        if let Some(window) = read_env("PIXIE_COST_WINDOW_SECS") {
            config.cost_window_secs = window;
        }

        if let Some(interval) = read_env("PIXIE_RECONCILE_INTERVAL_SECS") {
            config.reconciler.interval_secs = interval;
        }

        config
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<(), String> {
        if self.embedding.dimension == 0 {
            return Err("embedding dimension must be greater than 0".to_string());
        }
        if self.embedding.dimension != self.index.dimension {
            return Err("embedding and index dimensions must match".to_string());
        }
        if self.embedding.max_batch_size == 0 {
            return Err("embedding batch size must be greater than 0".to_string());
        }
        for (name, threshold) in [
            ("similarity", self.semantic_cache.similarity_threshold),
            ("relaxed", self.semantic_cache.relaxed_threshold),
        ] {
            if !(0.0..=1.0).contains(&threshold) {
                return Err(format!("{} threshold must be within [0, 1]", name));
            }
        }
        if self.semantic_cache.relaxed_threshold > self.semantic_cache.similarity_threshold {
            return Err("relaxed threshold must not exceed the strict threshold".to_string());
        }
        if self.orchestrator.search_k == 0 {
            return Err("search k must be greater than 0".to_string());
        }
        if self.orchestrator.token_budget == 0 {
            return Err("token budget must be greater than 0".to_string());
        }
        if self.router.cheap_max_complexity >= self.router.premium_min_complexity {
            return Err("cheap complexity ceiling must be below the premium floor".to_string());
        }
        if self.router.fallback.values().any(|chain| chain.is_empty()) {
            return Err("every tier needs a non-empty fallback chain".to_string());
        }
        Ok(())
    }

    pub fn cost_window(&self) -> Duration {
        Duration::from_secs(self.cost_window_secs)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            embedding: EmbeddingConfig::default(),
            index: IndexConfig::default(),
            semantic_cache: SemanticCacheConfig::default(),
            assembler: AssemblerConfig::default(),
            router: RouterConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            reconciler: ReconcilerConfig::default(),
            // $5.00 per rolling hour before routing is constrained to cheap
            cost_ceiling_microdollars: 5_000_000,
            cost_window_secs: 3_600,
        }
    }
}

fn read_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.parse().ok())
}
