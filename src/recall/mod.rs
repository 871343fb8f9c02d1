//! Memory recall.
//!
//! The hybrid retrieval pipeline: normalize → trigger check → candidate
//! generation (semantic ∥ lexical) → weighted RRF fusion → inline primary
//! rerank → MMR diversity → cache fill, with the secondary quality rerank
//! rewriting the cached entry from a detached background thread.
//!
//! # Graceful degradation
//!
//! A dead embedder or lexical index downgrades the answer
//! (`search_mode`) instead of failing it; an exceeded deadline returns
//! the best partial ranking with `degraded = true`.

pub mod cache;
pub mod candidates;
pub mod fusion;
pub mod rerank;

pub use cache::{CachedRecall, RecallCache, recall_cache_key};
pub use candidates::{Candidate, CandidateGen, CandidateSet};
pub use fusion::{FusedHit, WeightedRrf};
pub use rerank::{
    CrossEncoder, HttpCrossEncoder, NullCrossEncoder, TokenOverlapCrossEncoder, TwoPassReranker,
    resolve_model_preset,
};

use crate::config::MemoryConfig;
use crate::embedding::Embedder;
use crate::models::{
    ConfidenceTier, RecallRequest, RecallResponse, RecallResult, SearchMode,
};
use crate::normalize::Normalizer;
use crate::storage::StoragePool;
use crate::trigger::TriggerScorer;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Maximum accepted query size in bytes.
const MAX_QUERY_BYTES: usize = 10_000;

/// Service answering recall queries.
pub struct RecallService {
    pool: Arc<StoragePool>,
    embedder: Arc<dyn Embedder>,
    normalizer: Arc<Normalizer>,
    trigger: TriggerScorer,
    candidates: CandidateGen,
    fusion: WeightedRrf,
    reranker: Arc<TwoPassReranker>,
    cache: Arc<RecallCache>,
    fuse_k: usize,
}

impl RecallService {
    /// Wires the pipeline from configuration and capability handles.
    #[must_use]
    pub fn new(
        config: &MemoryConfig,
        pool: Arc<StoragePool>,
        embedder: Arc<dyn Embedder>,
        normalizer: Arc<Normalizer>,
        reranker: Arc<TwoPassReranker>,
    ) -> Self {
        Self {
            pool,
            embedder,
            normalizer,
            trigger: TriggerScorer::new(),
            candidates: CandidateGen::new(config.lifecycle),
            fusion: WeightedRrf::new(config.weights),
            reranker,
            cache: Arc::new(RecallCache::new(
                Duration::from_secs(config.recall_cache.ttl_secs),
                config.recall_cache.capacity,
            )),
            fuse_k: fusion::DEFAULT_FUSE_K,
        }
    }

    /// Shared cache handle (the secondary pass and tests reach it).
    #[must_use]
    pub fn cache(&self) -> Arc<RecallCache> {
        Arc::clone(&self.cache)
    }

    /// Answers a recall query.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for an empty or oversized query or a
    /// bad agent id, and store errors only when every candidate layer is
    /// unavailable.
    #[allow(clippy::too_many_lines, clippy::cast_possible_truncation)]
    pub fn recall(&self, request: &RecallRequest) -> Result<RecallResponse> {
        let start = Instant::now();
        let now = crate::current_timestamp();

        if request.query.trim().is_empty() {
            return Err(Error::Validation("query cannot be empty".to_string()));
        }
        if request.query.len() > MAX_QUERY_BYTES {
            return Err(Error::Validation(format!(
                "query exceeds maximum size of {MAX_QUERY_BYTES} bytes"
            )));
        }

        let triggered = self.trigger.should_recall(&request.query);
        let normalized = self.normalizer.normalize(&request.query, now);

        // Temporal phrases become a created_at filter unless the caller
        // already pinned one.
        let mut filter = request.filter.clone();
        if filter.time_range.is_none()
            && let Some(range) = normalized.temporal_refs.first()
        {
            filter.time_range = Some(*range);
        }

        let key = cache::recall_cache_key(
            &request.agent,
            &normalized.text,
            &filter,
            request.limit,
            request.min_score,
        );
        if let Some(entry) = self.cache.get(&key) {
            tracing::debug!(agent = %request.agent, "Recall served from cache");
            return Ok(RecallResponse {
                results: entry.results,
                triggered,
                search_mode: entry.search_mode,
                degraded: false,
                cached: true,
                execution_time_ms: start.elapsed().as_millis() as u64,
            });
        }

        let stores = self.pool.resolve(&request.agent)?;

        let query_embedding = match self.embedder.embed(&request.query) {
            Ok(vector) => Some(vector),
            Err(e) => {
                tracing::warn!(error = %e, "Query embedding unavailable, degrading to lexical");
                None
            },
        };

        let deadline_hit = |label: &'static str| {
            let exceeded = request.deadline_ms > 0
                && start.elapsed().as_millis() as u64 >= request.deadline_ms;
            if exceeded {
                metrics::counter!("recall_deadline_exceeded_total", "stage" => label).increment(1);
                tracing::warn!(
                    stage = label,
                    deadline_ms = request.deadline_ms,
                    "Recall deadline exceeded, returning best partial result"
                );
            }
            exceeded
        };

        // Candidate generation across the resolved stores (one for a
        // concrete agent, every store for the `all` fan-out).
        let mut all_candidates = Vec::new();
        let mut search_mode = SearchMode::Full;
        let mut last_error: Option<Error> = None;
        for store in &stores {
            match self.candidates.generate(
                store,
                query_embedding.as_deref(),
                &normalized.text,
                &filter,
                now,
            ) {
                Ok(set) => {
                    if set.search_mode != SearchMode::Full && search_mode == SearchMode::Full {
                        search_mode = set.search_mode;
                    }
                    all_candidates.extend(set.candidates);
                },
                Err(e) => {
                    tracing::warn!(agent = store.agent(), error = %e, "Candidate generation failed for store");
                    last_error = Some(e);
                },
            }
        }
        if all_candidates.is_empty()
            && let Some(e) = last_error
        {
            return Err(e);
        }

        let fuse_start = Instant::now();
        let mut fused = self.fusion.fuse(&all_candidates, self.fuse_k);
        metrics::histogram!("recall_stage_duration_ms", "stage" => "fuse")
            .record(fuse_start.elapsed().as_secs_f64() * 1000.0);

        let mut degraded = false;
        if deadline_hit("pre_rerank") {
            degraded = true;
        } else {
            self.reranker.primary_pass(&request.query, &mut fused);
            if deadline_hit("post_rerank") {
                degraded = true;
            } else {
                self.reranker.apply_mmr(&mut fused);
            }
        }

        let mut results: Vec<RecallResult> = fused
            .into_iter()
            .map(|hit| RecallResult {
                id: hit.memory.id.clone(),
                agent: hit.memory.agent.clone(),
                text: hit.memory.text.clone(),
                category: hit.memory.category,
                namespace: hit.memory.namespace.clone(),
                created_at: hit.memory.created_at,
                pinned: hit.memory.pinned,
                importance: hit.memory.importance,
                strength: hit.memory.strength,
                scores: hit.scores,
                score: hit.fused,
                confidence_tier: ConfidenceTier::from_score(hit.fused),
            })
            .collect();

        if let Some(min_score) = request.min_score {
            results.retain(|r| r.score >= min_score);
        }
        results.truncate(request.limit);

        // Surfacing a memory is an access: bump counters, log-and-continue.
        let mut by_agent: HashMap<&str, Vec<crate::models::MemoryId>> = HashMap::new();
        for result in &results {
            by_agent
                .entry(result.agent.as_str())
                .or_default()
                .push(result.id.clone());
        }
        for (agent, ids) in by_agent {
            match self.pool.get(agent) {
                Ok(store) => {
                    if let Err(e) = store.record_access(&ids, now) {
                        tracing::warn!(agent, error = %e, "Failed to record accesses");
                    }
                },
                Err(e) => tracing::warn!(agent, error = %e, "Failed to resolve store for access"),
            }
        }

        let generation = self
            .cache
            .put(key.clone(), results.clone(), search_mode);

        // Background quality pass: re-scores the cached entry so the next
        // identical query sees the better ordering. Best-effort by design;
        // the compare-and-set drops stale rewrites.
        if !degraded && self.reranker.secondary_enabled() && !results.is_empty() {
            let reranker = Arc::clone(&self.reranker);
            let recall_cache = Arc::clone(&self.cache);
            let query = request.query.clone();
            let mut refreshed = results.clone();
            std::thread::spawn(move || {
                if reranker.secondary_pass(&query, &mut refreshed) {
                    recall_cache.compare_and_swap(&key, generation, refreshed);
                }
            });
        }

        let execution_time_ms = start.elapsed().as_millis() as u64;
        metrics::counter!(
            "recall_requests_total",
            "mode" => search_mode.as_str(),
            "status" => if degraded { "degraded" } else { "ok" }
        )
        .increment(1);
        metrics::histogram!("recall_duration_ms").record(start.elapsed().as_secs_f64() * 1000.0);

        Ok(RecallResponse {
            results,
            triggered,
            search_mode,
            degraded,
            cached: false,
            execution_time_ms,
        })
    }
}
