//! Candidate generation.
//!
//! Runs the semantic and lexical retrievers in parallel over a store,
//! unions their hits, and attaches the three cheap numeric layers
//! (recency, Ebbinghaus strength, stored importance) to every candidate.

use crate::config::LifecycleConfig;
use crate::models::{LayerScores, Memory, MemoryFilter, MemoryId, SearchMode};
use crate::storage::Store;
use crate::Result;
use std::collections::HashMap;

/// Recency decay constant (per day).
const RECENCY_LAMBDA: f32 = 0.01;

/// Default per-layer candidate budget.
pub const DEFAULT_LAYER_K: usize = 40;

/// One retrieval candidate with its per-layer scores.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// The underlying memory row.
    pub memory: Memory,
    /// Per-layer raw scores; fusion and reranking fill the rest.
    pub scores: LayerScores,
}

/// The union of layer candidates for one store.
#[derive(Debug, Clone)]
pub struct CandidateSet {
    /// Unioned candidates.
    pub candidates: Vec<Candidate>,
    /// Which layers were available.
    pub search_mode: SearchMode,
}

impl CandidateSet {
    /// An empty set in full mode.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            candidates: Vec::new(),
            search_mode: SearchMode::Full,
        }
    }
}

/// Candidate generator over the per-layer retrievers.
pub struct CandidateGen {
    layer_k: usize,
    lifecycle: LifecycleConfig,
}

impl CandidateGen {
    /// Creates a generator with the default per-layer budget.
    #[must_use]
    pub const fn new(lifecycle: LifecycleConfig) -> Self {
        Self {
            layer_k: DEFAULT_LAYER_K,
            lifecycle,
        }
    }

    /// Overrides the per-layer candidate budget.
    #[must_use]
    pub fn with_layer_k(mut self, layer_k: usize) -> Self {
        self.layer_k = layer_k.max(1);
        self
    }

    /// Generates candidates for one store.
    ///
    /// The semantic and lexical retrievers run as parallel scoped threads
    /// and are joined before the union; a missing query embedding skips
    /// the semantic layer (`degraded_no_vector`), a lexical failure is
    /// logged and skips that layer (`degraded_no_lexical`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`](crate::Error::StoreIo) only when both
    /// layers fail at the store level.
    pub fn generate(
        &self,
        store: &Store,
        query_embedding: Option<&[f32]>,
        normalized_query: &str,
        filter: &MemoryFilter,
        now: u64,
    ) -> Result<CandidateSet> {
        let k = self.layer_k;

        let (semantic, lexical) = std::thread::scope(|scope| {
            let semantic_handle = scope.spawn(|| {
                query_embedding.map(|embedding| store.vector_topk(embedding, k, filter))
            });
            let lexical = store.lexical_topk(normalized_query, k, filter);
            let semantic = semantic_handle
                .join()
                .unwrap_or_else(|_| Some(Err(crate::Error::StoreIo {
                    operation: "vector_topk".to_string(),
                    cause: "semantic retriever thread panicked".to_string(),
                })));
            (semantic, lexical)
        });

        let mut search_mode = SearchMode::Full;

        let semantic_hits: Vec<(MemoryId, f32)> = match semantic {
            Some(Ok(hits)) => hits,
            Some(Err(e)) => {
                tracing::warn!(error = %e, "Semantic layer failed, degrading");
                search_mode = SearchMode::DegradedNoVector;
                Vec::new()
            },
            None => {
                search_mode = SearchMode::DegradedNoVector;
                Vec::new()
            },
        };

        let lexical_hits: Vec<(MemoryId, f32)> = match lexical {
            Ok(hits) => hits,
            Err(e) => {
                if search_mode == SearchMode::DegradedNoVector {
                    // Both layers down: nothing to retrieve from.
                    return Err(e);
                }
                tracing::warn!(error = %e, "Lexical layer failed, degrading");
                search_mode = SearchMode::DegradedNoLexical;
                Vec::new()
            },
        };

        // Union, keeping per-layer scores. Lexical scores normalize by the
        // batch maximum so BM25 magnitudes are comparable across queries.
        let max_bm25 = lexical_hits
            .iter()
            .map(|(_, s)| *s)
            .fold(0.0_f32, f32::max)
            .max(f32::EPSILON);

        let mut by_id: HashMap<String, LayerScores> = HashMap::new();
        for (id, distance) in &semantic_hits {
            by_id.entry(id.as_str().to_string()).or_default().semantic = Some(1.0 - distance);
        }
        for (id, bm25) in &lexical_hits {
            by_id.entry(id.as_str().to_string()).or_default().lexical = Some(bm25 / max_bm25);
        }

        let ids: Vec<MemoryId> = by_id.keys().map(|id| MemoryId::new(id.as_str())).collect();
        let rows = store.get_batch(&ids)?;

        let mut candidates = Vec::with_capacity(rows.len());
        for (id, row) in ids.iter().zip(rows) {
            let Some(memory) = row else {
                tracing::debug!(memory_id = %id, "Candidate row vanished between index and fetch");
                continue;
            };
            let mut scores = by_id.remove(id.as_str()).unwrap_or_default();
            scores.recency = recency_score(&memory, now);
            scores.strength = self.retention_score(&memory, now);
            scores.importance = memory.importance;
            candidates.push(Candidate { memory, scores });
        }

        Ok(CandidateSet {
            candidates,
            search_mode,
        })
    }

    /// Ebbinghaus retention score anchored at the last reinforcement.
    ///
    /// Pinning freezes strength at its current value for comparison
    /// purposes: pinned memories rank by their persisted strength and
    /// never slide down the decay curve.
    #[allow(clippy::cast_precision_loss)]
    fn retention_score(&self, memory: &Memory, now: u64) -> f32 {
        if memory.pinned {
            return memory.strength;
        }
        let age_days = now.saturating_sub(memory.last_reinforced_at) as f32 / 86_400.0;
        let denominator = 1.0 + self.lifecycle.decay_alpha * memory.importance;
        (-age_days * self.lifecycle.decay_base_rate / denominator).exp()
    }
}

/// Exponential recency score over the creation age.
#[allow(clippy::cast_precision_loss)]
fn recency_score(memory: &Memory, now: u64) -> f32 {
    (-RECENCY_LAMBDA * memory.age_days(now)).exp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{Embedder, HashedEmbedder};
    use crate::models::Category;

    const DIM: usize = 768;

    fn seeded_store(embedder: &HashedEmbedder, now: u64) -> Store {
        let store = Store::in_memory("main", DIM).expect("store");
        for (text, age_days) in [
            ("user prefers dark mode in the terminal", 1_u64),
            ("kubernetes rollback procedure for deploys", 10),
            ("coffee order: flat white no sugar", 200),
        ] {
            let created = now - age_days * 86_400;
            let memory = Memory::new("main", text, text.to_lowercase(), Category::Fact, created)
                .with_embedding(embedder.embed(text).expect("embed"));
            store.insert(&memory).expect("insert");
        }
        store
    }

    #[test]
    fn full_mode_unions_both_layers() {
        let embedder = HashedEmbedder::new(DIM);
        let now = 1_700_000_000;
        let store = seeded_store(&embedder, now);
        let generator = CandidateGen::new(LifecycleConfig::default());

        let query_vec = embedder.embed("dark mode preference").expect("embed");
        let set = generator
            .generate(
                &store,
                Some(&query_vec),
                "dark mode preference",
                &MemoryFilter::new(),
                now,
            )
            .expect("generate");

        assert_eq!(set.search_mode, SearchMode::Full);
        assert!(!set.candidates.is_empty());
        let best = set
            .candidates
            .iter()
            .find(|c| c.memory.text.contains("dark mode"))
            .expect("dark mode candidate");
        assert!(best.scores.semantic.is_some() || best.scores.lexical.is_some());
        assert!(best.scores.recency > 0.0);
        assert!(best.scores.strength > 0.0);
    }

    #[test]
    fn missing_embedding_degrades_to_lexical() {
        let embedder = HashedEmbedder::new(DIM);
        let now = 1_700_000_000;
        let store = seeded_store(&embedder, now);
        let generator = CandidateGen::new(LifecycleConfig::default());

        let set = generator
            .generate(&store, None, "kubernetes rollback", &MemoryFilter::new(), now)
            .expect("generate");

        assert_eq!(set.search_mode, SearchMode::DegradedNoVector);
        assert!(!set.candidates.is_empty());
        assert!(set.candidates.iter().all(|c| c.scores.semantic.is_none()));
    }

    #[test]
    fn recency_orders_newer_above_older() {
        let now = 1_700_000_000;
        let newer = Memory::new("main", "a", "a", Category::Fact, now - 86_400);
        let older = Memory::new("main", "b", "b", Category::Fact, now - 100 * 86_400);
        assert!(recency_score(&newer, now) > recency_score(&older, now));
    }

    #[test]
    fn retention_favors_important_memories() {
        let generator = CandidateGen::new(LifecycleConfig::default());
        let now = 1_700_000_000;
        let created = now - 30 * 86_400;
        let important =
            Memory::new("main", "a", "a", Category::Fact, created).with_importance(1.0);
        let trivial = Memory::new("main", "b", "b", Category::Fact, created).with_importance(0.0);
        assert!(generator.retention_score(&important, now) > generator.retention_score(&trivial, now));
    }

    #[test]
    fn pinned_memories_rank_by_frozen_strength() {
        let generator = CandidateGen::new(LifecycleConfig::default());
        let now = 1_700_000_000;
        let created = now - 1_000 * 86_400;

        let mut pinned =
            Memory::new("main", "a", "a", Category::Rule, created).with_pinned(true);
        pinned.strength = 0.8;
        assert!(
            (generator.retention_score(&pinned, now) - 0.8).abs() < f32::EPSILON,
            "pinned retention must equal the persisted strength"
        );

        // The same age without the pin slides far down the curve.
        let unpinned = Memory::new("main", "b", "b", Category::Fact, created);
        assert!(generator.retention_score(&unpinned, now) < 0.1);
    }

    #[test]
    fn lexical_scores_are_normalized_by_batch_max() {
        let embedder = HashedEmbedder::new(DIM);
        let now = 1_700_000_000;
        let store = seeded_store(&embedder, now);
        let generator = CandidateGen::new(LifecycleConfig::default());

        let set = generator
            .generate(&store, None, "kubernetes rollback deploys", &MemoryFilter::new(), now)
            .expect("generate");
        let max_lexical = set
            .candidates
            .iter()
            .filter_map(|c| c.scores.lexical)
            .fold(0.0_f32, f32::max);
        assert!((max_lexical - 1.0).abs() < 1e-5);
    }
}
