//! Weighted Reciprocal Rank Fusion.
//!
//! Each retrieval layer contributes `w_L / (k + rank_L)` per document with
//! the standard `k = 60`. Ranks, not raw scores, make BM25 and cosine
//! magnitudes comparable without per-query tuning; the weights bias the
//! blend toward the semantic layer.
//!
//! Rank-based fusion carries no absolute relevance, but the reranker
//! blend and the confidence tiers need one. So fused scores are first
//! normalized (top document reads 1.0), then anchored by each document's
//! strongest direct-relevance signal: a sole garbage hit stays LOW
//! instead of inheriting a perfect rank score.
//!
//! Reference: Cormack, Clarke & Buettcher (2009), "Reciprocal Rank Fusion
//! outperforms Condorcet and individual Rank Learning Methods".

use super::candidates::Candidate;
use crate::config::SearchWeights;
use crate::models::LayerScores;
use crate::models::Memory;
use std::collections::HashMap;

/// Standard RRF dampening constant.
pub const RRF_K: f32 = 60.0;

/// Default fused list size handed to the reranker.
pub const DEFAULT_FUSE_K: usize = 20;

/// A candidate after fusion.
#[derive(Debug, Clone)]
pub struct FusedHit {
    /// The underlying memory row.
    pub memory: Memory,
    /// Per-layer raw scores carried through.
    pub scores: LayerScores,
    /// Normalized fused score (top document = 1.0).
    pub fused: f32,
    /// Raw RRF sum before normalization.
    pub raw_fused: f32,
}

/// Weighted RRF combiner.
#[derive(Debug, Clone)]
pub struct WeightedRrf {
    weights: SearchWeights,
    k: f32,
}

impl WeightedRrf {
    /// Creates a combiner with the configured layer weights.
    #[must_use]
    pub const fn new(weights: SearchWeights) -> Self {
        Self { weights, k: RRF_K }
    }

    /// Fuses a candidate union into a ranked list of `limit` hits.
    ///
    /// Layer rankings are derived by sorting candidates on each layer's
    /// score; documents missing from a layer contribute nothing from it.
    #[must_use]
    pub fn fuse(&self, candidates: &[Candidate], limit: usize) -> Vec<FusedHit> {
        if candidates.is_empty() {
            return Vec::new();
        }

        let mut fused: HashMap<&str, f32> = HashMap::with_capacity(candidates.len());

        self.add_layer(&mut fused, candidates, self.weights.semantic, |c| {
            c.scores.semantic
        });
        self.add_layer(&mut fused, candidates, self.weights.keyword, |c| {
            c.scores.lexical
        });
        self.add_layer(&mut fused, candidates, self.weights.recency, |c| {
            Some(c.scores.recency)
        });
        self.add_layer(&mut fused, candidates, self.weights.strength, |c| {
            Some(c.scores.strength)
        });
        self.add_layer(&mut fused, candidates, self.weights.importance, |c| {
            Some(c.scores.importance)
        });

        let mut hits: Vec<FusedHit> = candidates
            .iter()
            .map(|candidate| {
                let raw = fused
                    .get(candidate.memory.id.as_str())
                    .copied()
                    .unwrap_or(0.0);
                FusedHit {
                    memory: candidate.memory.clone(),
                    scores: candidate.scores,
                    fused: raw,
                    raw_fused: raw,
                }
            })
            .collect();

        hits.sort_by(|a, b| {
            b.raw_fused
                .partial_cmp(&a.raw_fused)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        normalize_and_anchor(&mut hits);
        hits
    }

    /// Adds one layer's weighted RRF contributions.
    ///
    /// Candidates without a score in the layer are excluded from its
    /// ranking entirely (contribution 0), not ranked last.
    #[allow(clippy::cast_precision_loss)]
    fn add_layer<'a>(
        &self,
        fused: &mut HashMap<&'a str, f32>,
        candidates: &'a [Candidate],
        weight: f32,
        layer_score: impl Fn(&Candidate) -> Option<f32>,
    ) {
        if weight <= 0.0 {
            return;
        }

        let mut ranked: Vec<(&str, f32)> = candidates
            .iter()
            .filter_map(|c| layer_score(c).map(|s| (c.memory.id.as_str(), s)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        for (rank, &(id, _)) in ranked.iter().enumerate() {
            let contribution = weight / (self.k + rank as f32 + 1.0);
            *fused.entry(id).or_insert(0.0) += contribution;
        }
    }
}

/// Scales fused scores so the maximum reads 1.0, then anchors each by the
/// document's strongest direct-relevance signal (semantic or lexical).
///
/// The anchor is what keeps the confidence tiers honest: ranks say only
/// "best of what we found", the anchor says how good that actually was.
fn normalize_and_anchor(hits: &mut [FusedHit]) {
    let max = hits.iter().map(|h| h.raw_fused).fold(0.0_f32, f32::max);
    if max <= f32::EPSILON {
        return;
    }
    for hit in hits {
        let anchor = hit
            .scores
            .semantic
            .unwrap_or(0.0)
            .max(hit.scores.lexical.unwrap_or(0.0));
        hit.fused = (hit.raw_fused / max) * anchor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;

    fn candidate(id_seed: &str, scores: LayerScores) -> Candidate {
        Candidate {
            memory: Memory::new("main", id_seed, id_seed, Category::Fact, 0),
            scores,
        }
    }

    fn scores(semantic: Option<f32>, lexical: Option<f32>) -> LayerScores {
        LayerScores {
            semantic,
            lexical,
            recency: 0.5,
            strength: 0.5,
            importance: 0.5,
            reranker_primary: None,
            reranker_secondary: None,
        }
    }

    #[test]
    fn document_in_both_layers_outranks_single_layer() {
        let rrf = WeightedRrf::new(SearchWeights::default());
        let candidates = vec![
            candidate("in both layers", scores(Some(0.9), Some(0.8))),
            candidate("semantic only", scores(Some(0.95), None)),
            candidate("lexical only", scores(None, Some(0.9))),
        ];
        let hits = rrf.fuse(&candidates, 10);
        assert_eq!(hits[0].memory.text, "in both layers");
    }

    #[test]
    fn top_hit_score_is_its_anchor() {
        let rrf = WeightedRrf::new(SearchWeights::default());
        let candidates = vec![
            candidate("a", scores(Some(1.0), Some(0.9))),
            candidate("b", scores(Some(0.1), None)),
        ];
        let hits = rrf.fuse(&candidates, 10);
        // Normalized rank 1.0 times a perfect semantic anchor.
        assert!((hits[0].fused - 1.0).abs() < f32::EPSILON);
        assert!(hits[1].fused < 1.0);
        assert!(hits[0].raw_fused > hits[1].raw_fused);
    }

    #[test]
    fn sole_weak_hit_does_not_inherit_a_perfect_score() {
        let rrf = WeightedRrf::new(SearchWeights::default());
        let candidates = vec![candidate("barely related", scores(Some(0.08), None))];
        let hits = rrf.fuse(&candidates, 10);
        assert_eq!(hits.len(), 1);
        assert!(
            hits[0].fused < 0.4,
            "a lone weak hit must stay LOW, got {}",
            hits[0].fused
        );
    }

    #[test]
    fn zero_weight_layer_contributes_nothing() {
        let weights = SearchWeights {
            keyword: 0.0,
            ..SearchWeights::default()
        };

        let rrf = WeightedRrf::new(weights);
        let candidates = vec![
            candidate("semantic winner", scores(Some(0.9), None)),
            candidate("lexical winner", scores(None, Some(1.0))),
        ];
        let hits = rrf.fuse(&candidates, 10);
        assert_eq!(hits[0].memory.text, "semantic winner");

        // The lexical-only document keeps its other-layer contributions but
        // gains nothing from the disabled layer.
        let lexical_hit = hits
            .iter()
            .find(|h| h.memory.text == "lexical winner")
            .expect("present");
        assert!(lexical_hit.raw_fused > 0.0);
    }

    #[test]
    fn removing_a_layer_keeps_relative_order_within_other_layers() {
        let with_all = WeightedRrf::new(SearchWeights::default());
        let without_lexical = WeightedRrf::new(SearchWeights {
            keyword: 0.0,
            ..SearchWeights::default()
        });

        let candidates = vec![
            candidate("first semantic", scores(Some(0.9), None)),
            candidate("second semantic", scores(Some(0.7), None)),
            candidate("third semantic", scores(Some(0.5), None)),
        ];

        let order = |hits: Vec<FusedHit>| -> Vec<String> {
            hits.into_iter().map(|h| h.memory.text).collect()
        };
        assert_eq!(
            order(with_all.fuse(&candidates, 10)),
            order(without_lexical.fuse(&candidates, 10))
        );
    }

    #[test]
    fn limit_truncates() {
        let rrf = WeightedRrf::new(SearchWeights::default());
        let candidates: Vec<Candidate> = (0..30)
            .map(|i| candidate(&format!("doc {i}"), scores(Some(1.0 - i as f32 * 0.01), None)))
            .collect();
        assert_eq!(rrf.fuse(&candidates, DEFAULT_FUSE_K).len(), DEFAULT_FUSE_K);
    }

    #[test]
    fn empty_candidates_fuse_to_empty() {
        let rrf = WeightedRrf::new(SearchWeights::default());
        assert!(rrf.fuse(&[], 10).is_empty());
    }
}
