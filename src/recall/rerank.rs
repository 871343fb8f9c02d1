//! Two-pass cross-encoder reranking and MMR diversity.
//!
//! The primary pass re-scores the fused top-K inline under a per-document
//! character budget; an adaptive gate skips it when the fused ranking is
//! already confident. The secondary (quality) pass runs on a detached
//! background thread after the response is returned and rewrites the
//! recall-cache entry, so the next identical query sees the better
//! ordering.
//!
//! Model identity stays a configuration concern: `fast | balanced |
//! quality` presets resolve to well-known cross-encoder names, anything
//! else passes through verbatim.

use super::fusion::FusedHit;
use crate::config::{RerankConfig, RerankPassConfig};
use crate::models::{ConfidenceTier, RecallResult};
use crate::storage::cosine_similarity;
use crate::{Error, Result};
use lru::LruCache;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Score-cache TTL.
const SCORE_CACHE_TTL: Duration = Duration::from_secs(600);

/// Score-cache capacity.
const SCORE_CACHE_CAP: usize = 5_000;

/// Resolves a model preset to a concrete cross-encoder name.
#[must_use]
pub fn resolve_model_preset(name: &str) -> &str {
    match name.trim().to_lowercase().as_str() {
        "fast" => "cross-encoder/ms-marco-MiniLM-L-6-v2",
        "balanced" => "cross-encoder/ms-marco-MiniLM-L-12-v2",
        "quality" => "BAAI/bge-reranker-v2-m3",
        _ => name,
    }
}

/// Capability interface for cross-encoder scoring.
///
/// An empty score vector means "unavailable": callers keep the incoming
/// order rather than failing the recall.
pub trait CrossEncoder: Send + Sync {
    /// Model name for logs and metrics.
    fn name(&self) -> &str;

    /// Loads the model eagerly. Safe to call repeatedly.
    fn warmup(&self) -> bool {
        true
    }

    /// Scores `(query, doc)` pairs into [0, 1], one score per doc.
    ///
    /// # Errors
    ///
    /// Implementations may fail on transport errors; callers treat any
    /// error as "pass unavailable".
    fn score(&self, query: &str, docs: &[&str]) -> Result<Vec<f32>>;
}

/// Disabled cross-encoder.
pub struct NullCrossEncoder;

impl CrossEncoder for NullCrossEncoder {
    fn name(&self) -> &str {
        "null"
    }

    fn score(&self, _query: &str, _docs: &[&str]) -> Result<Vec<f32>> {
        Ok(Vec::new())
    }
}

/// Local token-overlap scorer.
///
/// The no-dependency fallback when no scoring endpoint is configured:
/// Jaccard overlap between query and document tokens. Far weaker than a
/// real cross-encoder but monotone in topical overlap, deterministic, and
/// free.
pub struct TokenOverlapCrossEncoder;

impl CrossEncoder for TokenOverlapCrossEncoder {
    fn name(&self) -> &str {
        "token-overlap"
    }

    fn score(&self, query: &str, docs: &[&str]) -> Result<Vec<f32>> {
        let query_tokens: std::collections::HashSet<String> = query
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect();
        if query_tokens.is_empty() {
            return Ok(vec![0.0; docs.len()]);
        }

        Ok(docs
            .iter()
            .map(|doc| {
                let doc_tokens: std::collections::HashSet<String> = doc
                    .to_lowercase()
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|t| !t.is_empty())
                    .map(ToString::to_string)
                    .collect();
                if doc_tokens.is_empty() {
                    return 0.0;
                }
                let intersection = query_tokens.intersection(&doc_tokens).count();
                let union = query_tokens.union(&doc_tokens).count();
                #[allow(clippy::cast_precision_loss)]
                let jaccard = intersection as f32 / union as f32;
                jaccard
            })
            .collect())
    }
}

#[derive(Serialize)]
struct RerankRequest<'a> {
    model: &'a str,
    query: &'a str,
    documents: &'a [&'a str],
}

#[derive(Deserialize)]
struct RerankResponse {
    results: Vec<RerankRow>,
}

#[derive(Deserialize)]
struct RerankRow {
    index: usize,
    relevance_score: f32,
}

/// Remote cross-encoder over the common `/rerank` wire format.
///
/// Raw model scores pass through a sigmoid to land in [0, 1] for fusion;
/// a TTL score cache keyed by `(query, doc)` absorbs repeat queries.
pub struct HttpCrossEncoder {
    base_url: String,
    model: String,
    api_key: Option<SecretString>,
    client: reqwest::blocking::Client,
    cache: Mutex<LruCache<String, (f32, Instant)>>,
    warmed: AtomicBool,
}

impl HttpCrossEncoder {
    /// Creates a client for a scoring endpoint.
    #[must_use]
    pub fn new(base_url: &str, model: &str, api_key: Option<&str>) -> Self {
        let capacity = NonZeroUsize::new(SCORE_CACHE_CAP).unwrap_or(NonZeroUsize::MIN);
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: resolve_model_preset(model).to_string(),
            api_key: api_key.map(|k| SecretString::from(k.to_string())),
            client: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::blocking::Client::new()),
            cache: Mutex::new(LruCache::new(capacity)),
            warmed: AtomicBool::new(false),
        }
    }

    fn cache_key(&self, query: &str, doc: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(query.as_bytes());
        hasher.update(b"\x00");
        hasher.update(doc.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(40);
        for byte in digest.iter().take(20) {
            use std::fmt::Write;
            let _ = write!(hex, "{byte:02x}");
        }
        hex
    }

    fn sigmoid(x: f32) -> f32 {
        if x >= 0.0 {
            1.0 / (1.0 + (-x).exp())
        } else {
            let z = x.exp();
            z / (1.0 + z)
        }
    }
}

impl CrossEncoder for HttpCrossEncoder {
    fn name(&self) -> &str {
        &self.model
    }

    fn warmup(&self) -> bool {
        if self.warmed.load(Ordering::Acquire) {
            return true;
        }
        let ok = self.score("warmup", &["warmup"]).is_ok();
        self.warmed.store(ok, Ordering::Release);
        ok
    }

    fn score(&self, query: &str, docs: &[&str]) -> Result<Vec<f32>> {
        if docs.is_empty() {
            return Ok(Vec::new());
        }

        let mut scores: Vec<Option<f32>> = vec![None; docs.len()];
        let mut to_score: Vec<usize> = Vec::new();
        {
            let mut cache = self
                .cache
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for (i, doc) in docs.iter().enumerate() {
                let key = self.cache_key(query, doc);
                match cache.get(&key) {
                    Some((score, at)) if at.elapsed() < SCORE_CACHE_TTL => {
                        scores[i] = Some(*score);
                    },
                    _ => to_score.push(i),
                }
            }
        }

        if !to_score.is_empty() {
            let pending: Vec<&str> = to_score.iter().map(|&i| docs[i]).collect();
            let mut request = self
                .client
                .post(format!("{}/rerank", self.base_url))
                .json(&RerankRequest {
                    model: &self.model,
                    query,
                    documents: &pending,
                });
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key.expose_secret());
            }

            let response = request
                .send()
                .map_err(|e| Error::EmbedTransient(format!("rerank call failed: {e}")))?;
            if !response.status().is_success() {
                return Err(Error::EmbedTransient(format!(
                    "rerank endpoint returned {}",
                    response.status()
                )));
            }
            let body: RerankResponse = response
                .json()
                .map_err(|e| Error::EmbedFatal(format!("malformed rerank response: {e}")))?;

            let mut cache = self
                .cache
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            for row in body.results {
                let Some(&doc_idx) = to_score.get(row.index) else {
                    continue;
                };
                let normalized = Self::sigmoid(row.relevance_score);
                scores[doc_idx] = Some(normalized);
                let key = self.cache_key(query, docs[doc_idx]);
                cache.put(key, (normalized, Instant::now()));
            }
        }

        Ok(scores.into_iter().map(|s| s.unwrap_or(0.0)).collect())
    }
}

/// Truncates a document to the per-pass character budget.
fn clip_doc(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

/// The two-pass reranking engine.
pub struct TwoPassReranker {
    primary: Option<Arc<dyn CrossEncoder>>,
    secondary: Option<Arc<dyn CrossEncoder>>,
    config: RerankConfig,
}

impl TwoPassReranker {
    /// Wires the engine from configuration and encoder handles.
    #[must_use]
    pub fn new(
        config: RerankConfig,
        primary: Option<Arc<dyn CrossEncoder>>,
        secondary: Option<Arc<dyn CrossEncoder>>,
    ) -> Self {
        let engine = Self {
            primary,
            secondary,
            config,
        };
        if engine.config.primary.prewarm
            && let Some(encoder) = &engine.primary
        {
            encoder.warmup();
        }
        if engine.config.secondary.prewarm
            && let Some(encoder) = &engine.secondary
        {
            encoder.warmup();
        }
        engine
    }

    /// Whether the background quality pass should run.
    #[must_use]
    pub fn secondary_enabled(&self) -> bool {
        self.config.secondary.enabled && self.secondary.is_some()
    }

    /// Configured secondary top-K.
    #[must_use]
    pub const fn secondary_top_k(&self) -> usize {
        self.config.secondary.top_k
    }

    /// Inline primary pass over the fused top-K. Returns whether a
    /// re-scoring actually happened.
    ///
    /// Skipped when disabled, when no encoder is wired, when the adaptive
    /// gate finds the top-2 fused spread already confident, or when the
    /// encoder reports itself unavailable. In every skip case the fused
    /// order stands.
    pub fn primary_pass(&self, query: &str, hits: &mut Vec<FusedHit>) -> bool {
        let pass = &self.config.primary;
        let Some(encoder) = (pass.enabled).then_some(self.primary.as_ref()).flatten() else {
            return false;
        };
        if hits.len() < 2 {
            return false;
        }
        if hits[0].fused - hits[1].fused > self.config.confident_gap {
            metrics::counter!("rerank_gate_skips_total").increment(1);
            tracing::debug!(
                gap = hits[0].fused - hits[1].fused,
                "Fused ranking confident, skipping primary rerank"
            );
            return false;
        }

        Self::run_pass(encoder.as_ref(), pass, query, hits, "primary", |hit, score, weight| {
            hit.scores.reranker_primary = Some(score);
            hit.fused = (1.0 - weight).mul_add(hit.fused, weight * score);
        })
    }

    /// Background quality pass over an already-ranked result list.
    /// Returns whether the ordering was re-scored.
    pub fn secondary_pass(&self, query: &str, results: &mut [RecallResult]) -> bool {
        let pass = &self.config.secondary;
        let Some(encoder) = (pass.enabled).then_some(self.secondary.as_ref()).flatten() else {
            return false;
        };
        if results.is_empty() {
            return false;
        }

        let k = pass.top_k.min(results.len());
        let docs: Vec<&str> = results[..k]
            .iter()
            .map(|r| clip_doc(&r.text, pass.max_doc_chars))
            .collect();

        let start = Instant::now();
        let scores = match encoder.score(query, &docs) {
            Ok(scores) if scores.len() == docs.len() && !scores.is_empty() => scores,
            Ok(_) => return false,
            Err(e) => {
                tracing::warn!(error = %e, model = encoder.name(), "Secondary rerank failed");
                return false;
            },
        };
        metrics::histogram!("recall_stage_duration_ms", "stage" => "rerank_secondary")
            .record(start.elapsed().as_secs_f64() * 1000.0);

        for (result, score) in results[..k].iter_mut().zip(scores) {
            result.scores.reranker_secondary = Some(score);
            result.score = (1.0 - pass.weight).mul_add(result.score, pass.weight * score);
            result.confidence_tier = ConfidenceTier::from_score(result.score);
        }
        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        true
    }

    fn run_pass(
        encoder: &dyn CrossEncoder,
        pass: &RerankPassConfig,
        query: &str,
        hits: &mut Vec<FusedHit>,
        stage: &'static str,
        apply: impl Fn(&mut FusedHit, f32, f32),
    ) -> bool {
        let k = pass.top_k.min(hits.len());
        let docs: Vec<&str> = hits[..k]
            .iter()
            .map(|h| clip_doc(&h.memory.text, pass.max_doc_chars))
            .collect();

        let start = Instant::now();
        let scores = match encoder.score(query, &docs) {
            Ok(scores) if scores.len() == docs.len() && !scores.is_empty() => scores,
            Ok(_) => return false,
            Err(e) => {
                tracing::warn!(error = %e, model = encoder.name(), "Rerank pass failed");
                return false;
            },
        };
        metrics::histogram!("recall_stage_duration_ms", "stage" => stage)
            .record(start.elapsed().as_secs_f64() * 1000.0);

        for (hit, score) in hits[..k].iter_mut().zip(scores) {
            apply(hit, score, pass.weight);
        }
        hits.sort_by(|a, b| {
            b.fused
                .partial_cmp(&a.fused)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        true
    }

    /// Maximal Marginal Relevance post-pass over document embeddings.
    ///
    /// Greedy selection maximizing `lambda * score - (1 - lambda) *
    /// max_similarity_to_selected`; documents without embeddings carry no
    /// redundancy penalty. A lambda of 1.0 disables the pass.
    pub fn apply_mmr(&self, hits: &mut Vec<FusedHit>) {
        let lambda = self.config.mmr_lambda;
        if lambda >= 1.0 || hits.len() <= 2 {
            return;
        }

        let mut remaining: Vec<FusedHit> = std::mem::take(hits);
        let mut selected: Vec<FusedHit> = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut best_idx = 0;
            let mut best_value = f32::NEG_INFINITY;
            for (idx, candidate) in remaining.iter().enumerate() {
                let redundancy = candidate
                    .memory
                    .embedding
                    .as_deref()
                    .map_or(0.0, |embedding| {
                        selected
                            .iter()
                            .filter_map(|s| s.memory.embedding.as_deref())
                            .map(|other| cosine_similarity(embedding, other))
                            .fold(0.0_f32, f32::max)
                    });
                let value = lambda.mul_add(candidate.fused, -((1.0 - lambda) * redundancy));
                if value > best_value {
                    best_value = value;
                    best_idx = idx;
                }
            }
            selected.push(remaining.swap_remove(best_idx));
        }

        *hits = selected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Category, LayerScores, Memory};

    struct FixedScores(Vec<f32>);

    impl CrossEncoder for FixedScores {
        fn name(&self) -> &str {
            "fixed"
        }

        fn score(&self, _query: &str, docs: &[&str]) -> Result<Vec<f32>> {
            Ok(self.0.iter().copied().take(docs.len()).collect())
        }
    }

    fn hit(text: &str, fused: f32, embedding: Option<Vec<f32>>) -> FusedHit {
        let mut memory = Memory::new("main", text, text, Category::Fact, 0);
        if let Some(e) = embedding {
            memory = memory.with_embedding(e);
        }
        FusedHit {
            memory,
            scores: LayerScores::default(),
            fused,
            raw_fused: fused,
        }
    }

    fn engine_with_primary(
        encoder: Arc<dyn CrossEncoder>,
        confident_gap: f32,
    ) -> TwoPassReranker {
        let config = RerankConfig {
            confident_gap,
            ..RerankConfig::default()
        };
        TwoPassReranker::new(config, Some(encoder), None)
    }

    #[test]
    fn preset_resolution() {
        assert_eq!(
            resolve_model_preset("quality"),
            "BAAI/bge-reranker-v2-m3"
        );
        assert_eq!(
            resolve_model_preset("fast"),
            "cross-encoder/ms-marco-MiniLM-L-6-v2"
        );
        assert_eq!(resolve_model_preset("custom/model"), "custom/model");
    }

    #[test]
    fn primary_pass_reorders_by_blend() {
        // Encoder strongly prefers the second document; the 0.05 fused gap
        // is under the gate, so the pass runs.
        let engine = engine_with_primary(Arc::new(FixedScores(vec![0.1, 0.99])), 0.9);
        let mut hits = vec![hit("first", 1.0, None), hit("second", 0.95, None)];
        assert!(engine.primary_pass("query", &mut hits));
        assert_eq!(hits[0].memory.text, "second");
        assert!(hits[0].scores.reranker_primary.is_some());
    }

    #[test]
    fn confident_gap_gates_the_pass() {
        let engine = engine_with_primary(Arc::new(FixedScores(vec![0.0, 1.0])), 0.2);
        let mut hits = vec![hit("leader", 1.0, None), hit("distant", 0.3, None)];
        assert!(!engine.primary_pass("query", &mut hits));
        assert_eq!(hits[0].memory.text, "leader");
        assert!(hits[0].scores.reranker_primary.is_none());
    }

    #[test]
    fn unavailable_encoder_keeps_fused_order() {
        let engine = engine_with_primary(Arc::new(NullCrossEncoder), 0.9);
        let mut hits = vec![hit("a", 1.0, None), hit("b", 0.9, None)];
        assert!(!engine.primary_pass("query", &mut hits));
        assert_eq!(hits[0].memory.text, "a");
    }

    #[test]
    fn disabled_primary_never_runs() {
        let config = RerankConfig::default();
        let config = RerankConfig {
            primary: RerankPassConfig {
                enabled: false,
                ..config.primary
            },
            ..config
        };
        let engine = TwoPassReranker::new(config, Some(Arc::new(FixedScores(vec![1.0]))), None);
        let mut hits = vec![hit("a", 1.0, None), hit("b", 0.99, None)];
        assert!(!engine.primary_pass("query", &mut hits));
    }

    #[test]
    fn secondary_pass_rewrites_scores_and_tiers() {
        let config = RerankConfig::default();
        let engine = TwoPassReranker::new(
            config,
            None,
            Some(Arc::new(FixedScores(vec![0.95, 0.1, 0.9]))),
        );

        let mut results: Vec<RecallResult> = ["one", "two", "three"]
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let memory = Memory::new("main", *text, *text, Category::Fact, 0);
                #[allow(clippy::cast_precision_loss)]
                let score = 0.8 - i as f32 * 0.1;
                RecallResult {
                    id: memory.id.clone(),
                    agent: "main".to_string(),
                    text: (*text).to_string(),
                    category: Category::Fact,
                    namespace: None,
                    created_at: 0,
                    pinned: false,
                    importance: 0.5,
                    strength: 1.0,
                    scores: LayerScores::default(),
                    score,
                    confidence_tier: ConfidenceTier::Medium,
                }
            })
            .collect();

        assert!(engine.secondary_pass("query", &mut results));
        assert!(results[0].scores.reranker_secondary.is_some());
        // "one" blends 0.65*0.8 + 0.35*0.95 = 0.8525 → HIGH tier.
        assert_eq!(results[0].text, "one");
        assert_eq!(results[0].confidence_tier, ConfidenceTier::High);
        // "two" was dragged down by its 0.1 secondary score.
        assert!(results.iter().position(|r| r.text == "two").unwrap() > 0);
    }

    #[test]
    fn mmr_demotes_near_duplicates() {
        let config = RerankConfig {
            mmr_lambda: 0.5,
            ..RerankConfig::default()
        };
        let engine = TwoPassReranker::new(config, None, None);

        let mut hits = vec![
            hit("dup a", 1.0, Some(vec![1.0, 0.0, 0.0])),
            hit("dup b", 0.98, Some(vec![1.0, 0.0, 0.0])),
            hit("diverse", 0.7, Some(vec![0.0, 1.0, 0.0])),
        ];
        engine.apply_mmr(&mut hits);
        assert_eq!(hits[0].memory.text, "dup a");
        // The orthogonal document beats the duplicate despite a lower score.
        assert_eq!(hits[1].memory.text, "diverse");
        assert_eq!(hits[2].memory.text, "dup b");
    }

    #[test]
    fn mmr_lambda_one_is_identity() {
        let config = RerankConfig {
            mmr_lambda: 1.0,
            ..RerankConfig::default()
        };
        let engine = TwoPassReranker::new(config, None, None);
        let mut hits = vec![
            hit("a", 1.0, Some(vec![1.0, 0.0])),
            hit("b", 0.9, Some(vec![1.0, 0.0])),
            hit("c", 0.8, Some(vec![1.0, 0.0])),
        ];
        engine.apply_mmr(&mut hits);
        let order: Vec<&str> = hits.iter().map(|h| h.memory.text.as_str()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn token_overlap_scores_topical_docs_higher() {
        let encoder = TokenOverlapCrossEncoder;
        let scores = encoder
            .score(
                "dark mode preference",
                &["user prefers dark mode", "coffee brewing notes"],
            )
            .expect("score");
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn sigmoid_is_bounded_and_monotone() {
        assert!(HttpCrossEncoder::sigmoid(-20.0) < 0.001);
        assert!(HttpCrossEncoder::sigmoid(20.0) > 0.999);
        assert!((HttpCrossEncoder::sigmoid(0.0) - 0.5).abs() < f32::EPSILON);
        assert!(HttpCrossEncoder::sigmoid(1.0) > HttpCrossEncoder::sigmoid(-1.0));
    }
}
