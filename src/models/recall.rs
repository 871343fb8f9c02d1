//! Recall request/response types.

use super::{Category, MemoryFilter, MemoryId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which candidate layers were available when a recall was answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchMode {
    /// Both semantic and lexical layers ran.
    Full,
    /// The embedder was unavailable; lexical-only candidates.
    DegradedNoVector,
    /// The lexical index failed; semantic-only candidates.
    DegradedNoLexical,
}

impl SearchMode {
    /// Returns the mode as a stable label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::DegradedNoVector => "degraded_no_vector",
            Self::DegradedNoLexical => "degraded_no_lexical",
        }
    }
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Confidence band assigned from the final fused+reranked score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConfidenceTier {
    /// Final score below 0.4.
    Low,
    /// Final score in [0.4, 0.7).
    Medium,
    /// Final score at or above 0.7.
    High,
}

impl ConfidenceTier {
    /// Threshold for the HIGH tier.
    pub const HIGH_THRESHOLD: f32 = 0.7;
    /// Threshold for the MEDIUM tier.
    pub const MEDIUM_THRESHOLD: f32 = 0.4;

    /// Assigns a tier from a final score.
    #[must_use]
    pub fn from_score(score: f32) -> Self {
        if score >= Self::HIGH_THRESHOLD {
            Self::High
        } else if score >= Self::MEDIUM_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// Returns the tier label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "HIGH",
            Self::Medium => "MEDIUM",
            Self::Low => "LOW",
        }
    }
}

/// Per-layer raw scores carried through fusion and reranking.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LayerScores {
    /// `1 - cosine_distance` from the vector index, when the layer ran.
    pub semantic: Option<f32>,
    /// BM25 normalized by the batch maximum, when the layer ran.
    pub lexical: Option<f32>,
    /// `exp(-lambda * age_days)` recency score.
    pub recency: f32,
    /// Ebbinghaus retention score.
    pub strength: f32,
    /// Stored importance.
    pub importance: f32,
    /// Primary cross-encoder score, when the pass ran.
    pub reranker_primary: Option<f32>,
    /// Secondary cross-encoder score, when the background pass has landed.
    pub reranker_secondary: Option<f32>,
}

/// One ranked memory returned to a caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResult {
    /// Memory id.
    pub id: MemoryId,
    /// Owning agent.
    pub agent: String,
    /// Raw stored content.
    pub text: String,
    /// Stored category.
    pub category: Category,
    /// Namespace partition, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Creation timestamp (Unix seconds).
    pub created_at: u64,
    /// Whether the memory is pinned.
    pub pinned: bool,
    /// Stored importance.
    pub importance: f32,
    /// Current retention strength.
    pub strength: f32,
    /// Per-layer raw scores.
    pub scores: LayerScores,
    /// Final fused (and reranked) score.
    pub score: f32,
    /// Confidence band derived from `score`.
    pub confidence_tier: ConfidenceTier,
}

/// A recall query with its filters and deadline.
#[derive(Debug, Clone)]
pub struct RecallRequest {
    /// Free-text query.
    pub query: String,
    /// Agent scope (`all` fans out through the pool).
    pub agent: String,
    /// Maximum results to return.
    pub limit: usize,
    /// Structured filter.
    pub filter: MemoryFilter,
    /// Drop results below this final score.
    pub min_score: Option<f32>,
    /// Wall-clock deadline in milliseconds; exceeded means best-partial.
    pub deadline_ms: u64,
}

impl RecallRequest {
    /// Default recall deadline (2 seconds wall clock).
    pub const DEFAULT_DEADLINE_MS: u64 = 2_000;

    /// Creates a request for the `main` agent with default limits.
    #[must_use]
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            agent: "main".to_string(),
            limit: 10,
            filter: MemoryFilter::new(),
            min_score: None,
            deadline_ms: Self::DEFAULT_DEADLINE_MS,
        }
    }

    /// Sets the agent scope.
    #[must_use]
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    /// Sets the result limit.
    #[must_use]
    pub const fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the structured filter.
    #[must_use]
    pub fn with_filter(mut self, filter: MemoryFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Sets the minimum final score.
    #[must_use]
    pub const fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = Some(min_score);
        self
    }

    /// Sets the deadline in milliseconds (0 disables the check).
    #[must_use]
    pub const fn with_deadline_ms(mut self, deadline_ms: u64) -> Self {
        self.deadline_ms = deadline_ms;
        self
    }
}

/// The answer to a recall query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecallResponse {
    /// Ranked results, best first.
    pub results: Vec<RecallResult>,
    /// Whether the trigger scorer judged the query memory-worthy.
    pub triggered: bool,
    /// Which candidate layers were available.
    pub search_mode: SearchMode,
    /// True when the deadline forced a partial result.
    pub degraded: bool,
    /// True when served from the recall cache.
    pub cached: bool,
    /// Wall time spent answering, in milliseconds.
    pub execution_time_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_thresholds() {
        assert_eq!(ConfidenceTier::from_score(0.95), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_score(0.7), ConfidenceTier::High);
        assert_eq!(ConfidenceTier::from_score(0.69), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::from_score(0.4), ConfidenceTier::Medium);
        assert_eq!(ConfidenceTier::from_score(0.39), ConfidenceTier::Low);
        assert_eq!(ConfidenceTier::from_score(0.0), ConfidenceTier::Low);
    }

    #[test]
    fn tier_ordering() {
        assert!(ConfidenceTier::High > ConfidenceTier::Medium);
        assert!(ConfidenceTier::Medium > ConfidenceTier::Low);
    }

    #[test]
    fn request_builder_defaults() {
        let req = RecallRequest::new("what changed").with_limit(3);
        assert_eq!(req.agent, "main");
        assert_eq!(req.limit, 3);
        assert_eq!(req.deadline_ms, RecallRequest::DEFAULT_DEADLINE_MS);
        assert!(req.min_score.is_none());
    }

    #[test]
    fn search_mode_labels() {
        assert_eq!(SearchMode::Full.as_str(), "full");
        assert_eq!(SearchMode::DegradedNoVector.as_str(), "degraded_no_vector");
        assert_eq!(
            SearchMode::DegradedNoLexical.as_str(),
            "degraded_no_lexical"
        );
    }
}
