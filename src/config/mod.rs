//! Configuration management.
//!
//! All options are env-driven with the `AGENT_MEMORY_*` prefix; the legacy
//! `ASUMAN_MEMORY_*` prefix is honored as a fallback for existing
//! deployments. An optional JSON overlay file may override any field after
//! environment resolution.

use crate::{Error, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Embedding dimensions supported by the store.
pub const SUPPORTED_DIMENSIONS: [usize; 4] = [768, 1024, 2560, 4096];

/// Reads an env var under the current prefix, falling back to the legacy one.
fn env_var(suffix: &str) -> Option<String> {
    std::env::var(format!("AGENT_MEMORY_{suffix}"))
        .or_else(|_| std::env::var(format!("ASUMAN_MEMORY_{suffix}")))
        .ok()
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(suffix: &str) -> Option<T> {
    env_var(suffix).and_then(|v| v.parse::<T>().ok())
}

fn env_bool(suffix: &str) -> Option<bool> {
    env_var(suffix).map(|v| {
        let v = v.to_lowercase();
        v == "true" || v == "1" || v == "yes" || v == "on"
    })
}

/// Remote embedding service configuration.
#[derive(Debug, Clone)]
pub struct EmbedConfig {
    /// Base URL of the OpenAI-compatible embeddings endpoint.
    pub base_url: String,
    /// Bearer key; absent keys fail blocking embed paths at call time.
    pub api_key: Option<String>,
    /// Model identifier sent in requests.
    pub model: String,
    /// Maximum characters sent per input (truncated at a UTF-8 boundary).
    pub max_embed_chars: usize,
    /// Maximum items per batched request.
    pub batch_size: usize,
    /// In-memory LRU cache capacity.
    pub cache_capacity: usize,
    /// HTTP timeout in milliseconds.
    pub timeout_ms: u64,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            api_key: None,
            model: "openai/text-embedding-3-small".to_string(),
            max_embed_chars: 6_000,
            batch_size: 16,
            cache_capacity: 2_048,
            timeout_ms: 20_000,
        }
    }
}

/// Relative weights for the RRF fusion layers.
#[derive(Debug, Clone, Copy)]
pub struct SearchWeights {
    /// Semantic (vector) layer weight.
    pub semantic: f32,
    /// Lexical (BM25) layer weight.
    pub keyword: f32,
    /// Recency layer weight.
    pub recency: f32,
    /// Strength layer weight.
    pub strength: f32,
    /// Importance layer weight.
    pub importance: f32,
}

impl Default for SearchWeights {
    fn default() -> Self {
        Self {
            semantic: 0.50,
            keyword: 0.25,
            recency: 0.10,
            strength: 0.07,
            importance: 0.08,
        }
    }
}

/// One reranker pass (primary inline or secondary background).
#[derive(Debug, Clone)]
pub struct RerankPassConfig {
    /// Whether the pass runs at all.
    pub enabled: bool,
    /// Model name or preset (`fast` | `balanced` | `quality`).
    pub model: String,
    /// Candidates re-scored by this pass.
    pub top_k: usize,
    /// Blend weight of the cross-encoder score into the final score.
    pub weight: f32,
    /// Per-document character budget.
    pub max_doc_chars: usize,
    /// Load the model eagerly at startup.
    pub prewarm: bool,
}

/// Two-pass reranker configuration.
#[derive(Debug, Clone)]
pub struct RerankConfig {
    /// Inline pass over the fused top-K.
    pub primary: RerankPassConfig,
    /// Background quality pass that rewrites the cache entry.
    pub secondary: RerankPassConfig,
    /// Skip the primary pass when the top-2 fused spread exceeds this.
    pub confident_gap: f32,
    /// MMR diversity trade-off (1.0 disables diversification).
    pub mmr_lambda: f32,
    /// Remote scoring endpoint base URL, shared by both passes.
    pub base_url: Option<String>,
    /// Bearer key for the scoring endpoint.
    pub api_key: Option<String>,
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            primary: RerankPassConfig {
                enabled: true,
                model: "balanced".to_string(),
                top_k: 10,
                weight: 0.22,
                max_doc_chars: 600,
                prewarm: false,
            },
            secondary: RerankPassConfig {
                enabled: true,
                model: "quality".to_string(),
                top_k: 3,
                weight: 0.35,
                max_doc_chars: 600,
                prewarm: false,
            },
            confident_gap: 0.25,
            mmr_lambda: 0.7,
            base_url: None,
            api_key: None,
        }
    }
}

/// Write-path dedup/merge thresholds.
#[derive(Debug, Clone, Copy)]
pub struct MergeConfig {
    /// Cosine similarity at or above which a write reinforces instead of
    /// inserting.
    pub threshold: f32,
    /// Strength bump applied on reinforcement.
    pub reinforce_delta: f32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            threshold: 0.85,
            reinforce_delta: 0.10,
        }
    }
}

/// Decay, consolidation, and GC thresholds.
#[derive(Debug, Clone, Copy)]
pub struct LifecycleConfig {
    /// Ebbinghaus base decay rate per day.
    pub decay_base_rate: f32,
    /// Importance amplification in the retention denominator.
    pub decay_alpha: f32,
    /// Strength below which a memory becomes a GC candidate.
    pub weak_threshold: f32,
    /// Age in days after which an unused weak memory becomes a GC candidate.
    pub stale_days: u32,
    /// Window in days over which zero accesses counts as unused.
    pub unused_days: u32,
    /// Days after soft-deletion before hard purge.
    pub purge_after_days: u32,
    /// Cosine similarity for consolidation clustering.
    pub consolidate_threshold: f32,
    /// Confidence margin required for a newer assertion to supersede.
    pub conflict_margin: f32,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            decay_base_rate: 0.15,
            decay_alpha: 2.0,
            weak_threshold: 0.1,
            stale_days: 90,
            unused_days: 90,
            purge_after_days: 30,
            consolidate_threshold: 0.9,
            conflict_margin: 0.1,
        }
    }
}

/// Recall cache settings.
#[derive(Debug, Clone, Copy)]
pub struct RecallCacheConfig {
    /// Entry TTL in seconds.
    pub ttl_secs: u64,
    /// Maximum cached entries.
    pub capacity: usize,
}

impl Default for RecallCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 60,
            capacity: 512,
        }
    }
}

/// Top-level configuration handle.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Directory holding one store file per agent.
    pub data_dir: PathBuf,
    /// Embedding dimension D; every stored vector has exactly D components.
    pub dimensions: usize,
    /// Remote embedder settings.
    pub embed: EmbedConfig,
    /// Fusion weights.
    pub weights: SearchWeights,
    /// Two-pass reranker settings.
    pub rerank: RerankConfig,
    /// Write-merge thresholds.
    pub merge: MergeConfig,
    /// Maintenance thresholds.
    pub lifecycle: LifecycleConfig,
    /// Recall cache settings.
    pub recall_cache: RecallCacheConfig,
    /// Whether the embedding backfill pass is enabled.
    pub embed_worker_enabled: bool,
    /// Days of JSON backups kept by the export rotation.
    pub backup_retention_days: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            dimensions: 1024,
            embed: EmbedConfig::default(),
            weights: SearchWeights::default(),
            rerank: RerankConfig::default(),
            merge: MergeConfig::default(),
            lifecycle: LifecycleConfig::default(),
            recall_cache: RecallCacheConfig::default(),
            embed_worker_enabled: true,
            backup_retention_days: 14,
        }
    }
}

/// Resolves the data directory:
/// `$AGENT_MEMORY_DATA_DIR`, else `$HOME/.agent-memory`, else `$HOME/.asuman`
/// when that legacy directory already exists.
fn default_data_dir() -> PathBuf {
    if let Some(dir) = env_var("DATA_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").map_or_else(|_| PathBuf::from("."), PathBuf::from);
    let preferred = home.join(".agent-memory");
    if preferred.exists() {
        return preferred;
    }
    let legacy = home.join(".asuman");
    if legacy.exists() {
        return legacy;
    }
    preferred
}

impl MemoryConfig {
    /// Loads configuration from the environment and validates it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configured dimension is unsupported
    /// or a numeric override fails validation.
    pub fn from_env() -> Result<Self> {
        let config = Self::default().with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from the environment, then applies a JSON overlay.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the overlay cannot be read or parsed, or
    /// if the resulting configuration is invalid.
    pub fn from_env_with_overlay(path: &Path) -> Result<Self> {
        let mut config = Self::default().with_env_overrides();
        config.apply_overlay(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies environment variable overrides.
    #[must_use]
    #[allow(clippy::too_many_lines)]
    pub fn with_env_overrides(mut self) -> Self {
        self.data_dir = default_data_dir();

        if let Some(d) = env_parse::<usize>("DIMENSIONS") {
            self.dimensions = d;
        }
        if let Some(v) = env_var("EMBED_BASE_URL") {
            self.embed.base_url = v;
        }
        if let Some(v) = env_var("EMBED_API_KEY") {
            self.embed.api_key = Some(v);
        }
        if let Some(v) = env_var("EMBED_MODEL") {
            self.embed.model = v;
        }
        if let Some(v) = env_parse::<usize>("EMBED_MAX_CHARS") {
            self.embed.max_embed_chars = v.max(256);
        }
        if let Some(v) = env_parse::<usize>("EMBED_BATCH_SIZE") {
            self.embed.batch_size = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("EMBED_TIMEOUT_MS") {
            self.embed.timeout_ms = v;
        }

        if let Some(v) = env_parse::<f32>("W_SEMANTIC") {
            self.weights.semantic = v;
        }
        if let Some(v) = env_parse::<f32>("W_KEYWORD") {
            self.weights.keyword = v;
        }
        if let Some(v) = env_parse::<f32>("W_RECENCY") {
            self.weights.recency = v;
        }
        if let Some(v) = env_parse::<f32>("W_STRENGTH") {
            self.weights.strength = v;
        }
        if let Some(v) = env_parse::<f32>("W_IMPORTANCE") {
            self.weights.importance = v;
        }

        if let Some(v) = env_bool("RERANKER_ENABLED") {
            self.rerank.primary.enabled = v;
            if !v {
                self.rerank.secondary.enabled = false;
            }
        }
        if let Some(v) = env_var("RERANKER_MODEL") {
            self.rerank.primary.model = v;
        }
        if let Some(v) = env_parse::<usize>("RERANKER_TOP_K") {
            self.rerank.primary.top_k = v.max(1);
        }
        if let Some(v) = env_parse::<f32>("RERANKER_WEIGHT") {
            self.rerank.primary.weight = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_parse::<usize>("RERANKER_MAX_DOC_CHARS") {
            self.rerank.primary.max_doc_chars = v.max(100);
            self.rerank.secondary.max_doc_chars = v.max(100);
        }
        if let Some(v) = env_bool("RERANKER_PREWARM") {
            self.rerank.primary.prewarm = v;
        }
        if let Some(v) = env_bool("RERANKER2_ENABLED") {
            self.rerank.secondary.enabled = v;
        }
        if let Some(v) = env_var("RERANKER2_MODEL") {
            self.rerank.secondary.model = v;
        }
        if let Some(v) = env_parse::<usize>("RERANKER2_TOP_K") {
            self.rerank.secondary.top_k = v.max(1);
        }
        if let Some(v) = env_parse::<f32>("RERANKER2_WEIGHT") {
            self.rerank.secondary.weight = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_var("RERANKER_BASE_URL") {
            self.rerank.base_url = Some(v);
        }
        if let Some(v) = env_var("RERANKER_API_KEY") {
            self.rerank.api_key = Some(v);
        }

        if let Some(v) = env_parse::<f32>("MERGE_THRESHOLD") {
            self.merge.threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = env_parse::<u64>("CACHE_TTL_SECS") {
            self.recall_cache.ttl_secs = v;
        }
        if let Some(v) = env_bool("EMBED_WORKER_ENABLED") {
            self.embed_worker_enabled = v;
        }
        if let Some(v) = env_parse::<u32>("BACKUP_RETENTION_DAYS") {
            self.backup_retention_days = v;
        }

        self
    }

    /// Applies a JSON overlay file on top of the current values.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the file is unreadable or malformed.
    pub fn apply_overlay(&mut self, path: &Path) -> Result<()> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read overlay {}: {e}", path.display())))?;
        let overlay: ConfigOverlay = serde_json::from_str(&raw)
            .map_err(|e| Error::Config(format!("malformed overlay {}: {e}", path.display())))?;
        overlay.apply(self);
        Ok(())
    }

    /// Validates cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for unsupported dimensions or degenerate
    /// weights.
    pub fn validate(&self) -> Result<()> {
        if !SUPPORTED_DIMENSIONS.contains(&self.dimensions) {
            return Err(Error::Config(format!(
                "unsupported embedding dimension {} (expected one of {SUPPORTED_DIMENSIONS:?})",
                self.dimensions
            )));
        }
        let weight_sum = self.weights.semantic
            + self.weights.keyword
            + self.weights.recency
            + self.weights.strength
            + self.weights.importance;
        if weight_sum <= 0.0 {
            return Err(Error::Config(
                "search weights must sum to a positive value".to_string(),
            ));
        }
        if self.merge.threshold < 0.5 {
            return Err(Error::Config(format!(
                "merge threshold {} is below 0.5; near-everything would merge",
                self.merge.threshold
            )));
        }
        Ok(())
    }
}

/// JSON overlay file: every field optional, applied over the env-derived
/// configuration.
#[derive(Debug, Default, Deserialize)]
struct ConfigOverlay {
    data_dir: Option<String>,
    dimensions: Option<usize>,
    embed_base_url: Option<String>,
    embed_api_key: Option<String>,
    embed_model: Option<String>,
    max_embed_chars: Option<usize>,
    weights: Option<OverlayWeights>,
    reranker_enabled: Option<bool>,
    reranker_model: Option<String>,
    reranker2_model: Option<String>,
    merge_threshold: Option<f32>,
    cache_ttl_secs: Option<u64>,
    embed_worker_enabled: Option<bool>,
    backup_retention_days: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct OverlayWeights {
    semantic: Option<f32>,
    keyword: Option<f32>,
    recency: Option<f32>,
    strength: Option<f32>,
    importance: Option<f32>,
}

impl ConfigOverlay {
    fn apply(self, config: &mut MemoryConfig) {
        if let Some(v) = self.data_dir {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = self.dimensions {
            config.dimensions = v;
        }
        if let Some(v) = self.embed_base_url {
            config.embed.base_url = v;
        }
        if let Some(v) = self.embed_api_key {
            config.embed.api_key = Some(v);
        }
        if let Some(v) = self.embed_model {
            config.embed.model = v;
        }
        if let Some(v) = self.max_embed_chars {
            config.embed.max_embed_chars = v.max(256);
        }
        if let Some(w) = self.weights {
            if let Some(v) = w.semantic {
                config.weights.semantic = v;
            }
            if let Some(v) = w.keyword {
                config.weights.keyword = v;
            }
            if let Some(v) = w.recency {
                config.weights.recency = v;
            }
            if let Some(v) = w.strength {
                config.weights.strength = v;
            }
            if let Some(v) = w.importance {
                config.weights.importance = v;
            }
        }
        if let Some(v) = self.reranker_enabled {
            config.rerank.primary.enabled = v;
            if !v {
                config.rerank.secondary.enabled = false;
            }
        }
        if let Some(v) = self.reranker_model {
            config.rerank.primary.model = v;
        }
        if let Some(v) = self.reranker2_model {
            config.rerank.secondary.model = v;
        }
        if let Some(v) = self.merge_threshold {
            config.merge.threshold = v.clamp(0.0, 1.0);
        }
        if let Some(v) = self.cache_ttl_secs {
            config.recall_cache.ttl_secs = v;
        }
        if let Some(v) = self.embed_worker_enabled {
            config.embed_worker_enabled = v;
        }
        if let Some(v) = self.backup_retention_days {
            config.backup_retention_days = v;
        }
    }
}
