//! Recall result cache.
//!
//! Keyed by `(agent, namespace, normalized-query hash, filter hash)` — the
//! filter hash folds in limit and minimum score so two requests that would
//! rank differently never share an entry. Values carry a generation
//! counter: the background secondary reranker replaces an entry by
//! compare-and-set, so a refresh landing after eviction or a newer fill is
//! silently dropped, and the rewrite never extends the TTL.

use crate::models::{MemoryFilter, RecallResult, SearchMode};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A cached ranked answer.
#[derive(Debug, Clone)]
pub struct CachedRecall {
    /// Ranked results as of fill (or secondary refresh).
    pub results: Vec<RecallResult>,
    /// Search mode recorded at fill time.
    pub search_mode: SearchMode,
    /// Fill instant; refreshes do not move it.
    pub stored_at: Instant,
    /// Generation for compare-and-set refreshes.
    pub generation: u64,
}

/// Builds the cache key for a recall request.
#[must_use]
pub fn recall_cache_key(
    agent: &str,
    normalized_query: &str,
    filter: &MemoryFilter,
    limit: usize,
    min_score: Option<f32>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalized_query.as_bytes());
    let digest = hasher.finalize();
    let mut query_hash = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        use std::fmt::Write;
        let _ = write!(query_hash, "{byte:02x}");
    }

    format!(
        "{agent}|{}|{query_hash}|{}|{limit}|{}",
        filter.namespace.as_deref().unwrap_or("-"),
        filter.fingerprint(),
        min_score.map_or_else(|| "-".to_string(), |s| format!("{s:.4}")),
    )
}

/// TTL cache of ranked recall answers.
pub struct RecallCache {
    entries: Mutex<LruCache<String, CachedRecall>>,
    ttl: Duration,
    generations: AtomicU64,
}

impl RecallCache {
    /// Creates a cache with the given entry TTL and capacity.
    #[must_use]
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            generations: AtomicU64::new(0),
        }
    }

    /// Looks up a live entry; expired entries are evicted on the way.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CachedRecall> {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        let expired = matches!(
            entries.peek(key),
            Some(entry) if entry.stored_at.elapsed() >= self.ttl
        );
        if expired {
            entries.pop(key);
            metrics::counter!("recall_cache_misses_total", "reason" => "expired").increment(1);
            return None;
        }

        if let Some(entry) = entries.get(key) {
            metrics::counter!("recall_cache_hits_total").increment(1);
            return Some(entry.clone());
        }
        metrics::counter!("recall_cache_misses_total", "reason" => "absent").increment(1);
        None
    }

    /// Stores a fresh answer; returns its generation for later
    /// compare-and-set refreshes.
    pub fn put(
        &self,
        key: String,
        results: Vec<RecallResult>,
        search_mode: SearchMode,
    ) -> u64 {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let entry = CachedRecall {
            results,
            search_mode,
            stored_at: Instant::now(),
            generation,
        };
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .put(key, entry);
        generation
    }

    /// Replaces the ranked results of an entry if it still carries
    /// `generation`. The TTL clock is left untouched. Returns whether the
    /// swap happened.
    pub fn compare_and_swap(
        &self,
        key: &str,
        generation: u64,
        results: Vec<RecallResult>,
    ) -> bool {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match entries.peek_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.results = results;
                metrics::counter!("recall_cache_refreshes_total", "status" => "applied")
                    .increment(1);
                true
            },
            _ => {
                metrics::counter!("recall_cache_refreshes_total", "status" => "stale").increment(1);
                false
            },
        }
    }
}
