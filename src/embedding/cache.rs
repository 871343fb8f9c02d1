//! Embedding cache tiers.
//!
//! Lookup order: in-memory LRU, then the `embed_cache` table in a store
//! file, then the remote call. Keys hash `(text, model, dim)` so a model
//! or dimension change never serves stale vectors.

use crate::current_timestamp;
use crate::storage::Store;
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};

/// Computes the cache key for `(text, model, dim)`.
#[must_use]
pub fn cache_key(text: &str, model: &str, dim: usize) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.update(b"\x00");
    hasher.update(model.as_bytes());
    hasher.update(b"\x00");
    hasher.update(dim.to_le_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

/// Two local tiers of the three-tier embedding cache.
pub struct EmbedCache {
    lru: Mutex<LruCache<String, Vec<f32>>>,
    persistent: RwLock<Option<Arc<Store>>>,
    model: String,
    dim: usize,
}

impl EmbedCache {
    /// Creates a cache sized for `capacity` in-memory entries.
    #[must_use]
    pub fn new(capacity: usize, model: impl Into<String>, dim: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            lru: Mutex::new(LruCache::new(capacity)),
            persistent: RwLock::new(None),
            model: model.into(),
            dim,
        }
    }

    /// Attaches the persistent tier (usually the default agent's store).
    pub fn set_store(&self, store: Arc<Store>) {
        *self
            .persistent
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(store);
    }

    /// Looks up a vector, promoting persistent hits into the LRU.
    #[must_use]
    pub fn get(&self, text: &str) -> Option<Vec<f32>> {
        let key = cache_key(text, &self.model, self.dim);

        if let Some(hit) = self
            .lru
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&key)
        {
            metrics::counter!("embed_cache_hits_total", "tier" => "memory").increment(1);
            return Some(hit.clone());
        }

        let store = self
            .persistent
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(store) = store {
            match store.embed_cache_get(&key) {
                Ok(Some(vector)) => {
                    metrics::counter!("embed_cache_hits_total", "tier" => "store").increment(1);
                    self.lru
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .put(key, vector.clone());
                    return Some(vector);
                },
                Ok(None) => {},
                Err(e) => {
                    tracing::debug!(error = %e, "Persistent embed cache lookup failed");
                },
            }
        }

        metrics::counter!("embed_cache_misses_total").increment(1);
        None
    }

    /// Writes a vector into both local tiers.
    pub fn put(&self, text: &str, vector: &[f32]) {
        let key = cache_key(text, &self.model, self.dim);
        self.lru
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .put(key.clone(), vector.to_vec());

        let store = self
            .persistent
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone();
        if let Some(store) = store
            && let Err(e) = store.embed_cache_put(&key, &self.model, vector, current_timestamp())
        {
            tracing::debug!(error = %e, "Persistent embed cache write failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_depends_on_text_model_and_dim() {
        let base = cache_key("hello", "model-a", 768);
        assert_ne!(base, cache_key("hello!", "model-a", 768));
        assert_ne!(base, cache_key("hello", "model-b", 768));
        assert_ne!(base, cache_key("hello", "model-a", 1024));
        assert_eq!(base, cache_key("hello", "model-a", 768));
    }

    #[test]
    fn lru_tier_roundtrip() {
        let cache = EmbedCache::new(4, "model-a", 768);
        assert!(cache.get("missing").is_none());
        cache.put("present", &[1.0, 2.0]);
        assert_eq!(cache.get("present"), Some(vec![1.0, 2.0]));
    }

    #[test]
    fn persistent_tier_survives_lru_eviction() {
        let store = Arc::new(Store::in_memory("main", 768).expect("store"));
        let cache = EmbedCache::new(1, "model-a", 768);
        cache.set_store(store);

        cache.put("first", &[1.0]);
        cache.put("second", &[2.0]); // evicts "first" from the LRU
        assert_eq!(cache.get("first"), Some(vec![1.0]));
    }
}
