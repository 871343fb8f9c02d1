//! Embedding generation.
//!
//! The [`Embedder`] capability has two call shapes reflecting the two
//! write paths: `embed` is the blocking recall-time path (a dead circuit
//! is an error), `embed_opportunistic` is the ingest path (a dead circuit
//! yields `None` and the memory is stored vectorless for backfill).

// Hash-projection embedding does lossy float casts by design.
#![allow(clippy::cast_precision_loss)]

mod cache;
mod hashed;
mod remote;
mod resilience;

pub use cache::{EmbedCache, cache_key};
pub use hashed::HashedEmbedder;
pub use remote::RemoteEmbedder;
pub use resilience::EmbedCircuitBreaker;

use crate::{Error, Result};

/// Capability interface for embedding generators.
pub trait Embedder: Send + Sync {
    /// Returns the embedding dimension.
    fn dimensions(&self) -> usize;

    /// Generates an embedding, failing loudly (recall-time path).
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmbedCircuitOpen`] while the breaker is open with
    /// no cached vector, [`Error::EmbedTransient`] after exhausted retries,
    /// and [`Error::EmbedFatal`]/[`Error::EmbedDimMismatch`] for
    /// non-retryable failures.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generates an embedding, returning `None` on any failure
    /// (non-blocking ingest path).
    fn embed_opportunistic(&self, text: &str) -> Option<Vec<f32>> {
        self.embed(text).ok()
    }

    /// Embeds a batch; per-item `None` marks items that still failed after
    /// the split-and-retry fallback.
    fn embed_batch(&self, texts: &[&str]) -> Vec<Option<Vec<f32>>> {
        texts
            .iter()
            .map(|text| self.embed_opportunistic(text))
            .collect()
    }
}

/// Disabled embedder: every call degrades to the lexical-only path.
pub struct NullEmbedder;

impl Embedder for NullEmbedder {
    fn dimensions(&self) -> usize {
        0
    }

    fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Error::EmbedFatal("embedding disabled".to_string()))
    }

    fn embed_opportunistic(&self, _text: &str) -> Option<Vec<f32>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_embedder_degrades() {
        let embedder = NullEmbedder;
        assert_eq!(embedder.dimensions(), 0);
        assert!(embedder.embed("anything").is_err());
        assert!(embedder.embed_opportunistic("anything").is_none());
        let batch = embedder.embed_batch(&["a", "b"]);
        assert_eq!(batch, vec![None, None]);
    }
}
