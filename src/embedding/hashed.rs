//! Offline hash-projection embedder.
//!
//! Projects character trigrams into a fixed-dimension bucket space and
//! L2-normalizes. No model, no network: texts sharing vocabulary land
//! near each other, identical texts land exactly on each other. Used as
//! the deterministic stand-in when the remote embedder is not configured,
//! and throughout the test suites.

use super::Embedder;
use crate::Result;

/// Deterministic trigram-hash embedder.
pub struct HashedEmbedder {
    dimensions: usize,
}

impl HashedEmbedder {
    /// Creates an embedder producing vectors of `dimensions` components.
    #[must_use]
    pub const fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }

    /// FNV-1a over a trigram window.
    fn bucket(&self, trigram: &[char]) -> usize {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for &c in trigram {
            hash ^= u64::from(c as u32);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        usize::try_from(hash % self.dimensions as u64).unwrap_or(0)
    }
}

impl Embedder for HashedEmbedder {
    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0_f32; self.dimensions];
        let folded: Vec<char> = text
            .to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .collect();

        for window in folded.windows(3) {
            vector[self.bucket(window)] += 1.0;
        }
        // Very short inputs still deserve a non-zero vector.
        if folded.len() < 3 && !folded.is_empty() {
            vector[self.bucket(&folded)] += 1.0;
        }

        let magnitude = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if magnitude > 0.0 {
            for value in &mut vector {
                *value /= magnitude;
            }
        }
        Ok(vector)
    }
}
