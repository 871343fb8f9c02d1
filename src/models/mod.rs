//! Core data structures shared across the crate.

mod filter;
mod memory;
mod recall;

pub use filter::{MemoryFilter, TimeRange};
pub use memory::{Category, EmbeddingStatus, Memory, MemoryId};
pub use recall::{
    ConfidenceTier, LayerScores, RecallRequest, RecallResponse, RecallResult, SearchMode,
};
