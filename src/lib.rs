//! # agent-memory
//!
//! Persistent, local-first long-term memory for conversational agents.
//!
//! The crate ingests streams of agent messages, stores them as durable
//! memory records with vector and lexical indices, and answers recall
//! queries through a hybrid multi-signal retrieval pipeline.
//!
//! ## Features
//!
//! - One embedded SQLite file per agent (relational + vector + FTS5 trigram)
//! - Hybrid recall: semantic + lexical candidates, weighted RRF fusion,
//!   two-pass cross-encoder reranking, MMR diversity
//! - Write-time semantic dedup that reinforces instead of duplicating
//! - Maintenance loops: Ebbinghaus decay, consolidation, GC, pinning
//! - Graceful degradation when the embedding service is unavailable
//!
//! ## Example
//!
//! ```rust,ignore
//! use agent_memory::{CoreContext, MemoryConfig, RecallRequest};
//!
//! let core = CoreContext::open(MemoryConfig::from_env()?)?;
//! let response = core.recall(&RecallRequest::new("what did we decide about the cache?"))?;
//! for hit in &response.results {
//!     println!("{:.2} {}", hit.score, hit.text);
//! }
//! ```

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![forbid(unsafe_code)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

use std::error::Error as StdError;
use std::fmt;

pub mod config;
pub mod context;
pub mod embedding;
pub mod lifecycle;
pub mod models;
pub mod normalize;
pub mod observability;
pub mod recall;
pub mod storage;
pub mod trigger;
pub mod write;

pub use config::MemoryConfig;
pub use context::CoreContext;
pub use embedding::Embedder;
pub use models::{
    Category, ConfidenceTier, EmbeddingStatus, Memory, MemoryFilter, MemoryId, RecallRequest,
    RecallResponse, RecallResult, SearchMode,
};
pub use recall::RecallService;
pub use storage::{MergeOutcome, Store, StoragePool};
pub use write::CaptureService;

/// Error type for memory operations.
///
/// Core functions report failures by typed values; no exceptional control
/// flow crosses component boundaries. The HTTP adapter maps these kinds to
/// status codes; the CLI maps them to exit codes via [`Error::exit_code`].
#[derive(Debug)]
pub enum Error {
    /// Missing or invalid configuration; fatal at startup.
    Config(String),
    /// Store-level corruption detected (schema mismatch, failed integrity check).
    StoreIntegrity(String),
    /// Store-level I/O failure (open, read, write).
    StoreIo {
        /// The store operation that failed.
        operation: String,
        /// The underlying cause.
        cause: String,
    },
    /// A write conflicted with concurrent state.
    StoreConflict(String),
    /// The requested record does not exist. Recoverable by the caller.
    NotFound(String),
    /// Transient embedding failure; the caller may retry.
    EmbedTransient(String),
    /// Non-retryable embedding failure.
    EmbedFatal(String),
    /// The embedding circuit breaker is open.
    EmbedCircuitOpen,
    /// The remote returned a vector of the wrong dimension.
    EmbedDimMismatch {
        /// Dimension the store is configured for.
        expected: usize,
        /// Dimension the remote returned.
        actual: usize,
    },
    /// A recall deadline was exceeded; partial results were returned.
    Timeout {
        /// The operation that timed out.
        operation: String,
        /// The deadline in milliseconds.
        deadline_ms: u64,
    },
    /// Invalid input (bad agent id, oversized payload, empty query).
    Validation(String),
    /// A required secret (API key) is missing.
    MissingSecret(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::StoreIntegrity(msg) => write!(f, "store integrity failure: {msg}"),
            Self::StoreIo { operation, cause } => {
                write!(f, "store operation '{operation}' failed: {cause}")
            },
            Self::StoreConflict(msg) => write!(f, "store conflict: {msg}"),
            Self::NotFound(what) => write!(f, "not found: {what}"),
            Self::EmbedTransient(msg) => write!(f, "transient embedding failure: {msg}"),
            Self::EmbedFatal(msg) => write!(f, "embedding failure: {msg}"),
            Self::EmbedCircuitOpen => write!(f, "embedding circuit breaker is open"),
            Self::EmbedDimMismatch { expected, actual } => {
                write!(
                    f,
                    "embedding dimension mismatch: expected {expected}, got {actual}"
                )
            },
            Self::Timeout {
                operation,
                deadline_ms,
            } => write!(f, "'{operation}' exceeded deadline of {deadline_ms}ms"),
            Self::Validation(msg) => write!(f, "invalid input: {msg}"),
            Self::MissingSecret(what) => write!(f, "missing required secret: {what}"),
        }
    }
}

impl StdError for Error {}

impl Error {
    /// Returns whether a retry of the same call may succeed.
    #[must_use]
    pub const fn retryable(&self) -> bool {
        matches!(
            self,
            Self::EmbedTransient(_) | Self::StoreConflict(_) | Self::Timeout { .. }
        )
    }

    /// Returns a stable machine-readable kind label.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::StoreIntegrity(_) => "store_integrity",
            Self::StoreIo { .. } => "store_io",
            Self::StoreConflict(_) => "store_conflict",
            Self::NotFound(_) => "not_found",
            Self::EmbedTransient(_) => "embed_transient",
            Self::EmbedFatal(_) => "embed_fatal",
            Self::EmbedCircuitOpen => "embed_circuit_open",
            Self::EmbedDimMismatch { .. } => "embed_dim_mismatch",
            Self::Timeout { .. } => "timeout",
            Self::Validation(_) => "validation",
            Self::MissingSecret(_) => "missing_secret",
        }
    }

    /// Maps an error to the process exit code used by the CLI entry point.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 2,
            Self::StoreIntegrity(_) | Self::StoreIo { .. } => 3,
            Self::MissingSecret(_) => 4,
            _ => 1,
        }
    }
}

/// Result type alias for memory operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Returns the current Unix timestamp in seconds.
///
/// Clock-before-epoch is treated as zero rather than a panic; the store
/// only ever compares timestamps for ordering.
#[must_use]
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs())
}
