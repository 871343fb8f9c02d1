//! Write path: capture, classify, dedup-merge, store.
//!
//! Every write goes through the same funnel: normalize, score importance,
//! embed opportunistically (a dead embedder still writes the memory,
//! vectorless, for the backfill pass), then a transactional
//! upsert-by-similarity against the agent's store. Semantic duplicates
//! reinforce instead of inserting; a contradicting assertion supersedes a
//! rule or preference predecessor at write time, while fact conflicts are
//! left for the consolidation pass to resolve.

use crate::embedding::Embedder;
use crate::models::{Category, EmbeddingStatus, Memory, MemoryId};
use crate::normalize::Normalizer;
use crate::storage::{MergeOutcome, StoragePool};
use crate::trigger::TriggerScorer;
use crate::config::MergeConfig;
use crate::{Error, Result};
use std::sync::Arc;

/// Maximum accepted memory text in bytes.
const MAX_TEXT_BYTES: usize = 65_536;

/// Change markers that flag a newer assertion as superseding rather than
/// repeating an existing exclusive-category memory.
const CHANGE_MARKERS: [&str; 14] = [
    "moved", "changed", "switched", "updated", "no longer", "anymore", "now lives", "new ",
    "tasindi", "degisti", "artik", "yeni ", "degil", "vazgecti",
];

/// Jaccard overlap at or above which two normalized texts count as the
/// same statement (reinforce, never conflict).
const SAME_STATEMENT_OVERLAP: f32 = 0.8;

/// A single incoming message for batch capture.
#[derive(Debug, Clone)]
pub struct CaptureMessage {
    /// Message role: `user` or `assistant` (anything else stores as
    /// conversation).
    pub role: String,
    /// Message text.
    pub text: String,
}

/// What a write produced.
#[derive(Debug, Clone)]
pub struct StoreReceipt {
    /// Id of the affected memory (new row or reinforced neighbor).
    pub id: MemoryId,
    /// Agent scope written to.
    pub agent: String,
    /// Merge decision taken.
    pub outcome: MergeOutcome,
    /// Embedding state of the affected row.
    pub embedding_status: EmbeddingStatus,
}

/// A single-memory store request.
#[derive(Debug, Clone)]
pub struct StoreRequest {
    /// Agent scope.
    pub agent: String,
    /// Raw text to remember.
    pub text: String,
    /// Category; defaults to `fact`.
    pub category: Category,
    /// Optional namespace partition.
    pub namespace: Option<String>,
    /// Optional session tag.
    pub session: Option<String>,
    /// Optional source tag (`cron`-ish sources get their importance capped).
    pub source: Option<String>,
    /// Explicit importance override.
    pub importance: Option<f32>,
    /// Pin at insert.
    pub pinned: bool,
}

impl StoreRequest {
    /// Creates a request with defaults for the `main` agent.
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            agent: "main".to_string(),
            text: text.into(),
            category: Category::Fact,
            namespace: None,
            session: None,
            source: None,
            importance: None,
            pinned: false,
        }
    }

    /// Sets the agent scope.
    #[must_use]
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    /// Sets the category.
    #[must_use]
    pub const fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    /// Sets the namespace.
    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the source tag.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Sets an explicit importance.
    #[must_use]
    pub const fn with_importance(mut self, importance: f32) -> Self {
        self.importance = Some(importance);
        self
    }
}

/// Service carrying the write path.
pub struct CaptureService {
    pool: Arc<StoragePool>,
    embedder: Arc<dyn Embedder>,
    normalizer: Arc<Normalizer>,
    trigger: TriggerScorer,
    merge: MergeConfig,
}

impl CaptureService {
    /// Wires the write path from capability handles.
    #[must_use]
    pub fn new(
        pool: Arc<StoragePool>,
        embedder: Arc<dyn Embedder>,
        normalizer: Arc<Normalizer>,
        merge: MergeConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            normalizer,
            trigger: TriggerScorer::new(),
            merge,
        }
    }

    /// Stores one memory through the dedup-merge funnel.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for empty/oversized text or a bad
    /// agent id, and store errors from the merge transaction. An embed
    /// failure is not an error: the memory is written vectorless.
    pub fn store(&self, request: &StoreRequest) -> Result<StoreReceipt> {
        let text = request.text.trim();
        if text.is_empty() {
            return Err(Error::Validation("memory text cannot be empty".to_string()));
        }
        if text.len() > MAX_TEXT_BYTES {
            return Err(Error::Validation(format!(
                "memory text exceeds maximum size of {MAX_TEXT_BYTES} bytes"
            )));
        }

        let now = crate::current_timestamp();
        let store = self.pool.get(&request.agent)?;
        let normalized = self.normalizer.normalize(text, now);

        let importance = request.importance.map_or_else(
            || {
                self.trigger
                    .score_importance(text, request.category, request.source.as_deref())
            },
            |explicit| explicit.clamp(0.0, 1.0),
        );

        let mut memory = Memory::new(store.agent(), text, normalized.text, request.category, now)
            .with_importance(importance)
            .with_pinned(request.pinned);
        memory.namespace = request.namespace.clone();
        memory.session = request.session.clone();
        memory.source = request.source.clone();
        memory.provenance = request.source.clone();

        if let Some(vector) = self.embedder.embed_opportunistic(text) {
            memory = memory.with_embedding(vector);
        } else {
            tracing::debug!(
                agent = store.agent(),
                "Embedding unavailable at write, storing vectorless for backfill"
            );
        }

        let normalized_text = memory.normalized_text.clone();
        let outcome = store.merge_insert(
            &memory,
            self.merge.threshold,
            self.merge.reinforce_delta,
            now,
            &|neighbor| contradicts(&normalized_text, &neighbor.normalized_text),
        )?;

        let affected = match &outcome {
            MergeOutcome::Reinforced { id } => id.clone(),
            MergeOutcome::Inserted | MergeOutcome::Superseded { .. } => memory.id.clone(),
        };

        metrics::counter!(
            "capture_total",
            "agent" => store.agent().to_string(),
            "category" => request.category.as_str()
        )
        .increment(1);

        Ok(StoreReceipt {
            id: affected,
            agent: store.agent().to_string(),
            outcome,
            embedding_status: memory.embedding_status,
        })
    }

    /// Stores a standing rule: category `rule`, importance 1.0, pinned.
    ///
    /// # Errors
    ///
    /// Propagates the same errors as [`store`](Self::store).
    pub fn store_rule(&self, agent: &str, text: &str) -> Result<StoreReceipt> {
        let mut request = StoreRequest::new(text)
            .with_agent(agent)
            .with_category(Category::Rule)
            .with_importance(1.0);
        request.pinned = true;
        self.store(&request)
    }

    /// Batch capture of session messages.
    ///
    /// Consecutive `(user, assistant)` turns collapse into one `qa_pair`
    /// memory; leftovers store under their role category.
    ///
    /// # Errors
    ///
    /// Propagates per-message store errors; earlier receipts are kept.
    pub fn capture(
        &self,
        agent: &str,
        messages: &[CaptureMessage],
        session: Option<&str>,
        source: Option<&str>,
    ) -> Result<Vec<StoreReceipt>> {
        let mut receipts = Vec::new();
        let mut i = 0;
        while i < messages.len() {
            let message = &messages[i];
            let (text, category, consumed) = if message.role == "user"
                && messages
                    .get(i + 1)
                    .is_some_and(|next| next.role == "assistant")
            {
                (
                    format!("Q: {}\nA: {}", message.text, messages[i + 1].text),
                    Category::QaPair,
                    2,
                )
            } else {
                let category = match message.role.as_str() {
                    "user" => Category::User,
                    "assistant" => Category::Assistant,
                    _ => Category::Conversation,
                };
                (message.text.clone(), category, 1)
            };

            let mut request = StoreRequest::new(text)
                .with_agent(agent)
                .with_category(category);
            request.session = session.map(ToString::to_string);
            request.source = source.map(ToString::to_string);
            receipts.push(self.store(&request)?);
            i += consumed;
        }
        Ok(receipts)
    }

    /// Forgets a memory by id (soft delete).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn forget_by_id(&self, agent: &str, id: &MemoryId) -> Result<()> {
        let store = self.pool.get(agent)?;
        store.soft_delete(id, crate::current_timestamp(), None)
    }
}

/// Heuristic contradiction detector for exclusive-category neighbors.
///
/// Only consulted once the vectors already sit above the merge threshold,
/// so the texts are known to be about the same thing. Near-identical
/// statements are repeats; otherwise a change marker in the newer text
/// flags supersession.
#[must_use]
pub fn contradicts(new_normalized: &str, existing_normalized: &str) -> bool {
    let new_tokens: std::collections::HashSet<&str> =
        new_normalized.split_whitespace().collect();
    let old_tokens: std::collections::HashSet<&str> =
        existing_normalized.split_whitespace().collect();
    if new_tokens.is_empty() || old_tokens.is_empty() {
        return false;
    }

    let intersection = new_tokens.intersection(&old_tokens).count();
    let union = new_tokens.union(&old_tokens).count();
    #[allow(clippy::cast_precision_loss)]
    let overlap = intersection as f32 / union as f32;
    if overlap >= SAME_STATEMENT_OVERLAP {
        return false;
    }

    CHANGE_MARKERS
        .iter()
        .any(|marker| new_normalized.contains(marker))
}
