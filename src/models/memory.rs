//! Memory records and identifiers.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Unique identifier for a memory.
///
/// Ids are content-derived: the same normalized text stored for the same
/// agent always produces the same id, which is what makes import idempotent
/// and write-dedup cheap to probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryId(String);

impl MemoryId {
    /// Length of the hex digest kept as the id.
    const DIGEST_LEN: usize = 32;

    /// Creates an id from an existing string (import path).
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derives the id for a memory from its agent scope and normalized text.
    #[must_use]
    pub fn derive(agent: &str, normalized_text: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(agent.as_bytes());
        hasher.update(b"\x00");
        hasher.update(normalized_text.as_bytes());
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(Self::DIGEST_LEN);
        for byte in digest.iter().take(Self::DIGEST_LEN / 2) {
            use std::fmt::Write;
            let _ = write!(hex, "{byte:02x}");
        }
        Self(hex)
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MemoryId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MemoryId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Category of a stored memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// A question/answer pair captured from a session.
    QaPair,
    /// A raw user message.
    User,
    /// A raw assistant message.
    Assistant,
    /// A standalone factual assertion.
    Fact,
    /// A user preference.
    Preference,
    /// An explicit standing rule; pinned and maximally important at capture.
    Rule,
    /// A conversation chunk.
    Conversation,
}

impl Category {
    /// All categories, in declaration order.
    pub const ALL: [Self; 7] = [
        Self::QaPair,
        Self::User,
        Self::Assistant,
        Self::Fact,
        Self::Preference,
        Self::Rule,
        Self::Conversation,
    ];

    /// Returns the category as its stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::QaPair => "qa_pair",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Fact => "fact",
            Self::Preference => "preference",
            Self::Rule => "rule",
            Self::Conversation => "conversation",
        }
    }

    /// Parses a stored string form; unknown values map to `Conversation`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "qa_pair" => Self::QaPair,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "fact" => Self::Fact,
            "preference" => Self::Preference,
            "rule" => Self::Rule,
            _ => Self::Conversation,
        }
    }

    /// Whether this category occupies an exclusive slot (a current
    /// `status`, `lives_in`-style assertion). Contradictions between such
    /// memories are resolved by the consolidation pass, which supersedes
    /// the older assertion.
    #[must_use]
    pub const fn is_exclusive(self) -> bool {
        matches!(self, Self::Rule | Self::Preference | Self::Fact)
    }

    /// Whether a contradicting new write supersedes an existing memory of
    /// this category at merge time. Narrower than
    /// [`is_exclusive`](Self::is_exclusive): fact conflicts wait for
    /// consolidation instead of being resolved on the write path.
    #[must_use]
    pub const fn supersedes_on_write(self) -> bool {
        matches!(self, Self::Rule | Self::Preference)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether the dense vector for a memory exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingStatus {
    /// The vector row exists.
    Present,
    /// Embedding deferred; the backfill pass will retry.
    Pending,
    /// Embedding failed; the backfill pass will retry.
    Failed,
}

impl EmbeddingStatus {
    /// Returns the status as its stored string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Present => "present",
            Self::Pending => "pending",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored string form; unknown values map to `Pending`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "present" => Self::Present,
            "failed" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A durable memory record.
///
/// Invariants maintained by the store and lifecycle services:
/// `0 <= strength <= 1`, `0 <= importance <= 1`,
/// `created_at <= last_reinforced_at`, `created_at <= last_accessed_at`,
/// and a pinned memory is never soft-deleted, purged, or merged away.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Content-derived identifier, unique per `(agent, id)`.
    pub id: MemoryId,
    /// Agent scope tag.
    pub agent: String,
    /// Raw stored content.
    pub text: String,
    /// Normalizer output used for lexical indexing and write-dedup.
    pub normalized_text: String,
    /// Stored category.
    pub category: Category,
    /// Auto-classified type; equals `category` for single-message stores.
    pub memory_type: Category,
    /// Importance in [0, 1], assigned at write, adjusted by reinforcement.
    pub importance: f32,
    /// Retention strength in [0, 1]; starts at 1.0 and decays.
    pub strength: f32,
    /// Creation timestamp (Unix seconds).
    pub created_at: u64,
    /// Last reinforcement timestamp (Unix seconds).
    pub last_reinforced_at: u64,
    /// Last recall-surfaced timestamp (Unix seconds).
    pub last_accessed_at: u64,
    /// Anchor for the decay curve; reset by reinforcement.
    #[serde(default)]
    pub last_decayed_at: u64,
    /// Number of recalls that surfaced this memory.
    pub access_count: u32,
    /// Number of write-merge reinforcements.
    pub reinforce_count: u32,
    /// Pinned memories are exempt from decay, consolidation, and GC.
    pub pinned: bool,
    /// Non-null means logically deleted; excluded from all retrieval.
    pub soft_deleted_at: Option<u64>,
    /// Id of the newer assertion that superseded this one, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<MemoryId>,
    /// Originating session tag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    /// Source tag (e.g. `api`, `cron`, `import`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Free-text provenance trail for trust/debug.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<String>,
    /// Optional partition within the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Dense vector; `None` until embedding succeeds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Embedding lifecycle state.
    pub embedding_status: EmbeddingStatus,
}

impl Memory {
    /// Creates a new memory with freshly-initialized lifecycle fields.
    ///
    /// The id is derived from the agent and normalized text so identical
    /// content maps to the same record.
    #[must_use]
    pub fn new(
        agent: impl Into<String>,
        text: impl Into<String>,
        normalized_text: impl Into<String>,
        category: Category,
        now: u64,
    ) -> Self {
        let agent = agent.into();
        let normalized_text = normalized_text.into();
        let id = MemoryId::derive(&agent, &normalized_text);
        Self {
            id,
            agent,
            text: text.into(),
            normalized_text,
            category,
            memory_type: category,
            importance: 0.5,
            strength: 1.0,
            created_at: now,
            last_reinforced_at: now,
            last_accessed_at: now,
            last_decayed_at: now,
            access_count: 0,
            reinforce_count: 0,
            pinned: false,
            soft_deleted_at: None,
            superseded_by: None,
            session: None,
            source: None,
            provenance: None,
            namespace: None,
            embedding: None,
            embedding_status: EmbeddingStatus::Pending,
        }
    }

    /// Sets the importance, clamped to [0, 1].
    #[must_use]
    pub fn with_importance(mut self, importance: f32) -> Self {
        self.importance = importance.clamp(0.0, 1.0);
        self
    }

    /// Sets the namespace partition.
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

    /// Sets the session tag.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Marks the memory pinned.
    #[must_use]
    pub const fn with_pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    /// Sets the embedding and marks it present.
    #[must_use]
    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.embedding = Some(embedding);
        self.embedding_status = EmbeddingStatus::Present;
        self
    }

    /// Age of the memory in days at `now`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn age_days(&self, now: u64) -> f32 {
        now.saturating_sub(self.created_at) as f32 / 86_400.0
    }

    /// Whether the memory is visible to retrieval.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.soft_deleted_at.is_none()
    }
}
