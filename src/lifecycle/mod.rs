//! Maintenance loops: decay, consolidation, conflict supersession, GC,
//! pinning, the embedding backfill pass, and the amnesia check.
//!
//! Every loop is triggered externally (cron-style call or CLI), iterates
//! one store or the whole pool, logs-and-continues on per-record errors,
//! and aborts a batch only on store-integrity failures.

use crate::config::LifecycleConfig;
use crate::embedding::Embedder;
use crate::models::{ConfidenceTier, Memory, MemoryId, RecallRequest};
use crate::recall::RecallService;
use crate::storage::{MaintenanceScan, MemoryPatch, StoragePool, Store, cosine_similarity};
use crate::write::contradicts;
use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// Seconds per day.
const DAY: u64 = 86_400;

/// Results of a decay tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecayStats {
    /// Records examined.
    pub examined: usize,
    /// Records whose strength changed.
    pub decayed: usize,
    /// Per-record failures skipped.
    pub errors: usize,
}

/// Results of a consolidation pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolidateStats {
    /// Records examined.
    pub examined: usize,
    /// Similarity clusters found (size >= 2).
    pub clusters: usize,
    /// Losers merged into winners.
    pub merged: usize,
    /// Exclusive-slot conflicts superseded.
    pub superseded: usize,
    /// Conflicts left in place as ambiguous.
    pub ambiguous: usize,
}

/// Results of a GC pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    /// Weak, stale, unused records soft-deleted.
    pub soft_deleted: usize,
    /// Records hard-purged past the retention window.
    pub purged: usize,
    /// Per-record failures skipped.
    pub errors: usize,
}

/// Results of an embedding backfill pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct BackfillStats {
    /// Vectorless records examined.
    pub examined: usize,
    /// Vectors written.
    pub embedded: usize,
    /// Records still failing.
    pub failed: usize,
}

/// Coverage of one amnesia-check topic.
#[derive(Debug, Clone)]
pub struct TopicCoverage {
    /// The probed topic.
    pub topic: String,
    /// Whether recall reached at least the MEDIUM tier.
    pub covered: bool,
    /// Best tier observed.
    pub best_tier: Option<ConfidenceTier>,
    /// Best final score observed.
    pub best_score: f32,
}

/// Scheduled decay, consolidation, GC, pinning, and backfill.
pub struct LifecycleService {
    pool: Arc<StoragePool>,
    embedder: Arc<dyn Embedder>,
    config: LifecycleConfig,
}

impl LifecycleService {
    /// Wires the maintenance loops.
    #[must_use]
    pub fn new(
        pool: Arc<StoragePool>,
        embedder: Arc<dyn Embedder>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            pool,
            embedder,
            config,
        }
    }

    /// Ebbinghaus decay tick over an agent scope (`all` fans out).
    ///
    /// `strength <- strength * exp(-dt_days * rate / (1 + alpha * importance))`
    /// with `dt` measured from the later of the last decay application and
    /// the last reinforcement, so reinforcing resets the curve. Pinned
    /// memories are untouched.
    ///
    /// # Errors
    ///
    /// Returns store errors for scan failures and integrity errors;
    /// per-record update failures are counted and skipped.
    #[allow(clippy::cast_precision_loss)]
    pub fn decay(&self, agent: &str, now: u64) -> Result<DecayStats> {
        let start = Instant::now();
        let mut stats = DecayStats::default();

        for store in self.pool.resolve(agent)? {
            let memories =
                store.scan_for_maintenance(&MaintenanceScan::LiveUnpinned { namespace: None })?;
            for memory in memories {
                stats.examined += 1;
                let anchor = memory.last_decayed_at.max(memory.last_reinforced_at);
                let dt_days = now.saturating_sub(anchor) as f32 / DAY as f32;
                if dt_days <= 0.0 {
                    continue;
                }
                let denominator = 1.0 + self.config.decay_alpha * memory.importance;
                let decayed =
                    memory.strength * (-dt_days * self.config.decay_base_rate / denominator).exp();
                match store.apply_decay(&memory.id, decayed, now) {
                    Ok(()) => stats.decayed += 1,
                    Err(e @ Error::StoreIntegrity(_)) => return Err(e),
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(memory_id = %memory.id, error = %e, "Decay update failed");
                    },
                }
            }
        }

        metrics::counter!("lifecycle_runs_total", "operation" => "decay").increment(1);
        metrics::histogram!("lifecycle_duration_ms", "operation" => "decay")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        tracing::info!(
            agent,
            examined = stats.examined,
            decayed = stats.decayed,
            "Decay tick complete"
        );
        Ok(stats)
    }

    /// Consolidation pass: clusters same-namespace memories by cosine
    /// similarity, merges duplicates into the strongest member, and
    /// resolves exclusive-slot conflicts by supersession.
    ///
    /// # Errors
    ///
    /// Returns store errors for scan failures and integrity errors.
    pub fn consolidate(&self, agent: &str, now: u64) -> Result<ConsolidateStats> {
        let start = Instant::now();
        let mut stats = ConsolidateStats::default();

        for store in self.pool.resolve(agent)? {
            self.consolidate_store(&store, now, &mut stats)?;
        }

        metrics::counter!("lifecycle_runs_total", "operation" => "consolidate").increment(1);
        metrics::histogram!("lifecycle_duration_ms", "operation" => "consolidate")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        tracing::info!(
            agent,
            clusters = stats.clusters,
            merged = stats.merged,
            superseded = stats.superseded,
            "Consolidation complete"
        );
        Ok(stats)
    }

    fn consolidate_store(
        &self,
        store: &Store,
        now: u64,
        stats: &mut ConsolidateStats,
    ) -> Result<()> {
        let memories =
            store.scan_for_maintenance(&MaintenanceScan::LiveUnpinned { namespace: None })?;
        stats.examined += memories.len();

        // Cluster within each namespace partition.
        let mut by_namespace: HashMap<Option<String>, Vec<Memory>> = HashMap::new();
        for memory in memories {
            if memory.embedding.is_some() {
                by_namespace
                    .entry(memory.namespace.clone())
                    .or_default()
                    .push(memory);
            }
        }

        for group in by_namespace.into_values() {
            for cluster in cluster_components(&group, self.config.consolidate_threshold) {
                if cluster.len() < 2 {
                    continue;
                }
                stats.clusters += 1;
                let members: Vec<&Memory> = cluster.iter().map(|&i| &group[i]).collect();

                if has_exclusive_conflict(&members) {
                    self.resolve_conflict(store, &members, now, stats)?;
                } else {
                    Self::merge_cluster(store, &members, now, stats)?;
                }
            }
        }
        Ok(())
    }

    /// Merges a cluster into its winner: highest importance, ties broken
    /// by strength, then by age (oldest wins).
    fn merge_cluster(
        store: &Store,
        members: &[&Memory],
        now: u64,
        stats: &mut ConsolidateStats,
    ) -> Result<()> {
        let winner = members
            .iter()
            .copied()
            .max_by(|a, b| {
                a.importance
                    .partial_cmp(&b.importance)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(
                        a.strength
                            .partial_cmp(&b.strength)
                            .unwrap_or(std::cmp::Ordering::Equal),
                    )
                    // Oldest wins a full tie.
                    .then(b.created_at.cmp(&a.created_at))
            })
            .expect("cluster is non-empty");

        for loser in members.iter().filter(|m| m.id != winner.id) {
            let result: Result<()> = (|| {
                store.absorb_merge(
                    &winner.id,
                    loser.strength,
                    loser.importance,
                    loser.reinforce_count,
                )?;
                store.soft_delete(&loser.id, now, Some(&winner.id))?;
                store.rewrite_relations(&loser.id, &winner.id)?;
                Ok(())
            })();
            match result {
                Ok(()) => stats.merged += 1,
                Err(e @ Error::StoreIntegrity(_)) => return Err(e),
                Err(e) => {
                    tracing::warn!(loser = %loser.id, error = %e, "Cluster merge failed");
                },
            }
        }
        Ok(())
    }

    /// Exclusive-slot conflict: the newest assertion supersedes older ones
    /// when its confidence is within the margin; otherwise both remain,
    /// flagged ambiguous.
    fn resolve_conflict(
        &self,
        store: &Store,
        members: &[&Memory],
        now: u64,
        stats: &mut ConsolidateStats,
    ) -> Result<()> {
        let newest = members
            .iter()
            .copied()
            .max_by_key(|m| m.created_at)
            .expect("cluster is non-empty");

        for older in members.iter().filter(|m| m.id != newest.id) {
            if older.pinned {
                continue;
            }
            if newest.importance >= older.importance - self.config.conflict_margin {
                let result: Result<()> = (|| {
                    store.soft_delete(&older.id, now, Some(&newest.id))?;
                    store.rewrite_relations(&older.id, &newest.id)?;
                    Ok(())
                })();
                match result {
                    Ok(()) => stats.superseded += 1,
                    Err(e @ Error::StoreIntegrity(_)) => return Err(e),
                    Err(e) => {
                        tracing::warn!(older = %older.id, error = %e, "Supersede failed");
                    },
                }
            } else {
                stats.ambiguous += 1;
                let note = format!("ambiguous_with={}", newest.id);
                let provenance = older.provenance.as_ref().map_or_else(
                    || note.clone(),
                    |p| format!("{p}; {note}"),
                );
                if let Err(e) = store.update_fields(
                    &older.id,
                    &MemoryPatch {
                        provenance: Some(provenance),
                        ..MemoryPatch::default()
                    },
                ) {
                    tracing::warn!(older = %older.id, error = %e, "Ambiguity flag failed");
                }
            }
        }
        Ok(())
    }

    /// GC pass: soft-deletes weak, stale, unused records and hard-purges
    /// records past the retention window since soft-deletion.
    ///
    /// # Errors
    ///
    /// Returns store errors for scan failures and integrity errors.
    pub fn gc(&self, agent: &str, now: u64) -> Result<GcStats> {
        let start = Instant::now();
        let mut stats = GcStats::default();

        for store in self.pool.resolve(agent)? {
            let weak = store.scan_for_maintenance(&MaintenanceScan::WeakUnused {
                weak_threshold: self.config.weak_threshold,
                created_before: now.saturating_sub(u64::from(self.config.stale_days) * DAY),
                unused_since: now.saturating_sub(u64::from(self.config.unused_days) * DAY),
            })?;
            for memory in weak {
                match store.soft_delete(&memory.id, now, None) {
                    Ok(()) => stats.soft_deleted += 1,
                    Err(e @ Error::StoreIntegrity(_)) => return Err(e),
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(memory_id = %memory.id, error = %e, "GC soft-delete failed");
                    },
                }
            }

            let cutoff = now.saturating_sub(u64::from(self.config.purge_after_days) * DAY);
            let expired =
                store.scan_for_maintenance(&MaintenanceScan::SoftDeletedBefore { cutoff })?;
            for memory in expired {
                match store.hard_delete(&memory.id) {
                    Ok(_) => stats.purged += 1,
                    Err(e @ Error::StoreIntegrity(_)) => return Err(e),
                    Err(e) => {
                        stats.errors += 1;
                        tracing::warn!(memory_id = %memory.id, error = %e, "GC purge failed");
                    },
                }
            }
        }

        metrics::counter!("lifecycle_runs_total", "operation" => "gc").increment(1);
        metrics::histogram!("lifecycle_duration_ms", "operation" => "gc")
            .record(start.elapsed().as_secs_f64() * 1000.0);
        tracing::info!(
            agent,
            soft_deleted = stats.soft_deleted,
            purged = stats.purged,
            "GC complete"
        );
        Ok(stats)
    }

    /// Pins a memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn pin(&self, agent: &str, id: &MemoryId) -> Result<()> {
        self.pool.get(agent)?.pin(id)
    }

    /// Unpins a memory; decay resumes from its current strength.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn unpin(&self, agent: &str, id: &MemoryId) -> Result<()> {
        self.pool.get(agent)?.unpin(id, crate::current_timestamp())
    }

    /// Retries embedding for vectorless memories in small batches.
    ///
    /// # Errors
    ///
    /// Returns store errors for scan failures.
    pub fn backfill_embeddings(&self, agent: &str, limit: usize) -> Result<BackfillStats> {
        let mut stats = BackfillStats::default();

        for store in self.pool.resolve(agent)? {
            let vectorless =
                store.scan_for_maintenance(&MaintenanceScan::Vectorless { limit })?;
            if vectorless.is_empty() {
                continue;
            }
            stats.examined += vectorless.len();

            let texts: Vec<&str> = vectorless.iter().map(|m| m.text.as_str()).collect();
            let vectors = self.embedder.embed_batch(&texts);

            for (memory, vector) in vectorless.iter().zip(vectors) {
                match vector {
                    Some(vector) => match store.set_embedding(&memory.id, &vector) {
                        Ok(()) => stats.embedded += 1,
                        Err(e) => {
                            stats.failed += 1;
                            tracing::warn!(memory_id = %memory.id, error = %e, "Backfill write failed");
                        },
                    },
                    None => {
                        stats.failed += 1;
                        let _ = store.mark_embedding_failed(&memory.id);
                    },
                }
            }
        }

        metrics::counter!("lifecycle_runs_total", "operation" => "backfill").increment(1);
        tracing::info!(
            agent,
            embedded = stats.embedded,
            failed = stats.failed,
            "Embedding backfill complete"
        );
        Ok(stats)
    }

    /// Amnesia check: probes recall coverage for a list of topics.
    ///
    /// A topic counts as covered when any result reaches at least the
    /// MEDIUM tier. Used after maintenance to detect catastrophic loss.
    ///
    /// # Errors
    ///
    /// Returns recall errors for invalid topics.
    pub fn amnesia_check(
        &self,
        agent: &str,
        topics: &[String],
        recall: &RecallService,
    ) -> Result<Vec<TopicCoverage>> {
        let mut report = Vec::with_capacity(topics.len());
        for topic in topics {
            let response = recall.recall(
                &RecallRequest::new(topic.clone())
                    .with_agent(agent)
                    .with_limit(3),
            )?;
            let best = response.results.first();
            report.push(TopicCoverage {
                topic: topic.clone(),
                covered: best.is_some_and(|r| r.confidence_tier >= ConfidenceTier::Medium),
                best_tier: best.map(|r| r.confidence_tier),
                best_score: best.map_or(0.0, |r| r.score),
            });
        }
        Ok(report)
    }
}

/// Whether a cluster contains an exclusive-category contradiction.
fn has_exclusive_conflict(members: &[&Memory]) -> bool {
    for (i, a) in members.iter().enumerate() {
        for b in members.iter().skip(i + 1) {
            if a.category.is_exclusive()
                && b.category.is_exclusive()
                && (contradicts(&a.normalized_text, &b.normalized_text)
                    || contradicts(&b.normalized_text, &a.normalized_text))
            {
                return true;
            }
        }
    }
    false
}

/// Connected components over the cosine-similarity graph, via union-find.
fn cluster_components(memories: &[Memory], threshold: f32) -> Vec<Vec<usize>> {
    let mut uf = UnionFind::new(memories.len());
    for i in 0..memories.len() {
        let Some(a) = memories[i].embedding.as_deref() else {
            continue;
        };
        for j in (i + 1)..memories.len() {
            let Some(b) = memories[j].embedding.as_deref() else {
                continue;
            };
            if cosine_similarity(a, b) >= threshold {
                uf.union(i, j);
            }
        }
    }

    let mut components: HashMap<usize, Vec<usize>> = HashMap::new();
    for i in 0..memories.len() {
        components.entry(uf.find(i)).or_default().push(i);
    }
    components.into_values().collect()
}

/// Union-find with path halving.
struct UnionFind {
    parent: Vec<usize>,
}

impl UnionFind {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) {
        let ra = self.find(a);
        let rb = self.find(b);
        if ra != rb {
            self.parent[rb] = ra;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::{HashedEmbedder, NullEmbedder};
    use crate::models::Category;

    const DIM: usize = 768;

    struct Fixture {
        _dir: tempfile::TempDir,
        pool: Arc<StoragePool>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let pool = Arc::new(StoragePool::new(dir.path(), DIM).expect("pool"));
            Self { _dir: dir, pool }
        }

        fn lifecycle(&self, embedder: Arc<dyn Embedder>) -> LifecycleService {
            LifecycleService::new(Arc::clone(&self.pool), embedder, LifecycleConfig::default())
        }

        fn insert(&self, memory: &Memory) {
            self.pool
                .get(&memory.agent)
                .expect("store")
                .insert(memory)
                .expect("insert");
        }
    }

    fn unit_vector(hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; DIM];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn decay_follows_the_curve() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle(Arc::new(NullEmbedder));
        let created = 1_000_000;
        let memory = Memory::new("main", "decays", "decays", Category::Fact, created)
            .with_importance(0.5);
        fixture.insert(&memory);

        let dt_days = 10_u64;
        let now = created + dt_days * DAY;
        let stats = lifecycle.decay("main", now).expect("decay");
        assert_eq!(stats.decayed, 1);

        let config = LifecycleConfig::default();
        #[allow(clippy::cast_precision_loss)]
        let expected = 1.0
            * (-(dt_days as f32) * config.decay_base_rate / (1.0 + config.decay_alpha * 0.5))
                .exp();
        let row = fixture
            .pool
            .get("main")
            .expect("store")
            .get(&memory.id)
            .expect("get")
            .expect("present");
        assert!((row.strength - expected).abs() < 1e-4);
        assert_eq!(row.last_decayed_at, now);
    }

    #[test]
    fn pinned_memories_do_not_decay() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle(Arc::new(NullEmbedder));
        let memory = Memory::new("main", "pinned", "pinned", Category::Rule, 0).with_pinned(true);
        fixture.insert(&memory);

        lifecycle.decay("main", 1_000 * DAY).expect("decay");
        let row = fixture
            .pool
            .get("main")
            .expect("store")
            .get(&memory.id)
            .expect("get")
            .expect("present");
        assert!((row.strength - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn reinforcement_resets_the_decay_anchor() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle(Arc::new(NullEmbedder));
        let created = 1_000_000;
        let memory = Memory::new("main", "refreshed", "refreshed", Category::Fact, created);
        fixture.insert(&memory);

        let store = fixture.pool.get("main").expect("store");
        // Reinforce 90 days in; decay 10 days later only covers the gap.
        let reinforced_at = created + 90 * DAY;
        store
            .reinforce(&memory.id, 0.0, 0.0, None, reinforced_at)
            .expect("reinforce");

        let now = reinforced_at + 10 * DAY;
        lifecycle.decay("main", now).expect("decay");

        let config = LifecycleConfig::default();
        let row = store.get(&memory.id).expect("get").expect("present");
        let expected =
            (-10.0 * config.decay_base_rate / (1.0 + config.decay_alpha * 0.5)).exp();
        assert!((row.strength - expected).abs() < 1e-4);
    }

    #[test]
    fn consolidation_merges_near_duplicates() {
        let fixture = Fixture::new();
        let embedder = HashedEmbedder::new(DIM);

        let text_a = "the staging database lives on host db-stage-1";
        let text_b = "staging database lives on host db-stage-1 now";
        let mut a = Memory::new("main", text_a, text_a, Category::Conversation, 1_000)
            .with_importance(0.9)
            .with_embedding(embedder.embed(text_a).expect("embed"));
        a.reinforce_count = 2;
        let b = Memory::new("main", text_b, text_b, Category::Conversation, 2_000)
            .with_importance(0.4)
            .with_embedding(embedder.embed(text_b).expect("embed"));
        let unrelated_text = "coffee grinder burr settings";
        let unrelated = Memory::new("main", unrelated_text, unrelated_text, Category::Conversation, 0)
            .with_embedding(embedder.embed(unrelated_text).expect("embed"));
        fixture.insert(&a);
        fixture.insert(&b);
        fixture.insert(&unrelated);

        let lifecycle = LifecycleService::new(
            Arc::clone(&fixture.pool),
            Arc::new(NullEmbedder),
            LifecycleConfig {
                consolidate_threshold: 0.6,
                ..LifecycleConfig::default()
            },
        );
        let _stats = lifecycle.consolidate("main", 3_000).expect("consolidate");

        let store = fixture.pool.get("main").expect("store");
        let winner = store.get(&a.id).expect("get").expect("present");
        let loser = store.get(&b.id).expect("get").expect("present");
        assert!(winner.is_live());
        assert!(loser.soft_deleted_at.is_some());
        assert_eq!(loser.superseded_by.as_ref(), Some(&a.id));
        // Counters folded into the winner.
        assert!(winner.reinforce_count >= 2);
        assert!(winner.importance >= 0.9);
        // The unrelated memory is untouched.
        assert!(store.get(&unrelated.id).expect("get").expect("present").is_live());
    }

    #[test]
    fn consolidation_is_idempotent() {
        let fixture = Fixture::new();
        let embedder = HashedEmbedder::new(DIM);
        let text_a = "release notes draft for version two";
        let text_b = "draft of the release notes for version two";
        let a = Memory::new("main", text_a, text_a, Category::Conversation, 1_000)
            .with_embedding(embedder.embed(text_a).expect("embed"));
        let b = Memory::new("main", text_b, text_b, Category::Conversation, 2_000)
            .with_embedding(embedder.embed(text_b).expect("embed"));
        fixture.insert(&a);
        fixture.insert(&b);

        let lifecycle = LifecycleService::new(
            Arc::clone(&fixture.pool),
            Arc::new(NullEmbedder),
            LifecycleConfig {
                consolidate_threshold: 0.5,
                ..LifecycleConfig::default()
            },
        );

        let first = lifecycle.consolidate("main", 3_000).expect("first");
        assert_eq!(first.merged + first.superseded, 1);
        let second = lifecycle.consolidate("main", 4_000).expect("second");
        assert_eq!(second.merged, 0);
        assert_eq!(second.superseded, 0);
        assert_eq!(second.clusters, 0);
    }

    #[test]
    fn exclusive_conflict_newest_supersedes() {
        let fixture = Fixture::new();
        let embedder = HashedEmbedder::new(DIM);

        let old_text = "user lives istanbul works remotely from home office";
        let new_text = "user moved ankara works remotely from home office";
        let old = Memory::new("main", "User lives in Istanbul", old_text, Category::Fact, 1_000)
            .with_embedding(embedder.embed(old_text).expect("embed"));
        let new = Memory::new(
            "main",
            "User moved to Ankara last week",
            new_text,
            Category::Fact,
            2_000,
        )
        .with_embedding(embedder.embed(new_text).expect("embed"));
        fixture.insert(&old);
        fixture.insert(&new);

        let lifecycle = LifecycleService::new(
            Arc::clone(&fixture.pool),
            Arc::new(NullEmbedder),
            LifecycleConfig {
                consolidate_threshold: 0.5,
                ..LifecycleConfig::default()
            },
        );
        let stats = lifecycle.consolidate("main", 3_000).expect("consolidate");
        assert_eq!(stats.superseded, 1);

        let store = fixture.pool.get("main").expect("store");
        let old_row = store.get(&old.id).expect("get").expect("present");
        assert!(old_row.soft_deleted_at.is_some());
        assert_eq!(old_row.superseded_by.as_ref(), Some(&new.id));
        assert!(store.get(&new.id).expect("get").expect("present").is_live());
    }

    #[test]
    fn gc_soft_deletes_weak_and_purges_expired() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle(Arc::new(NullEmbedder));
        let now = 1_000 * DAY;
        let store = fixture.pool.get("main").expect("store");

        // Weak, stale, unused: soft-delete candidate.
        let mut weak = Memory::new("main", "weak", "weak", Category::Conversation, now - 100 * DAY);
        weak.strength = 0.05;
        weak.last_accessed_at = now - 100 * DAY;
        store.insert(&weak).expect("insert weak");

        // Strong recent record: untouched.
        let strong = Memory::new("main", "strong", "strong", Category::Fact, now - DAY);
        store.insert(&strong).expect("insert strong");

        // Soft-deleted 40 days ago: purge candidate.
        let purgeable =
            Memory::new("main", "purge me", "purge me", Category::Conversation, now - 200 * DAY);
        store.insert(&purgeable).expect("insert purgeable");
        store
            .soft_delete(&purgeable.id, now - 40 * DAY, None)
            .expect("soft delete");

        let stats = lifecycle.gc("main", now).expect("gc");
        assert_eq!(stats.soft_deleted, 1);
        assert_eq!(stats.purged, 1);

        assert!(store.get(&purgeable.id).expect("get").is_none());
        let weak_row = store.get(&weak.id).expect("get").expect("present");
        assert!(weak_row.soft_deleted_at.is_some());
        assert!(store.get(&strong.id).expect("get").expect("present").is_live());
    }

    #[test]
    fn gc_never_touches_pinned() {
        let fixture = Fixture::new();
        let lifecycle = fixture.lifecycle(Arc::new(NullEmbedder));
        let now = 1_000 * DAY;
        let store = fixture.pool.get("main").expect("store");

        let mut pinned = Memory::new("main", "pinned", "pinned", Category::Rule, now - 500 * DAY)
            .with_pinned(true);
        pinned.strength = 0.01;
        pinned.last_accessed_at = now - 500 * DAY;
        store.insert(&pinned).expect("insert");

        let stats = lifecycle.gc("main", now).expect("gc");
        assert_eq!(stats.soft_deleted, 0);
        assert!(store.get(&pinned.id).expect("get").expect("present").is_live());
    }

    #[test]
    fn backfill_embeds_vectorless_memories() {
        let fixture = Fixture::new();
        let store = fixture.pool.get("main").expect("store");
        let vectorless = Memory::new("main", "needs a vector", "needs a vector", Category::Fact, 0);
        store.insert(&vectorless).expect("insert");

        let lifecycle = fixture.lifecycle(Arc::new(HashedEmbedder::new(DIM)));
        let stats = lifecycle.backfill_embeddings("main", 10).expect("backfill");
        assert_eq!(stats.embedded, 1);
        assert_eq!(store.vectorless_count().expect("count"), 0);
    }

    #[test]
    fn backfill_marks_failures() {
        let fixture = Fixture::new();
        let store = fixture.pool.get("main").expect("store");
        let vectorless = Memory::new("main", "never embeds", "never embeds", Category::Fact, 0);
        store.insert(&vectorless).expect("insert");

        let lifecycle = fixture.lifecycle(Arc::new(NullEmbedder));
        let stats = lifecycle.backfill_embeddings("main", 10).expect("backfill");
        assert_eq!(stats.failed, 1);
        let row = store.get(&vectorless.id).expect("get").expect("present");
        assert_eq!(
            row.embedding_status,
            crate::models::EmbeddingStatus::Failed
        );
    }

    #[test]
    fn union_find_components() {
        let embedder = HashedEmbedder::new(DIM);
        let texts = [
            "alpha beta gamma delta",
            "alpha beta gamma delta epsilon",
            "totally different subject matter",
        ];
        let memories: Vec<Memory> = texts
            .iter()
            .map(|t| {
                Memory::new("main", *t, *t, Category::Fact, 0)
                    .with_embedding(embedder.embed(t).expect("embed"))
            })
            .collect();

        let clusters = cluster_components(&memories, 0.6);
        let sizes: Vec<usize> = {
            let mut s: Vec<usize> = clusters.iter().map(Vec::len).collect();
            s.sort_unstable();
            s
        };
        assert_eq!(sizes, vec![1, 2]);
    }
}
