//! Per-agent embedded store.
//!
//! One SQLite file per agent carrying three co-resident indices: the
//! relational `memory` table, the `vec_memory` blob column searched by
//! brute-force cosine, and the `fts_memory` FTS5 virtual table with a
//! trigram tokenizer (language-agnostic across Turkish/English).
//!
//! Concurrency contract: single writer, multiple readers. All access
//! serializes through one connection mutex; WAL mode keeps concurrent
//! readers cheap at the SQLite level.

use super::schema;
use crate::models::{Category, EmbeddingStatus, Memory, MemoryFilter, MemoryId};
use crate::{Error, Result};
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

/// Outcome of a transactional merge-insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No sufficiently-similar neighbor; a new row was inserted.
    Inserted,
    /// An existing memory absorbed the write as reinforcement.
    Reinforced {
        /// The reinforced memory.
        id: MemoryId,
    },
    /// The new assertion contradicted an exclusive-category neighbor; the
    /// neighbor was soft-deleted with `superseded_by` pointing at the new row.
    Superseded {
        /// The newly-inserted memory.
        winner: MemoryId,
        /// The soft-deleted older memory.
        loser: MemoryId,
    },
}

/// Partial update applied by [`Store::update_fields`].
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    /// Replace the raw text (refreshes the lexical row when paired with
    /// `normalized_text`).
    pub text: Option<String>,
    /// Replace the normalized text.
    pub normalized_text: Option<String>,
    /// Replace the category.
    pub category: Option<Category>,
    /// Replace the importance.
    pub importance: Option<f32>,
    /// Replace the strength.
    pub strength: Option<f32>,
    /// Replace the namespace.
    pub namespace: Option<String>,
    /// Replace the provenance trail.
    pub provenance: Option<String>,
}

/// Maintenance scan predicates consumed by the lifecycle service.
#[derive(Debug, Clone)]
pub enum MaintenanceScan {
    /// Live, unpinned records (decay and consolidation input). Embeddings
    /// are loaded.
    LiveUnpinned {
        /// Restrict to a namespace partition.
        namespace: Option<String>,
    },
    /// Live, unpinned, weak and unused records (GC soft-delete candidates).
    WeakUnused {
        /// Strength strictly below this value.
        weak_threshold: f32,
        /// Created at or before this timestamp.
        created_before: u64,
        /// No access since this timestamp.
        unused_since: u64,
    },
    /// Soft-deleted at or before the cutoff (hard-purge candidates).
    SoftDeletedBefore {
        /// Purge cutoff timestamp.
        cutoff: u64,
    },
    /// Records without a vector row (embedding backfill input).
    Vectorless {
        /// Maximum records returned, oldest first.
        limit: usize,
    },
}

/// Statistics returned by [`Store::import`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportStats {
    /// Records written.
    pub imported: usize,
    /// Records skipped because the id already existed.
    pub skipped: usize,
}

/// Physical row counts across the three co-resident indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowCounts {
    /// Rows in the relational table.
    pub memory: usize,
    /// Rows in the vector index.
    pub vec: usize,
    /// Rows in the lexical index.
    pub fts: usize,
}

const MEMORY_COLUMNS: &str = "m.id, m.agent, m.text, m.normalized_text, m.category, \
     m.memory_type, m.importance, m.strength, m.created_at, m.last_reinforced_at, \
     m.last_accessed_at, m.last_decayed_at, m.access_count, m.reinforce_count, m.pinned, \
     m.soft_deleted_at, m.superseded_by, m.session, m.source, m.provenance, m.namespace, \
     m.embedding_status, v.embedding";

/// Per-agent store handle.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
    agent: String,
    dimensions: usize,
    path: Option<PathBuf>,
}

impl Store {
    /// Opens (or creates) the store file for an agent and applies pending
    /// migrations.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] when the file cannot be opened and
    /// [`Error::StoreIntegrity`] when its schema is newer than supported.
    pub fn open(path: impl Into<PathBuf>, agent: impl Into<String>, dimensions: usize) -> Result<Self> {
        let path = path.into();
        let mut conn = Connection::open(&path).map_err(|e| Error::StoreIo {
            operation: "open_store".to_string(),
            cause: e.to_string(),
        })?;
        configure_connection(&conn);
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            agent: agent.into(),
            dimensions,
            path: Some(path),
        })
    }

    /// Creates an in-memory store (tests and ephemeral agents).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] if SQLite cannot create the database.
    pub fn in_memory(agent: impl Into<String>, dimensions: usize) -> Result<Self> {
        let mut conn = Connection::open_in_memory().map_err(|e| Error::StoreIo {
            operation: "open_store_memory".to_string(),
            cause: e.to_string(),
        })?;
        configure_connection(&conn);
        schema::migrate(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            agent: agent.into(),
            dimensions,
            path: None,
        })
    }

    /// Returns the agent this store belongs to.
    #[must_use]
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Returns the configured embedding dimension.
    #[must_use]
    pub const fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Returns the backing file path (`None` for in-memory stores).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Acquires the connection with poison recovery.
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(agent = %self.agent, "Store mutex was poisoned, recovering");
            metrics::counter!("store_mutex_poison_recovery_total").increment(1);
            poisoned.into_inner()
        })
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Inserts a memory into all three indices atomically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreConflict`] if the id already exists (every
    /// index rolls back) and [`Error::EmbedDimMismatch`] if the embedding
    /// has the wrong dimension.
    pub fn insert(&self, memory: &Memory) -> Result<()> {
        self.check_dimensions(memory.embedding.as_deref())?;
        let mut guard = self.lock();
        let tx = begin(&mut guard)?;
        insert_tx(&tx, memory)?;
        commit(tx)?;
        metrics::counter!("store_inserts_total", "agent" => self.agent.clone()).increment(1);
        Ok(())
    }

    /// Transactional upsert-by-similarity: the write-path dedup primitive.
    ///
    /// Looks up the nearest live vector neighbor within the same namespace;
    /// at or above `threshold` the write reinforces the neighbor instead of
    /// inserting. Exception: when `conflicts(neighbor)` reports a
    /// contradiction on a rule/preference neighbor, the new row is inserted
    /// and the unpinned neighbor is superseded. Contradicted fact neighbors
    /// are left to the consolidation pass, and a neighbor pinned to a
    /// conflicting value is never merged into: both assertions remain. The
    /// entire decision and its application happen in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failures, [`Error::EmbedDimMismatch`]
    /// on a wrong-size embedding.
    pub fn merge_insert(
        &self,
        memory: &Memory,
        threshold: f32,
        reinforce_delta: f32,
        now: u64,
        conflicts: &dyn Fn(&Memory) -> bool,
    ) -> Result<MergeOutcome> {
        self.check_dimensions(memory.embedding.as_deref())?;
        let mut guard = self.lock();
        let tx = begin(&mut guard)?;

        // Identical normalized content derives the identical id. A
        // soft-deleted row under that id revives: the user just re-told us.
        let existing: Option<Option<u64>> = tx
            .query_row(
                "SELECT soft_deleted_at FROM memory WHERE id = ?1",
                params![memory.id.as_str()],
                |row| row.get(0),
            )
            .optional()
            .map_err(store_io("merge_probe_id"))?;
        if let Some(soft_deleted_at) = existing {
            if soft_deleted_at.is_some() {
                tx.execute(
                    "UPDATE memory SET soft_deleted_at = NULL, superseded_by = NULL
                     WHERE id = ?1",
                    params![memory.id.as_str()],
                )
                .map_err(store_io("merge_revive"))?;
            }
            reinforce_tx(
                &tx,
                &memory.id,
                reinforce_delta,
                memory.importance,
                memory.provenance.as_deref(),
                now,
            )?;
            commit(tx)?;
            return Ok(MergeOutcome::Reinforced {
                id: memory.id.clone(),
            });
        }

        let neighbor = memory
            .embedding
            .as_deref()
            .map(|emb| nearest_neighbor_tx(&tx, emb, memory.namespace.as_deref()))
            .transpose()?
            .flatten();

        let outcome = match neighbor {
            Some((neighbor, similarity)) if similarity >= threshold => {
                let contradicted = neighbor.category.is_exclusive() && conflicts(&neighbor);
                if contradicted && neighbor.category.supersedes_on_write() && !neighbor.pinned {
                    insert_tx(&tx, memory)?;
                    soft_delete_tx(&tx, &neighbor.id, now, Some(&memory.id))?;
                    MergeOutcome::Superseded {
                        winner: memory.id.clone(),
                        loser: neighbor.id,
                    }
                } else if contradicted && neighbor.pinned {
                    // A match pinned to a conflicting value is never merged
                    // into or superseded; both assertions remain.
                    insert_tx(&tx, memory)?;
                    MergeOutcome::Inserted
                } else {
                    reinforce_tx(
                        &tx,
                        &neighbor.id,
                        reinforce_delta,
                        memory.importance,
                        memory.provenance.as_deref(),
                        now,
                    )?;
                    MergeOutcome::Reinforced { id: neighbor.id }
                }
            },
            _ => {
                insert_tx(&tx, memory)?;
                MergeOutcome::Inserted
            },
        };

        commit(tx)?;
        let outcome_label = match &outcome {
            MergeOutcome::Inserted => "inserted",
            MergeOutcome::Reinforced { .. } => "reinforced",
            MergeOutcome::Superseded { .. } => "superseded",
        };
        metrics::counter!(
            "store_merge_inserts_total",
            "agent" => self.agent.clone(),
            "outcome" => outcome_label
        )
        .increment(1);
        Ok(outcome)
    }

    /// Applies a partial update. Refreshes the lexical row when the
    /// normalized text changes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn update_fields(&self, id: &MemoryId, patch: &MemoryPatch) -> Result<()> {
        let mut sets: Vec<String> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();
        let mut push = |column: &str, value: rusqlite::types::Value, sets: &mut Vec<String>| {
            values.push(value);
            sets.push(format!("{column} = ?{}", values.len()));
        };

        if let Some(v) = &patch.text {
            push("text", v.clone().into(), &mut sets);
        }
        if let Some(v) = &patch.normalized_text {
            push("normalized_text", v.clone().into(), &mut sets);
        }
        if let Some(v) = patch.category {
            push("category", v.as_str().to_string().into(), &mut sets);
        }
        if let Some(v) = patch.importance {
            push("importance", f64::from(v.clamp(0.0, 1.0)).into(), &mut sets);
        }
        if let Some(v) = patch.strength {
            push("strength", f64::from(v.clamp(0.0, 1.0)).into(), &mut sets);
        }
        if let Some(v) = &patch.namespace {
            push("namespace", v.clone().into(), &mut sets);
        }
        if let Some(v) = &patch.provenance {
            push("provenance", v.clone().into(), &mut sets);
        }

        if sets.is_empty() {
            return Ok(());
        }

        values.push(id.as_str().to_string().into());
        let sql = format!(
            "UPDATE memory SET {} WHERE id = ?{}",
            sets.join(", "),
            values.len()
        );

        let mut guard = self.lock();
        let tx = begin(&mut guard)?;
        let updated = tx
            .execute(&sql, rusqlite::params_from_iter(values))
            .map_err(store_io("update_fields"))?;
        if updated == 0 {
            return Err(Error::NotFound(format!("memory {id}")));
        }
        if let Some(normalized) = &patch.normalized_text {
            tx.execute(
                "DELETE FROM fts_memory WHERE id = ?1",
                params![id.as_str()],
            )
            .map_err(store_io("update_fts_delete"))?;
            tx.execute(
                "INSERT INTO fts_memory (id, normalized_text) VALUES (?1, ?2)",
                params![id.as_str(), normalized],
            )
            .map_err(store_io("update_fts_insert"))?;
        }
        commit(tx)?;
        Ok(())
    }

    /// Stores a vector for an existing memory and flips its status to
    /// `present`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmbedDimMismatch`] for a wrong-size vector and
    /// [`Error::NotFound`] for an unknown id.
    pub fn set_embedding(&self, id: &MemoryId, embedding: &[f32]) -> Result<()> {
        self.check_dimensions(Some(embedding))?;
        let mut guard = self.lock();
        let tx = begin(&mut guard)?;
        let updated = tx
            .execute(
                "UPDATE memory SET embedding_status = 'present' WHERE id = ?1",
                params![id.as_str()],
            )
            .map_err(store_io("set_embedding_status"))?;
        if updated == 0 {
            return Err(Error::NotFound(format!("memory {id}")));
        }
        tx.execute(
            "INSERT INTO vec_memory (id, embedding) VALUES (?1, ?2)
             ON CONFLICT (id) DO UPDATE SET embedding = excluded.embedding",
            params![id.as_str(), vec_to_blob(embedding)],
        )
        .map_err(store_io("set_embedding"))?;
        commit(tx)?;
        Ok(())
    }

    /// Marks embedding as failed for an existing memory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn mark_embedding_failed(&self, id: &MemoryId) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE memory SET embedding_status = 'failed' WHERE id = ?1",
                params![id.as_str()],
            )
            .map_err(store_io("mark_embedding_failed"))?;
        Ok(())
    }

    /// Logically deletes a memory; it disappears from retrieval but stays
    /// eligible for hard purge after the retention window.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn soft_delete(
        &self,
        id: &MemoryId,
        now: u64,
        superseded_by: Option<&MemoryId>,
    ) -> Result<()> {
        let mut guard = self.lock();
        let tx = begin(&mut guard)?;
        soft_delete_tx(&tx, id, now, superseded_by)?;
        commit(tx)?;
        Ok(())
    }

    /// Physically removes a memory from every index and drops KG relations
    /// that reference it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn hard_delete(&self, id: &MemoryId) -> Result<bool> {
        let mut guard = self.lock();
        let tx = begin(&mut guard)?;
        let deleted = hard_delete_tx(&tx, id)?;
        commit(tx)?;
        Ok(deleted)
    }

    /// Pins a memory, exempting it from decay, consolidation, and GC.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn pin(&self, id: &MemoryId) -> Result<()> {
        let updated = self
            .lock()
            .execute(
                "UPDATE memory SET pinned = 1 WHERE id = ?1",
                params![id.as_str()],
            )
            .map_err(store_io("pin"))?;
        if updated == 0 {
            return Err(Error::NotFound(format!("memory {id}")));
        }
        Ok(())
    }

    /// Unpins a memory; decay resumes from the current strength.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] for an unknown id.
    pub fn unpin(&self, id: &MemoryId, now: u64) -> Result<()> {
        let updated = self
            .lock()
            .execute(
                "UPDATE memory SET pinned = 0, last_reinforced_at = ?2, last_decayed_at = ?2
                 WHERE id = ?1",
                params![id.as_str(), now],
            )
            .map_err(store_io("unpin"))?;
        if updated == 0 {
            return Err(Error::NotFound(format!("memory {id}")));
        }
        Ok(())
    }

    /// Bumps access counters for memories surfaced by a recall.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn record_access(&self, ids: &[MemoryId], now: u64) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut guard = self.lock();
        let tx = begin(&mut guard)?;
        for id in ids {
            tx.execute(
                "UPDATE memory SET access_count = access_count + 1, last_accessed_at = ?2
                 WHERE id = ?1",
                params![id.as_str(), now],
            )
            .map_err(store_io("record_access"))?;
        }
        commit(tx)?;
        Ok(())
    }

    /// Reinforces a memory outside the merge path (recall hits that also
    /// semantically match a new write).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn reinforce(
        &self,
        id: &MemoryId,
        delta: f32,
        importance: f32,
        provenance: Option<&str>,
        now: u64,
    ) -> Result<()> {
        let mut guard = self.lock();
        let tx = begin(&mut guard)?;
        reinforce_tx(&tx, id, delta, importance, provenance, now)?;
        commit(tx)?;
        Ok(())
    }

    /// Folds a consolidation loser's counters into the winner: maxes of
    /// strength and importance, summed reinforce counts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn absorb_merge(
        &self,
        winner: &MemoryId,
        loser_strength: f32,
        loser_importance: f32,
        loser_reinforce_count: u32,
    ) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE memory SET
                    strength = MAX(strength, ?2),
                    importance = MAX(importance, ?3),
                    reinforce_count = reinforce_count + ?4
                 WHERE id = ?1",
                params![
                    winner.as_str(),
                    f64::from(loser_strength.clamp(0.0, 1.0)),
                    f64::from(loser_importance.clamp(0.0, 1.0)),
                    loser_reinforce_count
                ],
            )
            .map_err(store_io("absorb_merge"))?;
        Ok(())
    }

    /// Sets a decayed strength and advances the decay anchor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn apply_decay(&self, id: &MemoryId, strength: f32, now: u64) -> Result<()> {
        self.lock()
            .execute(
                "UPDATE memory SET strength = ?2, last_decayed_at = ?3 WHERE id = ?1",
                params![id.as_str(), f64::from(strength.clamp(0.0, 1.0)), now],
            )
            .map_err(store_io("apply_decay"))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Fetches a memory (with its embedding when present).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn get(&self, id: &MemoryId) -> Result<Option<Memory>> {
        let guard = self.lock();
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memory m
             LEFT JOIN vec_memory v ON v.id = m.id
             WHERE m.id = ?1"
        );
        guard
            .query_row(&sql, params![id.as_str()], memory_from_row)
            .optional()
            .map_err(store_io("get"))
    }

    /// Batch fetch preserving input order; unknown ids yield `None`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn get_batch(&self, ids: &[MemoryId]) -> Result<Vec<Option<Memory>>> {
        ids.iter().map(|id| self.get(id)).collect()
    }

    /// Cosine top-K over the vector index, ascending by distance.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EmbedDimMismatch`] for a wrong-size query vector
    /// and [`Error::StoreIo`] on SQL failure.
    pub fn vector_topk(
        &self,
        query: &[f32],
        k: usize,
        filter: &MemoryFilter,
    ) -> Result<Vec<(MemoryId, f32)>> {
        self.check_dimensions(Some(query))?;
        let guard = self.lock();
        let (clause, filter_params, _) = filter_clause(filter, 1);
        let sql = format!(
            "SELECT m.id, v.embedding FROM vec_memory v
             JOIN memory m ON m.id = v.id
             WHERE 1=1 {clause}"
        );
        let mut stmt = guard.prepare(&sql).map_err(store_io("prepare_vector_topk"))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(filter_params), |row| {
                let id: String = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Ok((id, blob))
            })
            .map_err(store_io("vector_topk"))?;

        let mut scored: Vec<(MemoryId, f32)> = Vec::new();
        for row in rows {
            let (id, blob) = row.map_err(store_io("vector_topk_row"))?;
            let embedding = blob_to_vec(&blob);
            if embedding.len() != self.dimensions {
                // A row written under a different dimension config; skip it
                // rather than poisoning the whole query.
                tracing::warn!(memory_id = %id, "Skipping vector row with stale dimension");
                continue;
            }
            let distance = 1.0 - cosine_similarity(query, &embedding);
            scored.push((MemoryId::new(id), distance));
        }

        scored.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    /// BM25 top-K over the lexical index, descending by rank score.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn lexical_topk(
        &self,
        normalized_query: &str,
        k: usize,
        filter: &MemoryFilter,
    ) -> Result<Vec<(MemoryId, f32)>> {
        if normalized_query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let guard = self.lock();
        let (clause, filter_params, next) = filter_clause(filter, 2);
        let sql = format!(
            "SELECT f.id, bm25(fts_memory) AS rank FROM fts_memory f
             JOIN memory m ON m.id = f.id
             WHERE fts_memory MATCH ?1 {clause}
             ORDER BY rank
             LIMIT ?{next}"
        );
        let mut stmt = guard.prepare(&sql).map_err(store_io("prepare_lexical_topk"))?;

        // Quote terms for literal matching; OR them so partial matches rank.
        let fts_query = normalized_query
            .split_whitespace()
            .map(|term| format!("\"{}\"", term.replace('"', "\"\"")))
            .collect::<Vec<_>>()
            .join(" OR ");

        let rows = stmt
            .query_map(
                rusqlite::params_from_iter(
                    std::iter::once(fts_query)
                        .chain(filter_params)
                        .chain(std::iter::once(k.to_string())),
                ),
                |row| {
                    let id: String = row.get(0)?;
                    let rank: f64 = row.get(1)?;
                    Ok((id, rank))
                },
            )
            .map_err(store_io("lexical_topk"))?;

        let mut results = Vec::new();
        for row in rows {
            let (id, rank) = row.map_err(store_io("lexical_topk_row"))?;
            // FTS5 bm25() is negative, lower is better; flip to a positive
            // goodness score.
            #[allow(clippy::cast_possible_truncation)]
            results.push((MemoryId::new(id), (-rank).max(0.0) as f32));
        }
        Ok(results)
    }

    /// Nearest live vector neighbor within a namespace (write-merge probe).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn nearest_neighbor(
        &self,
        embedding: &[f32],
        namespace: Option<&str>,
    ) -> Result<Option<(Memory, f32)>> {
        let mut guard = self.lock();
        let tx = begin(&mut guard)?;
        let result = nearest_neighbor_tx(&tx, embedding, namespace)?;
        commit(tx)?;
        Ok(result)
    }

    /// Runs a maintenance scan.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn scan_for_maintenance(&self, scan: &MaintenanceScan) -> Result<Vec<Memory>> {
        let guard = self.lock();
        let (sql, scan_params): (String, Vec<rusqlite::types::Value>) = match scan {
            MaintenanceScan::LiveUnpinned { namespace } => {
                let base = format!(
                    "SELECT {MEMORY_COLUMNS} FROM memory m
                     LEFT JOIN vec_memory v ON v.id = m.id
                     WHERE m.soft_deleted_at IS NULL AND m.pinned = 0"
                );
                namespace.as_ref().map_or_else(
                    || (base.clone(), Vec::new()),
                    |ns| {
                        (
                            format!("{base} AND m.namespace = ?1"),
                            vec![ns.clone().into()],
                        )
                    },
                )
            },
            MaintenanceScan::WeakUnused {
                weak_threshold,
                created_before,
                unused_since,
            } => (
                format!(
                    "SELECT {MEMORY_COLUMNS} FROM memory m
                     LEFT JOIN vec_memory v ON v.id = m.id
                     WHERE m.soft_deleted_at IS NULL AND m.pinned = 0
                       AND m.strength < ?1 AND m.created_at <= ?2
                       AND m.last_accessed_at <= ?3 AND m.access_count = 0"
                ),
                vec![
                    f64::from(*weak_threshold).into(),
                    i64::try_from(*created_before).unwrap_or(i64::MAX).into(),
                    i64::try_from(*unused_since).unwrap_or(i64::MAX).into(),
                ],
            ),
            MaintenanceScan::SoftDeletedBefore { cutoff } => (
                format!(
                    "SELECT {MEMORY_COLUMNS} FROM memory m
                     LEFT JOIN vec_memory v ON v.id = m.id
                     WHERE m.soft_deleted_at IS NOT NULL AND m.soft_deleted_at <= ?1"
                ),
                vec![i64::try_from(*cutoff).unwrap_or(i64::MAX).into()],
            ),
            MaintenanceScan::Vectorless { limit } => (
                format!(
                    "SELECT {MEMORY_COLUMNS} FROM memory m
                     LEFT JOIN vec_memory v ON v.id = m.id
                     WHERE m.soft_deleted_at IS NULL AND v.id IS NULL
                     ORDER BY m.created_at ASC LIMIT ?1"
                ),
                vec![i64::try_from(*limit).unwrap_or(i64::MAX).into()],
            ),
        };

        let mut stmt = guard.prepare(&sql).map_err(store_io("prepare_scan"))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(scan_params), memory_from_row)
            .map_err(store_io("scan"))?;
        let mut memories = Vec::new();
        for row in rows {
            memories.push(row.map_err(store_io("scan_row"))?);
        }
        Ok(memories)
    }

    // ------------------------------------------------------------------
    // KG relations (external index; the core only rewrites references)
    // ------------------------------------------------------------------

    /// Records a relation row (used by the external KG layer and tests).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn add_relation(&self, subject: &MemoryId, predicate: &str, object: &MemoryId) -> Result<()> {
        self.lock()
            .execute(
                "INSERT OR IGNORE INTO kg_relation (subject_id, predicate, object_id)
                 VALUES (?1, ?2, ?3)",
                params![subject.as_str(), predicate, object.as_str()],
            )
            .map_err(store_io("add_relation"))?;
        Ok(())
    }

    /// Rewrites relations of a merge loser onto the winner.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn rewrite_relations(&self, loser: &MemoryId, winner: &MemoryId) -> Result<usize> {
        let mut guard = self.lock();
        let tx = begin(&mut guard)?;
        let rewritten = rewrite_relations_tx(&tx, loser, winner)?;
        commit(tx)?;
        Ok(rewritten)
    }

    /// Returns the relations touching a memory (subject or object side).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn relations_for(&self, id: &MemoryId) -> Result<Vec<(String, String, String)>> {
        let guard = self.lock();
        let mut stmt = guard
            .prepare(
                "SELECT subject_id, predicate, object_id FROM kg_relation
                 WHERE subject_id = ?1 OR object_id = ?1",
            )
            .map_err(store_io("prepare_relations_for"))?;
        let rows = stmt
            .query_map(params![id.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(store_io("relations_for"))?;
        let mut relations = Vec::new();
        for row in rows {
            relations.push(row.map_err(store_io("relations_for_row"))?);
        }
        Ok(relations)
    }

    // ------------------------------------------------------------------
    // Embed cache tier
    // ------------------------------------------------------------------

    /// Looks up a persisted embedding by content hash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn embed_cache_get(&self, hash: &str) -> Result<Option<Vec<f32>>> {
        self.lock()
            .query_row(
                "SELECT embedding FROM embed_cache WHERE hash = ?1",
                params![hash],
                |row| {
                    let blob: Vec<u8> = row.get(0)?;
                    Ok(blob_to_vec(&blob))
                },
            )
            .optional()
            .map_err(store_io("embed_cache_get"))
    }

    /// Persists an embedding under its content hash.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn embed_cache_put(
        &self,
        hash: &str,
        model: &str,
        embedding: &[f32],
        now: u64,
    ) -> Result<()> {
        self.lock()
            .execute(
                "INSERT INTO embed_cache (hash, model, dim, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT (hash) DO UPDATE SET
                    model = excluded.model, dim = excluded.dim,
                    embedding = excluded.embedding, created_at = excluded.created_at",
                params![
                    hash,
                    model,
                    i64::try_from(embedding.len()).unwrap_or(0),
                    vec_to_blob(embedding),
                    now
                ],
            )
            .map_err(store_io("embed_cache_put"))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Export / import / stats
    // ------------------------------------------------------------------

    /// Exports memories matching the filter for JSON backup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn export(&self, filter: &MemoryFilter) -> Result<Vec<Memory>> {
        let guard = self.lock();
        let (clause, filter_params, _) = filter_clause(filter, 1);
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memory m
             LEFT JOIN vec_memory v ON v.id = m.id
             WHERE 1=1 {clause}
             ORDER BY m.created_at ASC"
        );
        let mut stmt = guard.prepare(&sql).map_err(store_io("prepare_export"))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(filter_params), memory_from_row)
            .map_err(store_io("export"))?;
        let mut memories = Vec::new();
        for row in rows {
            memories.push(row.map_err(store_io("export_row"))?);
        }
        Ok(memories)
    }

    /// Imports records, idempotent by id: existing ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn import(&self, records: &[Memory]) -> Result<ImportStats> {
        let mut stats = ImportStats::default();
        let mut guard = self.lock();
        let tx = begin(&mut guard)?;
        for record in records {
            let exists: Option<String> = tx
                .query_row(
                    "SELECT id FROM memory WHERE id = ?1",
                    params![record.id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(store_io("import_probe"))?;
            if exists.is_some() {
                stats.skipped += 1;
                continue;
            }
            insert_tx(&tx, record)?;
            stats.imported += 1;
        }
        commit(tx)?;
        Ok(stats)
    }

    /// Number of live (non-soft-deleted) memories.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn count_live(&self) -> Result<usize> {
        self.scalar_count("SELECT COUNT(*) FROM memory WHERE soft_deleted_at IS NULL")
    }

    /// Number of soft-deleted memories awaiting purge.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn count_soft_deleted(&self) -> Result<usize> {
        self.scalar_count("SELECT COUNT(*) FROM memory WHERE soft_deleted_at IS NOT NULL")
    }

    /// Number of live memories without a vector row.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn vectorless_count(&self) -> Result<usize> {
        self.scalar_count(
            "SELECT COUNT(*) FROM memory m
             LEFT JOIN vec_memory v ON v.id = m.id
             WHERE m.soft_deleted_at IS NULL AND v.id IS NULL",
        )
    }

    /// Physical row counts across the three indices (purge verification).
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] on SQL failure.
    pub fn physical_row_counts(&self) -> Result<RowCounts> {
        Ok(RowCounts {
            memory: self.scalar_count("SELECT COUNT(*) FROM memory")?,
            vec: self.scalar_count("SELECT COUNT(*) FROM vec_memory")?,
            fts: self.scalar_count("SELECT COUNT(*) FROM fts_memory")?,
        })
    }

    /// On-disk size of the store file in bytes (0 for in-memory stores).
    #[must_use]
    pub fn disk_usage_bytes(&self) -> u64 {
        self.path
            .as_deref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map_or(0, |m| m.len())
    }

    fn scalar_count(&self, sql: &str) -> Result<usize> {
        let count: i64 = self
            .lock()
            .query_row(sql, [], |row| row.get(0))
            .map_err(store_io("count"))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    fn check_dimensions(&self, embedding: Option<&[f32]>) -> Result<()> {
        match embedding {
            Some(v) if v.len() != self.dimensions => Err(Error::EmbedDimMismatch {
                expected: self.dimensions,
                actual: v.len(),
            }),
            _ => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------
// Connection / transaction helpers
// ----------------------------------------------------------------------

fn configure_connection(conn: &Connection) {
    // WAL for concurrent readers, NORMAL durability, and a lock-contention
    // grace period instead of immediate SQLITE_BUSY.
    let _ = conn.pragma_update(None, "journal_mode", "WAL");
    let _ = conn.pragma_update(None, "synchronous", "NORMAL");
    let _ = conn.pragma_update(None, "busy_timeout", "5000");
}

fn begin<'a>(guard: &'a mut MutexGuard<'_, Connection>) -> Result<Transaction<'a>> {
    guard.transaction().map_err(|e| Error::StoreIo {
        operation: "begin_transaction".to_string(),
        cause: e.to_string(),
    })
}

fn commit(tx: Transaction<'_>) -> Result<()> {
    tx.commit().map_err(|e| Error::StoreIo {
        operation: "commit_transaction".to_string(),
        cause: e.to_string(),
    })
}

fn store_io(operation: &str) -> impl Fn(rusqlite::Error) -> Error + '_ {
    move |e| Error::StoreIo {
        operation: operation.to_string(),
        cause: e.to_string(),
    }
}

fn insert_tx(tx: &Transaction<'_>, memory: &Memory) -> Result<()> {
    let inserted = tx
        .execute(
            "INSERT OR IGNORE INTO memory (
                id, agent, text, normalized_text, category, memory_type,
                importance, strength, created_at, last_reinforced_at,
                last_accessed_at, last_decayed_at, access_count, reinforce_count,
                pinned, soft_deleted_at, superseded_by, session, source,
                provenance, namespace, embedding_status
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13,
                       ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            params![
                memory.id.as_str(),
                memory.agent,
                memory.text,
                memory.normalized_text,
                memory.category.as_str(),
                memory.memory_type.as_str(),
                f64::from(memory.importance),
                f64::from(memory.strength),
                memory.created_at,
                memory.last_reinforced_at,
                memory.last_accessed_at,
                memory.last_decayed_at,
                memory.access_count,
                memory.reinforce_count,
                i32::from(memory.pinned),
                memory.soft_deleted_at,
                memory.superseded_by.as_ref().map(MemoryId::as_str),
                memory.session,
                memory.source,
                memory.provenance,
                memory.namespace,
                memory.embedding_status.as_str(),
            ],
        )
        .map_err(store_io("insert_memory"))?;
    if inserted == 0 {
        return Err(Error::StoreConflict(format!(
            "memory {} already exists",
            memory.id
        )));
    }

    if let Some(embedding) = &memory.embedding {
        tx.execute(
            "INSERT INTO vec_memory (id, embedding) VALUES (?1, ?2)",
            params![memory.id.as_str(), vec_to_blob(embedding)],
        )
        .map_err(store_io("insert_vector"))?;
    }

    tx.execute(
        "INSERT INTO fts_memory (id, normalized_text) VALUES (?1, ?2)",
        params![memory.id.as_str(), memory.normalized_text],
    )
    .map_err(store_io("insert_fts"))?;

    Ok(())
}

fn reinforce_tx(
    tx: &Transaction<'_>,
    id: &MemoryId,
    delta: f32,
    importance: f32,
    provenance: Option<&str>,
    now: u64,
) -> Result<()> {
    tx.execute(
        "UPDATE memory SET
            strength = MIN(1.0, strength + ?2),
            reinforce_count = reinforce_count + 1,
            last_reinforced_at = ?3,
            last_decayed_at = ?3,
            importance = MAX(importance, ?4),
            provenance = COALESCE(provenance || '; ' || ?5, ?5, provenance)
         WHERE id = ?1",
        params![
            id.as_str(),
            f64::from(delta),
            now,
            f64::from(importance),
            provenance
        ],
    )
    .map_err(store_io("reinforce"))?;
    Ok(())
}

fn soft_delete_tx(
    tx: &Transaction<'_>,
    id: &MemoryId,
    now: u64,
    superseded_by: Option<&MemoryId>,
) -> Result<()> {
    let updated = tx
        .execute(
            "UPDATE memory SET soft_deleted_at = ?2, superseded_by = COALESCE(?3, superseded_by)
             WHERE id = ?1",
            params![id.as_str(), now, superseded_by.map(MemoryId::as_str)],
        )
        .map_err(store_io("soft_delete"))?;
    if updated == 0 {
        return Err(Error::NotFound(format!("memory {id}")));
    }
    Ok(())
}

fn hard_delete_tx(tx: &Transaction<'_>, id: &MemoryId) -> Result<bool> {
    tx.execute(
        "DELETE FROM vec_memory WHERE id = ?1",
        params![id.as_str()],
    )
    .map_err(store_io("hard_delete_vector"))?;
    tx.execute(
        "DELETE FROM fts_memory WHERE id = ?1",
        params![id.as_str()],
    )
    .map_err(store_io("hard_delete_fts"))?;
    tx.execute(
        "DELETE FROM kg_relation WHERE subject_id = ?1 OR object_id = ?1",
        params![id.as_str()],
    )
    .map_err(store_io("hard_delete_relations"))?;
    let deleted = tx
        .execute("DELETE FROM memory WHERE id = ?1", params![id.as_str()])
        .map_err(store_io("hard_delete_memory"))?;
    Ok(deleted > 0)
}

fn rewrite_relations_tx(
    tx: &Transaction<'_>,
    loser: &MemoryId,
    winner: &MemoryId,
) -> Result<usize> {
    // OR IGNORE: the winner may already carry an identical relation row.
    let as_subject = tx
        .execute(
            "UPDATE OR IGNORE kg_relation SET subject_id = ?2 WHERE subject_id = ?1",
            params![loser.as_str(), winner.as_str()],
        )
        .map_err(store_io("rewrite_relations_subject"))?;
    let as_object = tx
        .execute(
            "UPDATE OR IGNORE kg_relation SET object_id = ?2 WHERE object_id = ?1",
            params![loser.as_str(), winner.as_str()],
        )
        .map_err(store_io("rewrite_relations_object"))?;
    // Rows that survived as duplicates still reference the loser; drop them.
    tx.execute(
        "DELETE FROM kg_relation WHERE subject_id = ?1 OR object_id = ?1",
        params![loser.as_str()],
    )
    .map_err(store_io("rewrite_relations_cleanup"))?;
    Ok(as_subject + as_object)
}

fn nearest_neighbor_tx(
    tx: &Transaction<'_>,
    embedding: &[f32],
    namespace: Option<&str>,
) -> Result<Option<(Memory, f32)>> {
    let sql = namespace.map_or_else(
        || {
            format!(
                "SELECT {MEMORY_COLUMNS} FROM vec_memory v
                 JOIN memory m ON m.id = v.id
                 WHERE m.soft_deleted_at IS NULL AND m.namespace IS NULL"
            )
        },
        |_| {
            format!(
                "SELECT {MEMORY_COLUMNS} FROM vec_memory v
                 JOIN memory m ON m.id = v.id
                 WHERE m.soft_deleted_at IS NULL AND m.namespace = ?1"
            )
        },
    );

    let mut stmt = tx.prepare(&sql).map_err(store_io("prepare_nearest"))?;
    let rows = match namespace {
        Some(ns) => stmt.query_map(params![ns], memory_from_row),
        None => stmt.query_map([], memory_from_row),
    }
    .map_err(store_io("nearest"))?;

    let mut best: Option<(Memory, f32)> = None;
    for row in rows {
        let memory = row.map_err(store_io("nearest_row"))?;
        let Some(candidate) = memory.embedding.as_deref() else {
            continue;
        };
        if candidate.len() != embedding.len() {
            continue;
        }
        let similarity = cosine_similarity(embedding, candidate);
        if best.as_ref().is_none_or(|(_, s)| similarity > *s) {
            best = Some((memory, similarity));
        }
    }
    Ok(best)
}

// ----------------------------------------------------------------------
// Row / blob mapping
// ----------------------------------------------------------------------

#[allow(clippy::cast_possible_truncation)]
fn memory_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Memory> {
    let embedding: Option<Vec<u8>> = row.get(22)?;
    let embedding = embedding.map(|blob| blob_to_vec(&blob));
    let category: String = row.get(4)?;
    let memory_type: String = row.get(5)?;
    let embedding_status: String = row.get(21)?;
    let superseded_by: Option<String> = row.get(16)?;
    Ok(Memory {
        id: MemoryId::new(row.get::<_, String>(0)?),
        agent: row.get(1)?,
        text: row.get(2)?,
        normalized_text: row.get(3)?,
        category: Category::parse(&category),
        memory_type: Category::parse(&memory_type),
        importance: row.get::<_, f64>(6)? as f32,
        strength: row.get::<_, f64>(7)? as f32,
        created_at: row.get(8)?,
        last_reinforced_at: row.get(9)?,
        last_accessed_at: row.get(10)?,
        last_decayed_at: row.get(11)?,
        access_count: row.get(12)?,
        reinforce_count: row.get(13)?,
        pinned: row.get::<_, i64>(14)? != 0,
        soft_deleted_at: row.get(15)?,
        superseded_by: superseded_by.map(MemoryId::new),
        session: row.get(17)?,
        source: row.get(18)?,
        provenance: row.get(19)?,
        namespace: row.get(20)?,
        embedding,
        embedding_status: EmbeddingStatus::parse(&embedding_status),
    })
}

/// Encodes an f32 vector as little-endian bytes.
#[must_use]
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        blob.extend_from_slice(&value.to_le_bytes());
    }
    blob
}

/// Decodes little-endian bytes back into an f32 vector.
#[must_use]
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Cosine similarity clamped to [0, 1]. Mismatched lengths and zero
/// magnitudes read as no similarity.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    (dot / (mag_a * mag_b)).clamp(0.0, 1.0)
}

/// Builds a numbered-parameter filter clause over the `memory` table alias
/// `m`. Returns the clause, its parameters, and the next parameter index.
fn filter_clause(
    filter: &MemoryFilter,
    start_param: usize,
) -> (String, Vec<String>, usize) {
    let mut conditions = Vec::new();
    let mut params = Vec::new();
    let mut idx = start_param;

    if !filter.include_soft_deleted {
        conditions.push("m.soft_deleted_at IS NULL".to_string());
    }
    if let Some(ns) = &filter.namespace {
        conditions.push(format!("m.namespace = ?{idx}"));
        params.push(ns.clone());
        idx += 1;
    }
    if let Some(category) = filter.category {
        conditions.push(format!("m.category = ?{idx}"));
        params.push(category.as_str().to_string());
        idx += 1;
    }
    if let Some(min) = filter.min_importance {
        conditions.push(format!("m.importance >= ?{idx}"));
        params.push(min.to_string());
        idx += 1;
    }
    if let Some(range) = filter.time_range {
        conditions.push(format!("m.created_at >= ?{idx}"));
        params.push(range.start.to_string());
        idx += 1;
        conditions.push(format!("m.created_at <= ?{idx}"));
        params.push(range.end.to_string());
        idx += 1;
    }

    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!(" AND {}", conditions.join(" AND "))
    };
    (clause, params, idx)
}
