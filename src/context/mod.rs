//! The core context handle.
//!
//! One `CoreContext` owns the configuration, the storage pool, and the
//! wired services, and is threaded through every operation. No ambient
//! singletons: tests instantiate as many isolated cores as they like.

use crate::config::MemoryConfig;
use crate::embedding::{Embedder, HashedEmbedder, RemoteEmbedder};
use crate::lifecycle::{
    BackfillStats, ConsolidateStats, DecayStats, GcStats, LifecycleService, TopicCoverage,
};
use crate::models::{Memory, MemoryFilter, MemoryId, RecallRequest, RecallResponse};
use crate::normalize::Normalizer;
use crate::observability::StatsSnapshot;
use crate::recall::{
    CrossEncoder, HttpCrossEncoder, RecallService, TokenOverlapCrossEncoder, TwoPassReranker,
};
use crate::storage::{ImportStats, StoragePool};
use crate::write::{CaptureMessage, CaptureService, StoreReceipt, StoreRequest};
use crate::Result;
use std::sync::Arc;

/// Process-wide handle over the memory core.
pub struct CoreContext {
    config: MemoryConfig,
    pool: Arc<StoragePool>,
    recall: RecallService,
    capture: CaptureService,
    lifecycle: LifecycleService,
}

impl CoreContext {
    /// Opens a core from configuration, picking the embedder and
    /// cross-encoders from what is configured: the remote embedder when an
    /// API key is present, the offline hash-projection embedder otherwise;
    /// remote cross-encoders when a scoring endpoint is configured, the
    /// local token-overlap scorer as the primary fallback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`](crate::Error::Config) for invalid
    /// configuration and store errors when the data directory is unusable.
    pub fn open(config: MemoryConfig) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(StoragePool::new(&config.data_dir, config.dimensions)?);

        let embedder: Arc<dyn Embedder> = if config.embed.api_key.is_some() {
            let remote = RemoteEmbedder::new(&config.embed, config.dimensions);
            // The default agent's store doubles as the persistent cache tier.
            match pool.get(crate::storage::DEFAULT_AGENT) {
                Ok(store) => remote.set_store(store),
                Err(e) => tracing::warn!(error = %e, "Embed cache store tier unavailable"),
            }
            Arc::new(remote)
        } else {
            tracing::info!("No embedding API key configured, using offline hash embedder");
            Arc::new(HashedEmbedder::new(config.dimensions))
        };

        Self::wire(config, pool, embedder)
    }

    /// Opens a core with an injected embedder capability.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn with_embedder(config: MemoryConfig, embedder: Arc<dyn Embedder>) -> Result<Self> {
        config.validate()?;
        let pool = Arc::new(StoragePool::new(&config.data_dir, config.dimensions)?);
        Self::wire(config, pool, embedder)
    }

    fn wire(
        config: MemoryConfig,
        pool: Arc<StoragePool>,
        embedder: Arc<dyn Embedder>,
    ) -> Result<Self> {
        let normalizer = Arc::new(Normalizer::new());

        let primary: Option<Arc<dyn CrossEncoder>> = if config.rerank.primary.enabled {
            Some(match &config.rerank.base_url {
                Some(url) => Arc::new(HttpCrossEncoder::new(
                    url,
                    &config.rerank.primary.model,
                    config.rerank.api_key.as_deref(),
                )),
                None => Arc::new(TokenOverlapCrossEncoder),
            })
        } else {
            None
        };
        let secondary: Option<Arc<dyn CrossEncoder>> =
            match (&config.rerank.base_url, config.rerank.secondary.enabled) {
                (Some(url), true) => Some(Arc::new(HttpCrossEncoder::new(
                    url,
                    &config.rerank.secondary.model,
                    config.rerank.api_key.as_deref(),
                ))),
                _ => None,
            };
        let reranker = Arc::new(TwoPassReranker::new(
            config.rerank.clone(),
            primary,
            secondary,
        ));

        let recall = RecallService::new(
            &config,
            Arc::clone(&pool),
            Arc::clone(&embedder),
            Arc::clone(&normalizer),
            reranker,
        );
        let capture = CaptureService::new(
            Arc::clone(&pool),
            Arc::clone(&embedder),
            Arc::clone(&normalizer),
            config.merge,
        );
        let lifecycle = LifecycleService::new(
            Arc::clone(&pool),
            Arc::clone(&embedder),
            config.lifecycle,
        );

        Ok(Self {
            config,
            pool,
            recall,
            capture,
            lifecycle,
        })
    }

    /// The active configuration.
    #[must_use]
    pub const fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// The storage pool.
    #[must_use]
    pub fn pool(&self) -> Arc<StoragePool> {
        Arc::clone(&self.pool)
    }

    /// Answers a recall query.
    ///
    /// # Errors
    ///
    /// See [`RecallService::recall`].
    pub fn recall(&self, request: &RecallRequest) -> Result<RecallResponse> {
        self.recall.recall(request)
    }

    /// Stores a single memory through the dedup-merge funnel.
    ///
    /// # Errors
    ///
    /// See [`CaptureService::store`].
    pub fn store(&self, request: &StoreRequest) -> Result<StoreReceipt> {
        self.capture.store(request)
    }

    /// Batch-captures session messages.
    ///
    /// # Errors
    ///
    /// See [`CaptureService::capture`].
    pub fn capture(
        &self,
        agent: &str,
        messages: &[CaptureMessage],
        session: Option<&str>,
        source: Option<&str>,
    ) -> Result<Vec<StoreReceipt>> {
        self.capture.capture(agent, messages, session, source)
    }

    /// Stores a pinned rule.
    ///
    /// # Errors
    ///
    /// See [`CaptureService::store_rule`].
    pub fn store_rule(&self, agent: &str, text: &str) -> Result<StoreReceipt> {
        self.capture.store_rule(agent, text)
    }

    /// Forgets a memory by id; with a query instead, forgets the top
    /// recall hit.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`](crate::Error::Validation) when
    /// neither id nor query is given, and recall/store errors otherwise.
    pub fn forget(
        &self,
        agent: &str,
        id: Option<&MemoryId>,
        query: Option<&str>,
    ) -> Result<Option<MemoryId>> {
        if let Some(id) = id {
            self.capture.forget_by_id(agent, id)?;
            return Ok(Some(id.clone()));
        }
        let Some(query) = query else {
            return Err(crate::Error::Validation(
                "forget requires an id or a query".to_string(),
            ));
        };
        let response = self.recall(
            &RecallRequest::new(query)
                .with_agent(agent)
                .with_limit(1),
        )?;
        match response.results.first() {
            Some(top) => {
                self.capture.forget_by_id(&top.agent, &top.id)?;
                Ok(Some(top.id.clone()))
            },
            None => Ok(None),
        }
    }

    /// Pins a memory.
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::pin`].
    pub fn pin(&self, agent: &str, id: &MemoryId) -> Result<()> {
        self.lifecycle.pin(agent, id)
    }

    /// Unpins a memory.
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::unpin`].
    pub fn unpin(&self, agent: &str, id: &MemoryId) -> Result<()> {
        self.lifecycle.unpin(agent, id)
    }

    /// Runs a decay tick.
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::decay`].
    pub fn decay(&self, agent: &str) -> Result<DecayStats> {
        self.lifecycle.decay(agent, crate::current_timestamp())
    }

    /// Runs a consolidation pass.
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::consolidate`].
    pub fn consolidate(&self, agent: &str) -> Result<ConsolidateStats> {
        self.lifecycle
            .consolidate(agent, crate::current_timestamp())
    }

    /// Runs a GC pass.
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::gc`].
    pub fn gc(&self, agent: &str) -> Result<GcStats> {
        self.lifecycle.gc(agent, crate::current_timestamp())
    }

    /// Retries embedding for vectorless memories.
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::backfill_embeddings`].
    pub fn backfill_embeddings(&self, agent: &str, limit: usize) -> Result<BackfillStats> {
        self.lifecycle.backfill_embeddings(agent, limit)
    }

    /// Probes recall coverage for a topic list.
    ///
    /// # Errors
    ///
    /// See [`LifecycleService::amnesia_check`].
    pub fn amnesia_check(&self, agent: &str, topics: &[String]) -> Result<Vec<TopicCoverage>> {
        self.lifecycle.amnesia_check(agent, topics, &self.recall)
    }

    /// Exports memories for JSON backup.
    ///
    /// # Errors
    ///
    /// Returns store errors from any resolved store.
    pub fn export(&self, agent: &str, filter: &MemoryFilter) -> Result<Vec<Memory>> {
        let mut records = Vec::new();
        for store in self.pool.resolve(agent)? {
            records.extend(store.export(filter)?);
        }
        Ok(records)
    }

    /// Imports backup records, idempotent by id.
    ///
    /// # Errors
    ///
    /// Returns store errors from the target store.
    pub fn import(&self, agent: &str, records: &[Memory]) -> Result<ImportStats> {
        self.pool.get(agent)?.import(records)
    }

    /// Assembles the stats snapshot.
    ///
    /// # Errors
    ///
    /// See [`crate::observability::snapshot`].
    pub fn stats(&self) -> Result<StatsSnapshot> {
        crate::observability::snapshot(&self.pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Category;

    fn test_core() -> (tempfile::TempDir, CoreContext) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = MemoryConfig {
            data_dir: dir.path().to_path_buf(),
            dimensions: 768,
            ..MemoryConfig::default()
        };
        let core = CoreContext::open(config).expect("core");
        (dir, core)
    }

    #[test]
    fn open_without_api_key_uses_offline_embedder() {
        let (_dir, core) = test_core();
        let receipt = core
            .store(&StoreRequest::new("offline embedded memory"))
            .expect("store");
        let row = core
            .pool()
            .get("main")
            .expect("store")
            .get(&receipt.id)
            .expect("get")
            .expect("present");
        assert!(row.embedding.is_some());
    }

    #[test]
    fn store_then_recall_roundtrip() {
        let (_dir, core) = test_core();
        core.store(&StoreRequest::new("User prefers dark mode"))
            .expect("store");

        let response = core
            .recall(&RecallRequest::new("what is the user's UI preference dark mode"))
            .expect("recall");
        assert!(!response.results.is_empty());
        assert!(response.results[0].text.contains("dark mode"));
    }

    #[test]
    fn forget_by_query_removes_top_hit() {
        let (_dir, core) = test_core();
        let receipt = core
            .store(&StoreRequest::new("the launch code is stored in the vault"))
            .expect("store");

        let forgotten = core
            .forget("main", None, Some("launch code vault"))
            .expect("forget")
            .expect("something forgotten");
        assert_eq!(forgotten, receipt.id);

        let row = core
            .pool()
            .get("main")
            .expect("store")
            .get(&receipt.id)
            .expect("get")
            .expect("present");
        assert!(row.soft_deleted_at.is_some());
    }

    #[test]
    fn forget_requires_id_or_query() {
        let (_dir, core) = test_core();
        let err = core.forget("main", None, None).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn export_import_between_cores() {
        let (_dir, source) = test_core();
        source
            .store(
                &StoreRequest::new("portable fact")
                    .with_category(Category::Fact)
                    .with_importance(0.8),
            )
            .expect("store");

        let exported = source
            .export("main", &MemoryFilter::new())
            .expect("export");
        assert_eq!(exported.len(), 1);

        let (_dir2, target) = test_core();
        let stats = target.import("main", &exported).expect("import");
        assert_eq!(stats.imported, 1);
        // Idempotent re-import.
        let again = target.import("main", &exported).expect("import again");
        assert_eq!(again.skipped, 1);
    }

    #[test]
    fn stats_reflect_stored_memories() {
        let (_dir, core) = test_core();
        core.store(&StoreRequest::new("counted memory"))
            .expect("store");
        let stats = core.stats().expect("stats");
        assert_eq!(stats.total_memories, 1);
    }
}
