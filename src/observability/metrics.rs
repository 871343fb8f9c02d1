//! Metrics exposition.
//!
//! Counters and histograms are recorded through the `metrics` facade at
//! every service boundary; this module installs the Prometheus recorder
//! and assembles the structured JSON stats snapshot from per-store
//! queries. Serving either format over HTTP is the adapter's job — the
//! core only renders the strings.

use crate::storage::StoragePool;
use crate::{Error, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use std::sync::OnceLock;
use std::time::Instant;

/// Global recorder handle for on-demand rendering.
static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Process start, for uptime reporting.
static STARTED_AT: OnceLock<Instant> = OnceLock::new();

/// Installs the Prometheus recorder. Safe to call repeatedly; only the
/// first call takes effect.
///
/// # Errors
///
/// Returns [`Error::Config`] when the recorder cannot be installed (an
/// unrelated global recorder already present).
pub fn install() -> Result<()> {
    let _ = STARTED_AT.set(Instant::now());
    if PROMETHEUS.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("metrics recorder install failed: {e}")))?;
    let _ = PROMETHEUS.set(handle);
    Ok(())
}

/// Renders the Prometheus text exposition format.
///
/// Empty until [`install`] has run.
#[must_use]
pub fn render_prometheus() -> String {
    PROMETHEUS
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Per-agent store statistics.
#[derive(Debug, Serialize)]
pub struct AgentStats {
    /// Agent id.
    pub agent: String,
    /// Live memory count.
    pub memories: usize,
    /// Soft-deleted rows awaiting purge.
    pub soft_deleted: usize,
    /// Live memories without a vector.
    pub vectorless: usize,
    /// Store file size in bytes.
    pub disk_bytes: u64,
}

/// Process-wide stats snapshot (the structured JSON exposition).
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    /// Snapshot wall-clock time, RFC 3339.
    pub generated_at: String,
    /// Seconds since metrics install.
    pub uptime_secs: u64,
    /// Total live memories across agents.
    pub total_memories: usize,
    /// Total vectorless memories across agents.
    pub total_vectorless: usize,
    /// Per-agent breakdown.
    pub agents: Vec<AgentStats>,
}

/// Assembles the stats snapshot by querying every store in the pool.
///
/// # Errors
///
/// Returns store errors when a store cannot be opened or counted.
pub fn snapshot(pool: &StoragePool) -> Result<StatsSnapshot> {
    let mut agents = Vec::new();
    let mut total_memories = 0;
    let mut total_vectorless = 0;

    for agent in pool.agents() {
        let store = pool.get(&agent)?;
        let memories = store.count_live()?;
        let vectorless = store.vectorless_count()?;
        total_memories += memories;
        total_vectorless += vectorless;
        agents.push(AgentStats {
            agent,
            memories,
            soft_deleted: store.count_soft_deleted()?,
            vectorless,
            disk_bytes: store.disk_usage_bytes(),
        });
    }

    Ok(StatsSnapshot {
        generated_at: chrono::Utc::now().to_rfc3339(),
        uptime_secs: STARTED_AT.get().map_or(0, |t| t.elapsed().as_secs()),
        total_memories,
        total_vectorless,
        agents,
    })
}
