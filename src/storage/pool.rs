//! Agent-to-store routing.
//!
//! Maps `agent → Store`, opening store files lazily on first use and
//! keeping the handles for the process lifetime. `agent = "all"` is a
//! reserved fan-out scope: reads union every store, maintenance iterates
//! them, and nothing is ever written to it.

use super::Store;
use crate::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

/// The reserved fan-out agent scope.
pub const ALL_AGENTS: &str = "all";

/// Default agent when none is given.
pub const DEFAULT_AGENT: &str = "main";

/// Maximum accepted agent id length.
const MAX_AGENT_LEN: usize = 64;

/// Routes requests to per-agent stores.
pub struct StoragePool {
    data_dir: PathBuf,
    dimensions: usize,
    stores: RwLock<HashMap<String, Arc<Store>>>,
}

impl StoragePool {
    /// Creates a pool rooted at `data_dir`, creating the directory if
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StoreIo`] when the directory cannot be created.
    pub fn new(data_dir: impl Into<PathBuf>, dimensions: usize) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir).map_err(|e| Error::StoreIo {
            operation: "create_data_dir".to_string(),
            cause: format!("{}: {e}", data_dir.display()),
        })?;
        Ok(Self {
            data_dir,
            dimensions,
            stores: RwLock::new(HashMap::new()),
        })
    }

    /// Validates and canonicalizes an agent id.
    ///
    /// Empty input maps to [`DEFAULT_AGENT`]. The conservative identifier
    /// pattern (`[A-Za-z0-9_-]`, max 64 chars) precludes path traversal
    /// through the id-to-filename mapping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for ids outside the pattern.
    pub fn normalize_agent(agent: &str) -> Result<String> {
        let trimmed = agent.trim();
        if trimmed.is_empty() {
            return Ok(DEFAULT_AGENT.to_string());
        }
        if trimmed.len() > MAX_AGENT_LEN
            || !trimmed
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Validation(format!("invalid agent id '{agent}'")));
        }
        Ok(trimmed.to_string())
    }

    /// Returns the store file path for an agent:
    /// `memory.sqlite` for the default agent, `memory-<agent>.sqlite`
    /// otherwise.
    #[must_use]
    pub fn store_path(&self, agent: &str) -> PathBuf {
        if agent == DEFAULT_AGENT {
            self.data_dir.join("memory.sqlite")
        } else {
            self.data_dir.join(format!("memory-{agent}.sqlite"))
        }
    }

    /// Returns the store for an agent, opening it on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for bad ids (including the reserved
    /// `all`) and [`Error::StoreIo`] when the file cannot be opened.
    pub fn get(&self, agent: &str) -> Result<Arc<Store>> {
        let agent = Self::normalize_agent(agent)?;
        if agent == ALL_AGENTS {
            return Err(Error::Validation(
                "agent 'all' is a fan-out scope, not a store".to_string(),
            ));
        }

        if let Some(store) = self
            .stores
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&agent)
        {
            return Ok(Arc::clone(store));
        }

        let mut stores = self
            .stores
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // Double-check: another thread may have opened it while we waited.
        if let Some(store) = stores.get(&agent) {
            return Ok(Arc::clone(store));
        }
        let path = self.store_path(&agent);
        tracing::info!(agent = %agent, path = %path.display(), "Opening agent store");
        let store = Arc::new(Store::open(path, agent.clone(), self.dimensions)?);
        stores.insert(agent, Arc::clone(&store));
        Ok(store)
    }

    /// Lists known agents: every open handle plus store files on disk.
    #[must_use]
    pub fn agents(&self) -> Vec<String> {
        let mut agents: Vec<String> = self
            .stores
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();

        if let Ok(entries) = std::fs::read_dir(&self.data_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name == "memory.sqlite" {
                    agents.push(DEFAULT_AGENT.to_string());
                } else if let Some(agent) = name
                    .strip_prefix("memory-")
                    .and_then(|rest| rest.strip_suffix(".sqlite"))
                {
                    agents.push(agent.to_string());
                }
            }
        }

        agents.sort();
        agents.dedup();
        agents
    }

    /// Resolves a request scope to concrete stores: a single store, or
    /// every known store for the `all` fan-out.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for invalid ids and [`Error::StoreIo`]
    /// for open failures.
    pub fn resolve(&self, agent: &str) -> Result<Vec<Arc<Store>>> {
        if Self::normalize_agent(agent)? == ALL_AGENTS {
            return self.agents().iter().map(|a| self.get(a)).collect();
        }
        Ok(vec![self.get(agent)?])
    }

    /// Returns the configured data directory.
    #[must_use]
    pub fn data_dir(&self) -> &std::path::Path {
        &self.data_dir
    }

    /// Returns the configured embedding dimension.
    #[must_use]
    pub const fn dimensions(&self) -> usize {
        self.dimensions
    }
}
