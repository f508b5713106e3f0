//! Configuration for codevec
//!
//! All sections deserialize with defaults, so a config file only needs the
//! keys it wants to override.

use crate::error::{CodevecError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default preallocated capacity of a freshly created vector index
pub const DEFAULT_INITIAL_CAPACITY: usize = 10_000;

/// Default number of results returned by a search
pub const DEFAULT_SEARCH_LIMIT: usize = 5;

/// Default minimum cosine similarity for a search hit
pub const DEFAULT_MIN_SCORE: f32 = 0.65;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub index: IndexConfig,
    pub search: SearchConfig,
}

/// Metadata store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Database file name inside the store directory
    pub database_file: String,
    /// How long a statement waits on a locked database before failing
    pub busy_timeout_ms: u64,
    /// SQLite `synchronous` level
    pub synchronous: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_file: "codevec.db".to_string(),
            busy_timeout_ms: 5_000,
            synchronous: "NORMAL".to_string(),
        }
    }
}

/// Vector index settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Capacity of a freshly created index
    pub initial_capacity: usize,
    /// Snapshot files are named `<prefix>-<dimension>.idx`
    pub snapshot_prefix: String,
    /// Candidate list size while building the graph
    pub ef_construction: usize,
    /// Candidate list size at query time
    pub ef_search: usize,
    /// Seed for the graph's level assignment
    pub seed: u64,
    /// Tombstone ratio above which `compact_if_needed` rebuilds the index
    pub compaction_threshold: f32,
    /// Minimum number of tombstones before compaction is considered
    pub compaction_min_deleted: usize,
    /// Vectors added since the last graph build that are searched exactly
    /// before the graph is rebuilt. Indexes this small skip the graph.
    pub max_unindexed: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            snapshot_prefix: "vectors".to_string(),
            ef_construction: 100,
            ef_search: 100,
            seed: 0x5eed_c0de,
            compaction_threshold: 0.3,
            compaction_min_deleted: 64,
            max_unindexed: 1024,
        }
    }
}

/// Search defaults and oversampling policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub default_limit: usize,
    pub default_min_score: f32,
    /// Neighbours requested per wanted result
    pub oversample_factor: usize,
    /// Floor for the number of neighbours requested
    pub min_candidates: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_SEARCH_LIMIT,
            default_min_score: DEFAULT_MIN_SCORE,
            oversample_factor: 3,
            min_candidates: 10,
        }
    }
}

impl Config {
    /// Load a JSON config file. Missing keys fall back to defaults.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        log::debug!("Loaded configuration from {:?}", path.as_ref());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.index.initial_capacity == 0 {
            return Err(CodevecError::Config(
                "index.initial_capacity must be greater than zero".to_string(),
            ));
        }
        if self.index.snapshot_prefix.is_empty() {
            return Err(CodevecError::Config(
                "index.snapshot_prefix must not be empty".to_string(),
            ));
        }
        if self.storage.database_file.is_empty() {
            return Err(CodevecError::Config(
                "storage.database_file must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.index.compaction_threshold) {
            return Err(CodevecError::Config(format!(
                "index.compaction_threshold must be within [0, 1], got {}",
                self.index.compaction_threshold
            )));
        }
        if !matches!(
            self.storage.synchronous.to_ascii_uppercase().as_str(),
            "OFF" | "NORMAL" | "FULL" | "EXTRA"
        ) {
            return Err(CodevecError::Config(format!(
                "unknown synchronous level '{}'",
                self.storage.synchronous
            )));
        }
        Ok(())
    }
}
