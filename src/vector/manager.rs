//! Index lifecycle: dimension binding, snapshot files and growth policy
//!
//! The manager owns at most one `VectorIndex` at a time. Each dimension has
//! its own snapshot file next to the database. Whether a snapshot may be
//! restored after a dimension switch is the caller's decision; the store
//! resets instead, since labels restart at 0 in every dimension.

use crate::config::IndexConfig;
use crate::error::{CodevecError, Result};
use crate::storage::Label;
use crate::utils::ensure_directory;
use crate::vector::index::{GraphParams, IndexStats, VectorIndex};
use std::path::{Path, PathBuf};

/// What `bind_dimension` ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// The requested dimension was already bound
    AlreadyBound,
    /// A snapshot for the dimension was loaded from disk
    Restored { elements: usize },
    /// No usable snapshot; an empty index was created
    Fresh,
}

pub struct IndexManager {
    directory: PathBuf,
    config: IndexConfig,
    index: Option<VectorIndex>,
}

impl IndexManager {
    pub fn new<P: AsRef<Path>>(directory: P, config: IndexConfig) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            config,
            index: None,
        }
    }

    pub fn snapshot_path(&self, dimension: usize) -> PathBuf {
        self.directory
            .join(format!("{}-{}.idx", self.config.snapshot_prefix, dimension))
    }

    pub fn dimension(&self) -> Option<usize> {
        self.index.as_ref().map(VectorIndex::dimension)
    }

    pub fn is_bound(&self) -> bool {
        self.index.is_some()
    }

    pub fn index(&self) -> Option<&VectorIndex> {
        self.index.as_ref()
    }

    fn bound(&self) -> Result<&VectorIndex> {
        self.index.as_ref().ok_or(CodevecError::IndexNotBound)
    }

    fn bound_mut(&mut self) -> Result<&mut VectorIndex> {
        self.index.as_mut().ok_or(CodevecError::IndexNotBound)
    }

    fn fresh_index(&self, dimension: usize) -> Result<VectorIndex> {
        VectorIndex::new(
            dimension,
            self.config.initial_capacity,
            GraphParams::from(&self.config),
        )
    }

    /// Bind the manager to `dimension`, restoring its snapshot when possible.
    ///
    /// A different dimension discards the in-memory index first. A missing
    /// or unreadable snapshot yields an empty index; unreadable snapshot
    /// contents are treated as lost.
    pub fn bind_dimension(&mut self, dimension: usize) -> Result<BindOutcome> {
        if dimension == 0 {
            return Err(CodevecError::Validation(
                "cannot bind index to dimension 0".to_string(),
            ));
        }
        if self.dimension() == Some(dimension) {
            return Ok(BindOutcome::AlreadyBound);
        }
        if let Some(old) = self.index.take() {
            log::info!(
                "Discarding in-memory index for dimension {} ({} elements)",
                old.dimension(),
                old.element_count()
            );
        }

        let path = self.snapshot_path(dimension);
        if path.exists() {
            match VectorIndex::load(&path, GraphParams::from(&self.config)) {
                Ok(index) if index.dimension() == dimension => {
                    let elements = index.element_count();
                    self.index = Some(index);
                    return Ok(BindOutcome::Restored { elements });
                }
                Ok(index) => {
                    log::warn!(
                        "Snapshot {:?} holds dimension {}, expected {}; starting with an empty index",
                        path,
                        index.dimension(),
                        dimension
                    );
                }
                Err(e) => {
                    log::warn!(
                        "Failed to load index snapshot {:?}: {}; starting with an empty index, stored vectors are lost",
                        path,
                        e
                    );
                }
            }
        } else {
            log::info!("No index snapshot for dimension {}, creating empty index", dimension);
        }

        self.index = Some(self.fresh_index(dimension)?);
        Ok(BindOutcome::Fresh)
    }

    /// Replace the index for `dimension` with an empty one at `generation`,
    /// deleting any snapshot on disk
    pub fn reset(&mut self, dimension: usize, generation: u64) -> Result<()> {
        let path = self.snapshot_path(dimension);
        if path.exists() {
            if let Err(e) = std::fs::remove_file(&path) {
                log::warn!("Failed to remove stale snapshot {:?}: {}", path, e);
            }
        }
        let mut index = self.fresh_index(dimension)?;
        index.set_generation(generation);
        self.index = Some(index);
        log::info!(
            "Reset vector index for dimension {} (generation {})",
            dimension,
            generation
        );
        Ok(())
    }

    pub fn generation(&self) -> Option<u64> {
        self.index.as_ref().map(VectorIndex::generation)
    }

    pub fn set_generation(&mut self, generation: u64) -> Result<()> {
        self.bound_mut()?.set_generation(generation);
        Ok(())
    }

    /// Swap in a rebuilt index of the same dimension
    pub fn install(&mut self, index: VectorIndex) -> Result<()> {
        match self.dimension() {
            Some(d) if d == index.dimension() => {
                self.index = Some(index);
                Ok(())
            }
            Some(d) => Err(CodevecError::Validation(format!(
                "cannot install index of dimension {} over dimension {}",
                index.dimension(),
                d
            ))),
            None => Err(CodevecError::IndexNotBound),
        }
    }

    /// Make room for at least `required` elements, doubling capacity
    pub fn ensure_capacity(&mut self, required: usize) -> Result<()> {
        let index = self.bound_mut()?;
        let capacity = index.max_elements();
        if required <= capacity {
            return Ok(());
        }
        let target = capacity.saturating_mul(2).max(required);
        index.resize(target).map_err(|e| {
            log::error!("Index resize to {} failed: {}", target, e);
            e
        })
    }

    /// Insert under `label`, growing capacity first if needed
    pub fn add_point(&mut self, vector: &[f32], label: Label) -> Result<()> {
        self.ensure_capacity(label + 1)?;
        self.bound_mut()?.add_point(vector, label)
    }

    pub fn search_knn(&mut self, query: &[f32], k: usize) -> Result<Vec<(Label, f32)>> {
        self.bound_mut()?.search_knn(query, k)
    }

    pub fn mark_deleted(&mut self, label: Label) -> Result<bool> {
        self.bound_mut()?.mark_deleted(label)
    }

    pub fn restore(&mut self, label: Label) -> Result<bool> {
        self.bound_mut()?.restore(label)
    }

    /// The label the next insert must use
    pub fn next_label(&self) -> Result<Label> {
        Ok(self.bound()?.element_count())
    }

    /// Write the bound index to its snapshot file
    pub fn persist(&self) -> Result<()> {
        let index = self.bound()?;
        ensure_directory(&self.directory)?;
        index.save(self.snapshot_path(index.dimension()))
    }

    /// Reload the bound dimension from disk, falling back to an empty index
    pub fn load(&mut self) -> Result<BindOutcome> {
        let dimension = self.bound()?.dimension();
        self.index = None;
        self.bind_dimension(dimension)
    }

    pub fn compacted(&self) -> Result<(VectorIndex, Vec<(Label, Label)>)> {
        self.bound()?.compacted()
    }

    pub fn stats(&self) -> Option<IndexStats> {
        self.index.as_ref().map(VectorIndex::stats)
    }
}
