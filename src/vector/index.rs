//! Labelled cosine-space vector index with an HNSW graph
//!
//! Vectors are stored densely by label (label == insertion position). The
//! HNSW graph covers a prefix of the labels; vectors added after the last
//! build form an unindexed tail that is scanned exactly at query time. The
//! graph is rebuilt once that tail grows past `max_unindexed`. Soft-deleted
//! labels stay in the graph and are filtered out of results; nothing is
//! physically removed until `compacted` is used.

use crate::config::IndexConfig;
use crate::error::{CodevecError, Result};
use crate::storage::Label;
use instant_distance::{Builder, HnswMap, Point, Search};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::Write;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

/// Snapshot format version
pub const SNAPSHOT_VERSION: u32 = 1;

/// A shared, immutable vector usable as an HNSW point
#[derive(Clone, Debug)]
pub struct VectorPoint(Arc<[f32]>);

impl VectorPoint {
    pub fn new(data: &[f32]) -> Self {
        Self(Arc::from(data))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl Point for VectorPoint {
    fn distance(&self, other: &Self) -> f32 {
        cosine_distance(&self.0, &other.0)
    }
}

/// Cosine distance (1 - cosine similarity), accumulated in f64
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0f64, 0.0f64, 0.0f64), |(dot, na, nb), (&x, &y)| {
            let (x, y) = (x as f64, y as f64);
            (dot + x * y, na + x * x, nb + y * y)
        });

    if norm_a == 0.0 || norm_b == 0.0 {
        1.0 // Maximum distance for zero vectors
    } else {
        let cosine = (dot / (norm_a.sqrt() * norm_b.sqrt())).clamp(-1.0, 1.0);
        (1.0 - cosine) as f32
    }
}

/// HNSW build/search parameters
#[derive(Debug, Clone)]
pub struct GraphParams {
    pub ef_construction: usize,
    pub ef_search: usize,
    pub seed: u64,
    /// Unindexed tail length tolerated before the graph is rebuilt
    pub max_unindexed: usize,
}

impl From<&IndexConfig> for GraphParams {
    fn from(config: &IndexConfig) -> Self {
        Self {
            ef_construction: config.ef_construction.max(1),
            ef_search: config.ef_search.max(1),
            seed: config.seed,
            max_unindexed: config.max_unindexed,
        }
    }
}

impl Default for GraphParams {
    fn default() -> Self {
        GraphParams::from(&IndexConfig::default())
    }
}

/// Counters describing an index
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexStats {
    pub dimension: usize,
    /// Labels handed out so far, including tombstoned ones
    pub element_count: usize,
    pub live_count: usize,
    pub deleted_count: usize,
    /// Preallocated capacity
    pub max_elements: usize,
    pub graph_built: bool,
    /// Vectors added since the graph was last built
    pub unindexed_count: usize,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    version: u32,
    generation: u64,
    dimension: usize,
    capacity: usize,
    vectors: Vec<&'a [f32]>,
    deleted: Vec<Label>,
}

#[derive(Deserialize)]
struct Snapshot {
    version: u32,
    generation: u64,
    dimension: usize,
    capacity: usize,
    vectors: Vec<Vec<f32>>,
    deleted: Vec<Label>,
}

/// Vector index bound to one dimension
pub struct VectorIndex {
    dimension: usize,
    capacity: usize,
    generation: u64,
    vectors: Vec<VectorPoint>,
    deleted: BTreeSet<Label>,
    params: GraphParams,
    graph: Option<HnswMap<VectorPoint, Label>>,
    /// Labels `0..graph_len` are in `graph`
    graph_len: usize,
}

impl VectorIndex {
    /// Create an empty index with `capacity` preallocated slots
    pub fn new(dimension: usize, capacity: usize, params: GraphParams) -> Result<Self> {
        if dimension == 0 {
            return Err(CodevecError::Validation(
                "vector dimension must be greater than zero".to_string(),
            ));
        }

        let mut vectors = Vec::new();
        vectors.try_reserve_exact(capacity).map_err(|e| {
            CodevecError::Capacity(format!("cannot preallocate {} vectors: {}", capacity, e))
        })?;

        Ok(Self {
            dimension,
            capacity,
            generation: 0,
            vectors,
            deleted: BTreeSet::new(),
            params,
            graph: None,
            graph_len: 0,
        })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn max_elements(&self) -> usize {
        self.capacity
    }

    /// Number of labels handed out, tombstones included
    pub fn element_count(&self) -> usize {
        self.vectors.len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    pub fn live_count(&self) -> usize {
        self.vectors.len() - self.deleted.len()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn set_generation(&mut self, generation: u64) {
        self.generation = generation;
    }

    /// Whether `label` exists and is not tombstoned
    pub fn contains(&self, label: Label) -> bool {
        label < self.vectors.len() && !self.deleted.contains(&label)
    }

    pub fn is_deleted(&self, label: Label) -> bool {
        self.deleted.contains(&label)
    }

    pub fn vector(&self, label: Label) -> Option<&[f32]> {
        self.vectors.get(label).map(VectorPoint::as_slice)
    }

    pub fn live_labels(&self) -> impl Iterator<Item = Label> + '_ {
        (0..self.vectors.len()).filter(|label| !self.deleted.contains(label))
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            dimension: self.dimension,
            element_count: self.element_count(),
            live_count: self.live_count(),
            deleted_count: self.deleted_count(),
            max_elements: self.capacity,
            graph_built: self.graph.is_some(),
            unindexed_count: self.unindexed_count(),
        }
    }

    pub fn unindexed_count(&self) -> usize {
        self.vectors.len() - self.graph_len
    }

    fn check_dimension(&self, vector: &[f32], what: &str) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(CodevecError::Validation(format!(
                "{} dimension {} doesn't match index dimension {}",
                what,
                vector.len(),
                self.dimension
            )));
        }
        Ok(())
    }

    /// Insert `vector` under `label`. Labels must be handed out densely, so
    /// `label` has to equal the current element count.
    pub fn add_point(&mut self, vector: &[f32], label: Label) -> Result<()> {
        self.check_dimension(vector, "Vector")?;
        if vector.iter().any(|x| !x.is_finite()) {
            return Err(CodevecError::Validation(format!(
                "vector for label {} contains non-finite values",
                label
            )));
        }
        if label != self.vectors.len() {
            return Err(CodevecError::Validation(format!(
                "label {} out of sequence, next label is {}",
                label,
                self.vectors.len()
            )));
        }
        if label >= self.capacity {
            return Err(CodevecError::Capacity(format!(
                "index full: label {} exceeds capacity {}",
                label, self.capacity
            )));
        }

        self.vectors.push(VectorPoint::new(vector));
        log::trace!("Added vector under label {}", label);
        Ok(())
    }

    /// Tombstone a label. Returns `false` if it was already deleted.
    pub fn mark_deleted(&mut self, label: Label) -> Result<bool> {
        if label >= self.vectors.len() {
            return Err(CodevecError::Consistency(format!(
                "cannot delete label {}: index holds {} labels",
                label,
                self.vectors.len()
            )));
        }
        Ok(self.deleted.insert(label))
    }

    /// Undo a tombstone. Returns `false` if the label was live.
    pub fn restore(&mut self, label: Label) -> Result<bool> {
        if label >= self.vectors.len() {
            return Err(CodevecError::Consistency(format!(
                "cannot restore label {}: index holds {} labels",
                label,
                self.vectors.len()
            )));
        }
        Ok(self.deleted.remove(&label))
    }

    /// Grow preallocated capacity to `new_capacity`
    pub fn resize(&mut self, new_capacity: usize) -> Result<()> {
        if new_capacity < self.vectors.len() {
            return Err(CodevecError::Capacity(format!(
                "cannot shrink index to {} below its {} elements",
                new_capacity,
                self.vectors.len()
            )));
        }
        let additional = new_capacity - self.vectors.len();
        self.vectors.try_reserve_exact(additional).map_err(|e| {
            CodevecError::Capacity(format!(
                "failed to grow index to {} elements: {}",
                new_capacity, e
            ))
        })?;
        log::info!(
            "Resized vector index from {} to {} elements",
            self.capacity,
            new_capacity
        );
        self.capacity = new_capacity;
        Ok(())
    }

    fn ensure_graph(&mut self) {
        if self.unindexed_count() <= self.params.max_unindexed {
            return;
        }

        log::debug!(
            "Building HNSW graph over {} vectors (dimension {})",
            self.vectors.len(),
            self.dimension
        );
        let labels: Vec<Label> = (0..self.vectors.len()).collect();
        let graph = Builder::default()
            .ef_construction(self.params.ef_construction)
            .ef_search(self.params.ef_search)
            .seed(self.params.seed)
            .build(self.vectors.clone(), labels);
        self.graph = Some(graph);
        self.graph_len = self.vectors.len();
    }

    fn live_below(&self, end: Label) -> usize {
        end - self.deleted.range(..end).count()
    }

    /// Unsorted distances to the live vectors in `labels`
    fn scan(&self, query: &[f32], labels: Range<Label>) -> Vec<(Label, f32)> {
        let start = labels.start;
        self.vectors[labels]
            .par_iter()
            .enumerate()
            .map(|(offset, point)| (start + offset, point))
            .filter(|(label, _)| !self.deleted.contains(label))
            .map(|(label, point)| (label, cosine_distance(query, point.as_slice())))
            .collect()
    }

    /// Up to `k` live `(label, distance)` pairs, nearest first
    pub fn search_knn(&mut self, query: &[f32], k: usize) -> Result<Vec<(Label, f32)>> {
        self.check_dimension(query, "Query")?;
        if k == 0 || self.live_count() == 0 {
            return Ok(Vec::new());
        }

        self.ensure_graph();

        let mut results = Vec::with_capacity(k);
        if let Some(graph) = &self.graph {
            let point = VectorPoint::new(query);
            let mut search = Search::default();
            for item in graph.search(&point, &mut search) {
                let label = *item.value;
                if self.deleted.contains(&label) {
                    continue;
                }
                results.push((label, item.distance));
                if results.len() == k {
                    break;
                }
            }

            // Tombstones can crowd the candidate list; fall back to a full scan.
            let wanted = k.min(self.live_below(self.graph_len));
            if results.len() < wanted {
                log::debug!(
                    "Graph returned {} of {} live neighbours, using exact search",
                    results.len(),
                    wanted
                );
                return Ok(self.search_exact(query, k));
            }
        }

        results.extend(self.scan(query, self.graph_len..self.vectors.len()));
        results.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        results.truncate(k);
        Ok(results)
    }

    /// Exact k-NN over live vectors
    pub fn search_exact(&self, query: &[f32], k: usize) -> Vec<(Label, f32)> {
        let mut distances = self.scan(query, 0..self.vectors.len());
        distances.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        distances.truncate(k);
        distances
    }

    /// Build a dense copy holding only live vectors.
    ///
    /// Returns the new index (next generation) and the `(old, new)` label map.
    pub fn compacted(&self) -> Result<(VectorIndex, Vec<(Label, Label)>)> {
        let live = self.live_count();
        let mut fresh = VectorIndex::new(
            self.dimension,
            self.capacity.max(live),
            self.params.clone(),
        )?;
        fresh.generation = self.generation + 1;

        let mut remap = Vec::with_capacity(live);
        for old in self.live_labels() {
            let new = fresh.element_count();
            fresh.add_point(self.vectors[old].as_slice(), new)?;
            remap.push((old, new));
        }
        Ok((fresh, remap))
    }

    /// Write a snapshot atomically (temp file + rename)
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let snapshot = SnapshotRef {
            version: SNAPSHOT_VERSION,
            generation: self.generation,
            dimension: self.dimension,
            capacity: self.capacity,
            vectors: self.vectors.iter().map(VectorPoint::as_slice).collect(),
            deleted: self.deleted.iter().copied().collect(),
        };
        let data = bincode::serialize(&snapshot)?;

        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&tmp, path)?;

        log::debug!(
            "Saved vector index snapshot to {:?} ({} elements)",
            path,
            self.vectors.len()
        );
        Ok(())
    }

    /// Read a snapshot written by `save`
    pub fn load<P: AsRef<Path>>(path: P, params: GraphParams) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path)?;
        let snapshot: Snapshot = bincode::deserialize(&data)?;

        if snapshot.version != SNAPSHOT_VERSION {
            return Err(CodevecError::Snapshot(format!(
                "unsupported snapshot version {} in {:?}",
                snapshot.version, path
            )));
        }

        let count = snapshot.vectors.len();
        let mut index = VectorIndex::new(
            snapshot.dimension,
            snapshot.capacity.max(count),
            params,
        )?;
        index.generation = snapshot.generation;

        for (label, vector) in snapshot.vectors.into_iter().enumerate() {
            if vector.len() != snapshot.dimension {
                return Err(CodevecError::Snapshot(format!(
                    "vector {} has dimension {}, snapshot declares {}",
                    label,
                    vector.len(),
                    snapshot.dimension
                )));
            }
            index.vectors.push(VectorPoint(Arc::from(vector)));
        }
        for label in snapshot.deleted {
            if label >= count {
                return Err(CodevecError::Snapshot(format!(
                    "tombstone {} outside of {} stored vectors",
                    label, count
                )));
            }
            index.deleted.insert(label);
        }

        log::info!(
            "Loaded vector index from {:?}: {} elements, {} deleted, dimension {}",
            path,
            index.element_count(),
            index.deleted_count(),
            index.dimension
        );
        Ok(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use tempfile::tempdir;

    fn index(dimension: usize, capacity: usize) -> VectorIndex {
        VectorIndex::new(dimension, capacity, GraphParams::default()).unwrap()
    }

    #[test]
    fn test_vector_index_creation() {
        let index = index(384, 16);
        assert_eq!(index.dimension(), 384);
        assert_eq!(index.max_elements(), 16);
        assert_eq!(index.element_count(), 0);
        assert!(VectorIndex::new(0, 16, GraphParams::default()).is_err());
    }

    #[test]
    fn test_cosine_distance() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        assert_relative_eq!(cosine_distance(&a, &b), 1.0, epsilon = 1e-6);
        assert_relative_eq!(cosine_distance(&a, &a), 0.0, epsilon = 1e-6);
        assert_relative_eq!(cosine_distance(&a, &[-1.0, 0.0, 0.0]), 2.0, epsilon = 1e-6);
        assert_relative_eq!(cosine_distance(&a, &[0.0, 0.0, 0.0]), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_add_and_search_vectors() {
        let mut index = index(3, 8);
        index.add_point(&[1.0, 0.0, 0.0], 0).unwrap();
        index.add_point(&[0.0, 1.0, 0.0], 1).unwrap();
        index.add_point(&[0.0, 0.0, 1.0], 2).unwrap();

        let results = index.search_knn(&[0.9, 0.1, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, 0);
        assert!(results[0].1 <= results[1].1);
        // Small indexes are answered by the exact scan alone
        assert!(!index.stats().graph_built);
    }

    fn graph_index(dimension: usize, max_unindexed: usize) -> VectorIndex {
        let params = GraphParams {
            max_unindexed,
            ..GraphParams::default()
        };
        VectorIndex::new(dimension, 64, params).unwrap()
    }

    #[test]
    fn test_insert_after_graph_build_is_searchable() {
        let mut index = graph_index(2, 2);
        for i in 0..6 {
            let angle = i as f32 * 0.25;
            index.add_point(&[angle.cos(), angle.sin()], i).unwrap();
        }
        index.search_knn(&[1.0, 0.0], 3).unwrap();
        let stats = index.stats();
        assert!(stats.graph_built);
        assert_eq!(stats.unindexed_count, 0);

        // The new vector lands in the tail and is found without a rebuild
        index.add_point(&[0.0, -1.0], 6).unwrap();
        let results = index.search_knn(&[0.0, -1.0], 1).unwrap();
        assert_eq!(results[0].0, 6);
        assert_relative_eq!(results[0].1, 0.0, epsilon = 1e-6);
        let stats = index.stats();
        assert!(stats.graph_built);
        assert_eq!(stats.unindexed_count, 1);

        // Tail results merge with graph results in distance order
        let results = index.search_knn(&[1.0, 0.0], 7).unwrap();
        assert_eq!(results.len(), 7);
        assert_eq!(results[0].0, 0);
        assert_eq!(results[6].0, 6);
        assert!(results.windows(2).all(|w| w[0].1 <= w[1].1));
    }

    #[test]
    fn test_long_tail_triggers_rebuild() {
        let mut index = graph_index(2, 2);
        for i in 0..4 {
            index.add_point(&[1.0, i as f32], i).unwrap();
        }
        index.search_knn(&[1.0, 0.0], 1).unwrap();
        assert_eq!(index.stats().unindexed_count, 0);

        for i in 4..7 {
            index.add_point(&[1.0, i as f32], i).unwrap();
        }
        assert_eq!(index.stats().unindexed_count, 3);
        index.search_knn(&[1.0, 0.0], 1).unwrap();
        assert_eq!(index.stats().unindexed_count, 0);
    }

    #[test]
    fn test_tombstoned_tail_labels_excluded() {
        let mut index = graph_index(2, 1);
        index.add_point(&[1.0, 0.0], 0).unwrap();
        index.add_point(&[0.0, 1.0], 1).unwrap();
        index.search_knn(&[1.0, 0.0], 1).unwrap();

        index.add_point(&[1.0, 0.01], 2).unwrap();
        index.mark_deleted(2).unwrap();
        let results = index.search_knn(&[1.0, 0.0], 3).unwrap();
        assert_eq!(results.iter().map(|r| r.0).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn test_restore_undoes_tombstone() {
        let mut index = index(2, 4);
        index.add_point(&[1.0, 0.0], 0).unwrap();
        index.mark_deleted(0).unwrap();
        assert!(index.restore(0).unwrap());
        assert!(!index.restore(0).unwrap());
        assert!(index.contains(0));
        assert!(index.restore(3).is_err());
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut index = index(3, 8);
        let err = index.add_point(&[1.0, 0.0], 0).unwrap_err();
        assert!(err.is_validation());
        assert_eq!(index.element_count(), 0);
        assert!(index.search_knn(&[1.0, 0.0], 1).unwrap_err().is_validation());
    }

    #[test]
    fn test_labels_must_be_dense() {
        let mut index = index(2, 8);
        assert!(index.add_point(&[1.0, 0.0], 1).unwrap_err().is_validation());
        index.add_point(&[1.0, 0.0], 0).unwrap();
        assert!(index.add_point(&[1.0, 0.0], 0).unwrap_err().is_validation());
    }

    #[test]
    fn test_capacity_and_resize() {
        let mut index = index(2, 2);
        index.add_point(&[1.0, 0.0], 0).unwrap();
        index.add_point(&[0.0, 1.0], 1).unwrap();
        assert!(index.add_point(&[1.0, 1.0], 2).unwrap_err().is_capacity());

        index.resize(4).unwrap();
        assert_eq!(index.max_elements(), 4);
        index.add_point(&[1.0, 1.0], 2).unwrap();
        assert_eq!(index.element_count(), 3);

        assert!(index.resize(1).unwrap_err().is_capacity());
    }

    #[test]
    fn test_deleted_labels_excluded() {
        let mut index = index(2, 8);
        index.add_point(&[1.0, 0.0], 0).unwrap();
        index.add_point(&[0.9, 0.1], 1).unwrap();
        index.add_point(&[0.0, 1.0], 2).unwrap();

        assert!(index.mark_deleted(0).unwrap());
        assert!(!index.mark_deleted(0).unwrap());
        assert!(index.mark_deleted(17).is_err());

        let results = index.search_knn(&[1.0, 0.0], 3).unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(label, _)| *label != 0));
        assert_eq!(index.live_count(), 2);
        assert_eq!(index.element_count(), 3);
    }

    #[test]
    fn test_all_deleted_returns_empty() {
        let mut index = index(2, 4);
        index.add_point(&[1.0, 0.0], 0).unwrap();
        index.mark_deleted(0).unwrap();
        assert!(index.search_knn(&[1.0, 0.0], 5).unwrap().is_empty());
    }

    #[test]
    fn test_compacted_remaps_live_labels() {
        let mut index = index(2, 8);
        for i in 0..5 {
            index.add_point(&[1.0, i as f32], i).unwrap();
        }
        index.mark_deleted(1).unwrap();
        index.mark_deleted(3).unwrap();

        let (fresh, remap) = index.compacted().unwrap();
        assert_eq!(remap, vec![(0, 0), (2, 1), (4, 2)]);
        assert_eq!(fresh.element_count(), 3);
        assert_eq!(fresh.deleted_count(), 0);
        assert_eq!(fresh.generation(), index.generation() + 1);
        assert_eq!(fresh.vector(1), index.vector(2));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors-2.idx");

        let mut index = index(2, 4);
        index.add_point(&[1.0, 0.0], 0).unwrap();
        index.add_point(&[0.0, 1.0], 1).unwrap();
        index.mark_deleted(1).unwrap();
        index.set_generation(3);
        index.save(&path).unwrap();

        let loaded = VectorIndex::load(&path, GraphParams::default()).unwrap();
        assert_eq!(loaded.dimension(), 2);
        assert_eq!(loaded.max_elements(), 4);
        assert_eq!(loaded.element_count(), 2);
        assert!(loaded.is_deleted(1));
        assert_eq!(loaded.generation(), 3);
        assert_eq!(loaded.vector(0), Some(&[1.0f32, 0.0][..]));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vectors-2.idx");
        std::fs::write(&path, b"definitely not a snapshot").unwrap();
        assert!(VectorIndex::load(&path, GraphParams::default()).is_err());
    }
}
