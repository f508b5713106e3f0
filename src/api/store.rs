//! EmbeddingStore - the storage engine handle
//!
//! One store owns one directory: the SQLite metadata database plus one
//! vector snapshot per embedding dimension. All operations go through a
//! single async mutex, so the database connection and the index see one
//! writer at a time.
//!
//! Embedding rows and index entries are kept 1:1. The index is persisted as
//! a best-effort checkpoint after each ingest, and `reconcile` repairs the
//! two stores after a crash between a metadata commit and the next snapshot.

use crate::api::search::{self, SearchOptions, SearchResult};
use crate::config::Config;
use crate::error::{CodevecError, Result};
use crate::storage::schema::keys;
use crate::storage::{
    ChunkId, ChunkRecord, ChunkStructure, Database, EmbeddingRecord, FileId, FileRecord,
    FileUpsert, Label,
};
use crate::utils::{content_hash, ensure_directory, millis_to_datetime, now_millis};
use crate::vector::{BindOutcome, IndexManager, IndexStats};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Combined metadata and index statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub file_count: usize,
    pub chunk_count: usize,
    pub embedding_count: usize,
    pub database_size_bytes: u64,
    pub last_indexed_at: Option<DateTime<Utc>>,
    pub embedding_model: Option<String>,
    /// `None` until a dimension is bound
    pub index: Option<IndexStats>,
}

/// What `reconcile` had to repair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    /// Snapshot and metadata disagreed on the index generation; every
    /// embedding was discarded
    pub generation_mismatch: bool,
    /// Embedding rows removed because their label is not live in the index
    pub dropped_rows: usize,
    /// Files flagged for re-embedding
    pub flagged_files: usize,
    /// Live index labels with no embedding row, now tombstoned
    pub tombstoned_labels: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        !self.generation_mismatch && self.dropped_rows == 0 && self.tombstoned_labels == 0
    }
}

/// Result of rebuilding the index from live vectors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionReport {
    pub removed: usize,
    pub live: usize,
    pub generation: u64,
}

struct StoreInner {
    db: Database,
    index: IndexManager,
}

impl StoreInner {
    fn stored_dimension(&self) -> Result<Option<usize>> {
        match self.db.get_metadata(keys::EMBEDDING_DIMENSION)? {
            Some(raw) => raw.parse::<usize>().map(Some).map_err(|e| {
                CodevecError::Consistency(format!("invalid stored dimension '{}': {}", raw, e))
            }),
            None => Ok(None),
        }
    }

    fn stored_generation(&self) -> Result<u64> {
        match self.db.get_metadata(keys::INDEX_GENERATION)? {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                CodevecError::Consistency(format!("invalid index generation '{}': {}", raw, e))
            }),
            None => Ok(0),
        }
    }

    fn bind(&mut self, dimension: usize) -> Result<BindOutcome> {
        if dimension == 0 {
            return Err(CodevecError::Validation(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        if let Some(stored) = self.stored_dimension()? {
            if stored != dimension {
                log::info!(
                    "Embedding dimension changed from {} to {}; existing embeddings discarded",
                    stored,
                    dimension
                );
                self.start_fresh(dimension, None)?;
                return Ok(BindOutcome::Fresh);
            }
        }

        let outcome = self.index.bind_dimension(dimension)?;
        self.db
            .set_metadata(keys::EMBEDDING_DIMENSION, &dimension.to_string())?;
        let report = self.reconcile()?;
        if !report.is_clean() {
            log::warn!("Reconciled store after binding dimension {}: {:?}", dimension, report);
        }
        Ok(outcome)
    }

    /// Drop every embedding and start an empty index for `dimension` at a
    /// new generation. Returns the number of rows dropped.
    fn start_fresh(&mut self, dimension: usize, model: Option<&str>) -> Result<usize> {
        let generation = self
            .stored_generation()?
            .max(self.index.generation().unwrap_or(0))
            + 1;
        let dropped = self.db.transaction(|db| {
            let dropped = db.drop_all_embeddings()?;
            if let Some(model) = model {
                db.set_metadata(keys::EMBEDDING_MODEL, model)?;
            }
            db.set_metadata(keys::EMBEDDING_DIMENSION, &dimension.to_string())?;
            db.set_metadata(keys::INDEX_GENERATION, &generation.to_string())?;
            Ok(dropped)
        })?;
        self.index.reset(dimension, generation)?;
        self.checkpoint();
        log::debug!(
            "Dropped {} embedding rows; index for dimension {} restarts at generation {}",
            dropped,
            dimension,
            generation
        );
        Ok(dropped)
    }

    /// Tombstone labels in the bound index; returns the newly deleted ones
    fn tombstone(&mut self, labels: &[Label]) -> Vec<Label> {
        if labels.is_empty() || !self.index.is_bound() {
            return Vec::new();
        }
        let mut removed = Vec::with_capacity(labels.len());
        for &label in labels {
            match self.index.mark_deleted(label) {
                Ok(true) => removed.push(label),
                Ok(false) => {}
                Err(e) => log::warn!("Could not tombstone label {}: {}", label, e),
            }
        }
        removed
    }

    /// Run a metadata write that follows `tombstoned`; if it fails, the
    /// labels are live again so rows and index still agree.
    fn after_tombstone<T>(
        &mut self,
        tombstoned: Vec<Label>,
        write: impl FnOnce(&mut Database) -> Result<T>,
    ) -> Result<T> {
        let outcome = write(&mut self.db);
        if let Err(e) = &outcome {
            if !tombstoned.is_empty() {
                log::warn!(
                    "Metadata write failed, restoring {} tombstoned labels: {}",
                    tombstoned.len(),
                    e
                );
            }
            for label in tombstoned {
                if let Err(err) = self.index.restore(label) {
                    log::warn!("Could not restore label {}: {}", label, err);
                }
            }
        }
        outcome
    }

    fn checkpoint(&self) {
        if !self.index.is_bound() {
            return;
        }
        if let Err(e) = self.index.persist() {
            log::warn!("Failed to persist vector index: {}", e);
        }
    }

    fn reconcile(&mut self) -> Result<ReconcileReport> {
        let mut report = ReconcileReport::default();
        let (Some(index_generation), Some(stats)) = (self.index.generation(), self.index.stats())
        else {
            return Ok(report);
        };
        let stored_generation = self.stored_generation()?;
        let bindings = self.db.embedding_labels()?;

        if stored_generation != index_generation {
            let generation = stored_generation.max(index_generation);
            if bindings.is_empty() && stats.element_count == 0 {
                self.index.set_generation(generation)?;
                self.db
                    .set_metadata(keys::INDEX_GENERATION, &generation.to_string())?;
                return Ok(report);
            }

            log::warn!(
                "Index snapshot generation {} does not match metadata generation {}; \
                 discarding {} embeddings for re-embedding",
                index_generation,
                stored_generation,
                bindings.len()
            );
            let generation = generation + 1;
            report.generation_mismatch = true;
            report.flagged_files = self.db.get_stats()?.file_count;
            report.dropped_rows = self.db.transaction(|db| {
                let dropped = db.drop_all_embeddings()?;
                db.set_metadata(keys::INDEX_GENERATION, &generation.to_string())?;
                Ok(dropped)
            })?;
            self.index.reset(stats.dimension, generation)?;
            self.checkpoint();
            return Ok(report);
        }

        let (orphans, unbacked) = {
            let index = self.index.index().ok_or(CodevecError::IndexNotBound)?;
            let orphans: Vec<Label> = bindings
                .iter()
                .map(|b| b.label)
                .filter(|&label| !index.contains(label) || index.is_deleted(label))
                .collect();
            let bound: HashSet<Label> = bindings.iter().map(|b| b.label).collect();
            let unbacked: Vec<Label> = index
                .live_labels()
                .filter(|label| !bound.contains(label))
                .collect();
            (orphans, unbacked)
        };

        if !orphans.is_empty() {
            log::warn!(
                "{} embedding rows reference labels missing from the index; flagging their files",
                orphans.len()
            );
            let files = self.db.drop_embeddings_for_labels(&orphans)?;
            report.dropped_rows = orphans.len();
            report.flagged_files = files.len();
        }
        if !unbacked.is_empty() {
            log::warn!(
                "{} index labels have no embedding row; tombstoning them",
                unbacked.len()
            );
            report.tombstoned_labels = self.tombstone(&unbacked).len();
        }

        self.db
            .set_metadata(keys::INDEX_GENERATION, &index_generation.to_string())?;
        if report.tombstoned_labels > 0 {
            self.checkpoint();
        }
        Ok(report)
    }
}

/// Hybrid metadata + vector storage engine
pub struct EmbeddingStore {
    directory: PathBuf,
    config: Config,
    inner: Mutex<StoreInner>,
}

impl EmbeddingStore {
    /// Open (or create) the store in `directory`.
    ///
    /// If a dimension was bound in an earlier session, its snapshot is
    /// restored and reconciled against the metadata.
    pub async fn open<P: AsRef<Path>>(directory: P, config: Config) -> Result<Self> {
        config.validate()?;
        let directory = directory.as_ref().to_path_buf();
        ensure_directory(&directory)?;

        let db = Database::open(
            directory.join(&config.storage.database_file),
            &config.storage,
        )?;
        let index = IndexManager::new(&directory, config.index.clone());
        let mut inner = StoreInner { db, index };

        if let Some(dimension) = inner.stored_dimension()? {
            let outcome = inner.bind(dimension)?;
            log::info!("Restored index for dimension {}: {:?}", dimension, outcome);
        }

        log::info!("EmbeddingStore opened at {:?}", directory);
        Ok(Self {
            directory,
            config,
            inner: Mutex::new(inner),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Search options carrying the configured defaults
    pub fn default_search_options(&self) -> SearchOptions {
        SearchOptions::from_config(&self.config.search)
    }

    pub async fn dimension(&self) -> Option<usize> {
        self.inner.lock().await.index.dimension()
    }

    /// Record the active embedding model and bind its dimension.
    ///
    /// The same model as last time restores its snapshot. A different model
    /// (or the same name with another width) discards every embedding, flags
    /// all files for re-embedding and starts a fresh index.
    pub async fn set_embedding_model(&self, model: &str, dimension: usize) -> Result<BindOutcome> {
        if dimension == 0 {
            return Err(CodevecError::Validation(
                "embedding dimension must be greater than zero".to_string(),
            ));
        }
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let current_model = inner.db.get_metadata(keys::EMBEDDING_MODEL)?;
        let current_dimension = inner.stored_dimension()?;
        let changed = match &current_model {
            Some(current) => current != model || current_dimension != Some(dimension),
            None => false,
        };

        if !changed {
            inner.db.set_metadata(keys::EMBEDDING_MODEL, model)?;
            return inner.bind(dimension);
        }

        log::info!(
            "Embedding model changed from {:?} ({:?}d) to {} ({}d); existing embeddings discarded",
            current_model,
            current_dimension,
            model,
            dimension
        );
        inner.start_fresh(dimension, Some(model))?;
        Ok(BindOutcome::Fresh)
    }

    /// Bind the index to `dimension` without changing the recorded model.
    ///
    /// A dimension other than the recorded one discards every embedding and
    /// starts an empty index, like a model change.
    pub async fn bind_dimension(&self, dimension: usize) -> Result<BindOutcome> {
        self.inner.lock().await.bind(dimension)
    }

    /// Create or update a file row. Changed content soft-deletes the file's
    /// labels before its chunks and embedding rows are removed.
    pub async fn upsert_file(&self, path: &str, content: &str) -> Result<FileUpsert> {
        let mut guard = self.inner.lock().await;
        let mut tombstoned = Vec::new();
        if let Some(existing) = guard.db.get_file_by_path(path)? {
            if existing.content_hash != content_hash(content) {
                let labels = guard.db.labels_for_file(existing.id)?;
                tombstoned = guard.tombstone(&labels);
                log::debug!(
                    "Tombstoned {} labels for changed file {}",
                    tombstoned.len(),
                    path
                );
            }
        }
        guard.after_tombstone(tombstoned, |db| db.upsert_file(path, content))
    }

    /// Replace a file's chunks with a new batch from the chunking pipeline.
    ///
    /// The parallel arrays are validated before any label is tombstoned or
    /// any row written.
    pub async fn replace_chunks<S: AsRef<str>>(
        &self,
        file_id: FileId,
        contents: &[S],
        offsets: &[(usize, usize)],
        structure: Option<&[ChunkStructure]>,
    ) -> Result<Vec<ChunkRecord>> {
        crate::storage::database::validate_chunk_batch(contents.len(), offsets, structure)?;

        let mut guard = self.inner.lock().await;
        let labels = guard.db.labels_for_file(file_id)?;
        let tombstoned = guard.tombstone(&labels);
        guard.after_tombstone(tombstoned, |db| {
            db.replace_chunks(file_id, contents, offsets, structure)
        })
    }

    /// Insert vectors for chunks and record their labels.
    ///
    /// Labels continue from the index's element count. Index inserts and
    /// embedding rows happen inside one metadata transaction; if anything
    /// fails, labels already added to the index are tombstoned and the rows
    /// roll back. The index is checkpointed after a successful commit.
    pub async fn store_embeddings(
        &self,
        pairs: &[(ChunkId, Vec<f32>)],
    ) -> Result<Vec<EmbeddingRecord>> {
        let mut guard = self.inner.lock().await;
        let StoreInner { db, index } = &mut *guard;

        let dimension = index.dimension().ok_or(CodevecError::IndexNotBound)?;
        for (chunk_id, vector) in pairs {
            if vector.len() != dimension {
                return Err(CodevecError::Validation(format!(
                    "embedding for chunk {} has dimension {}, index expects {}",
                    chunk_id,
                    vector.len(),
                    dimension
                )));
            }
            if vector.iter().any(|x| !x.is_finite()) {
                return Err(CodevecError::Validation(format!(
                    "embedding for chunk {} contains non-finite values",
                    chunk_id
                )));
            }
        }
        if pairs.is_empty() {
            return Ok(Vec::new());
        }

        let mut inserted: Vec<Label> = Vec::with_capacity(pairs.len());
        let outcome = db.transaction(|db| {
            let mut label = index.next_label()?;
            let mut records = Vec::with_capacity(pairs.len());
            for (chunk_id, vector) in pairs {
                index.ensure_capacity(label + 1)?;
                index.add_point(vector, label)?;
                inserted.push(label);
                records.push(db.insert_embedding(*chunk_id, label)?);
                label += 1;
            }
            let chunk_ids: Vec<ChunkId> = pairs.iter().map(|(chunk_id, _)| *chunk_id).collect();
            db.mark_chunk_files_indexed(&chunk_ids)?;
            db.set_metadata(keys::LAST_INDEXED_AT, &now_millis().to_string())?;
            Ok(records)
        });

        match outcome {
            Ok(records) => {
                log::debug!(
                    "Stored {} embeddings (labels {:?}..={:?})",
                    records.len(),
                    inserted.first(),
                    inserted.last()
                );
                if let Err(e) = index.persist() {
                    log::warn!("Failed to persist vector index after ingest: {}", e);
                }
                Ok(records)
            }
            Err(e) => {
                if !inserted.is_empty() {
                    log::warn!(
                        "Embedding batch failed after {} index inserts; tombstoning them: {}",
                        inserted.len(),
                        e
                    );
                    for &label in &inserted {
                        if let Err(err) = index.mark_deleted(label) {
                            log::warn!("Could not tombstone label {}: {}", label, err);
                        }
                    }
                }
                if e.is_capacity() {
                    log::error!("Vector index capacity exhausted: {}", e);
                }
                Err(e)
            }
        }
    }

    /// Nearest chunks to `query`. Any failure is logged and yields no results.
    pub async fn search(&self, query: &[f32], options: SearchOptions) -> Vec<SearchResult> {
        let mut guard = self.inner.lock().await;
        let StoreInner { db, index } = &mut *guard;
        match search::execute(db, index, query, &options, &self.config.search) {
            Ok(results) => results,
            Err(e) => {
                log::warn!("Search failed, returning no results: {}", e);
                Vec::new()
            }
        }
    }

    pub async fn delete_chunks_for_file(&self, file_id: FileId) -> Result<usize> {
        let mut guard = self.inner.lock().await;
        let labels = guard.db.labels_for_file(file_id)?;
        let tombstoned = guard.tombstone(&labels);
        guard.after_tombstone(tombstoned, |db| db.delete_chunks_for_file(file_id))
    }

    /// Remove a file with its chunks and embeddings, tombstoning its labels first
    pub async fn delete_file(&self, path: &str) -> Result<Option<FileRecord>> {
        let mut guard = self.inner.lock().await;
        let Some(file) = guard.db.get_file_by_path(path)? else {
            return Ok(None);
        };
        let labels = guard.db.labels_for_file(file.id)?;
        let tombstoned = guard.tombstone(&labels);
        log::debug!(
            "Tombstoned {} labels for deleted file {}",
            tombstoned.len(),
            path
        );
        guard.after_tombstone(tombstoned, |db| db.delete_file(path))
    }

    pub async fn mark_file_indexed(&self, file_id: FileId, indexed: bool) -> Result<()> {
        self.inner.lock().await.db.mark_file_indexed(file_id, indexed)
    }

    pub async fn get_file(&self, file_id: FileId) -> Result<Option<FileRecord>> {
        self.inner.lock().await.db.get_file(file_id)
    }

    pub async fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        self.inner.lock().await.db.get_file_by_path(path)
    }

    pub async fn get_files_to_index(&self) -> Result<Vec<FileRecord>> {
        self.inner.lock().await.db.get_files_to_index()
    }

    pub async fn get_chunk(&self, chunk_id: ChunkId) -> Result<Option<ChunkRecord>> {
        self.inner.lock().await.db.get_chunk(chunk_id)
    }

    pub async fn get_file_chunks(&self, file_id: FileId) -> Result<Vec<ChunkRecord>> {
        self.inner.lock().await.db.get_file_chunks(file_id)
    }

    pub async fn get_adjacent_chunks(
        &self,
        chunk_id: ChunkId,
        window: usize,
    ) -> Result<Vec<ChunkRecord>> {
        self.inner.lock().await.db.get_adjacent_chunks(chunk_id, window)
    }

    pub async fn get_complete_structure_for_chunk(
        &self,
        chunk_id: ChunkId,
    ) -> Result<Option<ChunkRecord>> {
        self.inner
            .lock()
            .await
            .db
            .get_complete_structure_for_chunk(chunk_id)
    }

    pub async fn get_embedding_for_chunk(
        &self,
        chunk_id: ChunkId,
    ) -> Result<Option<EmbeddingRecord>> {
        self.inner.lock().await.db.get_embedding_for_chunk(chunk_id)
    }

    pub async fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        self.inner.lock().await.db.get_metadata(key)
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats> {
        let guard = self.inner.lock().await;
        let db_stats = guard.db.get_stats()?;
        let last_indexed_at = guard
            .db
            .get_metadata(keys::LAST_INDEXED_AT)?
            .and_then(|raw| raw.parse::<i64>().ok())
            .map(millis_to_datetime);

        Ok(StorageStats {
            file_count: db_stats.file_count,
            chunk_count: db_stats.chunk_count,
            embedding_count: db_stats.embedding_count,
            database_size_bytes: db_stats.database_size_bytes,
            last_indexed_at,
            embedding_model: guard.db.get_metadata(keys::EMBEDDING_MODEL)?,
            index: guard.index.stats(),
        })
    }

    /// Bring embedding rows and index labels back into 1:1 correspondence
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let report = self.inner.lock().await.reconcile()?;
        if report.is_clean() {
            log::debug!("Reconcile found nothing to repair");
        } else {
            log::info!("Reconcile repaired store: {:?}", report);
        }
        Ok(report)
    }

    /// Rebuild the index from live vectors and relabel embedding rows densely
    pub async fn compact(&self) -> Result<CompactionReport> {
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;
        if !inner.index.is_bound() {
            return Err(CodevecError::IndexNotBound);
        }

        // Rows pointing at dead labels would collide with the new numbering.
        inner.reconcile()?;

        let (fresh, remap) = inner.index.compacted()?;
        let removed = inner
            .index
            .stats()
            .map(|s| s.element_count - s.live_count)
            .unwrap_or(0);
        let live = remap.len();
        let generation = fresh.generation();

        inner.db.transaction(|db| {
            db.relabel_embeddings(&remap)?;
            db.set_metadata(keys::INDEX_GENERATION, &generation.to_string())
        })?;
        inner.index.install(fresh)?;
        inner.index.persist().map_err(|e| {
            log::error!(
                "Compacted index could not be persisted; the next open will discard embeddings: {}",
                e
            );
            e
        })?;

        log::info!(
            "Compacted vector index: {} live, {} tombstones removed, generation {}",
            live,
            removed,
            generation
        );
        Ok(CompactionReport {
            removed,
            live,
            generation,
        })
    }

    /// Compact when tombstones exceed the configured ratio and floor
    pub async fn compact_if_needed(&self) -> Result<Option<CompactionReport>> {
        let needed = {
            let guard = self.inner.lock().await;
            match guard.index.stats() {
                Some(stats) if stats.element_count > 0 => {
                    let ratio = stats.deleted_count as f32 / stats.element_count as f32;
                    stats.deleted_count >= self.config.index.compaction_min_deleted
                        && ratio >= self.config.index.compaction_threshold
                }
                _ => false,
            }
        };
        if !needed {
            return Ok(None);
        }
        self.compact().await.map(Some)
    }

    /// Write the index snapshot now
    pub async fn checkpoint(&self) -> Result<()> {
        let guard = self.inner.lock().await;
        if guard.index.is_bound() {
            guard.index.persist()?;
        }
        Ok(())
    }

    /// Flush the index (best effort) and close the database
    pub async fn close(self) -> Result<()> {
        let inner = self.inner.into_inner();
        inner.checkpoint();
        inner.db.close()?;
        log::info!("EmbeddingStore closed at {:?}", self.directory);
        Ok(())
    }
}
