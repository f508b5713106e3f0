//! SQLite database operations for codevec
//!
//! This module owns the single metadata connection: files, chunks, the
//! embedding rows that tie chunks to index labels, and key-value settings.

use crate::config::StorageConfig;
use crate::error::{CodevecError, Result};
use crate::storage::models::*;
use crate::storage::schema::*;
use crate::storage::transaction::TransactionState;
use crate::utils::{content_hash, detect_language, now_millis};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// SQLite caps bound parameters per statement; stay well below it.
const MAX_BATCH_PARAMS: usize = 500;

/// Database connection and operations
pub struct Database {
    conn: Connection,
    path: Option<PathBuf>,
    txn: TransactionState,
}

impl Database {
    /// Open (or create) the database file
    pub fn open<P: AsRef<Path>>(path: P, config: &StorageConfig) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|e| {
            CodevecError::Connection(format!("Failed to open database {:?}: {}", path, e))
        })?;

        let mut db = Self {
            conn,
            path: Some(path.to_path_buf()),
            txn: TransactionState::default(),
        };
        db.initialize(config)?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| {
            CodevecError::Connection(format!("Failed to create in-memory database: {}", e))
        })?;

        let mut db = Self {
            conn,
            path: None,
            txn: TransactionState::default(),
        };
        db.initialize(&StorageConfig::default())?;
        Ok(db)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Pragmas and idempotent schema creation
    fn initialize(&mut self, config: &StorageConfig) -> Result<()> {
        // In-memory databases report "memory" here, which is fine.
        let journal_mode: String =
            self.conn
                .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;

        let synchronous = match config.synchronous.to_ascii_uppercase().as_str() {
            "OFF" => 0,
            "NORMAL" => 1,
            "FULL" => 2,
            "EXTRA" => 3,
            other => {
                return Err(CodevecError::Config(format!(
                    "unknown synchronous level '{}'",
                    other
                )));
            }
        };
        self.conn.pragma_update(None, "synchronous", synchronous)?;
        self.conn.pragma_update(None, "foreign_keys", 1)?;
        self.conn
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

        self.conn.execute_batch(CREATE_FILES_TABLE)?;
        self.conn.execute_batch(CREATE_CHUNKS_TABLE)?;
        self.conn.execute_batch(CREATE_EMBEDDINGS_TABLE)?;
        self.conn.execute_batch(CREATE_METADATA_TABLE)?;
        self.conn.execute_batch(CREATE_INDEXES)?;

        self.set_metadata(keys::SCHEMA_VERSION, &SCHEMA_VERSION.to_string())?;

        log::info!(
            "Database initialized with schema version {} (journal_mode={})",
            SCHEMA_VERSION,
            journal_mode
        );
        Ok(())
    }

    /// Run `f` atomically. Nested calls join the outer transaction and only
    /// the outermost call commits (on `Ok`) or rolls back (on `Err`).
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Database) -> Result<T>,
    {
        self.txn.enter(&self.conn)?;
        let result = f(self);
        match self.txn.exit(&self.conn, result.is_ok()) {
            Ok(()) => result,
            Err(exit_err) => match result {
                // Report the failure that caused the rollback.
                Err(e) => {
                    log::error!("Rollback failed after error '{}': {}", e, exit_err);
                    Err(e)
                }
                Ok(_) => Err(exit_err),
            },
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.txn.is_active()
    }

    // ---------------------------------------------------------------------
    // Files
    // ---------------------------------------------------------------------

    /// Create or update the file row for `path`.
    ///
    /// Unchanged content is a no-op. Changed content resets `is_indexed` and
    /// cascades deletion of the file's chunks and embedding rows.
    pub fn upsert_file(&mut self, path: &str, content: &str) -> Result<FileUpsert> {
        let hash = content_hash(content);
        let existing = self.get_file_by_path(path)?;

        if let Some(file) = &existing {
            if file.content_hash == hash {
                log::debug!("File {} unchanged, skipping re-index", path);
                return Ok(FileUpsert::Unchanged(file.clone()));
            }
        }

        let language = detect_language(path);
        let size_bytes = content.len() as i64;
        let now = now_millis();

        let record = self.transaction(|db| {
            let id = match &existing {
                Some(file) => {
                    let removed = db
                        .conn
                        .execute("DELETE FROM chunks WHERE file_id = ?1", params![file.id])?;
                    db.conn.execute(
                        "UPDATE files SET content_hash = ?1, last_modified = ?2, language = ?3, \
                         is_indexed = 0, size_bytes = ?4 WHERE id = ?5",
                        params![hash, now, language, size_bytes, file.id],
                    )?;
                    log::debug!("File {} changed, removed {} stale chunks", path, removed);
                    file.id
                }
                None => {
                    db.conn.execute(
                        "INSERT INTO files (path, content_hash, last_modified, language, is_indexed, size_bytes) \
                         VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                        params![path, hash, now, language, size_bytes],
                    )?;
                    db.conn.last_insert_rowid()
                }
            };
            db.get_file(id)?.ok_or_else(|| {
                CodevecError::Consistency(format!("File row {} vanished during upsert", id))
            })
        })?;

        Ok(FileUpsert::Changed(record))
    }

    pub fn get_file(&self, file_id: FileId) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {} FROM files WHERE id = ?1", FILE_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![file_id], FileRecord::from_row)
            .optional()?)
    }

    pub fn get_file_by_path(&self, path: &str) -> Result<Option<FileRecord>> {
        let sql = format!("SELECT {} FROM files WHERE path = ?1", FILE_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![path], FileRecord::from_row)
            .optional()?)
    }

    /// Files whose chunks/embeddings still need to be produced
    pub fn get_files_to_index(&self) -> Result<Vec<FileRecord>> {
        let sql = format!(
            "SELECT {} FROM files WHERE is_indexed = 0 ORDER BY path",
            FILE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let files = stmt
            .query_map([], FileRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(files)
    }

    pub fn mark_file_indexed(&mut self, file_id: FileId, indexed: bool) -> Result<()> {
        self.conn.execute(
            "UPDATE files SET is_indexed = ?1 WHERE id = ?2",
            params![indexed, file_id],
        )?;
        Ok(())
    }

    /// Remove a file and, through foreign keys, its chunks and embedding rows
    pub fn delete_file(&mut self, path: &str) -> Result<Option<FileRecord>> {
        let Some(file) = self.get_file_by_path(path)? else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM files WHERE id = ?1", params![file.id])?;
        log::info!("Deleted file {} (id {})", path, file.id);
        Ok(Some(file))
    }

    // ---------------------------------------------------------------------
    // Chunks
    // ---------------------------------------------------------------------

    /// Replace every chunk of `file_id` with a new batch.
    ///
    /// `contents`, `offsets` and (when given) `structure` are parallel arrays.
    /// Any mismatch fails with a validation error before anything is written.
    pub fn replace_chunks<S: AsRef<str>>(
        &mut self,
        file_id: FileId,
        contents: &[S],
        offsets: &[(usize, usize)],
        structure: Option<&[ChunkStructure]>,
    ) -> Result<Vec<ChunkRecord>> {
        validate_chunk_batch(contents.len(), offsets, structure)?;

        let default_structure = ChunkStructure::default();
        self.transaction(|db| {
            if db.get_file(file_id)?.is_none() {
                return Err(CodevecError::Validation(format!(
                    "Cannot store chunks for unknown file id {}",
                    file_id
                )));
            }
            db.conn
                .execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])?;

            let mut records = Vec::with_capacity(contents.len());
            {
                let mut stmt = db.conn.prepare(
                    "INSERT INTO chunks (file_id, content, start_offset, end_offset, token_count, \
                     structure_order, is_oversized, structure_type) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                )?;

                for (i, (content, &(start, end))) in contents.iter().zip(offsets).enumerate() {
                    let meta = structure.map(|s| &s[i]).unwrap_or(&default_structure);
                    stmt.execute(params![
                        file_id,
                        content.as_ref(),
                        start as i64,
                        end as i64,
                        meta.token_count.map(i64::from),
                        meta.structure_order.map(i64::from),
                        meta.is_oversized,
                        meta.structure_type,
                    ])?;

                    records.push(ChunkRecord {
                        id: db.conn.last_insert_rowid(),
                        file_id,
                        content: content.as_ref().to_string(),
                        start_offset: start,
                        end_offset: end,
                        token_count: meta.token_count,
                        parent_structure_id: None,
                        structure_order: meta.structure_order,
                        is_oversized: meta.is_oversized,
                        structure_type: meta.structure_type.clone(),
                    });
                }
            }

            // Parents are resolved once every id in the batch is known.
            if let Some(structure) = structure {
                let mut stmt = db
                    .conn
                    .prepare("UPDATE chunks SET parent_structure_id = ?1 WHERE id = ?2")?;
                for (i, meta) in structure.iter().enumerate() {
                    if let Some(parent) = meta.parent_index {
                        let parent_id = records[parent].id;
                        stmt.execute(params![parent_id, records[i].id])?;
                        records[i].parent_structure_id = Some(parent_id);
                    }
                }
            }

            log::debug!("Stored {} chunks for file {}", records.len(), file_id);
            Ok(records)
        })
    }

    pub fn get_chunk(&self, chunk_id: ChunkId) -> Result<Option<ChunkRecord>> {
        let sql = format!("SELECT {} FROM chunks WHERE id = ?1", CHUNK_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![chunk_id], ChunkRecord::from_row)
            .optional()?)
    }

    /// All chunks of a file ordered by start offset
    pub fn get_file_chunks(&self, file_id: FileId) -> Result<Vec<ChunkRecord>> {
        let sql = format!(
            "SELECT {} FROM chunks WHERE file_id = ?1 ORDER BY start_offset, id",
            CHUNK_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let chunks = stmt
            .query_map(params![file_id], ChunkRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(chunks)
    }

    /// Up to `window` chunks on each side of `chunk_id` in the same file, in
    /// offset order. The target chunk itself is not included.
    pub fn get_adjacent_chunks(&self, chunk_id: ChunkId, window: usize) -> Result<Vec<ChunkRecord>> {
        let Some(target) = self.get_chunk(chunk_id)? else {
            return Ok(Vec::new());
        };
        if window == 0 {
            return Ok(Vec::new());
        }

        let before_sql = format!(
            "SELECT {} FROM chunks WHERE file_id = ?1 \
             AND (start_offset < ?2 OR (start_offset = ?2 AND id < ?3)) \
             ORDER BY start_offset DESC, id DESC LIMIT ?4",
            CHUNK_COLUMNS
        );
        let after_sql = format!(
            "SELECT {} FROM chunks WHERE file_id = ?1 \
             AND (start_offset > ?2 OR (start_offset = ?2 AND id > ?3)) \
             ORDER BY start_offset ASC, id ASC LIMIT ?4",
            CHUNK_COLUMNS
        );
        let start = target.start_offset as i64;
        let limit = window as i64;

        let mut before = self
            .conn
            .prepare(&before_sql)?
            .query_map(
                params![target.file_id, start, target.id, limit],
                ChunkRecord::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        before.reverse();

        let after = self
            .conn
            .prepare(&after_sql)?
            .query_map(
                params![target.file_id, start, target.id, limit],
                ChunkRecord::from_row,
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        before.extend(after);
        Ok(before)
    }

    /// Resolve the logical unit (function, class, ...) that encloses a chunk.
    ///
    /// Order of preference: the chunk's parent structure; the chunk itself if
    /// it is a complete, non-oversized structure; the smallest non-oversized
    /// chunk of the same file containing it. Falls back to the chunk itself.
    pub fn get_complete_structure_for_chunk(
        &self,
        chunk_id: ChunkId,
    ) -> Result<Option<ChunkRecord>> {
        let Some(chunk) = self.get_chunk(chunk_id)? else {
            return Ok(None);
        };

        if let Some(parent_id) = chunk.parent_structure_id {
            if let Some(parent) = self.get_chunk(parent_id)? {
                return Ok(Some(parent));
            }
        }

        if chunk.is_complete_structure() {
            return Ok(Some(chunk));
        }

        let sql = format!(
            "SELECT {} FROM chunks WHERE file_id = ?1 AND id != ?2 \
             AND start_offset <= ?3 AND end_offset >= ?4 \
             AND COALESCE(is_oversized, 0) = 0 \
             ORDER BY (end_offset - start_offset) ASC, id ASC LIMIT 1",
            CHUNK_COLUMNS
        );
        let container = self
            .conn
            .query_row(
                &sql,
                params![
                    chunk.file_id,
                    chunk.id,
                    chunk.start_offset as i64,
                    chunk.end_offset as i64
                ],
                ChunkRecord::from_row,
            )
            .optional()?;

        Ok(Some(container.unwrap_or(chunk)))
    }

    /// Delete a file's chunks (and, by cascade, their embedding rows)
    pub fn delete_chunks_for_file(&mut self, file_id: FileId) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM chunks WHERE file_id = ?1", params![file_id])?;
        self.mark_file_indexed(file_id, false)?;
        log::debug!("Deleted {} chunks for file {}", removed, file_id);
        Ok(removed)
    }

    // ---------------------------------------------------------------------
    // Embeddings
    // ---------------------------------------------------------------------

    /// Record that `chunk_id` is stored under `label` in the vector index
    pub fn insert_embedding(&mut self, chunk_id: ChunkId, label: Label) -> Result<EmbeddingRecord> {
        let created_at = now_millis();
        self.conn.execute(
            "INSERT INTO embeddings (chunk_id, numeric_label, created_at) VALUES (?1, ?2, ?3)",
            params![chunk_id, label as i64, created_at],
        )?;
        let id = self.conn.last_insert_rowid();
        let sql = format!("SELECT {} FROM embeddings WHERE id = ?1", EMBEDDING_COLUMNS);
        Ok(self
            .conn
            .query_row(&sql, params![id], EmbeddingRecord::from_row)?)
    }

    pub fn get_embedding_for_chunk(&self, chunk_id: ChunkId) -> Result<Option<EmbeddingRecord>> {
        let sql = format!(
            "SELECT {} FROM embeddings WHERE chunk_id = ?1",
            EMBEDDING_COLUMNS
        );
        Ok(self
            .conn
            .query_row(&sql, params![chunk_id], EmbeddingRecord::from_row)
            .optional()?)
    }

    /// Flag the files owning these chunks as indexed
    pub fn mark_chunk_files_indexed(&mut self, chunk_ids: &[ChunkId]) -> Result<()> {
        let mut stmt = self.conn.prepare(
            "UPDATE files SET is_indexed = 1 WHERE id = (SELECT file_id FROM chunks WHERE id = ?1)",
        )?;
        for chunk_id in chunk_ids {
            stmt.execute(params![chunk_id])?;
        }
        Ok(())
    }

    /// Index labels belonging to a file's embedding rows
    pub fn labels_for_file(&self, file_id: FileId) -> Result<Vec<Label>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.numeric_label FROM embeddings e JOIN chunks c ON c.id = e.chunk_id \
             WHERE c.file_id = ?1 ORDER BY e.numeric_label",
        )?;
        let labels = stmt
            .query_map(params![file_id], |row| row.get::<_, i64>(0))?
            .map(|r| r.map(|l| l as Label))
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(labels)
    }

    /// Every embedding row with its chunk and file
    pub fn embedding_labels(&self) -> Result<Vec<LabelBinding>> {
        let mut stmt = self.conn.prepare(
            "SELECT e.numeric_label, e.chunk_id, c.file_id FROM embeddings e \
             JOIN chunks c ON c.id = e.chunk_id ORDER BY e.numeric_label",
        )?;
        let bindings = stmt
            .query_map([], |row| {
                Ok(LabelBinding {
                    label: row.get::<_, i64>(0)? as Label,
                    chunk_id: row.get(1)?,
                    file_id: row.get(2)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bindings)
    }

    /// Batch-fetch chunk and file data for index labels.
    ///
    /// Labels with no embedding row are simply absent from the result.
    pub fn fetch_labeled_chunks(&self, labels: &[Label]) -> Result<Vec<LabeledChunk>> {
        let mut hits = Vec::with_capacity(labels.len());
        for batch in labels.chunks(MAX_BATCH_PARAMS) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM embeddings e \
                 JOIN chunks c ON c.id = e.chunk_id \
                 JOIN files f ON f.id = c.file_id \
                 WHERE e.numeric_label IN ({})",
                LABELED_CHUNK_COLUMNS, placeholders
            );
            let mut stmt = self.conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params_from_iter(batch.iter().map(|&l| l as i64)),
                    LabeledChunk::from_row,
                )?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            hits.extend(rows);
        }
        Ok(hits)
    }

    /// Remove embedding rows for labels and flag their files for re-embedding.
    /// Returns the ids of the affected files.
    pub fn drop_embeddings_for_labels(&mut self, labels: &[Label]) -> Result<Vec<FileId>> {
        if labels.is_empty() {
            return Ok(Vec::new());
        }
        self.transaction(|db| {
            let mut files = Vec::new();
            for &label in labels {
                let file_id: Option<FileId> = db
                    .conn
                    .query_row(
                        "SELECT c.file_id FROM embeddings e JOIN chunks c ON c.id = e.chunk_id \
                         WHERE e.numeric_label = ?1",
                        params![label as i64],
                        |row| row.get(0),
                    )
                    .optional()?;
                db.conn.execute(
                    "DELETE FROM embeddings WHERE numeric_label = ?1",
                    params![label as i64],
                )?;
                if let Some(file_id) = file_id {
                    if !files.contains(&file_id) {
                        files.push(file_id);
                    }
                }
            }
            for &file_id in &files {
                db.mark_file_indexed(file_id, false)?;
            }
            Ok(files)
        })
    }

    /// Remove every embedding row and flag every file for re-embedding
    pub fn drop_all_embeddings(&mut self) -> Result<usize> {
        self.transaction(|db| {
            let removed = db.conn.execute("DELETE FROM embeddings", [])?;
            db.conn.execute("UPDATE files SET is_indexed = 0", [])?;
            Ok(removed)
        })
    }

    /// Rewrite labels after index compaction. `remap` holds `(old, new)` pairs.
    pub fn relabel_embeddings(&mut self, remap: &[(Label, Label)]) -> Result<()> {
        self.transaction(|db| {
            // Negative staging values keep the UNIQUE constraint satisfied mid-way.
            let mut stage = db
                .conn
                .prepare("UPDATE embeddings SET numeric_label = ?1 WHERE numeric_label = ?2")?;
            for &(old, new) in remap {
                stage.execute(params![-1 - new as i64, old as i64])?;
            }
            drop(stage);
            db.conn.execute(
                "UPDATE embeddings SET numeric_label = -1 - numeric_label WHERE numeric_label < 0",
                [],
            )?;
            Ok(())
        })
    }

    // ---------------------------------------------------------------------
    // Metadata and stats
    // ---------------------------------------------------------------------

    pub fn get_metadata(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_metadata(&mut self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Get database statistics
    pub fn get_stats(&self) -> Result<DatabaseStats> {
        let count = |table: &str| -> Result<usize> {
            let n: i64 =
                self.conn
                    .query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
                        row.get(0)
                    })?;
            Ok(n as usize)
        };

        let database_size_bytes: i64 = self.conn.query_row(
            "SELECT page_count * page_size FROM pragma_page_count(), pragma_page_size()",
            [],
            |row| row.get(0),
        )?;

        Ok(DatabaseStats {
            file_count: count("files")?,
            chunk_count: count("chunks")?,
            embedding_count: count("embeddings")?,
            database_size_bytes: database_size_bytes as u64,
        })
    }

    /// Close the connection, surfacing any error SQLite reports
    pub fn close(self) -> Result<()> {
        if self.txn.is_active() {
            log::warn!("Closing database with an open transaction; it will be rolled back");
        }
        self.conn.close().map_err(|(_, e)| {
            CodevecError::Connection(format!("Failed to close database: {}", e))
        })
    }
}

/// Length parity, offset sanity and parent references for a chunk batch
pub(crate) fn validate_chunk_batch(
    count: usize,
    offsets: &[(usize, usize)],
    structure: Option<&[ChunkStructure]>,
) -> Result<()> {
    if offsets.len() != count {
        return Err(CodevecError::Validation(format!(
            "{} chunks but {} offsets",
            count,
            offsets.len()
        )));
    }
    if let Some(structure) = structure {
        if structure.len() != count {
            return Err(CodevecError::Validation(format!(
                "{} chunks but {} structure entries",
                count,
                structure.len()
            )));
        }
        for (i, meta) in structure.iter().enumerate() {
            if let Some(parent) = meta.parent_index {
                if parent >= count || parent == i {
                    return Err(CodevecError::Validation(format!(
                        "chunk {} has invalid parent index {}",
                        i, parent
                    )));
                }
            }
        }
    }
    for (i, &(start, end)) in offsets.iter().enumerate() {
        if start >= end {
            return Err(CodevecError::Validation(format!(
                "chunk {} has empty or inverted range [{}, {})",
                i, start, end
            )));
        }
    }
    Ok(())
}
