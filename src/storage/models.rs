//! Record types for the metadata store and their row mappings
//!
//! Every query selects one of the `*_COLUMNS` lists below and decodes the
//! row with the matching `from_row`, so column order is defined in one place.

use crate::utils::millis_to_datetime;
use chrono::{DateTime, Utc};
use rusqlite::Row;
use serde::{Deserialize, Serialize};

pub type FileId = i64;
pub type ChunkId = i64;
pub type Label = usize;

/// A source file tracked by the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub path: String,
    pub content_hash: String,
    pub last_modified: DateTime<Utc>,
    pub language: Option<String>,
    pub is_indexed: bool,
    pub size_bytes: u64,
}

pub(crate) const FILE_COLUMNS: &str =
    "id, path, content_hash, last_modified, language, is_indexed, size_bytes";

impl FileRecord {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            path: row.get(1)?,
            content_hash: row.get(2)?,
            last_modified: millis_to_datetime(row.get(3)?),
            language: row.get(4)?,
            is_indexed: row.get(5)?,
            size_bytes: row.get::<_, i64>(6)? as u64,
        })
    }
}

/// Outcome of `upsert_file`
#[derive(Debug, Clone, PartialEq)]
pub enum FileUpsert {
    /// Content hash matched the stored row; nothing was written
    Unchanged(FileRecord),
    /// Row was created or its content changed; prior chunks are gone
    Changed(FileRecord),
}

impl FileUpsert {
    pub fn record(&self) -> &FileRecord {
        match self {
            FileUpsert::Unchanged(record) | FileUpsert::Changed(record) => record,
        }
    }

    pub fn into_record(self) -> FileRecord {
        match self {
            FileUpsert::Unchanged(record) | FileUpsert::Changed(record) => record,
        }
    }

    pub fn is_changed(&self) -> bool {
        matches!(self, FileUpsert::Changed(_))
    }
}

/// A contiguous slice of a file's text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: ChunkId,
    pub file_id: FileId,
    pub content: String,
    pub start_offset: usize,
    pub end_offset: usize,
    pub token_count: Option<u32>,
    pub parent_structure_id: Option<ChunkId>,
    pub structure_order: Option<u32>,
    pub is_oversized: Option<bool>,
    pub structure_type: Option<String>,
}

pub(crate) const CHUNK_COLUMNS: &str = "id, file_id, content, start_offset, end_offset, \
     token_count, parent_structure_id, structure_order, is_oversized, structure_type";

impl ChunkRecord {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            file_id: row.get(1)?,
            content: row.get(2)?,
            start_offset: row.get::<_, i64>(3)? as usize,
            end_offset: row.get::<_, i64>(4)? as usize,
            token_count: row.get::<_, Option<i64>>(5)?.map(|t| t as u32),
            parent_structure_id: row.get(6)?,
            structure_order: row.get::<_, Option<i64>>(7)?.map(|o| o as u32),
            is_oversized: row.get(8)?,
            structure_type: row.get(9)?,
        })
    }

    pub fn span(&self) -> usize {
        self.end_offset - self.start_offset
    }

    /// Whether `other` lies entirely inside this chunk's offsets
    pub fn contains(&self, other: &ChunkRecord) -> bool {
        self.start_offset <= other.start_offset && self.end_offset >= other.end_offset
    }

    /// A chunk the chunker tagged with a structure type and did not split
    pub fn is_complete_structure(&self) -> bool {
        self.structure_type.is_some() && !self.is_oversized.unwrap_or(false)
    }
}

/// Structure metadata the chunking pipeline attaches to one chunk.
///
/// `parent_index` refers to another chunk of the same `replace_chunks`
/// batch by position; it is resolved to that chunk's id on insert.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkStructure {
    pub token_count: Option<u32>,
    pub parent_index: Option<usize>,
    pub structure_order: Option<u32>,
    pub is_oversized: Option<bool>,
    pub structure_type: Option<String>,
}

/// Link between a chunk and its label in the vector index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub chunk_id: ChunkId,
    pub numeric_label: Label,
    pub created_at: DateTime<Utc>,
}

pub(crate) const EMBEDDING_COLUMNS: &str = "id, chunk_id, numeric_label, created_at";

impl EmbeddingRecord {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            chunk_id: row.get(1)?,
            numeric_label: row.get::<_, i64>(2)? as usize,
            created_at: millis_to_datetime(row.get(3)?),
        })
    }
}

/// Label plus the owning chunk and file, used to tie index entries to rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LabelBinding {
    pub label: Label,
    pub chunk_id: ChunkId,
    pub file_id: FileId,
}

/// Chunk and file data hydrated for a search hit
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledChunk {
    pub label: Label,
    pub chunk_id: ChunkId,
    pub file_id: FileId,
    pub file_path: String,
    pub language: Option<String>,
    pub content: String,
    pub start_offset: usize,
    pub end_offset: usize,
}

pub(crate) const LABELED_CHUNK_COLUMNS: &str = "e.numeric_label, c.id, f.id, f.path, f.language, \
     c.content, c.start_offset, c.end_offset";

impl LabeledChunk {
    pub(crate) fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(Self {
            label: row.get::<_, i64>(0)? as usize,
            chunk_id: row.get(1)?,
            file_id: row.get(2)?,
            file_path: row.get(3)?,
            language: row.get(4)?,
            content: row.get(5)?,
            start_offset: row.get::<_, i64>(6)? as usize,
            end_offset: row.get::<_, i64>(7)? as usize,
        })
    }
}

/// Row counts and on-disk size of the metadata store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub file_count: usize,
    pub chunk_count: usize,
    pub embedding_count: usize,
    pub database_size_bytes: u64,
}
