//! Database schema definitions

/// Database schema version
pub const SCHEMA_VERSION: u32 = 2;

/// SQL for creating the files table
pub const CREATE_FILES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    path TEXT NOT NULL UNIQUE,
    content_hash TEXT NOT NULL,
    last_modified INTEGER NOT NULL,
    language TEXT,
    is_indexed INTEGER NOT NULL DEFAULT 0,
    size_bytes INTEGER NOT NULL DEFAULT 0
);
"#;

/// SQL for creating the chunks table.
///
/// `parent_structure_id` points at another chunk of the same file.
pub const CREATE_CHUNKS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
    content TEXT NOT NULL,
    start_offset INTEGER NOT NULL,
    end_offset INTEGER NOT NULL,
    token_count INTEGER,
    parent_structure_id INTEGER REFERENCES chunks(id) ON DELETE SET NULL,
    structure_order INTEGER,
    is_oversized INTEGER,
    structure_type TEXT,
    CHECK (start_offset < end_offset)
);
"#;

/// SQL for creating the embeddings table. Vectors live only in the index.
pub const CREATE_EMBEDDINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS embeddings (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chunk_id INTEGER NOT NULL UNIQUE REFERENCES chunks(id) ON DELETE CASCADE,
    numeric_label INTEGER NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);
"#;

/// SQL for creating the metadata table
pub const CREATE_METADATA_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Secondary indexes for per-file chunk scans and filters
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_chunks_file_offset ON chunks(file_id, start_offset);
CREATE INDEX IF NOT EXISTS idx_chunks_parent ON chunks(parent_structure_id);
CREATE INDEX IF NOT EXISTS idx_files_indexed ON files(is_indexed);
CREATE INDEX IF NOT EXISTS idx_files_language ON files(language);
"#;

/// Well-known keys of the metadata table
pub mod keys {
    pub const SCHEMA_VERSION: &str = "schema_version";
    pub const EMBEDDING_MODEL: &str = "embedding_model";
    pub const EMBEDDING_DIMENSION: &str = "embedding_dimension";
    pub const LAST_INDEXED_AT: &str = "last_indexed_at";
    pub const INDEX_GENERATION: &str = "index_generation";
}
