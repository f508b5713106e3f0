//! Metadata storage for codevec
//!
//! This module provides the relational side of the engine using embedded SQLite.

pub mod database;
pub mod models;
pub mod schema;
pub mod transaction;

// Re-export main types
pub use database::Database;
pub use models::{
    ChunkId, ChunkRecord, ChunkStructure, DatabaseStats, EmbeddingRecord, FileId, FileRecord,
    FileUpsert, Label, LabelBinding, LabeledChunk,
};
pub use transaction::TransactionState;
