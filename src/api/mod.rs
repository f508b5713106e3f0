//! API layer for codevec
//!
//! This module provides the storage engine handle and the search types used
//! to query it.

pub mod search;
pub mod store;

// Re-export main API types
pub use search::{SearchOptions, SearchResult};
pub use store::{CompactionReport, EmbeddingStore, ReconcileReport, StorageStats};
