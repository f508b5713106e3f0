//! Vector index for codevec
//!
//! An in-memory cosine-space HNSW index keyed by dense integer labels, with
//! soft deletes, capacity growth and single-file snapshots per dimension.

pub mod index;
pub mod manager;

// Re-export main types
pub use index::{GraphParams, IndexStats, VectorIndex, VectorPoint, cosine_distance};
pub use manager::{BindOutcome, IndexManager};
