//! # codevec
//!
//! Persistent storage for code embeddings: a SQLite metadata store for files,
//! chunks and embedding rows, paired with an HNSW vector index for cosine
//! similarity search. Chunking and embedding generation happen outside this
//! crate; codevec keeps their output consistent and queryable.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use codevec::{Config, EmbeddingStore, SearchOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = EmbeddingStore::open(".codevec", Config::default()).await?;
//!     store.set_embedding_model("all-MiniLM-L6-v2", 384).await?;
//!
//!     // Track a file and the chunks produced for it
//!     let content = "export function add(a: number, b: number) { return a + b; }";
//!     let file = store.upsert_file("src/math.ts", content).await?.into_record();
//!     let chunks = store
//!         .replace_chunks(file.id, &[content], &[(0, content.len())], None)
//!         .await?;
//!
//!     // Vectors come from your embedding model
//!     let vector = vec![0.1f32; 384];
//!     store.store_embeddings(&[(chunks[0].id, vector.clone())]).await?;
//!
//!     for hit in store.search(&vector, SearchOptions::default().with_limit(3)).await {
//!         println!("{:.3} {}:{}", hit.score, hit.file_path, hit.start_offset);
//!     }
//!
//!     store.close().await?;
//!     Ok(())
//! }
//! ```

// Core modules
pub mod api;
pub mod config;
pub mod error;
pub mod storage;
pub mod utils;
pub mod vector;

// Re-export main API types
pub use api::{
    CompactionReport, EmbeddingStore, ReconcileReport, SearchOptions, SearchResult, StorageStats,
};
pub use config::Config;
pub use error::{CodevecError, Result};

// Re-export commonly used types
pub use storage::{ChunkId, ChunkRecord, ChunkStructure, FileId, FileRecord, FileUpsert, Label};
pub use vector::{BindOutcome, IndexStats};
