//! codevec CLI application
//!
//! Maintenance and inspection commands for an on-disk codevec store.

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use codevec::utils::format_file_size;
use codevec::{Config, EmbeddingStore};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "codevec")]
#[command(about = "Inspect and maintain a code embedding store")]
#[command(version)]
struct Cli {
    /// Store directory (database and index snapshots)
    #[arg(short, long, default_value = ".codevec")]
    dir: PathBuf,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show file, chunk, embedding and index statistics
    Stats,

    /// List files that still need embeddings
    Files,

    /// Show the chunks stored for a file
    Chunks {
        /// File path as recorded in the store
        path: String,
    },

    /// Remove a file, its chunks and its embeddings
    Delete {
        /// File path as recorded in the store
        path: String,
    },

    /// Search with a query vector given as a JSON array
    Search {
        /// Query vector, e.g. "[0.1, 0.2, ...]"
        vector: String,

        /// Number of results to return
        #[arg(short, long)]
        limit: Option<usize>,

        /// Minimum cosine similarity
        #[arg(short, long)]
        min_score: Option<f32>,
    },

    /// Rebuild the vector index without tombstones
    Compact,

    /// Repair differences between embedding rows and the vector index
    Reconcile,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    let store = EmbeddingStore::open(&cli.dir, config)
        .await
        .with_context(|| format!("failed to open store at {}", cli.dir.display()))?;

    let outcome = match cli.command {
        Commands::Stats => stats_command(&store).await,
        Commands::Files => files_command(&store).await,
        Commands::Chunks { path } => chunks_command(&store, &path).await,
        Commands::Delete { path } => delete_command(&store, &path).await,
        Commands::Search {
            vector,
            limit,
            min_score,
        } => search_command(&store, &vector, limit, min_score).await,
        Commands::Compact => compact_command(&store).await,
        Commands::Reconcile => reconcile_command(&store).await,
    };

    store.close().await?;
    outcome
}

async fn stats_command(store: &EmbeddingStore) -> anyhow::Result<()> {
    let stats = store.get_storage_stats().await?;

    println!("Store: {}", store.directory().display());
    println!("   Files:      {}", stats.file_count);
    println!("   Chunks:     {}", stats.chunk_count);
    println!("   Embeddings: {}", stats.embedding_count);
    println!(
        "   Database:   {}",
        format_file_size(stats.database_size_bytes)
    );
    println!(
        "   Model:      {}",
        stats.embedding_model.as_deref().unwrap_or("(none)")
    );
    match stats.last_indexed_at {
        Some(at) => println!("   Indexed at: {}", at.to_rfc3339()),
        None => println!("   Indexed at: never"),
    }
    match stats.index {
        Some(index) => {
            println!(
                "   Index:      {}d, {} live / {} labels ({} tombstoned), capacity {}",
                index.dimension,
                index.live_count,
                index.element_count,
                index.deleted_count,
                index.max_elements
            );
            if index.unindexed_count > 0 {
                println!(
                    "                {} vectors not yet in the HNSW graph",
                    index.unindexed_count
                );
            }
        }
        None => println!("   Index:      not bound"),
    }
    Ok(())
}

async fn files_command(store: &EmbeddingStore) -> anyhow::Result<()> {
    let files = store.get_files_to_index().await?;
    if files.is_empty() {
        println!("All files are indexed");
        return Ok(());
    }
    println!("{} files need embeddings:", files.len());
    for file in files {
        println!(
            "   {} ({}, {})",
            file.path,
            file.language.as_deref().unwrap_or("unknown"),
            format_file_size(file.size_bytes)
        );
    }
    Ok(())
}

async fn chunks_command(store: &EmbeddingStore, path: &str) -> anyhow::Result<()> {
    let Some(file) = store.get_file_by_path(path).await? else {
        bail!("file not found in store: {}", path);
    };
    let chunks = store.get_file_chunks(file.id).await?;
    println!("{}: {} chunks", file.path, chunks.len());
    for chunk in chunks {
        let label = store
            .get_embedding_for_chunk(chunk.id)
            .await?
            .map(|e| e.numeric_label.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "   #{} [{}, {}) label={} {}",
            chunk.id,
            chunk.start_offset,
            chunk.end_offset,
            label,
            chunk.structure_type.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

async fn delete_command(store: &EmbeddingStore, path: &str) -> anyhow::Result<()> {
    match store.delete_file(path).await? {
        Some(file) => println!("Deleted {} (id {})", file.path, file.id),
        None => println!("No such file: {}", path),
    }
    Ok(())
}

async fn search_command(
    store: &EmbeddingStore,
    vector: &str,
    limit: Option<usize>,
    min_score: Option<f32>,
) -> anyhow::Result<()> {
    let query: Vec<f32> =
        serde_json::from_str(vector).context("query vector must be a JSON array of numbers")?;

    let mut options = store.default_search_options();
    if let Some(limit) = limit {
        options = options.with_limit(limit);
    }
    if let Some(min_score) = min_score {
        options = options.with_min_score(min_score);
    }

    let results = store.search(&query, options).await;
    if results.is_empty() {
        println!("No results found");
        return Ok(());
    }

    println!("Found {} results:", results.len());
    println!();
    for (i, hit) in results.iter().enumerate() {
        println!(
            "{}. Score: {:.3}  {} [{}, {})",
            i + 1,
            hit.score,
            hit.file_path,
            hit.start_offset,
            hit.end_offset
        );
        println!("   {}", hit.content.lines().next().unwrap_or(""));
        println!();
    }
    Ok(())
}

async fn compact_command(store: &EmbeddingStore) -> anyhow::Result<()> {
    let report = store.compact().await?;
    println!(
        "Compacted index: {} live vectors, {} tombstones removed, generation {}",
        report.live, report.removed, report.generation
    );
    Ok(())
}

async fn reconcile_command(store: &EmbeddingStore) -> anyhow::Result<()> {
    let report = store.reconcile().await?;
    if report.is_clean() {
        println!("Store is consistent");
    } else {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    Ok(())
}
