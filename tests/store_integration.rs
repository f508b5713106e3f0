//! Integration tests for the embedding store
//!
//! Each test opens a store in a temporary directory and drives it the way an
//! indexer would: upsert a file, store its chunks, store vectors, search.

use codevec::config::Config;
use codevec::storage::{ChunkRecord, FileRecord};
use codevec::{BindOutcome, CodevecError, EmbeddingStore, FileUpsert, SearchOptions};
use std::path::Path;

const DIM: usize = 32;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic pseudo-random vector in [-0.5, 0.5)^dim
fn vector(seed: u64, dim: usize) -> Vec<f32> {
    let mut state = seed
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    (0..dim)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            (state >> 33) as f32 / (1u64 << 31) as f32 - 0.5
        })
        .collect()
}

fn small_capacity_config(capacity: usize) -> Config {
    let mut config = Config::default();
    config.index.initial_capacity = capacity;
    config
}

async fn open(dir: &Path) -> EmbeddingStore {
    init_logging();
    EmbeddingStore::open(dir, Config::default()).await.unwrap()
}

struct Ingested {
    file: FileRecord,
    chunks: Vec<ChunkRecord>,
    vectors: Vec<Vec<f32>>,
}

/// Upsert `path` with `chunk_count` fixed-size chunks and store a vector per chunk
async fn ingest(store: &EmbeddingStore, path: &str, chunk_count: usize, seed: u64) -> Ingested {
    let content: String = (0..chunk_count)
        .map(|i| format!("{:<50}", format!("// {} chunk {}", path, i)))
        .collect();
    let file = store.upsert_file(path, &content).await.unwrap().into_record();

    let offsets: Vec<(usize, usize)> = (0..chunk_count).map(|i| (i * 50, (i + 1) * 50)).collect();
    let texts: Vec<&str> = offsets.iter().map(|&(s, e)| &content[s..e]).collect();
    let chunks = store
        .replace_chunks(file.id, &texts, &offsets, None)
        .await
        .unwrap();

    let dimension = store.dimension().await.unwrap();
    let vectors: Vec<Vec<f32>> = (0..chunk_count)
        .map(|i| vector(seed * 1000 + i as u64, dimension))
        .collect();
    let pairs: Vec<(i64, Vec<f32>)> = chunks
        .iter()
        .zip(&vectors)
        .map(|(c, v)| (c.id, v.clone()))
        .collect();
    store.store_embeddings(&pairs).await.unwrap();

    let file = store.get_file(file.id).await.unwrap().unwrap();
    Ingested {
        file,
        chunks,
        vectors,
    }
}

#[tokio::test]
async fn test_ingest_and_search_single_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    store.set_embedding_model("test-model", 384).await.unwrap();

    let content = "a".repeat(200);
    let file = match store.upsert_file("a.ts", &content).await.unwrap() {
        FileUpsert::Changed(file) => file,
        FileUpsert::Unchanged(_) => panic!("new file reported as unchanged"),
    };
    assert_eq!(file.language.as_deref(), Some("typescript"));
    assert!(!file.is_indexed);

    let chunks = store
        .replace_chunks(
            file.id,
            &[&content[0..100], &content[100..200]],
            &[(0, 100), (100, 200)],
            None,
        )
        .await
        .unwrap();
    assert_eq!(chunks.len(), 2);

    let v0 = vector(1, 384);
    let v1 = vector(2, 384);
    let records = store
        .store_embeddings(&[(chunks[0].id, v0.clone()), (chunks[1].id, v1)])
        .await
        .unwrap();
    assert_eq!(records[0].numeric_label, 0);
    assert_eq!(records[1].numeric_label, 1);

    let stats = store.get_storage_stats().await.unwrap();
    assert_eq!(stats.file_count, 1);
    assert_eq!(stats.chunk_count, 2);
    assert_eq!(stats.embedding_count, 2);
    assert_eq!(stats.embedding_model.as_deref(), Some("test-model"));
    assert!(stats.last_indexed_at.is_some());
    assert_eq!(stats.index.as_ref().unwrap().element_count, 2);

    // Slightly perturbed query still lands on the first chunk
    let query: Vec<f32> = v0.iter().map(|x| x + 0.001).collect();
    let results = store
        .search(&query, SearchOptions::default().with_limit(1).with_min_score(0.9))
        .await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk_id, chunks[0].id);
    assert_eq!(results[0].start_offset, 0);
    assert_eq!(results[0].end_offset, 100);
    assert_eq!(results[0].file_path, "a.ts");
    assert!(results[0].score > 0.9);

    assert!(store.get_files_to_index().await.unwrap().is_empty());
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_delete_file_removes_chunks_and_results() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    store.set_embedding_model("test-model", DIM).await.unwrap();

    let a = ingest(&store, "a.ts", 2, 1).await;
    let b = ingest(&store, "b.ts", 2, 2).await;

    let deleted = store.delete_file("a.ts").await.unwrap().unwrap();
    assert_eq!(deleted.id, a.file.id);
    assert!(store.delete_file("a.ts").await.unwrap().is_none());

    assert!(store.get_file_chunks(a.file.id).await.unwrap().is_empty());
    assert!(
        store
            .get_files_to_index()
            .await
            .unwrap()
            .iter()
            .all(|f| f.path != "a.ts")
    );

    let any_score = SearchOptions::default().with_limit(10).with_min_score(-1.0);
    for v in &a.vectors {
        let results = store.search(v, any_score.clone()).await;
        assert!(results.iter().all(|r| r.file_id != a.file.id));
        assert!(!results.is_empty());
    }

    let results = store.search(&b.vectors[0], any_score).await;
    assert_eq!(results[0].chunk_id, b.chunks[0].id);

    let index = store.get_storage_stats().await.unwrap().index.unwrap();
    assert_eq!(index.deleted_count, 2);
    assert_eq!(index.live_count, 2);
}

#[tokio::test]
async fn test_unchanged_reingest_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    store.set_embedding_model("test-model", DIM).await.unwrap();

    let a = ingest(&store, "src/lib.rs", 3, 1).await;
    assert!(a.file.is_indexed);
    let before = store.get_storage_stats().await.unwrap();

    let content: String = a.chunks.iter().map(|c| c.content.as_str()).collect();
    let outcome = store.upsert_file("src/lib.rs", &content).await.unwrap();
    assert!(!outcome.is_changed());
    assert!(outcome.record().is_indexed);

    let after = store.get_storage_stats().await.unwrap();
    assert_eq!(before.chunk_count, after.chunk_count);
    assert_eq!(before.embedding_count, after.embedding_count);
    assert!(store.get_file(a.file.id).await.unwrap().unwrap().is_indexed);
}

#[tokio::test]
async fn test_changed_content_tombstones_old_labels() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    store.set_embedding_model("test-model", DIM).await.unwrap();

    let a = ingest(&store, "a.py", 2, 1).await;
    let outcome = store.upsert_file("a.py", "print('changed')").await.unwrap();
    assert!(outcome.is_changed());
    assert!(!outcome.record().is_indexed);
    assert!(store.get_file_chunks(a.file.id).await.unwrap().is_empty());

    let stats = store.get_storage_stats().await.unwrap();
    assert_eq!(stats.embedding_count, 0);
    assert_eq!(stats.index.unwrap().live_count, 0);

    let results = store
        .search(&a.vectors[0], SearchOptions::default().with_min_score(-1.0))
        .await;
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_self_similarity_is_maximal() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    store.set_embedding_model("test-model", DIM).await.unwrap();

    let mut all = Vec::new();
    for (i, path) in ["a.rs", "b.rs", "c.go", "d.java"].iter().enumerate() {
        all.push(ingest(&store, path, 5, i as u64 + 1).await);
    }

    for ingested in &all {
        for (chunk, v) in ingested.chunks.iter().zip(&ingested.vectors) {
            let results = store
                .search(v, SearchOptions::default().with_limit(1).with_min_score(1.0))
                .await;
            assert_eq!(results.len(), 1);
            assert_eq!(results[0].chunk_id, chunk.id);
            approx::assert_relative_eq!(results[0].score, 1.0, epsilon = 1e-4);
        }
    }
}

#[tokio::test]
async fn test_labels_are_monotonic_and_never_reused() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    store.set_embedding_model("test-model", DIM).await.unwrap();

    ingest(&store, "a.ts", 3, 1).await;
    let b = ingest(&store, "b.ts", 2, 2).await;
    store.delete_file("a.ts").await.unwrap();
    let c = ingest(&store, "c.ts", 2, 3).await;

    let mut labels = Vec::new();
    for chunk in b.chunks.iter().chain(&c.chunks) {
        let record = store.get_embedding_for_chunk(chunk.id).await.unwrap().unwrap();
        labels.push(record.numeric_label);
    }
    assert_eq!(labels, vec![3, 4, 5, 6]);
}

#[tokio::test]
async fn test_growth_past_initial_capacity() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let store = EmbeddingStore::open(dir.path(), small_capacity_config(4))
        .await
        .unwrap();
    store.set_embedding_model("test-model", DIM).await.unwrap();

    let a = ingest(&store, "big.rs", 10, 7).await;

    let index = store.get_storage_stats().await.unwrap().index.unwrap();
    assert_eq!(index.element_count, 10);
    assert!(index.max_elements >= 10);

    for (chunk, v) in a.chunks.iter().zip(&a.vectors) {
        let results = store
            .search(v, SearchOptions::default().with_limit(1).with_min_score(1.0))
            .await;
        assert_eq!(results[0].chunk_id, chunk.id);
    }
}

#[tokio::test]
async fn test_mismatched_chunk_arrays_write_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    store.set_embedding_model("test-model", DIM).await.unwrap();

    let a = ingest(&store, "a.ts", 2, 1).await;
    let err = store
        .replace_chunks(a.file.id, &["one", "two", "three"], &[(0, 3), (3, 6)], None)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    assert_eq!(store.get_file_chunks(a.file.id).await.unwrap().len(), 2);
    let index = store.get_storage_stats().await.unwrap().index.unwrap();
    assert_eq!(index.live_count, 2);
}

#[tokio::test]
async fn test_store_embeddings_validation() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;

    let file = store.upsert_file("a.ts", "const x = 1;").await.unwrap().into_record();
    let chunks = store
        .replace_chunks(file.id, &["const x = 1;"], &[(0, 12)], None)
        .await
        .unwrap();

    let err = store
        .store_embeddings(&[(chunks[0].id, vector(1, DIM))])
        .await
        .unwrap_err();
    assert!(matches!(err, CodevecError::IndexNotBound));

    store.set_embedding_model("test-model", DIM).await.unwrap();
    let err = store
        .store_embeddings(&[(chunks[0].id, vector(1, DIM + 1))])
        .await
        .unwrap_err();
    assert!(err.is_validation());
    assert_eq!(store.get_storage_stats().await.unwrap().embedding_count, 0);
}

#[tokio::test]
async fn test_non_finite_embedding_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    store.set_embedding_model("test-model", DIM).await.unwrap();

    let a = ingest(&store, "a.ts", 2, 1).await;
    let before = store.get_storage_stats().await.unwrap().index.unwrap();

    let mut poisoned = vector(9, DIM);
    poisoned[DIM / 2] = f32::NAN;
    let err = store
        .store_embeddings(&[(a.chunks[0].id, vector(8, DIM)), (a.chunks[1].id, poisoned)])
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let after = store.get_storage_stats().await.unwrap().index.unwrap();
    assert_eq!(after.element_count, before.element_count);
    assert_eq!(after.deleted_count, 0);
    assert_eq!(store.get_storage_stats().await.unwrap().embedding_count, 2);
}

#[tokio::test]
async fn test_failed_batch_tombstones_inserted_labels() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    store.set_embedding_model("test-model", DIM).await.unwrap();

    let file = store.upsert_file("a.ts", &"x".repeat(20)).await.unwrap().into_record();
    let chunks = store
        .replace_chunks(file.id, &["x".repeat(10), "x".repeat(10)], &[(0, 10), (10, 20)], None)
        .await
        .unwrap();

    // Second pair references a chunk that does not exist
    let result = store
        .store_embeddings(&[(chunks[0].id, vector(1, DIM)), (9_999, vector(2, DIM))])
        .await;
    assert!(result.is_err());

    let stats = store.get_storage_stats().await.unwrap();
    assert_eq!(stats.embedding_count, 0);
    let index = stats.index.unwrap();
    assert_eq!(index.live_count, 0);
    assert_eq!(index.deleted_count, index.element_count);

    let records = store
        .store_embeddings(&[(chunks[0].id, vector(1, DIM))])
        .await
        .unwrap();
    assert_eq!(records[0].numeric_label, index.element_count);
    assert!(
        store
            .get_files_to_index()
            .await
            .unwrap()
            .iter()
            .all(|f| f.id != file.id)
    );
}

#[tokio::test]
async fn test_search_filters() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    store.set_embedding_model("test-model", DIM).await.unwrap();

    let ts = ingest(&store, "web/app.ts", 3, 1).await;
    let py = ingest(&store, "tools/gen.py", 3, 2).await;

    let wide = SearchOptions::default().with_limit(10).with_min_score(-1.0);

    let results = store
        .search(&ts.vectors[0], wide.clone().with_languages(["python"]))
        .await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.file_id == py.file.id));

    let results = store
        .search(&py.vectors[0], wide.clone().with_files(["web/app.ts"]))
        .await;
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.file_path == "web/app.ts"));

    let results = store.search(&ts.vectors[0], wide).await;
    assert_eq!(results.len(), 6);
    assert!(results.windows(2).all(|w| w[0].score >= w[1].score));

    // Wrong query width degrades to no results
    assert!(store.search(&vector(1, DIM - 1), SearchOptions::default()).await.is_empty());
}

#[tokio::test]
async fn test_search_on_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    assert!(store.search(&vector(1, DIM), SearchOptions::default()).await.is_empty());

    store.set_embedding_model("test-model", DIM).await.unwrap();
    assert!(store.search(&vector(1, DIM), SearchOptions::default()).await.is_empty());
}

#[tokio::test]
async fn test_reopen_restores_index() {
    let dir = tempfile::tempdir().unwrap();
    let a = {
        let store = open(dir.path()).await;
        store.set_embedding_model("test-model", DIM).await.unwrap();
        let a = ingest(&store, "a.ts", 4, 1).await;
        store.close().await.unwrap();
        a
    };

    let store = open(dir.path()).await;
    assert_eq!(store.dimension().await, Some(DIM));
    assert_eq!(
        store.set_embedding_model("test-model", DIM).await.unwrap(),
        BindOutcome::AlreadyBound
    );

    let results = store
        .search(&a.vectors[2], SearchOptions::default().with_limit(1).with_min_score(1.0))
        .await;
    assert_eq!(results[0].chunk_id, a.chunks[2].id);

    let stats = store.get_storage_stats().await.unwrap();
    assert_eq!(stats.embedding_count, 4);
    assert_eq!(stats.index.unwrap().element_count, 4);
    assert!(store.reconcile().await.unwrap().is_clean());
}

#[tokio::test]
async fn test_stale_snapshot_is_reconciled_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join(format!("vectors-{}.idx", DIM));
    let backup = dir.path().join("backup.idx");

    let b = {
        let store = open(dir.path()).await;
        store.set_embedding_model("test-model", DIM).await.unwrap();
        ingest(&store, "a.ts", 2, 1).await;
        std::fs::copy(&snapshot, &backup).unwrap();
        let b = ingest(&store, "b.ts", 2, 2).await;
        store.close().await.unwrap();
        b
    };

    // Simulate a crash before the second batch reached the snapshot
    std::fs::copy(&backup, &snapshot).unwrap();

    let store = open(dir.path()).await;
    let stats = store.get_storage_stats().await.unwrap();
    assert_eq!(stats.embedding_count, 2);
    assert_eq!(stats.index.unwrap().element_count, 2);

    let pending = store.get_files_to_index().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, b.file.id);
    assert_eq!(store.get_file_chunks(b.file.id).await.unwrap().len(), 2);

    // Re-embedding continues after the surviving labels
    let pairs: Vec<(i64, Vec<f32>)> = b
        .chunks
        .iter()
        .zip(&b.vectors)
        .map(|(c, v)| (c.id, v.clone()))
        .collect();
    let records = store.store_embeddings(&pairs).await.unwrap();
    assert_eq!(records[0].numeric_label, 2);
    assert!(store.get_files_to_index().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_lost_snapshot_flags_files() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = open(dir.path()).await;
        store.set_embedding_model("test-model", DIM).await.unwrap();
        ingest(&store, "a.ts", 3, 1).await;
        store.close().await.unwrap();
    }
    std::fs::write(dir.path().join(format!("vectors-{}.idx", DIM)), b"not a snapshot").unwrap();

    let store = open(dir.path()).await;
    let stats = store.get_storage_stats().await.unwrap();
    assert_eq!(stats.embedding_count, 0);
    assert_eq!(stats.chunk_count, 3);
    assert_eq!(store.get_files_to_index().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_compaction_relabels_densely() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    store.set_embedding_model("test-model", DIM).await.unwrap();

    ingest(&store, "a.ts", 3, 1).await;
    let b = ingest(&store, "b.ts", 3, 2).await;
    store.delete_file("a.ts").await.unwrap();

    let report = store.compact().await.unwrap();
    assert_eq!(report.removed, 3);
    assert_eq!(report.live, 3);
    assert_eq!(report.generation, 1);

    let index = store.get_storage_stats().await.unwrap().index.unwrap();
    assert_eq!(index.element_count, 3);
    assert_eq!(index.deleted_count, 0);

    for (i, (chunk, v)) in b.chunks.iter().zip(&b.vectors).enumerate() {
        let record = store.get_embedding_for_chunk(chunk.id).await.unwrap().unwrap();
        assert_eq!(record.numeric_label, i);
        let results = store
            .search(v, SearchOptions::default().with_limit(1).with_min_score(1.0))
            .await;
        assert_eq!(results[0].chunk_id, chunk.id);
    }
    store.close().await.unwrap();

    let store = open(dir.path()).await;
    assert!(store.reconcile().await.unwrap().is_clean());
    assert_eq!(store.get_storage_stats().await.unwrap().embedding_count, 3);
}

#[tokio::test]
async fn test_pre_compaction_snapshot_is_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join(format!("vectors-{}.idx", DIM));
    let backup = dir.path().join("backup.idx");
    {
        let store = open(dir.path()).await;
        store.set_embedding_model("test-model", DIM).await.unwrap();
        ingest(&store, "a.ts", 2, 1).await;
        ingest(&store, "b.ts", 2, 2).await;
        store.delete_file("a.ts").await.unwrap();
        store.checkpoint().await.unwrap();
        std::fs::copy(&snapshot, &backup).unwrap();
        store.compact().await.unwrap();
        store.close().await.unwrap();
    }
    std::fs::copy(&backup, &snapshot).unwrap();

    let store = open(dir.path()).await;
    let stats = store.get_storage_stats().await.unwrap();
    assert_eq!(stats.embedding_count, 0);
    assert_eq!(stats.index.unwrap().element_count, 0);
    assert_eq!(store.get_files_to_index().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_compact_if_needed_respects_thresholds() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.index.compaction_min_deleted = 2;
    config.index.compaction_threshold = 0.6;
    let store = EmbeddingStore::open(dir.path(), config).await.unwrap();
    store.set_embedding_model("test-model", DIM).await.unwrap();

    ingest(&store, "a.ts", 1, 1).await;
    ingest(&store, "b.ts", 3, 2).await;
    store.delete_file("a.ts").await.unwrap();
    assert!(store.compact_if_needed().await.unwrap().is_none());

    ingest(&store, "c.ts", 2, 3).await;
    store.delete_file("c.ts").await.unwrap();
    assert!(store.compact_if_needed().await.unwrap().is_none());

    store.delete_file("b.ts").await.unwrap();
    let report = store.compact_if_needed().await.unwrap().unwrap();
    assert_eq!(report.live, 0);
    assert_eq!(report.removed, 6);
}

#[tokio::test]
async fn test_model_change_requires_reembedding() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;
    assert_eq!(
        store.set_embedding_model("model-a", DIM).await.unwrap(),
        BindOutcome::Fresh
    );
    ingest(&store, "a.ts", 2, 1).await;
    ingest(&store, "b.ts", 2, 2).await;
    assert!(store.get_files_to_index().await.unwrap().is_empty());

    assert_eq!(
        store.set_embedding_model("model-b", 16).await.unwrap(),
        BindOutcome::Fresh
    );
    assert_eq!(store.dimension().await, Some(16));

    let stats = store.get_storage_stats().await.unwrap();
    assert_eq!(stats.embedding_count, 0);
    assert_eq!(stats.chunk_count, 4);
    assert_eq!(stats.embedding_model.as_deref(), Some("model-b"));
    assert_eq!(store.get_files_to_index().await.unwrap().len(), 2);

    let c = ingest(&store, "c.ts", 1, 3).await;
    assert_eq!(c.vectors[0].len(), 16);
    assert_eq!(
        store.get_embedding_for_chunk(c.chunks[0].id).await.unwrap().unwrap().numeric_label,
        0
    );
}

#[tokio::test]
async fn test_structure_lookups_through_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;

    let content = "class A {\n  fn one() {}\n  fn two() {}\n}\n";
    let file = store.upsert_file("a.kt", content).await.unwrap().into_record();
    let offsets = [(0, 40), (12, 23), (26, 37)];
    let texts: Vec<&str> = offsets.iter().map(|&(s, e)| &content[s..e]).collect();
    let structure = vec![
        codevec::ChunkStructure {
            structure_type: Some("class".to_string()),
            ..Default::default()
        },
        codevec::ChunkStructure {
            parent_index: Some(0),
            structure_type: Some("function".to_string()),
            ..Default::default()
        },
        codevec::ChunkStructure::default(),
    ];
    let chunks = store
        .replace_chunks(file.id, &texts, &offsets, Some(&structure))
        .await
        .unwrap();

    let parent = store
        .get_complete_structure_for_chunk(chunks[1].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(parent.id, chunks[0].id);

    let container = store
        .get_complete_structure_for_chunk(chunks[2].id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(container.id, chunks[0].id);

    let adjacent = store.get_adjacent_chunks(chunks[1].id, 1).await.unwrap();
    let ids: Vec<i64> = adjacent.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![chunks[0].id, chunks[2].id]);
}

#[tokio::test]
async fn test_search_sees_vectors_added_after_graph_build() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.index.max_unindexed = 4;
    let store = EmbeddingStore::open(dir.path(), config).await.unwrap();
    store.set_embedding_model("test-model", DIM).await.unwrap();

    let a = ingest(&store, "a.rs", 10, 1).await;
    let exact = SearchOptions::default().with_limit(1).with_min_score(1.0);
    let results = store.search(&a.vectors[3], exact.clone()).await;
    assert_eq!(results[0].chunk_id, a.chunks[3].id);
    let index = store.get_storage_stats().await.unwrap().index.unwrap();
    assert!(index.graph_built);
    assert_eq!(index.unindexed_count, 0);

    let b = ingest(&store, "b.rs", 1, 2).await;
    let results = store.search(&b.vectors[0], exact.clone()).await;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].chunk_id, b.chunks[0].id);

    // Answered from the existing graph plus the one-vector tail
    let index = store.get_storage_stats().await.unwrap().index.unwrap();
    assert!(index.graph_built);
    assert_eq!(index.unindexed_count, 1);

    let results = store.search(&a.vectors[7], exact).await;
    assert_eq!(results[0].chunk_id, a.chunks[7].id);
}

#[tokio::test]
async fn test_rebinding_earlier_dimension_discards_embeddings() {
    let dir = tempfile::tempdir().unwrap();
    let store = open(dir.path()).await;

    assert_eq!(store.bind_dimension(3).await.unwrap(), BindOutcome::Fresh);
    let a = ingest(&store, "a.rs", 2, 1).await;
    store.checkpoint().await.unwrap();

    assert_eq!(store.bind_dimension(5).await.unwrap(), BindOutcome::Fresh);
    let b = ingest(&store, "b.rs", 2, 2).await;
    assert_eq!(
        store.get_embedding_for_chunk(b.chunks[0].id).await.unwrap().unwrap().numeric_label,
        0
    );

    // The 3-d snapshot on disk predates b.rs; it must not be restored
    assert_eq!(store.bind_dimension(3).await.unwrap(), BindOutcome::Fresh);
    let stats = store.get_storage_stats().await.unwrap();
    assert_eq!(stats.embedding_count, 0);
    assert_eq!(stats.index.unwrap().element_count, 0);
    assert_eq!(store.get_files_to_index().await.unwrap().len(), 2);

    let any_score = SearchOptions::default().with_limit(10).with_min_score(-1.0);
    assert!(store.search(&a.vectors[0], any_score.clone()).await.is_empty());

    let a = ingest(&store, "a.rs", 2, 1).await;
    let results = store.search(&a.vectors[0], any_score).await;
    assert!(results.iter().all(|r| r.file_path == "a.rs"));
    assert_eq!(results[0].chunk_id, a.chunks[0].id);
    assert!(store.reconcile().await.unwrap().is_clean());
}
