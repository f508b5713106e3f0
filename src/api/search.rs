//! Search service: k-NN over the vector index, hydrated from the metadata store

use crate::config::{DEFAULT_MIN_SCORE, DEFAULT_SEARCH_LIMIT, SearchConfig};
use crate::error::{CodevecError, Result};
use crate::storage::{ChunkId, Database, FileId, Label, LabeledChunk};
use crate::vector::IndexManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Slack for float error when comparing a score to `min_score`, so an exact
/// self-match still passes a threshold of 1.0
const SCORE_TOLERANCE: f32 = 1e-5;

/// Query options
#[derive(Debug, Clone, PartialEq)]
pub struct SearchOptions {
    pub limit: usize,
    pub min_score: f32,
    /// Only return chunks from these file paths
    pub file_filter: Option<Vec<String>>,
    /// Only return chunks from files in these languages
    pub language_filter: Option<Vec<String>>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: DEFAULT_SEARCH_LIMIT,
            min_score: DEFAULT_MIN_SCORE,
            file_filter: None,
            language_filter: None,
        }
    }
}

impl SearchOptions {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            limit: config.default_limit,
            min_score: config.default_min_score,
            ..Default::default()
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_min_score(mut self, min_score: f32) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn with_files<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.file_filter = Some(paths.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_languages<I, S>(mut self, languages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.language_filter = Some(languages.into_iter().map(Into::into).collect());
        self
    }

    fn accepts(&self, chunk: &LabeledChunk) -> bool {
        if let Some(files) = &self.file_filter {
            if !files.iter().any(|f| f == &chunk.file_path) {
                return false;
            }
        }
        if let Some(languages) = &self.language_filter {
            match &chunk.language {
                Some(language) => {
                    if !languages.iter().any(|l| l.eq_ignore_ascii_case(language)) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// A ranked search hit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub chunk_id: ChunkId,
    pub file_id: FileId,
    pub file_path: String,
    pub content: String,
    pub start_offset: usize,
    pub end_offset: usize,
    /// Cosine similarity, `1 - distance`
    pub score: f32,
    pub language: Option<String>,
}

/// Number of neighbours to ask the index for
pub(crate) fn candidate_count(limit: usize, config: &SearchConfig) -> usize {
    limit
        .saturating_mul(config.oversample_factor.max(1))
        .max(config.min_candidates)
}

/// Run a query against the bound index and hydrate the hits.
///
/// Errors are returned to the caller; the store turns them into an empty
/// result.
pub(crate) fn execute(
    db: &Database,
    index: &mut IndexManager,
    query: &[f32],
    options: &SearchOptions,
    config: &SearchConfig,
) -> Result<Vec<SearchResult>> {
    if options.limit == 0 {
        return Ok(Vec::new());
    }
    let Some(stats) = index.stats() else {
        log::debug!("Search on a store with no bound index");
        return Ok(Vec::new());
    };
    if stats.live_count == 0 {
        return Ok(Vec::new());
    }
    if query.len() != stats.dimension {
        return Err(CodevecError::Validation(format!(
            "query has dimension {}, index expects {}",
            query.len(),
            stats.dimension
        )));
    }

    let k = candidate_count(options.limit, config);
    let neighbours = index.search_knn(query, k)?;

    let scored: HashMap<Label, f32> = neighbours
        .into_iter()
        .map(|(label, distance)| (label, 1.0 - distance))
        .filter(|&(_, score)| score + SCORE_TOLERANCE >= options.min_score)
        .collect();
    if scored.is_empty() {
        return Ok(Vec::new());
    }

    let labels: Vec<Label> = scored.keys().copied().collect();
    let hydrated = db.fetch_labeled_chunks(&labels)?;
    if hydrated.len() < labels.len() {
        let missing = labels.len() - hydrated.len();
        log::warn!(
            "{}",
            CodevecError::Consistency(format!(
                "{} index labels have no embedding row; skipping them",
                missing
            ))
        );
    }

    let mut results: Vec<SearchResult> = hydrated
        .into_iter()
        .filter(|chunk| options.accepts(chunk))
        .filter_map(|chunk| {
            let score = *scored.get(&chunk.label)?;
            Some(SearchResult {
                chunk_id: chunk.chunk_id,
                file_id: chunk.file_id,
                file_path: chunk.file_path,
                content: chunk.content,
                start_offset: chunk.start_offset,
                end_offset: chunk.end_offset,
                score,
                language: chunk.language,
            })
        })
        .collect();

    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.chunk_id.cmp(&b.chunk_id))
    });
    results.truncate(options.limit);

    log::debug!(
        "Search returned {} results ({} candidates requested)",
        results.len(),
        k
    );
    Ok(results)
}
