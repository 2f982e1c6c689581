//! Query engine: composes ANN search with metadata constraints.
//!
//! The engine holds shared handles to the vector and metadata stores and
//! takes no locks of its own beyond the stats cell — locking discipline is
//! inherited from the stores. Raw metric scores flow through `search` and
//! `range_search` untouched; `hybrid_search` and `search_with_rerank`
//! normalize to a uniform higher-is-better scale before ranking.

use crate::config;
use crate::error::{Error, Result};
use crate::store::{MetadataStore, VectorStore};
use crate::types::{Metadata, QueryResult, SearchParams, Vector, VectorId};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Timing and cardinality counters for the most recent engine call.
#[derive(Debug, Clone, Default)]
pub struct SearchStats {
    /// Candidates produced by the index stage.
    pub candidate_count: usize,
    /// Candidates surviving filtering / fusion.
    pub filtered_count: usize,
    /// Results returned to the caller.
    pub final_count: usize,
    /// Time spent in the index stage.
    pub search_time: Duration,
    /// Time spent filtering, joining metadata, and reranking.
    pub filter_time: Duration,
    /// End-to-end call time.
    pub total_time: Duration,
}

/// Query engine over one vector store and one metadata store.
#[derive(Debug)]
pub struct QueryEngine {
    vectors: Arc<VectorStore>,
    metadata: Arc<MetadataStore>,
    last_stats: Mutex<SearchStats>,
}

impl QueryEngine {
    /// Bind an engine to its two stores.
    pub fn new(vectors: Arc<VectorStore>, metadata: Arc<MetadataStore>) -> Self {
        Self {
            vectors,
            metadata,
            last_stats: Mutex::new(SearchStats::default()),
        }
    }

    /// Stats recorded by the most recent call on this engine.
    pub fn last_search_stats(&self) -> SearchStats {
        self.last_stats.lock().clone()
    }

    fn record(&self, stats: SearchStats) {
        *self.last_stats.lock() = stats;
    }

    fn attach_metadata(&self, results: &mut [QueryResult]) {
        for result in results.iter_mut() {
            if let Some(metadata) = self.metadata.get(result.id) {
                result.metadata = metadata;
            }
        }
    }

    /// Pure ANN search; attaches metadata when requested.
    pub fn search(&self, query: &[f32], params: &SearchParams) -> Result<Vec<QueryResult>> {
        let start = Instant::now();
        let hits = self.vectors.search(query, params)?;
        let mid = Instant::now();

        let mut results: Vec<QueryResult> = hits
            .into_iter()
            .map(|(id, score)| QueryResult::new(id, score))
            .collect();
        if params.include_metadata {
            self.attach_metadata(&mut results);
        }

        let end = Instant::now();
        self.record(SearchStats {
            candidate_count: results.len(),
            filtered_count: results.len(),
            final_count: results.len(),
            search_time: mid - start,
            filter_time: end - mid,
            total_time: end - start,
        });
        Ok(results)
    }

    /// ANN search with a metadata predicate.
    ///
    /// Over-fetches `FILTER_OVERFETCH_FACTOR × k` candidates (bounded by
    /// the store size), keeps those whose metadata passes the predicate,
    /// and truncates to `k`. Candidates without metadata never pass. Fewer
    /// than `k` survivors are returned as-is — no automatic re-query.
    pub fn filtered_search<F>(
        &self,
        query: &[f32],
        params: &SearchParams,
        predicate: F,
    ) -> Result<Vec<QueryResult>>
    where
        F: Fn(&Metadata) -> bool,
    {
        let start = Instant::now();
        let fetch_k = (params.k.saturating_mul(config::FILTER_OVERFETCH_FACTOR))
            .min(self.vectors.len())
            .max(params.k.min(self.vectors.len()));
        let mut expanded = params.clone();
        expanded.k = fetch_k;
        let hits = self.vectors.search(query, &expanded)?;
        let mid = Instant::now();

        let candidate_count = hits.len();
        let mut results = Vec::with_capacity(params.k);
        for (id, score) in hits {
            if results.len() >= params.k {
                break;
            }
            let Some(metadata) = self.metadata.get(id) else {
                continue;
            };
            if predicate(&metadata) {
                let mut result = QueryResult::new(id, score);
                if params.include_metadata {
                    result.metadata = metadata;
                }
                results.push(result);
            }
        }

        let end = Instant::now();
        self.record(SearchStats {
            candidate_count,
            filtered_count: results.len(),
            final_count: results.len(),
            search_time: mid - start,
            filter_time: end - mid,
            total_time: end - start,
        });
        Ok(results)
    }

    /// Independent per-query execution; result order matches query order.
    pub fn batch_search(
        &self,
        queries: &[Vector],
        params: &SearchParams,
    ) -> Result<Vec<Vec<QueryResult>>> {
        queries.iter().map(|q| self.search(q, params)).collect()
    }

    /// Batched variant of [`filtered_search`](Self::filtered_search).
    pub fn batch_filtered_search<F>(
        &self,
        queries: &[Vector],
        params: &SearchParams,
        predicate: F,
    ) -> Result<Vec<Vec<QueryResult>>>
    where
        F: Fn(&Metadata) -> bool,
    {
        queries
            .iter()
            .map(|q| self.filtered_search(q, params, &predicate))
            .collect()
    }

    /// Combine ANN similarity with a substring text match over metadata
    /// values.
    ///
    /// Vector scores are min-max normalized into `[0, 1]` with higher
    /// better regardless of metric; the text score is 1 for a candidate
    /// with any metadata value containing `text_query`, else 0. Final
    /// ranking is `w_vec·norm(vec) + w_text·text`, descending, ties broken
    /// by lower ID. The returned `score` is the combined value.
    pub fn hybrid_search(
        &self,
        query: &[f32],
        params: &SearchParams,
        text_query: &str,
        w_vec: f32,
        w_text: f32,
    ) -> Result<Vec<QueryResult>> {
        let start = Instant::now();
        let mut expanded = params.clone();
        expanded.k = params.k.saturating_mul(config::HYBRID_OVERFETCH_FACTOR).max(params.k);
        let hits = self.vectors.search(query, &expanded)?;
        let mid = Instant::now();

        if text_query.is_empty() {
            let mut results: Vec<QueryResult> = hits
                .into_iter()
                .take(params.k)
                .map(|(id, score)| QueryResult::new(id, score))
                .collect();
            if params.include_metadata {
                self.attach_metadata(&mut results);
            }
            let end = Instant::now();
            self.record(SearchStats {
                candidate_count: results.len(),
                filtered_count: results.len(),
                final_count: results.len(),
                search_time: mid - start,
                filter_time: end - mid,
                total_time: end - start,
            });
            return Ok(results);
        }

        let candidate_count = hits.len();
        let normalized = normalize_higher_better(
            &hits,
            self.vectors.config().metric.higher_is_better(),
        );

        let mut fused: Vec<QueryResult> = Vec::with_capacity(hits.len());
        for (&(id, _), &norm_score) in hits.iter().zip(normalized.iter()) {
            let metadata = self.metadata.get(id);
            let matched = metadata
                .as_ref()
                .is_some_and(|m| m.values().any(|v| v.canonical().contains(text_query)));
            let text_score = if matched { 1.0 } else { 0.0 };
            let combined = w_vec * norm_score + w_text * text_score;
            let mut result = QueryResult::new(id, combined);
            if params.include_metadata {
                if let Some(m) = metadata {
                    result.metadata = m;
                }
            }
            fused.push(result);
        }
        fused.sort_unstable_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        fused.truncate(params.k);

        let end = Instant::now();
        self.record(SearchStats {
            candidate_count,
            filtered_count: fused.len(),
            final_count: fused.len(),
            search_time: mid - start,
            filter_time: end - mid,
            total_time: end - start,
        });
        Ok(fused)
    }

    /// All vectors within `radius` under the configured metric, best
    /// first (ascending distance; descending similarity for inner
    /// product).
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        params: &SearchParams,
    ) -> Result<Vec<QueryResult>> {
        let start = Instant::now();
        let hits = self.vectors.range_search(query, radius, params)?;
        let mid = Instant::now();

        let mut results: Vec<QueryResult> = hits
            .into_iter()
            .map(|(id, score)| QueryResult::new(id, score))
            .collect();
        if params.include_metadata {
            self.attach_metadata(&mut results);
        }
        let end = Instant::now();
        self.record(SearchStats {
            candidate_count: results.len(),
            filtered_count: results.len(),
            final_count: results.len(),
            search_time: mid - start,
            filter_time: end - mid,
            total_time: end - start,
        });
        Ok(results)
    }

    /// Fetch `rerank_k` ANN candidates, score each with `rerank_fn`
    /// (metadata attached), and return the top `params.k` by the new
    /// scalar, descending.
    pub fn search_with_rerank<F>(
        &self,
        query: &[f32],
        params: &SearchParams,
        rerank_fn: F,
        rerank_k: usize,
    ) -> Result<Vec<QueryResult>>
    where
        F: Fn(&QueryResult) -> f32,
    {
        if rerank_k < params.k {
            return Err(Error::InputSizeMismatch(format!(
                "rerank_k ({rerank_k}) must be at least k ({})",
                params.k
            )));
        }
        let start = Instant::now();
        let mut expanded = params.clone();
        expanded.k = rerank_k;
        let hits = self.vectors.search(query, &expanded)?;
        let mid = Instant::now();

        let candidate_count = hits.len();
        let mut candidates: Vec<QueryResult> = hits
            .into_iter()
            .map(|(id, score)| QueryResult::new(id, score))
            .collect();
        self.attach_metadata(&mut candidates);
        for candidate in &mut candidates {
            candidate.score = rerank_fn(candidate);
        }
        candidates.sort_unstable_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.id.cmp(&b.id))
        });
        candidates.truncate(params.k);
        if !params.include_metadata {
            for candidate in &mut candidates {
                candidate.metadata = Metadata::new();
            }
        }

        let end = Instant::now();
        self.record(SearchStats {
            candidate_count,
            filtered_count: candidates.len(),
            final_count: candidates.len(),
            search_time: mid - start,
            filter_time: end - mid,
            total_time: end - start,
        });
        Ok(candidates)
    }

    /// Shared vector store handle.
    pub fn vector_store(&self) -> &Arc<VectorStore> {
        &self.vectors
    }

    /// Shared metadata store handle.
    pub fn metadata_store(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }
}

/// Min-max normalize candidate scores into `[0, 1]` with higher better.
/// Lower-is-better metrics are inverted; a degenerate (constant) range
/// maps every candidate to 1.
fn normalize_higher_better(hits: &[(VectorId, f32)], higher_is_better: bool) -> Vec<f32> {
    if hits.is_empty() {
        return Vec::new();
    }
    let mut min = f32::MAX;
    let mut max = f32::MIN;
    for &(_, s) in hits {
        if s < min {
            min = s;
        }
        if s > max {
            max = s;
        }
    }
    let range = max - min;
    hits.iter()
        .map(|&(_, s)| {
            if range < f32::EPSILON {
                1.0
            } else if higher_is_better {
                (s - min) / range
            } else {
                (max - s) / range
            }
        })
        .collect()
}
