//! Pluggable ANN index contract.
//!
//! Every concrete index implements [`AnnIndex`]: a capability-bearing
//! interface covering fit, search, optional mutation, persistence, and
//! introspection. Indexes address vectors by zero-based dense *row
//! positions*; the vector store owns the mapping from rows to stable IDs.
//!
//! Build and query parameters carry typed well-known fields plus an open
//! string map so algorithm-specific knobs never force an interface change.

/// Brute-force exact index.
pub mod flat;
/// HNSW graph index.
pub mod hnsw;
/// IVF-Flat and IVF-PQ indexes.
pub mod ivf;
/// Process-wide algorithm registry.
pub mod registry;

use crate::distance::DistanceMetric;
use crate::error::Result;
use crate::types::Vector;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::str::FromStr;

/// A search hit at the index level: `(row position, score)`.
pub type RowHit = (usize, f32);

/// Open parameter map with typed default-on-miss access.
///
/// Values are stored as strings and parsed to the expected type on access;
/// a missing or unparseable value yields the caller's default.
#[derive(Debug, Clone, Default)]
pub struct ParamMap {
    entries: HashMap<String, String>,
}

impl ParamMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value by its string form.
    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.entries.insert(key.into(), value.to_string());
    }

    /// Fetch and parse; returns `default` when the key is absent or the
    /// value fails to parse.
    pub fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.entries.get(key) {
            Some(raw) => raw.parse().unwrap_or(default),
            None => default,
        }
    }

    /// Whether the key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Merge raw string entries from another map (the other side wins).
    pub fn extend_raw(&mut self, entries: &HashMap<String, String>) {
        for (k, v) in entries {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    /// Iterate over raw entries.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.entries.iter()
    }
}

/// Parameters consumed by [`AnnIndex::fit`].
#[derive(Debug, Clone)]
pub struct BuildParams {
    /// Distance metric the index must honor.
    pub metric: DistanceMetric,
    /// Embedding dimension.
    pub dimension: usize,
    /// Algorithm-specific tuning.
    pub extras: ParamMap,
}

impl BuildParams {
    /// Build parameters with empty extras.
    pub fn new(metric: DistanceMetric, dimension: usize) -> Self {
        Self {
            metric,
            dimension,
            extras: ParamMap::new(),
        }
    }
}

/// Parameters consumed by the search entry points.
#[derive(Debug, Clone)]
pub struct QueryParams {
    /// Number of neighbors requested.
    pub k: usize,
    /// Inverted lists probed per query (IVF).
    pub nprobe: u32,
    /// Search-time candidate list size (HNSW). `0` uses the index default.
    pub ef_search: usize,
    /// Algorithm-specific tuning.
    pub extras: ParamMap,
}

impl Default for QueryParams {
    fn default() -> Self {
        Self {
            k: 10,
            nprobe: crate::config::IVF_DEFAULT_NPROBE,
            ef_search: 0,
            extras: ParamMap::new(),
        }
    }
}

impl QueryParams {
    /// Query parameters requesting `k` neighbors.
    pub fn with_k(k: usize) -> Self {
        Self {
            k,
            ..Self::default()
        }
    }
}

/// Metrics reported by a fit operation.
#[derive(Debug, Clone, Default)]
pub struct AnnMetrics {
    /// Wall-clock build time in seconds.
    pub build_time_secs: f64,
    /// Estimated resident memory of the index in bytes.
    pub memory_bytes: usize,
    /// Distance computations performed during the build.
    pub distance_computations: u64,
    /// Algorithm-specific counters.
    pub extras: HashMap<String, f64>,
}

/// Introspection snapshot of a live index.
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    /// Number of rows currently held (including tombstoned rows).
    pub rows: usize,
    /// Estimated resident memory in bytes.
    pub memory_bytes: usize,
    /// Algorithm-specific counters.
    pub extras: HashMap<String, f64>,
}

/// Capability contract every concrete ANN index honors.
///
/// Rows are dense zero-based positions assigned in insertion order. The
/// `(row, score)` pairs returned by search are ordered better-first under
/// the metric the index was built with.
pub trait AnnIndex: Send + Sync + std::fmt::Debug {
    /// Algorithm name as registered.
    fn name(&self) -> &'static str;

    /// Algorithm version string.
    fn version(&self) -> &'static str {
        "1"
    }

    /// Metrics this algorithm can serve.
    fn supported_metrics(&self) -> &'static [DistanceMetric];

    /// Train the index on an ordered batch of training vectors, resetting
    /// any existing rows.
    ///
    /// Training never creates rows: vectors enter the index through
    /// [`add_vectors`](Self::add_vectors). Algorithms that are trained from
    /// birth (flat, HNSW) treat `fit` as a reset with new parameters.
    fn fit(&mut self, vectors: &[Vector], params: &BuildParams) -> Result<AnnMetrics>;

    /// Whether the index is ready to be queried.
    fn is_trained(&self) -> bool;

    /// Up to `params.k` nearest rows, better-first.
    fn search(&self, query: &[f32], params: &QueryParams) -> Result<Vec<RowHit>>;

    /// Independent per-query search; output order matches input order.
    fn batch_search(&self, queries: &[Vector], params: &QueryParams) -> Result<Vec<Vec<RowHit>>> {
        queries.iter().map(|q| self.search(q, params)).collect()
    }

    /// All rows within `radius` of the query, better-first.
    fn range_search(&self, query: &[f32], radius: f32, params: &QueryParams) -> Result<Vec<RowHit>> {
        let _ = (query, radius, params);
        Err(crate::error::Error::UnsupportedOperation {
            index: self.name().into(),
            operation: "range search",
        })
    }

    /// Whether rows can be appended after training.
    fn supports_add(&self) -> bool {
        false
    }

    /// Whether rows can be removed.
    fn supports_remove(&self) -> bool {
        false
    }

    /// Whether range search is implemented.
    fn supports_range(&self) -> bool {
        false
    }

    /// Whether concurrent read-side searches are safe (shared-lock hint).
    fn concurrent_reads(&self) -> bool {
        true
    }

    /// Append vectors; returns the newly assigned row positions.
    fn add_vectors(&mut self, vectors: &[Vector]) -> Result<Vec<usize>> {
        let _ = vectors;
        Err(crate::error::Error::UnsupportedOperation {
            index: self.name().into(),
            operation: "adding vectors",
        })
    }

    /// Remove rows by position. Positions stay stable (tombstoning).
    fn remove_vectors(&mut self, rows: &[usize]) -> Result<()> {
        let _ = rows;
        Err(crate::error::Error::UnsupportedOperation {
            index: self.name().into(),
            operation: "removing vectors",
        })
    }

    /// Serialize the index to a byte stream. Returns `Ok(false)` when there
    /// is nothing to persist (untrained index).
    fn save(&self, writer: &mut dyn Write) -> Result<bool>;

    /// Restore the index from a byte stream. Returns `Ok(false)` when the
    /// stream holds no index.
    fn load(&mut self, reader: &mut dyn Read) -> Result<bool>;

    /// Reconstruct the stored vector at `row`, where supported.
    fn reconstruct(&self, row: usize) -> Option<Vector> {
        let _ = row;
        None
    }

    /// Introspection snapshot.
    fn stats(&self) -> IndexStats;

    /// Snapshot of the build parameters in effect.
    fn build_params(&self) -> BuildParams;
}

/// Factory producing fresh index instances for a registered algorithm.
pub trait AnnFactory: Send + Sync {
    /// Registered algorithm name.
    fn name(&self) -> &'static str;

    /// One-line description.
    fn description(&self) -> &'static str;

    /// Metrics instances of this algorithm can serve.
    fn supported_metrics(&self) -> &'static [DistanceMetric];

    /// Create an index for the given build parameters.
    fn create(&self, params: &BuildParams) -> Result<Box<dyn AnnIndex>>;
}

/// Check that `metric` is served by the algorithm; uniform error shape.
pub(crate) fn check_metric(
    name: &str,
    supported: &[DistanceMetric],
    metric: DistanceMetric,
) -> Result<()> {
    if supported.contains(&metric) {
        Ok(())
    } else {
        Err(crate::error::Error::UnsupportedMetric {
            index: name.into(),
            metric: metric.to_string(),
        })
    }
}
