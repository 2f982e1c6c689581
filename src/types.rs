//! Common types: identifiers, metadata, search parameters, configuration.
//!
//! A `Vector` is an ordered sequence of `f32` whose length always equals the
//! owning store's configured dimension. `VectorId`s are engine-assigned,
//! strictly positive, and never reused; `0` is the unassigned sentinel.

use crate::config;
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Engine-assigned stable identifier for a stored vector.
///
/// Strictly positive; `UNASSIGNED_ID` (0) is reserved.
pub type VectorId = u64;

/// Sentinel for "no ID assigned yet".
pub const UNASSIGNED_ID: VectorId = 0;

/// A dense embedding: ordered `f32` values.
pub type Vector = Vec<f32>;

/// A typed metadata value attached to a vector.
///
/// Equality is value-level; the canonical string form (used by the inverted
/// index and prefix lookups) is stable across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetadataValue {
    /// UTF-8 string.
    Str(String),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit floating-point number.
    Float(f64),
    /// Boolean value.
    Bool(bool),
}

impl MetadataValue {
    /// Canonical string form used for inverted-index keys and prefix match.
    pub fn canonical(&self) -> String {
        match self {
            MetadataValue::Str(s) => s.clone(),
            MetadataValue::Int(i) => i.to_string(),
            // Debug formatting keeps the ".0" on integral floats, so
            // `Float(3.0)` and `Int(3)` never collide in the inverted index.
            MetadataValue::Float(f) => format!("{f:?}"),
            MetadataValue::Bool(b) => b.to_string(),
        }
    }

    /// Borrow the string payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Str(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        MetadataValue::Float(f)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

/// Arbitrary key-value metadata for a vector. A missing key is distinct
/// from an empty string.
pub type Metadata = HashMap<String, MetadataValue>;

/// A single search hit: stable ID, score, and (optionally) metadata.
///
/// Score semantics follow the configured metric: L2 and cosine are
/// distances (lower is better); inner product is a similarity (higher is
/// better). Hybrid and rerank operators normalize to higher-is-better.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryResult {
    /// Stable identifier of the matched vector.
    pub id: VectorId,
    /// Raw score under the configured metric.
    pub score: f32,
    /// Attached metadata; empty unless `include_metadata` was requested
    /// or no metadata exists for the ID.
    pub metadata: Metadata,
}

impl QueryResult {
    /// Creates a result without metadata.
    pub fn new(id: VectorId, score: f32) -> Self {
        Self {
            id,
            score,
            metadata: Metadata::new(),
        }
    }
}

/// Parameters for a search request.
#[derive(Debug, Clone)]
pub struct SearchParams {
    /// Number of nearest neighbors to return.
    pub k: usize,
    /// Number of inverted lists probed (IVF indexes).
    pub nprobe: u32,
    /// Candidate list size during search (HNSW). `0` uses the index default.
    pub ef_search: usize,
    /// Radius for range-style search; negative disables.
    pub radius: f32,
    /// Whether to attach metadata to results.
    pub include_metadata: bool,
    /// Algorithm-specific extras forwarded to the adapter untouched.
    pub extras: HashMap<String, String>,
}

impl Default for SearchParams {
    fn default() -> Self {
        Self {
            k: 10,
            nprobe: config::IVF_DEFAULT_NPROBE,
            ef_search: 0,
            radius: -1.0,
            include_metadata: true,
            extras: HashMap::new(),
        }
    }
}

impl SearchParams {
    /// Parameters requesting `k` neighbors, everything else default.
    pub fn with_k(k: usize) -> Self {
        Self {
            k,
            ..Self::default()
        }
    }
}

/// The kind of ANN index backing a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    /// Brute force, exact search.
    Flat,
    /// Inverted file with exact residual scan.
    IvfFlat,
    /// Inverted file with product-quantized codes.
    IvfPq,
    /// Hierarchical navigable small world graph.
    Hnsw,
    /// Start flat, upgrade heuristically as the store grows.
    Auto,
}

impl IndexKind {
    /// Stable string form, persisted in the config artifact.
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexKind::Flat => "flat",
            IndexKind::IvfFlat => "ivf_flat",
            IndexKind::IvfPq => "ivf_pq",
            IndexKind::Hnsw => "hnsw",
            IndexKind::Auto => "auto",
        }
    }

    /// Whether this kind requires a training pass before it can be queried.
    pub fn requires_training(&self) -> bool {
        matches!(self, IndexKind::IvfFlat | IndexKind::IvfPq)
    }
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "flat" => Ok(IndexKind::Flat),
            "ivf_flat" => Ok(IndexKind::IvfFlat),
            "ivf_pq" => Ok(IndexKind::IvfPq),
            "hnsw" => Ok(IndexKind::Hnsw),
            "auto" => Ok(IndexKind::Auto),
            other => Err(Error::InvalidConfig(format!("unknown index kind '{other}'"))),
        }
    }
}

/// Immutable per-store configuration.
///
/// Fixed at store creation; `validate()` is called before any store
/// structure is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Embedding dimension. Must be positive.
    pub dimension: usize,
    /// Index algorithm backing the store.
    pub index_kind: IndexKind,
    /// Distance metric for similarity computation.
    pub metric: DistanceMetric,
    /// Number of coarse clusters (IVF kinds).
    pub nlist: u32,
    /// Number of PQ sub-quantizers (IVF-PQ).
    pub pq_m: u32,
    /// Bits per PQ code (IVF-PQ). Only 8 is supported.
    pub pq_nbits: u32,
    /// Bidirectional links per node (HNSW).
    pub hnsw_m: usize,
    /// Construction-time candidate list size (HNSW).
    pub hnsw_ef_construction: usize,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dimension: 0,
            index_kind: IndexKind::Auto,
            metric: DistanceMetric::L2,
            nlist: config::IVF_DEFAULT_NLIST,
            pq_m: config::PQ_DEFAULT_M,
            pq_nbits: config::PQ_DEFAULT_NBITS,
            hnsw_m: config::HNSW_DEFAULT_M,
            hnsw_ef_construction: config::HNSW_DEFAULT_EF_CONSTRUCTION,
        }
    }
}

impl DatabaseConfig {
    /// Configuration with the given dimension and defaults everywhere else.
    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            ..Self::default()
        }
    }

    /// Validate the configuration. Returns `InvalidConfig` on zero
    /// dimension or contradictory parameters.
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 {
            return Err(Error::InvalidConfig("dimension must be positive".into()));
        }
        if self.dimension > config::MAX_DIMENSION {
            return Err(Error::InvalidConfig(format!(
                "dimension {} exceeds maximum {}",
                self.dimension,
                config::MAX_DIMENSION
            )));
        }
        if self.index_kind.requires_training() && self.nlist == 0 {
            return Err(Error::InvalidConfig("nlist must be positive for IVF indexes".into()));
        }
        if self.index_kind == IndexKind::IvfPq {
            if self.pq_nbits != 8 {
                return Err(Error::InvalidConfig(format!(
                    "only 8-bit PQ codes are supported, got nbits={}",
                    self.pq_nbits
                )));
            }
            if self.pq_m == 0 || self.dimension % self.pq_m as usize != 0 {
                return Err(Error::InvalidConfig(format!(
                    "pq_m={} must evenly divide dimension {}",
                    self.pq_m, self.dimension
                )));
            }
        }
        if self.index_kind == IndexKind::Hnsw && self.hnsw_m == 0 {
            return Err(Error::InvalidConfig("hnsw_m must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_kind_roundtrip() {
        for kind in [
            IndexKind::Flat,
            IndexKind::IvfFlat,
            IndexKind::IvfPq,
            IndexKind::Hnsw,
            IndexKind::Auto,
        ] {
            let parsed: IndexKind = kind.as_str().parse().unwrap();
            assert_eq!(parsed, kind);
        }
    }

    #[test]
    fn test_index_kind_unknown() {
        let err = "annoy".parse::<IndexKind>().unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_requires_training() {
        assert!(IndexKind::IvfFlat.requires_training());
        assert!(IndexKind::IvfPq.requires_training());
        assert!(!IndexKind::Flat.requires_training());
        assert!(!IndexKind::Hnsw.requires_training());
        assert!(!IndexKind::Auto.requires_training());
    }

    #[test]
    fn test_config_zero_dimension_rejected() {
        let cfg = DatabaseConfig::default();
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_config_valid_flat() {
        let mut cfg = DatabaseConfig::with_dimension(128);
        cfg.index_kind = IndexKind::Flat;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_config_pq_m_must_divide_dimension() {
        let mut cfg = DatabaseConfig::with_dimension(10);
        cfg.index_kind = IndexKind::IvfPq;
        cfg.pq_m = 3;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
        cfg.pq_m = 5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_config_pq_nbits_fixed() {
        let mut cfg = DatabaseConfig::with_dimension(16);
        cfg.index_kind = IndexKind::IvfPq;
        cfg.pq_nbits = 4;
        assert!(matches!(cfg.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_metadata_value_canonical() {
        assert_eq!(MetadataValue::from("red").canonical(), "red");
        assert_eq!(MetadataValue::Int(42).canonical(), "42");
        assert_eq!(MetadataValue::Bool(true).canonical(), "true");
        assert_eq!(MetadataValue::Float(1.5).canonical(), "1.5");
    }

    #[test]
    fn test_metadata_value_equality_is_typed() {
        assert_ne!(MetadataValue::from("42"), MetadataValue::Int(42));
        assert_eq!(MetadataValue::Int(42), MetadataValue::Int(42));
    }

    #[test]
    fn test_search_params_with_k() {
        let p = SearchParams::with_k(5);
        assert_eq!(p.k, 5);
        assert!(p.include_metadata);
        assert!(p.radius < 0.0);
    }
}
