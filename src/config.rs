//! Global configuration constants for modaldb.
//!
//! Tuning defaults and input validation limits live here. Per-store runtime
//! configuration is carried by [`crate::types::DatabaseConfig`].

/// Default number of coarse clusters for IVF indexes.
pub const IVF_DEFAULT_NLIST: u32 = 100;

/// Default number of inverted lists probed per IVF query.
pub const IVF_DEFAULT_NPROBE: u32 = 1;

/// Number of k-means iterations when training IVF coarse centroids.
pub const IVF_KMEANS_ITERATIONS: usize = 20;

/// Default number of PQ sub-quantizers.
pub const PQ_DEFAULT_M: u32 = 8;

/// Bits per PQ code. Only 8 is supported (one `u8` code per subspace).
pub const PQ_DEFAULT_NBITS: u32 = 8;

/// Centroids per PQ subspace (`2^PQ_DEFAULT_NBITS`).
pub const PQ_NUM_CENTROIDS: usize = 256;

/// Number of k-means iterations when training PQ codebooks.
pub const PQ_KMEANS_ITERATIONS: usize = 15;

/// Default number of bidirectional links per HNSW node.
///
/// Higher values improve recall but increase memory and build time.
/// Typical range: 8–64.
pub const HNSW_DEFAULT_M: usize = 16;

/// Default ef parameter during HNSW index construction.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default ef parameter during HNSW search.
pub const HNSW_DEFAULT_EF_SEARCH: usize = 50;

/// Maximum number of layers in the HNSW graph.
pub const HNSW_MAX_LAYERS: usize = 16;

/// Over-fetch multiplier for filtered search: `alpha * k` candidates are
/// requested from the index before the metadata predicate is applied.
pub const FILTER_OVERFETCH_FACTOR: usize = 4;

/// Candidate multiplier for hybrid search.
pub const HYBRID_OVERFETCH_FACTOR: usize = 2;

/// Vector count at which `build_index` upgrades an `auto` store from flat
/// to IVF-Flat. Heuristic only — not part of the API contract.
pub const AUTO_IVF_THRESHOLD: usize = 10_000;

/// Maximum allowed embedding dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Maximum number of results (`k`) per search request.
pub const MAX_K: usize = 10_000;

/// Maximum number of metadata keys per entry.
pub const MAX_METADATA_KEYS: usize = 1_000;

/// Maximum length of a metadata key in bytes.
pub const MAX_METADATA_KEY_LEN: usize = 256;

/// Maximum length of a metadata string value in bytes.
pub const MAX_METADATA_VALUE_LEN: usize = 10_000;

/// Maximum number of modalities carried by a single multimodal item.
pub const MAX_MODALITIES_PER_ITEM: usize = 8;
