//! # modaldb
//!
//! Embeddable multimodal vector database engine: maps high-dimensional
//! float vectors to stable identifiers, attaches key-value metadata, and
//! answers nearest-neighbor queries optionally constrained by metadata.
//! Multiple per-modality embeddings are reduced to a single fused vector
//! before indexing.
//!
//! This is a synchronous core library with zero async dependencies —
//! suitable for embedding directly in Rust services or language bindings.
//! All ANN algorithms live behind the [`ann::AnnIndex`] trait and are
//! resolved through a process-wide registry; a brute-force fallback keeps
//! search correct before an index is trained.

/// Pluggable ANN index contract, registry, and the built-in adapters
/// (flat, IVF-Flat, IVF-PQ, HNSW).
pub mod ann;
/// Global tuning constants: defaults and input validation limits.
pub mod config;
/// Database facade binding vector store, metadata store, and query engine.
pub mod db;
/// Distance metrics: L2, inner product, and cosine.
pub mod distance;
/// Error enum and crate-wide `Result` alias.
pub mod error;
/// Embedding fusion: dimension alignment, reference strategies, and the
/// strategy registry.
pub mod fusion;
/// Multimodal layer: modality types, processors, and the fusion facade.
pub mod multimodal;
/// Query engine: filtered, batched, range, hybrid, and rerank search.
pub mod query;
/// Vector store, metadata store, and on-disk persistence.
pub mod store;
/// Common types: identifiers, metadata, search parameters, configuration.
pub mod types;

pub use db::Database;
pub use distance::DistanceMetric;
pub use error::{Error, Result};
pub use multimodal::{ModalData, ModalityType, MultimodalData, MultimodalDatabase};
pub use types::{DatabaseConfig, IndexKind, Metadata, MetadataValue, QueryResult, SearchParams, Vector, VectorId};
