//! Storage layer: vector store, metadata store, and on-disk persistence.

/// ID→metadata map with inverted equality and prefix indices.
pub mod metadata_store;
/// Artifact encoding: framed blobs, fixed-layout tables, config file.
pub mod persistence;
/// Vector store: ID allocation, staging, row mapping, fallback search.
pub mod vector_store;

pub use metadata_store::MetadataStore;
pub use vector_store::{StoreStats, VectorStore};
