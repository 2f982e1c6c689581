//! Database facade binding the vector store, metadata store, and query
//! engine under a single surface.
//!
//! The facade owns shared handles to both stores and routes every public
//! operation through them; the query engine is a peer holding the same
//! handles. `save`/`load` round-trip the full artifact set (§persisted
//! layout: ANN blob, ID table, row order, metadata blob, config file).

use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::query::{QueryEngine, SearchStats};
use crate::store::{MetadataStore, StoreStats, VectorStore};
use crate::types::{
    DatabaseConfig, IndexKind, Metadata, MetadataValue, QueryResult, SearchParams, Vector, VectorId,
};
use std::path::Path;
use std::sync::Arc;

/// An embeddable vector database instance.
#[derive(Debug)]
pub struct Database {
    vectors: Arc<VectorStore>,
    metadata: Arc<MetadataStore>,
    engine: QueryEngine,
}

impl Database {
    /// Open a fresh database for a validated configuration.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        let vectors = Arc::new(VectorStore::new(config)?);
        let metadata = Arc::new(MetadataStore::new());
        let engine = QueryEngine::new(Arc::clone(&vectors), Arc::clone(&metadata));
        Ok(Self {
            vectors,
            metadata,
            engine,
        })
    }

    /// Shorthand constructor: dimension, index kind, metric, defaults
    /// everywhere else.
    pub fn with_dimension(dimension: usize, kind: IndexKind, metric: DistanceMetric) -> Result<Self> {
        let mut config = DatabaseConfig::with_dimension(dimension);
        config.index_kind = kind;
        config.metric = metric;
        Self::new(config)
    }

    /// Insert a vector without metadata. Returns the assigned ID.
    pub fn add(&self, vector: Vector) -> Result<VectorId> {
        self.vectors.add(vector)
    }

    /// Insert a vector with metadata.
    pub fn add_with_metadata(&self, vector: Vector, metadata: Metadata) -> Result<VectorId> {
        let id = self.vectors.add(vector)?;
        self.metadata.set(id, metadata)?;
        Ok(id)
    }

    /// Insert a batch; when metadata is supplied it must align 1:1 with
    /// the vectors.
    pub fn add_batch(
        &self,
        vectors: Vec<Vector>,
        metadata: Option<Vec<Metadata>>,
    ) -> Result<Vec<VectorId>> {
        if let Some(ref m) = metadata {
            if m.len() != vectors.len() {
                return Err(Error::InputSizeMismatch(format!(
                    "{} vectors vs {} metadata entries",
                    vectors.len(),
                    m.len()
                )));
            }
        }
        let ids = self.vectors.add_batch(vectors)?;
        if let Some(m) = metadata {
            self.metadata.set_batch(&ids, m)?;
        }
        Ok(ids)
    }

    /// Remove a vector and its metadata. Idempotent; returns whether the
    /// vector existed.
    pub fn remove(&self, id: VectorId) -> Result<bool> {
        let existed = self.vectors.remove(id)?;
        // Metadata goes immediately even when the index keeps the row.
        self.metadata.remove(id);
        Ok(existed)
    }

    /// Update the vector and/or metadata stored under an ID. Vector
    /// updates require adapter mutation support.
    pub fn update(
        &self,
        id: VectorId,
        vector: Option<Vector>,
        metadata: Option<Metadata>,
    ) -> Result<bool> {
        let mut touched = false;
        if let Some(v) = vector {
            if !self.vectors.update(id, v)? {
                return Ok(false);
            }
            touched = true;
        }
        if let Some(m) = metadata {
            self.metadata.set(id, m)?;
            touched = true;
        }
        Ok(touched)
    }

    /// `k`-nearest search with default parameters.
    pub fn search_k(&self, query: &[f32], k: usize) -> Result<Vec<QueryResult>> {
        self.engine.search(query, &SearchParams::with_k(k))
    }

    /// Full-parameter search. A positive `params.radius` routes to range
    /// search.
    pub fn search(&self, query: &[f32], params: &SearchParams) -> Result<Vec<QueryResult>> {
        if params.radius > 0.0 {
            self.engine.range_search(query, params.radius, params)
        } else {
            self.engine.search(query, params)
        }
    }

    /// Search constrained by a metadata predicate.
    pub fn filtered_search<F>(
        &self,
        query: &[f32],
        params: &SearchParams,
        predicate: F,
    ) -> Result<Vec<QueryResult>>
    where
        F: Fn(&Metadata) -> bool,
    {
        self.engine.filtered_search(query, params, predicate)
    }

    /// Independent per-query search preserving input order.
    pub fn batch_search(
        &self,
        queries: &[Vector],
        params: &SearchParams,
    ) -> Result<Vec<Vec<QueryResult>>> {
        self.engine.batch_search(queries, params)
    }

    /// Build (and possibly upgrade) the index. See
    /// [`VectorStore::build_index`].
    pub fn build_index(&self) -> Result<()> {
        self.vectors.build_index()
    }

    /// Train the index, optionally on explicit training data.
    pub fn train_index(&self, training_data: Option<&[Vector]>) -> Result<()> {
        self.vectors.train(training_data)
    }

    /// Whether the backing index is trained.
    pub fn is_trained(&self) -> bool {
        self.vectors.is_trained()
    }

    /// Replace the metadata stored under an ID.
    pub fn set_metadata(&self, id: VectorId, metadata: Metadata) -> Result<()> {
        self.metadata.set(id, metadata)
    }

    /// Metadata stored under an ID, if any.
    pub fn get_metadata(&self, id: VectorId) -> Option<Metadata> {
        self.metadata.get(id)
    }

    /// IDs whose metadata value under `key` equals `value`.
    pub fn find_by_metadata(&self, key: &str, value: &MetadataValue) -> Vec<VectorId> {
        self.metadata.find_by_metadata(key, value)
    }

    /// IDs whose metadata value under `key` starts with `prefix`.
    pub fn find_by_metadata_prefix(&self, key: &str, prefix: &str) -> Vec<VectorId> {
        self.metadata.find_by_metadata_prefix(key, prefix)
    }

    /// Persist all artifacts under `base`.
    pub fn save(&self, base: &Path) -> Result<()> {
        self.vectors.save(base)?;
        let mut metadata_path = base.as_os_str().to_os_string();
        metadata_path.push(".metadata");
        self.metadata.save(Path::new(&metadata_path))?;
        Ok(())
    }

    /// Restore a database persisted by [`save`](Self::save).
    pub fn load(base: &Path) -> Result<Self> {
        let vectors = Arc::new(VectorStore::load(base)?);
        let metadata = Arc::new(MetadataStore::new());
        let mut metadata_path = base.as_os_str().to_os_string();
        metadata_path.push(".metadata");
        let metadata_path = Path::new(&metadata_path);
        if metadata_path.exists() {
            metadata.load(metadata_path)?;
        } else {
            tracing::warn!(path = %metadata_path.display(), "metadata artifact missing; starting empty");
        }
        let engine = QueryEngine::new(Arc::clone(&vectors), Arc::clone(&metadata));
        Ok(Self {
            vectors,
            metadata,
            engine,
        })
    }

    /// Number of live vectors.
    pub fn size(&self) -> usize {
        self.vectors.len()
    }

    /// Configured embedding dimension.
    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    /// Configured index kind.
    pub fn index_kind(&self) -> IndexKind {
        self.vectors.index_kind()
    }

    /// Copy of the store configuration.
    pub fn config(&self) -> DatabaseConfig {
        self.vectors.config()
    }

    /// Store-level counters.
    pub fn stats(&self) -> StoreStats {
        self.vectors.stats()
    }

    /// Stats for the most recent query-engine call.
    pub fn last_search_stats(&self) -> SearchStats {
        self.engine.last_search_stats()
    }

    /// The underlying vector store.
    pub fn vector_store(&self) -> &Arc<VectorStore> {
        &self.vectors
    }

    /// The underlying metadata store.
    pub fn metadata_store(&self) -> &Arc<MetadataStore> {
        &self.metadata
    }

    /// The query engine bound to this database.
    pub fn query_engine(&self) -> &QueryEngine {
        &self.engine
    }
}
