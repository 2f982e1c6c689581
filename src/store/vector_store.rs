//! Vector store: stable ID allocation, staging, row mapping, persistence.
//!
//! The store owns the authoritative `id → vector` copy and the
//! `row → id` sequence that translates index-internal row positions back
//! to stable IDs. Inserts arriving before a training-required index is
//! trained are staged and bulk-inserted on training completion; searches
//! in that window run against a brute-force scan of the vector copy so
//! results are always available.
//!
//! IDs are allocated from an atomic counter starting at 1 and are never
//! reused, not even after deletion. `0` is reserved.

use crate::ann::{registry, AnnIndex, AnnMetrics, BuildParams, IndexStats, QueryParams, RowHit};
use crate::config;
use crate::error::{Error, Result};
use crate::store::persistence;
use crate::types::{DatabaseConfig, IndexKind, SearchParams, Vector, VectorId, UNASSIGNED_ID};
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of store-level counters.
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Live vectors (staged ones included).
    pub vectors: usize,
    /// Vectors waiting in the pre-training staging buffer.
    pub staged: usize,
    /// Whether the backing index is trained.
    pub trained: bool,
    /// Index-level introspection.
    pub index: IndexStats,
}

#[derive(Debug)]
struct Inner {
    config: DatabaseConfig,
    index: Box<dyn AnnIndex>,
    /// Registered algorithm name currently backing the store.
    algorithm: String,
    /// Authoritative embedding copy, used for rebuilds and fallback search.
    id_to_vector: HashMap<VectorId, Vector>,
    /// Index-row-position → stable ID, appended in row assignment order.
    row_to_id: Vec<VectorId>,
    id_to_row: HashMap<VectorId, usize>,
    /// Pre-training inserts, in arrival order.
    staging: Vec<(VectorId, Vector)>,
    last_metrics: Option<AnnMetrics>,
}

impl Inner {
    fn build_params(&self) -> BuildParams {
        let mut params = BuildParams::new(self.config.metric, self.config.dimension);
        params.extras.set("nlist", self.config.nlist);
        params.extras.set("pq_m", self.config.pq_m);
        params.extras.set("m", self.config.hnsw_m);
        params.extras.set("ef_construction", self.config.hnsw_ef_construction);
        params
    }

    /// Record a freshly assigned index row for `id`, defensively handling
    /// non-sequential assignments.
    fn record_row(&mut self, id: VectorId, row: usize) {
        if row == self.row_to_id.len() {
            self.row_to_id.push(id);
        } else {
            if row >= self.row_to_id.len() {
                self.row_to_id.resize(row + 1, UNASSIGNED_ID);
            }
            self.row_to_id[row] = id;
        }
        self.id_to_row.insert(id, row);
    }

    /// Translate index hits to stable IDs. Rows outside the mapping and
    /// rows whose ID no longer exists are discarded.
    fn remap(&self, hits: Vec<RowHit>) -> Vec<(VectorId, f32)> {
        hits.into_iter()
            .filter_map(|(row, score)| {
                self.row_to_id
                    .get(row)
                    .copied()
                    .filter(|id| *id != UNASSIGNED_ID && self.id_to_vector.contains_key(id))
                    .map(|id| (id, score))
            })
            .collect()
    }

    /// Exact scan over the authoritative copy — used whenever the index
    /// cannot serve the query.
    fn fallback_top_k(&self, query: &[f32], k: usize) -> Vec<(VectorId, f32)> {
        let metric = self.config.metric;
        let mut heap: BinaryHeap<(OrderedFloat<f32>, VectorId)> = BinaryHeap::with_capacity(k + 1);
        for (&id, vector) in &self.id_to_vector {
            let score = metric.score(query, vector);
            let rank = if metric.higher_is_better() { -score } else { score };
            heap.push((OrderedFloat(rank), id));
            if heap.len() > k {
                heap.pop();
            }
        }
        let mut hits: Vec<(VectorId, f32)> = heap
            .into_iter()
            .map(|(rank, id)| {
                let score = if metric.higher_is_better() { -rank.0 } else { rank.0 };
                (id, score)
            })
            .collect();
        hits.sort_unstable_by(|a, b| metric.better_first(a.1, b.1).then(a.0.cmp(&b.0)));
        hits
    }

    fn fallback_range(&self, query: &[f32], radius: f32) -> Vec<(VectorId, f32)> {
        let metric = self.config.metric;
        let mut hits: Vec<(VectorId, f32)> = self
            .id_to_vector
            .iter()
            .filter_map(|(&id, vector)| {
                let score = metric.score(query, vector);
                metric.within_radius(score, radius).then_some((id, score))
            })
            .collect();
        hits.sort_unstable_by(|a, b| metric.better_first(a.1, b.1).then(a.0.cmp(&b.0)));
        hits
    }

    fn query_params(params: &SearchParams) -> QueryParams {
        let mut qp = QueryParams {
            k: params.k,
            nprobe: params.nprobe,
            ef_search: params.ef_search,
            ..QueryParams::default()
        };
        qp.extras.extend_raw(&params.extras);
        qp
    }
}

/// Thread-safe vector store bound to one ANN index instance.
#[derive(Debug)]
pub struct VectorStore {
    inner: RwLock<Inner>,
    next_id: AtomicU64,
    /// Captured at index creation: whether searches may share the lock.
    concurrent_reads: bool,
}

fn algorithm_for_kind(kind: IndexKind) -> &'static str {
    match kind {
        IndexKind::Flat => "flat",
        IndexKind::IvfFlat => "ivf_flat",
        IndexKind::IvfPq => "ivf_pq",
        IndexKind::Hnsw => "hnsw",
        // Auto starts flat; build_index may upgrade once the store grows.
        IndexKind::Auto => "flat",
    }
}

fn hash_vector(vector: &[f32]) -> u64 {
    let mut hasher = DefaultHasher::new();
    for value in vector {
        value.to_bits().hash(&mut hasher);
    }
    hasher.finish()
}

fn artifact(base: &Path, suffix: &str) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl VectorStore {
    /// Create a store for the given (validated) configuration.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        config.validate()?;
        let algorithm = algorithm_for_kind(config.index_kind).to_string();
        let mut params = BuildParams::new(config.metric, config.dimension);
        params.extras.set("nlist", config.nlist);
        params.extras.set("pq_m", config.pq_m);
        params.extras.set("m", config.hnsw_m);
        params.extras.set("ef_construction", config.hnsw_ef_construction);
        let index = registry::create(&algorithm, &params)?;
        let concurrent_reads = index.concurrent_reads();
        Ok(Self {
            inner: RwLock::new(Inner {
                config,
                index,
                algorithm,
                id_to_vector: HashMap::new(),
                row_to_id: Vec::new(),
                id_to_row: HashMap::new(),
                staging: Vec::new(),
                last_metrics: None,
            }),
            next_id: AtomicU64::new(1),
            concurrent_reads,
        })
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        Error::check_dimension(self.dimension(), vector.len())
    }

    /// Insert one vector, returning its new stable ID.
    pub fn add(&self, vector: Vector) -> Result<VectorId> {
        self.add_batch(vec![vector]).map(|ids| ids[0])
    }

    /// Insert a batch; IDs are assigned in input order.
    pub fn add_batch(&self, vectors: Vec<Vector>) -> Result<Vec<VectorId>> {
        for v in &vectors {
            self.check_dimension(v)?;
        }
        let mut inner = self.inner.write();
        let ids: Vec<VectorId> = vectors
            .iter()
            .map(|_| self.next_id.fetch_add(1, Ordering::Relaxed))
            .collect();

        let direct = inner.index.is_trained() && inner.index.supports_add();
        if direct {
            let rows = inner.index.add_vectors(&vectors)?;
            for (&id, &row) in ids.iter().zip(rows.iter()) {
                inner.record_row(id, row);
            }
        }
        for (&id, v) in ids.iter().zip(vectors.into_iter()) {
            if !direct {
                inner.staging.push((id, v.clone()));
            }
            inner.id_to_vector.insert(id, v);
        }
        Ok(ids)
    }

    /// Remove a vector by ID. Idempotent: removing an unknown ID returns
    /// `false` without error. IDs are never reused afterwards.
    pub fn remove(&self, id: VectorId) -> Result<bool> {
        let mut inner = self.inner.write();
        if inner.id_to_vector.remove(&id).is_none() {
            return Ok(false);
        }
        if let Some(pos) = inner.staging.iter().position(|(staged, _)| *staged == id) {
            inner.staging.remove(pos);
        } else if let Some(row) = inner.id_to_row.remove(&id) {
            if inner.index.supports_remove() {
                inner.index.remove_vectors(&[row])?;
            }
            // Row slot stays; remap filters it because the ID is gone.
        }
        Ok(true)
    }

    /// Replace the embedding stored under an existing ID.
    ///
    /// Requires adapter mutation support once the ID has left staging.
    pub fn update(&self, id: VectorId, vector: Vector) -> Result<bool> {
        self.check_dimension(&vector)?;
        let mut inner = self.inner.write();
        if !inner.id_to_vector.contains_key(&id) {
            return Ok(false);
        }
        if let Some(entry) = inner.staging.iter_mut().find(|(staged, _)| *staged == id) {
            entry.1 = vector.clone();
        } else if let Some(&row) = inner.id_to_row.get(&id) {
            if !(inner.index.supports_add() && inner.index.supports_remove()) {
                return Err(Error::UnsupportedOperation {
                    index: inner.index.name().into(),
                    operation: "in-place vector update",
                });
            }
            inner.index.remove_vectors(&[row])?;
            let rows = inner.index.add_vectors(std::slice::from_ref(&vector))?;
            let new_row = rows[0];
            // Retire the old slot so the ID maps to exactly one row.
            inner.row_to_id[row] = UNASSIGNED_ID;
            inner.record_row(id, new_row);
        }
        inner.id_to_vector.insert(id, vector);
        Ok(true)
    }

    /// K-nearest search. Falls back to an exact scan while the index is
    /// untrained; raises `NotTrained` only when there is nothing to scan.
    pub fn search(&self, query: &[f32], params: &SearchParams) -> Result<Vec<(VectorId, f32)>> {
        self.check_dimension(query)?;
        let guard;
        let inner: &Inner = if self.concurrent_reads {
            guard = ReadOrWrite::Read(self.inner.read());
            guard.as_ref()
        } else {
            guard = ReadOrWrite::Write(self.inner.write());
            guard.as_ref()
        };

        if inner.index.is_trained() {
            let hits = inner.index.search(query, &Inner::query_params(params))?;
            return Ok(inner.remap(hits));
        }
        if inner.id_to_vector.is_empty() && inner.staging.is_empty() {
            return Err(Error::NotTrained);
        }
        Ok(inner.fallback_top_k(query, params.k))
    }

    /// All vectors within `radius` under the configured metric. Falls back
    /// to an exact scan when the adapter lacks range support.
    pub fn range_search(
        &self,
        query: &[f32],
        radius: f32,
        params: &SearchParams,
    ) -> Result<Vec<(VectorId, f32)>> {
        self.check_dimension(query)?;
        let inner = self.inner.read();
        if inner.index.is_trained() && inner.index.supports_range() {
            let hits = inner
                .index
                .range_search(query, radius, &Inner::query_params(params))?;
            return Ok(inner.remap(hits));
        }
        Ok(inner.fallback_range(query, radius))
    }

    /// Independent per-query search; output order matches input order.
    pub fn batch_search(
        &self,
        queries: &[Vector],
        params: &SearchParams,
    ) -> Result<Vec<Vec<(VectorId, f32)>>> {
        queries.iter().map(|q| self.search(q, params)).collect()
    }

    /// Train the index. Idempotent: a second call on a trained index is a
    /// no-op. Explicit training data takes precedence; otherwise the staged
    /// vectors (or the full authoritative copy) are used.
    pub fn train(&self, training_data: Option<&[Vector]>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.index.is_trained() {
            return Ok(());
        }
        if let Some(data) = training_data {
            for v in data {
                Error::check_dimension(inner.config.dimension, v.len())?;
            }
        }
        let data: Vec<Vector> = match training_data {
            Some(data) => data.to_vec(),
            None if !inner.staging.is_empty() => {
                inner.staging.iter().map(|(_, v)| v.clone()).collect()
            }
            None => {
                let mut ids: Vec<VectorId> = inner.id_to_vector.keys().copied().collect();
                ids.sort_unstable();
                ids.iter().map(|id| inner.id_to_vector[id].clone()).collect()
            }
        };
        let params = inner.build_params();
        let metrics = inner.index.fit(&data, &params)?;
        tracing::info!(
            algorithm = inner.algorithm.as_str(),
            vectors = data.len(),
            build_secs = metrics.build_time_secs,
            "index trained"
        );
        inner.last_metrics = Some(metrics);

        // Drain staging in arrival order; row_to_id follows in lockstep.
        let staged = std::mem::take(&mut inner.staging);
        if !staged.is_empty() {
            let vectors: Vec<Vector> = staged.iter().map(|(_, v)| v.clone()).collect();
            let rows = inner.index.add_vectors(&vectors)?;
            for ((id, _), row) in staged.iter().zip(rows.into_iter()) {
                inner.record_row(*id, row);
            }
        }
        Ok(())
    }

    /// Build the index: trains a training-required index once the staging
    /// buffer has reached `nlist`, and upgrades an `auto` store to IVF-Flat
    /// past the size threshold.
    pub fn build_index(&self) -> Result<()> {
        let needs_training;
        let staged;
        let auto_upgrade;
        {
            let inner = self.inner.read();
            needs_training = !inner.index.is_trained();
            staged = inner.staging.len();
            auto_upgrade = inner.config.index_kind == IndexKind::Auto
                && inner.algorithm == "flat"
                && inner.id_to_vector.len() >= config::AUTO_IVF_THRESHOLD;
        }
        if needs_training {
            let nlist = self.inner.read().config.nlist as usize;
            if staged >= nlist {
                self.train(None)?;
            }
            return Ok(());
        }
        if auto_upgrade {
            self.rebuild_as("ivf_flat")?;
        }
        Ok(())
    }

    /// Rebuild the store contents onto a different registered algorithm.
    fn rebuild_as(&self, algorithm: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let params = inner.build_params();
        let mut index = registry::create(algorithm, &params)?;

        let mut ids: Vec<VectorId> = inner.id_to_vector.keys().copied().collect();
        ids.sort_unstable();
        let vectors: Vec<Vector> = ids.iter().map(|id| inner.id_to_vector[id].clone()).collect();

        let metrics = index.fit(&vectors, &params)?;
        let rows = index.add_vectors(&vectors)?;
        inner.row_to_id.clear();
        inner.id_to_row.clear();
        for (&id, row) in ids.iter().zip(rows.into_iter()) {
            inner.record_row(id, row);
        }
        tracing::info!(
            from = inner.algorithm.as_str(),
            to = algorithm,
            vectors = vectors.len(),
            "index rebuilt"
        );
        inner.index = index;
        inner.algorithm = algorithm.to_string();
        inner.last_metrics = Some(metrics);
        Ok(())
    }

    /// Whether the backing index is trained.
    pub fn is_trained(&self) -> bool {
        self.inner.read().index.is_trained()
    }

    /// Number of live vectors.
    pub fn len(&self) -> usize {
        self.inner.read().id_to_vector.len()
    }

    /// Whether the store holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an ID is live (inserted and not removed).
    pub fn contains(&self, id: VectorId) -> bool {
        self.inner.read().id_to_vector.contains_key(&id)
    }

    /// Copy of the embedding stored under an ID.
    pub fn get_vector(&self, id: VectorId) -> Option<Vector> {
        self.inner.read().id_to_vector.get(&id).cloned()
    }

    /// Configured embedding dimension.
    pub fn dimension(&self) -> usize {
        self.inner.read().config.dimension
    }

    /// Configured index kind.
    pub fn index_kind(&self) -> IndexKind {
        self.inner.read().config.index_kind
    }

    /// Copy of the store configuration.
    pub fn config(&self) -> DatabaseConfig {
        self.inner.read().config.clone()
    }

    /// Store-level counters and index introspection.
    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.read();
        StoreStats {
            vectors: inner.id_to_vector.len(),
            staged: inner.staging.len(),
            trained: inner.index.is_trained(),
            index: inner.index.stats(),
        }
    }

    /// Metrics returned by the most recent fit, if any.
    pub fn last_build_metrics(&self) -> Option<AnnMetrics> {
        self.inner.read().last_metrics.clone()
    }

    /// Persist the store under `base`: the ANN blob (`.vectors`), the
    /// ID/embedding table (`.vectors.ids`), the row-order sequence
    /// (`.vectors.order`), and the config file (`.config`).
    pub fn save(&self, base: &Path) -> Result<()> {
        let inner = self.inner.read();

        let mut ids: Vec<VectorId> = inner.id_to_vector.keys().copied().collect();
        ids.sort_unstable();
        let entries: Vec<(VectorId, &[f32])> = ids
            .iter()
            .map(|id| (*id, inner.id_to_vector[id].as_slice()))
            .collect();
        persistence::write_id_table(&artifact(base, ".vectors.ids"), &entries)?;
        persistence::write_order(&artifact(base, ".vectors.order"), &inner.row_to_id)?;
        persistence::write_config_file(&artifact(base, ".config"), &inner.config)?;

        let blob_path = artifact(base, ".vectors");
        let mut blob = Vec::new();
        if inner.index.save(&mut blob)? {
            persistence::atomic_write(&blob_path, &blob)?;
        } else if blob_path.exists() {
            // An untrained index has no blob; drop a stale one.
            let _ = std::fs::remove_file(&blob_path);
        }
        tracing::info!(
            vectors = inner.id_to_vector.len(),
            rows = inner.row_to_id.len(),
            base = %base.display(),
            "vector store saved"
        );
        Ok(())
    }

    /// Restore a store persisted by [`save`](Self::save). A structurally
    /// invalid artifact set fails without producing a store.
    pub fn load(base: &Path) -> Result<Self> {
        let config = persistence::read_config_file(&artifact(base, ".config"))?;
        config.validate()?;
        let store = Self::new(config)?;
        {
            let mut inner = store.inner.write();

            let entries = persistence::read_id_table(&artifact(base, ".vectors.ids"))?;
            let mut max_id = 0;
            for (id, vector) in &entries {
                Error::check_dimension(inner.config.dimension, vector.len())?;
                max_id = max_id.max(*id);
            }
            inner.id_to_vector = entries.into_iter().collect();

            let blob_path = artifact(base, ".vectors");
            let mut loaded_index = false;
            if blob_path.exists() {
                let bytes = std::fs::read(&blob_path)?;
                loaded_index = inner.index.load(&mut bytes.as_slice())?;
            }

            if loaded_index {
                let order_path = artifact(base, ".vectors.order");
                if order_path.exists() {
                    inner.row_to_id = persistence::read_order(&order_path)?;
                } else {
                    tracing::warn!(
                        base = %base.display(),
                        "row-order file missing; reconstructing from index contents"
                    );
                    let extra = Self::reconstruct_order(&mut inner, max_id);
                    max_id = max_id.max(extra);
                }
                let expected = inner.index.stats().rows;
                if inner.row_to_id.len() != expected {
                    return Err(Error::Corruption(format!(
                        "row-order length {} does not match index rows {}",
                        inner.row_to_id.len(),
                        expected
                    )));
                }
                let id_to_row: HashMap<VectorId, usize> = inner
                    .row_to_id
                    .iter()
                    .enumerate()
                    .filter(|(_, id)| **id != UNASSIGNED_ID)
                    .map(|(row, &id)| (id, row))
                    .collect();
                inner.id_to_row = id_to_row;
            } else if inner.index.is_trained() && inner.index.supports_add() {
                // Trained-from-birth kind with no blob: rebuild rows from
                // the authoritative copy.
                let mut ids: Vec<VectorId> = inner.id_to_vector.keys().copied().collect();
                ids.sort_unstable();
                let vectors: Vec<Vector> =
                    ids.iter().map(|id| inner.id_to_vector[id].clone()).collect();
                let rows = inner.index.add_vectors(&vectors)?;
                for (&id, row) in ids.iter().zip(rows.into_iter()) {
                    inner.record_row(id, row);
                }
            } else {
                // Training-required kind with no blob: everything is staged
                // again so a later train() call drains it.
                let mut ids: Vec<VectorId> = inner.id_to_vector.keys().copied().collect();
                ids.sort_unstable();
                let staging: Vec<(VectorId, Vector)> = ids
                    .into_iter()
                    .map(|id| (id, inner.id_to_vector[&id].clone()))
                    .collect();
                inner.staging = staging;
            }

            store.next_id.store(max_id + 1, Ordering::Relaxed);
            tracing::info!(
                vectors = inner.id_to_vector.len(),
                next_id = max_id + 1,
                base = %base.display(),
                "vector store loaded"
            );
        }
        Ok(store)
    }

    /// Best-effort `row_to_id` recovery: reconstruct each row from the
    /// index and match it against the authoritative copy by content hash
    /// plus exact equality, preferring the first unused match. Unmatched
    /// rows receive fresh IDs above the persisted high-water mark.
    /// Returns the highest ID assigned.
    fn reconstruct_order(inner: &mut Inner, max_id: VectorId) -> VectorId {
        let mut by_hash: HashMap<u64, Vec<VectorId>> = HashMap::new();
        let mut ids: Vec<VectorId> = inner.id_to_vector.keys().copied().collect();
        ids.sort_unstable();
        for &id in &ids {
            by_hash.entry(hash_vector(&inner.id_to_vector[&id])).or_default().push(id);
        }

        let rows = inner.index.stats().rows;
        let mut used: HashSet<VectorId> = HashSet::new();
        let mut fresh = max_id;
        let mut order = Vec::with_capacity(rows);
        for row in 0..rows {
            let Some(vector) = inner.index.reconstruct(row) else {
                order.push(UNASSIGNED_ID);
                continue;
            };
            let matched = by_hash
                .get(&hash_vector(&vector))
                .and_then(|candidates| {
                    candidates
                        .iter()
                        .find(|id| !used.contains(id) && inner.id_to_vector[id] == vector)
                        .copied()
                });
            match matched {
                Some(id) => {
                    used.insert(id);
                    order.push(id);
                }
                None => {
                    fresh += 1;
                    tracing::warn!(row, id = fresh, "unmatched index row assigned a fresh id");
                    inner.id_to_vector.insert(fresh, vector);
                    order.push(fresh);
                }
            }
        }
        inner.row_to_id = order;
        fresh
    }
}

/// Either lock guard, so search can honor the adapter's concurrency hint.
enum ReadOrWrite<'a> {
    Read(parking_lot::RwLockReadGuard<'a, Inner>),
    Write(parking_lot::RwLockWriteGuard<'a, Inner>),
}

impl<'a> ReadOrWrite<'a> {
    fn as_ref(&self) -> &Inner {
        match self {
            ReadOrWrite::Read(guard) => guard,
            ReadOrWrite::Write(guard) => guard,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn flat_store(dim: usize) -> VectorStore {
        let mut cfg = DatabaseConfig::with_dimension(dim);
        cfg.index_kind = IndexKind::Flat;
        VectorStore::new(cfg).unwrap()
    }

    fn ivf_store(dim: usize, nlist: u32) -> VectorStore {
        let mut cfg = DatabaseConfig::with_dimension(dim);
        cfg.index_kind = IndexKind::IvfFlat;
        cfg.nlist = nlist;
        VectorStore::new(cfg).unwrap()
    }

    #[test]
    fn test_ids_start_at_one_and_increase() {
        let store = flat_store(2);
        let a = store.add(vec![1.0, 0.0]).unwrap();
        let b = store.add(vec![0.0, 1.0]).unwrap();
        let batch = store.add_batch(vec![vec![1.0, 1.0], vec![0.5, 0.5]]).unwrap();
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(batch, vec![3, 4]);
    }

    #[test]
    fn test_dimension_mismatch_rejected_without_mutation() {
        let store = flat_store(3);
        let err = store.add(vec![1.0]).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_flat_insert_then_search() {
        let store = flat_store(4);
        let id = store.add(vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        let hits = store
            .search(&[1.0, 0.0, 0.0, 0.0], &SearchParams::with_k(1))
            .unwrap();
        assert_eq!(hits[0].0, id);
        assert!(hits[0].1.abs() < 1e-6);
    }

    #[test]
    fn test_staging_fallback_before_training() {
        let store = ivf_store(2, 2);
        for i in 0..10 {
            store.add(vec![i as f32, 0.0]).unwrap();
        }
        assert!(!store.is_trained());
        assert_eq!(store.stats().staged, 10);
        // Fallback must serve correct exact results
        let hits = store.search(&[3.1, 0.0], &SearchParams::with_k(1)).unwrap();
        assert_eq!(hits[0].0, 4, "id 4 holds [3.0, 0.0]");
    }

    #[test]
    fn test_training_drains_staging_and_preserves_top1() {
        let store = ivf_store(2, 2);
        let vectors: Vec<Vector> = (0..10).map(|i| vec![i as f32, (i % 3) as f32]).collect();
        let ids = store.add_batch(vectors.clone()).unwrap();
        let before: Vec<VectorId> = vectors
            .iter()
            .map(|v| store.search(v, &SearchParams::with_k(1)).unwrap()[0].0)
            .collect();

        store.train(None).unwrap();
        assert!(store.is_trained());
        assert_eq!(store.stats().staged, 0);

        let mut params = SearchParams::with_k(1);
        params.nprobe = 2;
        for (v, &expected) in vectors.iter().zip(before.iter()) {
            let hits = store.search(v, &params).unwrap();
            assert_eq!(hits[0].0, expected, "top-1 changed after training");
        }
        assert!(ids.iter().all(|id| store.contains(*id)));
    }

    #[test]
    fn test_train_is_idempotent() {
        let store = ivf_store(2, 2);
        for i in 0..4 {
            store.add(vec![i as f32, 1.0]).unwrap();
        }
        store.train(None).unwrap();
        let rows_before = store.stats().index.rows;
        store.train(None).unwrap();
        assert_eq!(store.stats().index.rows, rows_before, "second train must be a no-op");
    }

    #[test]
    fn test_build_index_trains_at_nlist() {
        let store = ivf_store(2, 3);
        store.add(vec![0.0, 0.0]).unwrap();
        store.add(vec![1.0, 0.0]).unwrap();
        store.build_index().unwrap();
        assert!(!store.is_trained(), "below nlist the buffer must keep staging");
        store.add(vec![2.0, 0.0]).unwrap();
        store.build_index().unwrap();
        assert!(store.is_trained());
    }

    #[test]
    fn test_remove_is_idempotent_and_blocks_results() {
        let store = flat_store(2);
        let id = store.add(vec![1.0, 0.0]).unwrap();
        store.add(vec![0.0, 1.0]).unwrap();
        assert!(store.remove(id).unwrap());
        assert!(!store.remove(id).unwrap(), "second remove silently misses");
        let hits = store.search(&[1.0, 0.0], &SearchParams::with_k(2)).unwrap();
        assert!(hits.iter().all(|&(hit, _)| hit != id));
        // A fresh insert does not reuse the removed ID
        let next = store.add(vec![0.5, 0.5]).unwrap();
        assert!(next > id + 1);
    }

    #[test]
    fn test_remove_staged_vector() {
        let store = ivf_store(2, 2);
        let id = store.add(vec![1.0, 1.0]).unwrap();
        assert!(store.remove(id).unwrap());
        assert_eq!(store.stats().staged, 0);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_update_vector() {
        let store = flat_store(2);
        let id = store.add(vec![1.0, 0.0]).unwrap();
        assert!(store.update(id, vec![0.0, 1.0]).unwrap());
        let hits = store.search(&[0.0, 1.0], &SearchParams::with_k(1)).unwrap();
        assert_eq!(hits[0].0, id);
        assert!(hits[0].1.abs() < 1e-6);
        assert!(!store.update(999, vec![0.0, 0.0]).unwrap());
    }

    #[test]
    fn test_range_search() {
        let store = flat_store(2);
        store.add(vec![0.0, 0.0]).unwrap();
        store.add(vec![0.5, 0.0]).unwrap();
        store.add(vec![5.0, 0.0]).unwrap();
        let hits = store
            .range_search(&[0.0, 0.0], 1.0, &SearchParams::default())
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, 1);
        assert_eq!(hits[1].0, 2);
    }

    #[test]
    fn test_search_empty_untrained_store() {
        let store = ivf_store(2, 2);
        let err = store.search(&[0.0, 0.0], &SearchParams::with_k(1)).unwrap_err();
        assert!(matches!(err, Error::NotTrained));
    }

    #[test]
    fn test_hnsw_store_roundtrip() {
        let mut cfg = DatabaseConfig::with_dimension(4);
        cfg.index_kind = IndexKind::Hnsw;
        let store = VectorStore::new(cfg).unwrap();
        for i in 0..20 {
            store
                .add(vec![i as f32, (i * 2) as f32, 0.0, 1.0])
                .unwrap();
        }
        let hits = store
            .search(&[4.0, 8.0, 0.0, 1.0], &SearchParams::with_k(1))
            .unwrap();
        assert_eq!(hits[0].0, 5);
    }

    #[test]
    fn test_save_load_identical_results() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("store");
        let store = flat_store(3);
        for i in 0..8 {
            store.add(vec![i as f32, 1.0, (8 - i) as f32]).unwrap();
        }
        let query = vec![3.0, 1.0, 5.0];
        let before = store.search(&query, &SearchParams::with_k(5)).unwrap();
        store.save(&base).unwrap();

        let restored = VectorStore::load(&base).unwrap();
        assert_eq!(restored.len(), 8);
        let after = restored.search(&query, &SearchParams::with_k(5)).unwrap();
        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.0, a.0, "result order changed across save/load");
            assert!((b.1 - a.1).abs() < 1e-6);
        }
        // next_id restored past the persisted high-water mark
        assert_eq!(restored.add(vec![0.0, 0.0, 0.0]).unwrap(), 9);
    }

    #[test]
    fn test_load_recovers_missing_order_file() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("store");
        let store = flat_store(2);
        let a = store.add(vec![1.0, 0.0]).unwrap();
        let b = store.add(vec![0.0, 1.0]).unwrap();
        store.save(&base).unwrap();
        std::fs::remove_file(artifact(&base, ".vectors.order")).unwrap();

        let restored = VectorStore::load(&base).unwrap();
        let hits = restored.search(&[1.0, 0.0], &SearchParams::with_k(2)).unwrap();
        assert_eq!(hits[0].0, a, "hash recovery must rebind row 0 to id {a}");
        assert_eq!(hits[1].0, b);
    }

    #[test]
    fn test_load_corrupt_ids_fails() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("store");
        let store = flat_store(2);
        store.add(vec![1.0, 0.0]).unwrap();
        store.save(&base).unwrap();
        let ids_path = artifact(&base, ".vectors.ids");
        let mut bytes = std::fs::read(&ids_path).unwrap();
        bytes.truncate(bytes.len() - 3);
        std::fs::write(&ids_path, &bytes).unwrap();
        assert!(matches!(
            VectorStore::load(&base),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn test_untrained_ivf_save_load_restages() {
        let dir = tempdir().unwrap();
        let base = dir.path().join("store");
        let store = ivf_store(2, 2);
        for i in 0..5 {
            store.add(vec![i as f32, 0.0]).unwrap();
        }
        store.save(&base).unwrap();

        let restored = VectorStore::load(&base).unwrap();
        assert!(!restored.is_trained());
        assert_eq!(restored.stats().staged, 5);
        restored.train(None).unwrap();
        let mut params = SearchParams::with_k(1);
        params.nprobe = 2;
        assert_eq!(restored.search(&[2.0, 0.0], &params).unwrap()[0].0, 3);
    }
}
