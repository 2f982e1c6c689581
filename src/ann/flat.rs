//! Brute-force exact index.
//!
//! Stores raw f32 rows in a contiguous arena and scans them all per query
//! with a bounded heap. Exact under every metric, trained from birth, and
//! fully mutable — this is also the reference implementation the
//! approximate adapters are tested against.

use crate::ann::{check_metric, AnnIndex, AnnMetrics, BuildParams, IndexStats, QueryParams, RowHit};
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::store::persistence::{read_framed, write_framed};
use crate::types::Vector;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BinaryHeap;
use std::io::{Read, Write};
use std::time::Instant;

const FLAT_MAGIC: &[u8; 4] = b"MFL1";

static FLAT_METRICS: [DistanceMetric; 3] = [
    DistanceMetric::L2,
    DistanceMetric::InnerProduct,
    DistanceMetric::Cosine,
];

/// Serialized state of a flat index.
#[derive(Serialize, Deserialize)]
struct FlatState {
    metric: DistanceMetric,
    dimension: usize,
    data: Vec<f32>,
    deleted: Vec<bool>,
}

/// Exact brute-force index over a contiguous f32 arena.
#[derive(Debug)]
pub struct FlatIndex {
    metric: DistanceMetric,
    dimension: usize,
    data: Vec<f32>,
    deleted: Vec<bool>,
}

impl FlatIndex {
    /// Empty index for the given metric and dimension.
    pub fn new(metric: DistanceMetric, dimension: usize) -> Result<Self> {
        check_metric("flat", &FLAT_METRICS, metric)?;
        if dimension == 0 {
            return Err(Error::InvalidConfig("flat index dimension must be positive".into()));
        }
        Ok(Self {
            metric,
            dimension,
            data: Vec::new(),
            deleted: Vec::new(),
        })
    }

    fn rows(&self) -> usize {
        self.deleted.len()
    }

    fn row_slice(&self, row: usize) -> &[f32] {
        let start = row * self.dimension;
        &self.data[start..start + self.dimension]
    }

    fn check_query(&self, query: &[f32]) -> Result<()> {
        Error::check_dimension(self.dimension, query.len())
    }

    /// Scan every live row, keeping the k best under the metric.
    fn scan_top_k(&self, query: &[f32], k: usize) -> Vec<RowHit> {
        // Max-heap on the rank key (lower = better) keeps the k best seen.
        let mut heap: BinaryHeap<(OrderedFloat<f32>, usize)> = BinaryHeap::with_capacity(k + 1);
        for row in 0..self.rows() {
            if self.deleted[row] {
                continue;
            }
            let score = self.metric.score(query, self.row_slice(row));
            let rank = if self.metric.higher_is_better() { -score } else { score };
            heap.push((OrderedFloat(rank), row));
            if heap.len() > k {
                heap.pop();
            }
        }
        let mut hits: Vec<(f32, usize)> = heap
            .into_iter()
            .map(|(rank, row)| {
                let score = if self.metric.higher_is_better() { -rank.0 } else { rank.0 };
                (score, row)
            })
            .collect();
        hits.sort_unstable_by(|a, b| self.metric.better_first(a.0, b.0));
        hits.into_iter().map(|(score, row)| (row, score)).collect()
    }
}

impl AnnIndex for FlatIndex {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn supported_metrics(&self) -> &'static [DistanceMetric] {
        &FLAT_METRICS
    }

    fn fit(&mut self, vectors: &[Vector], params: &BuildParams) -> Result<AnnMetrics> {
        check_metric("flat", &FLAT_METRICS, params.metric)?;
        let start = Instant::now();
        for v in vectors {
            Error::check_dimension(params.dimension, v.len())?;
        }
        self.metric = params.metric;
        self.dimension = params.dimension;
        self.data.clear();
        self.deleted.clear();
        Ok(AnnMetrics {
            build_time_secs: start.elapsed().as_secs_f64(),
            memory_bytes: self.data.len() * 4,
            distance_computations: 0,
            extras: Default::default(),
        })
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn search(&self, query: &[f32], params: &QueryParams) -> Result<Vec<RowHit>> {
        self.check_query(query)?;
        Ok(self.scan_top_k(query, params.k))
    }

    fn range_search(&self, query: &[f32], radius: f32, _params: &QueryParams) -> Result<Vec<RowHit>> {
        self.check_query(query)?;
        let mut hits: Vec<(f32, usize)> = Vec::new();
        for row in 0..self.rows() {
            if self.deleted[row] {
                continue;
            }
            let score = self.metric.score(query, self.row_slice(row));
            if self.metric.within_radius(score, radius) {
                hits.push((score, row));
            }
        }
        hits.sort_unstable_by(|a, b| self.metric.better_first(a.0, b.0));
        Ok(hits.into_iter().map(|(score, row)| (row, score)).collect())
    }

    fn supports_add(&self) -> bool {
        true
    }

    fn supports_remove(&self) -> bool {
        true
    }

    fn supports_range(&self) -> bool {
        true
    }

    fn add_vectors(&mut self, vectors: &[Vector]) -> Result<Vec<usize>> {
        let mut rows = Vec::with_capacity(vectors.len());
        for v in vectors {
            Error::check_dimension(self.dimension, v.len())?;
        }
        for v in vectors {
            rows.push(self.rows());
            self.data.extend_from_slice(v);
            self.deleted.push(false);
        }
        Ok(rows)
    }

    fn remove_vectors(&mut self, rows: &[usize]) -> Result<()> {
        for &row in rows {
            if row < self.deleted.len() {
                self.deleted[row] = true;
            }
        }
        Ok(())
    }

    fn save(&self, writer: &mut dyn Write) -> Result<bool> {
        let state = FlatState {
            metric: self.metric,
            dimension: self.dimension,
            data: self.data.clone(),
            deleted: self.deleted.clone(),
        };
        let bytes = bincode::serialize(&state)
            .map_err(|e| Error::Corruption(format!("flat index serialization failed: {e}")))?;
        write_framed(writer, FLAT_MAGIC, &bytes)?;
        Ok(true)
    }

    fn load(&mut self, reader: &mut dyn Read) -> Result<bool> {
        let bytes = read_framed(reader, FLAT_MAGIC)?;
        let state: FlatState = bincode::deserialize(&bytes)
            .map_err(|e| Error::Corruption(format!("flat index deserialization failed: {e}")))?;
        if state.data.len() != state.deleted.len() * state.dimension {
            return Err(Error::Corruption("flat index arena length mismatch".into()));
        }
        self.metric = state.metric;
        self.dimension = state.dimension;
        self.data = state.data;
        self.deleted = state.deleted;
        Ok(true)
    }

    fn reconstruct(&self, row: usize) -> Option<Vector> {
        if row < self.rows() && !self.deleted[row] {
            Some(self.row_slice(row).to_vec())
        } else {
            None
        }
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            rows: self.rows(),
            memory_bytes: self.data.len() * 4 + self.deleted.len(),
            extras: Default::default(),
        }
    }

    fn build_params(&self) -> BuildParams {
        BuildParams::new(self.metric, self.dimension)
    }
}

/// Factory for [`FlatIndex`].
pub struct FlatFactory;

impl crate::ann::AnnFactory for FlatFactory {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn description(&self) -> &'static str {
        "exact brute-force scan over raw f32 vectors"
    }

    fn supported_metrics(&self) -> &'static [DistanceMetric] {
        &FLAT_METRICS
    }

    fn create(&self, params: &BuildParams) -> Result<Box<dyn AnnIndex>> {
        Ok(Box::new(FlatIndex::new(params.metric, params.dimension)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_axes(dim: usize) -> Vec<Vector> {
        (0..dim)
            .map(|i| {
                let mut v = vec![0.0; dim];
                v[i] = 1.0;
                v
            })
            .collect()
    }

    fn fitted(metric: DistanceMetric, vectors: &[Vector]) -> FlatIndex {
        let dim = vectors[0].len();
        let mut idx = FlatIndex::new(metric, dim).unwrap();
        idx.add_vectors(vectors).unwrap();
        idx
    }

    #[test]
    fn test_exact_self_match() {
        let idx = fitted(DistanceMetric::L2, &unit_axes(4));
        let hits = idx.search(&[1.0, 0.0, 0.0, 0.0], &QueryParams::with_k(2)).unwrap();
        assert_eq!(hits[0].0, 0);
        assert!(hits[0].1.abs() < 1e-6);
        assert!((hits[1].1 - std::f32::consts::SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn test_inner_product_descending() {
        let vectors = vec![vec![1.0, 0.0], vec![2.0, 0.0], vec![0.5, 0.0]];
        let idx = fitted(DistanceMetric::InnerProduct, &vectors);
        let hits = idx.search(&[1.0, 0.0], &QueryParams::with_k(3)).unwrap();
        let rows: Vec<usize> = hits.iter().map(|h| h.0).collect();
        assert_eq!(rows, vec![1, 0, 2], "inner product ranks by descending similarity");
    }

    #[test]
    fn test_k_larger_than_rows() {
        let idx = fitted(DistanceMetric::L2, &unit_axes(3));
        let hits = idx.search(&[1.0, 0.0, 0.0], &QueryParams::with_k(10)).unwrap();
        assert_eq!(hits.len(), 3);
    }

    #[test]
    fn test_empty_index_searchable() {
        let idx = FlatIndex::new(DistanceMetric::L2, 4).unwrap();
        assert!(idx.is_trained());
        let hits = idx.search(&[0.0; 4], &QueryParams::with_k(5)).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_query_dimension_checked() {
        let idx = fitted(DistanceMetric::L2, &unit_axes(4));
        let err = idx.search(&[1.0, 0.0], &QueryParams::with_k(1)).unwrap_err();
        assert!(matches!(err, Error::DimensionMismatch { .. }));
    }

    #[test]
    fn test_add_assigns_dense_rows() {
        let mut idx = fitted(DistanceMetric::L2, &unit_axes(3));
        let rows = idx.add_vectors(&[vec![0.5, 0.5, 0.0], vec![0.0, 0.5, 0.5]]).unwrap();
        assert_eq!(rows, vec![3, 4]);
        assert_eq!(idx.stats().rows, 5);
    }

    #[test]
    fn test_remove_tombstones_row() {
        let mut idx = fitted(DistanceMetric::L2, &unit_axes(3));
        idx.remove_vectors(&[0]).unwrap();
        let hits = idx.search(&[1.0, 0.0, 0.0], &QueryParams::with_k(3)).unwrap();
        assert!(hits.iter().all(|&(row, _)| row != 0), "deleted row must not surface");
        assert_eq!(hits.len(), 2);
        // Removing out-of-range rows is a no-op
        idx.remove_vectors(&[99]).unwrap();
    }

    #[test]
    fn test_range_search_l2() {
        let idx = fitted(DistanceMetric::L2, &unit_axes(4));
        let hits = idx.range_search(&[1.0, 0.0, 0.0, 0.0], 1.5, &QueryParams::default()).unwrap();
        // Self at distance 0 plus three neighbors at sqrt(2) ≈ 1.414
        assert_eq!(hits.len(), 4);
        assert_eq!(hits[0].0, 0);
        for pair in hits.windows(2) {
            assert!(pair[0].1 <= pair[1].1, "range results sorted ascending");
        }
    }

    #[test]
    fn test_range_search_inner_product() {
        let vectors = vec![vec![2.0, 0.0], vec![1.0, 0.0], vec![0.1, 0.0]];
        let idx = fitted(DistanceMetric::InnerProduct, &vectors);
        let hits = idx.range_search(&[1.0, 0.0], 0.9, &QueryParams::default()).unwrap();
        let rows: Vec<usize> = hits.iter().map(|h| h.0).collect();
        assert_eq!(rows, vec![0, 1], "inner product keeps similarity >= radius, descending");
    }

    #[test]
    fn test_reconstruct() {
        let idx = fitted(DistanceMetric::L2, &unit_axes(3));
        assert_eq!(idx.reconstruct(1).unwrap(), vec![0.0, 1.0, 0.0]);
        assert!(idx.reconstruct(7).is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let idx = fitted(DistanceMetric::Cosine, &unit_axes(4));
        let mut buf = Vec::new();
        assert!(idx.save(&mut buf).unwrap());

        let mut restored = FlatIndex::new(DistanceMetric::L2, 1).unwrap();
        assert!(restored.load(&mut buf.as_slice()).unwrap());
        assert_eq!(restored.dimension, 4);
        assert_eq!(restored.metric, DistanceMetric::Cosine);
        let hits = restored.search(&[0.0, 1.0, 0.0, 0.0], &QueryParams::with_k(1)).unwrap();
        assert_eq!(hits[0].0, 1);
    }

    #[test]
    fn test_load_rejects_bad_magic() {
        let mut idx = FlatIndex::new(DistanceMetric::L2, 4).unwrap();
        let garbage = b"XXXXsomething else entirely".to_vec();
        let err = idx.load(&mut garbage.as_slice()).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_batch_search_preserves_order() {
        let idx = fitted(DistanceMetric::L2, &unit_axes(3));
        let queries = vec![vec![0.0, 0.0, 1.0], vec![1.0, 0.0, 0.0]];
        let results = idx.batch_search(&queries, &QueryParams::with_k(1)).unwrap();
        assert_eq!(results[0][0].0, 2);
        assert_eq!(results[1][0].0, 0);
    }

    #[test]
    fn test_unsupported_metric_rejected_at_construction() {
        // All metrics are supported by flat; exercise the config error instead
        let err = FlatIndex::new(DistanceMetric::L2, 0).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }
}
