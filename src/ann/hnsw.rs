//! Hierarchical Navigable Small World (HNSW) graph index.
//!
//! Multi-layer proximity graph with greedy descent from a single entry
//! point and beam search (`ef`) at the target layer. Neighbor selection
//! uses the diversity heuristic (Algorithm 4 from the HNSW paper): a
//! candidate is kept only if it is closer to the base node than to any
//! already-selected neighbor. Raw f32 vectors are stored contiguously in
//! an arena; deletion is a soft tombstone that removes a node from result
//! sets while keeping it navigable.
//!
//! Internally all metrics are folded into a lower-is-better rank (inner
//! product is negated) so one comparator drives the heaps; ranks are
//! converted back to metric scores at the API boundary.

use crate::ann::{check_metric, AnnIndex, AnnMetrics, BuildParams, IndexStats, QueryParams, RowHit};
use crate::config;
use crate::distance::DistanceMetric;
use crate::error::{Error, Result};
use crate::store::persistence::{read_framed, write_framed};
use crate::types::Vector;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BinaryHeap;
use std::io::{Read, Write};
use std::time::Instant;

const HNSW_MAGIC: &[u8; 4] = b"MHN1";

static HNSW_METRICS: [DistanceMetric; 3] = [
    DistanceMetric::L2,
    DistanceMetric::InnerProduct,
    DistanceMetric::Cosine,
];

/// Generation-based visited set: clearing is a counter bump, not a memset.
#[derive(Debug, Default)]
struct VisitedSet {
    generations: Vec<u32>,
    current: u32,
}

impl VisitedSet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            generations: vec![0; capacity],
            current: 0,
        }
    }

    fn ensure_capacity(&mut self, capacity: usize) {
        if self.generations.len() < capacity {
            self.generations.resize(capacity, 0);
        }
    }

    fn clear(&mut self) {
        self.current = self.current.wrapping_add(1);
        if self.current == 0 {
            self.generations.fill(0);
            self.current = 1;
        }
    }

    /// Returns `true` when the node had not been visited this generation.
    fn insert(&mut self, id: u32) -> bool {
        let slot = &mut self.generations[id as usize];
        if *slot == self.current {
            false
        } else {
            *slot = self.current;
            true
        }
    }
}

/// Serialized graph state.
#[derive(Serialize, Deserialize, Debug)]
struct HnswGraph {
    metric: DistanceMetric,
    dimension: usize,
    m: usize,
    m_max0: usize,
    ef_construction: usize,
    ef_search: usize,
    max_layers: usize,
    data: Vec<f32>,
    /// `neighbors[node][layer]` — adjacency per layer.
    neighbors: Vec<Vec<Vec<u32>>>,
    layers: Vec<u8>,
    deleted: Vec<bool>,
    entry_point: Option<u32>,
    max_layer: usize,
}

impl HnswGraph {
    fn new(metric: DistanceMetric, dimension: usize, m: usize, ef_construction: usize) -> Self {
        Self {
            metric,
            dimension,
            m,
            m_max0: m * 2,
            ef_construction,
            ef_search: config::HNSW_DEFAULT_EF_SEARCH,
            max_layers: config::HNSW_MAX_LAYERS,
            data: Vec::new(),
            neighbors: Vec::new(),
            layers: Vec::new(),
            deleted: Vec::new(),
            entry_point: None,
            max_layer: 0,
        }
    }

    fn node_count(&self) -> usize {
        self.deleted.len()
    }

    #[inline]
    fn vector(&self, id: u32) -> &[f32] {
        let start = id as usize * self.dimension;
        &self.data[start..start + self.dimension]
    }

    /// Lower-is-better rank between the query and a stored node.
    #[inline]
    fn rank(&self, query: &[f32], id: u32) -> f32 {
        let score = self.metric.score(query, self.vector(id));
        if self.metric.higher_is_better() {
            -score
        } else {
            score
        }
    }

    #[inline]
    fn rank_between(&self, a: u32, b: u32) -> f32 {
        let score = self.metric.score(self.vector(a), self.vector(b));
        if self.metric.higher_is_better() {
            -score
        } else {
            score
        }
    }

    /// Exponentially distributed random layer for a new node.
    fn random_level(&self) -> usize {
        let ml = 1.0 / (self.m as f64).ln();
        let r: f64 = rand::random();
        let level = (-r.ln() * ml).floor() as usize;
        level.min(self.max_layers - 1)
    }

    /// Beam search within one layer. Returns up to `ef` nearest live nodes,
    /// rank-ascending. Tombstoned nodes navigate but never surface.
    fn search_layer(
        &self,
        query: &[f32],
        entry_points: &[u32],
        ef: usize,
        layer: usize,
        visited: &mut VisitedSet,
    ) -> Vec<(f32, u32)> {
        visited.clear();
        let mut candidates: BinaryHeap<(OrderedFloat<f32>, u32)> = BinaryHeap::new();
        let mut results: BinaryHeap<(OrderedFloat<f32>, u32)> = BinaryHeap::with_capacity(ef + 1);
        let mut worst = f32::MAX;

        for &ep in entry_points {
            if visited.insert(ep) {
                let d = self.rank(query, ep);
                candidates.push((OrderedFloat(-d), ep));
                if !self.deleted[ep as usize] {
                    results.push((OrderedFloat(d), ep));
                    if results.len() >= ef {
                        worst = results.peek().map_or(f32::MAX, |r| r.0 .0);
                    }
                }
            }
        }

        while let Some((neg_dist, node)) = candidates.pop() {
            let dist = -neg_dist.0;
            if results.len() >= ef && dist > worst {
                break;
            }
            let node_layers = &self.neighbors[node as usize];
            if layer >= node_layers.len() {
                continue;
            }
            for &neighbor in &node_layers[layer] {
                if !visited.insert(neighbor) {
                    continue;
                }
                let d = self.rank(query, neighbor);
                if results.len() < ef || d < worst {
                    candidates.push((OrderedFloat(-d), neighbor));
                    if !self.deleted[neighbor as usize] {
                        results.push((OrderedFloat(d), neighbor));
                        if results.len() > ef {
                            results.pop();
                        }
                        worst = results.peek().map_or(f32::MAX, |r| r.0 .0);
                    }
                }
            }
        }

        results
            .into_sorted_vec()
            .into_iter()
            .map(|(d, id)| (d.0, id))
            .collect()
    }

    /// Diversity-first neighbor selection: keep a candidate only when it is
    /// closer to the base than to every neighbor already kept, then fill
    /// remaining slots with the closest unused candidates.
    fn select_neighbors(&self, candidates: &[(f32, u32)], m: usize) -> Vec<(f32, u32)> {
        let mut sorted = candidates.to_vec();
        sorted.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);
        for &(dist_to_base, cid) in &sorted {
            if selected.len() >= m {
                break;
            }
            let diverse = selected
                .iter()
                .all(|&(_, sid)| dist_to_base <= self.rank_between(cid, sid));
            if diverse {
                selected.push((dist_to_base, cid));
            }
        }

        if selected.len() < m {
            for &(dist, cid) in &sorted {
                if selected.len() >= m {
                    break;
                }
                if !selected.iter().any(|&(_, id)| id == cid) {
                    selected.push((dist, cid));
                }
            }
        }
        selected
    }

    /// Insert one vector; its row position is the current node count.
    fn insert(&mut self, vector: &[f32], visited: &mut VisitedSet) -> usize {
        let internal_id = self.node_count() as u32;
        let level = self.random_level();
        visited.ensure_capacity(self.node_count() + 1);

        if self.entry_point.is_none() {
            self.data.extend_from_slice(vector);
            self.neighbors.push(vec![Vec::new(); level + 1]);
            self.layers.push(level as u8);
            self.deleted.push(false);
            self.entry_point = Some(internal_id);
            self.max_layer = level;
            return internal_id as usize;
        }

        let entry_point = self.entry_point.unwrap_or(0);
        let top = level.min(self.max_layer);

        // Phase 1: greedy descent from the top layer to level + 1.
        let mut current_ep = entry_point;
        for layer in (level + 1..=self.max_layer).rev() {
            let nearest =
                self.search_layer(vector, std::slice::from_ref(&current_ep), 1, layer, visited);
            if let Some(&(_, id)) = nearest.first() {
                current_ep = id;
            }
        }

        // Phase 2: collect neighbors per layer with ef_construction beams.
        let mut node_neighbors: Vec<Vec<u32>> = vec![Vec::new(); level + 1];
        let mut layer_eps: Vec<u32> = vec![current_ep];
        for layer in (0..=top).rev() {
            let candidates =
                self.search_layer(vector, &layer_eps, self.ef_construction, layer, visited);
            let m_max = if layer == 0 { self.m_max0 } else { self.m };
            let selected = self.select_neighbors(&candidates, m_max);
            node_neighbors[layer] = selected.iter().map(|&(_, id)| id).collect();

            layer_eps.clear();
            layer_eps.extend(candidates.iter().map(|&(_, id)| id));
            if layer_eps.is_empty() {
                layer_eps.push(entry_point);
            }
        }

        self.data.extend_from_slice(vector);
        self.neighbors.push(node_neighbors);
        self.layers.push(level as u8);
        self.deleted.push(false);

        // Phase 3: bidirectional links, pruning neighbors over capacity.
        for layer in 0..=top {
            let m_max = if layer == 0 { self.m_max0 } else { self.m };
            let my_neighbors: Vec<u32> = self.neighbors[internal_id as usize][layer].clone();
            for &neighbor in &my_neighbors {
                let nid = neighbor as usize;
                while self.neighbors[nid].len() <= layer {
                    self.neighbors[nid].push(Vec::new());
                }
                self.neighbors[nid][layer].push(internal_id);

                if self.neighbors[nid][layer].len() > m_max {
                    let over: Vec<(f32, u32)> = self.neighbors[nid][layer]
                        .iter()
                        .map(|&cid| (self.rank_between(neighbor, cid), cid))
                        .collect();
                    let pruned = self.select_neighbors(&over, m_max);
                    self.neighbors[nid][layer] = pruned.iter().map(|&(_, id)| id).collect();
                }
            }
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(internal_id);
        }
        internal_id as usize
    }

    /// Multi-layer KNN search.
    fn knn_search(&self, query: &[f32], k: usize, ef_search: usize) -> Vec<(f32, u32)> {
        let entry_point = match self.entry_point {
            Some(ep) => ep,
            None => return Vec::new(),
        };
        let mut visited = VisitedSet::with_capacity(self.node_count());

        let mut current_ep = entry_point;
        for layer in (1..=self.max_layer).rev() {
            let nearest =
                self.search_layer(query, std::slice::from_ref(&current_ep), 1, layer, &mut visited);
            if let Some(&(_, id)) = nearest.first() {
                current_ep = id;
            }
        }

        let ef = ef_search.max(k);
        let mut results =
            self.search_layer(query, std::slice::from_ref(&current_ep), ef, 0, &mut visited);
        results.truncate(k);
        results
    }

    /// Convert an internal rank back to the metric's score.
    #[inline]
    fn rank_to_score(&self, rank: f32) -> f32 {
        if self.metric.higher_is_better() {
            -rank
        } else {
            rank
        }
    }
}

/// HNSW index adapter.
#[derive(Debug)]
pub struct HnswIndex {
    graph: HnswGraph,
    visited: VisitedSet,
}

impl HnswIndex {
    /// Empty graph for the given metric and dimension.
    pub fn new(
        metric: DistanceMetric,
        dimension: usize,
        m: usize,
        ef_construction: usize,
    ) -> Result<Self> {
        check_metric("hnsw", &HNSW_METRICS, metric)?;
        if dimension == 0 {
            return Err(Error::InvalidConfig("hnsw dimension must be positive".into()));
        }
        if m == 0 {
            return Err(Error::InvalidConfig("hnsw m must be positive".into()));
        }
        Ok(Self {
            graph: HnswGraph::new(metric, dimension, m, ef_construction),
            visited: VisitedSet::default(),
        })
    }
}

impl AnnIndex for HnswIndex {
    fn name(&self) -> &'static str {
        "hnsw"
    }

    fn supported_metrics(&self) -> &'static [DistanceMetric] {
        &HNSW_METRICS
    }

    fn fit(&mut self, vectors: &[Vector], params: &BuildParams) -> Result<AnnMetrics> {
        check_metric("hnsw", &HNSW_METRICS, params.metric)?;
        let start = Instant::now();
        let m = params.extras.get_parsed("m", self.graph.m);
        let ef_construction = params
            .extras
            .get_parsed("ef_construction", self.graph.ef_construction);
        for v in vectors {
            Error::check_dimension(params.dimension, v.len())?;
        }
        self.graph = HnswGraph::new(params.metric, params.dimension, m, ef_construction);
        let mut extras = std::collections::HashMap::new();
        extras.insert("max_layer".to_string(), self.graph.max_layer as f64);
        Ok(AnnMetrics {
            build_time_secs: start.elapsed().as_secs_f64(),
            memory_bytes: self.stats().memory_bytes,
            distance_computations: 0,
            extras,
        })
    }

    fn is_trained(&self) -> bool {
        true
    }

    fn search(&self, query: &[f32], params: &QueryParams) -> Result<Vec<RowHit>> {
        Error::check_dimension(self.graph.dimension, query.len())?;
        let ef = if params.ef_search > 0 {
            params.ef_search
        } else {
            self.graph.ef_search
        };
        let hits = self.graph.knn_search(query, params.k, ef);
        Ok(hits
            .into_iter()
            .map(|(rank, id)| (id as usize, self.graph.rank_to_score(rank)))
            .collect())
    }

    fn supports_add(&self) -> bool {
        true
    }

    fn supports_remove(&self) -> bool {
        true
    }

    fn add_vectors(&mut self, vectors: &[Vector]) -> Result<Vec<usize>> {
        for v in vectors {
            Error::check_dimension(self.graph.dimension, v.len())?;
        }
        Ok(vectors
            .iter()
            .map(|v| self.graph.insert(v, &mut self.visited))
            .collect())
    }

    fn remove_vectors(&mut self, rows: &[usize]) -> Result<()> {
        for &row in rows {
            if row < self.graph.deleted.len() {
                self.graph.deleted[row] = true;
            }
        }
        Ok(())
    }

    fn save(&self, writer: &mut dyn Write) -> Result<bool> {
        let bytes = bincode::serialize(&self.graph)
            .map_err(|e| Error::Corruption(format!("hnsw serialization failed: {e}")))?;
        write_framed(writer, HNSW_MAGIC, &bytes)?;
        Ok(true)
    }

    fn load(&mut self, reader: &mut dyn Read) -> Result<bool> {
        let bytes = read_framed(reader, HNSW_MAGIC)?;
        let graph: HnswGraph = bincode::deserialize(&bytes)
            .map_err(|e| Error::Corruption(format!("hnsw deserialization failed: {e}")))?;
        if graph.data.len() != graph.deleted.len() * graph.dimension {
            return Err(Error::Corruption("hnsw arena length mismatch".into()));
        }
        if let Some(ep) = graph.entry_point {
            if ep as usize >= graph.deleted.len() {
                return Err(Error::Corruption("hnsw entry point out of bounds".into()));
            }
        }
        self.graph = graph;
        self.visited = VisitedSet::with_capacity(self.graph.node_count());
        Ok(true)
    }

    fn reconstruct(&self, row: usize) -> Option<Vector> {
        if row < self.graph.node_count() && !self.graph.deleted[row] {
            Some(self.graph.vector(row as u32).to_vec())
        } else {
            None
        }
    }

    fn stats(&self) -> IndexStats {
        let link_bytes: usize = self
            .graph
            .neighbors
            .iter()
            .map(|layers| layers.iter().map(|l| l.len() * 4).sum::<usize>())
            .sum();
        let mut extras = std::collections::HashMap::new();
        extras.insert("max_layer".to_string(), self.graph.max_layer as f64);
        extras.insert("m".to_string(), self.graph.m as f64);
        IndexStats {
            rows: self.graph.node_count(),
            memory_bytes: self.graph.data.len() * 4 + link_bytes + self.graph.deleted.len(),
            extras,
        }
    }

    fn build_params(&self) -> BuildParams {
        let mut params = BuildParams::new(self.graph.metric, self.graph.dimension);
        params.extras.set("m", self.graph.m);
        params.extras.set("ef_construction", self.graph.ef_construction);
        params
    }
}

/// Factory for [`HnswIndex`].
pub struct HnswFactory;

impl crate::ann::AnnFactory for HnswFactory {
    fn name(&self) -> &'static str {
        "hnsw"
    }

    fn description(&self) -> &'static str {
        "hierarchical navigable small world graph over raw f32 vectors"
    }

    fn supported_metrics(&self) -> &'static [DistanceMetric] {
        &HNSW_METRICS
    }

    fn create(&self, params: &BuildParams) -> Result<Box<dyn AnnIndex>> {
        let m = params.extras.get_parsed("m", config::HNSW_DEFAULT_M);
        let ef_construction = params
            .extras
            .get_parsed("ef_construction", config::HNSW_DEFAULT_EF_CONSTRUCTION);
        Ok(Box::new(HnswIndex::new(
            params.metric,
            params.dimension,
            m,
            ef_construction,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 499 is prime and larger than any n used here, so vectors are distinct.
    fn grid_vectors(n: usize, dim: usize) -> Vec<Vector> {
        (0..n)
            .map(|i| (0..dim).map(|j| ((i * 7 + j * 13) % 499) as f32 / 499.0).collect())
            .collect()
    }

    fn fitted(metric: DistanceMetric, vectors: &[Vector]) -> HnswIndex {
        let dim = vectors[0].len();
        let mut idx = HnswIndex::new(metric, dim, 16, 200).unwrap();
        idx.add_vectors(vectors).unwrap();
        idx
    }

    #[test]
    fn test_visited_set_generations() {
        let mut v = VisitedSet::with_capacity(4);
        v.clear();
        assert!(v.insert(2));
        assert!(!v.insert(2));
        v.clear();
        assert!(v.insert(2), "clear must reset visit state");
    }

    #[test]
    fn test_empty_graph_search() {
        let idx = HnswIndex::new(DistanceMetric::L2, 4, 16, 200).unwrap();
        let hits = idx.search(&[0.0; 4], &QueryParams::with_k(3)).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn test_single_node() {
        let mut idx = HnswIndex::new(DistanceMetric::L2, 2, 16, 200).unwrap();
        idx.add_vectors(&[vec![1.0, 2.0]]).unwrap();
        let hits = idx.search(&[1.0, 2.0], &QueryParams::with_k(1)).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0, 0);
        assert!(hits[0].1.abs() < 1e-6);
    }

    #[test]
    fn test_self_recall_l2() {
        let vectors = grid_vectors(200, 16);
        let idx = fitted(DistanceMetric::L2, &vectors);
        let mut found = 0;
        for (i, v) in vectors.iter().enumerate() {
            let hits = idx.search(v, &QueryParams::with_k(1)).unwrap();
            if hits.first().map(|h| h.0) == Some(i) {
                found += 1;
            }
        }
        assert!(
            found as f32 / vectors.len() as f32 >= 0.95,
            "recall@1 {found}/200 below 0.95"
        );
    }

    #[test]
    fn test_self_match_inner_product_score() {
        let vectors = vec![vec![1.0, 0.0], vec![3.0, 0.0], vec![0.0, 1.0]];
        let idx = fitted(DistanceMetric::InnerProduct, &vectors);
        let hits = idx.search(&[1.0, 0.0], &QueryParams::with_k(3)).unwrap();
        // Highest dot product first
        assert_eq!(hits[0].0, 1);
        assert!((hits[0].1 - 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_incremental_add() {
        let vectors = grid_vectors(50, 8);
        let mut idx = fitted(DistanceMetric::L2, &vectors);
        let rows = idx.add_vectors(&[vec![0.99; 8]]).unwrap();
        assert_eq!(rows, vec![50]);
        let hits = idx.search(&[0.99; 8], &QueryParams::with_k(1)).unwrap();
        assert_eq!(hits[0].0, 50);
    }

    #[test]
    fn test_soft_delete_hides_node() {
        let vectors = grid_vectors(30, 8);
        let mut idx = fitted(DistanceMetric::L2, &vectors);
        idx.remove_vectors(&[4]).unwrap();
        let hits = idx.search(&vectors[4], &QueryParams::with_k(5)).unwrap();
        assert!(hits.iter().all(|&(row, _)| row != 4), "tombstoned row surfaced");
    }

    #[test]
    fn test_range_search_unsupported() {
        let idx = HnswIndex::new(DistanceMetric::L2, 4, 16, 200).unwrap();
        let err = idx
            .range_search(&[0.0; 4], 1.0, &QueryParams::default())
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedOperation { .. }));
        assert!(!idx.supports_range());
    }

    #[test]
    fn test_save_load_preserves_results() {
        let vectors = grid_vectors(60, 8);
        let idx = fitted(DistanceMetric::Cosine, &vectors);
        let before = idx.search(&vectors[3], &QueryParams::with_k(5)).unwrap();

        let mut buf = Vec::new();
        assert!(idx.save(&mut buf).unwrap());
        let mut restored = HnswIndex::new(DistanceMetric::L2, 1, 4, 10).unwrap();
        assert!(restored.load(&mut buf.as_slice()).unwrap());
        let after = restored.search(&vectors[3], &QueryParams::with_k(5)).unwrap();

        assert_eq!(before.len(), after.len());
        for (b, a) in before.iter().zip(after.iter()) {
            assert_eq!(b.0, a.0, "row order changed across save/load");
            assert!((b.1 - a.1).abs() < 1e-6);
        }
    }

    #[test]
    fn test_ef_search_override() {
        let vectors = grid_vectors(100, 8);
        let idx = fitted(DistanceMetric::L2, &vectors);
        let mut params = QueryParams::with_k(10);
        params.ef_search = 100;
        let hits = idx.search(&vectors[0], &params).unwrap();
        assert_eq!(hits.len(), 10);
        for pair in hits.windows(2) {
            assert!(pair[0].1 <= pair[1].1, "results must be sorted ascending");
        }
    }

    #[test]
    fn test_invalid_config() {
        assert!(HnswIndex::new(DistanceMetric::L2, 0, 16, 200).is_err());
        assert!(HnswIndex::new(DistanceMetric::L2, 4, 0, 200).is_err());
    }
}
