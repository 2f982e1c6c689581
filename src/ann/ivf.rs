//! Inverted-file indexes: IVF-Flat and IVF-PQ.
//!
//! Both kinds partition the vector space with a k-means coarse quantizer
//! (`nlist` centroids) and keep one inverted list of row positions per
//! centroid. Queries probe the `nprobe` nearest lists. IVF-Flat scans raw
//! vectors exactly; IVF-PQ scans 8-bit product-quantized codes through a
//! per-query distance table, then re-ranks the surviving candidates
//! against the raw vectors so returned scores are exact.
//!
//! Raw vectors are retained in both kinds — they back `reconstruct`, the
//! PQ re-rank stage, and incremental adds after training.

use crate::ann::{check_metric, AnnIndex, AnnMetrics, BuildParams, IndexStats, QueryParams, RowHit};
use crate::config;
use crate::distance::{self, DistanceMetric};
use crate::error::{Error, Result};
use crate::store::persistence::{read_framed, write_framed};
use crate::types::Vector;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BinaryHeap;
use std::io::{Read, Write};
use std::time::Instant;

const IVF_FLAT_MAGIC: &[u8; 4] = b"MIV1";
const IVF_PQ_MAGIC: &[u8; 4] = b"MPQ1";

static IVF_METRICS: [DistanceMetric; 3] = [
    DistanceMetric::L2,
    DistanceMetric::InnerProduct,
    DistanceMetric::Cosine,
];

/// Minimal deterministic PRNG (xorshift64) so training never depends on
/// process entropy — identical input produces an identical index.
struct SimpleRng {
    state: u64,
}

impl SimpleRng {
    fn with_seed(seed: u64) -> Self {
        Self {
            state: seed ^ 0x517c_c1b7_2722_0a95,
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x
    }

    fn next_usize(&mut self) -> usize {
        self.next_u64() as usize
    }

    fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// K-means clustering with k-means++ initialization.
/// Returns `k × dim` centroids as a flat array. When there are fewer
/// points than centroids, each point becomes its own centroid and the
/// remainder stay zero.
fn kmeans(data: &[f32], dim: usize, k: usize, iterations: usize, rng: &mut SimpleRng) -> Vec<f32> {
    let n = data.len() / dim;
    let mut centroids = vec![0.0f32; k * dim];
    if n == 0 {
        return centroids;
    }
    if n <= k {
        centroids[..n * dim].copy_from_slice(&data[..n * dim]);
        return centroids;
    }

    // K-means++ seeding: first centroid uniform, the rest weighted by
    // squared distance to the nearest chosen centroid.
    let first = rng.next_usize() % n;
    centroids[..dim].copy_from_slice(&data[first * dim..(first + 1) * dim]);
    let mut min_dists = vec![f32::MAX; n];

    for ci in 1..k {
        let last = &centroids[(ci - 1) * dim..ci * dim];
        let mut total = 0.0f64;
        for i in 0..n {
            let point = &data[i * dim..(i + 1) * dim];
            let d = distance::euclidean_sq(point, last);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total += min_dists[i] as f64;
        }
        if total < 1e-30 {
            let idx = rng.next_usize() % n;
            centroids[ci * dim..(ci + 1) * dim].copy_from_slice(&data[idx * dim..(idx + 1) * dim]);
            continue;
        }
        let threshold = rng.next_f64() * total;
        let mut cumulative = 0.0f64;
        let mut chosen = n - 1;
        for (i, &d) in min_dists.iter().enumerate() {
            cumulative += d as f64;
            if cumulative >= threshold {
                chosen = i;
                break;
            }
        }
        centroids[ci * dim..(ci + 1) * dim]
            .copy_from_slice(&data[chosen * dim..(chosen + 1) * dim]);
    }

    // Lloyd iterations
    let mut assignments = vec![0usize; n];
    for _ in 0..iterations {
        for i in 0..n {
            let point = &data[i * dim..(i + 1) * dim];
            let mut best = 0usize;
            let mut best_dist = f32::MAX;
            for ci in 0..k {
                let c = &centroids[ci * dim..(ci + 1) * dim];
                let d = distance::euclidean_sq(point, c);
                if d < best_dist {
                    best_dist = d;
                    best = ci;
                }
            }
            assignments[i] = best;
        }

        let mut counts = vec![0u32; k];
        let mut sums = vec![0.0f32; k * dim];
        for i in 0..n {
            let ci = assignments[i];
            counts[ci] += 1;
            let point = &data[i * dim..(i + 1) * dim];
            let c = &mut sums[ci * dim..(ci + 1) * dim];
            for d in 0..dim {
                c[d] += point[d];
            }
        }
        for ci in 0..k {
            if counts[ci] > 0 {
                let inv = 1.0 / counts[ci] as f32;
                let src = &sums[ci * dim..(ci + 1) * dim];
                let dst = &mut centroids[ci * dim..(ci + 1) * dim];
                for d in 0..dim {
                    dst[d] = src[d] * inv;
                }
            }
        }
    }

    centroids
}

/// Index of the centroid nearest to `point` under squared L2.
fn nearest_centroid(centroids: &[f32], dim: usize, k: usize, point: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_dist = f32::MAX;
    for ci in 0..k {
        let c = &centroids[ci * dim..(ci + 1) * dim];
        let d = distance::euclidean_sq(point, c);
        if d < best_dist {
            best_dist = d;
            best = ci;
        }
    }
    best
}

/// The `nprobe` centroids closest to the query, nearest first.
fn probe_order(centroids: &[f32], dim: usize, k: usize, query: &[f32], nprobe: usize) -> Vec<usize> {
    let mut scored: Vec<(f32, usize)> = (0..k)
        .map(|ci| {
            let c = &centroids[ci * dim..(ci + 1) * dim];
            (distance::euclidean_sq(query, c), ci)
        })
        .collect();
    scored.sort_unstable_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
    scored.into_iter().take(nprobe.max(1)).map(|(_, ci)| ci).collect()
}

/// Shared coarse-quantizer state for both IVF kinds.
#[derive(Serialize, Deserialize, Debug)]
struct IvfCoarse {
    metric: DistanceMetric,
    dimension: usize,
    nlist: usize,
    centroids: Vec<f32>,
    lists: Vec<Vec<usize>>,
    data: Vec<f32>,
    deleted: Vec<bool>,
    trained: bool,
}

impl IvfCoarse {
    fn new(metric: DistanceMetric, dimension: usize, nlist: usize) -> Self {
        Self {
            metric,
            dimension,
            nlist,
            centroids: Vec::new(),
            lists: Vec::new(),
            data: Vec::new(),
            deleted: Vec::new(),
            trained: false,
        }
    }

    fn rows(&self) -> usize {
        self.deleted.len()
    }

    fn row_slice(&self, row: usize) -> &[f32] {
        let start = row * self.dimension;
        &self.data[start..start + self.dimension]
    }

    fn train(&mut self, vectors: &[Vector]) -> Result<()> {
        for v in vectors {
            Error::check_dimension(self.dimension, v.len())?;
        }
        let mut arena = Vec::with_capacity(vectors.len() * self.dimension);
        for v in vectors {
            arena.extend_from_slice(v);
        }
        let mut rng = SimpleRng::with_seed(vectors.len() as u64 * 31 + self.dimension as u64);
        self.centroids = kmeans(
            &arena,
            self.dimension,
            self.nlist,
            config::IVF_KMEANS_ITERATIONS,
            &mut rng,
        );
        self.lists = vec![Vec::new(); self.nlist];
        self.data.clear();
        self.deleted.clear();
        self.trained = true;
        Ok(())
    }

    /// Append one vector; returns its new row position.
    fn append(&mut self, vector: &[f32]) -> usize {
        let row = self.rows();
        let list = nearest_centroid(&self.centroids, self.dimension, self.nlist, vector);
        self.lists[list].push(row);
        self.data.extend_from_slice(vector);
        self.deleted.push(false);
        row
    }

    fn remove_rows(&mut self, rows: &[usize]) {
        for &row in rows {
            if row < self.deleted.len() && !self.deleted[row] {
                self.deleted[row] = true;
                for list in &mut self.lists {
                    if let Some(pos) = list.iter().position(|&r| r == row) {
                        list.swap_remove(pos);
                        break;
                    }
                }
            }
        }
    }

    fn memory_bytes(&self) -> usize {
        self.centroids.len() * 4
            + self.data.len() * 4
            + self.deleted.len()
            + self.lists.iter().map(|l| l.len() * 8).sum::<usize>()
    }
}

/// Bounded top-k collector keyed by better-first rank.
struct TopK {
    heap: BinaryHeap<(OrderedFloat<f32>, usize)>,
    k: usize,
    higher_is_better: bool,
}

impl TopK {
    fn new(k: usize, higher_is_better: bool) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(k + 1),
            k,
            higher_is_better,
        }
    }

    fn push(&mut self, row: usize, score: f32) {
        let rank = if self.higher_is_better { -score } else { score };
        self.heap.push((OrderedFloat(rank), row));
        if self.heap.len() > self.k {
            self.heap.pop();
        }
    }

    fn into_sorted(self, metric: DistanceMetric) -> Vec<RowHit> {
        let higher = self.higher_is_better;
        let mut hits: Vec<(f32, usize)> = self
            .heap
            .into_iter()
            .map(|(rank, row)| {
                let score = if higher { -rank.0 } else { rank.0 };
                (score, row)
            })
            .collect();
        hits.sort_unstable_by(|a, b| metric.better_first(a.0, b.0));
        hits.into_iter().map(|(score, row)| (row, score)).collect()
    }
}

// ---------------------------------------------------------------------------
// IVF-Flat
// ---------------------------------------------------------------------------

/// Inverted file with exact scan of raw vectors in the probed lists.
#[derive(Debug)]
pub struct IvfFlatIndex {
    coarse: IvfCoarse,
}

impl IvfFlatIndex {
    /// Untrained index for the given metric, dimension, and cluster count.
    pub fn new(metric: DistanceMetric, dimension: usize, nlist: usize) -> Result<Self> {
        check_metric("ivf_flat", &IVF_METRICS, metric)?;
        if dimension == 0 || nlist == 0 {
            return Err(Error::InvalidConfig(
                "ivf_flat requires positive dimension and nlist".into(),
            ));
        }
        Ok(Self {
            coarse: IvfCoarse::new(metric, dimension, nlist),
        })
    }
}

impl AnnIndex for IvfFlatIndex {
    fn name(&self) -> &'static str {
        "ivf_flat"
    }

    fn supported_metrics(&self) -> &'static [DistanceMetric] {
        &IVF_METRICS
    }

    fn fit(&mut self, vectors: &[Vector], params: &BuildParams) -> Result<AnnMetrics> {
        check_metric("ivf_flat", &IVF_METRICS, params.metric)?;
        let start = Instant::now();
        self.coarse.metric = params.metric;
        self.coarse.dimension = params.dimension;
        self.coarse.train(vectors)?;
        let train_distance_ops =
            vectors.len() as u64 * self.coarse.nlist as u64 * config::IVF_KMEANS_ITERATIONS as u64;
        let mut extras = std::collections::HashMap::new();
        extras.insert("nlist".to_string(), self.coarse.nlist as f64);
        Ok(AnnMetrics {
            build_time_secs: start.elapsed().as_secs_f64(),
            memory_bytes: self.coarse.memory_bytes(),
            distance_computations: train_distance_ops,
            extras,
        })
    }

    fn is_trained(&self) -> bool {
        self.coarse.trained
    }

    fn search(&self, query: &[f32], params: &QueryParams) -> Result<Vec<RowHit>> {
        if !self.coarse.trained {
            return Err(Error::NotTrained);
        }
        Error::check_dimension(self.coarse.dimension, query.len())?;
        let probes = probe_order(
            &self.coarse.centroids,
            self.coarse.dimension,
            self.coarse.nlist,
            query,
            params.nprobe as usize,
        );
        let mut top = TopK::new(params.k, self.coarse.metric.higher_is_better());
        for list in probes {
            for &row in &self.coarse.lists[list] {
                if self.coarse.deleted[row] {
                    continue;
                }
                top.push(row, self.coarse.metric.score(query, self.coarse.row_slice(row)));
            }
        }
        Ok(top.into_sorted(self.coarse.metric))
    }

    fn range_search(&self, query: &[f32], radius: f32, params: &QueryParams) -> Result<Vec<RowHit>> {
        if !self.coarse.trained {
            return Err(Error::NotTrained);
        }
        Error::check_dimension(self.coarse.dimension, query.len())?;
        let probes = probe_order(
            &self.coarse.centroids,
            self.coarse.dimension,
            self.coarse.nlist,
            query,
            params.nprobe as usize,
        );
        let mut hits: Vec<(f32, usize)> = Vec::new();
        for list in probes {
            for &row in &self.coarse.lists[list] {
                if self.coarse.deleted[row] {
                    continue;
                }
                let score = self.coarse.metric.score(query, self.coarse.row_slice(row));
                if self.coarse.metric.within_radius(score, radius) {
                    hits.push((score, row));
                }
            }
        }
        hits.sort_unstable_by(|a, b| self.coarse.metric.better_first(a.0, b.0));
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
        if !self.coarse.trained {
            return Err(Error::NotTrained);
        }
        for v in vectors {
            Error::check_dimension(self.coarse.dimension, v.len())?;
        }
        Ok(vectors.iter().map(|v| self.coarse.append(v)).collect())
    }

    fn remove_vectors(&mut self, rows: &[usize]) -> Result<()> {
        self.coarse.remove_rows(rows);
        Ok(())
    }

    fn save(&self, writer: &mut dyn Write) -> Result<bool> {
        if !self.coarse.trained {
            return Ok(false);
        }
        let bytes = bincode::serialize(&self.coarse)
            .map_err(|e| Error::Corruption(format!("ivf_flat serialization failed: {e}")))?;
        write_framed(writer, IVF_FLAT_MAGIC, &bytes)?;
        Ok(true)
    }

    fn load(&mut self, reader: &mut dyn Read) -> Result<bool> {
        let bytes = read_framed(reader, IVF_FLAT_MAGIC)?;
        let coarse: IvfCoarse = bincode::deserialize(&bytes)
            .map_err(|e| Error::Corruption(format!("ivf_flat deserialization failed: {e}")))?;
        if coarse.data.len() != coarse.deleted.len() * coarse.dimension {
            return Err(Error::Corruption("ivf_flat arena length mismatch".into()));
        }
        self.coarse = coarse;
        Ok(true)
    }

    fn reconstruct(&self, row: usize) -> Option<Vector> {
        if row < self.coarse.rows() && !self.coarse.deleted[row] {
            Some(self.coarse.row_slice(row).to_vec())
        } else {
            None
        }
    }

    fn stats(&self) -> IndexStats {
        let mut extras = std::collections::HashMap::new();
        extras.insert("nlist".to_string(), self.coarse.nlist as f64);
        IndexStats {
            rows: self.coarse.rows(),
            memory_bytes: self.coarse.memory_bytes(),
            extras,
        }
    }

    fn build_params(&self) -> BuildParams {
        let mut params = BuildParams::new(self.coarse.metric, self.coarse.dimension);
        params.extras.set("nlist", self.coarse.nlist);
        params
    }
}

/// Factory for [`IvfFlatIndex`].
pub struct IvfFlatFactory;

impl crate::ann::AnnFactory for IvfFlatFactory {
    fn name(&self) -> &'static str {
        "ivf_flat"
    }

    fn description(&self) -> &'static str {
        "inverted file over a k-means coarse quantizer with exact list scan"
    }

    fn supported_metrics(&self) -> &'static [DistanceMetric] {
        &IVF_METRICS
    }

    fn create(&self, params: &BuildParams) -> Result<Box<dyn AnnIndex>> {
        let nlist = params
            .extras
            .get_parsed("nlist", config::IVF_DEFAULT_NLIST as usize);
        Ok(Box::new(IvfFlatIndex::new(params.metric, params.dimension, nlist)?))
    }
}

// ---------------------------------------------------------------------------
// IVF-PQ
// ---------------------------------------------------------------------------

/// PQ codebook: `m` subspaces × 256 centroids × `sub_dim` floats.
#[derive(Serialize, Deserialize, Debug)]
struct PqCodebook {
    m: usize,
    sub_dim: usize,
    /// Flat centroid array: `[m][256][sub_dim]`.
    centroids: Vec<f32>,
}

impl PqCodebook {
    fn train(arena: &[f32], dim: usize, m: usize, rng: &mut SimpleRng) -> Self {
        let sub_dim = dim / m;
        let n = arena.len() / dim;
        let mut centroids = vec![0.0f32; m * config::PQ_NUM_CENTROIDS * sub_dim];
        for sub in 0..m {
            let mut sub_vectors = vec![0.0f32; n * sub_dim];
            for i in 0..n {
                let src = i * dim + sub * sub_dim;
                sub_vectors[i * sub_dim..(i + 1) * sub_dim]
                    .copy_from_slice(&arena[src..src + sub_dim]);
            }
            let sub_centroids = kmeans(
                &sub_vectors,
                sub_dim,
                config::PQ_NUM_CENTROIDS,
                config::PQ_KMEANS_ITERATIONS,
                rng,
            );
            let out = sub * config::PQ_NUM_CENTROIDS * sub_dim;
            centroids[out..out + sub_centroids.len()].copy_from_slice(&sub_centroids);
        }
        Self { m, sub_dim, centroids }
    }

    fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let mut codes = Vec::with_capacity(self.m);
        for sub in 0..self.m {
            let sub_vec = &vector[sub * self.sub_dim..(sub + 1) * self.sub_dim];
            let base = sub * config::PQ_NUM_CENTROIDS * self.sub_dim;
            let mut best = 0u8;
            let mut best_dist = f32::MAX;
            for ci in 0..config::PQ_NUM_CENTROIDS {
                let c = &self.centroids[base + ci * self.sub_dim..base + (ci + 1) * self.sub_dim];
                let d = distance::euclidean_sq(sub_vec, c);
                if d < best_dist {
                    best_dist = d;
                    best = ci as u8;
                }
            }
            codes.push(best);
        }
        codes
    }

    /// Per-query asymmetric distance table: `[m][256]` partial scores.
    /// L2 uses partial squared distances; inner product and cosine use
    /// negative partial dots as a lower-is-better proxy (exact re-ranking
    /// restores true scores and order).
    fn distance_table(&self, query: &[f32], metric: DistanceMetric) -> Vec<f32> {
        let k = config::PQ_NUM_CENTROIDS;
        let mut table = vec![0.0f32; self.m * k];
        for sub in 0..self.m {
            let q_sub = &query[sub * self.sub_dim..(sub + 1) * self.sub_dim];
            let base = sub * k * self.sub_dim;
            for ci in 0..k {
                let c = &self.centroids[base + ci * self.sub_dim..base + (ci + 1) * self.sub_dim];
                table[sub * k + ci] = match metric {
                    DistanceMetric::L2 => distance::euclidean_sq(q_sub, c),
                    DistanceMetric::InnerProduct | DistanceMetric::Cosine => -distance::dot(q_sub, c),
                };
            }
        }
        table
    }

    #[inline]
    fn table_distance(&self, table: &[f32], codes: &[u8]) -> f32 {
        let k = config::PQ_NUM_CENTROIDS;
        let mut dist = 0.0f32;
        for (sub, &code) in codes.iter().enumerate() {
            dist += table[sub * k + code as usize];
        }
        dist
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct IvfPqState {
    coarse: IvfCoarse,
    codebook: Option<PqCodebook>,
    codes: Vec<u8>,
    pq_m: usize,
}

/// Inverted file with product-quantized codes and exact re-ranking.
#[derive(Debug)]
pub struct IvfPqIndex {
    state: IvfPqState,
}

impl IvfPqIndex {
    /// Untrained index. `pq_m` must evenly divide `dimension`.
    pub fn new(metric: DistanceMetric, dimension: usize, nlist: usize, pq_m: usize) -> Result<Self> {
        check_metric("ivf_pq", &IVF_METRICS, metric)?;
        if dimension == 0 || nlist == 0 {
            return Err(Error::InvalidConfig(
                "ivf_pq requires positive dimension and nlist".into(),
            ));
        }
        if pq_m == 0 || dimension % pq_m != 0 {
            return Err(Error::InvalidConfig(format!(
                "pq_m={pq_m} must evenly divide dimension {dimension}"
            )));
        }
        Ok(Self {
            state: IvfPqState {
                coarse: IvfCoarse::new(metric, dimension, nlist),
                codebook: None,
                codes: Vec::new(),
                pq_m,
            },
        })
    }

    fn encode_row(&mut self, vector: &[f32]) {
        if let Some(ref cb) = self.state.codebook {
            let codes = cb.encode(vector);
            self.state.codes.extend_from_slice(&codes);
        }
    }
}

impl AnnIndex for IvfPqIndex {
    fn name(&self) -> &'static str {
        "ivf_pq"
    }

    fn supported_metrics(&self) -> &'static [DistanceMetric] {
        &IVF_METRICS
    }

    fn fit(&mut self, vectors: &[Vector], params: &BuildParams) -> Result<AnnMetrics> {
        check_metric("ivf_pq", &IVF_METRICS, params.metric)?;
        let start = Instant::now();
        self.state.coarse.metric = params.metric;
        self.state.coarse.dimension = params.dimension;
        if params.dimension % self.state.pq_m != 0 {
            return Err(Error::InvalidConfig(format!(
                "pq_m={} must evenly divide dimension {}",
                self.state.pq_m, params.dimension
            )));
        }
        self.state.coarse.train(vectors)?;

        let dim = self.state.coarse.dimension;
        let mut arena = Vec::with_capacity(vectors.len() * dim);
        for v in vectors {
            arena.extend_from_slice(v);
        }
        let mut rng = SimpleRng::with_seed(arena.len() as u64 * 17 + 3);
        self.state.codebook = Some(PqCodebook::train(&arena, dim, self.state.pq_m, &mut rng));
        self.state.codes.clear();

        let mut extras = std::collections::HashMap::new();
        extras.insert("nlist".to_string(), self.state.coarse.nlist as f64);
        extras.insert("pq_m".to_string(), self.state.pq_m as f64);
        Ok(AnnMetrics {
            build_time_secs: start.elapsed().as_secs_f64(),
            memory_bytes: self.stats().memory_bytes,
            distance_computations: vectors.len() as u64
                * (self.state.coarse.nlist + config::PQ_NUM_CENTROIDS) as u64,
            extras,
        })
    }

    fn is_trained(&self) -> bool {
        self.state.coarse.trained && self.state.codebook.is_some()
    }

    fn search(&self, query: &[f32], params: &QueryParams) -> Result<Vec<RowHit>> {
        let codebook = self.state.codebook.as_ref().ok_or(Error::NotTrained)?;
        if !self.state.coarse.trained {
            return Err(Error::NotTrained);
        }
        Error::check_dimension(self.state.coarse.dimension, query.len())?;

        let probes = probe_order(
            &self.state.coarse.centroids,
            self.state.coarse.dimension,
            self.state.coarse.nlist,
            query,
            params.nprobe as usize,
        );

        // Stage 1: approximate scores from the PQ distance table.
        let table = codebook.distance_table(query, self.state.coarse.metric);
        let shortlist = params.k.saturating_mul(4).max(params.k);
        let mut approx: BinaryHeap<(OrderedFloat<f32>, usize)> =
            BinaryHeap::with_capacity(shortlist + 1);
        for list in probes {
            for &row in &self.state.coarse.lists[list] {
                if self.state.coarse.deleted[row] {
                    continue;
                }
                let codes = &self.state.codes[row * self.state.pq_m..(row + 1) * self.state.pq_m];
                let d = codebook.table_distance(&table, codes);
                approx.push((OrderedFloat(d), row));
                if approx.len() > shortlist {
                    approx.pop();
                }
            }
        }

        // Stage 2: exact re-rank against raw vectors.
        let mut top = TopK::new(params.k, self.state.coarse.metric.higher_is_better());
        for (_, row) in approx {
            top.push(
                row,
                self.state
                    .coarse
                    .metric
                    .score(query, self.state.coarse.row_slice(row)),
            );
        }
        Ok(top.into_sorted(self.state.coarse.metric))
    }

    fn range_search(&self, query: &[f32], radius: f32, params: &QueryParams) -> Result<Vec<RowHit>> {
        if !self.is_trained() {
            return Err(Error::NotTrained);
        }
        Error::check_dimension(self.state.coarse.dimension, query.len())?;
        let probes = probe_order(
            &self.state.coarse.centroids,
            self.state.coarse.dimension,
            self.state.coarse.nlist,
            query,
            params.nprobe as usize,
        );
        let metric = self.state.coarse.metric;
        let mut hits: Vec<(f32, usize)> = Vec::new();
        for list in probes {
            for &row in &self.state.coarse.lists[list] {
                if self.state.coarse.deleted[row] {
                    continue;
                }
                let score = metric.score(query, self.state.coarse.row_slice(row));
                if metric.within_radius(score, radius) {
                    hits.push((score, row));
                }
            }
        }
        hits.sort_unstable_by(|a, b| metric.better_first(a.0, b.0));
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
        if !self.is_trained() {
            return Err(Error::NotTrained);
        }
        for v in vectors {
            Error::check_dimension(self.state.coarse.dimension, v.len())?;
        }
        let mut rows = Vec::with_capacity(vectors.len());
        for v in vectors {
            rows.push(self.state.coarse.append(v));
            self.encode_row(v);
        }
        Ok(rows)
    }

    fn remove_vectors(&mut self, rows: &[usize]) -> Result<()> {
        self.state.coarse.remove_rows(rows);
        Ok(())
    }

    fn save(&self, writer: &mut dyn Write) -> Result<bool> {
        if !self.is_trained() {
            return Ok(false);
        }
        let bytes = bincode::serialize(&self.state)
            .map_err(|e| Error::Corruption(format!("ivf_pq serialization failed: {e}")))?;
        write_framed(writer, IVF_PQ_MAGIC, &bytes)?;
        Ok(true)
    }

    fn load(&mut self, reader: &mut dyn Read) -> Result<bool> {
        let bytes = read_framed(reader, IVF_PQ_MAGIC)?;
        let state: IvfPqState = bincode::deserialize(&bytes)
            .map_err(|e| Error::Corruption(format!("ivf_pq deserialization failed: {e}")))?;
        if state.codes.len() != state.coarse.deleted.len() * state.pq_m {
            return Err(Error::Corruption("ivf_pq code arena length mismatch".into()));
        }
        self.state = state;
        Ok(true)
    }

    fn reconstruct(&self, row: usize) -> Option<Vector> {
        if row < self.state.coarse.rows() && !self.state.coarse.deleted[row] {
            Some(self.state.coarse.row_slice(row).to_vec())
        } else {
            None
        }
    }

    fn stats(&self) -> IndexStats {
        let mut extras = std::collections::HashMap::new();
        extras.insert("nlist".to_string(), self.state.coarse.nlist as f64);
        extras.insert("pq_m".to_string(), self.state.pq_m as f64);
        IndexStats {
            rows: self.state.coarse.rows(),
            memory_bytes: self.state.coarse.memory_bytes()
                + self.state.codes.len()
                + self
                    .state
                    .codebook
                    .as_ref()
                    .map_or(0, |cb| cb.centroids.len() * 4),
            extras,
        }
    }

    fn build_params(&self) -> BuildParams {
        let mut params = BuildParams::new(self.state.coarse.metric, self.state.coarse.dimension);
        params.extras.set("nlist", self.state.coarse.nlist);
        params.extras.set("pq_m", self.state.pq_m);
        params
    }
}

/// Factory for [`IvfPqIndex`].
pub struct IvfPqFactory;

impl crate::ann::AnnFactory for IvfPqFactory {
    fn name(&self) -> &'static str {
        "ivf_pq"
    }

    fn description(&self) -> &'static str {
        "inverted file with 8-bit product-quantized codes and exact re-ranking"
    }

    fn supported_metrics(&self) -> &'static [DistanceMetric] {
        &IVF_METRICS
    }

    fn create(&self, params: &BuildParams) -> Result<Box<dyn AnnIndex>> {
        let nlist = params
            .extras
            .get_parsed("nlist", config::IVF_DEFAULT_NLIST as usize);
        let pq_m = params.extras.get_parsed("pq_m", config::PQ_DEFAULT_M as usize);
        Ok(Box::new(IvfPqIndex::new(
            params.metric,
            params.dimension,
            nlist,
            pq_m,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_vectors(n: usize, dim: usize) -> Vec<Vector> {
        (0..n)
            .map(|i| (0..dim).map(|j| ((i * 7 + j * 13) % 97) as f32 / 97.0).collect())
            .collect()
    }

    fn fit_ivf_flat(vectors: &[Vector], nlist: usize) -> IvfFlatIndex {
        let dim = vectors[0].len();
        let mut idx = IvfFlatIndex::new(DistanceMetric::L2, dim, nlist).unwrap();
        idx.fit(vectors, &BuildParams::new(DistanceMetric::L2, dim)).unwrap();
        idx.add_vectors(vectors).unwrap();
        idx
    }

    #[test]
    fn test_kmeans_fewer_points_than_centroids() {
        let data = vec![1.0, 0.0, 0.0, 1.0];
        let mut rng = SimpleRng::with_seed(1);
        let centroids = kmeans(&data, 2, 4, 5, &mut rng);
        assert_eq!(centroids.len(), 8);
        assert_eq!(&centroids[..4], &[1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_kmeans_separates_clusters() {
        // Two well-separated blobs; centroids should land near each
        let mut data = Vec::new();
        for i in 0..20 {
            data.extend_from_slice(&[10.0 + (i % 3) as f32 * 0.01, 10.0]);
            data.extend_from_slice(&[-10.0 - (i % 3) as f32 * 0.01, -10.0]);
        }
        let mut rng = SimpleRng::with_seed(42);
        let centroids = kmeans(&data, 2, 2, 10, &mut rng);
        let near_pos = centroids.chunks(2).any(|c| c[0] > 5.0 && c[1] > 5.0);
        let near_neg = centroids.chunks(2).any(|c| c[0] < -5.0 && c[1] < -5.0);
        assert!(near_pos && near_neg, "centroids {centroids:?} missed the blobs");
    }

    #[test]
    fn test_ivf_flat_untrained_search_fails() {
        let idx = IvfFlatIndex::new(DistanceMetric::L2, 4, 2).unwrap();
        assert!(!idx.is_trained());
        let err = idx.search(&[0.0; 4], &QueryParams::with_k(1)).unwrap_err();
        assert!(matches!(err, Error::NotTrained));
    }

    #[test]
    fn test_ivf_flat_recall_with_full_probe() {
        let vectors = grid_vectors(50, 8);
        let idx = fit_ivf_flat(&vectors, 4);
        let mut params = QueryParams::with_k(1);
        params.nprobe = 4; // probe every list: recall must be exact
        for (i, v) in vectors.iter().enumerate() {
            let hits = idx.search(v, &params).unwrap();
            assert_eq!(hits[0].0, i, "self-query must return own row");
            assert!(hits[0].1.abs() < 1e-5);
        }
    }

    #[test]
    fn test_ivf_flat_add_after_training() {
        let vectors = grid_vectors(20, 4);
        let mut idx = fit_ivf_flat(&vectors, 2);
        let rows = idx.add_vectors(&[vec![0.9, 0.9, 0.9, 0.9]]).unwrap();
        assert_eq!(rows, vec![20]);
        let mut params = QueryParams::with_k(1);
        params.nprobe = 2;
        let hits = idx.search(&[0.9, 0.9, 0.9, 0.9], &params).unwrap();
        assert_eq!(hits[0].0, 20);
    }

    #[test]
    fn test_ivf_flat_remove() {
        let vectors = grid_vectors(10, 4);
        let mut idx = fit_ivf_flat(&vectors, 2);
        idx.remove_vectors(&[3]).unwrap();
        let mut params = QueryParams::with_k(10);
        params.nprobe = 2;
        let hits = idx.search(&vectors[3], &params).unwrap();
        assert!(hits.iter().all(|&(row, _)| row != 3));
    }

    #[test]
    fn test_ivf_flat_range_search() {
        let vectors = vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![5.0, 5.0],
        ];
        let mut idx = IvfFlatIndex::new(DistanceMetric::L2, 2, 1).unwrap();
        idx.fit(&vectors, &BuildParams::new(DistanceMetric::L2, 2)).unwrap();
        idx.add_vectors(&vectors).unwrap();
        let hits = idx.range_search(&[0.0, 0.0], 1.0, &QueryParams::default()).unwrap();
        let rows: Vec<usize> = hits.iter().map(|h| h.0).collect();
        assert_eq!(rows, vec![0, 1]);
    }

    #[test]
    fn test_ivf_flat_save_load() {
        let vectors = grid_vectors(30, 4);
        let idx = fit_ivf_flat(&vectors, 3);
        let mut buf = Vec::new();
        assert!(idx.save(&mut buf).unwrap());

        let mut restored = IvfFlatIndex::new(DistanceMetric::L2, 4, 3).unwrap();
        assert!(restored.load(&mut buf.as_slice()).unwrap());
        assert!(restored.is_trained());
        let mut params = QueryParams::with_k(1);
        params.nprobe = 3;
        let hits = restored.search(&vectors[5], &params).unwrap();
        assert_eq!(hits[0].0, 5);
    }

    #[test]
    fn test_ivf_flat_untrained_save_is_empty() {
        let idx = IvfFlatIndex::new(DistanceMetric::L2, 4, 2).unwrap();
        let mut buf = Vec::new();
        assert!(!idx.save(&mut buf).unwrap());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_ivf_pq_invalid_m() {
        let err = IvfPqIndex::new(DistanceMetric::L2, 10, 2, 3).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn test_ivf_pq_exact_rerank_self_match() {
        let vectors = grid_vectors(40, 8);
        let mut idx = IvfPqIndex::new(DistanceMetric::L2, 8, 2, 2).unwrap();
        idx.fit(&vectors, &BuildParams::new(DistanceMetric::L2, 8)).unwrap();
        idx.add_vectors(&vectors).unwrap();
        let mut params = QueryParams::with_k(1);
        params.nprobe = 2;
        // Re-ranking against raw vectors makes self-queries exact
        let hits = idx.search(&vectors[7], &params).unwrap();
        assert_eq!(hits[0].0, 7);
        assert!(hits[0].1.abs() < 1e-5, "self score ~0, got {}", hits[0].1);
    }

    #[test]
    fn test_ivf_pq_save_load() {
        let vectors = grid_vectors(40, 8);
        let mut idx = IvfPqIndex::new(DistanceMetric::Cosine, 8, 2, 2).unwrap();
        idx.fit(&vectors, &BuildParams::new(DistanceMetric::Cosine, 8)).unwrap();
        idx.add_vectors(&vectors).unwrap();
        let mut buf = Vec::new();
        assert!(idx.save(&mut buf).unwrap());

        let mut restored = IvfPqIndex::new(DistanceMetric::Cosine, 8, 2, 2).unwrap();
        assert!(restored.load(&mut buf.as_slice()).unwrap());
        let mut params = QueryParams::with_k(1);
        params.nprobe = 2;
        assert_eq!(restored.search(&vectors[11], &params).unwrap()[0].0, 11);
    }

    #[test]
    fn test_probe_order_prefers_near_centroid() {
        let centroids = vec![0.0, 0.0, 10.0, 10.0];
        let order = probe_order(&centroids, 2, 2, &[9.0, 9.0], 2);
        assert_eq!(order, vec![1, 0]);
    }
}
