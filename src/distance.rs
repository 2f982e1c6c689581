//! Distance metric implementations.
//!
//! Three metrics are supported. L2 and cosine are distances where lower is
//! better; inner product is a similarity where higher is better. The
//! `better_first` comparator encodes that per-metric ordering so callers
//! never hardcode a sort direction.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Distance metric used for vector similarity computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Euclidean distance. Range: \[0, ∞). Lower is better.
    L2,
    /// Inner product similarity. Higher is better.
    InnerProduct,
    /// Cosine distance: `1 - cosine_similarity`. Range: \[0, 2\]. Lower is better.
    Cosine,
}

impl DistanceMetric {
    /// Stable string form, persisted in the config artifact.
    pub fn as_str(&self) -> &'static str {
        match self {
            DistanceMetric::L2 => "l2",
            DistanceMetric::InnerProduct => "inner_product",
            DistanceMetric::Cosine => "cosine",
        }
    }

    /// Parse the stable string form. Returns `None` on unknown input.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "l2" => Some(DistanceMetric::L2),
            "inner_product" => Some(DistanceMetric::InnerProduct),
            "cosine" => Some(DistanceMetric::Cosine),
            _ => None,
        }
    }

    /// Compute the score between two equal-length vectors.
    ///
    /// L2 returns the true (non-squared) Euclidean distance; cosine returns
    /// `1 - cos(a, b)`; inner product returns `dot(a, b)`.
    pub fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            DistanceMetric::L2 => euclidean(a, b),
            DistanceMetric::InnerProduct => dot(a, b),
            DistanceMetric::Cosine => 1.0 - cosine_similarity(a, b),
        }
    }

    /// `true` when larger scores indicate closer matches (inner product).
    pub fn higher_is_better(&self) -> bool {
        matches!(self, DistanceMetric::InnerProduct)
    }

    /// Comparator placing better scores first under this metric.
    pub fn better_first(&self, a: f32, b: f32) -> Ordering {
        let ord = a.partial_cmp(&b).unwrap_or(Ordering::Equal);
        if self.higher_is_better() {
            ord.reverse()
        } else {
            ord
        }
    }

    /// Whether `score` falls within `radius` of a query under this metric:
    /// distance ≤ radius for L2/cosine, similarity ≥ radius for inner product.
    pub fn within_radius(&self, score: f32, radius: f32) -> bool {
        if self.higher_is_better() {
            score >= radius
        } else {
            score <= radius
        }
    }
}

impl fmt::Display for DistanceMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dot product of two equal-length slices. Chunked for SIMD-friendly codegen.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        sum += x * y;
    }
    sum
}

/// Squared Euclidean distance.
pub fn euclidean_sq(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let d = x - y;
        sum += d * d;
    }
    sum
}

/// Euclidean distance.
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    euclidean_sq(a, b).sqrt()
}

/// Cosine similarity; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot_sum = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot_sum += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = (norm_a * norm_b).sqrt();
    if denom > 0.0 {
        dot_sum / denom
    } else {
        0.0
    }
}

/// Euclidean norm of a vector.
pub fn norm(v: &[f32]) -> f32 {
    dot(v, v).sqrt()
}
