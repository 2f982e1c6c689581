//! Reference fusion strategies.
//!
//! All strategies are deterministic and parameter-free beyond
//! [`FusionParams`]: no learned weights, no randomness. Modalities are
//! always visited in their stable sort order.

use crate::distance;
use crate::error::Result;
use crate::fusion::align::{align_dimension, block_sum_projection};
use crate::fusion::{FusionKind, FusionParams, FusionStrategy};
use crate::multimodal::ModalityType;
use crate::types::Vector;
use std::collections::BTreeMap;

/// Concatenation in modality order, each modality aligned to its slice of
/// the target dimension.
///
/// Slice lengths partition `target_dimension` proportionally to the
/// modality weights (equally when absent); the last slice absorbs the
/// rounding remainder. With `target_dimension == 0` the embeddings are
/// concatenated untouched.
pub struct ConcatenationFusion;

impl FusionStrategy for ConcatenationFusion {
    fn fuse(
        &self,
        embeddings: &BTreeMap<ModalityType, Vector>,
        params: &FusionParams,
    ) -> Result<Vector> {
        if embeddings.is_empty() {
            return Ok(Vector::new());
        }
        if params.target_dimension == 0 {
            let mut out = Vector::new();
            for embedding in embeddings.values() {
                out.extend_from_slice(embedding);
            }
            return Ok(out);
        }

        let count = embeddings.len();
        let total_weight: f32 = embeddings
            .keys()
            .map(|m| params.modality_weights.get(m).copied().unwrap_or(1.0))
            .sum();
        let mut out = Vector::with_capacity(params.target_dimension);
        for (i, (modality, embedding)) in embeddings.iter().enumerate() {
            let slice_len = if i + 1 == count {
                params.target_dimension - out.len()
            } else {
                let weight = params.modality_weights.get(modality).copied().unwrap_or(1.0);
                ((params.target_dimension as f32 * weight / total_weight) as usize)
                    .min(params.target_dimension - out.len())
            };
            out.extend_from_slice(&align_dimension(embedding, slice_len));
        }
        Ok(out)
    }

    fn kind(&self) -> FusionKind {
        FusionKind::Concatenation
    }
}

/// Weighted sum of embeddings aligned to the target dimension.
///
/// A modality without an explicit weight contributes `1 / count`.
pub struct WeightedAverageFusion;

impl FusionStrategy for WeightedAverageFusion {
    fn fuse(
        &self,
        embeddings: &BTreeMap<ModalityType, Vector>,
        params: &FusionParams,
    ) -> Result<Vector> {
        if embeddings.is_empty() {
            return Ok(Vector::new());
        }
        let target = resolve_target(embeddings, params);
        let default_weight = 1.0 / embeddings.len() as f32;
        let mut out = vec![0.0f32; target];
        for (modality, embedding) in embeddings {
            let weight = params
                .modality_weights
                .get(modality)
                .copied()
                .unwrap_or(default_weight);
            let aligned = align_dimension(embedding, target);
            for (slot, value) in out.iter_mut().zip(aligned.iter()) {
                *slot += weight * value;
            }
        }
        Ok(out)
    }

    fn kind(&self) -> FusionKind {
        FusionKind::WeightedAverage
    }
}

/// Softmax attention over the aligned embeddings.
///
/// The query is the mean of the aligned vectors; keys are the aligned
/// vectors themselves; per-modality weights are
/// `softmax(query · key_m)`. Deterministic given the same inputs.
pub struct AttentionFusion;

impl FusionStrategy for AttentionFusion {
    fn fuse(
        &self,
        embeddings: &BTreeMap<ModalityType, Vector>,
        params: &FusionParams,
    ) -> Result<Vector> {
        if embeddings.is_empty() {
            return Ok(Vector::new());
        }
        let target = resolve_target(embeddings, params);
        let aligned: Vec<Vector> = embeddings
            .values()
            .map(|e| align_dimension(e, target))
            .collect();

        let mut query = vec![0.0f32; target];
        for vector in &aligned {
            for (slot, value) in query.iter_mut().zip(vector.iter()) {
                *slot += value;
            }
        }
        let inv = 1.0 / aligned.len() as f32;
        for slot in &mut query {
            *slot *= inv;
        }

        let logits: Vec<f32> = aligned.iter().map(|key| distance::dot(&query, key)).collect();
        let max_logit = logits.iter().fold(f32::MIN, |a, &b| a.max(b));
        let exps: Vec<f32> = logits.iter().map(|&l| (l - max_logit).exp()).collect();
        let denom: f32 = exps.iter().sum();

        let mut out = vec![0.0f32; target];
        for (vector, &e) in aligned.iter().zip(exps.iter()) {
            let weight = e / denom;
            for (slot, value) in out.iter_mut().zip(vector.iter()) {
                *slot += weight * value;
            }
        }
        Ok(out)
    }

    fn kind(&self) -> FusionKind {
        FusionKind::Attention
    }
}

/// Pairwise outer-product fusion.
///
/// Folds the modalities left to right: flatten the outer product of the
/// accumulator with the next embedding, then project back to the target
/// dimension by summing consecutive blocks. Projecting after every step
/// keeps the intermediate bounded. A single modality is plain alignment.
pub struct TensorFusion;

impl FusionStrategy for TensorFusion {
    fn fuse(
        &self,
        embeddings: &BTreeMap<ModalityType, Vector>,
        params: &FusionParams,
    ) -> Result<Vector> {
        if embeddings.is_empty() {
            return Ok(Vector::new());
        }
        let target = resolve_target(embeddings, params);
        let mut iter = embeddings.values();
        let first = iter.next().map(|e| e.clone()).unwrap_or_default();
        if embeddings.len() == 1 {
            return Ok(align_dimension(&first, target));
        }

        let mut acc = first;
        for next in iter {
            let mut product = Vec::with_capacity(acc.len() * next.len());
            for &a in &acc {
                for &b in next {
                    product.push(a * b);
                }
            }
            acc = block_sum_projection(&product, target);
        }
        Ok(acc)
    }

    fn kind(&self) -> FusionKind {
        FusionKind::Tensor
    }
}

/// The output dimension for strategies that need one: the configured
/// target, or the first modality's length when unset.
fn resolve_target(embeddings: &BTreeMap<ModalityType, Vector>, params: &FusionParams) -> usize {
    if params.target_dimension > 0 {
        params.target_dimension
    } else {
        embeddings.values().next().map_or(0, Vector::len)
    }
}
