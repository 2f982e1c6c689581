//! Embedding fusion: reduce per-modality embeddings to one vector.
//!
//! A fusion strategy is a deterministic function from a set of modality
//! embeddings and [`FusionParams`] to a single fused vector. Reference
//! strategies live in [`strategies`]; the [`FusionEngine`] is an
//! instance-level registry keyed by [`FusionKind`] where re-registration
//! replaces the previous entry (unlike the append-only ANN registry).

/// Dimension alignment utilities.
pub mod align;
/// Reference fusion strategies.
pub mod strategies;

use crate::error::{Error, Result};
use crate::multimodal::ModalityType;
use crate::types::Vector;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub use align::align_dimension;

/// Tag identifying a fusion strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FusionKind {
    /// Slice-wise concatenation in modality order.
    Concatenation,
    /// Weighted sum of aligned embeddings.
    WeightedAverage,
    /// Softmax attention over aligned embeddings.
    Attention,
    /// Pairwise outer products projected back down.
    Tensor,
    /// Caller-registered strategy.
    Custom,
}

impl FusionKind {
    /// Stable string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            FusionKind::Concatenation => "concatenation",
            FusionKind::WeightedAverage => "weighted_average",
            FusionKind::Attention => "attention",
            FusionKind::Tensor => "tensor",
            FusionKind::Custom => "custom",
        }
    }
}

/// Parameters steering a fusion call.
#[derive(Debug, Clone)]
pub struct FusionParams {
    /// Which strategy to apply.
    pub kind: FusionKind,
    /// Output dimension. `0` lets the strategy pick its natural length.
    pub target_dimension: usize,
    /// Per-modality weights; strategies default missing entries.
    pub modality_weights: BTreeMap<ModalityType, f32>,
    /// Strategy-specific scalar knobs.
    pub extras: HashMap<String, f32>,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            kind: FusionKind::WeightedAverage,
            target_dimension: 0,
            modality_weights: BTreeMap::new(),
            extras: HashMap::new(),
        }
    }
}

impl FusionParams {
    /// Params for a strategy and output dimension.
    pub fn new(kind: FusionKind, target_dimension: usize) -> Self {
        Self {
            kind,
            target_dimension,
            ..Self::default()
        }
    }

    /// Set one modality weight, builder style.
    pub fn with_weight(mut self, modality: ModalityType, weight: f32) -> Self {
        self.modality_weights.insert(modality, weight);
        self
    }
}

/// A deterministic fusion strategy.
///
/// Inputs arrive as a `BTreeMap` so every strategy observes modalities in
/// their stable sort order.
pub trait FusionStrategy: Send + Sync {
    /// Reduce the modality embeddings to one vector.
    fn fuse(&self, embeddings: &BTreeMap<ModalityType, Vector>, params: &FusionParams)
        -> Result<Vector>;

    /// The tag this strategy serves.
    fn kind(&self) -> FusionKind;
}

/// Instance-level strategy registry.
///
/// Each engine starts with the reference strategies installed;
/// re-registering a kind replaces the previous entry.
pub struct FusionEngine {
    strategies: HashMap<FusionKind, Arc<dyn FusionStrategy>>,
}

impl Default for FusionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FusionEngine {
    /// Engine with the reference strategies installed.
    pub fn new() -> Self {
        let mut engine = Self {
            strategies: HashMap::new(),
        };
        engine.register(Arc::new(strategies::ConcatenationFusion));
        engine.register(Arc::new(strategies::WeightedAverageFusion));
        engine.register(Arc::new(strategies::AttentionFusion));
        engine.register(Arc::new(strategies::TensorFusion));
        engine
    }

    /// Install a strategy under its kind, replacing any previous entry.
    pub fn register(&mut self, strategy: Arc<dyn FusionStrategy>) {
        self.strategies.insert(strategy.kind(), strategy);
    }

    /// Kinds currently registered, sorted.
    pub fn supported(&self) -> Vec<FusionKind> {
        let mut kinds: Vec<FusionKind> = self.strategies.keys().copied().collect();
        kinds.sort();
        kinds
    }

    /// Fuse one embedding set under `params`.
    pub fn fuse(
        &self,
        embeddings: &BTreeMap<ModalityType, Vector>,
        params: &FusionParams,
    ) -> Result<Vector> {
        let strategy = self.strategies.get(&params.kind).ok_or_else(|| {
            Error::InvalidConfig(format!(
                "no fusion strategy registered for '{}'",
                params.kind.as_str()
            ))
        })?;
        strategy.fuse(embeddings, params)
    }

    /// Fuse many embedding sets; output order matches input order.
    pub fn batch_fuse(
        &self,
        batches: &[BTreeMap<ModalityType, Vector>],
        params: &FusionParams,
    ) -> Result<Vec<Vector>> {
        batches.iter().map(|b| self.fuse(b, params)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NoopFusion;

    impl FusionStrategy for NoopFusion {
        fn fuse(
            &self,
            embeddings: &BTreeMap<ModalityType, Vector>,
            _params: &FusionParams,
        ) -> Result<Vector> {
            Ok(embeddings.values().next().cloned().unwrap_or_default())
        }

        fn kind(&self) -> FusionKind {
            FusionKind::Custom
        }
    }

    #[test]
    fn test_reference_strategies_installed() {
        let engine = FusionEngine::new();
        assert_eq!(
            engine.supported(),
            vec![
                FusionKind::Concatenation,
                FusionKind::WeightedAverage,
                FusionKind::Attention,
                FusionKind::Tensor,
            ]
        );
    }

    #[test]
    fn test_custom_kind_unregistered_by_default() {
        let engine = FusionEngine::new();
        let embeddings = BTreeMap::from([(ModalityType::Text, vec![1.0, 2.0])]);
        let params = FusionParams::new(FusionKind::Custom, 2);
        assert!(matches!(
            engine.fuse(&embeddings, &params),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_custom_registration_and_replacement() {
        let mut engine = FusionEngine::new();
        engine.register(Arc::new(NoopFusion));
        let embeddings = BTreeMap::from([(ModalityType::Text, vec![1.0, 2.0])]);
        let params = FusionParams::new(FusionKind::Custom, 2);
        assert_eq!(engine.fuse(&embeddings, &params).unwrap(), vec![1.0, 2.0]);
        // Replacement is allowed, unlike the ANN registry
        engine.register(Arc::new(NoopFusion));
        assert_eq!(engine.supported().len(), 5);
    }

    #[test]
    fn test_batch_fuse_preserves_order() {
        let engine = FusionEngine::new();
        let a = BTreeMap::from([(ModalityType::Text, vec![1.0, 0.0])]);
        let b = BTreeMap::from([(ModalityType::Text, vec![0.0, 1.0])]);
        let params = FusionParams::new(FusionKind::WeightedAverage, 2);
        let fused = engine.batch_fuse(&[a, b], &params).unwrap();
        assert_eq!(fused.len(), 2);
        assert!(fused[0][0] > fused[1][0]);
    }
}
