//! Multimodal layer: modality types, processors, and the fusion facade.
//!
//! [`MultimodalDatabase`] accepts one embedding per modality (or raw
//! bytes run through a registered [`ModalityProcessor`]), fuses them into
//! a single vector under the current [`FusionParams`], and forwards the
//! result to an underlying [`Database`]. Fusion parameters can change at
//! runtime; previously stored vectors are not re-fused, so mixing
//! strategies within one store is a caller concern.

use crate::config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::fusion::{FusionEngine, FusionKind, FusionParams, FusionStrategy};
use crate::types::{DatabaseConfig, Metadata, QueryResult, SearchParams, Vector, VectorId};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// A sensory/data channel whose embeddings may have their own dimension.
///
/// The derive order fixes the stable sort order used by fusion
/// (text < image < audio < video < custom).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ModalityType {
    /// Natural-language text.
    Text,
    /// Still images.
    Image,
    /// Audio.
    Audio,
    /// Video.
    Video,
    /// Caller-defined channel, discriminated by tag.
    Custom(u16),
}

impl ModalityType {
    /// Stable tag used in prefixed metadata keys.
    pub fn tag(&self) -> String {
        match self {
            ModalityType::Text => "text".into(),
            ModalityType::Image => "image".into(),
            ModalityType::Audio => "audio".into(),
            ModalityType::Video => "video".into(),
            ModalityType::Custom(k) => format!("custom-{k}"),
        }
    }
}

impl fmt::Display for ModalityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// One modality's payload: an embedding, optional raw bytes, and
/// modality-scoped metadata.
#[derive(Debug, Clone, Default)]
pub struct ModalData {
    /// The embedding; may be empty when `raw` plus a registered processor
    /// will produce it.
    pub embedding: Vector,
    /// Raw payload bytes, kept optional.
    pub raw: Option<Vec<u8>>,
    /// Modality-scoped metadata, prefixed on insertion.
    pub metadata: Metadata,
}

impl ModalData {
    /// Payload from a precomputed embedding.
    pub fn from_embedding(embedding: Vector) -> Self {
        Self {
            embedding,
            ..Self::default()
        }
    }

    /// Payload from raw bytes, to be embedded by a registered processor.
    pub fn from_raw(raw: Vec<u8>) -> Self {
        Self {
            raw: Some(raw),
            ..Self::default()
        }
    }
}

/// One item's worth of modalities plus global metadata.
#[derive(Debug, Clone, Default)]
pub struct MultimodalData {
    /// Per-modality payloads.
    pub modalities: BTreeMap<ModalityType, ModalData>,
    /// Item-level metadata; wins over prefixed modality keys on collision.
    pub metadata: Metadata,
}

impl MultimodalData {
    /// Empty item.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a modality payload, builder style.
    pub fn with_modality(mut self, modality: ModalityType, data: ModalData) -> Self {
        self.modalities.insert(modality, data);
        self
    }

    /// Attach global metadata, builder style.
    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Turns raw modality bytes into an embedding.
pub trait ModalityProcessor: Send + Sync {
    /// The modality this processor serves.
    fn modality(&self) -> ModalityType;

    /// Produce an embedding from raw bytes.
    fn embed(&self, raw: &[u8]) -> Result<Vector>;

    /// Cheap structural validation of the raw payload.
    fn validate(&self, raw: &[u8]) -> bool {
        !raw.is_empty()
    }
}

/// Registry of modality processors; registering a modality twice replaces
/// the previous processor.
#[derive(Default)]
pub struct ModalityManager {
    processors: HashMap<ModalityType, Arc<dyn ModalityProcessor>>,
}

impl ModalityManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a processor under its modality.
    pub fn register(&mut self, processor: Arc<dyn ModalityProcessor>) {
        self.processors.insert(processor.modality(), processor);
    }

    /// Embed raw bytes for a modality.
    pub fn process(&self, modality: ModalityType, raw: &[u8]) -> Result<Vector> {
        let processor = self.processors.get(&modality).ok_or_else(|| {
            Error::InvalidConfig(format!("no processor registered for modality '{modality}'"))
        })?;
        if !processor.validate(raw) {
            return Err(Error::InputSizeMismatch(format!(
                "raw payload rejected by the '{modality}' processor"
            )));
        }
        processor.embed(raw)
    }

    /// Whether a processor exists for the modality.
    pub fn supports(&self, modality: ModalityType) -> bool {
        self.processors.contains_key(&modality)
    }

    /// Registered modalities, sorted.
    pub fn supported(&self) -> Vec<ModalityType> {
        let mut modalities: Vec<ModalityType> = self.processors.keys().copied().collect();
        modalities.sort();
        modalities
    }
}

/// Multimodal facade over a [`Database`].
pub struct MultimodalDatabase {
    db: Database,
    manager: RwLock<ModalityManager>,
    fusion: RwLock<FusionEngine>,
    params: RwLock<FusionParams>,
}

impl MultimodalDatabase {
    /// Open a multimodal database over a fresh store.
    pub fn new(config: DatabaseConfig, params: FusionParams) -> Result<Self> {
        Ok(Self {
            db: Database::new(config)?,
            manager: RwLock::new(ModalityManager::new()),
            fusion: RwLock::new(FusionEngine::new()),
            params: RwLock::new(params),
        })
    }

    /// Text+image preset: weighted average 0.6/0.4, fused to the store
    /// dimension.
    pub fn text_image(config: DatabaseConfig) -> Result<Self> {
        let params = FusionParams::new(FusionKind::WeightedAverage, config.dimension)
            .with_weight(ModalityType::Text, 0.6)
            .with_weight(ModalityType::Image, 0.4);
        Self::new(config, params)
    }

    /// Audio+video preset: attention fusion to the store dimension.
    pub fn audio_visual(config: DatabaseConfig) -> Result<Self> {
        let params = FusionParams::new(FusionKind::Attention, config.dimension)
            .with_weight(ModalityType::Audio, 0.5)
            .with_weight(ModalityType::Video, 0.5);
        Self::new(config, params)
    }

    /// Resolve each modality to an embedding: the supplied one, or the
    /// registered processor applied to the raw bytes.
    fn resolve_embeddings(&self, data: &MultimodalData) -> Result<BTreeMap<ModalityType, Vector>> {
        if data.modalities.is_empty() {
            return Err(Error::InputSizeMismatch(
                "multimodal data must carry at least one modality".into(),
            ));
        }
        if data.modalities.len() > config::MAX_MODALITIES_PER_ITEM {
            return Err(Error::InputSizeMismatch(format!(
                "too many modalities: {} (max {})",
                data.modalities.len(),
                config::MAX_MODALITIES_PER_ITEM
            )));
        }
        let manager = self.manager.read();
        let mut embeddings = BTreeMap::new();
        for (&modality, modal) in &data.modalities {
            let embedding = if !modal.embedding.is_empty() {
                modal.embedding.clone()
            } else if let Some(ref raw) = modal.raw {
                manager.process(modality, raw)?
            } else {
                return Err(Error::InputSizeMismatch(format!(
                    "modality '{modality}' carries neither an embedding nor raw data"
                )));
            };
            embeddings.insert(modality, embedding);
        }
        Ok(embeddings)
    }

    /// Merge per-modality metadata (keys prefixed `modality.<tag>.`) with
    /// global metadata. Global wins on collision; the collision is
    /// reported on the log channel.
    fn merge_metadata(data: &MultimodalData) -> Metadata {
        let mut merged = Metadata::new();
        for (modality, modal) in &data.modalities {
            let prefix = format!("modality.{}.", modality.tag());
            for (key, value) in &modal.metadata {
                merged.insert(format!("{prefix}{key}"), value.clone());
            }
        }
        for (key, value) in &data.metadata {
            if merged.contains_key(key) {
                tracing::warn!(key, "metadata key collision; global value wins");
            }
            merged.insert(key.clone(), value.clone());
        }
        merged
    }

    /// Fuse the item's modalities and insert the result. Returns the
    /// assigned ID.
    pub fn add_multimodal(&self, data: &MultimodalData) -> Result<VectorId> {
        let embeddings = self.resolve_embeddings(data)?;
        let fused = {
            let params = self.params.read();
            self.fusion.read().fuse(&embeddings, &params)?
        };
        let metadata = Self::merge_metadata(data);
        self.db.add_with_metadata(fused, metadata)
    }

    /// Fuse the query modalities under the current parameters and search
    /// the underlying store.
    pub fn search_multimodal(
        &self,
        query: &BTreeMap<ModalityType, Vector>,
        params: &SearchParams,
    ) -> Result<Vec<QueryResult>> {
        let fused = {
            let fusion_params = self.params.read();
            self.fusion.read().fuse(query, &fusion_params)?
        };
        self.db.search(&fused, params)
    }

    /// Swap the fusion parameters. Non-retroactive: vectors already
    /// stored keep their original fusion, so mixing strategies within one
    /// store degrades recall.
    pub fn set_fusion_params(&self, params: FusionParams) {
        *self.params.write() = params;
    }

    /// Copy of the current fusion parameters.
    pub fn fusion_params(&self) -> FusionParams {
        self.params.read().clone()
    }

    /// Install (or replace) a fusion strategy.
    pub fn register_fusion_strategy(&self, strategy: Arc<dyn FusionStrategy>) {
        self.fusion.write().register(strategy);
    }

    /// Install (or replace) a modality processor.
    pub fn register_modality_processor(&self, processor: Arc<dyn ModalityProcessor>) {
        self.manager.write().register(processor);
    }

    /// Modalities with registered processors, sorted.
    pub fn supported_modalities(&self) -> Vec<ModalityType> {
        self.manager.read().supported()
    }

    /// Fusion kinds currently registered, sorted.
    pub fn supported_fusion_kinds(&self) -> Vec<FusionKind> {
        self.fusion.read().supported()
    }

    /// The wrapped single-vector database.
    pub fn database(&self) -> &Database {
        &self.db
    }
}
