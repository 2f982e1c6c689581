//! End-to-end scenarios exercising the full engine surface:
//! insert → train → search → filter → persist → reload.

use modaldb::fusion::{FusionKind, FusionParams};
use modaldb::{
    Database, DistanceMetric, IndexKind, Metadata, MetadataValue, ModalData, ModalityType,
    MultimodalData, MultimodalDatabase, SearchParams, Vector,
};
use std::collections::BTreeMap;
use tempfile::tempdir;

fn meta(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), MetadataValue::from(*v)))
        .collect()
}

#[test]
fn flat_l2_exact_neighbors() {
    let db = Database::with_dimension(4, IndexKind::Flat, DistanceMetric::L2).unwrap();
    assert_eq!(db.add(vec![1.0, 0.0, 0.0, 0.0]).unwrap(), 1);
    assert_eq!(db.add(vec![0.0, 1.0, 0.0, 0.0]).unwrap(), 2);
    assert_eq!(db.add(vec![0.0, 0.0, 1.0, 0.0]).unwrap(), 3);

    let results = db.search_k(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].id, 1);
    assert!(results[0].score.abs() < 1e-6, "self match has distance 0");
    assert!(
        results[1].id == 2 || results[1].id == 3,
        "unit axes tie at sqrt(2)"
    );
    assert!((results[1].score - std::f32::consts::SQRT_2).abs() < 1e-5);
}

#[test]
fn ivf_fallback_then_training_preserves_top1() {
    let mut config = modaldb::DatabaseConfig::with_dimension(2);
    config.index_kind = IndexKind::IvfFlat;
    config.nlist = 2;
    let db = Database::new(config).unwrap();

    let vectors: Vec<Vector> = (0..10).map(|i| vec![i as f32, (10 - i) as f32]).collect();
    for v in &vectors {
        db.add(v.clone()).unwrap();
    }
    assert!(!db.is_trained());

    // Fallback serves exact answers before training
    let before: Vec<u64> = vectors
        .iter()
        .map(|v| db.search_k(v, 1).unwrap()[0].id)
        .collect();
    for (i, &id) in before.iter().enumerate() {
        assert_eq!(id, (i + 1) as u64, "fallback must self-match exactly");
    }

    db.train_index(None).unwrap();
    assert!(db.is_trained());
    assert_eq!(db.stats().staged, 0, "staging buffer drains on training");

    let mut params = SearchParams::with_k(1);
    params.nprobe = 2;
    for (v, &expected) in vectors.iter().zip(before.iter()) {
        let results = db.search(v, &params).unwrap();
        assert_eq!(results[0].id, expected, "recall@1 must stay 1.0 on this set");
    }
}

#[test]
fn metadata_equality_and_filtered_search() {
    let db = Database::with_dimension(2, IndexKind::Flat, DistanceMetric::L2).unwrap();
    db.add_with_metadata(vec![1.0, 0.0], meta(&[("color", "red")])).unwrap();
    db.add_with_metadata(vec![0.9, 0.1], meta(&[("color", "blue")])).unwrap();
    db.add_with_metadata(vec![0.8, 0.2], meta(&[("color", "red")])).unwrap();

    assert_eq!(db.find_by_metadata("color", &"red".into()), vec![1, 3]);

    let results = db
        .filtered_search(&[1.0, 0.0], &SearchParams::with_k(3), |m| {
            m.get("color") == Some(&MetadataValue::from("red"))
        })
        .unwrap();
    let ids: Vec<u64> = results.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![1, 3]);
    for r in &results {
        assert_eq!(r.metadata["color"], MetadataValue::from("red"));
    }
}

#[test]
fn multimodal_weighted_average_self_match() {
    let mut config = modaldb::DatabaseConfig::with_dimension(256);
    config.index_kind = IndexKind::Flat;
    let db = MultimodalDatabase::new(
        config,
        FusionParams::new(FusionKind::WeightedAverage, 256)
            .with_weight(ModalityType::Text, 0.7)
            .with_weight(ModalityType::Image, 0.3),
    )
    .unwrap();

    let text: Vector = (0..128).map(|i| ((i * 3) as f32 / 128.0).sin()).collect();
    let image: Vector = (0..128).map(|i| ((i * 5) as f32 / 128.0).cos()).collect();

    let item = MultimodalData::new()
        .with_modality(ModalityType::Text, ModalData::from_embedding(text.clone()))
        .with_modality(ModalityType::Image, ModalData::from_embedding(image.clone()));
    let id = db.add_multimodal(&item).unwrap();

    let query = BTreeMap::from([(ModalityType::Text, text), (ModalityType::Image, image)]);
    let results = db.search_multimodal(&query, &SearchParams::with_k(1)).unwrap();
    assert_eq!(results[0].id, id);
    assert!(
        results[0].score.abs() < 1e-3,
        "identical modalities and weights must fuse to the same vector, got distance {}",
        results[0].score
    );
}

#[test]
fn save_load_identical_rankings() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("snapshot");

    let db = Database::with_dimension(3, IndexKind::Flat, DistanceMetric::Cosine).unwrap();
    for i in 0..20 {
        db.add_with_metadata(
            vec![(i % 7) as f32 + 0.5, (i % 3) as f32, (i % 5) as f32],
            meta(&[("i", &i.to_string())]),
        )
        .unwrap();
    }
    let queries: Vec<Vector> = (0..5)
        .map(|q| vec![q as f32 + 0.25, 1.0, (q % 4) as f32])
        .collect();
    let before: Vec<_> = queries.iter().map(|q| db.search_k(q, 10).unwrap()).collect();

    db.save(&base).unwrap();
    let restored = Database::load(&base).unwrap();
    assert_eq!(restored.size(), db.size());

    for (query, expected) in queries.iter().zip(before.iter()) {
        let after = restored.search_k(query, 10).unwrap();
        assert_eq!(expected.len(), after.len());
        for (b, a) in expected.iter().zip(after.iter()) {
            assert_eq!(b.id, a.id, "ranking changed across save/load");
            assert!((b.score - a.score).abs() < 1e-6);
        }
    }
}

#[test]
fn hybrid_weight_inequality_decides_ranking() {
    let db = Database::with_dimension(2, IndexKind::Flat, DistanceMetric::L2).unwrap();
    // id 1: best vector match, no text hit; id 2: worst vector, perfect text hit
    db.add_with_metadata(vec![1.0, 0.0], meta(&[("tag", "plain")])).unwrap();
    db.add_with_metadata(vec![0.0, 1.0], meta(&[("tag", "needle")])).unwrap();

    let results = db
        .query_engine()
        .hybrid_search(&[1.0, 0.0], &SearchParams::with_k(2), "needle", 0.7, 0.3)
        .unwrap();
    // 0.7·1.0 > 0.7·0.0 + 0.3 — the strong ANN candidate outranks the text hit
    assert_eq!(results[0].id, 1);
    assert_eq!(results[1].id, 2);

    // With the weights flipped the text match dominates
    let flipped = db
        .query_engine()
        .hybrid_search(&[1.0, 0.0], &SearchParams::with_k(2), "needle", 0.3, 0.7)
        .unwrap();
    assert_eq!(flipped[0].id, 2);
}

#[test]
fn ids_strictly_increase_across_removals() {
    let db = Database::with_dimension(2, IndexKind::Flat, DistanceMetric::L2).unwrap();
    let mut last = 0;
    for i in 0..20 {
        let id = db.add(vec![i as f32, 0.0]).unwrap();
        assert!(id > last, "ids must be strictly increasing");
        last = id;
        if i % 3 == 0 {
            db.remove(id).unwrap();
        }
    }
    // Removal never recycles an ID
    let id = db.add(vec![99.0, 0.0]).unwrap();
    assert!(id > last);
}

#[test]
fn update_reflects_in_both_stores() {
    let db = Database::with_dimension(2, IndexKind::Flat, DistanceMetric::L2).unwrap();
    let id = db
        .add_with_metadata(vec![1.0, 0.0], meta(&[("state", "old")]))
        .unwrap();
    db.update(id, Some(vec![0.0, 1.0]), Some(meta(&[("state", "new")])))
        .unwrap();

    assert_eq!(db.get_metadata(id).unwrap()["state"], MetadataValue::from("new"));
    assert_eq!(db.find_by_metadata("state", &"new".into()), vec![id]);
    assert!(db.find_by_metadata("state", &"old".into()).is_empty());

    let results = db.search_k(&[0.0, 1.0], 1).unwrap();
    assert_eq!(results[0].id, id);
    assert!(results[0].score.abs() < 1e-6);
}

#[test]
fn range_search_returns_exactly_the_in_radius_set() {
    let db = Database::with_dimension(2, IndexKind::Flat, DistanceMetric::L2).unwrap();
    for i in 0..10 {
        db.add(vec![i as f32, 0.0]).unwrap();
    }
    let mut params = SearchParams::default();
    params.radius = 2.5;
    let results = db.search(&[0.0, 0.0], &params).unwrap();
    let ids: Vec<u64> = results.iter().map(|r| r.id).collect();
    // Distances 0, 1, 2 qualify; 3 and beyond do not
    assert_eq!(ids, vec![1, 2, 3]);
    for pair in results.windows(2) {
        assert!(pair[0].score <= pair[1].score, "ascending by distance");
    }
}

#[test]
fn hnsw_recall_on_uniform_data() {
    let db = Database::with_dimension(8, IndexKind::Hnsw, DistanceMetric::L2).unwrap();
    // 1009 is prime and larger than the set size, so all vectors are distinct
    let vectors: Vec<Vector> = (0..300)
        .map(|i| (0..8).map(|j| ((i * 13 + j * 29) % 1009) as f32 / 1009.0).collect())
        .collect();
    let ids = db.add_batch(vectors.clone(), None).unwrap();

    let mut found = 0;
    for (v, &id) in vectors.iter().zip(ids.iter()) {
        if db.search_k(v, 1).unwrap().first().map(|r| r.id) == Some(id) {
            found += 1;
        }
    }
    assert!(
        found as f32 / vectors.len() as f32 >= 0.95,
        "recall@1 {found}/300 below the 0.95 bar"
    );
}

#[test]
fn inner_product_self_score_is_squared_norm() {
    let db = Database::with_dimension(3, IndexKind::Flat, DistanceMetric::InnerProduct).unwrap();
    let id = db.add(vec![1.0, 2.0, 3.0]).unwrap();
    let results = db.search_k(&[1.0, 2.0, 3.0], 1).unwrap();
    assert_eq!(results[0].id, id);
    assert!((results[0].score - 14.0).abs() < 1e-5, "self score is ||v||²");
}

#[test]
fn ivf_pq_store_roundtrip() {
    let dir = tempdir().unwrap();
    let base = dir.path().join("pq");

    let mut config = modaldb::DatabaseConfig::with_dimension(8);
    config.index_kind = IndexKind::IvfPq;
    config.nlist = 2;
    config.pq_m = 2;
    let db = Database::new(config).unwrap();
    let vectors: Vec<Vector> = (0..40)
        .map(|i| (0..8).map(|j| ((i * 7 + j * 3) % 1009) as f32 / 1009.0).collect())
        .collect();
    db.add_batch(vectors.clone(), None).unwrap();
    db.train_index(None).unwrap();

    let mut params = SearchParams::with_k(3);
    params.nprobe = 2;
    let before = db.search(&vectors[5], &params).unwrap();
    assert_eq!(before[0].id, 6, "exact rerank pins the self match");

    db.save(&base).unwrap();
    let restored = Database::load(&base).unwrap();
    assert!(restored.is_trained());
    let after = restored.search(&vectors[5], &params).unwrap();
    assert_eq!(before.len(), after.len());
    for (b, a) in before.iter().zip(after.iter()) {
        assert_eq!(b.id, a.id);
        assert!((b.score - a.score).abs() < 1e-6);
    }
}
