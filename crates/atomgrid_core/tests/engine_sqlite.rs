use atomgrid_core::repo::AtomStore;
use atomgrid_core::{
    CancellationToken, Engine, EngineConfig, EngineError, FeatureHashEmbedder, SourceMetadata,
    TenantId,
};
use std::path::Path;
use std::sync::Arc;

const TEXTS: [&str; 6] = [
    "red apples in a basket",
    "green apples on a tree",
    "blue sky over the sea",
    "grey sky before rain",
    "deep ocean currents",
    "quiet mountain lake",
];

fn config() -> EngineConfig {
    EngineConfig {
        embedding_dim: 64,
        basis_size: 3,
        precision_bits: 12,
        ..EngineConfig::default()
    }
}

fn tenant() -> TenantId {
    TenantId::new("default").unwrap()
}

fn seeded_engine(path: &Path, embedder: &Arc<FeatureHashEmbedder>) -> Engine {
    let engine = Engine::open_sqlite(path, config()).unwrap();
    for text in TEXTS {
        engine
            .ingest_content(text.as_bytes(), &SourceMetadata::named("doc.txt"), &tenant())
            .unwrap();
    }
    let drained = engine
        .drain_embeddings(embedder.clone(), &CancellationToken::new())
        .unwrap();
    assert_eq!(drained.embedded, TEXTS.len());
    assert_eq!(drained.failed, 0);
    engine
}

#[test]
fn search_before_bootstrap_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(FeatureHashEmbedder::new(64));
    let engine = seeded_engine(&dir.path().join("grid.db"), &embedder);

    let err = engine
        .search(&embedder.embed_text("apples"), 3, &tenant())
        .unwrap_err();
    assert!(matches!(err, EngineError::Search(_)));
}

#[test]
fn ingest_drain_bootstrap_search_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = Arc::new(FeatureHashEmbedder::new(64));
    let engine = seeded_engine(&dir.path().join("grid.db"), &embedder);

    assert_eq!(engine.bootstrap_from_store(TEXTS.len()).unwrap(), 1);
    let expected = engine
        .get_atom(&atomgrid_core::hash(TEXTS[0].as_bytes()), &tenant())
        .unwrap();

    let hits = engine
        .search(&embedder.embed_text(TEXTS[0]), 3, &tenant())
        .unwrap();
    assert_eq!(hits.len(), 3);
    assert_eq!(hits[0].atom_id, expected.id);
    assert!(hits[0].score > 0.99);
}

#[test]
fn reopening_restores_the_basis_and_index() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.db");
    let embedder = Arc::new(FeatureHashEmbedder::new(64));
    {
        let engine = seeded_engine(&path, &embedder);
        engine.bootstrap_from_store(TEXTS.len()).unwrap();
    }

    let reopened = Engine::open_sqlite(&path, config()).unwrap();
    assert_eq!(reopened.basis_version(), Some(1));
    let generation = reopened.current_generation().unwrap();
    assert_eq!(generation.index().len().unwrap(), TEXTS.len());

    reopened
        .ingest_content(b"red apples and pears", &SourceMetadata::named("new.txt"), &tenant())
        .unwrap();
    let drained = reopened
        .drain_embeddings(embedder.clone(), &CancellationToken::new())
        .unwrap();
    assert_eq!(drained.embedded, 1);
    assert_eq!(generation.index().len().unwrap(), TEXTS.len() + 1);

    let newest = reopened
        .get_atom(&atomgrid_core::hash(b"red apples and pears"), &tenant())
        .unwrap();
    let hits = reopened
        .search(&embedder.embed_text("red apples and pears"), 1, &tenant())
        .unwrap();
    assert_eq!(hits[0].atom_id, newest.id);
}

#[test]
fn rebootstrap_advances_the_version_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.db");
    let embedder = Arc::new(FeatureHashEmbedder::new(64));
    {
        let engine = seeded_engine(&path, &embedder);
        assert_eq!(engine.bootstrap_from_store(TEXTS.len()).unwrap(), 1);
        assert_eq!(engine.bootstrap_from_store(TEXTS.len()).unwrap(), 2);
    }

    let reopened = Engine::open_sqlite(&path, config()).unwrap();
    assert_eq!(reopened.basis_version(), Some(2));
    assert_eq!(
        reopened.current_generation().unwrap().index().len().unwrap(),
        TEXTS.len()
    );
}

#[test]
fn unembedded_atoms_are_queued_again_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("grid.db");
    let text = b"red apples in a basket";
    {
        let engine = Engine::open_sqlite(&path, config()).unwrap();
        let report = engine
            .ingest_content(text, &SourceMetadata::named("doc.txt"), &tenant())
            .unwrap();
        assert_eq!(report.embeddings_queued, 1);
    }

    let reopened = Engine::open_sqlite(&path, config()).unwrap();
    assert_eq!(reopened.queue().len(), 1);
    let again = reopened
        .ingest_content(text, &SourceMetadata::named("doc.txt"), &tenant())
        .unwrap();
    assert_eq!(again.embeddings_queued, 0);

    let embedder = Arc::new(FeatureHashEmbedder::new(64));
    let drained = reopened
        .drain_embeddings(embedder, &CancellationToken::new())
        .unwrap();
    assert_eq!(drained.embedded, 1);
    assert!(reopened.atom_store().pending_embeddings(10).unwrap().is_empty());

    drop(reopened);
    let third = Engine::open_sqlite(&path, config()).unwrap();
    assert!(third.queue().is_empty());
}
