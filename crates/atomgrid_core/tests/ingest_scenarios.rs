use atomgrid_core::repo::AtomStore;
use atomgrid_core::{
    CancellationToken, ContentHash, Engine, EngineConfig, IngestRequest, Modality, RelationType,
    SourceMetadata, TenantId,
};
use std::collections::{BTreeSet, VecDeque};

fn engine() -> Engine {
    Engine::in_memory(EngineConfig {
        embedding_dim: 32,
        basis_size: 3,
        ..EngineConfig::default()
    })
    .unwrap()
}

fn tenant() -> TenantId {
    TenantId::new("default").unwrap()
}

/// Bytes that are not valid UTF-8 and match no magic, so the binary
/// atomizer handles them.
fn opaque_bytes(len: u32) -> Vec<u8> {
    (0..len).map(|value| (value % 251) as u8 ^ 0x80).collect()
}

/// Hashes reachable from `root` through stored relations.
fn reachable(engine: &Engine, root: ContentHash) -> BTreeSet<ContentHash> {
    let mut seen = BTreeSet::from([root]);
    let mut pending = VecDeque::from([root]);
    while let Some(parent) = pending.pop_front() {
        for relation in engine.atom_store().relations_from(&parent, &tenant()).unwrap() {
            if seen.insert(relation.child_hash) {
                pending.push_back(relation.child_hash);
            }
        }
    }
    seen
}

#[test]
fn ingesting_a_short_text_twice_keeps_one_atom() {
    let engine = engine();
    let source = SourceMetadata::named("note.txt");

    let first = engine.ingest_content(b"ten bytes!", &source, &tenant()).unwrap();
    let second = engine.ingest_content(b"ten bytes!", &source, &tenant()).unwrap();

    assert_eq!(first.atoms_created, 1);
    assert_eq!(first.embeddings_queued, 1);
    assert_eq!(second.atoms_created, 0);
    assert_eq!(second.atoms_deduplicated, 1);
    assert_eq!(second.embeddings_queued, 0);
    assert_eq!(first.root_atom_id, second.root_atom_id);

    let record = engine.get_atom(&first.root_hash, &tenant()).unwrap();
    assert_eq!(record.reference_count, 2);
    assert_eq!(record.modality, Modality::Text);
    assert_eq!(engine.atom_store().count(&tenant()).unwrap(), 1);
}

#[test]
fn oversized_content_is_fingerprinted_with_full_overflow() {
    let engine = engine();
    let content = opaque_bytes(200);

    let report = engine
        .ingest_content(&content, &SourceMetadata::named("blob.bin"), &tenant())
        .unwrap();

    let root = engine.get_atom(&report.root_hash, &tenant()).unwrap();
    assert_eq!(root.atomic_value.len(), 64);
    assert!(root.overflow);
    assert_eq!(root.overflow_payload.as_ref().map(Vec::len), Some(200));
    assert_eq!(root.canonical_payload(), content.as_slice());
}

#[test]
fn every_stored_atom_respects_the_size_bound_and_is_reachable() {
    let engine = engine();
    let text = "The quick brown fox jumps over the lazy dog. ".repeat(12);

    let report = engine
        .ingest_content(text.as_bytes(), &SourceMetadata::named("fox.txt"), &tenant())
        .unwrap();

    let hashes = reachable(&engine, report.root_hash);
    assert_eq!(hashes.len() as u64, engine.atom_store().count(&tenant()).unwrap());
    for hash in &hashes {
        let record = engine.get_atom(hash, &tenant()).unwrap();
        assert!(record.atomic_value.len() <= engine.config().max_atom_size);
    }

    let mut tokens = engine
        .atom_store()
        .relations_from(&report.root_hash, &tenant())
        .unwrap();
    assert!(tokens.iter().all(|relation| relation.relation_type == RelationType::Sequence));
    tokens.sort_by_key(|relation| relation.sequence_index);
    let rebuilt: Vec<u8> = tokens
        .iter()
        .flat_map(|relation| {
            engine
                .get_atom(&relation.child_hash, &tenant())
                .unwrap()
                .canonical_payload()
                .to_vec()
        })
        .collect();
    assert_eq!(rebuilt, text.as_bytes());
}

#[test]
fn empty_content_is_rejected_without_writes() {
    let engine = engine();
    assert!(engine
        .ingest_content(b"", &SourceMetadata::named("empty.txt"), &tenant())
        .is_err());
    assert_eq!(engine.atom_store().count(&tenant()).unwrap(), 0);
}

#[test]
fn batch_failures_do_not_affect_siblings() {
    let engine = engine();
    let requests = vec![
        IngestRequest {
            content: b"alpha beta".to_vec(),
            source: SourceMetadata::named("a.txt"),
            tenant: tenant(),
        },
        IngestRequest {
            content: Vec::new(),
            source: SourceMetadata::named("b.txt"),
            tenant: tenant(),
        },
        IngestRequest {
            content: opaque_bytes(90),
            source: SourceMetadata::named("c.bin"),
            tenant: tenant(),
        },
    ];

    let results = engine.ingest_batch(&requests, &CancellationToken::new());

    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok());
    assert!(results[1].is_err());
    assert!(results[2].is_ok());
}

#[test]
fn cancelled_ingest_still_persists_a_connected_root() {
    let engine = engine();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let text = "word ".repeat(40);

    let report = engine
        .ingest_cancellable(text.as_bytes(), &SourceMetadata::named("w.txt"), &tenant(), &cancel)
        .unwrap();

    assert!(report
        .warnings
        .iter()
        .any(|warning| warning.code == atomgrid_core::WarningCode::Cancelled));
    let hashes = reachable(&engine, report.root_hash);
    assert_eq!(hashes.len() as u64, engine.atom_store().count(&tenant()).unwrap());
}
