use atomgrid_core::atomizer::write_ustar;
use atomgrid_core::{
    AtomizeLimits, AtomizerRegistry, CancellationToken, Engine, EngineConfig, Modality,
    SourceMetadata, TenantId, WarningCode,
};

/// Archive whose single entry is the next archive, `levels` archives deep,
/// with a text leaf inside the innermost one.
fn nested_archive(levels: usize) -> Vec<u8> {
    let mut inner = write_ustar(&[("leaf.txt", b"deepest leaf text".as_slice())]);
    for level in (0..levels - 1).rev() {
        let name = format!("level{:02}.tar", level + 1);
        inner = write_ustar(&[(name.as_str(), inner.as_slice())]);
    }
    inner
}

#[test]
fn nesting_past_the_limit_warns_and_stops_at_the_limit() {
    let registry = AtomizerRegistry::with_defaults();
    let limits = AtomizeLimits {
        max_depth: 10,
        ..AtomizeLimits::default()
    };
    let content = nested_archive(15);

    let output = registry
        .atomize(
            &content,
            &SourceMetadata::named("outer.tar"),
            limits,
            &CancellationToken::new(),
        )
        .unwrap();

    let archives = output
        .atoms()
        .iter()
        .filter(|atom| atom.modality == Modality::Archive)
        .count();
    assert_eq!(archives, 11);
    assert!(output.has_warning(WarningCode::RecursionLimitExceeded));
    assert!(!output
        .atoms()
        .iter()
        .any(|atom| atom.canonical_payload() == b"deepest leaf text".as_slice()));
}

#[test]
fn nesting_within_the_limit_reaches_the_leaf() {
    let registry = AtomizerRegistry::with_defaults();
    let content = nested_archive(5);

    let output = registry
        .atomize(
            &content,
            &SourceMetadata::named("outer.tar"),
            AtomizeLimits::default(),
            &CancellationToken::new(),
        )
        .unwrap();

    assert!(!output.has_warning(WarningCode::RecursionLimitExceeded));
    assert!(output
        .atoms()
        .iter()
        .any(|atom| atom.canonical_payload() == b"deepest leaf text".as_slice()));
}

#[test]
fn engine_ingest_reports_the_recursion_warning() {
    let engine = Engine::in_memory(EngineConfig {
        embedding_dim: 16,
        basis_size: 2,
        max_recursion_depth: 10,
        ..EngineConfig::default()
    })
    .unwrap();
    let tenant = TenantId::new("default").unwrap();

    let report = engine
        .ingest_content(&nested_archive(15), &SourceMetadata::named("outer.tar"), &tenant)
        .unwrap();

    assert!(report
        .warnings
        .iter()
        .any(|warning| warning.code == WarningCode::RecursionLimitExceeded));
    let root = engine.get_atom(&report.root_hash, &tenant).unwrap();
    assert_eq!(root.modality, Modality::Archive);
}
