//! Core of the atomgrid content atomization and spatial semantic search engine.
//! This crate is the single source of truth for dedup, projection and
//! search invariants.

pub mod atomizer;
pub mod cancel;
pub mod config;
pub mod curve;
pub mod db;
pub mod embedding;
pub mod hash;
pub mod index;
pub mod logging;
pub mod model;
pub mod repo;
pub mod search;
pub mod service;
pub mod vector;

pub use atomizer::{AtomizeError, AtomizeLimits, Atomizer, AtomizerRegistry, SourceMetadata};
pub use cancel::CancellationToken;
pub use config::{ConfigError, EngineConfig};
pub use embedding::{EmbedRequest, EmbeddingProvider, FeatureHashEmbedder};
pub use hash::{fingerprint, hash, ContentHash};
pub use logging::{default_log_level, init_logging, logging_status, LogLevel, LoggingError};
pub use model::atom::{AtomDraft, AtomId, AtomRecord, Modality};
pub use model::relation::{AtomRelation, RelationType, SpatialMetadata};
pub use model::tenant::TenantId;
pub use model::validation::ValidationError;
pub use model::warning::{IngestWarning, WarningCode};
pub use search::{SearchHit, SearchOutcome};
pub use service::{Engine, EngineError, EngineResult, IngestReport, IngestRequest};

/// Minimal health-check API.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::{core_version, ping};

    #[test]
    fn ping_returns_pong() {
        assert_eq!(ping(), "pong");
    }

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
