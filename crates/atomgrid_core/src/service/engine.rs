//! Engine facade wiring stores, atomizers, embedding and search together.
//!
//! # Responsibility
//! - Expose `ingest_content`, `search` and `get_atom` over one set of stores.
//! - Own the active index generation and rebuild it on re-bootstrap.
//!
//! # Invariants
//! - Basis versions are strictly increasing; a re-bootstrap saves version
//!   `n + 1` before the new generation becomes visible.
//! - Queries that already hold the previous generation finish against it.
//! - Opening an engine queues every embeddable atom that has no stored
//!   embedding, so the embedding backlog survives restarts.
//!
//! # See also
//! - crate::service::ingest
//! - crate::search::engine

use crate::atomizer::{AtomizerRegistry, SourceMetadata};
use crate::cancel::CancellationToken;
use crate::config::{ConfigError, EngineConfig};
use crate::curve::{CurveError, HilbertEncoder};
use crate::db::{
    open_db, open_db_in_memory, open_db_reader, share, DbError, RetryPolicy, SharedConnection,
};
use crate::embedding::{
    DrainReport, EmbedRequest, EmbeddingError, EmbeddingProvider, EmbeddingQueue, EmbeddingWorker,
};
use crate::hash::ContentHash;
use crate::index::{
    BTreeSpatialIndex, GenerationCell, IndexError, IndexGeneration, SpatialIndex,
    SqliteSpatialIndex,
};
use crate::model::atom::{AtomId, AtomRecord};
use crate::model::tenant::TenantId;
use crate::model::validation::ValidationError;
use crate::repo::{
    AtomStore, BasisStore, EmbeddingStore, MemoryAtomStore, MemoryBasisStore,
    MemoryEmbeddingStore, SqliteAtomStore, SqliteBasisStore, SqliteEmbeddingStore, StoreError,
};
use crate::search::{SearchEngine, SearchError, SearchHit, SearchOutcome};
use crate::service::ingest::{IngestError, IngestReport, IngestRequest, IngestService};
use crate::vector::{BasisError, EmbeddingProjector, LandmarkBasis};
use log::{info, warn};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug)]
pub enum EngineError {
    Config(ConfigError),
    Curve(CurveError),
    Db(DbError),
    Validation(ValidationError),
    Basis(BasisError),
    Store(StoreError),
    Index(IndexError),
    Ingest(IngestError),
    Embedding(EmbeddingError),
    Search(SearchError),
    AtomNotFound { hash: ContentHash, tenant: TenantId },
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "{err}"),
            Self::Curve(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Basis(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Index(err) => write!(f, "{err}"),
            Self::Ingest(err) => write!(f, "{err}"),
            Self::Embedding(err) => write!(f, "{err}"),
            Self::Search(err) => write!(f, "{err}"),
            Self::AtomNotFound { hash, tenant } => {
                write!(f, "atom {hash} not found for tenant {tenant}")
            }
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Curve(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::Validation(err) => Some(err),
            Self::Basis(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Index(err) => Some(err),
            Self::Ingest(err) => Some(err),
            Self::Embedding(err) => Some(err),
            Self::Search(err) => Some(err),
            Self::AtomNotFound { .. } => None,
        }
    }
}

macro_rules! engine_error_from {
    ($($source:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$source> for EngineError {
                fn from(value: $source) -> Self {
                    Self::$variant(value)
                }
            }
        )*
    };
}

engine_error_from!(
    ConfigError => Config,
    CurveError => Curve,
    DbError => Db,
    ValidationError => Validation,
    BasisError => Basis,
    StoreError => Store,
    IndexError => Index,
    IngestError => Ingest,
    EmbeddingError => Embedding,
    SearchError => Search,
);

/// Where spatial entries of new generations live.
enum IndexBackend {
    Memory,
    Sqlite {
        conn: SharedConnection,
        reader: Option<SharedConnection>,
        retry: RetryPolicy,
    },
}

impl IndexBackend {
    fn build(
        &self,
        encoder: Arc<HilbertEncoder>,
        basis_version: u32,
        config: &EngineConfig,
    ) -> Arc<dyn SpatialIndex> {
        match self {
            Self::Memory => Arc::new(BTreeSpatialIndex::new(
                encoder,
                basis_version,
                config.max_key_ranges,
                config.full_scan_clamp_ratio,
            )),
            Self::Sqlite {
                conn,
                reader,
                retry,
            } => {
                let index = SqliteSpatialIndex::new(
                    conn.clone(),
                    encoder,
                    basis_version,
                    config.max_key_ranges,
                    config.full_scan_clamp_ratio,
                )
                .with_retry(*retry);
                match reader {
                    Some(reader) => Arc::new(index.with_reader(reader.clone())),
                    None => Arc::new(index),
                }
            }
        }
    }
}

pub struct Engine {
    config: EngineConfig,
    atoms: Arc<dyn AtomStore>,
    embeddings: Arc<dyn EmbeddingStore>,
    bases: Arc<dyn BasisStore>,
    backend: IndexBackend,
    generations: Arc<GenerationCell>,
    queue: Arc<EmbeddingQueue>,
    ingest: IngestService,
    search: SearchEngine,
    bootstrap_lock: Mutex<()>,
}

impl Engine {
    /// Engine over in-memory stores and a B-tree index.
    pub fn in_memory(config: EngineConfig) -> EngineResult<Self> {
        let embeddings = Arc::new(MemoryEmbeddingStore::new());
        Self::assemble(
            config,
            Arc::new(MemoryAtomStore::new().with_embeddings(embeddings.clone())),
            embeddings,
            Arc::new(MemoryBasisStore::new()),
            IndexBackend::Memory,
        )
    }

    /// Engine over a SQLite file; the latest saved basis is reloaded.
    ///
    /// Spatial queries get a second, read-only connection to the file.
    pub fn open_sqlite(path: impl AsRef<Path>, config: EngineConfig) -> EngineResult<Self> {
        let path = path.as_ref();
        let conn = share(open_db(path)?);
        let reader = share(open_db_reader(path)?);
        Self::connect(conn, Some(reader), config)
    }

    pub fn sqlite_in_memory(config: EngineConfig) -> EngineResult<Self> {
        Self::with_connection(share(open_db_in_memory()?), config)
    }

    /// Engine over an already migrated connection.
    pub fn with_connection(conn: SharedConnection, config: EngineConfig) -> EngineResult<Self> {
        Self::connect(conn, None, config)
    }

    fn connect(
        conn: SharedConnection,
        reader: Option<SharedConnection>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let retry = config.retry_policy();
        Self::assemble(
            config,
            Arc::new(SqliteAtomStore::try_new(conn.clone())?.with_retry(retry)),
            Arc::new(SqliteEmbeddingStore::new(conn.clone()).with_retry(retry)),
            Arc::new(SqliteBasisStore::new(conn.clone()).with_retry(retry)),
            IndexBackend::Sqlite {
                conn,
                reader,
                retry,
            },
        )
    }

    fn assemble(
        config: EngineConfig,
        atoms: Arc<dyn AtomStore>,
        embeddings: Arc<dyn EmbeddingStore>,
        bases: Arc<dyn BasisStore>,
        backend: IndexBackend,
    ) -> EngineResult<Self> {
        config.validate()?;
        let generations = Arc::new(GenerationCell::new());
        let queue = Arc::new(EmbeddingQueue::new());
        let ingest = IngestService::new(
            Arc::new(AtomizerRegistry::with_defaults()),
            atoms.clone(),
            queue.clone(),
            config.atomize_limits(),
        )
        .with_worker_threads(config.worker_threads);
        let search = SearchEngine::new(generations.clone(), embeddings.clone(), config.search_params());

        let engine = Self {
            config,
            atoms,
            embeddings,
            bases,
            backend,
            generations,
            queue,
            ingest,
            search,
            bootstrap_lock: Mutex::new(()),
        };
        let basis_version = match engine.bases.load_latest_basis()? {
            Some(basis) => {
                let version = basis.version();
                let generation = engine.generation_for(basis)?;
                engine.generations.replace(generation);
                version.to_string()
            }
            None => "none".to_string(),
        };
        let backlog = engine.restore_pending_embeddings()?;
        info!("event=core_init module=service status=ok basis_version={basis_version} backlog={backlog}");
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn atom_store(&self) -> &Arc<dyn AtomStore> {
        &self.atoms
    }

    pub fn embedding_store(&self) -> &Arc<dyn EmbeddingStore> {
        &self.embeddings
    }

    pub fn queue(&self) -> &Arc<EmbeddingQueue> {
        &self.queue
    }

    pub fn current_generation(&self) -> Option<Arc<IndexGeneration>> {
        self.generations.current()
    }

    pub fn basis_version(&self) -> Option<u32> {
        self.generations.current().map(|generation| generation.basis_version())
    }

    pub fn ingest_content(
        &self,
        content: &[u8],
        source: &SourceMetadata,
        tenant: &TenantId,
    ) -> EngineResult<IngestReport> {
        self.ingest_cancellable(content, source, tenant, &CancellationToken::new())
    }

    pub fn ingest_cancellable(
        &self,
        content: &[u8],
        source: &SourceMetadata,
        tenant: &TenantId,
        cancel: &CancellationToken,
    ) -> EngineResult<IngestReport> {
        Ok(self.ingest.ingest_content(content, source, tenant, cancel)?)
    }

    pub fn ingest_batch(
        &self,
        items: &[IngestRequest],
        cancel: &CancellationToken,
    ) -> Vec<Result<IngestReport, IngestError>> {
        self.ingest.ingest_batch(items, cancel)
    }

    /// Embeds queued atoms with `provider` and indexes them in the current
    /// generation, if any.
    pub fn drain_embeddings(
        &self,
        provider: Arc<dyn EmbeddingProvider>,
        cancel: &CancellationToken,
    ) -> EngineResult<DrainReport> {
        if provider.dimension() != self.config.embedding_dim {
            return Err(ValidationError::DimensionMismatch {
                expected: self.config.embedding_dim,
                actual: provider.dimension(),
            }
            .into());
        }
        let worker = EmbeddingWorker::new(
            provider,
            self.queue.clone(),
            self.atoms.clone(),
            self.embeddings.clone(),
            self.generations.clone(),
            self.config.worker_settings(),
        );
        Ok(worker.drain(cancel))
    }

    /// Queues every stored embeddable atom that still lacks an embedding.
    ///
    /// Atoms already waiting are left in place. Returns how many were added.
    pub fn restore_pending_embeddings(&self) -> EngineResult<usize> {
        let mut restored = 0;
        for record in self.atoms.pending_embeddings(usize::MAX)? {
            let queued = self.queue.enqueue(EmbedRequest {
                atom_id: record.id,
                tenant_id: record.tenant_id.clone(),
                content_hash: record.content_hash,
                modality: record.modality,
                content: record.canonical_payload().to_vec(),
            });
            if queued {
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Gives requests that hit the attempt ceiling a fresh attempt budget.
    pub fn requeue_failed(&self) -> usize {
        let requeued = self.queue.requeue_failed();
        if requeued > 0 {
            info!("event=embed_requeue module=service status=ok requeued={requeued}");
        }
        requeued
    }

    /// Top `top_k` hits for `query`, score descending.
    pub fn search(&self, query: &[f32], top_k: usize, tenant: &TenantId) -> EngineResult<Vec<SearchHit>> {
        Ok(self.search.search(query, top_k, tenant)?.hits)
    }

    pub fn search_detailed(
        &self,
        query: &[f32],
        top_k: usize,
        tenant: &TenantId,
    ) -> EngineResult<SearchOutcome> {
        Ok(self.search.search(query, top_k, tenant)?)
    }

    pub fn get_atom(&self, hash: &ContentHash, tenant: &TenantId) -> EngineResult<AtomRecord> {
        self.atoms
            .get_by_hash(hash, tenant)?
            .ok_or_else(|| EngineError::AtomNotFound {
                hash: *hash,
                tenant: tenant.clone(),
            })
    }

    /// Drops one reference; returns the remaining count.
    pub fn release(&self, id: AtomId) -> EngineResult<u64> {
        Ok(self.atoms.release(id)?)
    }

    /// Builds the next basis version from `sample`, re-projects every stored
    /// embedding into a fresh index and swaps it in.
    ///
    /// Returns the new basis version.
    pub fn rebootstrap(&self, sample: &[Vec<f32>]) -> EngineResult<u32> {
        let _guard = self.bootstrap_lock.lock();
        let started_at = Instant::now();
        if let Some(vector) = sample.iter().find(|vector| vector.len() != self.config.embedding_dim) {
            return Err(ValidationError::DimensionMismatch {
                expected: self.config.embedding_dim,
                actual: vector.len(),
            }
            .into());
        }

        let stored_version = self.bases.load_latest_basis()?.map(|basis| basis.version());
        let version = stored_version.or(self.basis_version()).map_or(1, |latest| latest + 1);
        let basis = LandmarkBasis::bootstrap(
            version,
            sample,
            self.config.basis_size,
            self.config.basis_strategy,
            self.config.basis_seed,
        )?;
        self.bases.save_basis(&basis)?;
        let generation = self.generation_for(basis)?;

        let mut entries = Vec::new();
        let mut skipped = 0_usize;
        for stored in self.embeddings.all_latest()? {
            let Some(record) = self.atoms.get_by_id(stored.atom_id)? else {
                skipped += 1;
                continue;
            };
            match generation.entry_for(stored.atom_id, record.tenant_id, stored.version, &stored.vector) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!(
                        "event=rebootstrap module=service status=warn atom_id={} error={err}",
                        stored.atom_id
                    );
                    skipped += 1;
                }
            }
        }
        let indexed = generation.index().bulk_insert(entries)?;
        let previous = self.generations.replace(generation);

        info!(
            "event=rebootstrap module=service status=ok version={version} previous={} indexed={indexed} skipped={skipped} duration_ms={}",
            previous.map_or_else(|| "none".to_string(), |generation| generation.basis_version().to_string()),
            started_at.elapsed().as_millis()
        );
        Ok(version)
    }

    /// Re-bootstraps from a seeded random sample of up to `sample_size`
    /// stored embeddings.
    pub fn bootstrap_from_store(&self, sample_size: usize) -> EngineResult<u32> {
        let mut vectors: Vec<Vec<f32>> = self
            .embeddings
            .all_latest()?
            .into_iter()
            .map(|stored| stored.vector)
            .filter(|vector| vector.len() == self.config.embedding_dim)
            .collect();
        let mut rng = StdRng::seed_from_u64(self.config.basis_seed);
        vectors.shuffle(&mut rng);
        vectors.truncate(sample_size.max(1));
        self.rebootstrap(&vectors)
    }

    fn generation_for(&self, basis: LandmarkBasis) -> EngineResult<Arc<IndexGeneration>> {
        let version = basis.version();
        let encoder = Arc::new(self.config.build_encoder()?);
        let index = self.backend.build(encoder.clone(), version, &self.config);
        let projector = EmbeddingProjector::new(Arc::new(basis));
        Ok(Arc::new(IndexGeneration::new(projector, encoder, index)?))
    }
}
