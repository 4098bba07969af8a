//! Content ingest use case.
//!
//! # Responsibility
//! - Atomize content, persist atoms and relations in one store call, and
//!   queue newly created embeddable atoms for deferred embedding.
//! - Run batches on a worker pool, one job per content item.
//!
//! # Invariants
//! - Ingest never calls the embedding provider.
//! - A failed batch item never fails its siblings.
//! - Cancelled atomization still persists a connected partial graph.

use crate::atomizer::{AtomizeError, AtomizeLimits, AtomizerRegistry, SourceMetadata};
use crate::cancel::CancellationToken;
use crate::embedding::{EmbedRequest, EmbeddingQueue};
use crate::hash::ContentHash;
use crate::model::atom::AtomId;
use crate::model::tenant::TenantId;
use crate::model::validation::ValidationError;
use crate::model::warning::IngestWarning;
use crate::repo::{AtomStore, StoreError};
use log::{error, info, warn};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub enum IngestError {
    Validation(ValidationError),
    Atomize(AtomizeError),
    Store(StoreError),
}

impl Display for IngestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Atomize(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
        }
    }
}

impl Error for IngestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Atomize(err) => Some(err),
            Self::Store(err) => Some(err),
        }
    }
}

impl From<ValidationError> for IngestError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<AtomizeError> for IngestError {
    fn from(value: AtomizeError) -> Self {
        match value {
            AtomizeError::Validation(err) => Self::Validation(err),
            other => Self::Atomize(other),
        }
    }
}

impl From<StoreError> for IngestError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

/// One content item of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestRequest {
    pub content: Vec<u8>,
    pub source: SourceMetadata,
    pub tenant: TenantId,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IngestReport {
    pub atoms_created: usize,
    pub atoms_deduplicated: usize,
    pub root_atom_id: AtomId,
    pub root_hash: ContentHash,
    pub relations_linked: usize,
    pub embeddings_queued: usize,
    pub warnings: Vec<IngestWarning>,
}

pub struct IngestService {
    registry: Arc<AtomizerRegistry>,
    atoms: Arc<dyn AtomStore>,
    queue: Arc<EmbeddingQueue>,
    limits: AtomizeLimits,
    pool: Option<ThreadPool>,
}

impl IngestService {
    pub fn new(
        registry: Arc<AtomizerRegistry>,
        atoms: Arc<dyn AtomStore>,
        queue: Arc<EmbeddingQueue>,
        limits: AtomizeLimits,
    ) -> Self {
        Self {
            registry,
            atoms,
            queue,
            limits,
            pool: None,
        }
    }

    /// Runs batches on a dedicated pool of `threads` workers; 0 keeps the
    /// global rayon pool.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        if threads == 0 {
            self.pool = None;
            return self;
        }
        match rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("atomgrid-ingest-{index}"))
            .build()
        {
            Ok(pool) => self.pool = Some(pool),
            Err(err) => warn!(
                "event=ingest_batch module=service status=warn threads={threads} error={err} fallback=global_pool"
            ),
        }
        self
    }

    pub fn limits(&self) -> AtomizeLimits {
        self.limits
    }

    /// Ingests one content item.
    ///
    /// # Errors
    /// - `Validation` for empty content.
    /// - `Atomize` when no atomizer accepts the content.
    /// - `Store` when persistence fails after retries.
    pub fn ingest_content(
        &self,
        content: &[u8],
        source: &SourceMetadata,
        tenant: &TenantId,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, IngestError> {
        let started_at = Instant::now();
        let result = self.ingest_inner(content, source, tenant, cancel);
        match &result {
            Ok(report) => info!(
                "event=ingest module=service status=ok tenant={tenant} bytes={} created={} deduplicated={} queued={} warnings={} root={} duration_ms={}",
                content.len(),
                report.atoms_created,
                report.atoms_deduplicated,
                report.embeddings_queued,
                report.warnings.len(),
                report.root_hash.short(),
                started_at.elapsed().as_millis()
            ),
            Err(err) => error!(
                "event=ingest module=service status=error tenant={tenant} bytes={} duration_ms={} error={err}",
                content.len(),
                started_at.elapsed().as_millis()
            ),
        }
        result
    }

    fn ingest_inner(
        &self,
        content: &[u8],
        source: &SourceMetadata,
        tenant: &TenantId,
        cancel: &CancellationToken,
    ) -> Result<IngestReport, IngestError> {
        let output = self.registry.atomize(content, source, self.limits, cancel)?;
        let root_hash = output.root_hash();
        let (drafts, relations, warnings) = output.into_parts();
        let persisted = self.atoms.persist(&drafts, &relations, tenant)?;

        let root_atom_id = persisted
            .atoms
            .get(&root_hash)
            .map(|outcome| outcome.id)
            .ok_or_else(|| StoreError::InvalidData(format!("root atom {root_hash} was not persisted")))?;

        let mut embeddings_queued = 0;
        for draft in drafts.iter().filter(|draft| draft.embeddable) {
            let Some(outcome) = persisted.atoms.get(&draft.content_hash) else {
                continue;
            };
            if !outcome.was_new {
                continue;
            }
            let queued = self.queue.enqueue(EmbedRequest {
                atom_id: outcome.id,
                tenant_id: tenant.clone(),
                content_hash: draft.content_hash,
                modality: draft.modality,
                content: draft.canonical_payload().to_vec(),
            });
            if queued {
                embeddings_queued += 1;
            }
        }

        Ok(IngestReport {
            atoms_created: persisted.created(),
            atoms_deduplicated: persisted.deduplicated(),
            root_atom_id,
            root_hash,
            relations_linked: persisted.relations_linked,
            embeddings_queued,
            warnings,
        })
    }

    /// Ingests every item on the worker pool; results keep input order.
    pub fn ingest_batch(
        &self,
        items: &[IngestRequest],
        cancel: &CancellationToken,
    ) -> Vec<Result<IngestReport, IngestError>> {
        let started_at = Instant::now();
        let run = || {
            items
                .par_iter()
                .map(|item| self.ingest_content(&item.content, &item.source, &item.tenant, cancel))
                .collect::<Vec<_>>()
        };
        let results = match &self.pool {
            Some(pool) => pool.install(run),
            None => run(),
        };

        let failed = results.iter().filter(|result| result.is_err()).count();
        let status = if failed == 0 { "ok" } else { "warn" };
        info!(
            "event=ingest_batch module=service status={status} items={} failed={failed} duration_ms={}",
            items.len(),
            started_at.elapsed().as_millis()
        );
        results
    }
}

#[cfg(test)]
mod tests {
    use super::{IngestError, IngestRequest, IngestService};
    use crate::atomizer::{AtomizeLimits, AtomizerRegistry, SourceMetadata};
    use crate::cancel::CancellationToken;
    use crate::embedding::EmbeddingQueue;
    use crate::model::tenant::TenantId;
    use crate::model::validation::ValidationError;
    use crate::repo::{AtomStore, MemoryAtomStore};
    use std::sync::Arc;

    fn service() -> (IngestService, Arc<MemoryAtomStore>, Arc<EmbeddingQueue>) {
        let atoms = Arc::new(MemoryAtomStore::new());
        let queue = Arc::new(EmbeddingQueue::new());
        let service = IngestService::new(
            Arc::new(AtomizerRegistry::with_defaults()),
            atoms.clone(),
            queue.clone(),
            AtomizeLimits::default(),
        );
        (service, atoms, queue)
    }

    #[test]
    fn second_ingest_only_deduplicates() {
        let (service, atoms, queue) = service();
        let tenant = TenantId::new("default").unwrap();
        let source = SourceMetadata::named("hello.txt");
        let cancel = CancellationToken::new();

        let first = service.ingest_content(b"hello atom", &source, &tenant, &cancel).unwrap();
        assert_eq!(first.atoms_created, 1);
        assert_eq!(first.embeddings_queued, 1);

        let second = service.ingest_content(b"hello atom", &source, &tenant, &cancel).unwrap();
        assert_eq!(second.atoms_created, 0);
        assert_eq!(second.atoms_deduplicated, 1);
        assert_eq!(second.root_atom_id, first.root_atom_id);
        assert_eq!(second.embeddings_queued, 0);
        assert_eq!(queue.len(), 1);

        let record = atoms.get_by_id(first.root_atom_id).unwrap().unwrap();
        assert_eq!(record.reference_count, 2);
    }

    #[test]
    fn empty_content_is_a_validation_error() {
        let (service, _, _) = service();
        let err = service
            .ingest_content(b"", &SourceMetadata::default(), &TenantId::new("default").unwrap(), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, IngestError::Validation(ValidationError::EmptyContent)));
    }

    #[test]
    fn batch_keeps_order_and_isolates_failures() {
        let (service, _, _) = service();
        let service = service.with_worker_threads(2);
        let tenant = TenantId::new("default").unwrap();
        let items: Vec<IngestRequest> = [b"first item".as_slice(), b"".as_slice(), b"third item".as_slice()]
            .iter()
            .map(|content| IngestRequest {
                content: content.to_vec(),
                source: SourceMetadata::named("item.txt"),
                tenant: tenant.clone(),
            })
            .collect();

        let results = service.ingest_batch(&items, &CancellationToken::new());
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }
}
