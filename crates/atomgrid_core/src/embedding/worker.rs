//! Batched drain of the deferred embedding queue.
//!
//! # Invariants
//! - One drain processes at most the requests queued when it started, so
//!   requeued failures wait for the next drain.
//! - Embedding persistence precedes index insertion; an atom is never
//!   indexed without a stored embedding to refine against.
//! - Provider cancellation requeues the batch without counting an attempt.

use crate::cancel::CancellationToken;
use crate::embedding::{
    EmbedRequest, EmbeddingError, EmbeddingProvider, EmbeddingQueue, PendingEmbedding,
};
use crate::index::GenerationCell;
use crate::model::atom::{AtomDraft, Modality};
use crate::model::relation::{AtomRelation, RelationType, SpatialMetadata};
use crate::model::validation::validate_vector;
use crate::model::warning::{IngestWarning, WarningCode};
use crate::repo::{AtomStore, EmbeddingStore};
use log::{info, warn};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    pub batch_size: usize,
    /// Failed attempts after which a request is parked as failed.
    pub max_attempts: u32,
    /// Record each embedding dimension as an atom.
    pub decompose: bool,
    pub max_atom_size: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 32,
            max_attempts: 5,
            decompose: false,
            max_atom_size: 64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub embedded: usize,
    /// Requests requeued for a later drain.
    pub deferred: usize,
    /// Requests that hit the attempt ceiling.
    pub failed: usize,
    pub warnings: Vec<IngestWarning>,
}

pub struct EmbeddingWorker {
    provider: Arc<dyn EmbeddingProvider>,
    queue: Arc<EmbeddingQueue>,
    atoms: Arc<dyn AtomStore>,
    embeddings: Arc<dyn EmbeddingStore>,
    generations: Arc<GenerationCell>,
    settings: WorkerSettings,
}

impl EmbeddingWorker {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        queue: Arc<EmbeddingQueue>,
        atoms: Arc<dyn AtomStore>,
        embeddings: Arc<dyn EmbeddingStore>,
        generations: Arc<GenerationCell>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            provider,
            queue,
            atoms,
            embeddings,
            generations,
            settings,
        }
    }

    pub fn queue(&self) -> &Arc<EmbeddingQueue> {
        &self.queue
    }

    /// Embeds queued atoms in batches until the starting backlog is handled
    /// or `cancel` fires.
    pub fn drain(&self, cancel: &CancellationToken) -> DrainReport {
        let started_at = Instant::now();
        let budget = self.queue.len();
        let batch_size = self.settings.batch_size.max(1);
        let mut report = DrainReport::default();
        let mut processed = 0;

        while processed < budget {
            if cancel.is_cancelled() {
                report.warnings.push(IngestWarning::new(
                    WarningCode::Cancelled,
                    "embedding drain cancelled",
                ));
                break;
            }
            let batch = self.queue.take_batch(batch_size.min(budget - processed));
            if batch.is_empty() {
                break;
            }
            processed += batch.len();

            let requests: Vec<EmbedRequest> =
                batch.iter().map(|pending| pending.request.clone()).collect();
            match self.provider.embed_batch(&requests, cancel) {
                Ok(vectors) if vectors.len() == batch.len() => {
                    for (pending, vector) in batch.into_iter().zip(vectors) {
                        match self.store_one(&pending.request, &vector) {
                            Ok(()) => report.embedded += 1,
                            Err(err) => self.defer(pending, &err, &mut report),
                        }
                    }
                }
                Ok(vectors) => {
                    let err = EmbeddingError::InvalidResponse(format!(
                        "expected {} vectors, got {}",
                        batch.len(),
                        vectors.len()
                    ));
                    for pending in batch {
                        self.defer(pending, &err, &mut report);
                    }
                }
                Err(EmbeddingError::Cancelled) => {
                    for pending in batch {
                        self.queue.requeue(pending);
                    }
                    report.warnings.push(IngestWarning::new(
                        WarningCode::Cancelled,
                        "embedding batch cancelled",
                    ));
                    break;
                }
                Err(err) => {
                    for pending in batch {
                        self.defer(pending, &err, &mut report);
                    }
                }
            }
        }

        let status = if report.deferred + report.failed == 0 { "ok" } else { "warn" };
        info!(
            "event=embed_batch module=embedding status={status} provider={} embedded={} deferred={} failed={} remaining={} duration_ms={}",
            self.provider.name(),
            report.embedded,
            report.deferred,
            report.failed,
            self.queue.len(),
            started_at.elapsed().as_millis()
        );
        report
    }

    fn store_one(&self, request: &EmbedRequest, vector: &[f32]) -> Result<(), EmbeddingError> {
        validate_vector(vector, self.provider.dimension())?;
        let version = self.embeddings.put(request.atom_id, vector)?;

        let mut projection = None;
        if let Some(generation) = self.generations.current() {
            let entry =
                generation.entry_for(request.atom_id, request.tenant_id.clone(), version, vector)?;
            projection = Some(SpatialMetadata::Projection {
                basis_version: generation.basis_version(),
                coordinate: entry.coordinate.clone(),
            });
            generation.index().insert(entry)?;
        }
        if self.settings.decompose {
            self.decompose(request, vector, projection)?;
        }
        Ok(())
    }

    /// Stores each dimension as an `Embedding` atom linked from the owner.
    fn decompose(
        &self,
        request: &EmbedRequest,
        vector: &[f32],
        projection: Option<SpatialMetadata>,
    ) -> Result<(), EmbeddingError> {
        let mut drafts = Vec::with_capacity(vector.len());
        let mut relations = Vec::with_capacity(vector.len());
        for (dimension, value) in vector.iter().enumerate() {
            let draft = AtomDraft::new(
                &value.to_le_bytes(),
                Modality::Embedding,
                "dimension",
                self.settings.max_atom_size,
            );
            let mut relation = AtomRelation::new(
                request.content_hash,
                draft.content_hash,
                RelationType::EmbeddingDimension,
            )
            .at(dimension as u64)
            .with_weight(*value);
            if let Some(spatial) = &projection {
                relation = relation.with_spatial(spatial.clone());
            }
            if relation.is_self_loop() {
                continue;
            }
            drafts.push(draft);
            relations.push(relation);
        }
        self.atoms.persist(&drafts, &relations, &request.tenant_id)?;
        Ok(())
    }

    fn defer(&self, mut pending: PendingEmbedding, err: &EmbeddingError, report: &mut DrainReport) {
        pending.attempts += 1;
        let atom_id = pending.request.atom_id;
        let attempts = pending.attempts;
        if attempts >= self.settings.max_attempts {
            warn!(
                "event=embed_batch module=embedding status=error atom_id={atom_id} attempts={attempts} error={err}"
            );
            report.failed += 1;
            report.warnings.push(IngestWarning::new(
                WarningCode::EmbeddingFailed,
                format!("atom {atom_id} gave up after {attempts} attempts: {err}"),
            ));
            self.queue.mark_failed(pending);
        } else {
            report.deferred += 1;
            report.warnings.push(IngestWarning::new(
                WarningCode::EmbeddingDeferred,
                format!("atom {atom_id} deferred after attempt {attempts}: {err}"),
            ));
            self.queue.requeue(pending);
        }
    }
}
