//! Embedding generation contract and deferred embedding pipeline.
//!
//! # Responsibility
//! - Define the opaque `EmbeddingProvider` boundary (batched, cancellable).
//! - Queue embeddable atoms at ingest and drain them later in batches.
//! - Persist, project, encode and index every produced embedding.
//!
//! # Invariants
//! - Ingest never waits on the provider; atoms persist without embeddings
//!   and are searchable only once drained.
//! - A failed batch requeues its requests until the attempt ceiling.
//!
//! # See also
//! - crate::index::generation
//! - crate::service::ingest

use crate::cancel::CancellationToken;
use crate::hash::ContentHash;
use crate::index::IndexError;
use crate::model::atom::{AtomId, Modality};
use crate::model::tenant::TenantId;
use crate::model::validation::ValidationError;
use crate::repo::StoreError;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod hashing;
pub mod queue;
pub mod worker;

pub use hashing::FeatureHashEmbedder;
pub use queue::{EmbeddingQueue, PendingEmbedding};
pub use worker::{DrainReport, EmbeddingWorker, WorkerSettings};

/// One atom awaiting an embedding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedRequest {
    pub atom_id: AtomId,
    pub tenant_id: TenantId,
    pub content_hash: ContentHash,
    pub modality: Modality,
    /// Canonical payload of the atom.
    pub content: Vec<u8>,
}

#[derive(Debug)]
pub enum EmbeddingError {
    /// Provider could not serve the batch now; retry later.
    Unavailable(String),
    Cancelled,
    /// Provider answered with the wrong number or shape of vectors.
    InvalidResponse(String),
    Validation(ValidationError),
    Store(StoreError),
    Index(IndexError),
}

impl Display for EmbeddingError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(reason) => write!(f, "embedding provider unavailable: {reason}"),
            Self::Cancelled => write!(f, "embedding cancelled"),
            Self::InvalidResponse(reason) => write!(f, "invalid embedding response: {reason}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::Index(err) => write!(f, "{err}"),
        }
    }
}

impl Error for EmbeddingError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::Index(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for EmbeddingError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<StoreError> for EmbeddingError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<IndexError> for EmbeddingError {
    fn from(value: IndexError) -> Self {
        Self::Index(value)
    }
}

/// External embedding function.
///
/// Implementations may be slow or rate limited; they must return one vector
/// of `dimension()` values per request, in request order, or an error for
/// the whole batch.
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    fn dimension(&self) -> usize;

    fn embed_batch(
        &self,
        requests: &[EmbedRequest],
        cancel: &CancellationToken,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}
