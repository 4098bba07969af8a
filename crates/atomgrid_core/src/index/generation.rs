//! Basis-versioned index generations.
//!
//! # Invariants
//! - A generation's projector, encoder and index agree on basis version and
//!   dimensionality; construction rejects any mismatch.
//! - Swapping generations never mutates the old one; readers holding its
//!   `Arc` finish against a consistent view.

use crate::curve::HilbertEncoder;
use crate::index::{IndexError, IndexResult, SpatialEntry, SpatialIndex};
use crate::model::atom::AtomId;
use crate::model::tenant::TenantId;
use crate::model::validation::{validate_vector, ValidationError};
use crate::vector::EmbeddingProjector;
use parking_lot::RwLock;
use std::sync::Arc;

/// Projector, encoder and index of one basis version.
pub struct IndexGeneration {
    projector: EmbeddingProjector,
    encoder: Arc<HilbertEncoder>,
    index: Arc<dyn SpatialIndex>,
}

impl IndexGeneration {
    pub fn new(
        projector: EmbeddingProjector,
        encoder: Arc<HilbertEncoder>,
        index: Arc<dyn SpatialIndex>,
    ) -> IndexResult<Self> {
        if projector.output_dim() != encoder.dims() {
            return Err(ValidationError::DimensionMismatch {
                expected: encoder.dims(),
                actual: projector.output_dim(),
            }
            .into());
        }
        if projector.basis_version() != index.basis_version() {
            return Err(IndexError::BasisVersionMismatch {
                expected: index.basis_version(),
                actual: projector.basis_version(),
            });
        }
        Ok(Self {
            projector,
            encoder,
            index,
        })
    }

    pub fn basis_version(&self) -> u32 {
        self.projector.basis_version()
    }

    pub fn projector(&self) -> &EmbeddingProjector {
        &self.projector
    }

    pub fn encoder(&self) -> &Arc<HilbertEncoder> {
        &self.encoder
    }

    pub fn index(&self) -> &Arc<dyn SpatialIndex> {
        &self.index
    }

    /// Projects the unit-normalized embedding.
    ///
    /// Normalizing first keeps coordinates inside `[-1, 1]` for any basis
    /// whose projection is `dot / norm`.
    pub fn project(&self, embedding: &[f32]) -> Result<Vec<f32>, ValidationError> {
        let norm = validate_vector(embedding, self.projector.input_dim())?;
        let unit: Vec<f32> = embedding.iter().map(|value| value / norm).collect();
        self.projector.project(&unit)
    }

    /// Builds the spatial entry (coordinate and key together) for one embedding.
    pub fn entry_for(
        &self,
        atom_id: AtomId,
        tenant_id: TenantId,
        embedding_version: u32,
        embedding: &[f32],
    ) -> Result<SpatialEntry, ValidationError> {
        let coordinate = self.project(embedding)?;
        SpatialEntry::encode(
            &self.encoder,
            atom_id,
            tenant_id,
            self.basis_version(),
            coordinate,
            embedding_version,
        )
    }
}

/// Holder of the active generation; empty until a basis is bootstrapped.
#[derive(Default)]
pub struct GenerationCell {
    current: RwLock<Option<Arc<IndexGeneration>>>,
}

impl GenerationCell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<Arc<IndexGeneration>> {
        self.current.read().clone()
    }

    /// Installs `next` and returns the generation it replaced.
    pub fn replace(&self, next: Arc<IndexGeneration>) -> Option<Arc<IndexGeneration>> {
        self.current.write().replace(next)
    }
}
