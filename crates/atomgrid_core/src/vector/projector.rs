//! Landmark projection of native embeddings.
//!
//! # Invariants
//! - `coordinate[i] = dot(embedding, basis[i]) / norm[i]`.
//! - Input dimensionality must equal the basis dimensionality; no padding or
//!   truncation is ever applied.

use crate::model::validation::ValidationError;
use crate::vector::basis::LandmarkBasis;
use crate::vector::math::dot;
use std::sync::Arc;

/// Projects `D`-dimensional embeddings onto a shared `LandmarkBasis`.
#[derive(Debug, Clone)]
pub struct EmbeddingProjector {
    basis: Arc<LandmarkBasis>,
}

impl EmbeddingProjector {
    pub fn new(basis: Arc<LandmarkBasis>) -> Self {
        Self { basis }
    }

    pub fn basis(&self) -> &Arc<LandmarkBasis> {
        &self.basis
    }

    pub fn basis_version(&self) -> u32 {
        self.basis.version()
    }

    /// Input dimensionality `D`.
    pub fn input_dim(&self) -> usize {
        self.basis.dimension()
    }

    /// Output dimensionality `B`.
    pub fn output_dim(&self) -> usize {
        self.basis.size()
    }

    /// Projects one embedding; O(D·B).
    ///
    /// # Errors
    /// - `DimensionMismatch` when `embedding.len() != D`.
    /// - `NonFiniteValue` when the embedding contains NaN or infinity.
    pub fn project(&self, embedding: &[f32]) -> Result<Vec<f32>, ValidationError> {
        if embedding.len() != self.basis.dimension() {
            return Err(ValidationError::DimensionMismatch {
                expected: self.basis.dimension(),
                actual: embedding.len(),
            });
        }
        if embedding.iter().any(|value| !value.is_finite()) {
            return Err(ValidationError::NonFiniteValue);
        }

        Ok(self
            .basis
            .vectors()
            .iter()
            .zip(self.basis.norms())
            .map(|(vector, norm)| dot(embedding, vector) / norm)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::EmbeddingProjector;
    use crate::model::validation::ValidationError;
    use crate::vector::basis::LandmarkBasis;
    use std::sync::Arc;

    #[test]
    fn projection_matches_hand_calculation() {
        let basis = LandmarkBasis::from_vectors(
            1,
            vec![
                vec![0.6, 0.8, 0.0, 0.0],
                vec![-0.8, 0.6, 0.0, 0.0],
                vec![0.0, 0.0, 1.0, 0.0],
            ],
        )
        .unwrap();
        let projector = EmbeddingProjector::new(Arc::new(basis));

        let coordinate = projector.project(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        assert_eq!(coordinate.len(), 3);
        assert!((coordinate[0] - 0.6).abs() < 1e-6);
        assert!((coordinate[1] + 0.8).abs() < 1e-6);
        assert!(coordinate[2].abs() < 1e-6);
    }

    #[test]
    fn non_unit_basis_vectors_are_divided_by_their_norm() {
        let basis = LandmarkBasis::from_vectors(1, vec![vec![2.0, 0.0], vec![0.0, 4.0]]).unwrap();
        let projector = EmbeddingProjector::new(Arc::new(basis));
        let coordinate = projector.project(&[3.0, 5.0]).unwrap();
        assert!((coordinate[0] - 3.0).abs() < 1e-6);
        assert!((coordinate[1] - 5.0).abs() < 1e-6);
    }

    #[test]
    fn dimension_mismatch_fails_fast() {
        let basis = LandmarkBasis::from_vectors(1, vec![vec![1.0, 0.0]]).unwrap();
        let projector = EmbeddingProjector::new(Arc::new(basis));
        assert_eq!(
            projector.project(&[1.0, 0.0, 0.0]).unwrap_err(),
            ValidationError::DimensionMismatch {
                expected: 2,
                actual: 3
            }
        );
    }
}
