//! Landmark basis construction.
//!
//! # Responsibility
//! - Build `B` reference directions in native dimensionality `D` from a
//!   representative embedding sample.
//! - Precompute per-vector L2 norms for projection.
//!
//! # Invariants
//! - A constructed basis never contains a (near-)zero-norm vector.
//! - Vectors are linearly independent; bootstrapped bases are orthonormal.
//! - A basis is immutable; re-bootstrap yields a new `version`.

use crate::model::validation::ValidationError;
use crate::vector::math::{axpy_sub, dot, l2_norm};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Norms at or below this value are treated as zero.
pub const MIN_BASIS_NORM: f32 = 1e-6;
/// Minimum share of a candidate's norm that must survive orthogonalization.
const INDEPENDENCE_TOLERANCE: f32 = 1e-3;
const POWER_ITERATIONS: usize = 200;
const POWER_CONVERGENCE: f32 = 1e-6;
const RANDOM_RESAMPLE_ATTEMPTS: usize = 64;

/// How bootstrap derives basis directions from the sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BasisStrategy {
    /// Orthogonalize sample vectors in order, skipping dependent ones.
    GramSchmidt,
    /// Top-`B` right singular vectors via power iteration with deflation.
    PowerIteration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BasisError {
    Validation(ValidationError),
    /// Vector `index` lies (almost) in the span of the previous vectors.
    LinearlyDependent { index: usize },
    /// `basis_size` exceeds what the dimensionality allows.
    InsufficientRank { requested: usize, achieved: usize },
    Serialization(String),
}

impl Display for BasisError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::LinearlyDependent { index } => {
                write!(f, "basis vector {index} is linearly dependent on earlier vectors")
            }
            Self::InsufficientRank {
                requested,
                achieved,
            } => write!(
                f,
                "could only build {achieved} independent basis vectors, {requested} requested"
            ),
            Self::Serialization(message) => write!(f, "invalid basis payload: {message}"),
        }
    }
}

impl Error for BasisError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for BasisError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

/// Versioned set of reference vectors used by the projector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LandmarkBasis {
    version: u32,
    dimension: usize,
    vectors: Vec<Vec<f32>>,
    norms: Vec<f32>,
}

impl LandmarkBasis {
    /// Wraps caller-provided vectors after validation.
    ///
    /// # Errors
    /// - `ZeroNormBasisVector` for a (near-)zero vector.
    /// - `DimensionMismatch` when vectors disagree on length.
    /// - `LinearlyDependent` when a vector adds no new direction.
    pub fn from_vectors(version: u32, vectors: Vec<Vec<f32>>) -> Result<Self, BasisError> {
        let Some(first) = vectors.first() else {
            return Err(ValidationError::EmptySample.into());
        };
        let dimension = first.len();

        let mut norms = Vec::with_capacity(vectors.len());
        let mut orthogonal: Vec<Vec<f32>> = Vec::with_capacity(vectors.len());
        for (index, vector) in vectors.iter().enumerate() {
            if vector.len() != dimension {
                return Err(ValidationError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                }
                .into());
            }
            if vector.iter().any(|value| !value.is_finite()) {
                return Err(ValidationError::NonFiniteValue.into());
            }
            let norm = l2_norm(vector);
            if norm <= MIN_BASIS_NORM {
                return Err(ValidationError::ZeroNormBasisVector { index }.into());
            }
            let Some(residual) = orthogonalize(vector, &orthogonal) else {
                return Err(BasisError::LinearlyDependent { index });
            };
            orthogonal.push(residual);
            norms.push(norm);
        }

        Ok(Self {
            version,
            dimension,
            vectors,
            norms,
        })
    }

    /// Builds an orthonormal basis of `basis_size` vectors from `sample`.
    ///
    /// Dependent or near-zero candidates are rejected and replaced by the next
    /// sample vector, then by seeded random vectors.
    pub fn bootstrap(
        version: u32,
        sample: &[Vec<f32>],
        basis_size: usize,
        strategy: BasisStrategy,
        seed: u64,
    ) -> Result<Self, BasisError> {
        let Some(first) = sample.first() else {
            return Err(ValidationError::EmptySample.into());
        };
        let dimension = first.len();
        for vector in sample {
            if vector.len() != dimension {
                return Err(ValidationError::DimensionMismatch {
                    expected: dimension,
                    actual: vector.len(),
                }
                .into());
            }
            if vector.iter().any(|value| !value.is_finite()) {
                return Err(ValidationError::NonFiniteValue.into());
            }
        }
        if basis_size == 0 || basis_size > dimension {
            return Err(BasisError::InsufficientRank {
                requested: basis_size,
                achieved: dimension.min(basis_size),
            });
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut accepted = match strategy {
            BasisStrategy::GramSchmidt => gram_schmidt(sample, basis_size),
            BasisStrategy::PowerIteration => power_iteration(sample, basis_size, &mut rng),
        };

        let mut resampled = 0;
        let mut attempts = 0;
        while accepted.len() < basis_size && attempts < RANDOM_RESAMPLE_ATTEMPTS * basis_size {
            attempts += 1;
            let candidate: Vec<f32> = (0..dimension).map(|_| rng.gen_range(-1.0..1.0)).collect();
            if let Some(residual) = orthogonalize(&candidate, &accepted) {
                accepted.push(residual);
                resampled += 1;
            }
        }
        if accepted.len() < basis_size {
            return Err(BasisError::InsufficientRank {
                requested: basis_size,
                achieved: accepted.len(),
            });
        }
        if resampled > 0 {
            warn!(
                "event=basis_bootstrap module=vector status=warn version={version} resampled={resampled}"
            );
        }

        let norms = accepted.iter().map(|vector| l2_norm(vector)).collect();
        info!(
            "event=basis_bootstrap module=vector status=ok version={version} strategy={strategy:?} dimension={dimension} size={basis_size} sample={}",
            sample.len()
        );

        Ok(Self {
            version,
            dimension,
            vectors: accepted,
            norms,
        })
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Native embedding dimensionality `D`.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of basis vectors `B`.
    pub fn size(&self) -> usize {
        self.vectors.len()
    }

    pub fn vectors(&self) -> &[Vec<f32>] {
        &self.vectors
    }

    pub fn norms(&self) -> &[f32] {
        &self.norms
    }

    pub fn to_json(&self) -> Result<String, BasisError> {
        serde_json::to_string(self).map_err(|err| BasisError::Serialization(err.to_string()))
    }

    /// Parses a persisted basis and re-runs construction checks.
    pub fn from_json(payload: &str) -> Result<Self, BasisError> {
        let raw: Self = serde_json::from_str(payload)
            .map_err(|err| BasisError::Serialization(err.to_string()))?;
        let rebuilt = Self::from_vectors(raw.version, raw.vectors)?;
        if rebuilt.dimension != raw.dimension {
            return Err(BasisError::Serialization(format!(
                "declared dimension {} disagrees with vectors of length {}",
                raw.dimension, rebuilt.dimension
            )));
        }
        Ok(rebuilt)
    }
}

/// Modified Gram-Schmidt residual of `candidate` against an orthonormal set,
/// normalized. `None` when too little of the candidate survives.
fn orthogonalize(candidate: &[f32], orthonormal: &[Vec<f32>]) -> Option<Vec<f32>> {
    let original = l2_norm(candidate);
    if original <= MIN_BASIS_NORM {
        return None;
    }
    let mut residual = candidate.to_vec();
    // Second pass restores orthogonality lost to rounding.
    for _ in 0..2 {
        for basis in orthonormal {
            let coefficient = dot(&residual, basis);
            axpy_sub(&mut residual, coefficient, basis);
        }
    }
    let norm = l2_norm(&residual);
    if norm <= MIN_BASIS_NORM || norm / original < INDEPENDENCE_TOLERANCE {
        return None;
    }
    residual.iter_mut().for_each(|value| *value /= norm);
    Some(residual)
}

fn gram_schmidt(sample: &[Vec<f32>], basis_size: usize) -> Vec<Vec<f32>> {
    let mut accepted: Vec<Vec<f32>> = Vec::with_capacity(basis_size);
    for candidate in sample {
        if accepted.len() == basis_size {
            break;
        }
        if let Some(residual) = orthogonalize(candidate, &accepted) {
            accepted.push(residual);
        }
    }
    accepted
}

/// Sequential power iteration on `XᵀX` with deflation by orthogonalization.
fn power_iteration(sample: &[Vec<f32>], basis_size: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let dimension = sample[0].len();
    let mut accepted: Vec<Vec<f32>> = Vec::with_capacity(basis_size);

    for _ in 0..basis_size {
        let seed: Vec<f32> = (0..dimension).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let Some(mut current) = orthogonalize(&seed, &accepted) else {
            continue;
        };

        let mut converged = None;
        for _ in 0..POWER_ITERATIONS {
            let mut next = gram_apply(sample, &current);
            let Some(candidate) = orthogonalize(&next, &accepted) else {
                break;
            };
            next = candidate;
            let delta = next
                .iter()
                .zip(&current)
                .map(|(a, b)| (a - b).abs())
                .fold(0.0_f32, f32::max);
            current = next;
            if delta < POWER_CONVERGENCE {
                converged = Some(current.clone());
                break;
            }
            converged = Some(current.clone());
        }

        match converged {
            Some(vector) => accepted.push(vector),
            // Sample has no variance left outside the accepted span.
            None => break,
        }
    }
    accepted
}

/// Computes `Xᵀ(Xv)` without materializing the `D×D` matrix.
fn gram_apply(sample: &[Vec<f32>], v: &[f32]) -> Vec<f32> {
    let mut out = vec![0.0_f32; v.len()];
    for row in sample {
        let weight = dot(row, v);
        for (slot, value) in out.iter_mut().zip(row) {
            *slot += weight * value;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{BasisError, BasisStrategy, LandmarkBasis};
    use crate::model::validation::ValidationError;
    use crate::vector::math::dot;

    fn assert_orthonormal(basis: &LandmarkBasis) {
        for (i, a) in basis.vectors().iter().enumerate() {
            for (j, b) in basis.vectors().iter().enumerate() {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert!((dot(a, b) - expected).abs() < 1e-4, "<{i},{j}> = {}", dot(a, b));
            }
        }
    }

    #[test]
    fn from_vectors_rejects_zero_norm_vectors() {
        let err = LandmarkBasis::from_vectors(1, vec![vec![1.0, 0.0], vec![0.0, 0.0]]).unwrap_err();
        assert_eq!(
            err,
            BasisError::Validation(ValidationError::ZeroNormBasisVector { index: 1 })
        );
    }

    #[test]
    fn from_vectors_rejects_dependent_vectors() {
        let err = LandmarkBasis::from_vectors(1, vec![vec![1.0, 1.0], vec![2.0, 2.0]]).unwrap_err();
        assert_eq!(err, BasisError::LinearlyDependent { index: 1 });
    }

    #[test]
    fn gram_schmidt_skips_dependent_samples() {
        let sample = vec![
            vec![1.0, 0.0, 0.0],
            vec![2.0, 0.0, 0.0],
            vec![1.0, 1.0, 0.0],
            vec![0.0, 0.0, 0.0],
            vec![0.0, 0.0, 5.0],
        ];
        let basis =
            LandmarkBasis::bootstrap(1, &sample, 3, BasisStrategy::GramSchmidt, 7).unwrap();
        assert_eq!(basis.size(), 3);
        assert_orthonormal(&basis);
        assert!(basis.norms().iter().all(|norm| (norm - 1.0).abs() < 1e-4));
    }

    #[test]
    fn bootstrap_resamples_when_sample_is_rank_deficient() {
        let sample = vec![vec![1.0, 0.0, 0.0, 0.0]; 8];
        let basis =
            LandmarkBasis::bootstrap(2, &sample, 3, BasisStrategy::GramSchmidt, 42).unwrap();
        assert_eq!(basis.size(), 3);
        assert_orthonormal(&basis);
    }

    #[test]
    fn power_iteration_finds_dominant_direction() {
        let mut sample = Vec::new();
        for step in 0..40 {
            let t = step as f32 / 10.0 - 2.0;
            sample.push(vec![3.0 * t, 0.05 * (step % 3) as f32, 0.0]);
        }
        let basis =
            LandmarkBasis::bootstrap(1, &sample, 2, BasisStrategy::PowerIteration, 3).unwrap();
        assert_orthonormal(&basis);
        assert!(basis.vectors()[0][0].abs() > 0.99);
    }

    #[test]
    fn bootstrap_rejects_oversized_basis_and_empty_sample() {
        let err = LandmarkBasis::bootstrap(1, &[vec![1.0, 0.0]], 3, BasisStrategy::GramSchmidt, 0)
            .unwrap_err();
        assert!(matches!(err, BasisError::InsufficientRank { requested: 3, .. }));

        let err = LandmarkBasis::bootstrap(1, &[], 1, BasisStrategy::GramSchmidt, 0).unwrap_err();
        assert_eq!(err, BasisError::Validation(ValidationError::EmptySample));
    }

    #[test]
    fn json_roundtrip_revalidates() {
        let basis = LandmarkBasis::from_vectors(4, vec![vec![0.0, 2.0], vec![1.0, 0.0]]).unwrap();
        let restored = LandmarkBasis::from_json(&basis.to_json().unwrap()).unwrap();
        assert_eq!(restored, basis);

        let tampered = r#"{"version":1,"dimension":2,"vectors":[[0.0,0.0]],"norms":[1.0]}"#;
        assert!(LandmarkBasis::from_json(tampered).is_err());
    }
}
