//! Caller-contract violations.
//!
//! Every variant is a fail-fast error: inputs are never coerced into a valid
//! shape.

use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Ingested content is empty.
    EmptyContent,
    /// Vector length does not match the configured dimensionality.
    DimensionMismatch { expected: usize, actual: usize },
    /// Query or embedding vector has zero magnitude.
    ZeroMagnitude,
    /// Vector contains NaN or infinity.
    NonFiniteValue,
    InvalidTenantId(String),
    /// Basis vector `index` has (near-)zero norm.
    ZeroNormBasisVector { index: usize },
    /// Bootstrap sample is empty or too small.
    EmptySample,
    /// Query radius is negative or non-finite.
    InvalidRadius,
    /// `top_k` must be at least one.
    ZeroTopK,
}

impl Display for ValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyContent => write!(f, "content must not be empty"),
            Self::DimensionMismatch { expected, actual } => write!(
                f,
                "vector dimensionality mismatch: expected {expected}, got {actual}"
            ),
            Self::ZeroMagnitude => write!(f, "vector has zero magnitude"),
            Self::NonFiniteValue => write!(f, "vector contains a non-finite value"),
            Self::InvalidTenantId(value) => write!(
                f,
                "tenant id `{value}` is invalid; expected 1-64 chars of [a-z0-9_.-]"
            ),
            Self::ZeroNormBasisVector { index } => {
                write!(f, "basis vector {index} has zero norm")
            }
            Self::EmptySample => write!(f, "bootstrap sample must not be empty"),
            Self::InvalidRadius => write!(f, "radius must be finite and non-negative"),
            Self::ZeroTopK => write!(f, "top_k must be at least 1"),
        }
    }
}

impl Error for ValidationError {}

/// Checks length, finiteness and magnitude of a vector.
///
/// Returns the L2 norm on success.
pub fn validate_vector(values: &[f32], expected_dim: usize) -> Result<f32, ValidationError> {
    if values.len() != expected_dim {
        return Err(ValidationError::DimensionMismatch {
            expected: expected_dim,
            actual: values.len(),
        });
    }
    if values.iter().any(|value| !value.is_finite()) {
        return Err(ValidationError::NonFiniteValue);
    }
    let norm = values.iter().map(|value| value * value).sum::<f32>().sqrt();
    if norm <= f32::EPSILON {
        return Err(ValidationError::ZeroMagnitude);
    }
    Ok(norm)
}

#[cfg(test)]
mod tests {
    use super::{validate_vector, ValidationError};

    #[test]
    fn validate_vector_reports_each_violation() {
        assert_eq!(
            validate_vector(&[1.0, 0.0], 3).unwrap_err(),
            ValidationError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        );
        assert_eq!(
            validate_vector(&[0.0, 0.0], 2).unwrap_err(),
            ValidationError::ZeroMagnitude
        );
        assert_eq!(
            validate_vector(&[f32::NAN, 1.0], 2).unwrap_err(),
            ValidationError::NonFiniteValue
        );
        let norm = validate_vector(&[3.0, 4.0], 2).unwrap();
        assert!((norm - 5.0).abs() < 1e-6);
    }
}
