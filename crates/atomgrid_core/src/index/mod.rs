//! Spatial prefilter index over projected coordinates.
//!
//! # Responsibility
//! - Store one `SpatialEntry` per embedded atom and basis version.
//! - Answer radius queries with every entry whose native coordinate lies
//!   within the radius.
//!
//! # Invariants
//! - Coordinate and encoded key of an entry are written together.
//! - `range_query` has full recall for true members; boundary false positives
//!   are never returned because results are filtered by native distance.
//! - When curve bounds do not fit the data, queries fall back to a full scan
//!   instead of losing recall or precision.
//!
//! # See also
//! - crate::curve
//! - crate::search

use crate::curve::{EncodedKey, HilbertEncoder};
use crate::model::atom::AtomId;
use crate::model::tenant::TenantId;
use crate::model::validation::ValidationError;
use crate::repo::atom_repo::StoreError;
use crate::vector::math::euclidean_distance;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod btree;
pub mod generation;
pub mod sqlite;

pub use btree::BTreeSpatialIndex;
pub use generation::{GenerationCell, IndexGeneration};
pub use sqlite::SqliteSpatialIndex;

/// Coverage above which walking key intervals costs about as much as a scan.
pub(crate) const FULL_SCAN_COVERAGE: f64 = 0.5;

/// One indexed point.
#[derive(Debug, Clone, PartialEq)]
pub struct SpatialEntry {
    pub atom_id: AtomId,
    pub tenant_id: TenantId,
    pub basis_version: u32,
    pub coordinate: Vec<f32>,
    pub encoded_key: u64,
    /// The coordinate was clamped into the curve bounds before encoding.
    pub clamped: bool,
    /// Embedding version the coordinate was projected from.
    pub embedding_version: u32,
}

impl SpatialEntry {
    /// Encodes `coordinate` and builds the entry in one step.
    pub fn encode(
        encoder: &HilbertEncoder,
        atom_id: AtomId,
        tenant_id: TenantId,
        basis_version: u32,
        coordinate: Vec<f32>,
        embedding_version: u32,
    ) -> Result<Self, ValidationError> {
        let EncodedKey { key, clamped } = encoder.encode(&coordinate)?;
        Ok(Self {
            atom_id,
            tenant_id,
            basis_version,
            coordinate,
            encoded_key: key,
            clamped,
            embedding_version,
        })
    }
}

#[derive(Debug)]
pub enum IndexError {
    Validation(ValidationError),
    Store(StoreError),
    /// Entry was projected with a different basis than this index serves.
    BasisVersionMismatch { expected: u32, actual: u32 },
}

impl Display for IndexError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Store(err) => write!(f, "{err}"),
            Self::BasisVersionMismatch { expected, actual } => write!(
                f,
                "entry basis version {actual} does not match index version {expected}"
            ),
        }
    }
}

impl Error for IndexError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Store(err) => Some(err),
            Self::BasisVersionMismatch { .. } => None,
        }
    }
}

impl From<ValidationError> for IndexError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<StoreError> for IndexError {
    fn from(value: StoreError) -> Self {
        Self::Store(value)
    }
}

impl From<rusqlite::Error> for IndexError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Store(StoreError::from(value))
    }
}

pub type IndexResult<T> = Result<T, IndexError>;

/// Radius-queryable spatial index for one basis version.
pub trait SpatialIndex: Send + Sync {
    fn basis_version(&self) -> u32;

    /// Inserts or replaces the entry for `entry.atom_id`.
    fn insert(&self, entry: SpatialEntry) -> IndexResult<()>;

    /// Inserts all entries; returns how many were written.
    fn bulk_insert(&self, entries: Vec<SpatialEntry>) -> IndexResult<usize> {
        let count = entries.len();
        for entry in entries {
            self.insert(entry)?;
        }
        Ok(count)
    }

    fn remove(&self, atom_id: AtomId) -> IndexResult<bool>;

    /// Atom ids whose native coordinate lies within `radius` of `center`,
    /// sorted ascending; restricted to `tenant` when given.
    fn range_query(
        &self,
        center: &[f32],
        radius: f32,
        tenant: Option<&TenantId>,
    ) -> IndexResult<Vec<AtomId>>;

    fn len(&self) -> IndexResult<usize>;

    /// Number of entries owned by `tenant`.
    fn tenant_len(&self, tenant: &TenantId) -> IndexResult<usize>;

    fn is_empty(&self) -> IndexResult<bool> {
        Ok(self.len()? == 0)
    }
}

pub(crate) fn check_query(
    encoder: &HilbertEncoder,
    center: &[f32],
    radius: f32,
) -> Result<(), ValidationError> {
    if center.len() != encoder.dims() {
        return Err(ValidationError::DimensionMismatch {
            expected: encoder.dims(),
            actual: center.len(),
        });
    }
    if center.iter().any(|value| !value.is_finite()) {
        return Err(ValidationError::NonFiniteValue);
    }
    if !radius.is_finite() || radius < 0.0 {
        return Err(ValidationError::InvalidRadius);
    }
    Ok(())
}

pub(crate) fn within_radius(coordinate: &[f32], center: &[f32], radius: f32) -> bool {
    coordinate.len() == center.len() && euclidean_distance(coordinate, center) <= radius
}
