//! Embedding-space geometry: landmark basis, projection and similarity.
//!
//! # Responsibility
//! - Bootstrap the versioned `LandmarkBasis` from an embedding sample.
//! - Project native embeddings to `B`-dimensional coordinates.
//! - Provide exact similarity used by refinement.
//!
//! # Invariants
//! - A basis is immutable after construction and shared by `Arc`.

pub mod basis;
pub mod math;
pub mod projector;

pub use basis::{BasisError, BasisStrategy, LandmarkBasis};
pub use projector::EmbeddingProjector;
