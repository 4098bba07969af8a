//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define the atom, embedding and basis persistence contracts.
//! - Isolate SQLite query details from ingest and search orchestration.
//! - Provide in-memory implementations with the same contracts.
//!
//! # Invariants
//! - Atom identity is `(content_hash, tenant_id)`; repeated content only
//!   increments `reference_count`.
//! - Repository APIs return semantic errors (`NotFound`, `InvalidData`) in
//!   addition to DB transport errors.

pub mod atom_repo;
pub mod basis_repo;
pub mod embedding_repo;
pub mod memory;

pub use atom_repo::{AtomStore, PersistOutcome, SqliteAtomStore, StoreError, StoreResult, UpsertOutcome};
pub use basis_repo::{BasisStore, MemoryBasisStore, SqliteBasisStore};
pub use embedding_repo::{EmbeddingStore, SqliteEmbeddingStore, StoredEmbedding};
pub use memory::{MemoryAtomStore, MemoryEmbeddingStore};
