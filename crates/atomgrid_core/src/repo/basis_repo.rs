//! Landmark basis persistence.
//!
//! # Invariants
//! - Versions are append-only; saving an existing version fails.
//! - Loaded payloads are re-validated before use.

use crate::db::{RetryPolicy, SharedConnection};
use crate::repo::atom_repo::{StoreError, StoreResult};
use crate::vector::LandmarkBasis;
use parking_lot::RwLock;
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;

pub trait BasisStore: Send + Sync {
    fn save_basis(&self, basis: &LandmarkBasis) -> StoreResult<()>;

    /// Highest stored version, if any.
    fn load_latest_basis(&self) -> StoreResult<Option<LandmarkBasis>>;
}

pub struct SqliteBasisStore {
    conn: SharedConnection,
    retry: RetryPolicy,
}

impl SqliteBasisStore {
    pub fn new(conn: SharedConnection) -> Self {
        Self {
            conn,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl BasisStore for SqliteBasisStore {
    fn save_basis(&self, basis: &LandmarkBasis) -> StoreResult<()> {
        let payload = basis
            .to_json()
            .map_err(|err| StoreError::InvalidData(err.to_string()))?;
        self.retry.run("basis_save", StoreError::is_transient, || {
            let conn = self.conn.lock();
            conn.execute(
                "INSERT INTO landmark_bases (version, payload) VALUES (?1, ?2);",
                params![i64::from(basis.version()), payload],
            )?;
            Ok(())
        })
    }

    fn load_latest_basis(&self) -> StoreResult<Option<LandmarkBasis>> {
        let payload: Option<String> = self.retry.run("basis_load", StoreError::is_transient, || {
            let conn = self.conn.lock();
            Ok(conn
                .query_row(
                    "SELECT payload FROM landmark_bases ORDER BY version DESC LIMIT 1;",
                    [],
                    |row| row.get(0),
                )
                .optional()?)
        })?;

        payload
            .map(|payload| {
                LandmarkBasis::from_json(&payload)
                    .map_err(|err| StoreError::InvalidData(err.to_string()))
            })
            .transpose()
    }
}

/// Process-local basis history.
#[derive(Default)]
pub struct MemoryBasisStore {
    bases: RwLock<BTreeMap<u32, LandmarkBasis>>,
}

impl MemoryBasisStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BasisStore for MemoryBasisStore {
    fn save_basis(&self, basis: &LandmarkBasis) -> StoreResult<()> {
        let mut bases = self.bases.write();
        if bases.contains_key(&basis.version()) {
            return Err(StoreError::InvalidData(format!(
                "basis version {} already stored",
                basis.version()
            )));
        }
        bases.insert(basis.version(), basis.clone());
        Ok(())
    }

    fn load_latest_basis(&self) -> StoreResult<Option<LandmarkBasis>> {
        Ok(self.bases.read().values().next_back().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::{BasisStore, MemoryBasisStore, SqliteBasisStore};
    use crate::db::{open_db_in_memory, share};
    use crate::vector::LandmarkBasis;

    fn basis(version: u32) -> LandmarkBasis {
        LandmarkBasis::from_vectors(version, vec![vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 2.0]])
            .unwrap()
    }

    #[test]
    fn sqlite_store_returns_highest_version() {
        let store = SqliteBasisStore::new(share(open_db_in_memory().unwrap()));
        assert!(store.load_latest_basis().unwrap().is_none());

        store.save_basis(&basis(1)).unwrap();
        store.save_basis(&basis(2)).unwrap();
        assert!(store.save_basis(&basis(2)).is_err());

        let latest = store.load_latest_basis().unwrap().expect("basis stored");
        assert_eq!(latest.version(), 2);
        assert_eq!(latest.norms(), basis(2).norms());
    }

    #[test]
    fn memory_store_rejects_duplicate_versions() {
        let store = MemoryBasisStore::new();
        store.save_basis(&basis(3)).unwrap();
        assert!(store.save_basis(&basis(3)).is_err());
        assert_eq!(store.load_latest_basis().unwrap().unwrap().version(), 3);
    }
}
