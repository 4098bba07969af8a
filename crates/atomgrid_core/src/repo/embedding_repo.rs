//! Embedding store contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist native-dimensionality embeddings owned by atoms.
//! - Serve latest versions in bulk for exact refinement.
//!
//! # Invariants
//! - Embeddings are immutable; writing again creates version `n + 1`.
//! - Vectors are stored as little-endian `f32` blobs.

use crate::db::{RetryPolicy, SharedConnection};
use crate::model::atom::AtomId;
use crate::repo::atom_repo::{parse_uuid, StoreError, StoreResult};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;

/// One persisted embedding version.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEmbedding {
    pub atom_id: AtomId,
    pub version: u32,
    pub vector: Vec<f32>,
}

/// Embedding persistence contract.
pub trait EmbeddingStore: Send + Sync {
    /// Appends a new version for `atom_id` and returns its version number.
    fn put(&self, atom_id: AtomId, vector: &[f32]) -> StoreResult<u32>;

    fn latest(&self, atom_id: AtomId) -> StoreResult<Option<StoredEmbedding>>;

    /// Latest vectors for `ids`; ids without an embedding are omitted.
    fn latest_many(&self, ids: &[AtomId]) -> StoreResult<HashMap<AtomId, Vec<f32>>>;

    /// Latest version of every stored embedding, ordered by atom id.
    fn all_latest(&self) -> StoreResult<Vec<StoredEmbedding>>;
}

pub struct SqliteEmbeddingStore {
    conn: SharedConnection,
    retry: RetryPolicy,
}

impl SqliteEmbeddingStore {
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

impl EmbeddingStore for SqliteEmbeddingStore {
    fn put(&self, atom_id: AtomId, vector: &[f32]) -> StoreResult<u32> {
        let blob = encode_f32s(vector);
        self.retry.run("embedding_put", StoreError::is_transient, || {
            let conn = self.conn.lock();
            let version: i64 = conn.query_row(
                "INSERT INTO embeddings (atom_id, version, dimension, vector)
                 SELECT ?1, COALESCE(MAX(version), 0) + 1, ?2, ?3
                 FROM embeddings
                 WHERE atom_id = ?1
                 RETURNING version;",
                params![atom_id.to_string(), vector.len() as i64, blob.as_slice()],
                |row| row.get(0),
            )?;
            Ok(version as u32)
        })
    }

    fn latest(&self, atom_id: AtomId) -> StoreResult<Option<StoredEmbedding>> {
        self.retry.run("embedding_latest", StoreError::is_transient, || {
            let conn = self.conn.lock();
            let row: Option<(i64, Vec<u8>)> = conn
                .query_row(
                    "SELECT version, vector FROM embeddings
                     WHERE atom_id = ?1
                     ORDER BY version DESC
                     LIMIT 1;",
                    [atom_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            match row {
                Some((version, blob)) => Ok(Some(StoredEmbedding {
                    atom_id,
                    version: version as u32,
                    vector: decode_f32s(&blob)?,
                })),
                None => Ok(None),
            }
        })
    }

    fn latest_many(&self, ids: &[AtomId]) -> StoreResult<HashMap<AtomId, Vec<f32>>> {
        self.retry.run("embedding_latest_many", StoreError::is_transient, || {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare_cached(
                "SELECT vector FROM embeddings
                 WHERE atom_id = ?1
                 ORDER BY version DESC
                 LIMIT 1;",
            )?;
            let mut out = HashMap::with_capacity(ids.len());
            for id in ids {
                let blob: Option<Vec<u8>> = stmt
                    .query_row([id.to_string()], |row| row.get(0))
                    .optional()?;
                if let Some(blob) = blob {
                    out.insert(*id, decode_f32s(&blob)?);
                }
            }
            Ok(out)
        })
    }

    fn all_latest(&self) -> StoreResult<Vec<StoredEmbedding>> {
        self.retry.run("embedding_all_latest", StoreError::is_transient, || {
            let conn = self.conn.lock();
            let mut stmt = conn.prepare(
                "SELECT e.atom_id, e.version, e.vector
                 FROM embeddings e
                 JOIN (
                     SELECT atom_id, MAX(version) AS version
                     FROM embeddings
                     GROUP BY atom_id
                 ) latest ON latest.atom_id = e.atom_id AND latest.version = e.version
                 ORDER BY e.atom_id ASC;",
            )?;
            let mut rows = stmt.query([])?;
            let mut out = Vec::new();
            while let Some(row) = rows.next()? {
                let id_text: String = row.get(0)?;
                let version: i64 = row.get(1)?;
                let blob: Vec<u8> = row.get(2)?;
                out.push(StoredEmbedding {
                    atom_id: parse_uuid(&id_text)?,
                    version: version as u32,
                    vector: decode_f32s(&blob)?,
                });
            }
            Ok(out)
        })
    }
}

pub(crate) fn encode_f32s(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for value in values {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

pub(crate) fn decode_f32s(bytes: &[u8]) -> StoreResult<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(StoreError::InvalidData(format!(
            "f32 blob length {} is not a multiple of 4",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::{decode_f32s, encode_f32s, EmbeddingStore, SqliteEmbeddingStore};
    use crate::db::{open_db_in_memory, share};
    use uuid::Uuid;

    #[test]
    fn f32_blob_rejects_ragged_length() {
        assert_eq!(decode_f32s(&encode_f32s(&[1.5, -2.0])).unwrap(), vec![1.5, -2.0]);
        assert!(decode_f32s(&[0, 1, 2]).is_err());
    }

    #[test]
    fn put_appends_versions_and_latest_wins() {
        let store = SqliteEmbeddingStore::new(share(open_db_in_memory().unwrap()));
        let atom_id = Uuid::new_v4();

        assert_eq!(store.put(atom_id, &[1.0, 0.0]).unwrap(), 1);
        assert_eq!(store.put(atom_id, &[0.0, 1.0]).unwrap(), 2);

        let latest = store.latest(atom_id).unwrap().expect("embedding stored");
        assert_eq!(latest.version, 2);
        assert_eq!(latest.vector, vec![0.0, 1.0]);

        let all = store.all_latest().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].version, 2);
    }

    #[test]
    fn latest_many_skips_unembedded_ids() {
        let store = SqliteEmbeddingStore::new(share(open_db_in_memory().unwrap()));
        let embedded = Uuid::new_v4();
        store.put(embedded, &[0.5, 0.5]).unwrap();

        let found = store.latest_many(&[embedded, Uuid::new_v4()]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[&embedded], vec![0.5, 0.5]);
    }
}
