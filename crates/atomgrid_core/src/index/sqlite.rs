//! SQLite-backed spatial index over sign-flipped Hilbert keys.
//!
//! # Invariants
//! - `stored_key = key ^ (1 << 63)` reinterpreted as `i64`, so SQLite's signed
//!   ordering matches unsigned key ordering and `BETWEEN` stays valid.
//! - Rows are keyed by `(basis_version, atom_id)`; generations never collide.
//! - Writes go through the shared writer connection. Reads use the reader
//!   connection when one is attached, so queries never queue behind inserts.

use crate::curve::HilbertEncoder;
use crate::db::{RetryPolicy, SharedConnection};
use crate::index::{
    check_query, within_radius, IndexError, IndexResult, SpatialEntry, SpatialIndex,
    FULL_SCAN_COVERAGE,
};
use crate::model::atom::AtomId;
use crate::model::tenant::TenantId;
use crate::repo::atom_repo::{parse_uuid, StoreError, StoreResult};
use crate::repo::embedding_repo::{decode_f32s, encode_f32s};
use log::warn;
use rusqlite::{params, Connection};
use std::sync::Arc;

const SIGN_BIT: u64 = 1 << 63;

const UPSERT_ENTRY_SQL: &str = "INSERT INTO spatial_entries (
    atom_id,
    tenant_id,
    basis_version,
    encoded_key,
    coordinate,
    is_clamped,
    embedding_version
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT (basis_version, atom_id) DO UPDATE SET
    tenant_id = excluded.tenant_id,
    encoded_key = excluded.encoded_key,
    coordinate = excluded.coordinate,
    is_clamped = excluded.is_clamped,
    embedding_version = excluded.embedding_version;";

pub(crate) fn key_to_db(key: u64) -> i64 {
    (key ^ SIGN_BIT) as i64
}

pub(crate) fn key_from_db(value: i64) -> u64 {
    (value as u64) ^ SIGN_BIT
}

pub struct SqliteSpatialIndex {
    conn: SharedConnection,
    reader: Option<SharedConnection>,
    encoder: Arc<HilbertEncoder>,
    basis_version: u32,
    max_key_ranges: usize,
    full_scan_clamp_ratio: f64,
    retry: RetryPolicy,
}

impl SqliteSpatialIndex {
    pub fn new(
        conn: SharedConnection,
        encoder: Arc<HilbertEncoder>,
        basis_version: u32,
        max_key_ranges: usize,
        full_scan_clamp_ratio: f64,
    ) -> Self {
        Self {
            conn,
            reader: None,
            encoder,
            basis_version,
            max_key_ranges,
            full_scan_clamp_ratio,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Serves queries from `reader`, a WAL read connection to the same file.
    pub fn with_reader(mut self, reader: SharedConnection) -> Self {
        self.reader = Some(reader);
        self
    }

    fn read_conn(&self) -> &SharedConnection {
        self.reader.as_ref().unwrap_or(&self.conn)
    }

    pub fn encoder(&self) -> &Arc<HilbertEncoder> {
        &self.encoder
    }

    fn check_entry(&self, entry: &SpatialEntry) -> IndexResult<()> {
        if entry.basis_version != self.basis_version {
            return Err(IndexError::BasisVersionMismatch {
                expected: self.basis_version,
                actual: entry.basis_version,
            });
        }
        Ok(())
    }

    fn clamped_ratio(&self, conn: &Connection) -> StoreResult<(f64, i64)> {
        let (total, clamped): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(is_clamped), 0)
             FROM spatial_entries
             WHERE basis_version = ?1;",
            [i64::from(self.basis_version)],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if total == 0 {
            return Ok((0.0, 0));
        }
        Ok((clamped as f64 / total as f64, total))
    }

    fn scan_between(
        &self,
        conn: &Connection,
        start: i64,
        end: i64,
        center: &[f32],
        radius: f32,
        tenant: Option<&TenantId>,
        hits: &mut Vec<AtomId>,
    ) -> StoreResult<()> {
        let mut stmt = conn.prepare_cached(
            "SELECT atom_id, tenant_id, coordinate
             FROM spatial_entries
             WHERE basis_version = ?1 AND encoded_key BETWEEN ?2 AND ?3;",
        )?;
        let mut rows = stmt.query(params![i64::from(self.basis_version), start, end])?;
        while let Some(row) = rows.next()? {
            let tenant_text: String = row.get(1)?;
            if tenant.is_some_and(|tenant| tenant.as_str() != tenant_text) {
                continue;
            }
            let blob: Vec<u8> = row.get(2)?;
            if within_radius(&decode_f32s(&blob)?, center, radius) {
                let id_text: String = row.get(0)?;
                hits.push(parse_uuid(&id_text)?);
            }
        }
        Ok(())
    }
}

fn write_entry(conn: &Connection, entry: &SpatialEntry) -> StoreResult<()> {
    conn.execute(
        UPSERT_ENTRY_SQL,
        params![
            entry.atom_id.to_string(),
            entry.tenant_id.as_str(),
            i64::from(entry.basis_version),
            key_to_db(entry.encoded_key),
            encode_f32s(&entry.coordinate),
            i64::from(entry.clamped),
            i64::from(entry.embedding_version),
        ],
    )?;
    Ok(())
}

impl SpatialIndex for SqliteSpatialIndex {
    fn basis_version(&self) -> u32 {
        self.basis_version
    }

    fn insert(&self, entry: SpatialEntry) -> IndexResult<()> {
        self.check_entry(&entry)?;
        Ok(self
            .retry
            .run("spatial_insert", StoreError::is_transient, || {
                write_entry(&self.conn.lock(), &entry)
            })?)
    }

    fn bulk_insert(&self, entries: Vec<SpatialEntry>) -> IndexResult<usize> {
        for entry in &entries {
            self.check_entry(entry)?;
        }
        Ok(self
            .retry
            .run("spatial_bulk_insert", StoreError::is_transient, || {
                let mut conn = self.conn.lock();
                let tx = conn.transaction()?;
                for entry in &entries {
                    write_entry(&tx, entry)?;
                }
                tx.commit()?;
                Ok(entries.len())
            })?)
    }

    fn remove(&self, atom_id: AtomId) -> IndexResult<bool> {
        Ok(self
            .retry
            .run("spatial_remove", StoreError::is_transient, || {
                let removed = self.conn.lock().execute(
                    "DELETE FROM spatial_entries WHERE basis_version = ?1 AND atom_id = ?2;",
                    params![i64::from(self.basis_version), atom_id.to_string()],
                )?;
                Ok(removed > 0)
            })?)
    }

    fn range_query(
        &self,
        center: &[f32],
        radius: f32,
        tenant: Option<&TenantId>,
    ) -> IndexResult<Vec<AtomId>> {
        check_query(&self.encoder, center, radius)?;
        let ranges = self.encoder.key_ranges(center, radius, self.max_key_ranges)?;

        let mut hits = self
            .retry
            .run("spatial_range_query", StoreError::is_transient, || {
                let conn = self.read_conn().lock();
                let (clamped_ratio, total) = self.clamped_ratio(&conn)?;
                let mut hits = Vec::new();
                if clamped_ratio > self.full_scan_clamp_ratio || ranges.coverage > FULL_SCAN_COVERAGE {
                    if clamped_ratio > self.full_scan_clamp_ratio {
                        warn!(
                            "event=spatial_full_scan module=index status=warn reason=bounds_mismatch clamped_ratio={clamped_ratio:.3} entries={total}"
                        );
                    }
                    self.scan_between(&conn, i64::MIN, i64::MAX, center, radius, tenant, &mut hits)?;
                } else {
                    for (start, end) in &ranges.ranges {
                        self.scan_between(
                            &conn,
                            key_to_db(*start),
                            key_to_db(*end),
                            center,
                            radius,
                            tenant,
                            &mut hits,
                        )?;
                    }
                }
                Ok(hits)
            })?;

        hits.sort();
        hits.dedup();
        Ok(hits)
    }

    fn len(&self) -> IndexResult<usize> {
        Ok(self
            .retry
            .run("spatial_len", StoreError::is_transient, || {
                let count: i64 = self.read_conn().lock().query_row(
                    "SELECT COUNT(*) FROM spatial_entries WHERE basis_version = ?1;",
                    [i64::from(self.basis_version)],
                    |row| row.get(0),
                )?;
                Ok(count.max(0) as usize)
            })?)
    }

    fn tenant_len(&self, tenant: &TenantId) -> IndexResult<usize> {
        Ok(self
            .retry
            .run("spatial_tenant_len", StoreError::is_transient, || {
                let count: i64 = self.read_conn().lock().query_row(
                    "SELECT COUNT(*) FROM spatial_entries WHERE basis_version = ?1 AND tenant_id = ?2;",
                    params![i64::from(self.basis_version), tenant.as_str()],
                    |row| row.get(0),
                )?;
                Ok(count.max(0) as usize)
            })?)
    }
}

#[cfg(test)]
mod tests {
    use super::{key_from_db, key_to_db, SqliteSpatialIndex};
    use crate::curve::HilbertEncoder;
    use crate::db::{open_db, open_db_in_memory, open_db_reader, share};
    use crate::index::{SpatialEntry, SpatialIndex};
    use crate::model::tenant::TenantId;
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn sign_flip_preserves_unsigned_order() {
        let keys = [0_u64, 1, (1 << 63) - 1, 1 << 63, u64::MAX];
        for pair in keys.windows(2) {
            assert!(key_to_db(pair[0]) < key_to_db(pair[1]));
        }
        assert_eq!(key_from_db(key_to_db(u64::MAX)), u64::MAX);
    }

    #[test]
    fn stored_entries_answer_radius_queries_per_generation() {
        let conn = share(open_db_in_memory().unwrap());
        let encoder = Arc::new(HilbertEncoder::new(2, 16, -1.0, 1.0).unwrap());
        let v1 = SqliteSpatialIndex::new(conn.clone(), encoder.clone(), 1, 64, 0.25);
        let v2 = SqliteSpatialIndex::new(conn, encoder.clone(), 2, 64, 0.25);
        let tenant = TenantId::new("default").unwrap();

        let near = SpatialEntry::encode(&encoder, Uuid::new_v4(), tenant.clone(), 1, vec![0.1, 0.1], 1).unwrap();
        let far = SpatialEntry::encode(&encoder, Uuid::new_v4(), tenant.clone(), 1, vec![-0.9, 0.8], 1).unwrap();
        assert_eq!(v1.bulk_insert(vec![near.clone(), far]).unwrap(), 2);

        assert_eq!(v1.range_query(&[0.1, 0.12], 0.05, Some(&tenant)).unwrap(), vec![near.atom_id]);
        assert!(v2.is_empty().unwrap());
        assert!(v2.insert(near.clone()).is_err());

        assert_eq!(v1.tenant_len(&tenant).unwrap(), 2);
        assert_eq!(v1.tenant_len(&TenantId::new("other").unwrap()).unwrap(), 0);
        assert!(v1.remove(near.atom_id).unwrap());
        assert_eq!(v1.len().unwrap(), 1);
    }

    #[test]
    fn reader_connection_answers_while_the_writer_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spatial.db");
        let writer = share(open_db(&path).unwrap());
        let reader = share(open_db_reader(&path).unwrap());
        let encoder = Arc::new(HilbertEncoder::new(2, 16, -1.0, 1.0).unwrap());
        let index = SqliteSpatialIndex::new(writer.clone(), encoder.clone(), 1, 64, 0.25)
            .with_reader(reader);
        let tenant = TenantId::new("default").unwrap();
        let point = SpatialEntry::encode(&encoder, Uuid::new_v4(), tenant.clone(), 1, vec![0.3, 0.3], 1).unwrap();
        index.insert(point.clone()).unwrap();

        let _in_flight_write = writer.lock();
        assert_eq!(index.range_query(&[0.3, 0.3], 0.01, Some(&tenant)).unwrap(), vec![point.atom_id]);
        assert_eq!(index.len().unwrap(), 1);
    }

    #[test]
    fn inserts_and_queries_interleave_across_threads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spatial.db");
        let encoder = Arc::new(HilbertEncoder::new(2, 16, -1.0, 1.0).unwrap());
        let index = Arc::new(
            SqliteSpatialIndex::new(share(open_db(&path).unwrap()), encoder.clone(), 1, 64, 0.25)
                .with_reader(share(open_db_reader(&path).unwrap())),
        );
        let tenant = TenantId::new("default").unwrap();
        let entries: Vec<SpatialEntry> = (0..200)
            .map(|i| {
                let offset = i as f32 / 400.0;
                SpatialEntry::encode(&encoder, Uuid::new_v4(), tenant.clone(), 1, vec![offset, -offset], 1)
                    .unwrap()
            })
            .collect();

        let writer = {
            let index = index.clone();
            let entries = entries.clone();
            std::thread::spawn(move || {
                for entry in entries {
                    index.insert(entry).unwrap();
                }
            })
        };
        let reader = {
            let index = index.clone();
            let tenant = tenant.clone();
            std::thread::spawn(move || {
                let mut last = 0;
                while last < 200 {
                    let seen = index.range_query(&[0.0, 0.0], 2.0, Some(&tenant)).unwrap().len();
                    assert!(seen >= last);
                    last = seen;
                }
            })
        };

        writer.join().unwrap();
        reader.join().unwrap();
        assert_eq!(index.len().unwrap(), 200);
    }
}
