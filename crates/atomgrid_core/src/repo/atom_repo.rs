//! Atom store contracts and SQLite implementation.
//!
//! # Responsibility
//! - Provide content-addressed, reference-counted persistence for atoms.
//! - Persist relations keyed by `(parent, child, type, sequence)`.
//! - Keep SQL details inside the storage boundary.
//!
//! # Invariants
//! - Insert-or-increment is one conditional statement, never check-then-act.
//! - Bulk upserts and relation links of one ingest commit in one transaction.
//! - `reference_count` never drops below zero.
//! - Transient lock failures are retried here and never surface above.

use crate::db::migrations::latest_version;
use crate::db::{DbError, RetryPolicy, SharedConnection};
use crate::hash::ContentHash;
use crate::model::atom::{now_epoch_ms, AtomDraft, AtomId, AtomRecord, Modality};
use crate::model::relation::{AtomRelation, RelationType, SpatialMetadata};
use crate::model::tenant::TenantId;
use crate::model::validation::ValidationError;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

const ATOM_SELECT_SQL: &str = "SELECT
    id,
    content_hash,
    tenant_id,
    atomic_value,
    is_overflow,
    overflow_payload,
    modality,
    subtype,
    reference_count,
    created_at,
    is_embeddable
FROM atoms";

const UPSERT_SQL: &str = "INSERT INTO atoms (
    id,
    content_hash,
    tenant_id,
    atomic_value,
    is_overflow,
    overflow_payload,
    modality,
    subtype,
    reference_count,
    created_at,
    is_embeddable
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10)
ON CONFLICT (content_hash, tenant_id)
DO UPDATE SET
    reference_count = reference_count + 1,
    is_embeddable = MAX(is_embeddable, excluded.is_embeddable)
RETURNING id, reference_count;";

const PENDING_EMBEDDINGS_SQL: &str = "SELECT
    a.id,
    a.content_hash,
    a.tenant_id,
    a.atomic_value,
    a.is_overflow,
    a.overflow_payload,
    a.modality,
    a.subtype,
    a.reference_count,
    a.created_at,
    a.is_embeddable
FROM atoms a
WHERE a.is_embeddable = 1
  AND NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.atom_id = a.id)
ORDER BY a.created_at ASC, a.id ASC
LIMIT ?1;";

const LINK_SQL: &str = "INSERT INTO atom_relations (
    tenant_id,
    parent_hash,
    child_hash,
    relation_type,
    sequence_index,
    weight,
    spatial_metadata
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT DO NOTHING;";

pub type StoreResult<T> = Result<T, StoreError>;

/// Storage-boundary error for atom, embedding and spatial persistence.
#[derive(Debug)]
pub enum StoreError {
    Validation(ValidationError),
    Db(DbError),
    NotFound(AtomId),
    InvalidData(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Db(err) if err.is_transient())
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "atom not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::NotFound(_) => None,
            Self::InvalidData(_) => None,
        }
    }
}

impl From<ValidationError> for StoreError {
    fn from(value: ValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Result of one insert-or-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: AtomId,
    /// `true` when this call created the atom.
    pub was_new: bool,
    /// Reference count after the call.
    pub reference_count: u64,
}

/// Result of persisting one atomizer output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PersistOutcome {
    pub atoms: BTreeMap<ContentHash, UpsertOutcome>,
    pub relations_linked: usize,
}

impl PersistOutcome {
    pub fn created(&self) -> usize {
        self.atoms.values().filter(|outcome| outcome.was_new).count()
    }

    pub fn deduplicated(&self) -> usize {
        self.atoms.values().filter(|outcome| !outcome.was_new).count()
    }
}

/// Content-addressed atom persistence contract.
pub trait AtomStore: Send + Sync {
    /// Inserts the atom or increments the reference count of the existing one.
    fn upsert(&self, draft: &AtomDraft, tenant: &TenantId) -> StoreResult<UpsertOutcome>;

    /// Upserts every distinct draft in one round trip.
    ///
    /// Repeated hashes inside `drafts` count once.
    fn upsert_many(
        &self,
        drafts: &[AtomDraft],
        tenant: &TenantId,
    ) -> StoreResult<BTreeMap<ContentHash, UpsertOutcome>>;

    /// Persists relations; already-present keys are ignored.
    ///
    /// Returns the number of newly stored relations.
    fn link(&self, relations: &[AtomRelation], tenant: &TenantId) -> StoreResult<usize>;

    /// Upserts atoms and links relations as one unit.
    fn persist(
        &self,
        drafts: &[AtomDraft],
        relations: &[AtomRelation],
        tenant: &TenantId,
    ) -> StoreResult<PersistOutcome> {
        let atoms = self.upsert_many(drafts, tenant)?;
        let relations_linked = self.link(relations, tenant)?;
        Ok(PersistOutcome {
            atoms,
            relations_linked,
        })
    }

    /// Decrements the reference count (floored at zero) and returns the new count.
    fn release(&self, id: AtomId) -> StoreResult<u64>;

    fn get_by_hash(&self, hash: &ContentHash, tenant: &TenantId) -> StoreResult<Option<AtomRecord>>;

    fn get_by_id(&self, id: AtomId) -> StoreResult<Option<AtomRecord>>;

    /// Outgoing relations of `parent`, ordered by type then sequence index.
    fn relations_from(
        &self,
        parent: &ContentHash,
        tenant: &TenantId,
    ) -> StoreResult<Vec<AtomRelation>>;

    /// Atoms whose reference count reached zero.
    fn gc_candidates(&self, tenant: &TenantId, limit: usize) -> StoreResult<Vec<AtomId>>;

    /// Embeddable atoms of every tenant that have no stored embedding yet,
    /// oldest first.
    fn pending_embeddings(&self, limit: usize) -> StoreResult<Vec<AtomRecord>>;

    fn count(&self, tenant: &TenantId) -> StoreResult<u64>;
}

/// SQLite-backed atom store.
pub struct SqliteAtomStore {
    conn: SharedConnection,
    retry: RetryPolicy,
}

impl SqliteAtomStore {
    /// Creates a store over a migrated connection.
    pub fn try_new(conn: SharedConnection) -> StoreResult<Self> {
        ensure_schema_ready(&conn.lock())?;
        Ok(Self {
            conn,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn with_retry_tx<T>(
        &self,
        op_name: &str,
        mut op: impl FnMut(&rusqlite::Transaction<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.retry.run(op_name, StoreError::is_transient, || {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            let value = op(&tx)?;
            tx.commit()?;
            Ok(value)
        })
    }

    fn with_retry_conn<T>(
        &self,
        op_name: &str,
        mut op: impl FnMut(&Connection) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.retry.run(op_name, StoreError::is_transient, || {
            let conn = self.conn.lock();
            op(&conn)
        })
    }
}

impl AtomStore for SqliteAtomStore {
    fn upsert(&self, draft: &AtomDraft, tenant: &TenantId) -> StoreResult<UpsertOutcome> {
        self.with_retry_tx("atom_upsert", |tx| upsert_one(tx, draft, tenant))
    }

    fn upsert_many(
        &self,
        drafts: &[AtomDraft],
        tenant: &TenantId,
    ) -> StoreResult<BTreeMap<ContentHash, UpsertOutcome>> {
        self.with_retry_tx("atom_upsert_many", |tx| upsert_distinct(tx, drafts, tenant))
    }

    fn link(&self, relations: &[AtomRelation], tenant: &TenantId) -> StoreResult<usize> {
        self.with_retry_tx("atom_link", |tx| link_all(tx, relations, tenant))
    }

    fn persist(
        &self,
        drafts: &[AtomDraft],
        relations: &[AtomRelation],
        tenant: &TenantId,
    ) -> StoreResult<PersistOutcome> {
        self.with_retry_tx("atom_persist", |tx| {
            let atoms = upsert_distinct(tx, drafts, tenant)?;
            let relations_linked = link_all(tx, relations, tenant)?;
            Ok(PersistOutcome {
                atoms,
                relations_linked,
            })
        })
    }

    fn release(&self, id: AtomId) -> StoreResult<u64> {
        self.with_retry_conn("atom_release", |conn| {
            let count: Option<i64> = conn
                .query_row(
                    "UPDATE atoms
                     SET reference_count = MAX(reference_count - 1, 0)
                     WHERE id = ?1
                     RETURNING reference_count;",
                    [id.to_string()],
                    |row| row.get(0),
                )
                .optional()?;
            match count {
                Some(value) => Ok(value.max(0) as u64),
                None => Err(StoreError::NotFound(id)),
            }
        })
    }

    fn get_by_hash(&self, hash: &ContentHash, tenant: &TenantId) -> StoreResult<Option<AtomRecord>> {
        self.with_retry_conn("atom_get_by_hash", |conn| {
            let mut stmt = conn.prepare(&format!(
                "{ATOM_SELECT_SQL} WHERE content_hash = ?1 AND tenant_id = ?2;"
            ))?;
            let mut rows = stmt.query(params![hash.as_bytes().as_slice(), tenant.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(Some(parse_atom_row(row)?)),
                None => Ok(None),
            }
        })
    }

    fn get_by_id(&self, id: AtomId) -> StoreResult<Option<AtomRecord>> {
        self.with_retry_conn("atom_get_by_id", |conn| {
            let mut stmt = conn.prepare(&format!("{ATOM_SELECT_SQL} WHERE id = ?1;"))?;
            let mut rows = stmt.query([id.to_string()])?;
            match rows.next()? {
                Some(row) => Ok(Some(parse_atom_row(row)?)),
                None => Ok(None),
            }
        })
    }

    fn relations_from(
        &self,
        parent: &ContentHash,
        tenant: &TenantId,
    ) -> StoreResult<Vec<AtomRelation>> {
        self.with_retry_conn("atom_relations_from", |conn| {
            let mut stmt = conn.prepare(
                "SELECT parent_hash, child_hash, relation_type, sequence_index, weight, spatial_metadata
                 FROM atom_relations
                 WHERE tenant_id = ?1 AND parent_hash = ?2
                 ORDER BY relation_type ASC, sequence_index ASC, child_hash ASC;",
            )?;
            let mut rows = stmt.query(params![tenant.as_str(), parent.as_bytes().as_slice()])?;
            let mut relations = Vec::new();
            while let Some(row) = rows.next()? {
                relations.push(parse_relation_row(row)?);
            }
            Ok(relations)
        })
    }

    fn gc_candidates(&self, tenant: &TenantId, limit: usize) -> StoreResult<Vec<AtomId>> {
        self.with_retry_conn("atom_gc_candidates", |conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM atoms
                 WHERE tenant_id = ?1 AND reference_count = 0
                 ORDER BY id ASC
                 LIMIT ?2;",
            )?;
            let mut rows = stmt.query(params![tenant.as_str(), limit as i64])?;
            let mut ids = Vec::new();
            while let Some(row) = rows.next()? {
                let text: String = row.get(0)?;
                ids.push(parse_uuid(&text)?);
            }
            Ok(ids)
        })
    }

    fn pending_embeddings(&self, limit: usize) -> StoreResult<Vec<AtomRecord>> {
        self.with_retry_conn("atom_pending_embeddings", |conn| {
            let mut stmt = conn.prepare(PENDING_EMBEDDINGS_SQL)?;
            let mut rows = stmt.query([limit_to_db(limit)])?;
            let mut records = Vec::new();
            while let Some(row) = rows.next()? {
                records.push(parse_atom_row(row)?);
            }
            Ok(records)
        })
    }

    fn count(&self, tenant: &TenantId) -> StoreResult<u64> {
        self.with_retry_conn("atom_count", |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM atoms WHERE tenant_id = ?1;",
                [tenant.as_str()],
                |row| row.get(0),
            )?;
            Ok(count.max(0) as u64)
        })
    }
}

fn upsert_one(conn: &Connection, draft: &AtomDraft, tenant: &TenantId) -> StoreResult<UpsertOutcome> {
    let candidate_id = Uuid::new_v4();
    let (id_text, reference_count): (String, i64) = conn.query_row(
        UPSERT_SQL,
        params![
            candidate_id.to_string(),
            draft.content_hash.as_bytes().as_slice(),
            tenant.as_str(),
            draft.atomic_value.as_slice(),
            bool_to_int(draft.is_overflow()),
            draft.overflow_payload.as_deref(),
            draft.modality.as_str(),
            draft.subtype.as_str(),
            now_epoch_ms(),
            bool_to_int(draft.embeddable),
        ],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    let id = parse_uuid(&id_text)?;

    Ok(UpsertOutcome {
        id,
        was_new: id == candidate_id,
        reference_count: reference_count.max(0) as u64,
    })
}

fn upsert_distinct(
    conn: &Connection,
    drafts: &[AtomDraft],
    tenant: &TenantId,
) -> StoreResult<BTreeMap<ContentHash, UpsertOutcome>> {
    let mut outcomes = BTreeMap::new();
    for draft in drafts {
        if outcomes.contains_key(&draft.content_hash) {
            continue;
        }
        let outcome = upsert_one(conn, draft, tenant)?;
        outcomes.insert(draft.content_hash, outcome);
    }
    Ok(outcomes)
}

fn link_all(conn: &Connection, relations: &[AtomRelation], tenant: &TenantId) -> StoreResult<usize> {
    let mut stmt = conn.prepare_cached(LINK_SQL)?;
    let mut linked = 0;
    for relation in relations {
        let spatial = match &relation.spatial {
            Some(metadata) => Some(serde_json::to_string(metadata).map_err(|err| {
                StoreError::InvalidData(format!("cannot encode spatial metadata: {err}"))
            })?),
            None => None,
        };
        linked += stmt.execute(params![
            tenant.as_str(),
            relation.parent_hash.as_bytes().as_slice(),
            relation.child_hash.as_bytes().as_slice(),
            relation.relation_type.as_str(),
            sequence_to_db(relation.sequence_index),
            relation.weight.map(f64::from),
            spatial,
        ])?;
    }
    Ok(linked)
}

fn ensure_schema_ready(conn: &Connection) -> StoreResult<()> {
    let version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if version != latest_version() {
        return Err(StoreError::InvalidData(format!(
            "store requires schema version {}, got {version}",
            latest_version()
        )));
    }
    Ok(())
}

fn parse_atom_row(row: &Row<'_>) -> StoreResult<AtomRecord> {
    let id_text: String = row.get("id")?;
    let id = parse_uuid(&id_text)?;

    let hash_bytes: Vec<u8> = row.get("content_hash")?;
    let content_hash = ContentHash::from_slice(&hash_bytes).ok_or_else(|| {
        StoreError::InvalidData(format!("invalid content_hash width {}", hash_bytes.len()))
    })?;

    let tenant_text: String = row.get("tenant_id")?;
    let tenant_id = TenantId::new(&tenant_text).map_err(|_| {
        StoreError::InvalidData(format!("invalid tenant `{tenant_text}` in atoms.tenant_id"))
    })?;

    let modality_text: String = row.get("modality")?;
    let modality = Modality::parse(&modality_text).ok_or_else(|| {
        StoreError::InvalidData(format!("invalid modality `{modality_text}` in atoms.modality"))
    })?;

    let overflow = match row.get::<_, i64>("is_overflow")? {
        0 => false,
        1 => true,
        other => {
            return Err(StoreError::InvalidData(format!(
                "invalid is_overflow value `{other}` in atoms.is_overflow"
            )));
        }
    };
    let overflow_payload: Option<Vec<u8>> = row.get("overflow_payload")?;
    if overflow != overflow_payload.is_some() {
        return Err(StoreError::InvalidData(format!(
            "atom {id} overflow flag disagrees with overflow payload"
        )));
    }

    Ok(AtomRecord {
        id,
        content_hash,
        atomic_value: row.get("atomic_value")?,
        overflow,
        overflow_payload,
        modality,
        subtype: row.get("subtype")?,
        tenant_id,
        reference_count: row.get::<_, i64>("reference_count")?.max(0) as u64,
        created_at: row.get("created_at")?,
        embeddable: row.get::<_, i64>("is_embeddable")? == 1,
    })
}

fn parse_relation_row(row: &Row<'_>) -> StoreResult<AtomRelation> {
    let parent: Vec<u8> = row.get("parent_hash")?;
    let child: Vec<u8> = row.get("child_hash")?;
    let parent_hash = ContentHash::from_slice(&parent)
        .ok_or_else(|| StoreError::InvalidData("invalid parent_hash width".to_string()))?;
    let child_hash = ContentHash::from_slice(&child)
        .ok_or_else(|| StoreError::InvalidData("invalid child_hash width".to_string()))?;

    let type_text: String = row.get("relation_type")?;
    let relation_type = RelationType::parse(&type_text).ok_or_else(|| {
        StoreError::InvalidData(format!("invalid relation type `{type_text}`"))
    })?;

    let spatial = match row.get::<_, Option<String>>("spatial_metadata")? {
        Some(text) => Some(serde_json::from_str::<SpatialMetadata>(&text).map_err(|err| {
            StoreError::InvalidData(format!("invalid spatial metadata: {err}"))
        })?),
        None => None,
    };

    Ok(AtomRelation {
        parent_hash,
        child_hash,
        relation_type,
        sequence_index: sequence_from_db(row.get("sequence_index")?),
        weight: row.get::<_, Option<f64>>("weight")?.map(|value| value as f32),
        spatial,
    })
}

pub(crate) fn parse_uuid(text: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(text).map_err(|_| StoreError::InvalidData(format!("invalid uuid value `{text}`")))
}

fn sequence_to_db(value: Option<u64>) -> i64 {
    value.map_or(-1, |index| index as i64)
}

fn sequence_from_db(value: i64) -> Option<u64> {
    if value < 0 {
        None
    } else {
        Some(value as u64)
    }
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}
