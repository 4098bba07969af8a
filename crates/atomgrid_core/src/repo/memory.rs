//! In-process store implementations.
//!
//! # Responsibility
//! - Back engines that do not need durability (tests, ephemeral ingest).
//! - Honor the same dedup and reference-count contract as the SQLite stores.
//!
//! # Invariants
//! - Atoms are sharded by content hash; an upsert holds exactly one shard
//!   lock, so concurrent upserts of one hash serialize on that shard.
//! - The id index is only written while the owning shard lock is held.
//! - An atom store attached to an embedding store reports only atoms with
//!   no stored vector as pending; a detached one reports every embeddable atom.

use crate::hash::ContentHash;
use crate::model::atom::{now_epoch_ms, AtomDraft, AtomId, AtomRecord};
use crate::model::relation::{AtomRelation, RelationType};
use crate::model::tenant::TenantId;
use crate::repo::atom_repo::{AtomStore, StoreError, StoreResult, UpsertOutcome};
use crate::repo::embedding_repo::{EmbeddingStore, StoredEmbedding};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use uuid::Uuid;

const SHARD_COUNT: usize = 16;

type AtomKey = (TenantId, ContentHash);
type RelationKey = (TenantId, ContentHash, RelationType, i64, ContentHash);

pub struct MemoryAtomStore {
    shards: Vec<Mutex<HashMap<AtomKey, AtomRecord>>>,
    ids: RwLock<HashMap<AtomId, AtomKey>>,
    relations: Mutex<BTreeMap<RelationKey, AtomRelation>>,
    embeddings: Option<Arc<MemoryEmbeddingStore>>,
}

impl Default for MemoryAtomStore {
    fn default() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            ids: RwLock::new(HashMap::new()),
            relations: Mutex::new(BTreeMap::new()),
            embeddings: None,
        }
    }
}

impl MemoryAtomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consults `embeddings` when listing atoms that still need a vector.
    pub fn with_embeddings(mut self, embeddings: Arc<MemoryEmbeddingStore>) -> Self {
        self.embeddings = Some(embeddings);
        self
    }

    fn shard(&self, hash: &ContentHash) -> &Mutex<HashMap<AtomKey, AtomRecord>> {
        &self.shards[usize::from(hash.as_bytes()[0]) % SHARD_COUNT]
    }
}

impl AtomStore for MemoryAtomStore {
    fn upsert(&self, draft: &AtomDraft, tenant: &TenantId) -> StoreResult<UpsertOutcome> {
        let key = (tenant.clone(), draft.content_hash);
        let mut shard = self.shard(&draft.content_hash).lock();

        if let Some(existing) = shard.get_mut(&key) {
            existing.reference_count += 1;
            existing.embeddable |= draft.embeddable;
            return Ok(UpsertOutcome {
                id: existing.id,
                was_new: false,
                reference_count: existing.reference_count,
            });
        }

        let id = Uuid::new_v4();
        let record = AtomRecord::from_draft(id, draft, tenant.clone(), now_epoch_ms());
        self.ids.write().insert(id, key.clone());
        shard.insert(key, record);
        Ok(UpsertOutcome {
            id,
            was_new: true,
            reference_count: 1,
        })
    }

    fn upsert_many(
        &self,
        drafts: &[AtomDraft],
        tenant: &TenantId,
    ) -> StoreResult<BTreeMap<ContentHash, UpsertOutcome>> {
        let mut outcomes = BTreeMap::new();
        for draft in drafts {
            if outcomes.contains_key(&draft.content_hash) {
                continue;
            }
            outcomes.insert(draft.content_hash, self.upsert(draft, tenant)?);
        }
        Ok(outcomes)
    }

    fn link(&self, relations: &[AtomRelation], tenant: &TenantId) -> StoreResult<usize> {
        let mut stored = self.relations.lock();
        let mut linked = 0;
        for relation in relations {
            let key = (
                tenant.clone(),
                relation.parent_hash,
                relation.relation_type,
                relation.sequence_index.map_or(-1, |index| index as i64),
                relation.child_hash,
            );
            if !stored.contains_key(&key) {
                stored.insert(key, relation.clone());
                linked += 1;
            }
        }
        Ok(linked)
    }

    fn release(&self, id: AtomId) -> StoreResult<u64> {
        let key = self
            .ids
            .read()
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))?;
        let mut shard = self.shard(&key.1).lock();
        let record = shard.get_mut(&key).ok_or(StoreError::NotFound(id))?;
        record.reference_count = record.reference_count.saturating_sub(1);
        Ok(record.reference_count)
    }

    fn get_by_hash(&self, hash: &ContentHash, tenant: &TenantId) -> StoreResult<Option<AtomRecord>> {
        Ok(self
            .shard(hash)
            .lock()
            .get(&(tenant.clone(), *hash))
            .cloned())
    }

    fn get_by_id(&self, id: AtomId) -> StoreResult<Option<AtomRecord>> {
        let Some(key) = self.ids.read().get(&id).cloned() else {
            return Ok(None);
        };
        Ok(self.shard(&key.1).lock().get(&key).cloned())
    }

    fn relations_from(
        &self,
        parent: &ContentHash,
        tenant: &TenantId,
    ) -> StoreResult<Vec<AtomRelation>> {
        Ok(self
            .relations
            .lock()
            .iter()
            .filter(|((owner, parent_hash, ..), _)| owner == tenant && parent_hash == parent)
            .map(|(_, relation)| relation.clone())
            .collect())
    }

    fn gc_candidates(&self, tenant: &TenantId, limit: usize) -> StoreResult<Vec<AtomId>> {
        let mut ids: Vec<AtomId> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .values()
                    .filter(|record| &record.tenant_id == tenant && record.is_gc_eligible())
                    .map(|record| record.id)
                    .collect::<Vec<_>>()
            })
            .collect();
        ids.sort();
        ids.truncate(limit);
        Ok(ids)
    }

    fn pending_embeddings(&self, limit: usize) -> StoreResult<Vec<AtomRecord>> {
        let mut pending: Vec<AtomRecord> = self
            .shards
            .iter()
            .flat_map(|shard| {
                shard
                    .lock()
                    .values()
                    .filter(|record| record.embeddable)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|record| {
                self.embeddings
                    .as_ref()
                    .map_or(true, |embeddings| !embeddings.contains(record.id))
            })
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        pending.truncate(limit);
        Ok(pending)
    }

    fn count(&self, tenant: &TenantId) -> StoreResult<u64> {
        Ok(self
            .shards
            .iter()
            .map(|shard| {
                shard
                    .lock()
                    .keys()
                    .filter(|(owner, _)| owner == tenant)
                    .count() as u64
            })
            .sum())
    }
}

#[derive(Default)]
pub struct MemoryEmbeddingStore {
    versions: RwLock<HashMap<AtomId, Vec<Vec<f32>>>>,
}

impl MemoryEmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, atom_id: AtomId) -> bool {
        self.versions.read().contains_key(&atom_id)
    }
}

impl EmbeddingStore for MemoryEmbeddingStore {
    fn put(&self, atom_id: AtomId, vector: &[f32]) -> StoreResult<u32> {
        let mut versions = self.versions.write();
        let history = versions.entry(atom_id).or_default();
        history.push(vector.to_vec());
        Ok(history.len() as u32)
    }

    fn latest(&self, atom_id: AtomId) -> StoreResult<Option<StoredEmbedding>> {
        Ok(self.versions.read().get(&atom_id).and_then(|history| {
            history.last().map(|vector| StoredEmbedding {
                atom_id,
                version: history.len() as u32,
                vector: vector.clone(),
            })
        }))
    }

    fn latest_many(&self, ids: &[AtomId]) -> StoreResult<HashMap<AtomId, Vec<f32>>> {
        let versions = self.versions.read();
        Ok(ids
            .iter()
            .filter_map(|id| {
                versions
                    .get(id)
                    .and_then(|history| history.last())
                    .map(|vector| (*id, vector.clone()))
            })
            .collect())
    }

    fn all_latest(&self) -> StoreResult<Vec<StoredEmbedding>> {
        let versions = self.versions.read();
        let mut out: Vec<StoredEmbedding> = versions
            .iter()
            .filter_map(|(atom_id, history)| {
                history.last().map(|vector| StoredEmbedding {
                    atom_id: *atom_id,
                    version: history.len() as u32,
                    vector: vector.clone(),
                })
            })
            .collect();
        out.sort_by_key(|stored| stored.atom_id.to_string());
        Ok(out)
    }
}
