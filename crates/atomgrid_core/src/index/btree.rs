//! In-memory B-tree over Hilbert keys.
//!
//! # Invariants
//! - Readers clone the published snapshot and query it without holding any
//!   lock, so a running range scan never delays an insert and vice versa.
//! - Writers serialize among themselves and publish a new snapshot per write.
//!   Recent writes live in a small overlay that shadows the shared base tree;
//!   the overlay is folded into a fresh base once it outgrows about the
//!   square root of the base size, keeping per-write copying sublinear.
//! - Every live atom appears exactly once: in the overlay, or in the base and
//!   not shadowed by the overlay.

use crate::curve::HilbertEncoder;
use crate::index::{
    check_query, within_radius, IndexError, IndexResult, SpatialEntry, SpatialIndex,
    FULL_SCAN_COVERAGE,
};
use crate::model::atom::AtomId;
use crate::model::tenant::TenantId;
use log::warn;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Overlay size below which writes never trigger a merge.
const MIN_OVERLAY: usize = 256;

#[derive(Debug, Clone)]
struct IndexedPoint {
    atom_id: AtomId,
    tenant_id: TenantId,
    coordinate: Vec<f32>,
    encoded_key: u64,
    clamped: bool,
}

#[derive(Default)]
struct BaseTree {
    buckets: BTreeMap<u64, Vec<Arc<IndexedPoint>>>,
    points: HashMap<AtomId, Arc<IndexedPoint>>,
}

impl BaseTree {
    fn merged(&self, overlay: &HashMap<AtomId, Option<Arc<IndexedPoint>>>) -> Self {
        let mut buckets = self.buckets.clone();
        let mut points = self.points.clone();
        for (atom_id, write) in overlay {
            if let Some(old) = points.remove(atom_id) {
                if let Some(bucket) = buckets.get_mut(&old.encoded_key) {
                    bucket.retain(|point| point.atom_id != *atom_id);
                    if bucket.is_empty() {
                        buckets.remove(&old.encoded_key);
                    }
                }
            }
            if let Some(point) = write {
                points.insert(point.atom_id, Arc::clone(point));
                buckets
                    .entry(point.encoded_key)
                    .or_default()
                    .push(Arc::clone(point));
            }
        }
        Self { buckets, points }
    }
}

/// Immutable view published to readers.
#[derive(Clone, Default)]
struct Snapshot {
    base: Arc<BaseTree>,
    /// Writes since the last merge; `None` removes the base point.
    overlay: HashMap<AtomId, Option<Arc<IndexedPoint>>>,
    len: usize,
    clamped: usize,
    per_tenant: HashMap<TenantId, usize>,
}

impl Snapshot {
    /// Live point for `atom_id`, if any.
    fn live(&self, atom_id: &AtomId) -> Option<Arc<IndexedPoint>> {
        match self.overlay.get(atom_id) {
            Some(write) => write.clone(),
            None => self.base.points.get(atom_id).cloned(),
        }
    }

    fn forget(&mut self, atom_id: &AtomId) -> bool {
        let Some(point) = self.live(atom_id) else {
            return false;
        };
        self.len -= 1;
        if point.clamped {
            self.clamped -= 1;
        }
        if let Some(count) = self.per_tenant.get_mut(&point.tenant_id) {
            *count -= 1;
            if *count == 0 {
                self.per_tenant.remove(&point.tenant_id);
            }
        }
        true
    }

    fn put(&mut self, point: Arc<IndexedPoint>) {
        self.forget(&point.atom_id);
        self.len += 1;
        if point.clamped {
            self.clamped += 1;
        }
        *self.per_tenant.entry(point.tenant_id.clone()).or_default() += 1;
        self.overlay.insert(point.atom_id, Some(point));
    }

    fn delete(&mut self, atom_id: AtomId) -> bool {
        if !self.forget(&atom_id) {
            return false;
        }
        if self.base.points.contains_key(&atom_id) {
            self.overlay.insert(atom_id, None);
        } else {
            self.overlay.remove(&atom_id);
        }
        true
    }

    fn compact_if_needed(&mut self) {
        let budget = (self.base.points.len() as f64).sqrt() as usize;
        if self.overlay.len() > MIN_OVERLAY.max(budget) {
            self.base = Arc::new(self.base.merged(&self.overlay));
            self.overlay.clear();
        }
    }

    fn clamped_ratio(&self) -> f64 {
        if self.len == 0 {
            0.0
        } else {
            self.clamped as f64 / self.len as f64
        }
    }

    fn shadowed(&self, atom_id: &AtomId) -> bool {
        self.overlay.contains_key(atom_id)
    }

    fn overlay_points(&self) -> impl Iterator<Item = &Arc<IndexedPoint>> {
        self.overlay.values().flatten()
    }

    fn full_scan(&self, center: &[f32], radius: f32, tenant: Option<&TenantId>) -> Vec<AtomId> {
        self.base
            .buckets
            .values()
            .flatten()
            .filter(|point| !self.shadowed(&point.atom_id))
            .chain(self.overlay_points())
            .filter(|point| matches_point(point, center, radius, tenant))
            .map(|point| point.atom_id)
            .collect()
    }

    fn ranged_scan(
        &self,
        ranges: &[(u64, u64)],
        center: &[f32],
        radius: f32,
        tenant: Option<&TenantId>,
    ) -> Vec<AtomId> {
        ranges
            .iter()
            .flat_map(|(start, end)| self.base.buckets.range(*start..=*end))
            .flat_map(|(_, bucket)| bucket.iter())
            .filter(|point| !self.shadowed(&point.atom_id))
            .chain(self.overlay_points())
            .filter(|point| matches_point(point, center, radius, tenant))
            .map(|point| point.atom_id)
            .collect()
    }
}

pub struct BTreeSpatialIndex {
    encoder: Arc<HilbertEncoder>,
    basis_version: u32,
    max_key_ranges: usize,
    full_scan_clamp_ratio: f64,
    published: RwLock<Arc<Snapshot>>,
    writer: Mutex<()>,
}

impl BTreeSpatialIndex {
    pub fn new(
        encoder: Arc<HilbertEncoder>,
        basis_version: u32,
        max_key_ranges: usize,
        full_scan_clamp_ratio: f64,
    ) -> Self {
        Self {
            encoder,
            basis_version,
            max_key_ranges,
            full_scan_clamp_ratio,
            published: RwLock::new(Arc::new(Snapshot::default())),
            writer: Mutex::new(()),
        }
    }

    pub fn encoder(&self) -> &Arc<HilbertEncoder> {
        &self.encoder
    }

    fn snapshot(&self) -> Arc<Snapshot> {
        self.published.read().clone()
    }

    /// Applies `write` to a copy of the current snapshot and publishes it.
    fn update<T>(&self, write: impl FnOnce(&mut Snapshot) -> T) -> T {
        let _writer = self.writer.lock();
        let mut next = Snapshot::clone(&self.snapshot());
        let result = write(&mut next);
        next.compact_if_needed();
        *self.published.write() = Arc::new(next);
        result
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
}

fn matches_point(
    point: &IndexedPoint,
    center: &[f32],
    radius: f32,
    tenant: Option<&TenantId>,
) -> bool {
    tenant.map_or(true, |tenant| &point.tenant_id == tenant)
        && within_radius(&point.coordinate, center, radius)
}

fn indexed(entry: SpatialEntry) -> Arc<IndexedPoint> {
    Arc::new(IndexedPoint {
        atom_id: entry.atom_id,
        tenant_id: entry.tenant_id,
        coordinate: entry.coordinate,
        encoded_key: entry.encoded_key,
        clamped: entry.clamped,
    })
}

impl SpatialIndex for BTreeSpatialIndex {
    fn basis_version(&self) -> u32 {
        self.basis_version
    }

    fn insert(&self, entry: SpatialEntry) -> IndexResult<()> {
        self.check_entry(&entry)?;
        self.update(|snapshot| snapshot.put(indexed(entry)));
        Ok(())
    }

    fn bulk_insert(&self, entries: Vec<SpatialEntry>) -> IndexResult<usize> {
        for entry in &entries {
            self.check_entry(entry)?;
        }
        let count = entries.len();
        self.update(|snapshot| {
            for entry in entries {
                snapshot.put(indexed(entry));
            }
        });
        Ok(count)
    }

    fn remove(&self, atom_id: AtomId) -> IndexResult<bool> {
        Ok(self.update(|snapshot| snapshot.delete(atom_id)))
    }

    fn range_query(
        &self,
        center: &[f32],
        radius: f32,
        tenant: Option<&TenantId>,
    ) -> IndexResult<Vec<AtomId>> {
        check_query(&self.encoder, center, radius)?;
        let snapshot = self.snapshot();

        let clamped_ratio = snapshot.clamped_ratio();
        let mut hits = if clamped_ratio > self.full_scan_clamp_ratio {
            warn!(
                "event=spatial_full_scan module=index status=warn reason=bounds_mismatch clamped_ratio={clamped_ratio:.3} entries={}",
                snapshot.len
            );
            snapshot.full_scan(center, radius, tenant)
        } else {
            let ranges = self.encoder.key_ranges(center, radius, self.max_key_ranges)?;
            if ranges.coverage > FULL_SCAN_COVERAGE {
                snapshot.full_scan(center, radius, tenant)
            } else {
                snapshot.ranged_scan(&ranges.ranges, center, radius, tenant)
            }
        };

        hits.sort();
        Ok(hits)
    }

    fn len(&self) -> IndexResult<usize> {
        Ok(self.snapshot().len)
    }

    fn tenant_len(&self, tenant: &TenantId) -> IndexResult<usize> {
        Ok(self.snapshot().per_tenant.get(tenant).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::BTreeSpatialIndex;
    use crate::curve::HilbertEncoder;
    use crate::index::{IndexError, SpatialEntry, SpatialIndex};
    use crate::model::tenant::TenantId;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Arc;
    use uuid::Uuid;

    fn index(dims: usize) -> BTreeSpatialIndex {
        let encoder = HilbertEncoder::new(dims, 12, -1.0, 1.0).unwrap();
        BTreeSpatialIndex::new(Arc::new(encoder), 1, 256, 0.25)
    }

    fn entry(index: &BTreeSpatialIndex, tenant: &str, coordinate: Vec<f32>) -> SpatialEntry {
        SpatialEntry::encode(
            index.encoder(),
            Uuid::new_v4(),
            TenantId::new(tenant).unwrap(),
            1,
            coordinate,
            1,
        )
        .unwrap()
    }

    #[test]
    fn zero_radius_query_finds_each_inserted_point() {
        let index = index(3);
        let mut rng = StdRng::seed_from_u64(7);
        let entries: Vec<SpatialEntry> = (0..1000)
            .map(|_| {
                let coordinate = (0..3).map(|_| rng.gen_range(-1.0..1.0)).collect();
                entry(&index, "default", coordinate)
            })
            .collect();
        assert_eq!(index.bulk_insert(entries.clone()).unwrap(), 1000);

        for probe in entries.iter().step_by(37) {
            let hits = index.range_query(&probe.coordinate, 0.0, None).unwrap();
            assert!(hits.contains(&probe.atom_id));
        }
    }

    #[test]
    fn range_query_matches_brute_force() {
        let index = index(2);
        let mut rng = StdRng::seed_from_u64(11);
        let entries: Vec<SpatialEntry> = (0..500)
            .map(|_| entry(&index, "default", vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)]))
            .collect();
        index.bulk_insert(entries.clone()).unwrap();

        let center = [0.2, -0.3];
        let radius = 0.25;
        let mut expected: Vec<Uuid> = entries
            .iter()
            .filter(|entry| {
                let dx = entry.coordinate[0] - center[0];
                let dy = entry.coordinate[1] - center[1];
                (dx * dx + dy * dy).sqrt() <= radius
            })
            .map(|entry| entry.atom_id)
            .collect();
        expected.sort();

        assert_eq!(index.range_query(&center, radius, None).unwrap(), expected);
    }

    #[test]
    fn tenant_filter_and_reinsert_replace_entries() {
        let index = index(2);
        let first = entry(&index, "a", vec![0.5, 0.5]);
        let other = entry(&index, "b", vec![0.5, 0.5]);
        index.insert(first.clone()).unwrap();
        index.insert(other).unwrap();

        let tenant = TenantId::new("a").unwrap();
        assert_eq!(
            index.range_query(&[0.5, 0.5], 0.01, Some(&tenant)).unwrap(),
            vec![first.atom_id]
        );

        let mut moved = first.clone();
        moved.coordinate = vec![-0.5, -0.5];
        moved.encoded_key = index.encoder().encode(&moved.coordinate).unwrap().key;
        index.insert(moved).unwrap();

        assert_eq!(index.len().unwrap(), 2);
        assert_eq!(index.tenant_len(&tenant).unwrap(), 1);
        assert!(index.range_query(&[0.5, 0.5], 0.01, Some(&tenant)).unwrap().is_empty());
        assert!(index.remove(first.atom_id).unwrap());
        assert!(!index.remove(first.atom_id).unwrap());
        assert_eq!(index.tenant_len(&tenant).unwrap(), 0);
        assert_eq!(index.tenant_len(&TenantId::new("b").unwrap()).unwrap(), 1);
    }

    #[test]
    fn clamped_data_still_answers_exactly_via_full_scan() {
        let index = index(2);
        let far = entry(&index, "default", vec![4.0, 4.0]);
        let near = entry(&index, "default", vec![3.9, 4.0]);
        assert!(far.clamped && near.clamped);
        index.insert(far.clone()).unwrap();
        index.insert(near.clone()).unwrap();

        let hits = index.range_query(&[4.0, 4.0], 0.05, None).unwrap();
        assert_eq!(hits, vec![far.atom_id]);
    }

    #[test]
    fn rejects_entries_from_another_basis() {
        let index = index(2);
        let mut stale = entry(&index, "default", vec![0.0, 0.0]);
        stale.basis_version = 2;
        assert!(matches!(
            index.insert(stale),
            Err(IndexError::BasisVersionMismatch { expected: 1, actual: 2 })
        ));
    }

    #[test]
    fn held_snapshot_does_not_block_inserts() {
        let index = index(2);
        let first = entry(&index, "default", vec![0.1, 0.1]);
        index.insert(first.clone()).unwrap();

        let held = index.snapshot();
        let second = entry(&index, "default", vec![0.1, 0.11]);
        index.insert(second.clone()).unwrap();

        assert_eq!(held.len, 1);
        assert_eq!(held.full_scan(&[0.1, 0.1], 0.05, None), vec![first.atom_id]);
        let mut expected = vec![first.atom_id, second.atom_id];
        expected.sort();
        assert_eq!(index.range_query(&[0.1, 0.1], 0.05, None).unwrap(), expected);
    }

    #[test]
    fn single_writes_across_merges_match_brute_force() {
        let index = index(2);
        let mut rng = StdRng::seed_from_u64(23);
        let mut live: Vec<SpatialEntry> = Vec::new();
        for step in 0..1500 {
            let fresh = entry(&index, "default", vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)]);
            index.insert(fresh.clone()).unwrap();
            live.push(fresh);
            if step % 7 == 0 {
                let gone = live.swap_remove(rng.gen_range(0..live.len()));
                assert!(index.remove(gone.atom_id).unwrap());
            }
        }
        assert_eq!(index.len().unwrap(), live.len());

        let center = [-0.1, 0.4];
        let radius = 0.3;
        let mut expected: Vec<Uuid> = live
            .iter()
            .filter(|entry| {
                let dx = entry.coordinate[0] - center[0];
                let dy = entry.coordinate[1] - center[1];
                (dx * dx + dy * dy).sqrt() <= radius
            })
            .map(|entry| entry.atom_id)
            .collect();
        expected.sort();
        assert_eq!(index.range_query(&center, radius, None).unwrap(), expected);
    }

    #[test]
    fn queries_run_while_another_thread_inserts() {
        let index = Arc::new(index(2));
        let mut rng = StdRng::seed_from_u64(31);
        let entries: Vec<SpatialEntry> = (0..2000)
            .map(|_| entry(&index, "default", vec![rng.gen_range(-1.0..1.0), rng.gen_range(-1.0..1.0)]))
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
            std::thread::spawn(move || {
                let mut last = 0;
                let mut rounds = 0;
                while last < 2000 {
                    let seen = index.range_query(&[0.0, 0.0], 2.0, None).unwrap().len();
                    assert!(seen >= last);
                    last = seen;
                    rounds += 1;
                }
                rounds
            })
        };

        writer.join().unwrap();
        assert!(reader.join().unwrap() >= 1);
        assert_eq!(index.len().unwrap(), 2000);
    }
}
