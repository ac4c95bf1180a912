//! Lock-guarded access to body records
//!
//! A [`BodyAccessor`] locks exactly the buckets holding the bodies it was
//! asked for, always in ascending bucket order, and hands out records while
//! it holds them. [`BodyReader`] takes shared locks, [`BodyWriter`] exclusive
//! ones; the two are otherwise the same type.
//!
//! The locks guard only the mirrored body records. The engine's own body and
//! collider sets are serialized by exclusive `&mut` borrows of the owning
//! `PhysicsSystem` and need no lock of their own.
//!
//! ```ignore
//! let mut writer = BodyWriter::new(&table);
//! writer.acquire(&[a, b]);
//! if let Some(record) = writer.try_get_mut(a) {
//!     record.sleeping = false;
//! }
//! // released on drop
//! ```

use crate::body_table::{BodyBucket, BodyId, BodyRecord, BodyTable};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::ops::Deref;

// ==================== Mutex Mask ====================

/// Set of lock buckets, one bit per bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MutexMask(u64);

impl MutexMask {
    pub const NONE: Self = Self(0);

    /// Every bucket of a table with `count` buckets
    pub fn all(count: usize) -> Self {
        if count >= 64 {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    /// Buckets covering exactly the given ids
    pub fn for_ids(table: &BodyTable, ids: &[BodyId]) -> Self {
        let mut mask = Self::NONE;
        for &id in ids.iter().filter(|id| id.is_valid()) {
            mask.insert(table.bucket_of(id));
        }
        mask
    }

    pub fn insert(&mut self, bucket: usize) {
        self.0 |= 1u64 << bucket;
    }

    pub fn contains(self, bucket: usize) -> bool {
        bucket < 64 && self.0 & (1u64 << bucket) != 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    /// Bucket indices in ascending order, the canonical lock order
    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let bucket = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(bucket)
        })
    }
}

// ==================== Lock Policies ====================

/// Which lock primitive an accessor takes on each bucket
pub trait LockPolicy {
    type Guard<'a>: Deref<Target = BodyBucket>;

    fn lock(bucket: &RwLock<BodyBucket>) -> Self::Guard<'_>;
}

/// Shared (read) locking
#[derive(Debug)]
pub enum Shared {}

/// Exclusive (write) locking
#[derive(Debug)]
pub enum Exclusive {}

impl LockPolicy for Shared {
    type Guard<'a> = RwLockReadGuard<'a, BodyBucket>;

    fn lock(bucket: &RwLock<BodyBucket>) -> Self::Guard<'_> {
        bucket.read()
    }
}

impl LockPolicy for Exclusive {
    type Guard<'a> = RwLockWriteGuard<'a, BodyBucket>;

    fn lock(bucket: &RwLock<BodyBucket>) -> Self::Guard<'_> {
        bucket.write()
    }
}

// ==================== Accessor ====================

/// Scoped access to a set of body records
pub struct BodyAccessor<'t, L: LockPolicy> {
    table: &'t BodyTable,
    ids: Vec<BodyId>,
    mask: MutexMask,
    guards: Vec<Option<L::Guard<'t>>>,
    held: bool,
}

/// Shared access to body records
pub type BodyReader<'t> = BodyAccessor<'t, Shared>;

/// Exclusive access to body records
pub type BodyWriter<'t> = BodyAccessor<'t, Exclusive>;

impl<'t, L: LockPolicy> BodyAccessor<'t, L> {
    /// Create an accessor that holds nothing yet
    pub fn new(table: &'t BodyTable) -> Self {
        let mut guards = Vec::with_capacity(table.bucket_count());
        guards.resize_with(table.bucket_count(), || None);
        Self {
            table,
            ids: Vec::new(),
            mask: MutexMask::NONE,
            guards,
            held: false,
        }
    }

    /// Create and immediately acquire
    pub fn lock(table: &'t BodyTable, ids: &[BodyId]) -> Self {
        let mut accessor = Self::new(table);
        accessor.acquire(ids);
        accessor
    }

    /// Create and immediately acquire every bucket
    pub fn lock_all(table: &'t BodyTable) -> Self {
        let mut accessor = Self::new(table);
        accessor.acquire_all();
        accessor
    }

    /// Lock the buckets holding `ids`.
    ///
    /// Panics if this accessor already holds locks.
    pub fn acquire(&mut self, ids: &[BodyId]) {
        assert!(!self.held, "body accessor acquired twice without release");
        self.ids.clear();
        self.ids.extend_from_slice(ids);
        self.lock_mask(MutexMask::for_ids(self.table, ids));
    }

    /// Lock every bucket and cover every live body
    pub fn acquire_all(&mut self) {
        assert!(!self.held, "body accessor acquired twice without release");
        self.lock_mask(MutexMask::all(self.table.bucket_count()));
        self.ids.clear();
        for guard in self.guards.iter().flatten() {
            self.ids.extend(guard.iter().map(|record| record.id));
        }
    }

    fn lock_mask(&mut self, mask: MutexMask) {
        for bucket in mask.iter() {
            self.guards[bucket] = Some(L::lock(self.table.bucket(bucket)));
        }
        self.mask = mask;
        self.held = true;
    }

    /// Unlock exactly what the matching acquire locked.
    ///
    /// Panics if nothing is held.
    pub fn release(&mut self) {
        assert!(self.held, "body accessor released without a matching acquire");
        for bucket in self.mask.iter() {
            self.guards[bucket] = None;
        }
        self.mask = MutexMask::NONE;
        self.ids.clear();
        self.held = false;
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn mask(&self) -> MutexMask {
        self.mask
    }

    /// Number of ids this accessor was acquired for
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id_at(&self, index: usize) -> BodyId {
        self.ids[index]
    }

    pub fn ids(&self) -> &[BodyId] {
        &self.ids
    }

    /// Record for `id`, or `None` if it was removed or lies outside the
    /// locked buckets
    pub fn try_get(&self, id: BodyId) -> Option<&BodyRecord> {
        if !id.is_valid() {
            return None;
        }
        self.guards[self.table.bucket_of(id)].as_ref()?.get(id)
    }

    /// Record for the `index`-th acquired id
    pub fn try_get_at(&self, index: usize) -> Option<&BodyRecord> {
        self.try_get(*self.ids.get(index)?)
    }

    /// Records for every acquired id that still exists
    pub fn iter(&self) -> impl Iterator<Item = &BodyRecord> + use<'_, 't, L> {
        self.ids.iter().filter_map(move |&id| self.try_get(id))
    }
}

impl<'t> BodyAccessor<'t, Exclusive> {
    pub fn try_get_mut(&mut self, id: BodyId) -> Option<&mut BodyRecord> {
        if !id.is_valid() {
            return None;
        }
        let bucket = self.table.bucket_of(id);
        self.guards[bucket].as_mut()?.get_mut(id)
    }

    pub fn try_get_at_mut(&mut self, index: usize) -> Option<&mut BodyRecord> {
        let id = *self.ids.get(index)?;
        self.try_get_mut(id)
    }
}

impl<'t, L: LockPolicy> Drop for BodyAccessor<'t, L> {
    fn drop(&mut self) {
        if self.held {
            self.release();
        }
    }
}

/// Run `f` with `ids` read-locked
pub fn read_bodies<R>(table: &BodyTable, ids: &[BodyId], f: impl FnOnce(&BodyReader<'_>) -> R) -> R {
    let reader = BodyReader::lock(table, ids);
    f(&reader)
}

/// Run `f` with `ids` write-locked
pub fn write_bodies<R>(
    table: &BodyTable,
    ids: &[BodyId],
    f: impl FnOnce(&mut BodyWriter<'_>) -> R,
) -> R {
    let mut writer = BodyWriter::lock(table, ids);
    f(&mut writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composition::ComposedShape;
    use crate::object::ObjectRid;
    use std::sync::Arc;

    fn table_with(bodies: usize, buckets: u32) -> (BodyTable, Vec<BodyId>) {
        let table = BodyTable::new(1024, buckets);
        let ids = (0..bodies)
            .map(|_| {
                table
                    .insert_with(|id| {
                        Ok(BodyRecord::new(
                            id,
                            ObjectRid::invalid(),
                            Arc::new(ComposedShape::empty()),
                        ))
                    })
                    .unwrap()
            })
            .collect();
        (table, ids)
    }

    #[test]
    fn test_mask_covers_only_requested_buckets() {
        let (table, ids) = table_with(16, 8);
        let mask = MutexMask::for_ids(&table, &[ids[1], ids[9], ids[3]]);

        assert_eq!(mask.count(), 2);
        assert!(mask.contains(1));
        assert!(mask.contains(3));
        assert!(!mask.contains(0));
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_mask_all() {
        assert_eq!(MutexMask::all(8).count(), 8);
        assert_eq!(MutexMask::all(64).bits(), u64::MAX);
        assert_eq!(MutexMask::all(64).iter().last(), Some(63));
    }

    #[test]
    fn test_reader_lookup() {
        let (table, ids) = table_with(4, 4);
        let reader = BodyReader::lock(&table, &ids[..2]);

        assert_eq!(reader.len(), 2);
        assert_eq!(reader.id_at(1), ids[1]);
        assert_eq!(reader.try_get(ids[0]).map(|r| r.id), Some(ids[0]));
        assert!(reader.try_get(ids[3]).is_none());
        assert!(reader.try_get(BodyId::INVALID).is_none());
        assert_eq!(reader.iter().count(), 2);
    }

    #[test]
    fn test_removed_body_is_none_not_error() {
        let (table, ids) = table_with(4, 4);
        table.remove(ids[2]);

        let reader = BodyReader::lock(&table, &ids);
        assert!(reader.try_get(ids[2]).is_none());
        assert!(reader.try_get_at(2).is_none());
        assert_eq!(reader.iter().count(), 3);
    }

    #[test]
    fn test_readers_share_buckets() {
        let (table, ids) = table_with(4, 2);
        let first = BodyReader::lock(&table, &ids);
        let second = BodyReader::lock(&table, &ids);
        assert!(first.try_get(ids[0]).is_some());
        assert!(second.try_get(ids[0]).is_some());
    }

    #[test]
    fn test_writer_mutates() {
        let (table, ids) = table_with(4, 4);
        write_bodies(&table, &[ids[0]], |writer| {
            writer.try_get_mut(ids[0]).unwrap().user_data = 7;
        });
        let value = read_bodies(&table, &[ids[0]], |reader| reader.try_get(ids[0]).unwrap().user_data);
        assert_eq!(value, 7);
    }

    #[test]
    fn test_writer_leaves_other_buckets_free() {
        let (table, ids) = table_with(2, 2);
        let _writer = BodyWriter::lock(&table, &ids[..1]);

        let seen = std::thread::scope(|scope| {
            let table = &table;
            let other = ids[1];
            scope
                .spawn(move || read_bodies(table, &[other], |reader| reader.try_get(other).map(|r| r.id)))
                .join()
                .unwrap()
        });
        assert_eq!(seen, Some(ids[1]));
    }

    #[test]
    fn test_acquire_all_lists_every_body() {
        let (table, ids) = table_with(10, 4);
        let reader = BodyReader::lock_all(&table);
        assert_eq!(reader.len(), 10);
        for id in ids {
            assert!(reader.try_get(id).is_some());
        }
    }

    #[test]
    fn test_release_then_reacquire() {
        let (table, ids) = table_with(2, 2);
        let mut writer = BodyWriter::new(&table);
        writer.acquire(&ids);
        assert!(writer.is_held());
        writer.release();
        assert!(!writer.is_held());
        assert!(writer.try_get(ids[0]).is_none());

        // Bucket is free again.
        let _other = BodyWriter::lock(&table, &ids);
    }

    #[test]
    #[should_panic(expected = "released without a matching acquire")]
    fn test_double_release_panics() {
        let (table, ids) = table_with(2, 2);
        let mut writer = BodyWriter::lock(&table, &ids);
        writer.release();
        writer.release();
    }

    #[test]
    #[should_panic(expected = "acquired twice")]
    fn test_nested_acquire_panics() {
        let (table, ids) = table_with(2, 2);
        let mut reader = BodyReader::lock(&table, &ids);
        reader.acquire(&ids);
    }

    #[test]
    fn test_writers_never_lose_updates() {
        const THREADS: usize = 8;
        const ITERATIONS: usize = 2000;

        let (table, ids) = table_with(12, 4);

        std::thread::scope(|scope| {
            for thread in 0..THREADS {
                let table = &table;
                let target = ids[0];
                // Overlapping, differently ordered id sets per thread.
                let mut set = vec![ids[0], ids[5], ids[thread % ids.len()]];
                if thread % 2 == 1 {
                    set.reverse();
                }
                scope.spawn(move || {
                    for _ in 0..ITERATIONS {
                        let mut writer = BodyWriter::lock(table, &set);
                        let record = writer.try_get_mut(target).unwrap();
                        let value = record.user_data;
                        std::hint::black_box(&value);
                        record.user_data = value + 1;
                    }
                });
            }
        });

        let reader = BodyReader::lock(&table, &[ids[0]]);
        assert_eq!(
            reader.try_get(ids[0]).unwrap().user_data,
            (THREADS * ITERATIONS) as u64
        );
    }
}
