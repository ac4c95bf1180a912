//! Opaque resource identifiers
//!
//! A [`Rid`] is the stable handle the host holds for a space, a collision
//! object or a shape. It never exposes a pointer: the owning [`RidOwner`]
//! resolves it, and a generation counter makes stale handles resolve to
//! nothing instead of to whatever reused the slot.

use core::fmt;
use core::hash::{Hash, Hasher};
use core::marker::PhantomData;
use alloc::vec::Vec;

/// An opaque handle to a resource of type `T`
#[repr(transparent)]
pub struct Rid<T> {
    /// Lower 24 bits: index, Upper 8 bits: generation
    bits: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Rid<T> {
    /// Maximum index value (24 bits)
    pub const MAX_INDEX: u32 = (1 << 24) - 1;

    #[inline]
    pub const fn new(index: u32, generation: u8) -> Self {
        debug_assert!(index <= Self::MAX_INDEX);
        Self {
            bits: (generation as u32) << 24 | index,
            _marker: PhantomData,
        }
    }

    /// The invalid handle
    #[inline]
    pub const fn invalid() -> Self {
        Self {
            bits: u32::MAX,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub const fn is_valid(&self) -> bool {
        self.bits != u32::MAX
    }

    #[inline]
    pub const fn index(&self) -> u32 {
        self.bits & Self::MAX_INDEX
    }

    #[inline]
    pub const fn generation(&self) -> u8 {
        (self.bits >> 24) as u8
    }

    /// Raw bits, suitable for stashing in engine user data
    #[inline]
    pub const fn to_bits(&self) -> u32 {
        self.bits
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self {
            bits,
            _marker: PhantomData,
        }
    }
}

impl<T> Clone for Rid<T> {
    #[inline]
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Rid<T> {}

impl<T> PartialEq for Rid<T> {
    #[inline]
    fn eq(&self, other: &Self) -> bool {
        self.bits == other.bits
    }
}

impl<T> Eq for Rid<T> {}

impl<T> PartialOrd for Rid<T> {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Rid<T> {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.bits.cmp(&other.bits)
    }
}

impl<T> Hash for Rid<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.bits.hash(state);
    }
}

impl<T> fmt::Debug for Rid<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "Rid({}v{})", self.index(), self.generation())
        } else {
            write!(f, "Rid(invalid)")
        }
    }
}

impl<T> Default for Rid<T> {
    fn default() -> Self {
        Self::invalid()
    }
}

/// Hands out indices with generation tracking
struct RidAllocator {
    generations: Vec<u8>,
    free_list: Vec<u32>,
}

impl RidAllocator {
    fn new() -> Self {
        Self {
            generations: Vec::new(),
            free_list: Vec::new(),
        }
    }

    fn allocate<T>(&mut self) -> Rid<T> {
        if let Some(index) = self.free_list.pop() {
            let gen = self.generations[index as usize];
            Rid::new(index, gen)
        } else {
            let index = self.generations.len() as u32;
            if index > Rid::<T>::MAX_INDEX {
                panic!("Rid allocator exhausted");
            }
            self.generations.push(0);
            Rid::new(index, 0)
        }
    }

    fn free<T>(&mut self, rid: Rid<T>) -> bool {
        if !self.is_valid(rid) {
            return false;
        }
        let gen = &mut self.generations[rid.index() as usize];
        *gen = gen.wrapping_add(1);
        // Never hand out a slot whose next generation is the invalid pattern.
        if rid.index() == Rid::<T>::MAX_INDEX && *gen == u8::MAX {
            return true;
        }
        self.free_list.push(rid.index());
        true
    }

    fn is_valid<T>(&self, rid: Rid<T>) -> bool {
        if !rid.is_valid() {
            return false;
        }
        self.generations
            .get(rid.index() as usize)
            .map_or(false, |gen| *gen == rid.generation())
    }
}

/// Live handles found when an owner was torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeakReport {
    /// What the owner stores ("objects", "shapes", ...)
    pub kind: &'static str,
    /// How many handles were never freed
    pub count: usize,
}

/// Owns every resource of one kind and resolves handles to them
pub struct RidOwner<T> {
    kind: &'static str,
    allocator: RidAllocator,
    values: Vec<Option<T>>,
    len: usize,
}

impl<T> RidOwner<T> {
    /// Create an owner; `kind` names the resource in leak reports
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            allocator: RidAllocator::new(),
            values: Vec::new(),
            len: 0,
        }
    }

    /// Store a value and return its handle
    pub fn insert(&mut self, value: T) -> Rid<T> {
        let rid = self.allocator.allocate::<T>();
        let index = rid.index() as usize;
        if index >= self.values.len() {
            self.values.resize_with(index + 1, || None);
        }
        self.values[index] = Some(value);
        self.len += 1;
        rid
    }

    /// Store a value built from its own handle
    pub fn insert_with(&mut self, build: impl FnOnce(Rid<T>) -> T) -> Rid<T> {
        let rid = self.allocator.allocate::<T>();
        let index = rid.index() as usize;
        if index >= self.values.len() {
            self.values.resize_with(index + 1, || None);
        }
        self.values[index] = Some(build(rid));
        self.len += 1;
        rid
    }

    /// Release a handle, returning the value it owned
    pub fn remove(&mut self, rid: Rid<T>) -> Option<T> {
        if !self.allocator.is_valid(rid) {
            return None;
        }
        self.allocator.free(rid);
        self.len -= 1;
        self.values[rid.index() as usize].take()
    }

    pub fn get(&self, rid: Rid<T>) -> Option<&T> {
        if !self.allocator.is_valid(rid) {
            return None;
        }
        self.values.get(rid.index() as usize)?.as_ref()
    }

    pub fn get_mut(&mut self, rid: Rid<T>) -> Option<&mut T> {
        if !self.allocator.is_valid(rid) {
            return None;
        }
        self.values.get_mut(rid.index() as usize)?.as_mut()
    }

    pub fn contains(&self, rid: Rid<T>) -> bool {
        self.allocator.is_valid(rid)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Every live handle, in slot order
    pub fn rids(&self) -> Vec<Rid<T>> {
        self.iter().map(|(rid, _)| rid).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Rid<T>, &T)> {
        let gens = &self.allocator.generations;
        self.values.iter().enumerate().filter_map(move |(i, opt)| {
            opt.as_ref().map(|v| (Rid::new(i as u32, gens[i]), v))
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Rid<T>, &mut T)> {
        let gens = &self.allocator.generations;
        self.values.iter_mut().enumerate().filter_map(move |(i, opt)| {
            opt.as_mut().map(|v| (Rid::new(i as u32, gens[i]), v))
        })
    }

    /// Report handles that are still alive, if any
    pub fn leak_report(&self) -> Option<LeakReport> {
        if self.len == 0 {
            None
        } else {
            Some(LeakReport {
                kind: self.kind,
                count: self.len,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Thing(u32);

    #[test]
    fn test_insert_and_resolve() {
        let mut owner: RidOwner<Thing> = RidOwner::new("things");
        let a = owner.insert(Thing(1));
        let b = owner.insert(Thing(2));

        assert_ne!(a, b);
        assert_eq!(owner.get(a).map(|t| t.0), Some(1));
        assert_eq!(owner.get(b).map(|t| t.0), Some(2));
        assert_eq!(owner.len(), 2);
    }

    #[test]
    fn test_stale_rid_resolves_to_nothing() {
        let mut owner: RidOwner<Thing> = RidOwner::new("things");
        let a = owner.insert(Thing(1));
        assert!(owner.remove(a).is_some());
        assert!(owner.get(a).is_none());
        assert!(owner.remove(a).is_none());

        let c = owner.insert(Thing(3));
        assert_eq!(c.index(), a.index());
        assert_ne!(c.generation(), a.generation());
        assert!(owner.get(a).is_none());
        assert_eq!(owner.get(c).map(|t| t.0), Some(3));
    }

    #[test]
    fn test_invalid_rid() {
        let owner: RidOwner<Thing> = RidOwner::new("things");
        let rid = Rid::<Thing>::invalid();
        assert!(!rid.is_valid());
        assert!(owner.get(rid).is_none());
        assert_eq!(Rid::<Thing>::default(), rid);
    }

    #[test]
    fn test_insert_with_sees_own_rid() {
        let mut owner: RidOwner<u32> = RidOwner::new("ids");
        let rid = owner.insert_with(|rid| rid.to_bits());
        assert_eq!(owner.get(rid).copied(), Some(rid.to_bits()));
    }

    #[test]
    fn test_leak_report() {
        let mut owner: RidOwner<Thing> = RidOwner::new("things");
        assert_eq!(owner.leak_report(), None);

        let a = owner.insert(Thing(1));
        owner.insert(Thing(2));
        owner.remove(a);

        assert_eq!(
            owner.leak_report(),
            Some(LeakReport {
                kind: "things",
                count: 1
            })
        );
    }
}
